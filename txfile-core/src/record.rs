//! On-disk transaction record codec.
//!
//! Each record file has the following little-endian format:
//!
//! ```text
//! +----------+----------+----------+
//! | id       | flags    | numops   |
//! | 4 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+---------------+---------------+
//! | op_len   | op_plen  | op_offset| new_payload   | pre_image     |  x numops
//! | 4 bytes  | 4 bytes  | 8 bytes  | op_len bytes  | op_plen bytes |
//! +----------+----------+----------+---------------+---------------+
//! | checksum |
//! | 4 bytes  |
//! +----------+
//! ```
//!
//! The trailing checksum is a CRC-32C over every preceding byte. A record is
//! only trusted by recovery once the checksum verifies, so a file torn by a
//! crash mid-write is detected and skipped rather than applied.

use crate::error::{Error, Result};
use crate::trans::Operation;
use crate::{DISK_HEADER_SIZE, DISK_OP_HEADER_SIZE, TRAILER_SIZE};
use bytes::{Buf, BufMut, BytesMut};

/// A record parsed back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u32,
    pub flags: u32,
    pub ops: Vec<RecordOp>,
}

/// One operation of a parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp {
    /// New payload to write at `offset`.
    pub payload: Vec<u8>,
    /// The bytes the payload replaced. Shorter than `payload` when the
    /// operation extended the file, empty when it was entirely beyond EOF.
    pub pre: Vec<u8>,
    /// Absolute offset in the data file.
    pub offset: u64,
}

/// Exact on-disk size of a record holding `ops`.
pub(crate) fn encoded_len(ops: &[Operation]) -> u64 {
    let mut total = (DISK_HEADER_SIZE + TRAILER_SIZE) as u64;
    for op in ops {
        total += DISK_OP_HEADER_SIZE as u64;
        total += op.buf.len() as u64;
        total += op.pre.as_deref().map_or(0, |p| p.len()) as u64;
    }
    total
}

/// Serializes a transaction into the record format, checksum included.
pub(crate) fn encode(id: u32, flags: u32, ops: &[Operation]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(encoded_len(ops) as usize);

    buf.put_u32_le(id);
    buf.put_u32_le(flags);
    buf.put_u32_le(ops.len() as u32);

    for op in ops {
        let pre: &[u8] = op.pre.as_deref().unwrap_or(&[]);
        buf.put_u32_le(op.buf.len() as u32);
        buf.put_u32_le(pre.len() as u32);
        buf.put_u64_le(op.offset);
        buf.put_slice(&op.buf);
        buf.put_slice(pre);
    }

    let csum = checksum(&buf);
    buf.put_u32_le(csum);
    buf
}

/// Parses a record from a full mapping of its file.
///
/// Length fields are validated against the mapping before every read, and
/// the total length must come out exact; anything else is
/// [`Error::Malformed`]. The checksum is *not* verified here — recovery does
/// that separately so it can tell `broken` from `corrupt`.
pub fn decode(map: &[u8]) -> Result<Record> {
    if map.len() < DISK_HEADER_SIZE + TRAILER_SIZE {
        return Err(Error::Malformed {
            reason: format!("{} bytes is shorter than the fixed header", map.len()),
        });
    }

    let mut p = map;
    let id = p.get_u32_le();
    let flags = p.get_u32_le();
    let numops = p.get_u32_le();

    let mut ops = Vec::new();
    for i in 0..numops {
        if p.remaining() < DISK_OP_HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::Malformed {
                reason: format!("operation {i} header past end of file"),
            });
        }
        let len = p.get_u32_le() as usize;
        let plen = p.get_u32_le() as usize;
        let offset = p.get_u64_le();

        if plen > len {
            return Err(Error::Malformed {
                reason: format!("operation {i} pre-image longer than payload"),
            });
        }
        if (p.remaining() as u64) < len as u64 + plen as u64 + TRAILER_SIZE as u64 {
            return Err(Error::Malformed {
                reason: format!("operation {i} data past end of file"),
            });
        }

        let payload = p[..len].to_vec();
        p.advance(len);
        let pre = p[..plen].to_vec();
        p.advance(plen);

        ops.push(RecordOp {
            payload,
            pre,
            offset,
        });
    }

    if p.remaining() != TRAILER_SIZE {
        return Err(Error::Malformed {
            reason: format!("{} trailing bytes after the last operation", p.remaining()),
        });
    }

    Ok(Record { id, flags, ops })
}

/// Verifies the trailing checksum of a full record mapping.
pub fn verify_checksum(map: &[u8]) -> Result<()> {
    if map.len() < TRAILER_SIZE {
        return Err(Error::Malformed {
            reason: "no room for a checksum".to_string(),
        });
    }
    let body = &map[..map.len() - TRAILER_SIZE];
    let stored = u32::from_le_bytes(map[map.len() - TRAILER_SIZE..].try_into().unwrap());
    let actual = checksum(body);
    if stored != actual {
        return Err(Error::Corrupt {
            expected: stored,
            actual,
        });
    }
    Ok(())
}

/// The record digest: CRC-32C over the given bytes.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}
