//! txfile - journal check and recovery tool.
//!
//! Scans the journal directory of a data file, re-applies every transaction
//! record that survived a crash, and reports what it found. `clean` removes
//! the journal directory afterwards.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use txfile_core::{check, cleanup, CheckResult, Error};

#[derive(Parser)]
#[command(name = "txfile")]
#[command(about = "Check and recover the transaction journal of a data file")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the journal and re-apply recoverable transactions
    Check {
        /// The data file whose journal to check
        file: PathBuf,

        /// Journal directory, if not the default hidden sibling
        #[arg(short, long)]
        journal: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the journal, then remove the journal directory entirely
    Clean {
        /// The data file whose journal to remove
        file: PathBuf,

        /// Journal directory, if not the default hidden sibling
        #[arg(short, long)]
        journal: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check {
            file,
            journal,
            json,
        } => run_check(&file, journal.as_deref(), json),
        Commands::Clean { file, journal } => run_clean(&file, journal.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::NoFile { path }) => {
            eprintln!("{} {}: no such file", "error:".red(), path.display());
            ExitCode::FAILURE
        }
        Err(Error::NoJournal { path }) => {
            eprintln!(
                "{} {}: no journal associated with the file, or journal empty",
                "error:".red(),
                path.display()
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            ExitCode::FAILURE
        }
    }
}

fn run_check(
    file: &std::path::Path,
    journal: Option<&std::path::Path>,
    json: bool,
) -> Result<(), Error> {
    let res = check(file, journal)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&res).expect("serializable result"));
    } else {
        print_result(&res);
    }
    Ok(())
}

fn run_clean(file: &std::path::Path, journal: Option<&std::path::Path>) -> Result<(), Error> {
    let res = check(file, journal)?;
    print_result(&res);

    cleanup(file, journal)?;
    println!("\n{} journal directory removed", "ok:".green());
    Ok(())
}

fn print_result(res: &CheckResult) {
    println!("{}", "Journal check results".bold());
    println!("---------------------");
    println!("Total:        {}", res.total);
    println!("Invalid:      {}", res.invalid);
    println!("In progress:  {}", res.in_progress);
    println!("Broken:       {}", res.broken);
    println!("Corrupt:      {}", res.corrupt);
    println!("Apply error:  {}", res.apply_error);
    println!(
        "Reapplied:    {}",
        if res.reapplied > 0 {
            res.reapplied.to_string().green()
        } else {
            res.reapplied.to_string().normal()
        }
    );
}
