mod aggregate;
mod config;
mod error;
mod event;
mod extract;
mod mapping;
mod merge;
mod normalize;
mod object_source;
mod parquet_warehouse;
mod runner;
mod source;
mod table;
mod warehouse;

use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use event::StorageEvent;
use log::{error, info};
use std::path::{Path, PathBuf};

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load one object, named the way the storage trigger names it.
    Ingest {
        #[arg(help = "Bucket the object was dropped into", value_parser = validate_bucket)]
        bucket: String,

        #[arg(help = "Object name, dataset/account/table.ext")]
        name: String,
    },
    /// Load the object named by a storage event payload on disk.
    Event {
        #[arg(help = "Path to a JSON file with 'bucket' and 'name' keys")]
        path: PathBuf,
    },
}

fn validate_bucket(s: &str) -> Result<String, String> {
    let valid = (3..=63).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
        && s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric());

    if valid {
        Ok(s.to_string())
    } else {
        Err("Invalid bucket name".to_string())
    }
}

fn read_event(path: &Path) -> Result<StorageEvent, Error> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();
    info!(
        "loading into project {} ({})",
        args.config.project_id, args.config.location
    );

    let event = match args.command {
        Command::Ingest { bucket, name } => Ok(StorageEvent { bucket, name }),
        Command::Event { path } => read_event(&path),
    };

    let result = match event {
        Ok(event) => runner::handle_event(&args.config, &event).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(report) => match &report.skipped {
            Some(reason) => info!("skipped {}: {}", report.object, reason),
            None => {
                for load in &report.loads {
                    info!(
                        "{}: {} rows replaced by {}",
                        load.table, load.deleted, load.appended
                    );
                }
                info!(
                    "loaded {} rows from {}",
                    report.rows_loaded(),
                    report.object
                );
            }
        },
        Err(err) => {
            error!("failed to load object ({:?} error): {}", err.kind(), err);
            std::process::exit(1);
        }
    }

    Ok(())
}
