use crate::backup::{backup_everything, RunGuard, RunScope};
use crate::config::AppConfig;
use crate::destination::{create_destination, Destination, ObjectStoreDestination};
use crate::error::Result;
use crate::status::RunType;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled backups of directories and MySQL", long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Take a backup for the given run type
    Backup {
        #[arg(value_enum)]
        run_type: RunType,
    },
    /// List stored backup copies
    Ls,
    /// Print the status document as JSON
    Status,
}

pub async fn run(command: &Command, config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Backup { run_type } => backup(*run_type, config, cancel).await,
        Command::Ls => list(config).await,
        Command::Status => status(config).await,
    }
}

async fn backup(run_type: RunType, config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    if !config.intervals.enabled(run_type) {
        debug!("Not running because run_{} is off", run_type);
        return Ok(());
    }
    let guard = RunGuard::new(&config.lock_file, run_type, config.timeouts.deadline(run_type))
        .with_cancellation(cancel);
    let scope = guard.scope();
    guard.run(backup_everything(run_type, config, &scope)).await
}

async fn print_copies(dst: &dyn Destination) -> Result<()> {
    for run_type in RunType::ALL {
        println!("{} copies:", run_type);
        for name in dst.find_files("", run_type).await? {
            println!("{}", name);
        }
    }
    Ok(())
}

async fn list(config: &AppConfig) -> Result<()> {
    let hostname = config.hostname();
    if let Some(path) = config.destination()?.keep_local_path.as_ref() {
        println!("Local copies in {}:", path.display());
        print_copies(&ObjectStoreDestination::local(path, &hostname)?).await?;
    }

    let dst = create_destination(config, &RunScope::default())?;
    println!("Remote copies on {}:", dst.name());
    print_copies(dst.as_ref()).await?;

    if let Some((run_type, name)) = dst.status().await?.latest_backup() {
        info!("Latest backup is {} ({})", name, run_type);
    }
    Ok(())
}

async fn status(config: &AppConfig) -> Result<()> {
    let dst = create_destination(config, &RunScope::default())?;
    let json = dst.status().await?.to_json()?;
    println!("{}", String::from_utf8_lossy(&json));
    Ok(())
}
