use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tlm_backup::error::BackupError;
use tlm_backup::{cli, config, log};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();
    log::init(&args.log_level);

    let loaded = match args.config.as_deref() {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let count = ctrl_c_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nShutdown signal received. Press Ctrl+C again to force exit...");
            token.cancel();
        } else {
            eprintln!("\nForce exiting...");
            std::process::exit(130);
        }
    }) {
        warn!("Error setting Ctrl-C handler: {}", e);
    }

    match cli::run(&args.command, &config, cancel).await {
        Ok(()) => {
            info!("tlm-backup exited normally");
            ExitCode::SUCCESS
        }
        // already reported by the run guard at the right severity
        Err(BackupError::LockBusy) => ExitCode::from(BackupError::LockBusy.exit_code()),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
