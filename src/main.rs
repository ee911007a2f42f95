#[allow(dead_code)]
mod ai;
mod cli;
mod clone;
mod config;
#[allow(dead_code)]
mod db;
mod discovery;
#[allow(dead_code)]
mod error;
#[allow(dead_code)]
mod events;
mod findings;
mod fixer;
#[allow(dead_code)]
mod orchestrator;
#[allow(dead_code)]
mod patch;
mod pr_worker;
mod process;
#[allow(dead_code)]
mod providers;
mod scan_worker;
#[allow(dead_code)]
mod scanner;
mod severity;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::Cli;
use crate::config::Config;
use crate::db::Db;
use crate::error::Result;
use crate::events::EventHooks;
use crate::orchestrator::Orchestrator;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("ctrlscan starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    if !config.once && !config.continuous {
        eprintln!("error: specify --once or --continuous");
        std::process::exit(2);
    }

    if let Err(e) = run(config) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let db = Db::connect(&config.db_path).await?;
        let once = config.once;
        let orchestrator = Orchestrator::new(config, db, EventHooks::default())?;

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                signal_cancel.cancel();
            }
        });

        if once {
            let summary = orchestrator.run_once(&cancel).await?;
            info!(
                discovered = summary.repos_discovered,
                scanned = summary.repos_scanned,
                "single sweep finished"
            );
        } else {
            orchestrator.run(cancel).await?;
        }
        Ok(())
    })
}
