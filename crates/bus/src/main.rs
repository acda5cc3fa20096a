// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::{error, info};

use switchboard::config::Config;
use switchboard::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "switchboard", version, about = "Multi-agent coordination bus.")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the hub core as a supervised worker child (internal).
    Worker(Config),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.subcommand {
        Some(Commands::Worker(config)) => {
            // stdout is the IPC channel in worker mode; logs go to stderr.
            init_tracing(&config, true);
            let scope = config.resolved_session_scope();
            let mut core = config.core(&scope);
            core.worker = false;
            match switchboard::worker::run(core).await {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    error!("worker failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            let config = cli.config;
            if let Err(e) = config.validate() {
                eprintln!("error: {e}");
                std::process::exit(2);
            }
            init_tracing(&config, false);

            match run(config).await {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    error!("fatal: {e:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let scope = config.resolved_session_scope();
    let supervisor = Supervisor::new();
    let addr = supervisor.start(config.core(&scope), None).await?;
    info!(%addr, scope = %scope, "switchboard ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    supervisor.stop().await;
    Ok(())
}

fn init_tracing(config: &Config, to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let json = config.log_format == "json";

    match (json, to_stderr) {
        (true, true) => {
            tracing_subscriber::fmt().with_env_filter(filter).json().with_writer(std::io::stderr).init()
        }
        (true, false) => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        (false, true) => {
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init()
        }
        (false, false) => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
