use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use requestrewind::{
    config::{Config, Mode},
    logging, replay, server,
    storage::Storage,
};

#[derive(Debug, Parser)]
#[command(name = "requestrewind")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Replay target host, e.g. `http://staging.example.test`. Overrides the
    /// config value; non-empty selects replay mode.
    #[arg(long)]
    target_host: Option<String>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_target_host_override(cli.target_host.as_deref());
    logging::init(&config, cli.log_level.as_deref())?;

    let storage = Storage::from_config(&config)?;
    let recorded = storage.count_requests().await?;
    tracing::info!(recorded, db_path = %storage.db_path().display(), "storage ready");

    match config.mode() {
        Mode::Replay => {
            tracing::info!(target_host = %config.replay.target_host, "running in replay mode");
            let summary = replay::replay(&storage, &config).await?;
            std::process::exit(summary.exit_code());
        }
        Mode::Capture => {
            tracing::debug!("running in capture mode");
            let server = server::serve(&config, storage).await?;
            eprintln!("{}", startup_summary(&config, server.listen_addr));
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    format!(
        "startup config: listen={}, storage_path={}, max_connections={}, mode=capture",
        listen_addr,
        config.storage.path.display(),
        config.storage.max_connections
    )
}
