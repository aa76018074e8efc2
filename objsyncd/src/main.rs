use std::path::PathBuf;

use objsyncd::daemon::{DaemonConfig, DaemonRuntime};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "objsyncd=info,objsync_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    mode: CliMode,
    config_path: Option<PathBuf>,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliOptions>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions {
        mode: CliMode::Run,
        config_path: std::env::var_os("OBJSYNC_CONFIG").map(PathBuf::from),
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => options.mode = CliMode::Once,
            "--help" | "-h" => options.mode = CliMode::Help,
            "--config" | "-c" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("{arg} requires a path");
                };
                options.config_path = Some(PathBuf::from(value));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let options = parse_cli(std::env::args())?;
    if options.mode == CliMode::Help {
        println!("Usage: objsyncd [--config <path>] [--once]");
        println!("  --config <path>  Config file (default ./cfg.json, or $OBJSYNC_CONFIG)");
        println!("  --once           Run a single sync cycle and exit");
        return Ok(());
    }

    let config = DaemonConfig::load(options.config_path.as_deref())?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    if options.mode == CliMode::Once {
        daemon.run_once().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(err) => tracing::warn!(error = %err, "failed waiting for shutdown signal"),
        }
        signal_token.cancel();
    });
    daemon.run_until_cancelled(shutdown).await
}
