use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use imctransferd::config::Config;
use imctransferd::daemon::{self, DaemonRuntime};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "imctransferd",
    version,
    about = "Mirrors IMC acquisitions from Box.com into a local raw-data tree"
)]
struct Cli {
    /// Path to config file [default: ~/.config/imctransfer/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Run sync passes every refresh interval until idle or interrupted
    Run,
    /// Run a single sync pass and exit
    Once,
    /// Show record counts and the last pass
    Status,
    /// Clear the failure state of a record that hit the attempt cap
    Reset {
        /// Box file id of the record
        remote_id: String,
    },
    /// Rewrite the metadata report from the store
    Report,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "imctransferd=info",
        1 => "imctransferd=debug",
        2 => "imctransferd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current work");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Run => {
            let runtime = DaemonRuntime::bootstrap(config).await?;
            runtime.run(&shutdown_token()).await
        }
        Command::Once => {
            let runtime = DaemonRuntime::bootstrap(config).await?;
            let report = runtime.once(&shutdown_token()).await?;
            println!(
                "fetched {}, skipped {}, failed {}, missing {}, renamed {}{}",
                report.fetched,
                report.skipped,
                report.failed,
                report.missing,
                report.renamed,
                if report.partial { " (partial)" } else { "" }
            );
            Ok(())
        }
        Command::Status => {
            let store = daemon::open_store(&config).await?;
            print!("{}", daemon::status(&store).await?);
            Ok(())
        }
        Command::Reset { remote_id } => {
            let store = daemon::open_store(&config).await?;
            if daemon::reset(&store, &remote_id).await? {
                println!("{remote_id}: reset to pending");
            } else {
                println!("{remote_id}: not failed, nothing to reset");
            }
            Ok(())
        }
        Command::Report => {
            let store = daemon::open_store(&config).await?;
            let written =
                daemon::write_metadata(&store, &config.daemon.metadata_file).await?;
            println!(
                "{} samples written to {}",
                written,
                config.daemon.metadata_file.display()
            );
            Ok(())
        }
    }
}
