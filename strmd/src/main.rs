use clap::{Args, Parser, Subcommand};
use strmd::daemon::{DaemonConfig, DaemonRuntime, SyncMode};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strmd", version, about = "Mirror a remote drive as .strm placeholders")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Command {
    /// Scheduled syncs, the life-event monitor and the redirect endpoint.
    Run,
    /// One full pass over every mapping.
    FullSync(PassArgs),
    /// One snapshot-diff pass over every mapping.
    IncrementalSync(PassArgs),
    /// Only the redirect endpoint.
    Serve,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
struct PassArgs {
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon.run().await,
        Command::FullSync(args) => single_pass(&daemon, SyncMode::Full, args).await,
        Command::IncrementalSync(args) => single_pass(&daemon, SyncMode::Incremental, args).await,
        Command::Serve => {
            let stop = stop_on_ctrl_c();
            daemon.serve(stop).await
        }
    }
}

async fn single_pass(
    daemon: &DaemonRuntime,
    mode: SyncMode,
    args: PassArgs,
) -> anyhow::Result<()> {
    let stop = stop_on_ctrl_c();
    let summary = daemon.sync_all(mode, &stop).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}

fn stop_on_ctrl_c() -> CancellationToken {
    let stop = CancellationToken::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, finishing in-flight work");
            trigger.cancel();
        }
    });
    stop
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let cli = Cli::try_parse_from(["strmd"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_sync_passes() {
        let cli = Cli::try_parse_from(["strmd", "full-sync", "--json"]).unwrap();
        assert_eq!(cli.command, Some(Command::FullSync(PassArgs { json: true })));

        let cli = Cli::try_parse_from(["strmd", "incremental-sync"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::IncrementalSync(PassArgs { json: false }))
        );
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(Cli::try_parse_from(["strmd", "--logout"]).is_err());
    }
}
