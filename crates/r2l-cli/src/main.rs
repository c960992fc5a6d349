use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use r2l_adapters::{FixtureSnapshotSource, KAMAI_SOURCE_ID, MITHICAL_SOURCE_ID};
use r2l_sync::{load_session, SyncConfig, SyncError, SyncOutcome, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "r2l-cli")]
#[command(about = "Scrobble rhythm game plays to Last.fm")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle for a source, or for every enabled entry in sources.yaml
    Sync {
        /// Source adapter id (`kamai` or `mithical`)
        source_id: Option<String>,
        /// Game identifier passed to the adapter
        game: Option<String>,
        #[arg(long, conflicts_with_all = ["source_id", "game"])]
        all: bool,
        /// Read the snapshot from a JSON file instead of the live service
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Serve the HTTP surface (and the scheduler when enabled)
    Serve,
    /// Run the cron scheduler in the foreground
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        source_id: None,
        game: None,
        all: true,
        fixture: None,
    }) {
        Commands::Sync {
            source_id,
            game,
            all,
            fixture,
        } => {
            let results = match (source_id, game) {
                (Some(source_id), Some(game)) if !all => {
                    let config = SyncConfig::from_env();
                    let session = load_session(&config).await?;
                    let mut pipeline = SyncPipeline::from_config(&config)?;
                    if let Some(path) = fixture {
                        pipeline = pipeline.with_adapter(Arc::new(FixtureSnapshotSource::new(
                            fixture_source_id(&source_id)?,
                            path,
                        )));
                    }
                    let result = pipeline.run_once(&session, &source_id, &game).await;
                    vec![(format!("{source_id}:{game}"), result)]
                }
                (None, None) => {
                    if fixture.is_some() {
                        bail!("--fixture needs an explicit source and game");
                    }
                    r2l_sync::run_sync_once_from_env()
                        .await?
                        .into_iter()
                        .map(|(source, result)| (format!("{}:{}", source.source_id, source.game), result))
                        .collect()
                }
                _ => bail!("pass both a source id and a game, or --all"),
            };

            return Ok(report(&results));
        }
        Commands::Serve => {
            r2l_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            r2l_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn fixture_source_id(source_id: &str) -> Result<&'static str> {
    match source_id {
        KAMAI_SOURCE_ID => Ok(KAMAI_SOURCE_ID),
        MITHICAL_SOURCE_ID => Ok(MITHICAL_SOURCE_ID),
        other => bail!("unknown source {other}"),
    }
}

fn report(results: &[(String, Result<SyncOutcome, SyncError>)]) -> ExitCode {
    let mut failed = false;
    for (source, result) in results {
        match result {
            Ok(outcome) => println!(
                "{source}: {} (reported={} batches={} cursor={})",
                outcome.message,
                outcome.reported,
                outcome.batches,
                outcome.cursor.map_or_else(|| "none".to_string(), |c| c.to_string()),
            ),
            Err(err) => {
                failed = true;
                eprintln!(
                    "{source}: failed while {} (retryable={}): {err}",
                    err.stage().as_str(),
                    err.retryable()
                );
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
