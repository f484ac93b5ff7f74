use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use courtsync_engine::{ClubProfile, RunTrigger, SyncConfig, SyncEngine};
use courtsync_source::{HttpSourceClient, NominatimGeocoder, SourceConfig};
use courtsync_storage::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "courtsync")]
#[command(about = "League data sync for basketball-bund.net clubs")]
struct Cli {
    /// Path to the club profile file.
    #[arg(long, default_value = "courtsync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a full sync in the foreground.
    Sync,
    /// List the leagues the club currently plays in.
    Discover,
    /// Serve the status and control API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn build_engine(config_path: &PathBuf) -> Result<Arc<SyncEngine>> {
    let profile = ClubProfile::load(config_path)?;
    let config = SyncConfig::from_env(profile);
    let source_config = SourceConfig::default();
    let geocoder = NominatimGeocoder::new(
        "https://nominatim.openstreetmap.org/search",
        "de",
        &source_config.user_agent,
    )?;
    let client = HttpSourceClient::new(source_config)?;
    Ok(Arc::new(SyncEngine::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(client),
        Arc::new(geocoder),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli.config)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let stats = engine.run_once(RunTrigger::Manual).await?;
            println!(
                "sync complete: teams +{}/~{} events +{}/~{}/-{} players +{} venues +{} api_calls={} errors={}",
                stats.teams_created,
                stats.teams_updated,
                stats.events_created,
                stats.events_updated,
                stats.events_deleted,
                stats.players_created,
                stats.venues_created,
                stats.api_calls,
                stats.errors
            );
        }
        Commands::Discover => {
            let leagues = engine.discover().await?;
            if leagues.is_empty() {
                println!("no leagues found");
            }
            for league in leagues {
                println!(
                    "{:>8}  {}  ({}, table: {})",
                    league.league_id.unwrap_or_default(),
                    league.league_name.as_deref().unwrap_or("?"),
                    league.season_name.as_deref().unwrap_or("?"),
                    match league.table_exists {
                        Some(false) => "no",
                        _ => "yes",
                    }
                );
            }
        }
        Commands::Serve { port } => {
            if let Some(scheduler) = engine.maybe_build_scheduler().await? {
                scheduler.start().await?;
            }
            courtsync_web::serve(engine, port).await?;
        }
    }

    Ok(())
}
