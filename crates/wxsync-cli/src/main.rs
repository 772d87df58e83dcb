use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wxsync_core::ForecastDay;
use wxsync_storage::{ForecastRepository, LocationRepository, SettingsStore, SqliteStore};
use wxsync_sync::{DisplayUnits, SyncConfig, SyncOutcome, SyncPipeline, SyncScheduler, TriggerOutcome};

#[derive(Debug, Parser)]
#[command(name = "wxsync")]
#[command(about = "Daily weather forecast sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle now.
    Sync {
        #[arg(long)]
        location: Option<String>,
    },
    /// Sync now, then keep syncing on the configured interval until interrupted.
    Daemon,
    /// Print the stored forecast window.
    Show {
        #[arg(long)]
        location: Option<String>,
    },
    /// Turn the daily forecast notification on or off.
    Notifications {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { location: None }) {
        Commands::Sync { location } => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let location = location.unwrap_or_else(|| config.location_query.clone());
            let outcome = pipeline.run_once(&location).await;
            print_outcome(&outcome);
        }
        Commands::Daemon => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
            let scheduler = SyncScheduler::new(pipeline, config.location_query.clone());

            if let TriggerOutcome::Started(handle) = scheduler.trigger_now() {
                tokio::spawn(async move {
                    if let Ok(outcome) = handle.await {
                        print_outcome(&outcome);
                    }
                });
            }
            let mut sched = scheduler.schedule_periodic(config.schedule).await?;

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Show { location } => {
            let store = open_store(&config)?;
            let key = location.unwrap_or_else(|| config.location_query.clone());
            let Some(found) = store.find_by_key(&key)? else {
                println!("no forecast stored for {key}");
                return Ok(());
            };
            println!(
                "{} ({}) lat={} lon={}",
                found.display_name, found.location_key, found.latitude, found.longitude
            );
            for day in store.days_for(found.id)? {
                println!("{}", format_day(&day, config.units));
            }
        }
        Commands::Notifications { state } => {
            let store = open_store(&config)?;
            let enabled = matches!(state, Toggle::On);
            store.set_notifications_enabled(enabled)?;
            println!(
                "notifications {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    Ok(())
}

fn open_store(config: &SyncConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.state_path)
        .with_context(|| format!("opening state database {}", config.state_path.display()))
}

fn print_outcome(outcome: &SyncOutcome) {
    match &outcome.aborted {
        None => println!(
            "sync complete: run_id={} location={} inserted={} notified={}",
            outcome.run_id, outcome.location_query, outcome.inserted, outcome.notified
        ),
        Some(abort) => eprintln!(
            "sync aborted: run_id={} location={} reason={abort}",
            outcome.run_id, outcome.location_query
        ),
    }
    if let Some(err) = &outcome.prune_error {
        eprintln!("warning: stale rows kept: {err}");
    }
}

fn format_day(day: &ForecastDay, units: DisplayUnits) -> String {
    format!(
        "{}  {:<12} high {:>5} low {:>5}  humidity {:>3}%  pressure {:.1} hPa  wind {:.1} m/s @ {:.0}°",
        day.date.format("%Y-%m-%d"),
        day.short_description,
        units.format_temperature(day.high_temp_c),
        units.format_temperature(day.low_temp_c),
        day.humidity_percent,
        day.pressure_hpa,
        day.wind_speed_meters_per_sec,
        day.wind_direction_degrees,
    )
}
