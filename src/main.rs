use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::Level;
use warden_core::model::{Acl, CreateMode};
use warden_core::OpError;
use warden_session::{
    Client, ClientConfig, ConnectionManager, ManagerConfig, MemoryEnsemble, StaticAddresses,
};
use warden_settings::WardenSettings;
use warden_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "warden", about = "Connection lifecycle tooling for coordination sessions")]
struct Cli {
    /// Settings file (defaults to ~/.warden/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log lifecycle internals at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved settings as JSON
    Config,
    /// Run the manager against an in-memory ensemble with injected churn
    Simulate {
        #[arg(long, default_value_t = 6)]
        cycles: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => warden_settings::load_settings_from_path(path),
        None => warden_settings::load_settings(),
    }
    .context("failed to load settings")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Simulate { cycles } => {
            let _telemetry = init_telemetry(telemetry_config(&settings, cli.verbose)?)?;
            simulate(&settings, cycles).await
        }
    }
}

fn telemetry_config(settings: &WardenSettings, verbose: bool) -> Result<TelemetryConfig> {
    let log_level: Level = settings
        .logging
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", settings.logging.level))?;
    let mut module_levels = Vec::new();
    if verbose {
        module_levels.push(("warden_session".to_string(), Level::DEBUG));
    }
    Ok(TelemetryConfig {
        log_level,
        module_levels,
        json: settings.logging.json,
    })
}

async fn simulate(settings: &WardenSettings, cycles: u32) -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let manager = Arc::new(
        ConnectionManager::builder(
            Arc::new(ensemble.clone()),
            Arc::new(StaticAddresses(settings.connection.addresses.clone())),
        )
        .config(ManagerConfig::from_settings(settings))
        .name("warden-simulate")
        .build(),
    );
    let client = Client::new(manager.clone(), ClientConfig::from_settings(settings));

    let started = Instant::now();
    let mut statuses = manager.status_stream();
    let printer = tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            println!("{:>6}ms  status  {status}", started.elapsed().as_millis());
        }
    });

    match client
        .create("/simulate", b"", &Acl::open_unsafe(), CreateMode::Persistent)
        .await
    {
        Ok(_) | Err(OpError::NodeAlreadyExists { .. }) => {}
        Err(e) => return Err(e).context("failed to create /simulate"),
    }

    for cycle in 1..=cycles {
        if cycle % 3 == 0 {
            ensemble.expire_all();
        } else {
            ensemble.disconnect_all();
            tokio::time::sleep(Duration::from_millis(50)).await;
            ensemble.reconnect_all();
        }

        let payload = cycle.to_string();
        let stat = client
            .set_data("/simulate", payload.as_bytes(), -1)
            .await
            .with_context(|| format!("write failed in cycle {cycle}"))?;
        println!(
            "{:>6}ms  cycle {cycle}: wrote version {} (sessions created: {})",
            started.elapsed().as_millis(),
            stat.version,
            ensemble.sessions_created()
        );
    }

    manager.shutdown();
    printer.await.context("status printer failed")?;
    Ok(())
}
