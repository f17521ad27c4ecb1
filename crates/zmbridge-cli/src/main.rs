use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zmbridge_core::{
    validate_connection, ApiShape, BridgeConfig, EntityCommand, EntityState, Freshness, Hub,
    PtzCommand, Server,
};

mod viewer;

#[derive(Debug, Parser)]
#[command(name = "zmbridged")]
#[command(about = "ZoneMinder bridge: polls servers and exposes monitors as entities")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "zmbridge.toml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate every configured connection without setting anything up.
    Check,
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    View,
    SetRunState {
        #[arg(long)]
        host: String,
        #[arg(long)]
        name: String,
    },
    Command {
        #[arg(long)]
        entity: String,
        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Debug, Subcommand)]
enum Action {
    TurnOn,
    TurnOff,
    Select { option: String },
    Ptz { command: PtzCommand },
}

impl From<Action> for EntityCommand {
    fn from(action: Action) -> Self {
        match action {
            Action::TurnOn => EntityCommand::TurnOn,
            Action::TurnOff => EntityCommand::TurnOff,
            Action::Select { option } => EntityCommand::SelectOption(option),
            Action::Ptz { command } => EntityCommand::Ptz(command),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[derive(Debug, Serialize)]
struct ServerReport {
    host: String,
    shape: ApiShape,
    freshness: Freshness,
    fetched_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    entities: Vec<EntityState>,
}

impl ServerReport {
    fn new(server: &Server) -> Self {
        let state = server.coordinator().state();
        Self {
            host: server.host().to_string(),
            shape: server.shape(),
            freshness: state.freshness(),
            fetched_at: state.snapshot.as_ref().map(|s| s.fetched_at),
            last_error: state.last_error.clone(),
            entities: server.render(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Check => {
            let mut failed = false;
            for server in &config.servers {
                match validate_connection(server).await {
                    Ok(()) => println!("{:<32} ok", server.host),
                    Err(err) => {
                        failed = true;
                        println!("{:<32} {} ({err})", server.host, err.key());
                    }
                }
            }
            if failed {
                bail!("one or more servers failed validation");
            }
        }
        Command::Once { format } => {
            let hub = Hub::setup(&config).await?;
            for server in hub.servers() {
                print_report(&ServerReport::new(server), format)?;
            }
        }
        Command::Run { format } => {
            let hub = Hub::setup(&config).await?;
            stream_loop(&hub, format).await?;
        }
        Command::View => {
            let hub = Hub::setup(&config).await?;
            let loops = hub.spawn_refresh_loops();
            let result = viewer::run_viewer(&hub).await;
            loops.iter().for_each(|task| task.abort());
            result?;
        }
        Command::SetRunState { host, name } => {
            let hub = Hub::setup(&config).await?;
            hub.set_run_state(&host, &name).await?;
            info!(host = %host, state = %name, "run state changed");
        }
        Command::Command { entity, action } => {
            let hub = Hub::setup(&config).await?;
            let command = EntityCommand::from(action);
            hub.command(&entity, &command).await?;
            let owner = hub.servers().find(|s| s.entity(&entity).is_some());
            if let Some(server) = owner {
                server.coordinator().refresh().await;
                let rendered = server.render().into_iter().find(|e| e.unique_id == entity);
                if let Some(rendered) = rendered {
                    println!("{}", serde_json::to_string_pretty(&rendered)?);
                }
            }
        }
    }

    Ok(())
}

async fn stream_loop(hub: &Hub, format: OutputFormat) -> Result<()> {
    for server in hub.servers() {
        print_report(&ServerReport::new(server), format)?;
    }

    let loops = hub.spawn_refresh_loops();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut watchers = Vec::new();
    for server in hub.servers() {
        let mut updates = server.coordinator().subscribe();
        let host = server.host().to_string();
        let tx = tx.clone();
        watchers.push(tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                if tx.send(host.clone()).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            host = rx.recv() => {
                let Some(host) = host else { break };
                if let Some(server) = hub.server(&host) {
                    let report = ServerReport::new(server);
                    print_report(&report, format)?;
                    info!(server = %host, freshness = ?report.freshness, "refresh published");
                }
            }
        }
    }

    loops.iter().chain(watchers.iter()).for_each(|task| task.abort());
    Ok(())
}

fn print_report(report: &ServerReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(report)?);
        }
        OutputFormat::Human => {
            println!("=== {} ===", report.host);
            println!("API:        {:?}", report.shape);
            println!(
                "Refreshed:  {} ({:?})",
                report
                    .fetched_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                report.freshness
            );
            if let Some(err) = &report.last_error {
                println!("Last error: {err}");
            }
            for entity in &report.entities {
                let state = entity
                    .state
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string());
                let unit = entity.unit.map(|u| format!(" {u}")).unwrap_or_default();
                let available = if entity.available { "" } else { "  [unavailable]" };
                println!(
                    "  {:<14} {:<32} {state}{unit}{available}",
                    entity.kind.as_str(),
                    entity.name
                );
            }
        }
    }

    Ok(())
}
