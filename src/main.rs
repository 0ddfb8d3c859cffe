//! Faregate command line
//!
//! Operator and gate-simulation front end over the settlement engine. Every
//! command prints JSON on stdout; logs and the audit trail go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a default config
//! faregate init
//!
//! # Stations and fares
//! faregate station add --code STN-A --name "Shivaji Nagar" --city Pune
//! faregate fare set STN-A STN-B --distance-km 12 --base-fare 30.00
//!
//! # Rider account
//! faregate account create rider-1
//! faregate account activate rider-1
//! faregate account top-up rider-1 100.00 --method upi
//!
//! # Gate events
//! faregate entry rider-1 STN-A
//! faregate exit rider-1 STN-B
//!
//! # Operator override
//! faregate cancel --rider rider-1
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use faregate::db::CreateCheckpointInput;
use faregate::services::{spawn_logging_listener, PaymentMethod};
use faregate::{Config, GateDb, Money, Page, Services};

#[derive(Parser, Debug)]
#[command(name = "faregate")]
#[command(about = "Journey and fare settlement engine for transit gates")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "FAREGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "FAREGATE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Storage timeout in milliseconds
    #[arg(long, env = "FAREGATE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and write a default config if none exists
    Init,

    /// Checkpoint administration
    #[command(subcommand)]
    Station(StationCommand),

    /// Fare table administration
    #[command(subcommand)]
    Fare(FareCommand),

    /// Rider ledger accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Entry gate event
    Entry { rider_id: String, checkpoint: String },

    /// Exit gate event
    Exit { rider_id: String, checkpoint: String },

    /// Rider's ongoing journey, if any
    Current { rider_id: String },

    /// Rider's completed journeys
    History {
        rider_id: String,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Emergency-cancel an ongoing journey
    Cancel {
        #[arg(long, conflicts_with = "rider", required_unless_present = "rider")]
        journey: Option<String>,
        #[arg(long)]
        rider: Option<String>,
    },

    /// Row counts per table
    Stats,
}

#[derive(Subcommand, Debug)]
enum StationCommand {
    Add {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        city: String,
    },
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    Search { query: String },
    Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum FareCommand {
    Set {
        origin: String,
        destination: String,
        #[arg(long)]
        distance_km: u32,
        #[arg(long)]
        base_fare: Money,
    },
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    Quote { origin: String, destination: String },
    Remove { origin: String, destination: String },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Create { rider_id: String },
    Activate { rider_id: String },
    TopUp {
        rider_id: String,
        amount: Money,
        #[arg(long, default_value = "upi")]
        method: PaymentMethod,
        #[arg(long)]
        reference: Option<String>,
    },
    Balance { rider_id: String },
    History {
        rider_id: String,
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct PageArgs {
    #[arg(long, default_value_t = 0)]
    offset: u32,
    /// Defaults to the configured history page size
    #[arg(long)]
    limit: Option<u32>,
}

impl PageArgs {
    fn page(self, config: &Config) -> Page {
        Page::new(self.offset, self.limit.unwrap_or(config.history_page_size))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("faregate=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("creating {}", config.storage_dir.display()))?;

    let db = Arc::new(GateDb::open(&config.db_path(), config.storage_timeout())?);
    let services = Services::new(db, &config);
    let audit = spawn_logging_listener(Arc::clone(&services.events));

    let command = cli.command;
    let output = tokio::task::spawn_blocking(move || {
        let output = run(command, &services, &config);
        // Dropping the services closes the event bus and ends the audit task
        drop(services);
        output
    })
    .await??;

    if tokio::time::timeout(Duration::from_secs(2), audit).await.is_err() {
        warn!("Audit listener did not drain in time");
    }

    println!("{}", output);
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let default_path = Config::default().config_path();
            if default_path.exists() {
                Config::load(&default_path).with_context(|| format!("loading {}", default_path.display()))?
            } else {
                Config::default()
            }
        }
    };

    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.storage_timeout_ms = ms;
    }

    debug!(storage_dir = %config.storage_dir.display(), "Configuration loaded");
    Ok(config)
}

fn json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn run(command: Command, services: &Services, config: &Config) -> anyhow::Result<String> {
    match command {
        Command::Init => {
            let path = config.config_path();
            if !path.exists() {
                config.save(&path)?;
                info!(path = %path.display(), "Created default config");
            }
            json(&services.db.stats()?)
        }

        Command::Station(cmd) => match cmd {
            StationCommand::Add { code, name, city } => {
                json(&services.stations.create(CreateCheckpointInput { code, name, city })?)
            }
            StationCommand::List { page } => json(&services.stations.list(page.page(config))?),
            StationCommand::Search { query } => json(&services.stations.search(&query)?),
            StationCommand::Remove { id } => {
                if !services.stations.soft_delete(&id)? {
                    bail!("no active checkpoint with id {}", id);
                }
                json(&serde_json::json!({ "removed": id }))
            }
        },

        Command::Fare(cmd) => match cmd {
            FareCommand::Set {
                origin,
                destination,
                distance_km,
                base_fare,
            } => json(&services.fare_table.set_rule(&origin, &destination, distance_km, base_fare)?),
            FareCommand::List { page } => json(&services.fare_table.list_rules(page.page(config))?),
            FareCommand::Quote { origin, destination } => json(&services.fares.price(&origin, &destination)?),
            FareCommand::Remove { origin, destination } => {
                if !services.fare_table.deactivate_rule(&origin, &destination)? {
                    bail!("no active fare rule {} -> {}", origin, destination);
                }
                json(&serde_json::json!({ "removed": [origin, destination] }))
            }
        },

        Command::Account(cmd) => match cmd {
            AccountCommand::Create { rider_id } => json(&services.ledger.create_account(&rider_id)?),
            AccountCommand::Activate { rider_id } => json(&services.ledger.activate(&rider_id)?),
            AccountCommand::TopUp {
                rider_id,
                amount,
                method,
                reference,
            } => json(&services.ledger.top_up(&rider_id, amount, method, reference.as_deref())?),
            AccountCommand::Balance { rider_id } => json(&serde_json::json!({
                "rider_id": rider_id,
                "balance": services.ledger.balance(&rider_id)?,
            })),
            AccountCommand::History { rider_id, page } => {
                json(&services.ledger.transactions(&rider_id, page.page(config))?)
            }
        },

        Command::Entry { rider_id, checkpoint } => json(&services.gate.entry(&rider_id, &checkpoint)?),
        Command::Exit { rider_id, checkpoint } => json(&services.gate.exit(&rider_id, &checkpoint)?),
        Command::Current { rider_id } => json(&services.gate.current_journey(&rider_id)?),
        Command::History { rider_id, page } => {
            json(&services.gate.journey_history(&rider_id, page.page(config))?)
        }

        Command::Cancel { journey, rider } => {
            let cancelled = match (journey, rider) {
                (Some(journey_id), _) => services.journeys.cancel(&journey_id)?,
                (None, Some(rider_id)) => services.journeys.cancel_for_rider(&rider_id)?,
                (None, None) => bail!("either --journey or --rider is required"),
            };
            json(&cancelled)
        }

        Command::Stats => json(&services.db.stats()?),
    }
}
