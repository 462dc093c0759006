//! Driver link operator CLI
//!
//! Runs reconciliation, reviews and discovery against the Postgres store.
//!
//! Usage:
//!   cargo run --features cli --bin driver_link -- reconcile --event <EVENT_ID>
//!   cargo run --features cli --bin driver_link -- review --user <USER_ID> \
//!     --event <EVENT_ID> --status confirmed
//!   cargo run --features cli --bin driver_link -- discover --user <USER_ID> \
//!     --match-type exact --match-type transponder --min-score 0.9 --json
//!
//! Connection settings come from `DATABASE_URL` / `DATABASE_POOL_SIZE` and
//! thresholds from `DRIVER_LINK_*` (a `.env` file is honored).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use driver_link::{
    DatabaseConfig, DiscoveryFilter, DriverLinkManager, LinkStatus, LinkingConfig, MatchType,
    PgLinkStore, ReconcileOptions,
};

/// Driver identity link maintenance
#[derive(Parser, Debug)]
#[command(name = "driver_link")]
#[command(about = "Match users to scraped drivers and manage link reviews")]
struct Cli {
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Match every user against the drivers of one event
    Reconcile {
        #[arg(long)]
        event: String,

        /// Force transponder evidence off (default: auto-detect per event)
        #[arg(long)]
        skip_transponder: bool,
    },

    /// Confirm or reject a user's match in an event
    Review {
        #[arg(long)]
        user: String,

        #[arg(long)]
        event: String,

        /// confirmed | rejected
        #[arg(long)]
        status: String,
    },

    /// List events a user's linked driver identities took part in
    Discover {
        #[arg(long)]
        user: String,

        /// transponder | exact | fuzzy (repeatable)
        #[arg(long = "match-type")]
        match_types: Vec<String>,

        #[arg(long)]
        min_score: Option<f64>,

        #[arg(long)]
        confirmed_only: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                let output = serde_json::json!({ "error": format!("{:#}", e) });
                println!("{}", output);
            } else {
                eprintln!("error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = PgLinkStore::connect(&DatabaseConfig::default())
        .await
        .context("Failed to connect to database")?;
    let manager = DriverLinkManager::new(Arc::new(store), LinkingConfig::from_env());

    match cli.command {
        Commands::Reconcile {
            event,
            skip_transponder,
        } => {
            let options = ReconcileOptions {
                skip_transponder: skip_transponder.then_some(true),
            };
            let summary = manager
                .reconciler()
                .reconcile_event_with(&event, &options)
                .await
                .with_context(|| format!("Failed to reconcile event {}", event))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "event {}: {} pairs evaluated",
                    summary.event_id, summary.pairs_evaluated
                );
                println!("  links created:        {}", summary.links_created);
                println!("  links updated:        {}", summary.links_updated);
                println!("  conflicts:            {}", summary.conflicts);
                println!("  event links recorded: {}", summary.event_links_recorded);
                println!("  rejected pairs:       {}", summary.rejected_pairs);
            }
        }

        Commands::Review {
            user,
            event,
            status,
        } => {
            let status: LinkStatus = status.parse()?;
            let link = manager
                .lifecycle()
                .update_status_by_event(&user, &event, status)
                .await
                .with_context(|| format!("Failed to review user {} in event {}", user, event))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&link)?);
            } else {
                println!(
                    "user {} / driver {}: {} ({} {:.3})",
                    link.user_id, link.driver_id, link.status, link.match_type, link.similarity_score
                );
            }
        }

        Commands::Discover {
            user,
            match_types,
            min_score,
            confirmed_only,
        } => {
            let match_types = if match_types.is_empty() {
                None
            } else {
                Some(
                    match_types
                        .iter()
                        .map(|t| t.parse::<MatchType>())
                        .collect::<Result<Vec<_>, _>>()?,
                )
            };
            let filter = DiscoveryFilter {
                match_types,
                min_similarity_score: min_score,
                confirmed_only,
            };
            let found = manager
                .discovery()
                .discover_links_for_user(&user, &filter)
                .await
                .with_context(|| format!("Failed to discover links for user {}", user))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&found)?);
            } else {
                println!("user {}: {} event(s)", found.user_id, found.events.len());
                for detail in &found.participation_details {
                    println!(
                        "  {}  driver {}  {}  {} {:.3}",
                        detail.event_id,
                        detail.driver_id,
                        detail.link_status,
                        detail.match_type,
                        detail.similarity_score
                    );
                }
            }
        }
    }

    Ok(())
}
