use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};

use order_ledger::{
    clock::SystemClock,
    config::{self, AppConfig},
    db,
    events::{self, EventSender},
    services::reconciliation::ReconciliationService,
    AppState,
};

#[derive(Parser)]
#[command(
    name = "order-ledger",
    about = "Order and inventory consistency engine",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Create the day's inventory snapshots for every active product
    OpenDay {
        #[arg(long, help = "Business date (YYYY-MM-DD); defaults to today")]
        date: Option<NaiveDate>,
    },
    /// Apply the inventory effect of orders whose business date has arrived
    Sweep {
        #[arg(long, help = "Run date (YYYY-MM-DD); defaults to today")]
        date: Option<NaiveDate>,
    },
    /// Catch up, then run the daily sweep on schedule until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    db::check_connection(&db_pool).await?;
    if cfg.auto_migrate || matches!(cli.command, Commands::Migrate) {
        db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    if matches!(cli.command, Commands::Migrate) {
        println!("Migrations applied");
        return Ok(());
    }

    let db_arc = Arc::new(db_pool);
    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let events_task = tokio::spawn(events::process_events(event_rx));
    let state = AppState::build(
        db_arc.clone(),
        cfg.clone(),
        Arc::new(SystemClock),
        event_sender,
    )
    .context("failed to build services")?;

    match cli.command {
        Commands::Migrate => {}
        Commands::OpenDay { date } => {
            let date = date.unwrap_or_else(|| state.calendar.today());
            let created = state
                .ledger
                .open_business_day(date)
                .await
                .context("failed to open business day")?;
            if cli.json {
                print_json(&serde_json::json!({ "business_date": date, "created": created }))?;
            } else {
                println!("Opened {}: {} snapshot(s) created", date, created);
            }
        }
        Commands::Sweep { date } => {
            let summary = state
                .reconciliation
                .run(date)
                .await
                .context("reconciliation run failed")?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "{}: found {}, processed {}, skipped {}, errored {}",
                    summary.run_date,
                    summary.found,
                    summary.processed,
                    summary.skipped,
                    summary.errored
                );
                for failure in &summary.failures {
                    println!(
                        "  {} (id {}): [{}] {}",
                        failure.order_number, failure.order_id, failure.code, failure.error
                    );
                }
            }
        }
        Commands::Run => run_scheduler(&state, &cfg).await?,
    }

    // Dropping the services closes the event channel so the logger drains.
    drop(state);
    let _ = events_task.await;
    if let Ok(pool) = Arc::try_unwrap(db_arc) {
        db::close_pool(pool).await?;
    }
    Ok(())
}

async fn run_scheduler(state: &AppState, cfg: &AppConfig) -> Result<()> {
    let at = cfg
        .reconciliation_time()
        .context("invalid reconciliation_run_at")?;

    // A process that was down over midnight catches up before waiting.
    let today = state.calendar.today();
    state.ledger.open_business_day(today).await?;
    let summary = state.reconciliation.run(Some(today)).await?;
    info!(
        found = summary.found,
        processed = summary.processed,
        errored = summary.errored,
        "Startup reconciliation finished"
    );

    let handle = ReconciliationService::start_daily_schedule(
        state.reconciliation.clone(),
        state.ledger.clone(),
        at,
    );
    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    handle.abort();
    let _ = handle.await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
