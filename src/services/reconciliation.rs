//! Deferred reconciliation: applies the inventory effect of future-dated
//! orders once their business date arrives.
//!
//! A run lists live, unapplied orders due on or before the run date and
//! hands each one to [`OrderService::apply_deferred`], which works in its own
//! transaction and re-checks eligibility under lock. Running the same date
//! twice is therefore harmless, and one failing order never blocks the rest.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::clock::BusinessCalendar;
use crate::db::DbPool;
use crate::entities::order::Model as OrderModel;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory_ledger::SeaOrmLedger;
use crate::services::orders::{DeferredOutcome, OrderService};

/// Actor recorded on movements posted by the sweep.
pub const SWEEP_ACTOR: &str = "system:reconciliation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    pub order_id: i32,
    pub order_number: String,
    pub code: String,
    pub error: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub run_date: NaiveDate,
    /// Candidates listed at the start of the run
    pub found: usize,
    /// Orders whose inventory effect this run applied
    pub processed: usize,
    /// Candidates that were deleted, applied or rescheduled by someone else
    /// between listing and locking
    pub skipped: usize,
    pub errored: usize,
    pub failures: Vec<ReconciliationFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    orders: Arc<OrderService>,
    calendar: BusinessCalendar,
    concurrency: usize,
    event_sender: Option<Arc<EventSender>>,
}

impl ReconciliationService {
    pub fn new(db_pool: Arc<DbPool>, orders: Arc<OrderService>, concurrency: usize) -> Self {
        let calendar = orders.calendar().clone();
        Self {
            db_pool,
            orders,
            calendar,
            concurrency: concurrency.max(1),
            event_sender: None,
        }
    }

    pub fn with_event_sender(mut self, sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Sweeps every pending order due on or before `run_date` (default today).
    ///
    /// A run date after today is rejected: it would deduct stock for orders
    /// whose day has not started.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        run_date: Option<NaiveDate>,
    ) -> Result<ReconciliationSummary, ServiceError> {
        let timer = Instant::now();
        let started_at = self.calendar.now_utc();
        let today = self.calendar.today();
        let run_date = run_date.unwrap_or(today);
        if run_date > today {
            return Err(ServiceError::ValidationError(format!(
                "run date {} is after today ({})",
                run_date, today
            )));
        }

        let pending = self
            .orders
            .repository()
            .find_pending_due(&*self.db_pool, run_date)
            .await?;
        let found = pending.len();
        info!(run_date = %run_date, found, "Reconciliation run started");

        let results: Vec<(OrderModel, Result<DeferredOutcome, ServiceError>)> =
            stream::iter(pending)
                .map(|order| async move {
                    let outcome = self
                        .orders
                        .apply_deferred(order.id, run_date, SWEEP_ACTOR)
                        .await;
                    (order, outcome)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut summary = ReconciliationSummary {
            run_date,
            found,
            processed: 0,
            skipped: 0,
            errored: 0,
            failures: Vec::new(),
            started_at,
            finished_at: started_at,
        };
        for (order, outcome) in results {
            match outcome {
                Ok(DeferredOutcome::Applied { items, .. }) => {
                    summary.processed += 1;
                    info!(
                        order_id = order.id,
                        order_number = %order.order_number,
                        items,
                        "Deferred order applied"
                    );
                }
                Ok(DeferredOutcome::Skipped(reason)) => {
                    summary.skipped += 1;
                    warn!(
                        order_id = order.id,
                        order_number = %order.order_number,
                        reason = ?reason,
                        "Deferred order skipped"
                    );
                }
                Err(e) => {
                    summary.errored += 1;
                    let failure = ServiceError::ReconciliationFailed {
                        order_id: order.id,
                        order_number: order.order_number.clone(),
                        message: e.to_string(),
                    };
                    error!(
                        order_id = order.id,
                        order_number = %order.order_number,
                        code = e.code(),
                        error = %failure,
                        "Deferred order failed"
                    );
                    summary.failures.push(ReconciliationFailure {
                        order_id: order.id,
                        order_number: order.order_number,
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        summary.failures.sort_by_key(|f| f.order_id);
        summary.finished_at = self.calendar.now_utc();

        counter!("order_ledger.reconciliation.runs", 1);
        counter!("order_ledger.reconciliation.processed", summary.processed as u64);
        counter!("order_ledger.reconciliation.errored", summary.errored as u64);
        gauge!("order_ledger.reconciliation.last_found", found as f64);
        histogram!("order_ledger.reconciliation.duration", timer.elapsed());
        info!(
            run_date = %run_date,
            found = summary.found,
            processed = summary.processed,
            skipped = summary.skipped,
            errored = summary.errored,
            "Reconciliation run completed"
        );

        if let Some(sender) = &self.event_sender {
            sender.publish(Event::ReconciliationCompleted {
                run_date,
                found: summary.found,
                processed: summary.processed,
                errored: summary.errored,
            });
        }
        Ok(summary)
    }

    /// Spawns the daily loop: wait for `at` in business time, open the new
    /// day's snapshots, then sweep.
    pub fn start_daily_schedule(
        service: Arc<Self>,
        ledger: Arc<SeaOrmLedger>,
        at: NaiveTime,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = service.calendar.until_next(at);
                info!(
                    next_run_in_secs = wait.as_secs(),
                    at = %at,
                    "Reconciliation scheduled"
                );
                tokio::time::sleep(wait).await;

                let today = service.calendar.today();
                if let Err(e) = ledger.open_business_day(today).await {
                    error!(business_date = %today, error = %e, "Failed to open business day");
                }
                if let Err(e) = service.run(Some(today)).await {
                    error!(run_date = %today, error = %e, "Reconciliation run failed");
                }
            }
        })
    }
}
