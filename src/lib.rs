//! Order Ledger Library
//!
//! Order and inventory consistency engine: collision-free order and invoice
//! numbering, an append-only stock ledger with daily snapshots, an order
//! lifecycle whose inventory effect is applied atomically, and a daily sweep
//! that applies future-dated orders when their day arrives.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod repositories;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::clock::{BusinessCalendar, Clock};
use crate::errors::ServiceError;
use crate::services::catalog::SeaOrmCatalog;
use crate::services::inventory_ledger::SeaOrmLedger;
use crate::services::orders::OrderService;
use crate::services::reconciliation::ReconciliationService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub calendar: BusinessCalendar,
    pub event_sender: Arc<events::EventSender>,
    pub catalog: Arc<SeaOrmCatalog>,
    pub ledger: Arc<SeaOrmLedger>,
    pub orders: Arc<OrderService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppState {
    /// Wires the stock collaborators and services over one pool and clock.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        clock: Arc<dyn Clock>,
        event_sender: events::EventSender,
    ) -> Result<Self, ServiceError> {
        let offset = config
            .business_offset()
            .map_err(|e| ServiceError::ConfigError(e.to_string()))?;
        let calendar = BusinessCalendar::new(clock, offset);
        let event_sender = Arc::new(event_sender);

        let catalog = Arc::new(SeaOrmCatalog::new(db.clone()));
        let ledger = Arc::new(SeaOrmLedger::new(db.clone(), calendar.clone()));
        let orders = Arc::new(
            OrderService::new(
                db.clone(),
                ledger.clone(),
                catalog.clone(),
                catalog.clone(),
                calendar.clone(),
                &config,
            )
            .with_event_sender(event_sender.clone()),
        );
        let reconciliation = Arc::new(
            ReconciliationService::new(db.clone(), orders.clone(), config.reconciliation_concurrency)
                .with_event_sender(event_sender.clone()),
        );

        Ok(Self {
            db,
            config,
            calendar,
            event_sender,
            catalog,
            ledger,
            orders,
            reconciliation,
        })
    }
}
