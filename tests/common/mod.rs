#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, FixedOffset, NaiveDate};
use order_ledger::{
    clock::ManualClock,
    config::AppConfig,
    db,
    entities::{customer, inventory_movement, product},
    events::{process_events, EventSender},
    services::orders::{CreateOrderRequest, OrderLineRequest},
    AppState,
};
use rust_decimal::Decimal;
use tempfile::TempDir;

/// Day the manual clock starts on in every test.
pub fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).expect("valid date")
}

/// Helper harness over a throwaway SQLite file and a manual clock.
pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub offset: FixedOffset,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a new test application with fresh database state, letting
    /// the caller adjust configuration first.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir");
        let db_path = db_dir.path().join("order_ledger_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "test".to_string(),
        );
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("migrations");

        let offset = cfg.business_offset().expect("offset");
        let clock = Arc::new(ManualClock::at_business_noon(start_date(), offset));
        let (sender, rx) = EventSender::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(process_events(rx));

        let state = AppState::build(Arc::new(pool), cfg, clock.clone(), sender)
            .expect("app state");

        Self {
            state,
            clock,
            offset,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.state.calendar.today()
    }

    pub fn days_from_today(&self, days: i64) -> NaiveDate {
        self.today() + Duration::days(days)
    }

    pub async fn seed_customer(&self, code: &str) -> customer::Model {
        self.state
            .catalog
            .register_customer(code, &format!("{} Trading", code), Some("Jl. Industri 1"))
            .await
            .expect("seed customer")
    }

    /// Registers a product priced for `customer` with `opening` units
    /// produced a month before the start date.
    pub async fn seed_product(
        &self,
        code: &str,
        customer: &customer::Model,
        unit_price: Decimal,
        opening: i32,
    ) -> product::Model {
        let product = self
            .state
            .catalog
            .register_product(code, &format!("{} widget", code), 10)
            .await
            .expect("seed product");
        self.state
            .catalog
            .set_customer_price(customer.id, product.id, unit_price)
            .await
            .expect("seed price");
        if opening > 0 {
            self.state
                .ledger
                .record_movement(
                    inventory_movement::MovementKind::ProductionIn,
                    product.id,
                    opening,
                    self.days_from_today(-30),
                    "seed",
                    Some("opening stock"),
                )
                .await
                .expect("opening stock");
        }
        product
    }

    pub async fn movements(&self, order_id: i32) -> Vec<inventory_movement::Model> {
        self.state
            .ledger
            .movements_for_order(order_id)
            .await
            .expect("movements")
    }

    pub async fn stock_on(&self, product_id: i32, date: NaiveDate) -> i32 {
        self.state
            .ledger
            .stock_on(product_id, date)
            .await
            .expect("stock")
    }

    pub async fn current_stock(&self, product_id: i32) -> i32 {
        self.state
            .ledger
            .current_stock(product_id)
            .await
            .expect("stock")
    }
}

pub fn line(product_id: i32, quantity: i32) -> OrderLineRequest {
    OrderLineRequest {
        product_id,
        quantity,
    }
}

pub fn create_request(
    customer_id: i32,
    items: Vec<OrderLineRequest>,
    invoice_date: Option<NaiveDate>,
) -> CreateOrderRequest {
    CreateOrderRequest {
        customer_id,
        items,
        order_date: None,
        invoice_date,
        tax_rate: None,
        paid_amount: None,
        notes: None,
        actor: "clerk".to_string(),
    }
}
