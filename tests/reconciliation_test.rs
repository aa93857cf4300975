//! Deferred reconciliation tests: future-dated orders are left alone at
//! creation and picked up by the sweep once their business date arrives.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::NaiveDate;
use common::{create_request, line, TestApp};
use order_ledger::entities::inventory_movement::{self, MovementKind};
use order_ledger::errors::ServiceError;
use order_ledger::services::inventory_ledger::{InventoryLedger, SaleLine, SeaOrmLedger};
use order_ledger::services::orders::{DeferredOutcome, OrderService, OrderState, SkipReason};
use order_ledger::services::reconciliation::{ReconciliationService, SWEEP_ACTOR};
use rust_decimal_macros::dec;
use sea_orm::DatabaseTransaction;

/// Refuses to apply one product, delegating everything else.
struct RefusingLedger {
    inner: Arc<SeaOrmLedger>,
    refused_product: i32,
}

#[async_trait]
impl InventoryLedger for RefusingLedger {
    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        if line.product_id == self.refused_product {
            return Err(ServiceError::InvalidOperation(format!(
                "product {} is frozen",
                line.product_id
            )));
        }
        self.inner.apply(txn, line, actor, note).await
    }

    async fn reverse(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        self.inner.reverse(txn, line, actor, note).await
    }

    async fn return_as_incoming(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        on: NaiveDate,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        self.inner.return_as_incoming(txn, line, on, actor, note).await
    }
}

#[tokio::test]
async fn tomorrow_order_is_deferred_then_applied_by_sweep() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-A").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(100), 40).await;
    let nut = app.seed_product("NUT", &customer, dec!(5), 40).await;
    let tomorrow = app.days_from_today(1);

    let created = app
        .state
        .orders
        .create_order(create_request(
            customer.id,
            vec![line(bolt.id, 6), line(nut.id, 1)],
            Some(tomorrow),
        ))
        .await
        .expect("create");
    assert!(!created.order.inventory_deducted);
    assert!(app.movements(created.order.id).await.is_empty());

    // Today's sweep leaves it alone.
    let early = app.state.reconciliation.run(None).await.expect("sweep today");
    assert_eq!(early.found, 0);

    app.clock.advance_days(1);
    let summary = app.state.reconciliation.run(None).await.expect("sweep");
    assert_eq!(summary.run_date, tomorrow);
    assert_eq!((summary.found, summary.processed, summary.errored), (1, 1, 0));

    let applied = app.state.orders.get_order(created.order.id).await.expect("get");
    assert!(applied.order.inventory_deducted);
    assert_eq!(applied.state, OrderState::ActiveApplied);

    let movements = app.movements(created.order.id).await;
    assert_eq!(movements.len(), 2);
    assert!(movements.iter().all(|m| m.kind == MovementKind::Sale
        && m.business_date == tomorrow
        && m.actor == SWEEP_ACTOR));
    assert_eq!(app.current_stock(bolt.id).await, 34);
}

#[tokio::test]
async fn second_sweep_on_the_same_day_finds_nothing() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-B").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(100), 40).await;

    for days in [1, 2] {
        app.state
            .orders
            .create_order(create_request(
                customer.id,
                vec![line(bolt.id, 2)],
                Some(app.days_from_today(days)),
            ))
            .await
            .expect("create");
    }

    app.clock.advance_days(2);
    let first = app.state.reconciliation.run(None).await.expect("first sweep");
    assert_eq!((first.found, first.processed), (2, 2));

    let second = app.state.reconciliation.run(None).await.expect("second sweep");
    assert_eq!((second.found, second.processed, second.errored), (0, 0, 0));
    assert_eq!(app.current_stock(bolt.id).await, 36);

    // A direct re-application is a no-op as well.
    let page = app
        .state
        .orders
        .list_orders(&Default::default(), 1, 10)
        .await
        .expect("list");
    let outcome = app
        .state
        .orders
        .apply_deferred(page.orders[0].id, app.today(), SWEEP_ACTOR)
        .await
        .expect("apply");
    assert_eq!(outcome, DeferredOutcome::Skipped(SkipReason::AlreadyApplied));
}

#[tokio::test]
async fn order_five_days_out_is_applied_to_its_invoice_date_after_clock_advance() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-C").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(100), 40).await;
    let invoice_date = app.days_from_today(5);

    let created = app
        .state
        .orders
        .create_order(create_request(customer.id, vec![line(bolt.id, 10)], Some(invoice_date)))
        .await
        .expect("create");
    assert_eq!(created.state, OrderState::ActivePending);
    assert_eq!(created.order.invoice_number.as_deref(), Some("INV/III/24/0001"));

    // Missed days are caught up: the sweep runs only after a week.
    app.clock.advance_days(7);
    let summary = app.state.reconciliation.run(None).await.expect("sweep");
    assert_eq!(summary.processed, 1);

    let movements = app.movements(created.order.id).await;
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].business_date, invoice_date);
    assert_eq!(movements[0].quantity, -10);
    assert_eq!(app.stock_on(bolt.id, invoice_date).await, 30);
    assert_eq!(app.current_stock(bolt.id).await, 30);
}

#[tokio::test]
async fn deleted_and_not_yet_due_orders_are_not_swept() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-D").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(100), 40).await;

    let doomed = app
        .state
        .orders
        .create_order(create_request(
            customer.id,
            vec![line(bolt.id, 3)],
            Some(app.days_from_today(1)),
        ))
        .await
        .expect("create");
    app.state
        .orders
        .create_order(create_request(
            customer.id,
            vec![line(bolt.id, 3)],
            Some(app.days_from_today(10)),
        ))
        .await
        .expect("create");
    app.state
        .orders
        .delete_order(doomed.order.id, "clerk")
        .await
        .expect("delete");

    app.clock.advance_days(1);
    let summary = app.state.reconciliation.run(None).await.expect("sweep");
    assert_eq!((summary.found, summary.processed), (0, 0));
    assert_eq!(app.current_stock(bolt.id).await, 40);
}

#[tokio::test]
async fn one_failing_order_does_not_block_the_rest() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-E").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(100), 40).await;
    let frozen = app.seed_product("FROZEN", &customer, dec!(100), 40).await;
    let tomorrow = app.days_from_today(1);

    let good = app
        .state
        .orders
        .create_order(create_request(customer.id, vec![line(bolt.id, 2)], Some(tomorrow)))
        .await
        .expect("create");
    let bad = app
        .state
        .orders
        .create_order(create_request(
            customer.id,
            vec![line(bolt.id, 1), line(frozen.id, 5)],
            Some(tomorrow),
        ))
        .await
        .expect("create");

    let refusing = Arc::new(RefusingLedger {
        inner: app.state.ledger.clone(),
        refused_product: frozen.id,
    });
    let orders = Arc::new(OrderService::new(
        app.state.db.clone(),
        refusing,
        app.state.catalog.clone(),
        app.state.catalog.clone(),
        app.state.calendar.clone(),
        &app.state.config,
    ));
    let sweeper = ReconciliationService::new(app.state.db.clone(), orders, 2);

    app.clock.advance_days(1);
    let summary = sweeper.run(None).await.expect("sweep");
    assert_eq!((summary.found, summary.processed, summary.errored), (2, 1, 1));
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].order_id, bad.order.id);
    assert_eq!(summary.failures[0].code, "ledger_inconsistency");

    // The failed order rolled back as a unit, including its bolt line.
    let still_pending = app.state.orders.get_order(bad.order.id).await.expect("get");
    assert_eq!(still_pending.state, OrderState::ActivePending);
    assert!(app.movements(bad.order.id).await.is_empty());
    assert_eq!(app.movements(good.order.id).await.len(), 1);

    // The stock sweeper picks it up on the next run.
    let retry = app.state.reconciliation.run(None).await.expect("retry");
    assert_eq!((retry.found, retry.processed), (1, 1));
    assert_eq!(app.current_stock(bolt.id).await, 37);
    assert_eq!(app.current_stock(frozen.id).await, 35);
}

#[tokio::test]
async fn sweeping_a_future_date_is_rejected() {
    let app = TestApp::new().await;
    let result = app
        .state
        .reconciliation
        .run(Some(app.days_from_today(1)))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn opening_a_day_materialises_snapshots_once() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("CUST-F").await;
    let bolt = app.seed_product("BOLT", &customer, dec!(1), 12).await;
    app.seed_product("NUT", &customer, dec!(1), 0).await;
    let today = app.today();

    let created = app.state.ledger.open_business_day(today).await.expect("open");
    assert_eq!(created, 2);
    let again = app.state.ledger.open_business_day(today).await.expect("reopen");
    assert_eq!(again, 0);

    let snapshot = app
        .state
        .ledger
        .snapshot(bolt.id, today)
        .await
        .expect("snapshot")
        .expect("exists");
    assert_eq!(snapshot.closing_stock, 12);
    assert_eq!(snapshot.minimum_stock, 10);

    // NUT has nothing on hand against a minimum of 10.
    let low = app.state.ledger.low_stock(today).await.expect("low stock");
    assert_eq!(low.len(), 1);
    assert_ne!(low[0].product_id, bolt.id);

    let raised = app
        .state
        .ledger
        .set_minimum_stock(bolt.id, today, 20)
        .await
        .expect("set minimum");
    assert_eq!(raised.minimum_stock, 20);
    assert_eq!(raised.closing_stock, 12);
    let low = app.state.ledger.low_stock(today).await.expect("low stock");
    assert_eq!(low.len(), 2);
}
