//! Order lifecycle: create, update and delete as single units of work.
//!
//! Each operation runs in one transaction spanning the order store, the
//! sequence allocator and the inventory ledger. Either everything it wrote
//! commits or none of it does. Ledger effects are applied immediately when
//! the order's business date has arrived and deferred otherwise; deferred
//! orders are picked up later by the reconciliation sweep through
//! [`OrderService::apply_deferred`].

use chrono::NaiveDate;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{DatabaseTransaction, Set};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::clock::BusinessCalendar;
use crate::config::{AppConfig, ReversalPolicy};
use crate::db::{self, DbPool};
use crate::entities::order::{self, Model as OrderModel};
use crate::entities::order_item::Model as OrderItemModel;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::{NewOrderItem, OrderFilter, OrderRepository};
use crate::services::catalog::{CustomerDirectory, CustomerProfile, PricingCatalog};
use crate::services::inventory_ledger::{InventoryLedger, SaleLine};
use crate::services::sequence::{same_invoice_month, SequenceAllocator};

const MAX_PER_PAGE: u64 = 200;

/// Request/Response types for the order service
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLineRequest {
    #[validate(range(min = 1, message = "product_id must be positive"))]
    pub product_id: i32,
    #[validate(range(min = 1, message = "quantity must be a positive integer"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: i32,
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<OrderLineRequest>,
    /// Defaults to today
    pub order_date: Option<NaiveDate>,
    /// When present, an invoice number is issued and the inventory effect is
    /// attributed to this date
    pub invoice_date: Option<NaiveDate>,
    pub tax_rate: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "actor is required"))]
    pub actor: String,
}

/// Replaces an order's items wholesale. Omitted optional fields keep their
/// stored values.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateOrderRequest {
    pub customer_id: Option<i32>,
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<OrderLineRequest>,
    pub invoice_date: Option<NaiveDate>,
    pub tax_rate: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "actor is required"))]
    pub actor: String,
}

/// Lifecycle state, derived from the stored flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Live, ledger effect not yet applied (future-dated)
    ActivePending,
    /// Live, ledger effect applied
    ActiveApplied,
    Deleted,
}

impl OrderState {
    pub fn of(order: &OrderModel) -> Self {
        match (order.is_deleted, order.inventory_deducted) {
            (true, _) => OrderState::Deleted,
            (false, true) => OrderState::ActiveApplied,
            (false, false) => OrderState::ActivePending,
        }
    }
}

/// Where a business date sits relative to today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectTiming {
    Past,
    Today,
    Future,
}

impl EffectTiming {
    pub fn classify(business_date: NaiveDate, today: NaiveDate) -> Self {
        match business_date.cmp(&today) {
            std::cmp::Ordering::Less => EffectTiming::Past,
            std::cmp::Ordering::Equal => EffectTiming::Today,
            std::cmp::Ordering::Greater => EffectTiming::Future,
        }
    }

    pub fn is_due(self) -> bool {
        self != EffectTiming::Future
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderView {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
    pub state: OrderState,
}

impl OrderView {
    fn new(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        let state = OrderState::of(&order);
        Self {
            order,
            items,
            state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPage {
    pub orders: Vec<OrderModel>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub grand_total: Decimal,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
}

/// Header totals from priced lines. Tax is rounded to two places.
pub fn compute_totals(
    lines: &[NewOrderItem],
    tax_rate: Decimal,
    paid_amount: Decimal,
) -> Result<OrderTotals, ServiceError> {
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE {
        return Err(ServiceError::ValidationError(format!(
            "tax rate must be between 0 and 1, got {}",
            tax_rate
        )));
    }
    let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();
    let tax_amount = (subtotal * tax_rate).round_dp(2);
    let grand_total = subtotal + tax_amount;

    if paid_amount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "paid amount must not be negative".to_string(),
        ));
    }
    if paid_amount > grand_total {
        return Err(ServiceError::ValidationError(format!(
            "paid amount {} exceeds grand total {}",
            paid_amount, grand_total
        )));
    }

    Ok(OrderTotals {
        subtotal,
        tax_rate,
        tax_amount,
        grand_total,
        paid_amount,
        remaining_amount: grand_total - paid_amount,
    })
}

/// Result of one deferred-application attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeferredOutcome {
    Applied {
        order_number: String,
        business_date: NaiveDate,
        items: usize,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NotFound,
    Deleted,
    AlreadyApplied,
    NotYetDue,
}

/// Business rules read from configuration.
#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub default_tax_rate: Decimal,
    pub allow_past_order_deletion: bool,
    pub reversal_policy: ReversalPolicy,
}

impl From<&AppConfig> for OrderPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            default_tax_rate: cfg.default_tax_rate_decimal(),
            allow_past_order_deletion: cfg.allow_past_order_deletion,
            reversal_policy: cfg.reversal_policy,
        }
    }
}

/// Service for the order lifecycle
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    orders: OrderRepository,
    sequences: SequenceAllocator,
    ledger: Arc<dyn InventoryLedger>,
    pricing: Arc<dyn PricingCatalog>,
    customers: Arc<dyn CustomerDirectory>,
    calendar: BusinessCalendar,
    policy: OrderPolicy,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        ledger: Arc<dyn InventoryLedger>,
        pricing: Arc<dyn PricingCatalog>,
        customers: Arc<dyn CustomerDirectory>,
        calendar: BusinessCalendar,
        config: &AppConfig,
    ) -> Self {
        let orders = OrderRepository::new(db_pool.clone());
        let sequences = SequenceAllocator::new(
            orders.clone(),
            config.order_number_prefix.clone(),
            config.invoice_number_prefix.clone(),
        );
        Self {
            db_pool,
            orders,
            sequences,
            ledger,
            pricing,
            customers,
            calendar,
            policy: OrderPolicy::from(config),
            event_sender: None,
        }
    }

    pub fn with_event_sender(mut self, sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    pub fn repository(&self) -> &OrderRepository {
        &self.orders
    }

    /// Creates an order and, when its business date has arrived, deducts its
    /// items from inventory in the same transaction.
    #[instrument(skip(self, request), fields(customer_id = request.customer_id, actor = %request.actor))]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<OrderView, ServiceError> {
        let started = Instant::now();
        request.validate()?;
        validate_lines(&request.items)?;

        // Collaborator lookups happen before the transaction opens.
        let customer = self.active_customer(request.customer_id).await?;
        let lines = self.price_lines(customer.id, &request.items).await?;
        let totals = compute_totals(
            &lines,
            request.tax_rate.unwrap_or(self.policy.default_tax_rate),
            request.paid_amount.unwrap_or(Decimal::ZERO),
        )?;

        let today = self.calendar.today();
        let uow = db::begin(&self.db_pool).await?;
        let result = self
            .create_in_txn(uow.conn(), &request, &customer, &lines, totals, today)
            .await;
        let view = uow.finish(result).await?;

        counter!("order_ledger.orders.created", 1);
        histogram!("order_ledger.orders.create_duration", started.elapsed());
        info!(
            order_id = view.order.id,
            order_number = %view.order.order_number,
            invoice_number = ?view.order.invoice_number,
            business_date = %view.order.business_date(),
            inventory_applied = view.order.inventory_deducted,
            "Order created"
        );
        self.publish(Event::OrderCreated {
            order_id: view.order.id,
            order_number: view.order.order_number.clone(),
            inventory_applied: view.order.inventory_deducted,
        });
        Ok(view)
    }

    async fn create_in_txn(
        &self,
        txn: &DatabaseTransaction,
        request: &CreateOrderRequest,
        customer: &CustomerProfile,
        lines: &[NewOrderItem],
        totals: OrderTotals,
        today: NaiveDate,
    ) -> Result<OrderView, ServiceError> {
        let order_date = request.order_date.unwrap_or(today);
        let business_date = request.invoice_date.unwrap_or(order_date);
        let apply_now = EffectTiming::classify(business_date, today).is_due();

        let order_number = self.sequences.next_order_number(txn, today).await?;
        let invoice_number = match request.invoice_date {
            Some(date) => Some(self.sequences.next_invoice_number(txn, date).await?),
            None => None,
        };

        let header = order::ActiveModel {
            order_number: Set(order_number),
            invoice_number: Set(invoice_number),
            previous_invoice_number: Set(None),
            customer_id: Set(customer.id),
            customer_name: Set(customer.name.clone()),
            billing_address: Set(customer.billing_address.clone()),
            order_date: Set(order_date),
            invoice_date: Set(request.invoice_date),
            subtotal: Set(totals.subtotal),
            tax_rate: Set(totals.tax_rate),
            tax_amount: Set(totals.tax_amount),
            grand_total: Set(totals.grand_total),
            paid_amount: Set(totals.paid_amount),
            remaining_amount: Set(totals.remaining_amount),
            notes: Set(request.notes.clone()),
            inventory_deducted: Set(apply_now),
            is_deleted: Set(false),
            deleted_at: Set(None),
            deleted_by: Set(None),
            created_by: Set(request.actor.clone()),
            updated_by: Set(None),
            updated_at: Set(None),
            ..Default::default()
        };
        let order = self.orders.insert_header(txn, header).await?;
        let items = self.orders.insert_items(txn, order.id, lines).await?;

        if apply_now {
            self.apply_items(txn, &order, &items, &request.actor).await?;
        }
        Ok(OrderView::new(order, items))
    }

    /// Replaces the order's items, compensating any applied inventory effect
    /// first and re-applying against the (possibly new) invoice date.
    #[instrument(skip(self, request), fields(actor = %request.actor))]
    pub async fn update_order(
        &self,
        order_id: i32,
        request: UpdateOrderRequest,
    ) -> Result<OrderView, ServiceError> {
        request.validate()?;
        validate_lines(&request.items)?;

        let current = self
            .orders
            .find_by_id(&*self.db_pool, order_id)
            .await?
            .ok_or_else(|| order_not_found(order_id))?;
        if current.is_deleted {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is deleted and cannot be updated",
                current.order_number
            )));
        }

        let customer = self
            .active_customer(request.customer_id.unwrap_or(current.customer_id))
            .await?;
        let lines = self.price_lines(customer.id, &request.items).await?;

        let today = self.calendar.today();
        let uow = db::begin(&self.db_pool).await?;
        let result = self
            .update_in_txn(uow.conn(), order_id, &request, &customer, &lines, today)
            .await;
        let view = uow.finish(result).await?;

        counter!("order_ledger.orders.updated", 1);
        info!(
            order_id = view.order.id,
            order_number = %view.order.order_number,
            invoice_number = ?view.order.invoice_number,
            previous_invoice_number = ?view.order.previous_invoice_number,
            inventory_applied = view.order.inventory_deducted,
            "Order updated"
        );
        self.publish(Event::OrderUpdated {
            order_id: view.order.id,
            order_number: view.order.order_number.clone(),
            inventory_applied: view.order.inventory_deducted,
        });
        Ok(view)
    }

    async fn update_in_txn(
        &self,
        txn: &DatabaseTransaction,
        order_id: i32,
        request: &UpdateOrderRequest,
        customer: &CustomerProfile,
        lines: &[NewOrderItem],
        today: NaiveDate,
    ) -> Result<OrderView, ServiceError> {
        let order = self
            .orders
            .find_for_update(txn, order_id)
            .await?
            .ok_or_else(|| order_not_found(order_id))?;
        if order.is_deleted {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is deleted and cannot be updated",
                order.order_number
            )));
        }
        // Prices were resolved for the customer seen before the lock.
        if request.customer_id.is_none() && order.customer_id != customer.id {
            return Err(ServiceError::Conflict(format!(
                "Order {} changed customer concurrently; retry the update",
                order.order_number
            )));
        }

        if order.inventory_deducted {
            let old_items = self.orders.find_items(txn, order.id).await?;
            self.compensate_items(
                txn,
                &order,
                &old_items,
                &request.actor,
                "order updated",
                today,
            )
            .await?;
        }

        let items = self.orders.replace_items(txn, order.id, lines).await?;
        let totals = compute_totals(
            lines,
            request.tax_rate.unwrap_or(order.tax_rate),
            request.paid_amount.unwrap_or(order.paid_amount),
        )?;

        let invoice_date = request.invoice_date.or(order.invoice_date);
        let (invoice_number, previous_invoice_number) =
            self.resolve_invoice_number(txn, &order, invoice_date).await?;
        let business_date = invoice_date.unwrap_or(order.order_date);
        let apply_now = EffectTiming::classify(business_date, today).is_due();

        let version = order.version;
        let notes = request.notes.clone().or_else(|| order.notes.clone());
        let mut active: order::ActiveModel = order.into();
        active.customer_id = Set(customer.id);
        active.customer_name = Set(customer.name.clone());
        active.billing_address = Set(customer.billing_address.clone());
        active.invoice_date = Set(invoice_date);
        active.invoice_number = Set(invoice_number);
        active.previous_invoice_number = Set(previous_invoice_number);
        active.subtotal = Set(totals.subtotal);
        active.tax_rate = Set(totals.tax_rate);
        active.tax_amount = Set(totals.tax_amount);
        active.grand_total = Set(totals.grand_total);
        active.paid_amount = Set(totals.paid_amount);
        active.remaining_amount = Set(totals.remaining_amount);
        active.notes = Set(notes);
        active.inventory_deducted = Set(apply_now);
        active.updated_by = Set(Some(request.actor.clone()));
        active.version = Set(version + 1);
        let updated = self.orders.update_header(txn, active).await?;

        if apply_now {
            self.apply_items(txn, &updated, &items, &request.actor).await?;
        }
        Ok(OrderView::new(updated, items))
    }

    /// A month change issues a new invoice number and keeps the old one for
    /// audit. A first invoice date issues the first number.
    async fn resolve_invoice_number(
        &self,
        txn: &DatabaseTransaction,
        order: &OrderModel,
        new_date: Option<NaiveDate>,
    ) -> Result<(Option<String>, Option<String>), ServiceError> {
        let Some(new_date) = new_date else {
            return Ok((
                order.invoice_number.clone(),
                order.previous_invoice_number.clone(),
            ));
        };
        match (&order.invoice_number, order.invoice_date) {
            (Some(number), Some(old_date)) if same_invoice_month(old_date, new_date) => Ok((
                Some(number.clone()),
                order.previous_invoice_number.clone(),
            )),
            (Some(number), _) => {
                let fresh = self.sequences.next_invoice_number(txn, new_date).await?;
                info!(
                    order_id = order.id,
                    old_invoice_number = %number,
                    new_invoice_number = %fresh,
                    "Invoice month changed; reissuing invoice number"
                );
                Ok((Some(fresh), Some(number.clone())))
            }
            (None, _) => {
                let fresh = self.sequences.next_invoice_number(txn, new_date).await?;
                Ok((Some(fresh), order.previous_invoice_number.clone()))
            }
        }
    }

    /// Soft-deletes the order after compensating its inventory effect.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: i32, actor: &str) -> Result<OrderView, ServiceError> {
        if actor.trim().is_empty() {
            return Err(ServiceError::ValidationError("actor is required".to_string()));
        }
        let today = self.calendar.today();
        let uow = db::begin(&self.db_pool).await?;
        let result = self.delete_in_txn(uow.conn(), order_id, actor, today).await;
        let view = uow.finish(result).await?;

        counter!("order_ledger.orders.deleted", 1);
        info!(
            order_id = view.order.id,
            order_number = %view.order.order_number,
            deleted_by = actor,
            "Order deleted"
        );
        self.publish(Event::OrderDeleted {
            order_id: view.order.id,
            order_number: view.order.order_number.clone(),
            deleted_by: actor.to_string(),
        });
        Ok(view)
    }

    async fn delete_in_txn(
        &self,
        txn: &DatabaseTransaction,
        order_id: i32,
        actor: &str,
        today: NaiveDate,
    ) -> Result<OrderView, ServiceError> {
        let order = self
            .orders
            .find_for_update(txn, order_id)
            .await?
            .ok_or_else(|| order_not_found(order_id))?;
        if order.is_deleted {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is already deleted",
                order.order_number
            )));
        }
        if !self.policy.allow_past_order_deletion
            && EffectTiming::classify(order.business_date(), today) == EffectTiming::Past
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is dated {} which is before today; deleting past-dated orders is disabled",
                order.order_number,
                order.business_date()
            )));
        }

        let items = self.orders.find_items(txn, order.id).await?;
        if order.inventory_deducted {
            self.compensate_items(txn, &order, &items, actor, "order deleted", today)
                .await?;
        }
        let deleted = self
            .orders
            .soft_delete(txn, order, actor, self.calendar.now_utc())
            .await?;
        Ok(OrderView::new(deleted, items))
    }

    /// Applies a pending order's inventory effect in its own transaction.
    ///
    /// The order is re-read under lock, so an order that was deleted,
    /// already applied or moved into the future since it was listed is
    /// skipped rather than applied twice.
    #[instrument(skip(self))]
    pub async fn apply_deferred(
        &self,
        order_id: i32,
        run_date: NaiveDate,
        actor: &str,
    ) -> Result<DeferredOutcome, ServiceError> {
        let uow = db::begin(&self.db_pool).await?;
        let result = self
            .apply_deferred_in_txn(uow.conn(), order_id, run_date, actor)
            .await;
        let outcome = uow.finish(result).await?;

        if let DeferredOutcome::Applied {
            order_number,
            business_date,
            ..
        } = &outcome
        {
            self.publish(Event::OrderInventoryApplied {
                order_id,
                order_number: order_number.clone(),
                business_date: *business_date,
            });
        }
        Ok(outcome)
    }

    async fn apply_deferred_in_txn(
        &self,
        txn: &DatabaseTransaction,
        order_id: i32,
        run_date: NaiveDate,
        actor: &str,
    ) -> Result<DeferredOutcome, ServiceError> {
        let Some(order) = self.orders.find_for_update(txn, order_id).await? else {
            return Ok(DeferredOutcome::Skipped(SkipReason::NotFound));
        };
        if order.is_deleted {
            return Ok(DeferredOutcome::Skipped(SkipReason::Deleted));
        }
        if order.inventory_deducted {
            return Ok(DeferredOutcome::Skipped(SkipReason::AlreadyApplied));
        }
        if order.business_date() > run_date {
            return Ok(DeferredOutcome::Skipped(SkipReason::NotYetDue));
        }

        let items = self.orders.find_items(txn, order.id).await?;
        self.apply_items(txn, &order, &items, actor).await?;
        let order = self.orders.set_inventory_deducted(txn, order, true).await?;

        Ok(DeferredOutcome::Applied {
            business_date: order.business_date(),
            order_number: order.order_number,
            items: items.len(),
        })
    }

    /// Header, items and derived state of an order, deleted or not.
    pub async fn get_order(&self, order_id: i32) -> Result<OrderView, ServiceError> {
        let db = &*self.db_pool;
        let order = self
            .orders
            .find_by_id(db, order_id)
            .await?
            .ok_or_else(|| order_not_found(order_id))?;
        let items = self.orders.find_items(db, order.id).await?;
        Ok(OrderView::new(order, items))
    }

    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
        page: u64,
        per_page: u64,
    ) -> Result<OrderPage, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let (orders, total) = self.orders.list(filter, page, per_page).await?;
        Ok(OrderPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    // Lines go to the ledger in product order so concurrent orders touching
    // the same products lock snapshot rows in the same sequence.
    async fn apply_items(
        &self,
        txn: &DatabaseTransaction,
        order: &OrderModel,
        items: &[OrderItemModel],
        actor: &str,
    ) -> Result<(), ServiceError> {
        let note = format!("sale {}", order.order_number);
        for item in by_product(items) {
            let line = SaleLine {
                order_id: order.id,
                product_id: item.product_id,
                quantity: item.quantity,
                business_date: order.business_date(),
            };
            self.ledger
                .apply(txn, &line, actor, Some(&note))
                .await
                .map_err(|e| ServiceError::ledger(order.id, item.product_id, e))?;
        }
        Ok(())
    }

    async fn compensate_items(
        &self,
        txn: &DatabaseTransaction,
        order: &OrderModel,
        items: &[OrderItemModel],
        actor: &str,
        reason: &str,
        today: NaiveDate,
    ) -> Result<(), ServiceError> {
        let original = order.business_date();
        let closed_day = self.policy.reversal_policy == ReversalPolicy::ReturnAsIncomingWhenClosed
            && EffectTiming::classify(original, today) == EffectTiming::Past;
        let note = format!("{}: {}", reason, order.order_number);

        for item in by_product(items) {
            let line = SaleLine {
                order_id: order.id,
                product_id: item.product_id,
                quantity: item.quantity,
                business_date: original,
            };
            let posted = if closed_day {
                self.ledger
                    .return_as_incoming(txn, &line, today, actor, Some(&note))
                    .await
            } else {
                self.ledger.reverse(txn, &line, actor, Some(&note)).await
            };
            posted.map_err(|e| ServiceError::ledger(order.id, item.product_id, e))?;
        }
        Ok(())
    }

    async fn active_customer(&self, customer_id: i32) -> Result<CustomerProfile, ServiceError> {
        let customer = self.customers.customer(customer_id).await?.ok_or_else(|| {
            ServiceError::ValidationError(format!("Customer {} does not exist", customer_id))
        })?;
        if !customer.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Customer {} is inactive",
                customer.code
            )));
        }
        Ok(customer)
    }

    async fn price_lines(
        &self,
        customer_id: i32,
        lines: &[OrderLineRequest],
    ) -> Result<Vec<NewOrderItem>, ServiceError> {
        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            let product = self
                .pricing
                .price(customer_id, line.product_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Product {} has no price for customer {}",
                        line.product_id, customer_id
                    ))
                })?;
            priced.push(NewOrderItem {
                product_id: product.product_id,
                product_code: product.code,
                product_name: product.name,
                quantity: line.quantity,
                unit_price: product.unit_price,
                line_total: product.unit_price * Decimal::from(line.quantity),
            });
        }
        Ok(priced)
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }
}

fn order_not_found(order_id: i32) -> ServiceError {
    ServiceError::NotFound(format!("Order {} not found", order_id))
}

fn by_product(items: &[OrderItemModel]) -> Vec<&OrderItemModel> {
    let mut sorted: Vec<&OrderItemModel> = items.iter().collect();
    sorted.sort_by_key(|item| (item.product_id, item.line_no));
    sorted
}

/// Per-line checks plus the one-line-per-product rule.
fn validate_lines(lines: &[OrderLineRequest]) -> Result<(), ServiceError> {
    let mut seen = HashSet::with_capacity(lines.len());
    for line in lines {
        line.validate()?;
        if !seen.insert(line.product_id) {
            warn!(product_id = line.product_id, "Duplicate product line rejected");
            return Err(ServiceError::ValidationError(format!(
                "Product {} appears more than once; combine the quantities into one line",
                line.product_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn line(product_id: i32, quantity: i32, unit_price: Decimal) -> NewOrderItem {
        NewOrderItem {
            product_id,
            product_code: format!("P{}", product_id),
            product_name: format!("Product {}", product_id),
            quantity,
            unit_price,
            line_total: unit_price * Decimal::from(quantity),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn totals_for_two_lines_at_eleven_percent() {
        let lines = vec![line(1, 3, dec!(1000)), line(2, 2, dec!(500))];
        let totals = compute_totals(&lines, dec!(0.11), dec!(1000)).unwrap();
        assert_eq!(totals.subtotal, dec!(4000));
        assert_eq!(totals.tax_amount, dec!(440));
        assert_eq!(totals.grand_total, dec!(4440));
        assert_eq!(totals.remaining_amount, dec!(3440));
    }

    #[test]
    fn overpayment_is_rejected() {
        let lines = vec![line(1, 1, dec!(100))];
        assert_matches!(
            compute_totals(&lines, dec!(0), dec!(100.01)),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn tax_rate_outside_unit_interval_is_rejected() {
        let lines = vec![line(1, 1, dec!(100))];
        assert_matches!(
            compute_totals(&lines, dec!(1.5), dec!(0)),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            compute_totals(&lines, dec!(-0.1), dec!(0)),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn duplicate_products_are_rejected() {
        let lines = vec![
            OrderLineRequest {
                product_id: 1,
                quantity: 2,
            },
            OrderLineRequest {
                product_id: 1,
                quantity: 3,
            },
        ];
        assert_matches!(validate_lines(&lines), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let lines = vec![OrderLineRequest {
            product_id: 1,
            quantity: 0,
        }];
        assert_matches!(validate_lines(&lines), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn timing_classification() {
        let today = date(2024, 5, 10);
        assert_eq!(EffectTiming::classify(date(2024, 5, 9), today), EffectTiming::Past);
        assert_eq!(EffectTiming::classify(today, today), EffectTiming::Today);
        assert_eq!(EffectTiming::classify(date(2024, 5, 11), today), EffectTiming::Future);
        assert!(EffectTiming::Past.is_due());
        assert!(EffectTiming::Today.is_due());
        assert!(!EffectTiming::Future.is_due());
    }

    proptest! {
        #[test]
        fn totals_are_consistent(
            quantities in proptest::collection::vec(1i32..500, 1..8),
            cents in proptest::collection::vec(0i64..1_000_000, 8),
            rate_bp in 0i64..=10_000,
            paid_share in 0u32..=100,
        ) {
            let lines: Vec<NewOrderItem> = quantities
                .iter()
                .enumerate()
                .map(|(i, q)| line(i as i32 + 1, *q, Decimal::new(cents[i], 2)))
                .collect();
            let rate = Decimal::new(rate_bp, 4);
            let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();
            let grand_estimate = subtotal + (subtotal * rate).round_dp(2);
            let paid = (grand_estimate * Decimal::from(paid_share) / dec!(100)).round_dp(2);
            let paid = paid.min(grand_estimate);

            let totals = compute_totals(&lines, rate, paid).unwrap();
            prop_assert_eq!(totals.subtotal, subtotal);
            prop_assert_eq!(totals.grand_total, totals.subtotal + totals.tax_amount);
            prop_assert_eq!(totals.remaining_amount, totals.grand_total - totals.paid_amount);
            prop_assert!(totals.tax_amount.scale() <= 2);
            prop_assert!(totals.remaining_amount >= Decimal::ZERO);
        }
    }
}
