//! Append-only inventory ledger with per-day stock snapshots.
//!
//! Every stock change is an immutable signed movement attributed to a
//! business date. The snapshot for that date is created on demand (carrying
//! forward the latest earlier day) and the same delta is rolled into every
//! later snapshot of the product, so the newest snapshot always holds the
//! current stock. Snapshot rows are locked in ascending date order for the
//! duration of the caller's transaction.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::BusinessCalendar;
use crate::db::{self, DbPool};
use crate::entities::daily_inventory_snapshot::{self, Entity as SnapshotEntity};
use crate::entities::inventory_movement::{self, Entity as MovementEntity, MovementKind};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;

/// One order line's claim on stock, dated to the business day it hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub order_id: i32,
    pub product_id: i32,
    /// Positive number of units sold
    pub quantity: i32,
    pub business_date: NaiveDate,
}

/// Ledger operations that compose with an order's transaction.
///
/// Each call appends exactly one movement. Nothing here decides whether an
/// order is applied; the order's `inventory_deducted` flag does that.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Posts a SALE of `line.quantity` against `line.business_date`.
    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError>;

    /// Posts a SALE_REVERSAL against the original `line.business_date`.
    async fn reverse(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError>;

    /// Returns the goods as incoming stock dated `on`, leaving the snapshot
    /// of `line.business_date` untouched.
    async fn return_as_incoming(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        on: NaiveDate,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError>;
}

struct MovementDraft<'a> {
    product_id: i32,
    order_id: Option<i32>,
    kind: MovementKind,
    quantity: i32,
    business_date: NaiveDate,
    actor: &'a str,
    note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SeaOrmLedger {
    db: Arc<DbPool>,
    calendar: BusinessCalendar,
}

impl SeaOrmLedger {
    pub fn new(db: Arc<DbPool>, calendar: BusinessCalendar) -> Self {
        Self { db, calendar }
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    /// Records a stock change that is not tied to an order.
    #[instrument(skip(self, note))]
    pub async fn record_movement(
        &self,
        kind: MovementKind,
        product_id: i32,
        quantity: i32,
        business_date: NaiveDate,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        match kind {
            MovementKind::ProductionIn if quantity <= 0 => {
                return Err(ServiceError::ValidationError(
                    "production quantity must be positive".to_string(),
                ))
            }
            MovementKind::Adjustment if quantity == 0 => {
                return Err(ServiceError::ValidationError(
                    "adjustment quantity must not be zero".to_string(),
                ))
            }
            MovementKind::ProductionIn | MovementKind::Adjustment => {}
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "{:?} movements are posted by the order lifecycle only",
                    other
                )))
            }
        }

        let uow = db::begin(&self.db).await?;
        let result = self
            .post(
                uow.conn(),
                MovementDraft {
                    product_id,
                    order_id: None,
                    kind,
                    quantity,
                    business_date,
                    actor,
                    note: note.map(str::to_string),
                },
            )
            .await;
        uow.finish(result).await
    }

    /// Sets the minimum-stock threshold from `date` onwards.
    #[instrument(skip(self))]
    pub async fn set_minimum_stock(
        &self,
        product_id: i32,
        date: NaiveDate,
        minimum: i32,
    ) -> Result<daily_inventory_snapshot::Model, ServiceError> {
        if minimum < 0 {
            return Err(ServiceError::ValidationError(
                "minimum stock must not be negative".to_string(),
            ));
        }
        let uow = db::begin(&self.db).await?;
        let result = async {
            let conn = uow.conn();
            let product = load_product(conn, product_id).await?;
            self.ensure_snapshot(conn, &product, date).await?;

            let mut updated = None;
            for snapshot in lock_snapshots_from(conn, product_id, date).await? {
                let mut active: daily_inventory_snapshot::ActiveModel = snapshot.into();
                active.minimum_stock = Set(minimum);
                let saved = active.update(conn).await.map_err(ServiceError::db_error)?;
                if saved.business_date == date {
                    updated = Some(saved);
                }
            }
            updated.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "snapshot for product {} on {} missing after creation",
                    product_id, date
                ))
            })
        }
        .await;
        uow.finish(result).await
    }

    /// Materialises `date`'s snapshot for every active product.
    ///
    /// Returns how many snapshots were created; already open days are left
    /// as they are.
    #[instrument(skip(self))]
    pub async fn open_business_day(&self, date: NaiveDate) -> Result<usize, ServiceError> {
        let products = ProductEntity::find()
            .filter(product::Column::IsActive.eq(true))
            .order_by_asc(product::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let uow = db::begin(&self.db).await?;
        let result = async {
            let mut created = 0usize;
            for product in &products {
                if self.ensure_snapshot(uow.conn(), product, date).await?.1 {
                    created += 1;
                }
            }
            Ok::<usize, ServiceError>(created)
        }
        .await;
        let created = uow.finish(result).await?;
        info!(business_date = %date, products = products.len(), created, "Business day opened");
        Ok(created)
    }

    /// Stock on hand as of today.
    pub async fn current_stock(&self, product_id: i32) -> Result<i32, ServiceError> {
        self.stock_on(product_id, self.calendar.today()).await
    }

    /// Closing stock of the latest snapshot on or before `date`.
    pub async fn stock_on(&self, product_id: i32, date: NaiveDate) -> Result<i32, ServiceError> {
        let latest = SnapshotEntity::find()
            .filter(daily_inventory_snapshot::Column::ProductId.eq(product_id))
            .filter(daily_inventory_snapshot::Column::BusinessDate.lte(date))
            .order_by_desc(daily_inventory_snapshot::Column::BusinessDate)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(latest.map(|s| s.closing_stock).unwrap_or(0))
    }

    pub async fn snapshot(
        &self,
        product_id: i32,
        date: NaiveDate,
    ) -> Result<Option<daily_inventory_snapshot::Model>, ServiceError> {
        SnapshotEntity::find()
            .filter(daily_inventory_snapshot::Column::ProductId.eq(product_id))
            .filter(daily_inventory_snapshot::Column::BusinessDate.eq(date))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Active snapshots of `date` whose closing stock is below the minimum.
    pub async fn low_stock(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<daily_inventory_snapshot::Model>, ServiceError> {
        let rows = SnapshotEntity::find()
            .filter(daily_inventory_snapshot::Column::BusinessDate.eq(date))
            .filter(daily_inventory_snapshot::Column::IsActive.eq(true))
            .order_by_asc(daily_inventory_snapshot::Column::ProductId)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(rows.into_iter().filter(|s| s.is_low()).collect())
    }

    pub async fn movements_for_order(
        &self,
        order_id: i32,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        MovementEntity::find()
            .filter(inventory_movement::Column::OrderId.eq(order_id))
            .order_by_asc(inventory_movement::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn post<C: ConnectionTrait>(
        &self,
        conn: &C,
        draft: MovementDraft<'_>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        if draft.quantity == 0 {
            return Err(ServiceError::ValidationError(
                "movement quantity must not be zero".to_string(),
            ));
        }
        let product = load_product(conn, draft.product_id).await?;

        let movement = inventory_movement::ActiveModel {
            product_id: Set(draft.product_id),
            order_id: Set(draft.order_id),
            kind: Set(draft.kind),
            quantity: Set(draft.quantity),
            business_date: Set(draft.business_date),
            actor: Set(draft.actor.to_string()),
            note: Set(draft.note),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        self.ensure_snapshot(conn, &product, draft.business_date)
            .await?;

        for snapshot in lock_snapshots_from(conn, product.id, draft.business_date).await? {
            let snapshot_date = snapshot.business_date;
            let closing = snapshot.closing_stock + draft.quantity;
            let mut active: daily_inventory_snapshot::ActiveModel = snapshot.into();
            active.closing_stock = Set(closing);
            active.update(conn).await.map_err(ServiceError::db_error)?;

            if closing < 0 {
                warn!(
                    product_id = product.id,
                    product_code = %product.code,
                    business_date = %snapshot_date,
                    closing_stock = closing,
                    "Closing stock is negative"
                );
            }
        }

        counter!("order_ledger.ledger.movements", 1, "kind" => format!("{:?}", movement.kind));
        debug!(
            movement_id = movement.id,
            product_id = movement.product_id,
            order_id = ?movement.order_id,
            kind = ?movement.kind,
            quantity = movement.quantity,
            business_date = %movement.business_date,
            "Movement posted"
        );
        Ok(movement)
    }

    /// Returns `date`'s snapshot under lock, creating it from the latest
    /// earlier snapshot (or the product defaults) when missing. The flag is
    /// true when this call created it.
    async fn ensure_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        product: &product::Model,
        date: NaiveDate,
    ) -> Result<(daily_inventory_snapshot::Model, bool), ServiceError> {
        if let Some(existing) = lock_snapshot(conn, product.id, date).await? {
            return Ok((existing, false));
        }

        let previous = SnapshotEntity::find()
            .filter(daily_inventory_snapshot::Column::ProductId.eq(product.id))
            .filter(daily_inventory_snapshot::Column::BusinessDate.lt(date))
            .order_by_desc(daily_inventory_snapshot::Column::BusinessDate)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let (closing, reserved, minimum, active) = match &previous {
            Some(prev) => (
                prev.closing_stock,
                prev.reserved_quantity,
                prev.minimum_stock,
                prev.is_active,
            ),
            None => (0, 0, product.default_minimum_stock, product.is_active),
        };

        let inserted = SnapshotEntity::insert(daily_inventory_snapshot::ActiveModel {
            product_id: Set(product.id),
            business_date: Set(date),
            closing_stock: Set(closing),
            reserved_quantity: Set(reserved),
            minimum_stock: Set(minimum),
            is_active: Set(active),
            created_at: Set(Utc::now()),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::columns([
                daily_inventory_snapshot::Column::ProductId,
                daily_inventory_snapshot::Column::BusinessDate,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .map_err(ServiceError::db_error)?;

        let snapshot = lock_snapshot(conn, product.id, date).await?.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "snapshot for product {} on {} missing after insert",
                product.id, date
            ))
        })?;
        Ok((snapshot, inserted > 0))
    }
}

#[async_trait]
impl InventoryLedger for SeaOrmLedger {
    #[instrument(skip(self, txn, note), fields(order_id = line.order_id, product_id = line.product_id))]
    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        ensure_positive(line)?;
        self.post(
            txn,
            MovementDraft {
                product_id: line.product_id,
                order_id: Some(line.order_id),
                kind: MovementKind::Sale,
                quantity: -line.quantity,
                business_date: line.business_date,
                actor,
                note: note.map(str::to_string),
            },
        )
        .await
    }

    #[instrument(skip(self, txn, note), fields(order_id = line.order_id, product_id = line.product_id))]
    async fn reverse(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        ensure_positive(line)?;
        self.post(
            txn,
            MovementDraft {
                product_id: line.product_id,
                order_id: Some(line.order_id),
                kind: MovementKind::SaleReversal,
                quantity: line.quantity,
                business_date: line.business_date,
                actor,
                note: note.map(str::to_string),
            },
        )
        .await
    }

    #[instrument(skip(self, txn, note), fields(order_id = line.order_id, product_id = line.product_id))]
    async fn return_as_incoming(
        &self,
        txn: &DatabaseTransaction,
        line: &SaleLine,
        on: NaiveDate,
        actor: &str,
        note: Option<&str>,
    ) -> Result<inventory_movement::Model, ServiceError> {
        ensure_positive(line)?;
        let note = match note {
            Some(n) => format!("{} (sold on {})", n, line.business_date),
            None => format!("returned from sale on {}", line.business_date),
        };
        self.post(
            txn,
            MovementDraft {
                product_id: line.product_id,
                order_id: Some(line.order_id),
                kind: MovementKind::SaleReturnIn,
                quantity: line.quantity,
                business_date: on,
                actor,
                note: Some(note),
            },
        )
        .await
    }
}

fn ensure_positive(line: &SaleLine) -> Result<(), ServiceError> {
    if line.quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity for product {} must be positive, got {}",
            line.product_id, line.quantity
        )));
    }
    Ok(())
}

async fn load_product<C: ConnectionTrait>(
    conn: &C,
    product_id: i32,
) -> Result<product::Model, ServiceError> {
    ProductEntity::find_by_id(product_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

async fn lock_snapshot<C: ConnectionTrait>(
    conn: &C,
    product_id: i32,
    date: NaiveDate,
) -> Result<Option<daily_inventory_snapshot::Model>, ServiceError> {
    SnapshotEntity::find()
        .filter(daily_inventory_snapshot::Column::ProductId.eq(product_id))
        .filter(daily_inventory_snapshot::Column::BusinessDate.eq(date))
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

async fn lock_snapshots_from<C: ConnectionTrait>(
    conn: &C,
    product_id: i32,
    date: NaiveDate,
) -> Result<Vec<daily_inventory_snapshot::Model>, ServiceError> {
    SnapshotEntity::find()
        .filter(daily_inventory_snapshot::Column::ProductId.eq(product_id))
        .filter(daily_inventory_snapshot::Column::BusinessDate.gte(date))
        .order_by_asc(daily_inventory_snapshot::Column::BusinessDate)
        .lock_exclusive()
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_lines_are_rejected() {
        let line = SaleLine {
            order_id: 1,
            product_id: 2,
            quantity: 0,
            business_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let err = ensure_positive(&line).unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(ensure_positive(&SaleLine { quantity: 3, ..line }).is_ok());
    }

    #[test]
    fn compensation_kinds() {
        assert!(MovementKind::SaleReversal.is_compensation());
        assert!(MovementKind::SaleReturnIn.is_compensation());
        assert!(!MovementKind::Sale.is_compensation());
        assert!(!MovementKind::Adjustment.is_compensation());
    }
}
