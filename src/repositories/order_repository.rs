use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::entities::order_item::{
    self, ActiveModel as OrderItemActiveModel, Entity as OrderItem, Model as OrderItemModel,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// A fully priced line ready to be written as an order item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
    pub product_id: i32,
    pub product_code: String,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Filters for [`OrderRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub customer_id: Option<i32>,
    pub inventory_deducted: Option<bool>,
    pub include_deleted: bool,
    pub order_date_from: Option<NaiveDate>,
    pub order_date_to: Option<NaiveDate>,
}

/// Identifier columns a sequence can be seeded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberColumn {
    OrderNumber,
    InvoiceNumber,
}

impl NumberColumn {
    fn column(self) -> Column {
        match self {
            NumberColumn::OrderNumber => Column::OrderNumber,
            NumberColumn::InvoiceNumber => Column::InvoiceNumber,
        }
    }
}

/// Order Store: headers, items, the inventory flag and soft deletes.
///
/// Write paths take the caller's connection so they join its transaction.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Find an order by ID, deleted or not
    pub async fn find_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: i32,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Loads the order row under a write lock held until the transaction ends.
    pub async fn find_for_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: i32,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::LineNo)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn insert_header<C: ConnectionTrait>(
        &self,
        conn: &C,
        header: OrderActiveModel,
    ) -> Result<OrderModel, ServiceError> {
        header.insert(conn).await.map_err(ServiceError::db_error)
    }

    pub async fn update_header<C: ConnectionTrait>(
        &self,
        conn: &C,
        header: OrderActiveModel,
    ) -> Result<OrderModel, ServiceError> {
        header.update(conn).await.map_err(ServiceError::db_error)
    }

    /// Inserts `items` in order, numbering lines from 1.
    pub async fn insert_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: i32,
        items: &[NewOrderItem],
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        let mut saved = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let model = OrderItemActiveModel {
                order_id: Set(order_id),
                line_no: Set(idx as i32 + 1),
                product_id: Set(item.product_id),
                product_code: Set(item.product_code.clone()),
                product_name: Set(item.product_name.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                line_total: Set(item.line_total),
                ..Default::default()
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
            saved.push(model);
        }
        Ok(saved)
    }

    /// Deletes every item of the order and inserts the new set.
    pub async fn replace_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: i32,
        items: &[NewOrderItem],
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItem::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        self.insert_items(conn, order_id, items).await
    }

    pub async fn set_inventory_deducted<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: OrderModel,
        deducted: bool,
    ) -> Result<OrderModel, ServiceError> {
        let version = order.version;
        let mut active: OrderActiveModel = order.into();
        active.inventory_deducted = Set(deducted);
        active.version = Set(version + 1);
        self.update_header(conn, active).await
    }

    pub async fn soft_delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: OrderModel,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<OrderModel, ServiceError> {
        let version = order.version;
        let mut active: OrderActiveModel = order.into();
        active.is_deleted = Set(true);
        active.inventory_deducted = Set(false);
        active.deleted_at = Set(Some(at));
        active.deleted_by = Set(Some(actor.to_string()));
        active.version = Set(version + 1);
        self.update_header(conn, active).await
    }

    /// Live orders whose inventory effect is pending and whose business date
    /// is on or before `date`.
    pub async fn find_pending_due<C: ConnectionTrait>(
        &self,
        conn: &C,
        date: NaiveDate,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::IsDeleted.eq(false))
            .filter(Column::InventoryDeducted.eq(false))
            .filter(due_on_or_before(date))
            .order_by_asc(Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Every stored identifier in `column` matching a SQL LIKE pattern.
    pub async fn numbers_like<C: ConnectionTrait>(
        &self,
        conn: &C,
        column: NumberColumn,
        pattern: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let col = column.column();
        let rows: Vec<Option<String>> = Order::find()
            .select_only()
            .column(col)
            .filter(col.like(pattern))
            .into_tuple()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Page through orders, newest first. `page` is 1-based.
    pub async fn list(
        &self,
        filter: &OrderFilter,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let mut query = Order::find();
        if !filter.include_deleted {
            query = query.filter(Column::IsDeleted.eq(false));
        }
        if let Some(customer_id) = filter.customer_id {
            query = query.filter(Column::CustomerId.eq(customer_id));
        }
        if let Some(deducted) = filter.inventory_deducted {
            query = query.filter(Column::InventoryDeducted.eq(deducted));
        }
        if let Some(from) = filter.order_date_from {
            query = query.filter(Column::OrderDate.gte(from));
        }
        if let Some(to) = filter.order_date_to {
            query = query.filter(Column::OrderDate.lte(to));
        }

        let paginator = query
            .order_by_desc(Column::OrderDate)
            .order_by_desc(Column::Id)
            .paginate(self.base.get_db(), per_page.max(1));

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_error)?;
        let orders = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((orders, total))
    }
}

// invoice_date wins when present, otherwise order_date.
fn due_on_or_before(date: NaiveDate) -> Condition {
    Condition::any()
        .add(Column::InvoiceDate.lte(date))
        .add(
            Condition::all()
                .add(Column::InvoiceDate.is_null())
                .add(Column::OrderDate.lte(date)),
        )
}
