//! Lookups the order engine needs from the surrounding business system.
//!
//! Order entry only ever reads customers and prices; it never edits them.
//! The traits are the seam, and [`SeaOrmCatalog`] is the stock
//! implementation over the `customers`, `products` and `customer_prices`
//! tables.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::db::DbPool;
use crate::entities::customer::{self, Entity as CustomerEntity};
use crate::entities::customer_price::{self, Entity as CustomerPriceEntity};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;

/// Billing metadata copied onto an order header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub billing_address: Option<String>,
    pub is_active: bool,
}

/// A product as priced for one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedProduct {
    pub product_id: i32,
    pub code: String,
    pub name: String,
    pub unit_price: Decimal,
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn customer(&self, customer_id: i32) -> Result<Option<CustomerProfile>, ServiceError>;
}

#[async_trait]
pub trait PricingCatalog: Send + Sync {
    /// `None` when the product is unknown, inactive or has no price for
    /// this customer.
    async fn price(
        &self,
        customer_id: i32,
        product_id: i32,
    ) -> Result<Option<PricedProduct>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct SeaOrmCatalog {
    db: Arc<DbPool>,
}

impl SeaOrmCatalog {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, billing_address))]
    pub async fn register_customer(
        &self,
        code: &str,
        name: &str,
        billing_address: Option<&str>,
    ) -> Result<customer::Model, ServiceError> {
        let model = customer::ActiveModel {
            code: Set(code.to_string()),
            name: Set(name.to_string()),
            billing_address: Set(billing_address.map(str::to_string)),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;
        info!(customer_id = model.id, code, "Customer registered");
        Ok(model)
    }

    pub async fn set_customer_active(
        &self,
        customer_id: i32,
        active: bool,
    ) -> Result<customer::Model, ServiceError> {
        let existing = CustomerEntity::find_by_id(customer_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", customer_id)))?;
        let mut active_model: customer::ActiveModel = existing.into();
        active_model.is_active = Set(active);
        active_model
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn register_product(
        &self,
        code: &str,
        name: &str,
        default_minimum_stock: i32,
    ) -> Result<product::Model, ServiceError> {
        let model = product::ActiveModel {
            code: Set(code.to_string()),
            name: Set(name.to_string()),
            default_minimum_stock: Set(default_minimum_stock),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;
        info!(product_id = model.id, code, "Product registered");
        Ok(model)
    }

    /// Inserts or replaces the customer's price for a product.
    #[instrument(skip(self))]
    pub async fn set_customer_price(
        &self,
        customer_id: i32,
        product_id: i32,
        unit_price: Decimal,
    ) -> Result<(), ServiceError> {
        if unit_price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "unit price must not be negative".to_string(),
            ));
        }
        let now = chrono::Utc::now();
        CustomerPriceEntity::insert(customer_price::ActiveModel {
            customer_id: Set(customer_id),
            product_id: Set(product_id),
            unit_price: Set(unit_price),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::columns([
                customer_price::Column::CustomerId,
                customer_price::Column::ProductId,
            ])
            .update_columns([
                customer_price::Column::UnitPrice,
                customer_price::Column::UpdatedAt,
            ])
            .to_owned(),
        )
        .exec_without_returning(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;
        Ok(())
    }
}

#[async_trait]
impl CustomerDirectory for SeaOrmCatalog {
    async fn customer(&self, customer_id: i32) -> Result<Option<CustomerProfile>, ServiceError> {
        let found = CustomerEntity::find_by_id(customer_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(found.map(|c| CustomerProfile {
            id: c.id,
            code: c.code,
            name: c.name,
            billing_address: c.billing_address,
            is_active: c.is_active,
        }))
    }
}

#[async_trait]
impl PricingCatalog for SeaOrmCatalog {
    async fn price(
        &self,
        customer_id: i32,
        product_id: i32,
    ) -> Result<Option<PricedProduct>, ServiceError> {
        let product = match ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
        {
            Some(p) if p.is_active => p,
            _ => return Ok(None),
        };

        let price = CustomerPriceEntity::find()
            .filter(customer_price::Column::CustomerId.eq(customer_id))
            .filter(customer_price::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(price.map(|p| PricedProduct {
            product_id: product.id,
            code: product.code,
            name: product.name,
            unit_price: p.unit_price,
        }))
    }
}
