use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, Set};
use serde::{Deserialize, Serialize};

/// A stocked product. Stock itself lives in the ledger, not here.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub code: String,
    pub name: String,
    /// Minimum stock seeded into a product's first daily snapshot
    pub default_minimum_stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::customer_price::Entity")]
    CustomerPrices,
    #[sea_orm(has_many = "super::inventory_movement::Entity")]
    InventoryMovements,
    #[sea_orm(has_many = "super::daily_inventory_snapshot::Entity")]
    DailySnapshots,
}

impl Related<super::customer_price::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CustomerPrices.def()
    }
}

impl Related<super::inventory_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryMovements.def()
    }
}

impl Related<super::daily_inventory_snapshot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DailySnapshots.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            active_model.created_at = Set(now);
        } else {
            active_model.updated_at = Set(Some(now));
        }
        Ok(active_model)
    }
}
