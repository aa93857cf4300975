use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, Set};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    #[sea_orm(string_value = "SALE")]
    Sale,
    #[sea_orm(string_value = "SALE_REVERSAL")]
    SaleReversal,
    #[sea_orm(string_value = "SALE_RETURN_IN")]
    SaleReturnIn,
    #[sea_orm(string_value = "PRODUCTION_IN")]
    ProductionIn,
    #[sea_orm(string_value = "ADJUSTMENT")]
    Adjustment,
}

impl MovementKind {
    /// Kinds that settle an earlier SALE of the same order.
    pub fn is_compensation(self) -> bool {
        matches!(self, Self::SaleReversal | Self::SaleReturnIn)
    }
}

/// Immutable ledger entry. Never updated or deleted; corrections append an
/// offsetting movement.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_movements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub product_id: i32,
    pub order_id: Option<i32>,
    pub kind: MovementKind,
    /// Signed: negative leaves stock, positive enters it
    pub quantity: i32,
    pub business_date: NaiveDate,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            return Err(DbErr::Custom(
                "inventory movements are append-only".to_string(),
            ));
        }
        let mut active_model = self;
        active_model.created_at = Set(Utc::now());
        Ok(active_model)
    }
}
