//! Schema field

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fields")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(column_type = "Text", unique)]
    pub key: String,

    #[sea_orm(column_type = "Text")]
    pub label: String,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text")]
    pub field_type: String,

    /// Owning group as stored on the wire: numeric id or group key
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub parent: Option<serde_json::Value>,

    #[sea_orm(column_type = "JsonBinary")]
    pub config: serde_json::Value,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
