//! Catalog record metadata rows

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "catalog_meta")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub record_id: i64,

    #[sea_orm(column_type = "Text")]
    pub meta_key: String,

    #[sea_orm(column_type = "Text")]
    pub meta_value: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::catalog_record::Entity",
        from = "Column::RecordId",
        to = "super::catalog_record::Column::Id"
    )]
    Record,
}

impl Related<super::catalog_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Record.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
