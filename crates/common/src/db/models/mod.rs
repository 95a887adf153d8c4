//! SeaORM entity models
//!
//! Tables of one installation

mod catalog_meta;
mod catalog_record;
mod entity;
mod entity_meta;
mod field;
mod field_group;
mod taxonomy;
mod term;
mod term_assignment;

pub use entity::{
    ActiveModel as EntityActiveModel,
    Column as EntityColumn,
    Entity as EntityEntity,
    Model as EntityRow,
};

pub use entity_meta::{
    ActiveModel as EntityMetaActiveModel,
    Column as EntityMetaColumn,
    Entity as EntityMetaEntity,
    Model as EntityMetaRow,
};

pub use taxonomy::{
    ActiveModel as TaxonomyActiveModel,
    Column as TaxonomyColumn,
    Entity as TaxonomyEntity,
    Model as TaxonomyRow,
};

pub use term::{
    ActiveModel as TermActiveModel,
    Column as TermColumn,
    Entity as TermEntity,
    Model as TermRow,
};

pub use term_assignment::{
    ActiveModel as TermAssignmentActiveModel,
    Column as TermAssignmentColumn,
    Entity as TermAssignmentEntity,
    Model as TermAssignmentRow,
};

pub use field_group::{
    ActiveModel as FieldGroupActiveModel,
    Column as FieldGroupColumn,
    Entity as FieldGroupEntity,
    Model as FieldGroupRow,
};

pub use field::{
    ActiveModel as FieldActiveModel,
    Column as FieldColumn,
    Entity as FieldEntity,
    Model as FieldRow,
};

pub use catalog_record::{
    ActiveModel as CatalogRecordActiveModel,
    Column as CatalogRecordColumn,
    Entity as CatalogRecordEntity,
    Model as CatalogRecordRow,
};

pub use catalog_meta::{
    ActiveModel as CatalogMetaActiveModel,
    Column as CatalogMetaColumn,
    Entity as CatalogMetaEntity,
    Model as CatalogMetaRow,
};
