//! Installation storage collaborators
//!
//! The transfer engine talks to an installation only through these
//! traits:
//! - `EntityStore` for content entities, metadata and taxonomy terms
//! - `SchemaProvider` for field groups and fields (optional)
//! - `CatalogStore` for commerce records (optional)

mod memory;

pub use memory::MemoryInstallation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::{AppError, Result};
use crate::snapshot::{
    CatalogRecordData, EntityId, EntityRecord, EntityType, FieldDef, FieldGroupDef, Metadata,
};

/// Table name accepted by `raw_update_field` for entities
pub const ENTITY_TABLE: &str = "entities";

/// Column holding an entity's reference URL
pub const REFERENCE_URL_FIELD: &str = "reference_url";

/// Columns `raw_update_field` may write
pub const RAW_UPDATE_FIELDS: [&str; 5] = [REFERENCE_URL_FIELD, "title", "content", "status", "slug"];

/// Reject identifiers `raw_update_field` must not touch
pub fn check_raw_update(table: &str, field: &str) -> Result<()> {
    if table != ENTITY_TABLE {
        return Err(AppError::Validation {
            message: format!("Unknown table '{}'", table),
            field: Some("table".to_string()),
        });
    }
    if !RAW_UPDATE_FIELDS.contains(&field) {
        return Err(AppError::Validation {
            message: format!("Column '{}' cannot be updated directly", field),
            field: Some("field".to_string()),
        });
    }
    Ok(())
}

/// A stored content entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub title: String,
    pub content: String,
    pub status: String,
    pub slug: String,
    pub parent_id: Option<EntityId>,
    pub reference_url: String,
    pub extra: BTreeMap<String, Value>,
}

impl Entity {
    /// Wire form of this entity, keeping its local id
    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            id: Some(self.id),
            entity_type: self.entity_type.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            status: self.status.clone(),
            slug: self.slug.clone(),
            parent_id: self.parent_id,
            reference_url: self.reference_url.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Fields for a new entity; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub entity_type: EntityType,
    pub title: String,
    pub content: String,
    pub status: String,
    pub slug: String,
    pub parent_id: Option<EntityId>,
    /// Empty means "let the store generate one"
    pub reference_url: String,
    pub extra: BTreeMap<String, Value>,
}

impl From<&EntityRecord> for NewEntity {
    fn from(record: &EntityRecord) -> Self {
        Self {
            entity_type: record.entity_type.clone(),
            title: record.title.clone(),
            content: record.content.clone(),
            status: record.status.clone(),
            slug: record.slug.clone(),
            parent_id: record.parent_id,
            reference_url: record.reference_url.clone(),
            extra: record.extra.clone(),
        }
    }
}

/// Partial entity update; `None` leaves a column unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<String>,
    pub parent_id: Option<Option<EntityId>>,
}

/// Lightweight listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub title: String,
}

impl From<&Entity> for EntitySummary {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            entity_type: entity.entity_type.clone(),
            title: entity.title.clone(),
        }
    }
}

/// A taxonomy term of the target installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: u64,
    pub taxonomy: String,
    pub slug: String,
    pub name: String,
}

/// A stored catalog record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: EntityId,
    pub name: String,
    pub sku: Option<String>,
    pub price: Option<String>,
    pub extra: serde_json::Map<String, Value>,
}

impl CatalogRecord {
    /// Wire form of this record
    pub fn to_data(&self) -> CatalogRecordData {
        CatalogRecordData {
            id: Some(self.id),
            name: self.name.clone(),
            sku: self.sku.clone(),
            price: self.price.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Overwrite the fields supplied by `data`; the id is never touched
    pub fn apply(&mut self, data: &CatalogRecordData) {
        if !data.name.is_empty() {
            self.name = data.name.clone();
        }
        if data.sku.is_some() {
            self.sku = data.sku.clone();
        }
        if data.price.is_some() {
            self.price = data.price.clone();
        }
        for (key, value) in &data.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Content entity storage of one installation
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: EntityId) -> Result<Option<Entity>>;

    /// First entity of `entity_type` whose title equals `title`
    async fn get_by_title(&self, title: &str, entity_type: &EntityType) -> Result<Option<Entity>>;

    async fn list_by_type(&self, entity_type: &EntityType) -> Result<Vec<Entity>>;

    /// First entity of `entity_type` carrying `key = value` in its metadata
    async fn find_by_metadata(
        &self,
        entity_type: &EntityType,
        key: &str,
        value: &str,
    ) -> Result<Option<Entity>>;

    async fn create(&self, fields: NewEntity) -> Result<EntityId>;

    async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<()>;

    async fn get_metadata(&self, id: EntityId) -> Result<Metadata>;

    async fn has_metadata_key(&self, id: EntityId, key: &str) -> Result<bool>;

    /// Replace every value of `key`
    async fn set_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()>;

    /// Append a value to `key`
    async fn add_metadata(&self, id: EntityId, key: &str, value: &str) -> Result<()>;

    /// Taxonomies registered for `entity_type`
    async fn taxonomies_for(&self, entity_type: &EntityType) -> Result<Vec<String>>;

    /// Slugs of the terms assigned to `id` in `taxonomy`
    async fn get_taxonomy_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>>;

    async fn find_term(&self, taxonomy: &str, slug: &str) -> Result<Option<Term>>;

    /// Assign existing terms by slug, appending or replacing
    async fn set_taxonomy_terms(
        &self,
        id: EntityId,
        taxonomy: &str,
        slugs: &[String],
        append: bool,
    ) -> Result<()>;

    /// Write one column directly, bypassing update hooks
    async fn raw_update_field(&self, table: &str, id: EntityId, field: &str, value: &str) -> Result<()>;
}

/// Field group and field storage of one installation
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn list_field_groups(&self) -> Result<Vec<FieldGroupDef>>;

    async fn get_field_group(&self, id: EntityId) -> Result<Option<FieldGroupDef>>;

    /// Fields belonging to the group with `group_key`
    async fn list_fields(&self, group_key: &str) -> Result<Vec<FieldDef>>;

    /// Create a group from `def` (its id is ignored) and return the new id
    async fn import_field_group(&self, def: &FieldGroupDef) -> Result<EntityId>;

    async fn update_field_group(&self, def: &FieldGroupDef) -> Result<()>;

    async fn get_field(&self, key: &str) -> Result<Option<FieldDef>>;

    /// Create or replace the field with `def.key`
    async fn update_field(&self, def: &FieldDef) -> Result<()>;
}

/// Commerce record storage of one installation
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Records whose name contains `name`
    async fn search_by_name(&self, name: &str) -> Result<Vec<CatalogRecord>>;

    async fn find_by_sku(&self, sku: &str) -> Result<Option<CatalogRecord>>;

    /// First record whose name equals `title`
    async fn find_by_title(&self, title: &str) -> Result<Option<CatalogRecord>>;

    async fn create_simple_record(
        &self,
        name: &str,
        sku: Option<&str>,
        price: Option<&str>,
    ) -> Result<EntityId>;

    async fn update_record(&self, id: EntityId, data: &CatalogRecordData) -> Result<()>;

    async fn record_metadata(&self, id: EntityId) -> Result<Metadata>;

    async fn set_record_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()>;

    async fn list_taxonomies_for(&self, record_type: &EntityType) -> Result<Vec<String>>;

    async fn record_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>>;

    /// Replace the record's terms, creating missing ones
    async fn set_record_terms(&self, id: EntityId, taxonomy: &str, slugs: &[String]) -> Result<()>;
}
