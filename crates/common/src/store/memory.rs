//! In-process installation
//!
//! Implements all three collaborator traits over plain maps. Used by the
//! `memory` storage backend and throughout the test suite; every mutating
//! call bumps a write counter so idempotence can be asserted.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::{
    check_raw_update, CatalogRecord, CatalogStore, Entity, EntityPatch, EntityStore, NewEntity,
    SchemaProvider, Term, REFERENCE_URL_FIELD,
};
use crate::errors::{AppError, Result};
use crate::snapshot::{
    CatalogRecordData, EntityId, EntityType, FieldDef, FieldGroupDef, Metadata,
};

#[derive(Default)]
struct State {
    next_id: u64,
    next_term_id: u64,
    entities: BTreeMap<EntityId, Entity>,
    entity_meta: BTreeMap<EntityId, Metadata>,
    taxonomies: BTreeMap<EntityType, Vec<String>>,
    terms: BTreeMap<String, BTreeMap<String, Term>>,
    entity_terms: BTreeMap<(EntityId, String), Vec<String>>,
    field_groups: BTreeMap<EntityId, FieldGroupDef>,
    fields: BTreeMap<String, FieldDef>,
    records: BTreeMap<EntityId, CatalogRecord>,
    record_meta: BTreeMap<EntityId, Metadata>,
    record_terms: BTreeMap<(EntityId, String), Vec<String>>,
    writes: u64,
}

impl State {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }

    fn ensure_term(&mut self, taxonomy: &str, slug: &str, name: &str) -> u64 {
        if let Some(term) = self.terms.get(taxonomy).and_then(|t| t.get(slug)) {
            return term.id;
        }
        self.next_term_id += 1;
        let term = Term {
            id: self.next_term_id,
            taxonomy: taxonomy.to_string(),
            slug: slug.to_string(),
            name: name.to_string(),
        };
        self.terms
            .entry(taxonomy.to_string())
            .or_default()
            .insert(slug.to_string(), term);
        self.next_term_id
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities.get_mut(&id).ok_or_else(|| AppError::NotFound {
            resource_type: "entity".to_string(),
            id: id.to_string(),
        })
    }

    fn record_mut(&mut self, id: EntityId) -> Result<&mut CatalogRecord> {
        self.records.get_mut(&id).ok_or_else(|| AppError::NotFound {
            resource_type: "catalog_record".to_string(),
            id: id.to_string(),
        })
    }
}

/// A complete installation held in memory
pub struct MemoryInstallation {
    site_url: Url,
    state: Mutex<State>,
}

impl MemoryInstallation {
    pub fn new(site_url: Url) -> Self {
        Self {
            site_url,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn site_url(&self) -> &Url {
        &self.site_url
    }

    /// Register `taxonomy` for entities of `entity_type`
    pub fn register_taxonomy(&self, entity_type: &EntityType, taxonomy: &str) {
        let mut state = self.state();
        let list = state.taxonomies.entry(entity_type.clone()).or_default();
        if !list.iter().any(|t| t == taxonomy) {
            list.push(taxonomy.to_string());
        }
    }

    /// Create a term, returning its id (existing terms are reused)
    pub fn add_term(&self, taxonomy: &str, slug: &str, name: &str) -> u64 {
        self.state().ensure_term(taxonomy, slug, name)
    }

    /// Number of mutating calls served so far
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    pub fn entity_count(&self) -> usize {
        self.state().entities.len()
    }

    pub fn field_group_count(&self) -> usize {
        self.state().field_groups.len()
    }

    pub fn field_count(&self) -> usize {
        self.state().fields.len()
    }

    pub fn record_count(&self) -> usize {
        self.state().records.len()
    }

    fn generated_reference_url(&self, id: EntityId) -> String {
        format!("{}/?p={}", self.site_url.as_str().trim_end_matches('/'), id)
    }
}

#[async_trait]
impl EntityStore for MemoryInstallation {
    async fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.state().entities.get(&id).cloned())
    }

    async fn get_by_title(&self, title: &str, entity_type: &EntityType) -> Result<Option<Entity>> {
        Ok(self
            .state()
            .entities
            .values()
            .find(|e| e.entity_type == *entity_type && e.title == title)
            .cloned())
    }

    async fn list_by_type(&self, entity_type: &EntityType) -> Result<Vec<Entity>> {
        Ok(self
            .state()
            .entities
            .values()
            .filter(|e| e.entity_type == *entity_type)
            .cloned()
            .collect())
    }

    async fn find_by_metadata(
        &self,
        entity_type: &EntityType,
        key: &str,
        value: &str,
    ) -> Result<Option<Entity>> {
        let state = self.state();
        Ok(state
            .entities
            .values()
            .filter(|e| e.entity_type == *entity_type)
            .find(|e| {
                state
                    .entity_meta
                    .get(&e.id)
                    .and_then(|meta| meta.get(key))
                    .is_some_and(|values| values.iter().any(|v| v == value))
            })
            .cloned())
    }

    async fn create(&self, fields: NewEntity) -> Result<EntityId> {
        let id = {
            let mut state = self.state();
            state.allocate_id()
        };
        let reference_url = if fields.reference_url.is_empty() {
            self.generated_reference_url(id)
        } else {
            fields.reference_url
        };

        let mut state = self.state();
        state.entities.insert(
            id,
            Entity {
                id,
                entity_type: fields.entity_type,
                title: fields.title,
                content: fields.content,
                status: fields.status,
                slug: fields.slug,
                parent_id: fields.parent_id,
                reference_url,
                extra: fields.extra,
            },
        );
        state.writes += 1;
        Ok(id)
    }

    async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<()> {
        let mut state = self.state();
        let entity = state.entity_mut(id)?;
        if let Some(title) = patch.title {
            entity.title = title;
        }
        if let Some(content) = patch.content {
            entity.content = content;
        }
        if let Some(status) = patch.status {
            entity.status = status;
        }
        if let Some(parent_id) = patch.parent_id {
            entity.parent_id = parent_id;
        }
        state.writes += 1;
        Ok(())
    }

    async fn get_metadata(&self, id: EntityId) -> Result<Metadata> {
        Ok(self.state().entity_meta.get(&id).cloned().unwrap_or_default())
    }

    async fn has_metadata_key(&self, id: EntityId, key: &str) -> Result<bool> {
        Ok(self
            .state()
            .entity_meta
            .get(&id)
            .is_some_and(|meta| meta.contains_key(key)))
    }

    async fn set_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()> {
        let mut state = self.state();
        state.entity_mut(id)?;
        state
            .entity_meta
            .entry(id)
            .or_default()
            .insert(key, values.to_vec());
        state.writes += 1;
        Ok(())
    }

    async fn add_metadata(&self, id: EntityId, key: &str, value: &str) -> Result<()> {
        let mut state = self.state();
        state.entity_mut(id)?;
        state.entity_meta.entry(id).or_default().push(key, value);
        state.writes += 1;
        Ok(())
    }

    async fn taxonomies_for(&self, entity_type: &EntityType) -> Result<Vec<String>> {
        Ok(self
            .state()
            .taxonomies
            .get(entity_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_taxonomy_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .entity_terms
            .get(&(id, taxonomy.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn find_term(&self, taxonomy: &str, slug: &str) -> Result<Option<Term>> {
        Ok(self
            .state()
            .terms
            .get(taxonomy)
            .and_then(|terms| terms.get(slug))
            .cloned())
    }

    async fn set_taxonomy_terms(
        &self,
        id: EntityId,
        taxonomy: &str,
        slugs: &[String],
        append: bool,
    ) -> Result<()> {
        let mut state = self.state();
        state.entity_mut(id)?;

        let known: Vec<String> = slugs
            .iter()
            .filter(|slug| {
                state
                    .terms
                    .get(taxonomy)
                    .is_some_and(|terms| terms.contains_key(slug.as_str()))
            })
            .cloned()
            .collect();

        let assigned = state.entity_terms.entry((id, taxonomy.to_string())).or_default();
        if !append {
            assigned.clear();
        }
        for slug in known {
            if !assigned.contains(&slug) {
                assigned.push(slug);
            }
        }
        state.writes += 1;
        Ok(())
    }

    async fn raw_update_field(&self, table: &str, id: EntityId, field: &str, value: &str) -> Result<()> {
        check_raw_update(table, field)?;

        let mut state = self.state();
        let entity = state.entity_mut(id)?;
        let column = match field {
            REFERENCE_URL_FIELD => &mut entity.reference_url,
            "title" => &mut entity.title,
            "content" => &mut entity.content,
            "status" => &mut entity.status,
            _ => &mut entity.slug,
        };
        *column = value.to_string();
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl SchemaProvider for MemoryInstallation {
    async fn list_field_groups(&self) -> Result<Vec<FieldGroupDef>> {
        Ok(self.state().field_groups.values().cloned().collect())
    }

    async fn get_field_group(&self, id: EntityId) -> Result<Option<FieldGroupDef>> {
        Ok(self.state().field_groups.get(&id).cloned())
    }

    async fn list_fields(&self, group_key: &str) -> Result<Vec<FieldDef>> {
        let state = self.state();
        let Some(group) = state.field_groups.values().find(|g| g.key == group_key) else {
            return Ok(Vec::new());
        };
        Ok(state
            .fields
            .values()
            .filter(|f| f.parent.as_ref().is_some_and(|p| p.refers_to(group)))
            .cloned()
            .collect())
    }

    async fn import_field_group(&self, def: &FieldGroupDef) -> Result<EntityId> {
        let mut state = self.state();
        let id = state.allocate_id();
        let mut stored = def.clone();
        stored.id = Some(id);
        state.field_groups.insert(id, stored);
        state.writes += 1;
        Ok(id)
    }

    async fn update_field_group(&self, def: &FieldGroupDef) -> Result<()> {
        let mut state = self.state();
        let id = match def.id {
            Some(id) if state.field_groups.contains_key(&id) => id,
            _ => state
                .field_groups
                .values()
                .find(|g| g.key == def.key)
                .and_then(|g| g.id)
                .ok_or_else(|| AppError::NotFound {
                    resource_type: "field_group".to_string(),
                    id: def.key.clone(),
                })?,
        };
        let mut stored = def.clone();
        stored.id = Some(id);
        state.field_groups.insert(id, stored);
        state.writes += 1;
        Ok(())
    }

    async fn get_field(&self, key: &str) -> Result<Option<FieldDef>> {
        Ok(self.state().fields.get(key).cloned())
    }

    async fn update_field(&self, def: &FieldDef) -> Result<()> {
        let mut state = self.state();
        let id = match state.fields.get(&def.key).and_then(|f| f.id) {
            Some(id) => id,
            None => state.allocate_id(),
        };
        let mut stored = def.clone();
        stored.id = Some(id);
        state.fields.insert(def.key.clone(), stored);
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryInstallation {
    async fn search_by_name(&self, name: &str) -> Result<Vec<CatalogRecord>> {
        let needle = name.to_lowercase();
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn find_by_sku(&self, sku: &str) -> Result<Option<CatalogRecord>> {
        Ok(self
            .state()
            .records
            .values()
            .find(|r| r.sku.as_deref() == Some(sku))
            .cloned())
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<CatalogRecord>> {
        Ok(self
            .state()
            .records
            .values()
            .find(|r| r.name == title)
            .cloned())
    }

    async fn create_simple_record(
        &self,
        name: &str,
        sku: Option<&str>,
        price: Option<&str>,
    ) -> Result<EntityId> {
        let mut state = self.state();
        if let Some(sku) = sku {
            if state.records.values().any(|r| r.sku.as_deref() == Some(sku)) {
                return Err(AppError::storage(format!("Duplicate SKU '{}'", sku)));
            }
        }
        let id = state.allocate_id();
        state.records.insert(
            id,
            CatalogRecord {
                id,
                name: name.to_string(),
                sku: sku.map(str::to_string),
                price: price.map(str::to_string),
                extra: serde_json::Map::new(),
            },
        );
        state.writes += 1;
        Ok(id)
    }

    async fn update_record(&self, id: EntityId, data: &CatalogRecordData) -> Result<()> {
        let mut state = self.state();
        state.record_mut(id)?.apply(data);
        state.writes += 1;
        Ok(())
    }

    async fn record_metadata(&self, id: EntityId) -> Result<Metadata> {
        Ok(self.state().record_meta.get(&id).cloned().unwrap_or_default())
    }

    async fn set_record_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()> {
        let mut state = self.state();
        state.record_mut(id)?;
        state
            .record_meta
            .entry(id)
            .or_default()
            .insert(key, values.to_vec());
        state.writes += 1;
        Ok(())
    }

    async fn list_taxonomies_for(&self, record_type: &EntityType) -> Result<Vec<String>> {
        EntityStore::taxonomies_for(self, record_type).await
    }

    async fn record_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .record_terms
            .get(&(id, taxonomy.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_record_terms(&self, id: EntityId, taxonomy: &str, slugs: &[String]) -> Result<()> {
        let mut state = self.state();
        state.record_mut(id)?;
        for slug in slugs {
            state.ensure_term(taxonomy, slug, slug);
        }
        state
            .record_terms
            .insert((id, taxonomy.to_string()), slugs.to_vec());
        state.writes += 1;
        Ok(())
    }
}
