//! Snapshot builder
//!
//! Serializes a root entity and everything it references into a
//! `SnapshotDocument`. Any collaborator failure aborts the build.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::errors::{AppError, Result};
use crate::snapshot::content::nested_entity_type;
use crate::snapshot::{
    CatalogBundle, EntityId, EntityType, FieldGroupBundle, RelatedEntity, SnapshotDocument,
    TaxonomyAssignments,
};
use crate::store::{CatalogStore, Entity, EntityStore, SchemaProvider};

pub struct SnapshotBuilder {
    entities: Arc<dyn EntityStore>,
    schema: Option<Arc<dyn SchemaProvider>>,
    catalog: Option<Arc<dyn CatalogStore>>,
    reference_meta_keys: Vec<String>,
}

impl SnapshotBuilder {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self {
            entities,
            schema: None,
            catalog: None,
            reference_meta_keys: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: Option<Arc<dyn SchemaProvider>>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_catalog(mut self, catalog: Option<Arc<dyn CatalogStore>>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Keys written to the document as holding entity ids
    pub fn with_reference_meta_keys(mut self, keys: Vec<String>) -> Self {
        self.reference_meta_keys = keys;
        self
    }

    /// Build the snapshot rooted at `root_id`
    #[instrument(skip(self), fields(root_id = %root_id))]
    pub async fn build(&self, root_id: EntityId) -> Result<SnapshotDocument> {
        let root = self
            .entities
            .get(root_id)
            .await?
            .filter(|e| e.entity_type.is_transferable())
            .ok_or_else(|| AppError::EntityNotFound {
                id: root_id.to_string(),
            })?;

        let metadata = self.entities.get_metadata(root.id).await?;
        let taxonomies = self.taxonomies(&root).await?;
        let related_entities = self.related_entities(&root).await?;
        let catalog_records = self.catalog_records(&root.title).await?;
        let schema_field_groups = self.field_groups().await?;

        info!(
            title = %root.title,
            entity_type = %root.entity_type,
            related = related_entities.len(),
            field_groups = schema_field_groups.len(),
            catalog_records = catalog_records.len(),
            "Snapshot built"
        );

        Ok(SnapshotDocument {
            entity: root.to_record(),
            metadata,
            taxonomies,
            schema_field_groups,
            catalog_records,
            related_entities,
            reference_meta_keys: self.reference_meta_keys.clone(),
        })
    }

    /// Slugs per taxonomy registered for the root's type
    async fn taxonomies(&self, root: &Entity) -> Result<TaxonomyAssignments> {
        let mut assignments = TaxonomyAssignments::new();
        for taxonomy in self.entities.taxonomies_for(&root.entity_type).await? {
            let slugs = self.entities.get_taxonomy_terms(root.id, &taxonomy).await?;
            assignments.insert(taxonomy, slugs);
        }
        Ok(assignments)
    }

    /// Every entity of the type the root's content describes
    async fn related_entities(&self, root: &Entity) -> Result<Vec<RelatedEntity>> {
        let record = root.to_record();
        let Some(nested) = nested_entity_type(&record) else {
            return Ok(Vec::new());
        };

        let entities = self.entities.list_by_type(&nested).await?;
        debug!(nested_type = %nested, count = entities.len(), "Collecting related entities");

        let mut related = Vec::with_capacity(entities.len());
        for entity in entities {
            let metadata = self.entities.get_metadata(entity.id).await?;
            related.push(RelatedEntity {
                entity: entity.to_record(),
                metadata,
            });
        }
        Ok(related)
    }

    /// Catalog records named exactly like the root
    async fn catalog_records(&self, title: &str) -> Result<Vec<CatalogBundle>> {
        let Some(catalog) = &self.catalog else {
            return Ok(Vec::new());
        };

        let taxonomies = catalog.list_taxonomies_for(&EntityType::Product).await?;
        let mut bundles = Vec::new();
        for record in catalog.search_by_name(title).await? {
            if record.name != title {
                continue;
            }

            let meta = catalog.record_metadata(record.id).await?;
            let mut assignments = TaxonomyAssignments::new();
            for taxonomy in &taxonomies {
                assignments.insert(taxonomy.clone(), catalog.record_terms(record.id, taxonomy).await?);
            }

            bundles.push(CatalogBundle {
                product: record.to_data(),
                meta,
                taxonomies: assignments,
            });
        }
        Ok(bundles)
    }

    async fn field_groups(&self) -> Result<Vec<FieldGroupBundle>> {
        let Some(schema) = &self.schema else {
            return Ok(Vec::new());
        };

        let mut bundles = Vec::new();
        for field_group in schema.list_field_groups().await? {
            let fields = schema.list_fields(&field_group.key).await?;
            bundles.push(FieldGroupBundle { field_group, fields });
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FieldDef, FieldGroupDef, ParentRef};
    use crate::store::{MemoryInstallation, NewEntity};
    use serde_json::Map;
    use std::collections::BTreeMap;
    use url::Url;

    fn new_entity(entity_type: EntityType, title: &str, content: &str) -> NewEntity {
        NewEntity {
            entity_type,
            title: title.into(),
            content: content.into(),
            status: "publish".into(),
            slug: String::new(),
            parent_id: None,
            reference_url: String::new(),
            extra: BTreeMap::new(),
        }
    }

    fn source() -> Arc<MemoryInstallation> {
        Arc::new(MemoryInstallation::new(Url::parse("https://old.example").unwrap()))
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let store = source();
        let builder = SnapshotBuilder::new(store);
        let err = builder.build(EntityId(404)).await.unwrap_err();
        assert!(matches!(err, AppError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_non_transferable_root_is_not_found() {
        let store = source();
        let id = store
            .create(new_entity(EntityType::Other("page".into()), "About", ""))
            .await
            .unwrap();
        let err = SnapshotBuilder::new(store).build(id).await.unwrap_err();
        assert!(matches!(err, AppError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_collects_related_and_taxonomies() {
        let store = source();
        store.register_taxonomy(&EntityType::CustomPostTypeDefinition, "category");
        store.add_term("category", "learning", "Learning");

        let root = store
            .create(new_entity(
                EntityType::CustomPostTypeDefinition,
                "Courses",
                r#"{"post_type":"course"}"#,
            ))
            .await
            .unwrap();
        store.add_metadata(root, "labels", "a:0:{}").await.unwrap();
        store
            .set_taxonomy_terms(root, "category", &["learning".into()], false)
            .await
            .unwrap();

        let course = store
            .create(new_entity(EntityType::Other("course".into()), "Rust 101", ""))
            .await
            .unwrap();
        store.add_metadata(course, "duration", "6").await.unwrap();

        let doc = SnapshotBuilder::new(store.clone()).build(root).await.unwrap();

        assert_eq!(doc.entity.id, Some(root));
        assert_eq!(doc.metadata.first("labels"), Some("a:0:{}"));
        assert_eq!(doc.taxonomies.get("category").unwrap(), ["learning"]);
        assert_eq!(doc.related_entities.len(), 1);
        assert_eq!(doc.related_entities[0].metadata.first("duration"), Some("6"));
        assert!(doc.schema_field_groups.is_empty());
        assert!(doc.catalog_records.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_requires_exact_title() {
        let store = source();
        let root = store
            .create(new_entity(EntityType::PostTypeDefinition, "Rust", ""))
            .await
            .unwrap();
        let exact = store.create_simple_record("Rust", Some("R-1"), Some("10")).await.unwrap();
        store.create_simple_record("Rust Advanced", Some("R-2"), None).await.unwrap();
        store
            .set_record_metadata(exact, "_price", &["10".to_string()])
            .await
            .unwrap();

        let catalog: Arc<dyn CatalogStore> = store.clone();
        let doc = SnapshotBuilder::new(store.clone())
            .with_catalog(Some(catalog))
            .build(root)
            .await
            .unwrap();

        assert_eq!(doc.catalog_records.len(), 1);
        assert_eq!(doc.catalog_records[0].product.sku.as_deref(), Some("R-1"));
        assert_eq!(doc.catalog_records[0].meta.first("_price"), Some("10"));
    }

    #[tokio::test]
    async fn test_captures_all_field_groups() {
        let store = source();
        let root = store
            .create(new_entity(EntityType::PostTypeDefinition, "Courses", ""))
            .await
            .unwrap();
        let group = FieldGroupDef {
            id: None,
            key: "group_course".into(),
            title: "Course".into(),
            settings: Map::new(),
        };
        store.import_field_group(&group).await.unwrap();
        store
            .update_field(&FieldDef {
                id: None,
                key: "field_duration".into(),
                label: "Duration".into(),
                name: "duration".into(),
                field_type: "number".into(),
                parent: Some(ParentRef::Key("group_course".into())),
                config: Map::new(),
            })
            .await
            .unwrap();

        let schema: Arc<dyn SchemaProvider> = store.clone();
        let doc = SnapshotBuilder::new(store.clone())
            .with_schema(Some(schema))
            .build(root)
            .await
            .unwrap();

        assert_eq!(doc.schema_field_groups.len(), 1);
        assert_eq!(doc.schema_field_groups[0].fields.len(), 1);
        assert_eq!(doc.schema_field_groups[0].fields[0].key, "field_duration");
    }
}
