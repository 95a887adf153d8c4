//! Snapshot materializer
//!
//! Re-creates a snapshot's entity graph in the target installation.
//! Stages run strictly in order:
//!
//! - A: resolve or create the root entity
//! - B: add metadata keys the target lacks
//! - C: add missing taxonomy terms
//! - D: resolve related entities (A and B per entity)
//! - E: rewrite parents, metadata and reference URLs through the remap table
//! - F: merge schema field groups and fields
//! - G: merge catalog records
//!
//! Stage E only touches what this run wrote: parents of entities it created
//! and metadata keys it added, remapped once from the snapshot's values.
//! Values already stored on the target are never fed back through the
//! remap table, since a new id may equal some other old id.
//!
//! A failure in Stage A is returned as is. Later failures stop the run
//! and surface as `PartialWrite` with the report of what completed; no
//! rollback is attempted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::catalog_merge::merge_catalog_records;
use super::matching::{MatchPolicy, TitleMatch, IMPORT_KEY};
use super::references::{rewrite_reference_url, ReferenceDetector};
use super::remap::RemapTable;
use super::report::{EntityOutcome, ItemKind, MaterializeReport, Stage};
use super::schema_merge::merge_field_groups;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::snapshot::{EntityId, EntityRecord, Metadata, RelatedEntity, SnapshotDocument, TaxonomyAssignments};
use crate::store::{
    CatalogStore, EntityPatch, EntityStore, NewEntity, SchemaProvider, ENTITY_TABLE,
    REFERENCE_URL_FIELD,
};

type StageResult<T> = std::result::Result<T, (Stage, AppError)>;

/// A metadata key written during this run
#[derive(Debug)]
struct WrittenKey {
    id: EntityId,
    key: String,
    source: Vec<String>,
    stored: Vec<String>,
}

/// Writes of this run that Stage E revisits once the remap table is complete
#[derive(Debug, Default)]
struct Fixups {
    /// Created entity and the source id of its parent
    parents: Vec<(EntityId, EntityId)>,
    metadata: Vec<WrittenKey>,
}

impl Fixups {
    fn created(&mut self, outcome: &EntityOutcome, record: &EntityRecord) {
        if let (true, Some(parent)) = (outcome.created, record.parent_id) {
            self.parents.push((outcome.new_id, parent));
        }
    }
}

pub struct Materializer {
    entities: Arc<dyn EntityStore>,
    schema: Option<Arc<dyn SchemaProvider>>,
    catalog: Option<Arc<dyn CatalogStore>>,
    match_policy: Arc<dyn MatchPolicy>,
    references: ReferenceDetector,
    site_url: Url,
}

impl Materializer {
    pub fn new(entities: Arc<dyn EntityStore>, site_url: Url) -> Self {
        Self {
            entities,
            schema: None,
            catalog: None,
            match_policy: Arc::new(TitleMatch),
            references: ReferenceDetector::default(),
            site_url,
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

    pub fn with_match_policy(mut self, policy: Arc<dyn MatchPolicy>) -> Self {
        self.match_policy = policy;
        self
    }

    pub fn with_references(mut self, references: ReferenceDetector) -> Self {
        self.references = references;
        self
    }

    /// Parse `bytes` and materialize the document
    pub async fn materialize_bytes(&self, bytes: &[u8]) -> Result<MaterializeReport> {
        let doc = SnapshotDocument::from_slice(bytes)?;
        self.materialize(&doc).await
    }

    #[instrument(
        skip_all,
        fields(title = %doc.entity.title, entity_type = %doc.entity.entity_type, policy = self.match_policy.name())
    )]
    pub async fn materialize(&self, doc: &SnapshotDocument) -> Result<MaterializeReport> {
        let started = Instant::now();
        doc.validate()?;

        let mut report = MaterializeReport::new();
        report.complete(Stage::Parsing);

        let detector = self.references.with_declared_keys(&doc.reference_meta_keys);
        let mut table = RemapTable::new();

        let mut fixups = Fixups::default();
        let root = match self.resolve_entity(&doc.entity, &doc.metadata, &mut table).await {
            Ok(root) => root,
            Err(e) => {
                metrics::record_stage_failure(Stage::RootResolved.as_str());
                return Err(e);
            }
        };
        info!(
            stage = Stage::RootResolved.as_str(),
            id = %root.new_id,
            created = root.created,
            "Root entity resolved"
        );
        fixups.created(&root, &doc.entity);
        report.root = Some(root.clone());
        report.complete(Stage::RootResolved);

        let outcome = self
            .run_stages(doc, root.new_id, &detector, &mut table, &mut fixups, &mut report)
            .await;
        report.id_map = table.to_pairs();

        match outcome {
            Ok(()) => {
                report.complete(Stage::Done);
                let created = report.created_ids().len();
                let reused = 1 + report.related.len() - created;
                metrics::record_entities(created, reused);
                info!(
                    run_id = %report.run_id,
                    created,
                    reused,
                    skipped = report.skipped.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Snapshot materialized"
                );
                Ok(report)
            }
            Err((stage, e)) => {
                metrics::record_stage_failure(stage.as_str());
                error!(
                    run_id = %report.run_id,
                    stage = stage.as_str(),
                    error = %e,
                    "Materialization aborted"
                );
                Err(AppError::PartialWrite {
                    failed_stage: stage,
                    message: e.to_string(),
                    report: Box::new(report),
                })
            }
        }
    }

    async fn run_stages(
        &self,
        doc: &SnapshotDocument,
        root_id: EntityId,
        detector: &ReferenceDetector,
        table: &mut RemapTable,
        fixups: &mut Fixups,
        report: &mut MaterializeReport,
    ) -> StageResult<()> {
        // Stage B
        let written = self
            .apply_metadata(root_id, &doc.metadata, detector, table, &mut fixups.metadata)
            .await
            .map_err(|e| (Stage::MetadataApplied, e))?;
        report.writes.metadata_keys += written;
        finish(report, Stage::MetadataApplied, written);

        // Stage C
        let assigned = self
            .apply_taxonomies(root_id, &doc.taxonomies)
            .await
            .map_err(|e| (Stage::TaxonomiesApplied, e))?;
        report.writes.taxonomy_terms += assigned;
        finish(report, Stage::TaxonomiesApplied, assigned);

        // Stage D
        for related in &doc.related_entities {
            match self.resolve_related(related, detector, table, fixups).await {
                Ok((outcome, written)) => {
                    report.writes.metadata_keys += written;
                    report.related.push(outcome);
                }
                Err(e) => {
                    warn!(title = %related.entity.title, error = %e, "Skipping related entity");
                    let identifier = related
                        .entity
                        .id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| related.entity.title.clone());
                    report.skip(ItemKind::RelatedEntity, identifier, e);
                }
            }
        }
        let resolved = report.related.len();
        finish(report, Stage::RelatedResolved, resolved);

        // Stage E
        let fixed = self
            .fix_cross_references(detector, table, fixups)
            .await
            .map_err(|e| (Stage::CrossReferenceFixedUp, e))?;
        report.writes.references_fixed += fixed;
        finish(report, Stage::CrossReferenceFixedUp, fixed);

        // Stage F
        match &self.schema {
            Some(schema) => merge_field_groups(schema.as_ref(), &doc.schema_field_groups, report)
                .await
                .map_err(|e| (Stage::SchemaMerged, e))?,
            None => {
                report.schema_skipped = true;
                debug!("No schema provider, skipping field groups");
            }
        }
        let schema_writes = report.writes.schema_writes();
        finish(report, Stage::SchemaMerged, schema_writes);

        // Stage G
        match &self.catalog {
            Some(catalog) => merge_catalog_records(catalog.as_ref(), &doc.catalog_records, report)
                .await
                .map_err(|e| (Stage::CatalogMerged, e))?,
            None => {
                report.catalog_skipped = true;
                debug!("No catalog store, skipping catalog records");
            }
        }
        let record_writes = report.writes.records_created + report.writes.records_updated;
        finish(report, Stage::CatalogMerged, record_writes);

        Ok(())
    }

    /// Stage A for one entity: reuse a match or create, then record the pair
    async fn resolve_entity(
        &self,
        record: &EntityRecord,
        metadata: &Metadata,
        table: &mut RemapTable,
    ) -> Result<EntityOutcome> {
        let existing = self
            .match_policy
            .find_existing(self.entities.as_ref(), record, metadata)
            .await?;

        let (new_id, created) = match existing {
            Some(entity) => {
                debug!(id = %entity.id, title = %record.title, "Reusing existing entity");
                (entity.id, false)
            }
            None => {
                let id = self.entities.create(NewEntity::from(record)).await?;
                if let Some(old_id) = record.id {
                    self.entities
                        .add_metadata(id, IMPORT_KEY, &old_id.to_string())
                        .await?;
                }
                debug!(id = %id, title = %record.title, "Entity created");
                (id, true)
            }
        };

        if let Some(old_id) = record.id {
            table.record(old_id, new_id)?;
        }

        Ok(EntityOutcome {
            old_id: record.id,
            new_id,
            title: record.title.clone(),
            created,
        })
    }

    /// Stage B: write keys absent on the target, remapping id values
    async fn apply_metadata(
        &self,
        id: EntityId,
        metadata: &Metadata,
        detector: &ReferenceDetector,
        table: &RemapTable,
        written_keys: &mut Vec<WrittenKey>,
    ) -> Result<usize> {
        let mut written = 0;
        for (key, values) in metadata.iter() {
            if self.entities.has_metadata_key(id, key).await? {
                continue;
            }
            let stored = remap_metadata(detector, key, values, table).unwrap_or_else(|| values.to_vec());
            self.entities.set_metadata(id, key, &stored).await?;
            written_keys.push(WrittenKey {
                id,
                key: key.to_string(),
                source: values.to_vec(),
                stored,
            });
            written += 1;
        }
        Ok(written)
    }

    /// Stage C: append terms that exist here and are not yet assigned
    async fn apply_taxonomies(&self, id: EntityId, taxonomies: &TaxonomyAssignments) -> Result<usize> {
        let mut assigned = 0;
        for (taxonomy, slugs) in taxonomies.iter() {
            let current = self.entities.get_taxonomy_terms(id, taxonomy).await?;
            let mut missing: Vec<String> = Vec::new();
            for slug in slugs {
                if current.contains(slug) || missing.contains(slug) {
                    continue;
                }
                if self.entities.find_term(taxonomy, slug).await?.is_some() {
                    missing.push(slug.clone());
                } else {
                    debug!(taxonomy, slug = %slug, "Unknown term skipped");
                }
            }
            if !missing.is_empty() {
                self.entities
                    .set_taxonomy_terms(id, taxonomy, &missing, true)
                    .await?;
                assigned += missing.len();
            }
        }
        Ok(assigned)
    }

    async fn resolve_related(
        &self,
        related: &RelatedEntity,
        detector: &ReferenceDetector,
        table: &mut RemapTable,
        fixups: &mut Fixups,
    ) -> Result<(EntityOutcome, usize)> {
        let outcome = self
            .resolve_entity(&related.entity, &related.metadata, table)
            .await?;
        fixups.created(&outcome, &related.entity);
        let written = self
            .apply_metadata(outcome.new_id, &related.metadata, detector, table, &mut fixups.metadata)
            .await?;
        Ok((outcome, written))
    }

    /// Stage E: point every remapped entity at its counterparts here
    async fn fix_cross_references(
        &self,
        detector: &ReferenceDetector,
        table: &RemapTable,
        fixups: &Fixups,
    ) -> Result<usize> {
        let mut written = 0;

        for &(id, old_parent) in &fixups.parents {
            if let Some(new_parent) = table.get(old_parent).filter(|p| *p != old_parent) {
                let patch = EntityPatch {
                    parent_id: Some(Some(new_parent)),
                    ..Default::default()
                };
                self.entities.update(id, patch).await?;
                written += 1;
            }
        }

        for entry in &fixups.metadata {
            let remapped = remap_metadata(detector, &entry.key, &entry.source, table)
                .unwrap_or_else(|| entry.source.clone());
            if remapped != entry.stored {
                self.entities.set_metadata(entry.id, &entry.key, &remapped).await?;
                written += 1;
            }
        }

        let targets: BTreeSet<EntityId> = table.new_ids().collect();
        for id in targets {
            let entity = self.entities.get(id).await?.ok_or_else(|| AppError::NotFound {
                resource_type: "entity".to_string(),
                id: id.to_string(),
            })?;

            if let Some(url) = rewrite_reference_url(&entity.reference_url, id, &self.site_url) {
                if url != entity.reference_url {
                    self.entities
                        .raw_update_field(ENTITY_TABLE, id, REFERENCE_URL_FIELD, &url)
                        .await?;
                    written += 1;
                }
            }
        }
        Ok(written)
    }
}

/// Remapped values for `key`; the import tag always keeps the source id
fn remap_metadata(
    detector: &ReferenceDetector,
    key: &str,
    values: &[String],
    table: &RemapTable,
) -> Option<Vec<String>> {
    if key == IMPORT_KEY {
        return None;
    }
    detector.remap_values(key, values, table)
}

fn finish(report: &mut MaterializeReport, stage: Stage, writes: usize) {
    report.complete(stage);
    info!(stage = stage.as_str(), writes, "Stage complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EntityType;
    use crate::store::MemoryInstallation;
    use async_trait::async_trait;
    use serde_json::json;

    fn target() -> Arc<MemoryInstallation> {
        Arc::new(MemoryInstallation::new(Url::parse("https://new.example").unwrap()))
    }

    fn materializer(store: &Arc<MemoryInstallation>) -> Materializer {
        Materializer::new(store.clone(), store.site_url().clone())
    }

    fn doc(value: serde_json::Value) -> SnapshotDocument {
        SnapshotDocument::from_slice(&serde_json::to_vec(&value).unwrap()).unwrap()
    }

    fn root_only() -> SnapshotDocument {
        doc(json!({
            "post": {
                "ID": 42,
                "post_title": "Courses",
                "post_type": "acf-custom-post-type",
                "post_content": "{\"post_type\":\"course\"}",
                "guid": "https://old.example/?p=42"
            },
            "meta": { "thumbnail": ["43"], "color": ["blue"] },
            "taxonomies": { "category": ["learning", "ghost"] },
            "related_posts": [
                {
                    "post": { "ID": 43, "post_title": "Rust 101", "post_type": "course", "post_parent": 42, "guid": "https://old.example/courses/rust-101" },
                    "meta": { "owner": ["42"] }
                }
            ]
        }))
    }

    #[tokio::test]
    async fn test_creates_and_tags_root() {
        let store = target();
        let report = materializer(&store).materialize(&root_only()).await.unwrap();

        let root = report.root.clone().unwrap();
        assert!(root.created);
        let meta = store.get_metadata(root.new_id).await.unwrap();
        assert_eq!(meta.first(IMPORT_KEY), Some("42"));
        assert!(report.is_done());
        assert!(report.schema_skipped);
        assert!(report.catalog_skipped);
    }

    #[tokio::test]
    async fn test_cross_references_are_rewritten() {
        let store = target();
        store.add_term("category", "learning", "Learning");

        let report = materializer(&store).materialize(&root_only()).await.unwrap();
        let root_id = report.root.as_ref().unwrap().new_id;
        let course_id = report.related[0].new_id;

        let root_meta = store.get_metadata(root_id).await.unwrap();
        assert_eq!(root_meta.first("thumbnail"), Some(course_id.to_string().as_str()));

        let course = store.get(course_id).await.unwrap().unwrap();
        assert_eq!(course.parent_id, Some(root_id));
        assert_eq!(course.reference_url, "https://new.example/courses/rust-101");
        let course_meta = store.get_metadata(course_id).await.unwrap();
        assert_eq!(course_meta.first("owner"), Some(root_id.to_string().as_str()));

        let root = store.get(root_id).await.unwrap().unwrap();
        assert_eq!(root.reference_url, format!("https://new.example/?p={}", root_id));

        assert_eq!(store.get_taxonomy_terms(root_id, "category").await.unwrap(), vec!["learning"]);
    }

    #[tokio::test]
    async fn test_overlapping_id_ranges_remap_once() {
        let store = target();
        store
            .create(NewEntity {
                entity_type: EntityType::Other("page".into()),
                title: "Home".into(),
                content: String::new(),
                status: "publish".into(),
                slug: "home".into(),
                parent_id: None,
                reference_url: String::new(),
                extra: Default::default(),
            })
            .await
            .unwrap();

        let snapshot = doc(json!({
            "post": { "ID": 1, "post_title": "Courses", "post_type": "acf-custom-post-type", "post_content": "{\"post_type\":\"course\"}" },
            "meta": { "first_course": ["2"] },
            "related_posts": [
                {
                    "post": { "ID": 2, "post_title": "Rust 101", "post_type": "course", "post_parent": 1 },
                    "meta": { "owner": ["1"] }
                }
            ]
        }));

        let report = materializer(&store).materialize(&snapshot).await.unwrap();
        let root_id = report.root.as_ref().unwrap().new_id;
        let course_id = report.related[0].new_id;
        // New ids collide with old ids of the snapshot
        assert_eq!(root_id, EntityId(2));
        assert_eq!(course_id, EntityId(3));

        let course_meta = store.get_metadata(course_id).await.unwrap();
        assert_eq!(course_meta.first("owner"), Some("2"));
        let root_meta = store.get_metadata(root_id).await.unwrap();
        assert_eq!(root_meta.first("first_course"), Some("3"));
        let course = store.get(course_id).await.unwrap().unwrap();
        assert_eq!(course.parent_id, Some(root_id));

        let again = materializer(&store).materialize(&snapshot).await.unwrap();
        assert_eq!(again.writes.references_fixed, 0);
        assert_eq!(store.get_metadata(course_id).await.unwrap().first("owner"), Some("2"));
        assert_eq!(store.get_metadata(root_id).await.unwrap().first("first_course"), Some("3"));
        assert_eq!(store.get(course_id).await.unwrap().unwrap().parent_id, Some(root_id));
    }

    #[tokio::test]
    async fn test_existing_metadata_is_kept() {
        let store = target();
        let existing = store
            .create(NewEntity::from(&root_only().entity))
            .await
            .unwrap();
        store.add_metadata(existing, "color", "red").await.unwrap();

        let report = materializer(&store).materialize(&root_only()).await.unwrap();

        assert_eq!(report.root.as_ref().unwrap().new_id, existing);
        assert!(!report.root.as_ref().unwrap().created);
        let meta = store.get_metadata(existing).await.unwrap();
        assert_eq!(meta.get("color").unwrap(), ["red"]);
        assert!(meta.contains_key("thumbnail"));
    }

    #[tokio::test]
    async fn test_import_tag_is_never_remapped() {
        let store = target();
        let report = materializer(&store).materialize(&root_only()).await.unwrap();
        let course_id = report.related[0].new_id;

        let meta = store.get_metadata(course_id).await.unwrap();
        assert_eq!(meta.first(IMPORT_KEY), Some("43"));
    }

    /// Entity store whose metadata writes fail after the first one
    struct FailingMetadata {
        inner: Arc<MemoryInstallation>,
    }

    #[async_trait]
    impl EntityStore for FailingMetadata {
        async fn get(&self, id: EntityId) -> Result<Option<crate::store::Entity>> {
            self.inner.get(id).await
        }
        async fn get_by_title(&self, title: &str, t: &EntityType) -> Result<Option<crate::store::Entity>> {
            self.inner.get_by_title(title, t).await
        }
        async fn list_by_type(&self, t: &EntityType) -> Result<Vec<crate::store::Entity>> {
            self.inner.list_by_type(t).await
        }
        async fn find_by_metadata(&self, t: &EntityType, k: &str, v: &str) -> Result<Option<crate::store::Entity>> {
            self.inner.find_by_metadata(t, k, v).await
        }
        async fn create(&self, fields: NewEntity) -> Result<EntityId> {
            self.inner.create(fields).await
        }
        async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<()> {
            self.inner.update(id, patch).await
        }
        async fn get_metadata(&self, id: EntityId) -> Result<Metadata> {
            self.inner.get_metadata(id).await
        }
        async fn has_metadata_key(&self, id: EntityId, key: &str) -> Result<bool> {
            self.inner.has_metadata_key(id, key).await
        }
        async fn set_metadata(&self, _id: EntityId, _key: &str, _values: &[String]) -> Result<()> {
            Err(AppError::storage("metadata table is read-only"))
        }
        async fn add_metadata(&self, id: EntityId, key: &str, value: &str) -> Result<()> {
            self.inner.add_metadata(id, key, value).await
        }
        async fn taxonomies_for(&self, t: &EntityType) -> Result<Vec<String>> {
            self.inner.taxonomies_for(t).await
        }
        async fn get_taxonomy_terms(&self, id: EntityId, tax: &str) -> Result<Vec<String>> {
            self.inner.get_taxonomy_terms(id, tax).await
        }
        async fn find_term(&self, tax: &str, slug: &str) -> Result<Option<crate::store::Term>> {
            self.inner.find_term(tax, slug).await
        }
        async fn set_taxonomy_terms(&self, id: EntityId, tax: &str, slugs: &[String], append: bool) -> Result<()> {
            self.inner.set_taxonomy_terms(id, tax, slugs, append).await
        }
        async fn raw_update_field(&self, table: &str, id: EntityId, field: &str, value: &str) -> Result<()> {
            self.inner.raw_update_field(table, id, field, value).await
        }
    }

    #[tokio::test]
    async fn test_failure_after_root_is_partial_write() {
        let inner = target();
        let store = Arc::new(FailingMetadata { inner: inner.clone() });
        let materializer = Materializer::new(store, inner.site_url().clone());

        let err = materializer.materialize(&root_only()).await.unwrap_err();
        match err {
            AppError::PartialWrite { failed_stage, report, .. } => {
                assert_eq!(failed_stage, Stage::MetadataApplied);
                assert_eq!(report.completed_stages, vec![Stage::Parsing, Stage::RootResolved]);
                assert_eq!(report.id_map.len(), 1);
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        assert_eq!(inner.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_document_writes_nothing() {
        let store = target();
        let err = materializer(&store)
            .materialize_bytes(br#"{"post": {"post_title": "x", "post_type": "page"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
        assert_eq!(store.write_count(), 0);
    }
}
