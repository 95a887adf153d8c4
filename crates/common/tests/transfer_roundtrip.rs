//! Export from one in-memory installation, import into another

use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use sitebridge_common::snapshot::{
    CatalogRecordData, EntityId, EntityType, FieldDef, FieldGroupDef, ParentRef, SnapshotDocument,
};
use sitebridge_common::store::{
    CatalogStore, EntityStore, MemoryInstallation, NewEntity, SchemaProvider,
};
use sitebridge_common::transfer::{Materializer, MaterializeReport, SnapshotBuilder};

const COURSE_DEFINITION: &str = r#"a:2:{s:9:"post_type";s:6:"course";s:6:"public";b:1;}"#;

struct Source {
    store: Arc<MemoryInstallation>,
    root: EntityId,
    intro: EntityId,
    advanced: EntityId,
    record: EntityId,
}

fn course_type() -> EntityType {
    EntityType::Other("course".into())
}

fn new_entity(entity_type: EntityType, title: &str, content: &str, parent: Option<EntityId>) -> NewEntity {
    NewEntity {
        entity_type,
        title: title.into(),
        content: content.into(),
        status: "publish".into(),
        slug: title.to_lowercase(),
        parent_id: parent,
        reference_url: String::new(),
        extra: BTreeMap::new(),
    }
}

async fn source_site() -> Source {
    let store = Arc::new(MemoryInstallation::new(Url::parse("https://old.example").unwrap()));
    store.register_taxonomy(&EntityType::PostTypeDefinition, "course_category");
    store.add_term("course_category", "stem", "STEM");
    store.add_term("course_category", "arts", "Arts");
    store.register_taxonomy(&EntityType::Product, "product_cat");

    let root = store
        .create(new_entity(EntityType::PostTypeDefinition, "Courses", COURSE_DEFINITION, None))
        .await
        .unwrap();
    let intro = store
        .create(new_entity(course_type(), "Intro", "", None))
        .await
        .unwrap();
    let advanced = store
        .create(new_entity(course_type(), "Advanced", "", Some(intro)))
        .await
        .unwrap();

    store
        .set_metadata(root, "featured_course", &[intro.to_string()])
        .await
        .unwrap();
    store
        .set_metadata(root, "archive_label", &["All courses".to_string()])
        .await
        .unwrap();
    store
        .set_metadata(advanced, "prerequisite", &[intro.to_string()])
        .await
        .unwrap();
    store
        .set_taxonomy_terms(root, "course_category", &["stem".into(), "arts".into()], false)
        .await
        .unwrap();

    let group = store
        .import_field_group(&FieldGroupDef {
            id: None,
            key: "group_course".into(),
            title: "Course details".into(),
            settings: json!({"position": "normal"}).as_object().cloned().unwrap(),
        })
        .await
        .unwrap();
    store
        .update_field(&FieldDef {
            id: None,
            key: "field_duration".into(),
            label: "Duration".into(),
            name: "duration".into(),
            field_type: "number".into(),
            parent: Some(ParentRef::Id(group.0)),
            config: Map::new(),
        })
        .await
        .unwrap();

    let record = store
        .create_simple_record("Courses", Some("COURSE-1"), Some("10"))
        .await
        .unwrap();
    store
        .set_record_metadata(record, "_stock_status", &["instock".to_string()])
        .await
        .unwrap();
    store
        .set_record_terms(record, "product_cat", &["education".to_string()])
        .await
        .unwrap();

    Source {
        store,
        root,
        intro,
        advanced,
        record,
    }
}

/// A target whose id sequence is ahead of the source's
async fn target_site() -> Arc<MemoryInstallation> {
    let store = Arc::new(MemoryInstallation::new(Url::parse("https://new.example").unwrap()));
    for i in 0..10 {
        store
            .create(new_entity(EntityType::Other("page".into()), &format!("Page {}", i), "", None))
            .await
            .unwrap();
    }
    store.register_taxonomy(&EntityType::PostTypeDefinition, "course_category");
    store.add_term("course_category", "stem", "STEM");
    store
}

async fn export(source: &Source) -> Vec<u8> {
    let builder = SnapshotBuilder::new(source.store.clone())
        .with_schema(Some(source.store.clone()))
        .with_catalog(Some(source.store.clone()));
    builder.build(source.root).await.unwrap().to_pretty_json().unwrap()
}

async fn import(target: &Arc<MemoryInstallation>, bytes: &[u8]) -> MaterializeReport {
    let materializer = Materializer::new(target.clone(), target.site_url().clone())
        .with_schema(Some(target.clone()))
        .with_catalog(Some(target.clone()));
    materializer.materialize_bytes(bytes).await.unwrap()
}

fn new_id(report: &MaterializeReport, old: EntityId) -> EntityId {
    report
        .id_map
        .iter()
        .find(|pair| pair.old_id == old)
        .map(|pair| pair.new_id)
        .unwrap()
}

#[tokio::test]
async fn test_snapshot_document_survives_json() {
    let source = source_site().await;
    let bytes = export(&source).await;

    let doc = SnapshotDocument::from_slice(&bytes).unwrap();
    assert_eq!(doc.entity.title, "Courses");
    assert_eq!(doc.related_entities.len(), 2);
    assert_eq!(doc.schema_field_groups.len(), 1);
    assert_eq!(doc.schema_field_groups[0].fields.len(), 1);
    assert_eq!(doc.catalog_records.len(), 1);
    assert_eq!(doc.taxonomies.get("course_category").unwrap(), ["stem", "arts"]);

    let again = SnapshotDocument::from_slice(&doc.to_pretty_json().unwrap()).unwrap();
    assert_eq!(again, doc);
}

#[tokio::test]
async fn test_first_import_rebuilds_the_graph() {
    let source = source_site().await;
    let target = target_site().await;
    let report = import(&target, &export(&source).await).await;

    assert!(report.is_done());
    assert!(report.skipped.is_empty());
    assert_eq!(report.created_ids().len(), 3);
    assert_eq!(target.entity_count(), 13);

    let root = new_id(&report, source.root);
    let intro = new_id(&report, source.intro);
    let advanced = new_id(&report, source.advanced);
    assert_ne!(root, source.root);

    // Cross references point at the new ids
    let advanced_entity = target.get(advanced).await.unwrap().unwrap();
    assert_eq!(advanced_entity.parent_id, Some(intro));
    let root_meta = target.get_metadata(root).await.unwrap();
    assert_eq!(root_meta.get("featured_course").unwrap(), [intro.to_string()]);
    let advanced_meta = target.get_metadata(advanced).await.unwrap();
    assert_eq!(advanced_meta.get("prerequisite").unwrap(), [intro.to_string()]);

    // The import tag keeps the source id
    assert_eq!(root_meta.first("_import_unique_key"), Some(source.root.to_string().as_str()));

    // Reference URLs move to this site
    let root_entity = target.get(root).await.unwrap().unwrap();
    assert_eq!(root_entity.reference_url, format!("https://new.example/?p={}", root));

    // Only terms known here are assigned
    assert_eq!(target.get_taxonomy_terms(root, "course_category").await.unwrap(), ["stem"]);

    // Fields are repointed at the group key
    assert_eq!(target.field_group_count(), 1);
    let field = target.get_field("field_duration").await.unwrap().unwrap();
    assert_eq!(field.parent, Some(ParentRef::Key("group_course".into())));

    let record = target.find_by_sku("COURSE-1").await.unwrap().unwrap();
    assert_eq!(record.price.as_deref(), Some("10"));
    assert_eq!(target.record_terms(record.id, "product_cat").await.unwrap(), ["education"]);
    assert_eq!(
        target.record_metadata(record.id).await.unwrap().first("_stock_status"),
        Some("instock")
    );
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let source = source_site().await;
    let target = target_site().await;
    let bytes = export(&source).await;

    let first = import(&target, &bytes).await;
    let root = new_id(&first, source.root);
    let intro = new_id(&first, source.intro);
    let url_before = target.get(root).await.unwrap().unwrap().reference_url;

    let second = import(&target, &bytes).await;

    assert!(second.is_done());
    assert!(second.created_ids().is_empty());
    assert_eq!(second.id_map, first.id_map);
    assert_eq!(target.entity_count(), 13);
    assert_eq!(target.record_count(), 1);
    assert_eq!(target.field_count(), 1);

    assert_eq!(second.writes.metadata_keys, 0);
    assert_eq!(second.writes.taxonomy_terms, 0);
    assert_eq!(second.writes.references_fixed, 0);
    assert_eq!(second.writes.schema_writes(), 0);
    assert_eq!(second.writes.records_created, 0);
    assert_eq!(second.writes.records_updated, 0);

    // Stored references stay where the first run put them
    let root_meta = target.get_metadata(root).await.unwrap();
    assert_eq!(root_meta.get("featured_course").unwrap(), [intro.to_string()]);
    assert_eq!(target.get(root).await.unwrap().unwrap().reference_url, url_before);
}

#[tokio::test]
async fn test_existing_metadata_is_never_overwritten() {
    let source = source_site().await;
    let target = target_site().await;
    let bytes = export(&source).await;

    let first = import(&target, &bytes).await;
    let root = new_id(&first, source.root);
    target
        .set_metadata(root, "archive_label", &["Local label".to_string()])
        .await
        .unwrap();

    import(&target, &bytes).await;

    let meta = target.get_metadata(root).await.unwrap();
    assert_eq!(meta.get("archive_label").unwrap(), ["Local label"]);
}

#[tokio::test]
async fn test_changed_catalog_price_is_applied() {
    let source = source_site().await;
    let target = target_site().await;
    import(&target, &export(&source).await).await;

    source
        .store
        .update_record(
            source.record,
            &CatalogRecordData {
                price: Some("12".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = import(&target, &export(&source).await).await;

    assert_eq!(report.writes.records_updated, 1);
    assert_eq!(report.writes.records_created, 0);
    assert_eq!(target.record_count(), 1);
    let record = target.find_by_sku("COURSE-1").await.unwrap().unwrap();
    assert_eq!(record.price.as_deref(), Some("12"));
}

#[tokio::test]
async fn test_changed_field_is_merged_by_key() {
    let source = source_site().await;
    let target = target_site().await;
    import(&target, &export(&source).await).await;
    let before = target.get_field("field_duration").await.unwrap().unwrap();

    let mut field = source.store.get_field("field_duration").await.unwrap().unwrap();
    field.label = "Duration (weeks)".into();
    source.store.update_field(&field).await.unwrap();

    let report = import(&target, &export(&source).await).await;

    assert_eq!(report.writes.fields_updated, 1);
    assert_eq!(report.writes.fields_created, 0);
    assert_eq!(report.writes.field_groups_updated, 0);
    assert_eq!(target.field_count(), 1);

    let after = target.get_field("field_duration").await.unwrap().unwrap();
    assert_eq!(after.label, "Duration (weeks)");
    assert_eq!(after.id, before.id);
    assert_eq!(after.parent, Some(ParentRef::Key("group_course".into())));
}

#[tokio::test]
async fn test_imported_root_exports_again() {
    let source = source_site().await;
    let target = target_site().await;
    let report = import(&target, &export(&source).await).await;
    let root = new_id(&report, source.root);

    let doc = SnapshotBuilder::new(target.clone())
        .with_schema(Some(target.clone()))
        .with_catalog(Some(target.clone()))
        .build(root)
        .await
        .unwrap();

    assert_eq!(doc.entity.id, Some(root));
    assert_eq!(doc.entity.title, "Courses");
    let mut titles: Vec<_> = doc.related_entities.iter().map(|r| r.entity.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, ["Advanced", "Intro"]);
    assert_eq!(doc.catalog_records.len(), 1);
}
