//! Catalog record merging

use tracing::{debug, warn};

use super::report::{ItemKind, MaterializeReport};
use crate::errors::Result;
use crate::snapshot::{CatalogBundle, EntityId};
use crate::store::{CatalogRecord, CatalogStore};

/// Stage G body: merge every bundle, skipping the ones that fail
pub(crate) async fn merge_catalog_records(
    catalog: &dyn CatalogStore,
    bundles: &[CatalogBundle],
    report: &mut MaterializeReport,
) -> Result<()> {
    for bundle in bundles {
        if let Err(e) = merge_record(catalog, bundle, report).await {
            let identifier = bundle
                .product
                .sku
                .clone()
                .unwrap_or_else(|| bundle.product.name.clone());
            warn!(record = %identifier, error = %e, "Skipping catalog record");
            report.skip(ItemKind::CatalogRecord, identifier, e);
        }
    }
    Ok(())
}

/// SKU first, then exact name
async fn find_existing(catalog: &dyn CatalogStore, bundle: &CatalogBundle) -> Result<Option<CatalogRecord>> {
    if let Some(sku) = &bundle.product.sku {
        if let Some(record) = catalog.find_by_sku(sku).await? {
            return Ok(Some(record));
        }
    }
    if bundle.product.name.is_empty() {
        return Ok(None);
    }
    catalog.find_by_title(&bundle.product.name).await
}

async fn merge_record(
    catalog: &dyn CatalogStore,
    bundle: &CatalogBundle,
    report: &mut MaterializeReport,
) -> Result<()> {
    let product = &bundle.product;

    let id: EntityId = match find_existing(catalog, bundle).await? {
        Some(existing) => {
            let mut updated = existing.clone();
            updated.apply(product);
            if updated != existing {
                catalog.update_record(existing.id, product).await?;
                report.writes.records_updated += 1;
                debug!(id = %existing.id, "Catalog record updated");
            }
            existing.id
        }
        None => {
            let id = catalog
                .create_simple_record(&product.name, product.sku.as_deref(), product.price.as_deref())
                .await?;
            report.writes.records_created += 1;
            debug!(id = %id, name = %product.name, "Catalog record created");
            id
        }
    };

    // Metadata and terms always follow the snapshot
    for (key, values) in bundle.meta.iter() {
        catalog.set_record_metadata(id, key, values).await?;
    }
    for (taxonomy, slugs) in bundle.taxonomies.iter() {
        catalog.set_record_terms(id, taxonomy, slugs).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CatalogRecordData, Metadata, TaxonomyAssignments};
    use crate::store::MemoryInstallation;
    use url::Url;

    fn bundle(name: &str, sku: Option<&str>, price: &str) -> CatalogBundle {
        let mut meta = Metadata::new();
        meta.insert("_price", vec![price.to_string()]);
        let mut taxonomies = TaxonomyAssignments::new();
        taxonomies.insert("product_cat", vec!["courses".to_string()]);
        CatalogBundle {
            product: CatalogRecordData {
                id: Some(EntityId(17)),
                name: name.into(),
                sku: sku.map(str::to_string),
                price: Some(price.into()),
                ..Default::default()
            },
            meta,
            taxonomies,
        }
    }

    fn target() -> MemoryInstallation {
        MemoryInstallation::new(Url::parse("https://new.example").unwrap())
    }

    #[tokio::test]
    async fn test_creates_minimal_record() {
        let store = target();
        let mut report = MaterializeReport::new();

        merge_catalog_records(&store, &[bundle("Rust", Some("R-1"), "10")], &mut report)
            .await
            .unwrap();

        let record = store.find_by_sku("R-1").await.unwrap().unwrap();
        assert_eq!(record.price.as_deref(), Some("10"));
        assert_eq!(store.record_metadata(record.id).await.unwrap().first("_price"), Some("10"));
        assert_eq!(store.record_terms(record.id, "product_cat").await.unwrap(), vec!["courses"]);
        assert_eq!(report.writes.records_created, 1);
    }

    #[tokio::test]
    async fn test_overwrites_price_on_sku_match() {
        let store = target();
        let id = store.create_simple_record("Old name", Some("R-1"), Some("10")).await.unwrap();
        let mut report = MaterializeReport::new();

        merge_catalog_records(&store, &[bundle("Rust", Some("R-1"), "12")], &mut report)
            .await
            .unwrap();

        let record = store.find_by_sku("R-1").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "Rust");
        assert_eq!(record.price.as_deref(), Some("12"));
        assert_eq!(store.record_metadata(id).await.unwrap().first("_price"), Some("12"));
        assert_eq!(report.writes.records_updated, 1);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_title() {
        let store = target();
        let id = store.create_simple_record("Rust", None, Some("10")).await.unwrap();
        let mut report = MaterializeReport::new();

        merge_catalog_records(&store, &[bundle("Rust", None, "10")], &mut report)
            .await
            .unwrap();

        assert_eq!(store.record_count(), 1);
        assert_eq!(report.writes.records_updated, 0);
        assert!(store.find_by_title("Rust").await.unwrap().is_some_and(|r| r.id == id));
    }

    #[tokio::test]
    async fn test_nameless_record_keeps_stored_name() {
        let store = target();
        let id = store.create_simple_record("Dup", Some("R-2"), None).await.unwrap();
        let mut report = MaterializeReport::new();

        let mut nameless = bundle("", Some("R-2"), "5");
        nameless.product.name = String::new();
        merge_catalog_records(&store, &[nameless], &mut report).await.unwrap();

        let record = store.find_by_sku("R-2").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "Dup");
        assert_eq!(record.price.as_deref(), Some("5"));
        assert!(report.skipped.is_empty());
    }
}
