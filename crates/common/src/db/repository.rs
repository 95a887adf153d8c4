//! Repository pattern for database operations
//!
//! Implements the installation collaborator traits over PostgreSQL.
//! Multi-row rewrites (metadata replacement, term replacement) run in a
//! transaction.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    DbBackend, EntityTrait, NotSet, PaginatorTrait, QueryFilter, QueryOrder, Set, Statement,
    TransactionTrait,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use url::Url;

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::snapshot::{CatalogRecordData, EntityId, EntityType, FieldDef, FieldGroupDef, Metadata};
use crate::store::{
    check_raw_update, CatalogRecord, CatalogStore, Entity, EntityPatch, EntityStore, NewEntity,
    SchemaProvider, Term,
};

fn db_id(id: EntityId) -> i64 {
    id.0 as i64
}

fn entity_id(id: i64) -> EntityId {
    EntityId(id as u64)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn entity_from_row(row: EntityRow) -> Entity {
    Entity {
        id: entity_id(row.id),
        entity_type: EntityType::from(row.entity_type),
        title: row.title,
        content: row.content,
        status: row.status,
        slug: row.slug,
        parent_id: row.parent_id.filter(|p| *p > 0).map(entity_id),
        reference_url: row.reference_url,
        extra: object(row.extra).into_iter().collect(),
    }
}

fn term_from_row(row: TermRow) -> Term {
    Term {
        id: row.id as u64,
        taxonomy: row.taxonomy,
        slug: row.slug,
        name: row.name,
    }
}

fn group_from_row(row: FieldGroupRow) -> FieldGroupDef {
    FieldGroupDef {
        id: Some(entity_id(row.id)),
        key: row.key,
        title: row.title,
        settings: object(row.settings),
    }
}

fn field_from_row(row: FieldRow) -> Result<FieldDef> {
    Ok(FieldDef {
        id: Some(entity_id(row.id)),
        key: row.key,
        label: row.label,
        name: row.name,
        field_type: row.field_type,
        parent: row.parent.map(serde_json::from_value).transpose()?,
        config: object(row.config),
    })
}

fn record_from_row(row: CatalogRecordRow) -> CatalogRecord {
    CatalogRecord {
        id: entity_id(row.id),
        name: row.name,
        sku: row.sku,
        price: row.price,
        extra: object(row.extra),
    }
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
    site_url: Url,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool, site_url: Url) -> Self {
        Self { pool, site_url }
    }

    /// Connection for everything a transfer touches; it reads its own writes
    fn conn(&self) -> &DatabaseConnection {
        self.pool.primary()
    }

    /// Connection for listings that tolerate replica lag
    fn listing_conn(&self) -> &DatabaseConnection {
        self.pool.listing()
    }

    async fn begin(&self) -> Result<DatabaseTransaction> {
        self.conn().begin().await.map_err(Into::into)
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Installation setup
    // ========================================================================

    /// Register `taxonomy` for `entity_type`; registering twice is a no-op
    pub async fn register_taxonomy(&self, entity_type: &EntityType, taxonomy: &str) -> Result<()> {
        let exists = TaxonomyEntity::find()
            .filter(TaxonomyColumn::EntityType.eq(entity_type.as_str()))
            .filter(TaxonomyColumn::Name.eq(taxonomy))
            .count(self.conn())
            .await?
            > 0;
        if !exists {
            TaxonomyActiveModel {
                id: NotSet,
                entity_type: Set(entity_type.as_str().to_string()),
                name: Set(taxonomy.to_string()),
            }
            .insert(self.conn())
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    async fn entity_row(&self, id: EntityId) -> Result<EntityRow> {
        EntityEntity::find_by_id(db_id(id))
            .one(self.conn())
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "entity".to_string(),
                id: id.to_string(),
            })
    }

    async fn record_row(&self, id: EntityId) -> Result<CatalogRecordRow> {
        CatalogRecordEntity::find_by_id(db_id(id))
            .one(self.conn())
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "catalog_record".to_string(),
                id: id.to_string(),
            })
    }

    async fn taxonomy_names(&self, entity_type: &EntityType) -> Result<Vec<String>> {
        Ok(TaxonomyEntity::find()
            .filter(TaxonomyColumn::EntityType.eq(entity_type.as_str()))
            .order_by_asc(TaxonomyColumn::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    async fn assigned_terms<C: ConnectionTrait>(conn: &C, object_id: i64, taxonomy: &str) -> Result<Vec<TermRow>> {
        TermEntity::find()
            .inner_join(TermAssignmentEntity)
            .filter(TermAssignmentColumn::ObjectId.eq(object_id))
            .filter(TermColumn::Taxonomy.eq(taxonomy))
            .order_by_asc(TermColumn::Id)
            .all(conn)
            .await
            .map_err(Into::into)
    }

    /// Assign `terms` to `object_id`, dropping the taxonomy's other terms unless appending
    async fn assign_terms(&self, object_id: i64, taxonomy: &str, terms: &[TermRow], append: bool) -> Result<()> {
        let txn = self.begin().await?;
        let current = Self::assigned_terms(&txn, object_id, taxonomy).await?;

        if !append {
            let stale: Vec<i64> = current
                .iter()
                .filter(|c| !terms.iter().any(|t| t.id == c.id))
                .map(|c| c.id)
                .collect();
            if !stale.is_empty() {
                TermAssignmentEntity::delete_many()
                    .filter(TermAssignmentColumn::ObjectId.eq(object_id))
                    .filter(TermAssignmentColumn::TermId.is_in(stale))
                    .exec(&txn)
                    .await?;
            }
        }

        let fresh: Vec<TermAssignmentActiveModel> = terms
            .iter()
            .filter(|t| !current.iter().any(|c| c.id == t.id))
            .map(|t| TermAssignmentActiveModel {
                object_id: Set(object_id),
                term_id: Set(t.id),
            })
            .collect();
        if !fresh.is_empty() {
            TermAssignmentEntity::insert_many(fresh).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn terms_by_slug(&self, taxonomy: &str, slugs: &[String]) -> Result<Vec<TermRow>> {
        if slugs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(TermEntity::find()
            .filter(TermColumn::Taxonomy.eq(taxonomy))
            .filter(TermColumn::Slug.is_in(slugs.iter().cloned()))
            .order_by_asc(TermColumn::Id)
            .all(self.conn())
            .await?)
    }

    async fn all_fields(&self) -> Result<Vec<FieldDef>> {
        FieldEntity::find()
            .order_by_asc(FieldColumn::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(field_from_row)
            .collect()
    }
}

#[async_trait]
impl EntityStore for Repository {
    async fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(EntityEntity::find_by_id(db_id(id))
            .one(self.conn())
            .await?
            .map(entity_from_row))
    }

    async fn get_by_title(&self, title: &str, entity_type: &EntityType) -> Result<Option<Entity>> {
        Ok(EntityEntity::find()
            .filter(EntityColumn::EntityType.eq(entity_type.as_str()))
            .filter(EntityColumn::Title.eq(title))
            .order_by_asc(EntityColumn::Id)
            .one(self.conn())
            .await?
            .map(entity_from_row))
    }

    async fn list_by_type(&self, entity_type: &EntityType) -> Result<Vec<Entity>> {
        Ok(EntityEntity::find()
            .filter(EntityColumn::EntityType.eq(entity_type.as_str()))
            .order_by_asc(EntityColumn::Id)
            .all(self.listing_conn())
            .await?
            .into_iter()
            .map(entity_from_row)
            .collect())
    }

    async fn find_by_metadata(
        &self,
        entity_type: &EntityType,
        key: &str,
        value: &str,
    ) -> Result<Option<Entity>> {
        Ok(EntityEntity::find()
            .inner_join(EntityMetaEntity)
            .filter(EntityColumn::EntityType.eq(entity_type.as_str()))
            .filter(EntityMetaColumn::MetaKey.eq(key))
            .filter(EntityMetaColumn::MetaValue.eq(value))
            .order_by_asc(EntityColumn::Id)
            .one(self.conn())
            .await?
            .map(entity_from_row))
    }

    async fn create(&self, fields: NewEntity) -> Result<EntityId> {
        let now = chrono::Utc::now();
        let row = EntityActiveModel {
            id: NotSet,
            entity_type: Set(fields.entity_type.as_str().to_string()),
            title: Set(fields.title),
            content: Set(fields.content),
            status: Set(fields.status),
            slug: Set(fields.slug),
            parent_id: Set(fields.parent_id.map(db_id)),
            reference_url: Set(fields.reference_url.clone()),
            extra: Set(Value::Object(fields.extra.into_iter().collect())),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(self.conn())
        .await?;

        let id = entity_id(row.id);
        if fields.reference_url.is_empty() {
            let url = format!("{}/?p={}", self.site_url.as_str().trim_end_matches('/'), id);
            let mut active: EntityActiveModel = row.into();
            active.reference_url = Set(url);
            active.update(self.conn()).await?;
        }
        Ok(id)
    }

    async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<()> {
        let mut active: EntityActiveModel = self.entity_row(id).await?.into();
        if let Some(title) = patch.title {
            active.title = Set(title);
        }
        if let Some(content) = patch.content {
            active.content = Set(content);
        }
        if let Some(status) = patch.status {
            active.status = Set(status);
        }
        if let Some(parent_id) = patch.parent_id {
            active.parent_id = Set(parent_id.map(db_id));
        }
        active.updated_at = Set(chrono::Utc::now().into());
        active.update(self.conn()).await?;
        Ok(())
    }

    async fn get_metadata(&self, id: EntityId) -> Result<Metadata> {
        let rows = EntityMetaEntity::find()
            .filter(EntityMetaColumn::EntityId.eq(db_id(id)))
            .order_by_asc(EntityMetaColumn::Id)
            .all(self.conn())
            .await?;

        let mut metadata = Metadata::new();
        for row in rows {
            metadata.push(row.meta_key, row.meta_value);
        }
        Ok(metadata)
    }

    async fn has_metadata_key(&self, id: EntityId, key: &str) -> Result<bool> {
        let count = EntityMetaEntity::find()
            .filter(EntityMetaColumn::EntityId.eq(db_id(id)))
            .filter(EntityMetaColumn::MetaKey.eq(key))
            .count(self.conn())
            .await?;
        Ok(count > 0)
    }

    async fn set_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()> {
        let txn = self.begin().await?;
        EntityMetaEntity::delete_many()
            .filter(EntityMetaColumn::EntityId.eq(db_id(id)))
            .filter(EntityMetaColumn::MetaKey.eq(key))
            .exec(&txn)
            .await?;

        let rows: Vec<EntityMetaActiveModel> = values
            .iter()
            .map(|value| EntityMetaActiveModel {
                id: NotSet,
                entity_id: Set(db_id(id)),
                meta_key: Set(key.to_string()),
                meta_value: Set(value.clone()),
            })
            .collect();
        if !rows.is_empty() {
            EntityMetaEntity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn add_metadata(&self, id: EntityId, key: &str, value: &str) -> Result<()> {
        EntityMetaActiveModel {
            id: NotSet,
            entity_id: Set(db_id(id)),
            meta_key: Set(key.to_string()),
            meta_value: Set(value.to_string()),
        }
        .insert(self.conn())
        .await?;
        Ok(())
    }

    async fn taxonomies_for(&self, entity_type: &EntityType) -> Result<Vec<String>> {
        self.taxonomy_names(entity_type).await
    }

    async fn get_taxonomy_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>> {
        Ok(Self::assigned_terms(self.conn(), db_id(id), taxonomy)
            .await?
            .into_iter()
            .map(|t| t.slug)
            .collect())
    }

    async fn find_term(&self, taxonomy: &str, slug: &str) -> Result<Option<Term>> {
        Ok(TermEntity::find()
            .filter(TermColumn::Taxonomy.eq(taxonomy))
            .filter(TermColumn::Slug.eq(slug))
            .one(self.conn())
            .await?
            .map(term_from_row))
    }

    async fn set_taxonomy_terms(
        &self,
        id: EntityId,
        taxonomy: &str,
        slugs: &[String],
        append: bool,
    ) -> Result<()> {
        let terms = self.terms_by_slug(taxonomy, slugs).await?;
        self.assign_terms(db_id(id), taxonomy, &terms, append).await
    }

    async fn raw_update_field(&self, table: &str, id: EntityId, field: &str, value: &str) -> Result<()> {
        check_raw_update(table, field)?;

        // Both identifiers are from a fixed allow-list at this point
        let sql = format!("UPDATE {} SET {} = $1 WHERE id = $2", table, field);
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            &sql,
            vec![value.into(), db_id(id).into()],
        );

        let result = self.conn().execute(stmt).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource_type: "entity".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaProvider for Repository {
    async fn list_field_groups(&self) -> Result<Vec<FieldGroupDef>> {
        Ok(FieldGroupEntity::find()
            .order_by_asc(FieldGroupColumn::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(group_from_row)
            .collect())
    }

    async fn get_field_group(&self, id: EntityId) -> Result<Option<FieldGroupDef>> {
        Ok(FieldGroupEntity::find_by_id(db_id(id))
            .one(self.conn())
            .await?
            .map(group_from_row))
    }

    async fn list_fields(&self, group_key: &str) -> Result<Vec<FieldDef>> {
        let Some(group) = FieldGroupEntity::find()
            .filter(FieldGroupColumn::Key.eq(group_key))
            .order_by_asc(FieldGroupColumn::Id)
            .one(self.conn())
            .await?
            .map(group_from_row)
        else {
            return Ok(Vec::new());
        };

        Ok(self
            .all_fields()
            .await?
            .into_iter()
            .filter(|f| f.parent.as_ref().is_some_and(|p| p.refers_to(&group)))
            .collect())
    }

    async fn import_field_group(&self, def: &FieldGroupDef) -> Result<EntityId> {
        let row = FieldGroupActiveModel {
            id: NotSet,
            key: Set(def.key.clone()),
            title: Set(def.title.clone()),
            settings: Set(Value::Object(def.settings.clone())),
        }
        .insert(self.conn())
        .await?;
        Ok(entity_id(row.id))
    }

    async fn update_field_group(&self, def: &FieldGroupDef) -> Result<()> {
        let existing = match def.id {
            Some(id) => FieldGroupEntity::find_by_id(db_id(id)).one(self.conn()).await?,
            None => None,
        };
        let existing = match existing {
            Some(row) => Some(row),
            None => {
                FieldGroupEntity::find()
                    .filter(FieldGroupColumn::Key.eq(def.key.as_str()))
                    .one(self.conn())
                    .await?
            }
        };
        let row = existing.ok_or_else(|| AppError::NotFound {
            resource_type: "field_group".to_string(),
            id: def.key.clone(),
        })?;

        let mut active: FieldGroupActiveModel = row.into();
        active.key = Set(def.key.clone());
        active.title = Set(def.title.clone());
        active.settings = Set(Value::Object(def.settings.clone()));
        active.update(self.conn()).await?;
        Ok(())
    }

    async fn get_field(&self, key: &str) -> Result<Option<FieldDef>> {
        FieldEntity::find()
            .filter(FieldColumn::Key.eq(key))
            .one(self.conn())
            .await?
            .map(field_from_row)
            .transpose()
    }

    async fn update_field(&self, def: &FieldDef) -> Result<()> {
        let parent = def.parent.as_ref().map(serde_json::to_value).transpose()?;
        let existing = FieldEntity::find()
            .filter(FieldColumn::Key.eq(def.key.as_str()))
            .one(self.conn())
            .await?;

        let mut active: FieldActiveModel = match existing {
            Some(row) => row.into(),
            None => FieldActiveModel {
                id: NotSet,
                key: Set(def.key.clone()),
                ..Default::default()
            },
        };
        active.label = Set(def.label.clone());
        active.name = Set(def.name.clone());
        active.field_type = Set(def.field_type.clone());
        active.parent = Set(parent);
        active.config = Set(Value::Object(def.config.clone()));
        active.save(self.conn()).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for Repository {
    async fn search_by_name(&self, name: &str) -> Result<Vec<CatalogRecord>> {
        Ok(CatalogRecordEntity::find()
            .filter(CatalogRecordColumn::Name.contains(name))
            .order_by_asc(CatalogRecordColumn::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(record_from_row)
            .collect())
    }

    async fn find_by_sku(&self, sku: &str) -> Result<Option<CatalogRecord>> {
        Ok(CatalogRecordEntity::find()
            .filter(CatalogRecordColumn::Sku.eq(sku))
            .one(self.conn())
            .await?
            .map(record_from_row))
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<CatalogRecord>> {
        Ok(CatalogRecordEntity::find()
            .filter(CatalogRecordColumn::Name.eq(title))
            .order_by_asc(CatalogRecordColumn::Id)
            .one(self.conn())
            .await?
            .map(record_from_row))
    }

    async fn create_simple_record(
        &self,
        name: &str,
        sku: Option<&str>,
        price: Option<&str>,
    ) -> Result<EntityId> {
        let row = CatalogRecordActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
            sku: Set(sku.map(str::to_string)),
            price: Set(price.map(str::to_string)),
            extra: Set(Value::Object(Map::new())),
        }
        .insert(self.conn())
        .await?;
        Ok(entity_id(row.id))
    }

    async fn update_record(&self, id: EntityId, data: &CatalogRecordData) -> Result<()> {
        let row = self.record_row(id).await?;
        let mut record = record_from_row(row.clone());
        record.apply(data);

        let mut active: CatalogRecordActiveModel = row.into();
        active.name = Set(record.name);
        active.sku = Set(record.sku);
        active.price = Set(record.price);
        active.extra = Set(Value::Object(record.extra));
        active.update(self.conn()).await?;
        Ok(())
    }

    async fn record_metadata(&self, id: EntityId) -> Result<Metadata> {
        let rows = CatalogMetaEntity::find()
            .filter(CatalogMetaColumn::RecordId.eq(db_id(id)))
            .order_by_asc(CatalogMetaColumn::Id)
            .all(self.conn())
            .await?;

        let mut metadata = Metadata::new();
        for row in rows {
            metadata.push(row.meta_key, row.meta_value);
        }
        Ok(metadata)
    }

    async fn set_record_metadata(&self, id: EntityId, key: &str, values: &[String]) -> Result<()> {
        let txn = self.begin().await?;
        CatalogMetaEntity::delete_many()
            .filter(CatalogMetaColumn::RecordId.eq(db_id(id)))
            .filter(CatalogMetaColumn::MetaKey.eq(key))
            .exec(&txn)
            .await?;

        let rows: Vec<CatalogMetaActiveModel> = values
            .iter()
            .map(|value| CatalogMetaActiveModel {
                id: NotSet,
                record_id: Set(db_id(id)),
                meta_key: Set(key.to_string()),
                meta_value: Set(value.clone()),
            })
            .collect();
        if !rows.is_empty() {
            CatalogMetaEntity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn list_taxonomies_for(&self, record_type: &EntityType) -> Result<Vec<String>> {
        self.taxonomy_names(record_type).await
    }

    async fn record_terms(&self, id: EntityId, taxonomy: &str) -> Result<Vec<String>> {
        Ok(Self::assigned_terms(self.conn(), db_id(id), taxonomy)
            .await?
            .into_iter()
            .map(|t| t.slug)
            .collect())
    }

    async fn set_record_terms(&self, id: EntityId, taxonomy: &str, slugs: &[String]) -> Result<()> {
        self.record_row(id).await?;

        let known = self.terms_by_slug(taxonomy, slugs).await?;
        let mut missing: BTreeMap<&str, TermActiveModel> = BTreeMap::new();
        for slug in slugs {
            if !known.iter().any(|t| &t.slug == slug) {
                missing.entry(slug.as_str()).or_insert_with(|| TermActiveModel {
                    id: NotSet,
                    taxonomy: Set(taxonomy.to_string()),
                    slug: Set(slug.clone()),
                    name: Set(slug.clone()),
                });
            }
        }
        for (_, term) in missing {
            term.insert(self.conn()).await?;
        }

        let terms = self.terms_by_slug(taxonomy, slugs).await?;
        self.assign_terms(db_id(id), taxonomy, &terms, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn row(id: i64, title: &str) -> EntityRow {
        let now: sea_orm::prelude::DateTimeWithTimeZone = chrono::Utc::now().into();
        EntityRow {
            id,
            entity_type: "acf-post-type".into(),
            title: title.into(),
            content: String::new(),
            status: "publish".into(),
            slug: title.to_lowercase(),
            parent_id: None,
            reference_url: format!("https://new.example/?p={}", id),
            extra: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replica that has not caught up with the primary yet
    fn lagging_pool(primary_rows: Vec<Vec<EntityRow>>) -> DbPool {
        let primary = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(primary_rows)
            .into_connection();
        let replica = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<EntityRow>::new()])
            .into_connection();
        DbPool::from_connections(primary, Some(replica))
    }

    fn site() -> Url {
        Url::parse("https://new.example").unwrap()
    }

    #[tokio::test]
    async fn test_transfer_reads_see_fresh_rows() {
        let repo = Repository::new(lagging_pool(vec![vec![row(7, "Courses")], vec![row(7, "Courses")]]), site());

        let by_id = repo.get(EntityId(7)).await.unwrap().unwrap();
        assert_eq!(by_id.title, "Courses");

        let by_title = repo
            .get_by_title("Courses", &EntityType::PostTypeDefinition)
            .await
            .unwrap();
        assert_eq!(by_title.map(|e| e.id), Some(EntityId(7)));
    }

    #[tokio::test]
    async fn test_listing_reads_the_replica() {
        let repo = Repository::new(lagging_pool(vec![vec![row(7, "Courses")]]), site());

        let listed = repo.list_by_type(&EntityType::PostTypeDefinition).await.unwrap();
        assert!(listed.is_empty());
    }
}
