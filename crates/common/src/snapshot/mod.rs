//! Snapshot document schema
//!
//! The snapshot is the self-contained transfer artifact. Its JSON layout
//! (`post`, `meta`, `taxonomies`, `acf_field_groups`,
//! `woocommerce_products`, `related_posts`) is fixed by compatibility with
//! files produced by existing installations.

pub mod content;
pub mod php;
mod wire;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{AppError, Result};

/// Installation-local numeric entity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(EntityId)
    }
}

/// Entity type tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    /// Post type definition (content is a PHP-serialized settings array)
    PostTypeDefinition,
    /// Custom post type definition (content is a JSON settings object)
    CustomPostTypeDefinition,
    FieldGroup,
    Product,
    /// Any other content type, e.g. the type a definition describes
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::PostTypeDefinition => "acf-post-type",
            EntityType::CustomPostTypeDefinition => "acf-custom-post-type",
            EntityType::FieldGroup => "acf-field-group",
            EntityType::Product => "product",
            EntityType::Other(name) => name,
        }
    }

    /// Types that may be the root of an export
    pub fn is_transferable(&self) -> bool {
        matches!(
            self,
            EntityType::PostTypeDefinition | EntityType::CustomPostTypeDefinition
        )
    }

    pub fn transferable() -> [EntityType; 2] {
        [
            EntityType::PostTypeDefinition,
            EntityType::CustomPostTypeDefinition,
        ]
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "acf-post-type" => EntityType::PostTypeDefinition,
            "acf-custom-post-type" => EntityType::CustomPostTypeDefinition,
            "acf-field-group" => EntityType::FieldGroup,
            "product" => EntityType::Product,
            _ => EntityType::Other(s),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        EntityType::from(s.to_string())
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_status() -> String {
    "publish".to_string()
}

/// An entity as it appears on the wire (`post`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "ID", default, with = "wire::optional_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,

    #[serde(rename = "post_type")]
    pub entity_type: EntityType,

    #[serde(rename = "post_title", deserialize_with = "wire::text::deserialize")]
    pub title: String,

    #[serde(rename = "post_content", default, deserialize_with = "wire::text::deserialize")]
    pub content: String,

    #[serde(rename = "post_status", default = "default_status")]
    pub status: String,

    #[serde(rename = "post_name", default, deserialize_with = "wire::text::deserialize")]
    pub slug: String,

    #[serde(rename = "post_parent", default, with = "wire::parent_id")]
    pub parent_id: Option<EntityId>,

    #[serde(rename = "guid", default)]
    pub reference_url: String,

    /// Remaining columns, carried through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Ordered multimap of metadata key to serialized values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key`
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into(), values);
    }

    /// Append one value to `key`
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        wire::map_from_value(value, wire::scalar_list)
            .map(Metadata)
            .map_err(serde::de::Error::custom)
    }
}

impl FromIterator<(String, Vec<String>)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

/// Taxonomy name to assigned term slugs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TaxonomyAssignments(BTreeMap<String, Vec<String>>);

impl TaxonomyAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, taxonomy: impl Into<String>, slugs: Vec<String>) {
        self.0.insert(taxonomy.into(), slugs);
    }

    pub fn get(&self, taxonomy: &str) -> Option<&[String]> {
        self.0.get(taxonomy).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for TaxonomyAssignments {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        wire::map_from_value(value, wire::scalar_list)
            .map(TaxonomyAssignments)
            .map_err(serde::de::Error::custom)
    }
}

/// Link from a field to the group that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParentRef {
    Id(u64),
    Key(String),
}

impl ParentRef {
    /// Whether this reference points at `group`, by id or by key
    pub fn refers_to(&self, group: &FieldGroupDef) -> bool {
        match self {
            ParentRef::Id(id) => group.id.map(|g| g.0) == Some(*id),
            ParentRef::Key(key) => {
                *key == group.key || group.id.map(|g| g.to_string()).as_deref() == Some(key.as_str())
            }
        }
    }
}

/// Schema field group definition, identified by `key`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroupDef {
    #[serde(rename = "ID", default, with = "wire::optional_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,

    pub key: String,

    #[serde(default)]
    pub title: String,

    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

/// Schema field definition, identified by `key`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "ID", default, with = "wire::optional_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,

    pub key: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub field_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,

    #[serde(flatten)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroupBundle {
    pub field_group: FieldGroupDef,

    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

/// Catalog record fields as exported (`product`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecordData {
    #[serde(default, with = "wire::optional_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,

    #[serde(default, deserialize_with = "wire::text::deserialize")]
    pub name: String,

    #[serde(default, with = "wire::optional_text", skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,

    #[serde(default, with = "wire::optional_text", skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogBundle {
    pub product: CatalogRecordData,

    #[serde(default)]
    pub meta: Metadata,

    #[serde(default)]
    pub taxonomies: TaxonomyAssignments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntity {
    #[serde(rename = "post")]
    pub entity: EntityRecord,

    #[serde(rename = "meta", default)]
    pub metadata: Metadata,
}

/// The transfer artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    #[serde(rename = "post")]
    pub entity: EntityRecord,

    #[serde(rename = "meta", default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub taxonomies: TaxonomyAssignments,

    #[serde(rename = "acf_field_groups", default)]
    pub schema_field_groups: Vec<FieldGroupBundle>,

    #[serde(rename = "woocommerce_products", default)]
    pub catalog_records: Vec<CatalogBundle>,

    #[serde(rename = "related_posts", default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<RelatedEntity>,

    /// Metadata keys the exporter declared as holding entity ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_meta_keys: Vec<String>,
}

impl SnapshotDocument {
    /// Parse and validate an uploaded snapshot
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let doc: SnapshotDocument = serde_json::from_slice(bytes).map_err(|e| AppError::Parse {
            message: e.to_string(),
        })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Pretty-printed JSON, as offered for download
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(Into::into)
    }

    /// Schema checks that must pass before any write happens
    pub fn validate(&self) -> Result<()> {
        if !self.entity.entity_type.is_transferable() {
            return Err(parse_error(format!(
                "post.post_type '{}' is not a transferable type",
                self.entity.entity_type
            )));
        }
        if self.entity.title.trim().is_empty() {
            return Err(parse_error("post.post_title must not be empty"));
        }

        for (i, related) in self.related_entities.iter().enumerate() {
            if related.entity.title.trim().is_empty() {
                return Err(parse_error(format!("related_posts[{}].post.post_title must not be empty", i)));
            }
        }

        for (i, bundle) in self.schema_field_groups.iter().enumerate() {
            if bundle.field_group.key.is_empty() {
                return Err(parse_error(format!("acf_field_groups[{}].field_group.key must not be empty", i)));
            }
            if let Some(j) = bundle.fields.iter().position(|f| f.key.is_empty()) {
                return Err(parse_error(format!("acf_field_groups[{}].fields[{}].key must not be empty", i, j)));
            }
        }

        for (i, bundle) in self.catalog_records.iter().enumerate() {
            if bundle.product.name.is_empty() && bundle.product.sku.is_none() {
                return Err(parse_error(format!(
                    "woocommerce_products[{}].product needs a name or a sku",
                    i
                )));
            }
        }

        Ok(())
    }
}

fn parse_error(message: impl Into<String>) -> AppError {
    AppError::Parse {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn php_export() -> Value {
        json!({
            "post": {
                "ID": 42,
                "post_author": "1",
                "post_title": "Course",
                "post_content": "a:1:{s:9:\"post_type\";s:6:\"course\";}",
                "post_status": "publish",
                "post_name": "course",
                "post_parent": 0,
                "guid": "https://old.example/?p=42",
                "post_type": "acf-post-type",
                "comment_count": "0"
            },
            "meta": { "_edit_lock": ["1700000000:1"], "labels": ["a:0:{}"] },
            "taxonomies": [],
            "acf_field_groups": [],
            "woocommerce_products": []
        })
    }

    #[test]
    fn test_parses_php_export() {
        let bytes = serde_json::to_vec(&php_export()).unwrap();
        let doc = SnapshotDocument::from_slice(&bytes).unwrap();

        assert_eq!(doc.entity.id, Some(EntityId(42)));
        assert_eq!(doc.entity.entity_type, EntityType::PostTypeDefinition);
        assert_eq!(doc.entity.parent_id, None);
        assert_eq!(doc.entity.extra.get("post_author"), Some(&json!("1")));
        assert_eq!(doc.metadata.first("_edit_lock"), Some("1700000000:1"));
        assert!(doc.taxonomies.is_empty());
        assert!(doc.related_entities.is_empty());
    }

    #[test]
    fn test_serializes_with_wire_names() {
        let bytes = serde_json::to_vec(&php_export()).unwrap();
        let doc = SnapshotDocument::from_slice(&bytes).unwrap();
        let value: Value = serde_json::from_slice(&doc.to_pretty_json().unwrap()).unwrap();

        assert_eq!(value["post"]["ID"], 42);
        assert_eq!(value["post"]["post_parent"], 0);
        assert_eq!(value["post"]["comment_count"], "0");
        assert!(value.get("acf_field_groups").is_some());
        assert!(value.get("woocommerce_products").is_some());
        assert!(value.get("related_posts").is_none());
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = SnapshotDocument::from_slice(b"{\"post\": ").unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[test]
    fn test_missing_post_is_parse_error() {
        let err = SnapshotDocument::from_slice(b"{\"meta\": {}}").unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[test]
    fn test_non_transferable_root_rejected() {
        let mut value = php_export();
        value["post"]["post_type"] = json!("page");
        let err = SnapshotDocument::from_slice(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("not a transferable type"));
    }

    #[test]
    fn test_catalog_record_quirks() {
        let mut value = php_export();
        value["woocommerce_products"] = json!([{
            "product": { "id": "17", "name": "Course", "sku": "", "price": 12.5, "status": "publish" },
            "meta": { "_price": ["12.5"] },
            "taxonomies": { "product_cat": ["courses"] }
        }]);
        let doc = SnapshotDocument::from_slice(&serde_json::to_vec(&value).unwrap()).unwrap();
        let product = &doc.catalog_records[0].product;

        assert_eq!(product.id, Some(EntityId(17)));
        assert_eq!(product.sku, None);
        assert_eq!(product.price.as_deref(), Some("12.5"));
        assert_eq!(product.extra.get("status"), Some(&json!("publish")));
        assert_eq!(doc.catalog_records[0].taxonomies.get("product_cat").unwrap(), ["courses"]);
    }

    #[test]
    fn test_field_parent_ref_matches_id_or_key() {
        let group = FieldGroupDef {
            id: Some(EntityId(5)),
            key: "group_abc".into(),
            title: "Course fields".into(),
            settings: Map::new(),
        };
        assert!(ParentRef::Id(5).refers_to(&group));
        assert!(ParentRef::Key("5".into()).refers_to(&group));
        assert!(ParentRef::Key("group_abc".into()).refers_to(&group));
        assert!(!ParentRef::Key("group_other".into()).refers_to(&group));
    }
}
