//! Field group and field merging
//!
//! Groups are matched by title, fields by key. A match is rewritten only
//! when one of the incoming top-level settings differs from what is
//! stored, so re-importing an unchanged snapshot writes nothing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::report::{ItemKind, MaterializeReport};
use crate::errors::Result;
use crate::snapshot::{FieldDef, FieldGroupBundle, FieldGroupDef, ParentRef};
use crate::store::SchemaProvider;

/// Key excluded from comparison and kept from the stored side on merge
const ID_KEY: &str = "ID";

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}

/// Whether any top-level setting of `incoming` differs from `existing`
pub fn shallow_differs<T: Serialize>(existing: &T, incoming: &T) -> Result<bool> {
    let existing = to_object(existing)?;
    let incoming = to_object(incoming)?;
    Ok(incoming
        .iter()
        .filter(|(key, _)| key.as_str() != ID_KEY)
        .any(|(key, value)| existing.get(key) != Some(value)))
}

/// `existing` with every top-level setting of `incoming` laid over it
///
/// The stored id survives the merge.
pub fn shallow_merge<T: Serialize + DeserializeOwned>(existing: &T, incoming: &T) -> Result<T> {
    let mut merged = to_object(existing)?;
    let stored_id = merged.get(ID_KEY).cloned();

    for (key, value) in to_object(incoming)? {
        if key != ID_KEY {
            merged.insert(key, value);
        }
    }
    match stored_id {
        Some(id) => {
            merged.insert(ID_KEY.to_string(), id);
        }
        None => {
            merged.remove(ID_KEY);
        }
    }

    Ok(serde_json::from_value(Value::Object(merged))?)
}

/// Stage F body: merge every bundle, skipping the ones that fail
pub(crate) async fn merge_field_groups(
    schema: &dyn SchemaProvider,
    bundles: &[FieldGroupBundle],
    report: &mut MaterializeReport,
) -> Result<()> {
    for bundle in bundles {
        let group = &bundle.field_group;
        let group_key = match merge_group(schema, group, report).await {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %group.key, title = %group.title, error = %e, "Skipping field group");
                report.skip(ItemKind::FieldGroup, group.key.clone(), e);
                continue;
            }
        };

        for field in &bundle.fields {
            if let Err(e) = merge_field(schema, field, &group_key, report).await {
                warn!(key = %field.key, group = %group_key, error = %e, "Skipping field");
                report.skip(ItemKind::Field, field.key.clone(), e);
            }
        }
    }
    Ok(())
}

/// Merge or create one group and return the key its fields should point at
async fn merge_group(
    schema: &dyn SchemaProvider,
    incoming: &FieldGroupDef,
    report: &mut MaterializeReport,
) -> Result<String> {
    let existing = schema
        .list_field_groups()
        .await?
        .into_iter()
        .find(|g| g.title == incoming.title);

    match existing {
        Some(existing) => {
            if shallow_differs(&existing, incoming)? {
                let merged = shallow_merge(&existing, incoming)?;
                schema.update_field_group(&merged).await?;
                report.writes.field_groups_updated += 1;
                debug!(key = %merged.key, "Field group updated");
                Ok(merged.key)
            } else {
                debug!(key = %existing.key, "Field group unchanged");
                Ok(existing.key)
            }
        }
        None => {
            let mut fresh = incoming.clone();
            fresh.id = None;
            let id = schema.import_field_group(&fresh).await?;
            report.writes.field_groups_created += 1;
            debug!(key = %fresh.key, id = %id, "Field group created");
            Ok(fresh.key)
        }
    }
}

async fn merge_field(
    schema: &dyn SchemaProvider,
    incoming: &FieldDef,
    group_key: &str,
    report: &mut MaterializeReport,
) -> Result<()> {
    // Point the field at the group as it exists here before comparing
    let mut field = incoming.clone();
    field.id = None;
    field.parent = Some(ParentRef::Key(group_key.to_string()));

    match schema.get_field(&field.key).await? {
        Some(existing) => {
            if shallow_differs(&existing, &field)? {
                let merged = shallow_merge(&existing, &field)?;
                schema.update_field(&merged).await?;
                report.writes.fields_updated += 1;
                debug!(key = %field.key, "Field updated");
            }
        }
        None => {
            schema.update_field(&field).await?;
            report.writes.fields_created += 1;
            debug!(key = %field.key, "Field created");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EntityId;
    use serde_json::json;

    fn group(id: Option<u64>, key: &str, settings: Value) -> FieldGroupDef {
        FieldGroupDef {
            id: id.map(EntityId),
            key: key.into(),
            title: "Course".into(),
            settings: settings.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_id_is_ignored_in_comparison() {
        let stored = group(Some(5), "group_a", json!({"position": "normal"}));
        let incoming = group(Some(900), "group_a", json!({"position": "normal"}));
        assert!(!shallow_differs(&stored, &incoming).unwrap());
    }

    #[test]
    fn test_only_incoming_keys_are_compared() {
        let stored = group(Some(5), "group_a", json!({"position": "normal", "local": "json"}));
        let incoming = group(None, "group_a", json!({"position": "normal"}));
        assert!(!shallow_differs(&stored, &incoming).unwrap());

        let incoming = group(None, "group_a", json!({"position": "side"}));
        assert!(shallow_differs(&stored, &incoming).unwrap());
    }

    #[test]
    fn test_merge_keeps_stored_id_and_extra_settings() {
        let stored = group(Some(5), "group_a", json!({"position": "normal", "local": "json"}));
        let incoming = group(Some(900), "group_a", json!({"position": "side"}));

        let merged = shallow_merge(&stored, &incoming).unwrap();
        assert_eq!(merged.id, Some(EntityId(5)));
        assert_eq!(merged.settings["position"], "side");
        assert_eq!(merged.settings["local"], "json");
    }

    #[test]
    fn test_merge_is_stable() {
        let stored = group(Some(5), "group_a", json!({"position": "normal"}));
        let incoming = group(None, "group_a", json!({"position": "side"}));
        let merged = shallow_merge(&stored, &incoming).unwrap();
        assert!(!shallow_differs(&merged, &incoming).unwrap());
    }
}
