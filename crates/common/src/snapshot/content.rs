//! Decoding of nested type references stored in entity content

use serde_json::Value;

use super::php;
use super::{EntityRecord, EntityType};

/// The entity type described by a definition entity, if any
///
/// Custom post type definitions keep their settings as JSON, post type
/// definitions as a PHP-serialized array; both name the described type
/// under `post_type`. Content that does not decode carries no reference.
pub fn nested_entity_type(record: &EntityRecord) -> Option<EntityType> {
    if record.content.trim().is_empty() {
        return None;
    }

    let name = match record.entity_type {
        EntityType::CustomPostTypeDefinition => {
            let settings: Value = serde_json::from_str(&record.content).ok()?;
            settings.get("post_type")?.as_str()?.to_string()
        }
        EntityType::PostTypeDefinition => {
            let settings = php::unserialize(&record.content)?;
            settings.get("post_type")?.as_str()?.to_string()
        }
        _ => return None,
    };

    let name = name.trim();
    (!name.is_empty()).then(|| EntityType::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(entity_type: EntityType, content: &str) -> EntityRecord {
        EntityRecord {
            id: None,
            entity_type,
            title: "Courses".into(),
            content: content.into(),
            status: "publish".into(),
            slug: String::new(),
            parent_id: None,
            reference_url: String::new(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_json_definition() {
        let r = record(
            EntityType::CustomPostTypeDefinition,
            r#"{"post_type":"lesson","public":true}"#,
        );
        assert_eq!(nested_entity_type(&r), Some(EntityType::Other("lesson".into())));
    }

    #[test]
    fn test_serialized_definition() {
        let r = record(
            EntityType::PostTypeDefinition,
            r#"a:2:{s:9:"post_type";s:6:"course";s:6:"public";b:1;}"#,
        );
        assert_eq!(nested_entity_type(&r), Some(EntityType::Other("course".into())));
    }

    #[test]
    fn test_undecodable_content_has_no_reference() {
        assert_eq!(nested_entity_type(&record(EntityType::PostTypeDefinition, "plain text")), None);
        assert_eq!(nested_entity_type(&record(EntityType::CustomPostTypeDefinition, "{broken")), None);
        assert_eq!(nested_entity_type(&record(EntityType::CustomPostTypeDefinition, r#"{"post_type":""}"#)), None);
        assert_eq!(nested_entity_type(&record(EntityType::Other("page".into()), r#"{"post_type":"x"}"#)), None);
    }
}
