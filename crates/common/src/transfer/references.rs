//! Detection and rewriting of identifier references
//!
//! Metadata values, parent links and reference URLs may carry entity ids
//! of the source installation. After the remap table is built those ids
//! are swapped for their target-installation counterparts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

use super::remap::RemapTable;
use crate::snapshot::php::{self, PhpValue};
use crate::snapshot::EntityId;

/// Query parameters that carry an entity id in a reference URL
const ID_QUERY_PARAMS: [&str; 2] = ["p", "page_id"];

/// Which metadata values count as id references
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Any value in canonical integer form, under any key
    #[default]
    Heuristic,
    /// Only values under declared keys
    Declared,
}

/// How an id candidate was encoded, so it can be written back the same way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Plain,
    SerializedInt,
    SerializedStr,
}

/// Parse `value` as an id candidate
///
/// Plain values must be the canonical decimal form of a positive integer
/// (`"42"`, not `"042"`, `" 42"` or `"42.0"`). PHP-serialized integers and
/// numeric strings are accepted too.
fn parse_candidate(value: &str) -> Option<(u64, Encoding)> {
    if let Some(id) = canonical_id(value) {
        return Some((id, Encoding::Plain));
    }
    // Only serialized scalars can be ids; arrays are never parsed here
    if !value.ends_with(';') || !(value.starts_with("i:") || value.starts_with("s:")) {
        return None;
    }
    match php::unserialize(value)? {
        PhpValue::Int(i) if i > 0 => Some((i as u64, Encoding::SerializedInt)),
        PhpValue::Str(s) => canonical_id(&s).map(|id| (id, Encoding::SerializedStr)),
        _ => None,
    }
}

fn canonical_id(value: &str) -> Option<u64> {
    let id: u64 = value.parse().ok()?;
    (id > 0 && id.to_string() == value).then_some(id)
}

fn encode(id: u64, encoding: Encoding) -> String {
    match encoding {
        Encoding::Plain => id.to_string(),
        Encoding::SerializedInt => format!("i:{};", id),
        Encoding::SerializedStr => {
            let text = id.to_string();
            format!("s:{}:\"{}\";", text.len(), text)
        }
    }
}

/// The id a value refers to, if it is a candidate under any policy
pub fn candidate_id(value: &str) -> Option<EntityId> {
    parse_candidate(value).map(|(id, _)| EntityId(id))
}

/// Applies a `ReferencePolicy` to metadata values
#[derive(Debug, Clone, Default)]
pub struct ReferenceDetector {
    policy: ReferencePolicy,
    declared_keys: BTreeSet<String>,
}

impl ReferenceDetector {
    pub fn new(policy: ReferencePolicy, declared_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            policy,
            declared_keys: declared_keys.into_iter().collect(),
        }
    }

    pub fn policy(&self) -> ReferencePolicy {
        self.policy
    }

    /// A copy of this detector that also honours `keys`
    pub fn with_declared_keys<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> Self {
        let mut detector = self.clone();
        detector.declared_keys.extend(keys.into_iter().cloned());
        detector
    }

    /// Whether values under `key` may hold references
    pub fn applies_to(&self, key: &str) -> bool {
        match self.policy {
            ReferencePolicy::Heuristic => true,
            ReferencePolicy::Declared => self.declared_keys.contains(key),
        }
    }

    /// The remapped form of `value`, or `None` when it stays as is
    pub fn remap_value(&self, key: &str, value: &str, table: &RemapTable) -> Option<String> {
        if !self.applies_to(key) {
            return None;
        }
        let (old, encoding) = parse_candidate(value)?;
        let new = table.get_raw(old)?;
        let rewritten = encode(new, encoding);
        (rewritten != value).then_some(rewritten)
    }

    /// Remap every value of `key`; `None` when nothing changed
    pub fn remap_values(&self, key: &str, values: &[String], table: &RemapTable) -> Option<Vec<String>> {
        let mut changed = false;
        let remapped = values
            .iter()
            .map(|value| match self.remap_value(key, value, table) {
                Some(new) => {
                    changed = true;
                    new
                }
                None => value.clone(),
            })
            .collect();
        changed.then_some(remapped)
    }
}

/// Point a reference URL at `new_id` on the installation at `site`
///
/// The origin (scheme, host, port) is replaced by the site's; path and
/// fragment are kept. A numeric `p` or `page_id` query parameter is set
/// to `new_id`. Returns `None` when `old` is not an absolute URL.
pub fn rewrite_reference_url(old: &str, new_id: EntityId, site: &Url) -> Option<String> {
    let old = Url::parse(old).ok()?;

    let mut rewritten = site.clone();
    rewritten.set_path(old.path());
    rewritten.set_query(old.query());
    rewritten.set_fragment(old.fragment());

    let carries_id = old
        .query_pairs()
        .any(|(name, value)| ID_QUERY_PARAMS.contains(&name.as_ref()) && value.parse::<u64>().is_ok());

    if carries_id {
        let pairs: Vec<(String, String)> = old
            .query_pairs()
            .map(|(name, value)| {
                if ID_QUERY_PARAMS.contains(&name.as_ref()) && value.parse::<u64>().is_ok() {
                    (name.into_owned(), new_id.to_string())
                } else {
                    (name.into_owned(), value.into_owned())
                }
            })
            .collect();
        rewritten.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some(rewritten.to_string())
}
