//! Outcome of one materialization run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::EntityId;

/// Materializer stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    RootResolved,
    MetadataApplied,
    TaxonomiesApplied,
    RelatedResolved,
    CrossReferenceFixedUp,
    SchemaMerged,
    CatalogMerged,
    Done,
}

impl Stage {
    /// The stage that follows this one; `Done` is terminal
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Parsing => Some(Stage::RootResolved),
            Stage::RootResolved => Some(Stage::MetadataApplied),
            Stage::MetadataApplied => Some(Stage::TaxonomiesApplied),
            Stage::TaxonomiesApplied => Some(Stage::RelatedResolved),
            Stage::RelatedResolved => Some(Stage::CrossReferenceFixedUp),
            Stage::CrossReferenceFixedUp => Some(Stage::SchemaMerged),
            Stage::SchemaMerged => Some(Stage::CatalogMerged),
            Stage::CatalogMerged => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::RootResolved => "root_resolved",
            Stage::MetadataApplied => "metadata_applied",
            Stage::TaxonomiesApplied => "taxonomies_applied",
            Stage::RelatedResolved => "related_resolved",
            Stage::CrossReferenceFixedUp => "cross_reference_fixed_up",
            Stage::SchemaMerged => "schema_merged",
            Stage::CatalogMerged => "catalog_merged",
            Stage::Done => "done",
        }
    }
}

/// How an entity of the snapshot ended up in the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub old_id: Option<EntityId>,
    pub new_id: EntityId,
    pub title: String,
    /// `false` when an existing entity was reused
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    RelatedEntity,
    FieldGroup,
    Field,
    CatalogRecord,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::RelatedEntity => "related_entity",
            ItemKind::FieldGroup => "field_group",
            ItemKind::Field => "field",
            ItemKind::CatalogRecord => "catalog_record",
        }
    }
}

/// A per-item failure that was logged and skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub kind: ItemKind,
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapPair {
    pub old_id: EntityId,
    pub new_id: EntityId,
}

/// Write counters, grouped by what was written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub metadata_keys: usize,
    pub taxonomy_terms: usize,
    pub references_fixed: usize,
    pub field_groups_created: usize,
    pub field_groups_updated: usize,
    pub fields_created: usize,
    pub fields_updated: usize,
    pub records_created: usize,
    pub records_updated: usize,
}

impl WriteCounts {
    pub fn schema_writes(&self) -> usize {
        self.field_groups_created + self.field_groups_updated + self.fields_created + self.fields_updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub completed_stages: Vec<Stage>,
    pub root: Option<EntityOutcome>,
    pub related: Vec<EntityOutcome>,
    pub id_map: Vec<RemapPair>,
    pub writes: WriteCounts,
    pub skipped: Vec<SkippedItem>,
    /// No schema provider was configured
    pub schema_skipped: bool,
    /// No catalog store was configured
    pub catalog_skipped: bool,
}

impl MaterializeReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            completed_stages: Vec::new(),
            root: None,
            related: Vec::new(),
            id_map: Vec::new(),
            writes: WriteCounts::default(),
            skipped: Vec::new(),
            schema_skipped: false,
            catalog_skipped: false,
        }
    }

    pub fn complete(&mut self, stage: Stage) {
        self.completed_stages.push(stage);
        if stage == Stage::Done {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn last_completed(&self) -> Option<Stage> {
        self.completed_stages.last().copied()
    }

    /// Record a skipped item
    pub fn skip(&mut self, kind: ItemKind, identifier: impl Into<String>, reason: impl ToString) {
        crate::metrics::record_skipped(kind.as_str());
        self.skipped.push(SkippedItem {
            kind,
            identifier: identifier.into(),
            reason: reason.to_string(),
        });
    }

    /// Ids created by this run, root first
    pub fn created_ids(&self) -> Vec<EntityId> {
        self.root
            .iter()
            .chain(self.related.iter())
            .filter(|o| o.created)
            .map(|o| o.new_id)
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.last_completed() == Some(Stage::Done)
    }
}

impl Default for MaterializeReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_linear() {
        let mut stage = Stage::Parsing;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(stage, Stage::Done);
    }

    #[test]
    fn test_complete_done_sets_finish_time() {
        let mut report = MaterializeReport::new();
        report.complete(Stage::Parsing);
        assert!(report.finished_at.is_none());
        report.complete(Stage::Done);
        assert!(report.is_done());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_stage_names_match_serialization() {
        let value = serde_json::to_value(Stage::CrossReferenceFixedUp).unwrap();
        assert_eq!(value, Stage::CrossReferenceFixedUp.as_str());
    }
}
