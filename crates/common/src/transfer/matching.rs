//! Resolution of snapshot entities to existing target entities

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{AppError, Result};
use crate::snapshot::{EntityRecord, Metadata};
use crate::store::{Entity, EntityStore};

/// Metadata key tagging an imported entity with its source id
pub const IMPORT_KEY: &str = "_import_unique_key";

/// Configured choice of match policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Same type and exact title
    #[default]
    Title,
    /// Same type and `_import_unique_key` equal to the source id
    ImportKey,
    /// Same type and an equal value under a configured metadata key
    ExternalId,
    ImportKeyThenTitle,
}

/// Finds the target entity a snapshot entity corresponds to
#[async_trait]
pub trait MatchPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find_existing(
        &self,
        store: &dyn EntityStore,
        record: &EntityRecord,
        metadata: &Metadata,
    ) -> Result<Option<Entity>>;
}

pub struct TitleMatch;

#[async_trait]
impl MatchPolicy for TitleMatch {
    fn name(&self) -> &'static str {
        "title"
    }

    async fn find_existing(
        &self,
        store: &dyn EntityStore,
        record: &EntityRecord,
        _metadata: &Metadata,
    ) -> Result<Option<Entity>> {
        store.get_by_title(&record.title, &record.entity_type).await
    }
}

pub struct ImportKeyMatch;

#[async_trait]
impl MatchPolicy for ImportKeyMatch {
    fn name(&self) -> &'static str {
        "import_key"
    }

    async fn find_existing(
        &self,
        store: &dyn EntityStore,
        record: &EntityRecord,
        _metadata: &Metadata,
    ) -> Result<Option<Entity>> {
        let Some(old_id) = record.id else {
            return Ok(None);
        };
        store
            .find_by_metadata(&record.entity_type, IMPORT_KEY, &old_id.to_string())
            .await
    }
}

pub struct ExternalIdMatch {
    key: String,
}

impl ExternalIdMatch {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl MatchPolicy for ExternalIdMatch {
    fn name(&self) -> &'static str {
        "external_id"
    }

    async fn find_existing(
        &self,
        store: &dyn EntityStore,
        record: &EntityRecord,
        metadata: &Metadata,
    ) -> Result<Option<Entity>> {
        match metadata.first(&self.key) {
            Some(value) if !value.is_empty() => {
                store
                    .find_by_metadata(&record.entity_type, &self.key, value)
                    .await
            }
            _ => Ok(None),
        }
    }
}

/// Tries each policy in order and returns the first hit
pub struct FirstMatch {
    policies: Vec<Box<dyn MatchPolicy>>,
}

#[async_trait]
impl MatchPolicy for FirstMatch {
    fn name(&self) -> &'static str {
        "import_key_then_title"
    }

    async fn find_existing(
        &self,
        store: &dyn EntityStore,
        record: &EntityRecord,
        metadata: &Metadata,
    ) -> Result<Option<Entity>> {
        for policy in &self.policies {
            if let Some(entity) = policy.find_existing(store, record, metadata).await? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }
}

/// Build the policy for `strategy`
pub fn match_policy(strategy: MatchStrategy, external_id_key: Option<&str>) -> Result<Arc<dyn MatchPolicy>> {
    let policy: Arc<dyn MatchPolicy> = match strategy {
        MatchStrategy::Title => Arc::new(TitleMatch),
        MatchStrategy::ImportKey => Arc::new(ImportKeyMatch),
        MatchStrategy::ExternalId => {
            let key = external_id_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| AppError::Configuration {
                    message: "transfer.external_id_key is required for the external_id match strategy"
                        .to_string(),
                })?;
            Arc::new(ExternalIdMatch::new(key))
        }
        MatchStrategy::ImportKeyThenTitle => Arc::new(FirstMatch {
            policies: vec![Box::new(ImportKeyMatch), Box::new(TitleMatch)],
        }),
    };
    Ok(policy)
}
