//! Entity graph transfer
//!
//! `SnapshotBuilder` turns a root entity into a portable snapshot,
//! `Materializer` replays a snapshot into another installation.
//! `TransferService` wraps both behind permission and replay checks.

pub mod builder;
mod catalog_merge;
pub mod matching;
pub mod materializer;
pub mod references;
pub mod remap;
pub mod report;
pub mod schema_merge;

pub use builder::SnapshotBuilder;
pub use matching::{MatchPolicy, MatchStrategy};
pub use materializer::Materializer;
pub use references::{ReferenceDetector, ReferencePolicy};
pub use remap::RemapTable;
pub use report::{MaterializeReport, Stage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, instrument, Instrument, Span};
use url::Url;

use crate::auth::AuthContext;
use crate::config::TransferConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::snapshot::{EntityId, EntityType};
use crate::store::{CatalogStore, EntitySummary, EntityStore, SchemaProvider};

/// Operations gated by permission and replay checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    Export,
    Import,
}

impl TransferAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferAction::Export => "export",
            TransferAction::Import => "import",
        }
    }

    /// Scope an actor needs for this action
    pub fn scope(self) -> &'static str {
        match self {
            TransferAction::Export => "transfer:export",
            TransferAction::Import => "transfer:import",
        }
    }
}

/// Decides whether an actor may run an action
pub trait PermissionHook: Send + Sync {
    fn check(&self, actor: &AuthContext, action: TransferAction) -> Result<()>;
}

/// Grants actions by scope; `admin` grants everything
pub struct ScopePermissions;

impl PermissionHook for ScopePermissions {
    fn check(&self, actor: &AuthContext, action: TransferAction) -> Result<()> {
        actor.require_scope(action.scope())
    }
}

/// Issues and consumes single-use tokens binding an actor to an action
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    async fn issue(&self, actor: &str, action: TransferAction) -> Result<String>;

    async fn verify(&self, actor: &str, action: TransferAction, token: &str) -> Result<()>;
}

/// The collaborators of one installation
#[derive(Clone)]
pub struct Installation {
    pub entities: Arc<dyn EntityStore>,
    pub schema: Option<Arc<dyn SchemaProvider>>,
    pub catalog: Option<Arc<dyn CatalogStore>>,
}

/// A snapshot ready for download
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub filename: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Download name for a snapshot of `entity_type` titled `title`
pub fn export_filename(entity_type: &EntityType, title: &str) -> String {
    let title: String = title
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("export-{}-{}.json", entity_type, title)
}

pub struct TransferService {
    entities: Arc<dyn EntityStore>,
    builder: SnapshotBuilder,
    materializer: Arc<Materializer>,
    permissions: Arc<dyn PermissionHook>,
    replay: Arc<dyn ReplayGuard>,
    import_lock: Arc<Mutex<()>>,
}

impl TransferService {
    pub fn new(
        installation: Installation,
        config: &TransferConfig,
        permissions: Arc<dyn PermissionHook>,
        replay: Arc<dyn ReplayGuard>,
    ) -> Result<Self> {
        let site_url: Url = config.site_url()?;
        let match_policy = matching::match_policy(config.match_strategy, config.external_id_key.as_deref())?;
        let references = ReferenceDetector::new(config.reference_policy, config.reference_meta_keys.clone());

        let builder = SnapshotBuilder::new(installation.entities.clone())
            .with_schema(installation.schema.clone())
            .with_catalog(installation.catalog.clone())
            .with_reference_meta_keys(config.reference_meta_keys.clone());

        let materializer = Materializer::new(installation.entities.clone(), site_url)
            .with_schema(installation.schema)
            .with_catalog(installation.catalog)
            .with_match_policy(match_policy)
            .with_references(references);

        Ok(Self {
            entities: installation.entities,
            builder,
            materializer: Arc::new(materializer),
            permissions,
            replay,
            import_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Entities that can be offered for export
    pub async fn list_transferable(&self, actor: &AuthContext) -> Result<Vec<EntitySummary>> {
        self.permissions.check(actor, TransferAction::Export)?;

        let mut summaries = Vec::new();
        for entity_type in EntityType::transferable() {
            let entities = self.entities.list_by_type(&entity_type).await?;
            summaries.extend(entities.iter().map(EntitySummary::from));
        }
        Ok(summaries)
    }

    /// A fresh token for `action`
    pub async fn issue_nonce(&self, actor: &AuthContext, action: TransferAction) -> Result<String> {
        self.permissions.check(actor, action)?;
        self.replay.issue(&actor.actor_id, action).await
    }

    #[instrument(skip(self, actor, nonce), fields(actor = %actor.actor_id))]
    pub async fn export(&self, actor: &AuthContext, id: EntityId, nonce: &str) -> Result<ExportFile> {
        self.permissions.check(actor, TransferAction::Export)?;
        self.replay
            .verify(&actor.actor_id, TransferAction::Export, nonce)
            .await?;

        let started = Instant::now();
        let result = self.export_snapshot(id).await;
        metrics::record_export(started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn export_snapshot(&self, id: EntityId) -> Result<ExportFile> {
        let doc = self.builder.build(id).await?;
        let body = doc.to_pretty_json()?;
        let filename = export_filename(&doc.entity.entity_type, &doc.entity.title);
        info!(filename = %filename, bytes = body.len(), "Snapshot exported");

        Ok(ExportFile {
            filename,
            content_type: "application/json",
            body,
        })
    }

    /// Materialize an uploaded snapshot; one import runs at a time
    ///
    /// The run is a detached task holding the import lock, so a dropped
    /// request neither stops it mid-stage nor lets another import start.
    #[instrument(skip(self, actor, bytes, nonce), fields(actor = %actor.actor_id, bytes = bytes.len()))]
    pub async fn import(&self, actor: &AuthContext, bytes: Vec<u8>, nonce: &str) -> Result<MaterializeReport> {
        self.permissions.check(actor, TransferAction::Import)?;
        self.replay
            .verify(&actor.actor_id, TransferAction::Import, nonce)
            .await?;

        let guard = self.import_lock.clone().lock_owned().await;
        let materializer = self.materializer.clone();
        let run = tokio::spawn(
            async move {
                let _guard = guard;
                let started = Instant::now();
                let result = materializer.materialize_bytes(&bytes).await;
                metrics::record_import(started.elapsed().as_secs_f64(), result.is_ok());
                result
            }
            .instrument(Span::current()),
        );

        run.await.map_err(|e| AppError::Internal {
            message: format!("Import task failed: {}", e),
        })?
    }
}
