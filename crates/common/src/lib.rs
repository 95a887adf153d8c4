//! SiteBridge Common Library
//!
//! Shared code for the SiteBridge services including:
//! - Snapshot document schema and wire format
//! - Entity graph transfer engine (snapshot builder, materializer)
//! - Installation store traits with in-memory and PostgreSQL backends
//! - Error types and handling
//! - Configuration management
//! - Authentication and replay protection
//! - Metrics

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod snapshot;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use errors::{AppError, Result};
pub use store::MemoryInstallation;
pub use transfer::TransferService;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
