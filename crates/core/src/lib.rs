//! obsgit core library.
//!
//! This crate provides the engine that moves projects between an Open Build
//! Service instance and a git tree: metadata parsing and rewriting, link
//! resolution, large-file storage backends, sync planning, the export and
//! import engines, and the revision table.

pub mod changes;
pub mod config;
pub mod errors;
pub mod export;
pub mod file_policy;
pub mod git;
pub mod import;
pub mod link;
pub mod meta;
pub mod models;
pub mod obs;
pub mod planner;
pub mod revisions;
pub mod storage;

mod pool;

// Re-exports for convenience.
pub use config::ObsGitConfig;
pub use export::{ExportOptions, Exporter};
pub use git::GitTree;
pub use import::{ImportOptions, Importer};
pub use link::{LinkPolicy, LinkResolver};
pub use models::{SyncOutcome, SyncReport};
pub use obs::{BuildService, ObsClient};
pub use storage::StorageBackend;
