//! Large-file storage.
//!
//! Large package files do not live in the tree directly. A
//! [`StorageBackend`] keeps their content and leaves a trace in the tree
//! (an LFS pointer plus `.gitattributes`, or a per-package index file) so
//! the engines can find them again. Callers never branch on the backend
//! type.

pub mod lfs;
pub mod obs;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageConfig, StorageType};
use crate::errors::StorageError;
use crate::git::GitTree;
use crate::models::FileEntry;
use crate::obs::BuildService;

pub use lfs::LfsStorage;
pub use obs::ObsStorage;

/// Handle to one stored large file of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageReference {
    /// File name inside the package.
    pub name: String,
    /// Backend key: the SHA-256 oid for LFS, the MD5 for the hosted store.
    pub key: String,
    /// MD5 of the content, comparable with build-service listings.
    pub md5: String,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs and reports.
    fn kind(&self) -> &'static str;

    /// Store `content` as `entry.name` of `package`. Storing the same
    /// content twice yields the same reference and stores it once.
    async fn put(
        &self,
        package: &str,
        entry: &FileEntry,
        content: Vec<u8>,
    ) -> Result<StorageReference, StorageError>;

    /// Fetch the content behind a reference.
    async fn get(&self, reference: &StorageReference) -> Result<Vec<u8>, StorageError>;

    /// Large files currently tracked for a package, sorted by name.
    async fn list(&self, package: &str) -> Result<Vec<StorageReference>, StorageError>;

    /// Stop tracking a file of a package. Unknown names are ignored.
    async fn untrack(&self, package: &str, name: &str) -> Result<(), StorageError>;

    /// Persist pending backend state at the end of a run.
    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Build the backend selected by the configuration.
///
/// `storage_obs` is the client for the hosted store; it is only used when
/// the configuration selects it.
pub async fn from_config(
    config: &StorageConfig,
    tree: Arc<GitTree>,
    storage_obs: Option<Arc<dyn BuildService>>,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.storage_type {
        StorageType::Lfs => Ok(Arc::new(LfsStorage::open(tree)?)),
        StorageType::Obs => {
            let (project, package) = config
                .location()
                .map_err(|e| StorageError::Misconfigured(e.to_string()))?;
            let obs = storage_obs.ok_or_else(|| {
                StorageError::Misconfigured("no build service client for hosted storage".into())
            })?;
            let storage = ObsStorage::open(obs, project, package, tree).await?;
            Ok(Arc::new(storage))
        }
    }
}
