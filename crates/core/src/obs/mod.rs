//! Build-service access: the [`BuildService`] seam used by the engines and
//! its HTTP implementation.

pub mod client;
pub mod parser;
pub mod signature;

use async_trait::async_trait;

use crate::errors::{MetadataError, RemoteError};
use crate::models::{Directory, FileEntry, Revision};

pub use client::ObsClient;

/// Operations the engines and the hosted storage backend need from a build
/// service. Metadata getters return `Ok(None)` when the document does not
/// exist.
#[async_trait]
pub trait BuildService: Send + Sync {
    async fn project_exists(&self, project: &str) -> Result<bool, RemoteError>;

    async fn package_exists(&self, project: &str, package: &str) -> Result<bool, RemoteError>;

    async fn list_packages(&self, project: &str) -> Result<Vec<String>, RemoteError>;

    /// Fetch a project-level document such as `_meta` or `_config`.
    async fn get_project_meta(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Fetch a package-level document such as `_meta` or `_attribute`.
    async fn get_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn get_file_list(
        &self,
        project: &str,
        package: &str,
        rev: &Revision,
    ) -> Result<Directory, RemoteError>;

    async fn get_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        rev: &Revision,
    ) -> Result<Vec<u8>, RemoteError>;

    /// Current revision counter of a package.
    async fn get_revision_count(&self, project: &str, package: &str) -> Result<u64, RemoteError> {
        let dir = self.get_file_list(project, package, &Revision::Latest).await?;
        dir.revision().ok_or_else(|| {
            RemoteError::Response(MetadataError::malformed(
                "directory",
                format!("listing of {}/{} has no numeric revision", project, package),
            ))
        })
    }

    async fn put_project_meta(
        &self,
        project: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn put_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError>;

    /// Upload a file without creating a new revision. The revision is
    /// created by [`commit_filelist`](Self::commit_filelist).
    async fn put_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError>;

    /// Remove a file without creating a new revision.
    async fn delete_file(&self, project: &str, package: &str, name: &str)
        -> Result<(), RemoteError>;

    async fn delete_package(&self, project: &str, package: &str) -> Result<(), RemoteError>;

    /// Create a new package revision made of exactly `entries`.
    async fn commit_filelist(
        &self,
        project: &str,
        package: &str,
        entries: &[FileEntry],
        comment: &str,
    ) -> Result<(), RemoteError>;

    /// Create a package. A disabled package is never built or published.
    async fn create_package(
        &self,
        project: &str,
        package: &str,
        disabled: bool,
    ) -> Result<(), RemoteError>;
}
