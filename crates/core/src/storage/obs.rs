//! Storage in a build-service package used as a blob store.
//!
//! Blobs are uploaded under their MD5 into a dedicated package that is never
//! built. Every package of the tree keeps an index in `.obs/files` mapping
//! file names to blob MD5s, one `name\t\tmd5` line per file, sorted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{StorageBackend, StorageReference};
use crate::errors::{StorageError, TreeError};
use crate::git::GitTree;
use crate::models::{md5_hex, FileEntry, Revision};
use crate::obs::BuildService;

/// Name of the per-package index inside the package metadata directory.
pub const INDEX_FILE: &str = "files";

#[derive(Debug, Default)]
struct BlobState {
    /// MD5s present in the storage package.
    known: BTreeSet<String>,
    /// Blobs were uploaded since the last commit.
    dirty: bool,
}

pub struct ObsStorage {
    obs: Arc<dyn BuildService>,
    project: String,
    package: String,
    tree: Arc<GitTree>,
    blobs: Mutex<BlobState>,
    index: Mutex<()>,
}

impl ObsStorage {
    /// Connect to `project/package`, creating the package when needed. A
    /// missing project cannot be fixed from here and is a configuration
    /// error.
    #[instrument(skip(obs, tree))]
    pub async fn open(
        obs: Arc<dyn BuildService>,
        project: &str,
        package: &str,
        tree: Arc<GitTree>,
    ) -> Result<Self, StorageError> {
        if !obs.project_exists(project).await? {
            return Err(StorageError::Misconfigured(format!(
                "storage project '{}' does not exist",
                project
            )));
        }
        if !obs.package_exists(project, package).await? {
            obs.create_package(project, package, true).await?;
        }

        let listing = obs.get_file_list(project, package, &Revision::Latest).await?;
        let mut known = BTreeSet::new();
        for entry in listing.entries {
            if entry.name != entry.md5 {
                return Err(StorageError::Misconfigured(format!(
                    "storage {}/{} holds '{}', which is not named by its MD5",
                    project, package, entry.name
                )));
            }
            known.insert(entry.md5);
        }
        info!(project, package, blobs = known.len(), "opened hosted storage");

        Ok(Self {
            obs,
            project: project.to_string(),
            package: package.to_string(),
            tree,
            blobs: Mutex::new(BlobState { known, dirty: false }),
            index: Mutex::new(()),
        })
    }

    fn read_index(&self, package: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let path = self.tree.package_meta_path(package, INDEX_FILE);
        let Some(raw) = self.tree.read_path(&path).map_err(tree_error)? else {
            return Ok(BTreeMap::new());
        };
        Ok(parse_index(&String::from_utf8_lossy(&raw)))
    }

    fn write_index(&self, package: &str, index: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let path = self.tree.package_meta_path(package, INDEX_FILE);
        if index.is_empty() {
            return self.tree.remove_path(&path).map_err(tree_error);
        }
        self.tree
            .write_path(&path, render_index(index).as_bytes())
            .map_err(tree_error)
    }
}

pub(crate) fn parse_index(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(name), Some(md5)) => Some((name.to_string(), md5.to_string())),
                _ => None,
            }
        })
        .collect()
}

fn render_index(index: &BTreeMap<String, String>) -> String {
    index
        .iter()
        .map(|(name, md5)| format!("{}\t\t{}\n", name, md5))
        .collect()
}

fn tree_error(e: TreeError) -> StorageError {
    match e {
        TreeError::Io(io) => StorageError::Io(io),
        other => StorageError::Misconfigured(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for ObsStorage {
    fn kind(&self) -> &'static str {
        "obs"
    }

    async fn put(
        &self,
        package: &str,
        entry: &FileEntry,
        content: Vec<u8>,
    ) -> Result<StorageReference, StorageError> {
        let md5 = md5_hex(&content);
        // Held across the upload so one blob is never uploaded twice.
        let mut blobs = self.blobs.lock().await;
        if blobs.known.contains(&md5) {
            debug!(package, file = %entry.name, %md5, "blob already stored");
        } else {
            self.obs
                .put_file(&self.project, &self.package, &md5, content)
                .await?;
            blobs.known.insert(md5.clone());
            blobs.dirty = true;
            info!(package, file = %entry.name, %md5, "stored blob");
        }
        drop(blobs);

        let _guard = self.index.lock().await;
        let mut index = self.read_index(package)?;
        index.insert(entry.name.clone(), md5.clone());
        self.write_index(package, &index)?;
        self.tree
            .remove_path(self.tree.package_file_path(package, &entry.name))
            .map_err(tree_error)?;

        Ok(StorageReference {
            name: entry.name.clone(),
            key: md5.clone(),
            md5,
        })
    }

    async fn get(&self, reference: &StorageReference) -> Result<Vec<u8>, StorageError> {
        if !self.blobs.lock().await.known.contains(&reference.key) {
            return Err(StorageError::Miss {
                name: reference.name.clone(),
                key: reference.key.clone(),
            });
        }
        Ok(self
            .obs
            .get_file(&self.project, &self.package, &reference.key, &Revision::Latest)
            .await?)
    }

    async fn list(&self, package: &str) -> Result<Vec<StorageReference>, StorageError> {
        let _guard = self.index.lock().await;
        Ok(self
            .read_index(package)?
            .into_iter()
            .map(|(name, md5)| StorageReference {
                name,
                key: md5.clone(),
                md5,
            })
            .collect())
    }

    async fn untrack(&self, package: &str, name: &str) -> Result<(), StorageError> {
        let _guard = self.index.lock().await;
        let mut index = self.read_index(package)?;
        if index.remove(name).is_some() {
            self.write_index(package, &index)?;
        }
        Ok(())
    }

    /// Commit the blob list once, if anything was uploaded.
    async fn flush(&self) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().await;
        if !blobs.dirty {
            return Ok(());
        }
        let entries: Vec<FileEntry> = blobs
            .known
            .iter()
            .map(|md5| FileEntry::new(md5.clone(), 0, md5.clone()))
            .collect();
        let comment = format!(
            "Storage syncronization {}",
            chrono::Utc::now().format("%d/%m/%Y %H:%M:%S")
        );
        self.obs
            .commit_filelist(&self.project, &self.package, &entries, &comment)
            .await?;
        blobs.dirty = false;
        info!(project = %self.project, package = %self.package, blobs = entries.len(), "committed storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_format() {
        let mut index = BTreeMap::new();
        index.insert("z.tar.xz".to_string(), "bbb".to_string());
        index.insert("a.gem".to_string(), "aaa".to_string());
        let text = render_index(&index);
        assert_eq!(text, "a.gem\t\taaa\nz.tar.xz\t\tbbb\n");
        assert_eq!(parse_index(&text), index);
        assert_eq!(parse_index("broken\n\n"), BTreeMap::new());
    }
}
