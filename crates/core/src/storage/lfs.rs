//! Git LFS backed storage.
//!
//! Objects are written into the repository's local LFS object store
//! (`.git/lfs/objects/<aa>/<bb>/<oid>`), the package directory receives the
//! LFS pointer, and `.gitattributes` lists every tracked file. The
//! attributes file is regenerated from the tracked set, so the same set
//! always produces the same bytes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{StorageBackend, StorageReference};
use crate::errors::{StorageError, TreeError};
use crate::git::GitTree;
use crate::models::{md5_hex, FileEntry};

// ---------------------------------------------------------------------------
// LFS pointer format
// ---------------------------------------------------------------------------

/// Magic prefix of every Git LFS pointer file.
const LFS_POINTER_PREFIX: &str = "version https://git-lfs.github.com/spec/v1\n";

const LFS_ATTRIBUTES: &str = "filter=lfs diff=lfs merge=lfs -text";

/// Parsed content of a Git LFS pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfsPointer {
    /// The SHA-256 OID of the blob in LFS storage.
    pub oid: String,
    /// Size in bytes of the actual file content.
    pub size: u64,
}

impl LfsPointer {
    pub fn for_content(content: &[u8]) -> Self {
        Self {
            oid: hex::encode(Sha256::digest(content)),
            size: content.len() as u64,
        }
    }

    pub fn render(&self) -> String {
        format!("{}oid sha256:{}\nsize {}\n", LFS_POINTER_PREFIX, self.oid, self.size)
    }
}

/// Check whether `content` is a Git LFS pointer file.
pub fn is_lfs_pointer(content: &[u8]) -> bool {
    // LFS pointers are always small text files.
    if content.len() > 512 {
        return false;
    }
    match std::str::from_utf8(content) {
        Ok(text) => text.starts_with(LFS_POINTER_PREFIX),
        Err(_) => false,
    }
}

/// Parse a Git LFS pointer. Returns `None` if the content is not one.
pub fn parse_lfs_pointer(content: &[u8]) -> Option<LfsPointer> {
    if !is_lfs_pointer(content) {
        return None;
    }
    let text = std::str::from_utf8(content).ok()?;

    let mut oid = None;
    let mut size = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("oid sha256:") {
            oid = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("size ") {
            size = rest.trim().parse::<u64>().ok();
        }
    }

    Some(LfsPointer {
        oid: oid?,
        size: size?,
    })
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// Check whether `git lfs` is installed and available on PATH.
///
/// Objects are written without the CLI, but committing and pushing the tree
/// needs it. Returns the version string on success.
pub fn preflight_check() -> Result<String, String> {
    match Command::new("git").args(["lfs", "version"]).output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(version = %version, "git-lfs preflight passed");
            Ok(version)
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(format!(
                "git lfs version failed (exit code {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ))
        }
        Err(e) => Err(format!("git lfs not found on PATH: {}", e)),
    }
}

// ---------------------------------------------------------------------------
// .gitattributes
// ---------------------------------------------------------------------------

/// Parsed `.gitattributes`: LFS-tracked paths plus any other lines, which
/// are kept in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Attributes {
    other: Vec<String>,
    tracked: BTreeSet<String>,
}

impl Attributes {
    fn parse(text: &str) -> Self {
        let mut attrs = Self::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.split_whitespace().next() {
                Some(pattern) if trimmed.contains("filter=lfs") => {
                    attrs.tracked.insert(unescape_pattern(pattern));
                }
                _ => attrs.other.push(line.to_string()),
            }
        }
        attrs
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.other {
            out.push_str(line);
            out.push('\n');
        }
        for path in &self.tracked {
            out.push_str(&escape_pattern(path));
            out.push(' ');
            out.push_str(LFS_ATTRIBUTES);
            out.push('\n');
        }
        out
    }
}

fn escape_pattern(path: &str) -> String {
    path.replace(' ', "[[:space:]]")
}

fn unescape_pattern(pattern: &str) -> String {
    pattern.replace("[[:space:]]", " ")
}

fn tree_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct LfsStorage {
    tree: Arc<GitTree>,
    attributes: Mutex<Attributes>,
}

impl LfsStorage {
    /// Open the backend on a tree, loading the current `.gitattributes`.
    pub fn open(tree: Arc<GitTree>) -> Result<Self, StorageError> {
        let attributes = match tree.read_path(".gitattributes").map_err(tree_error)? {
            Some(raw) => Attributes::parse(&String::from_utf8_lossy(&raw)),
            None => Attributes::default(),
        };
        debug!(tracked = attributes.tracked.len(), "opened LFS storage");
        Ok(Self {
            tree,
            attributes: Mutex::new(attributes),
        })
    }

    fn object_path(&self, oid: &str) -> PathBuf {
        let mut path = self.tree.git_dir().join("lfs").join("objects");
        if oid.len() >= 4 {
            path = path.join(&oid[0..2]).join(&oid[2..4]);
        }
        path.join(oid)
    }

    /// Write an object unless it is already stored. The content goes to a
    /// temporary file first so a failed write never leaves a partial object.
    fn store_object(&self, pointer: &LfsPointer, content: &[u8]) -> Result<(), StorageError> {
        let object = self.object_path(&pointer.oid);
        if object.exists() {
            debug!(oid = %pointer.oid, "LFS object already stored");
            return Ok(());
        }
        let tmp_dir = self.tree.git_dir().join("lfs").join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;
        if let Some(parent) = object.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = tmp_dir.join(format!("{}.{}", pointer.oid, std::process::id()));
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &object) {
            let _ = std::fs::remove_file(&tmp);
            if !object.exists() {
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn update_attributes<F>(&self, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let mut attrs = self.attributes.lock().await;
        if change(&mut attrs.tracked) {
            self.tree
                .write_path(".gitattributes", attrs.render().as_bytes())
                .map_err(tree_error)?;
        }
        Ok(())
    }
}

fn tree_error(e: TreeError) -> StorageError {
    match e {
        TreeError::Io(io) => StorageError::Io(io),
        other => StorageError::Misconfigured(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for LfsStorage {
    fn kind(&self) -> &'static str {
        "lfs"
    }

    async fn put(
        &self,
        package: &str,
        entry: &FileEntry,
        content: Vec<u8>,
    ) -> Result<StorageReference, StorageError> {
        let pointer = LfsPointer::for_content(&content);
        let md5 = md5_hex(&content);
        if !entry.md5.is_empty() && entry.md5 != md5 {
            warn!(package, file = %entry.name, expected = %entry.md5, actual = %md5, "MD5 mismatch");
        }

        self.store_object(&pointer, &content)?;
        let path = self.tree.package_file_path(package, &entry.name);
        self.tree
            .write_path(&path, pointer.render().as_bytes())
            .map_err(tree_error)?;

        let tracked = tree_path(&path);
        self.update_attributes(|set| set.insert(tracked)).await?;
        info!(package, file = %entry.name, oid = %pointer.oid, "stored file in LFS");

        Ok(StorageReference {
            name: entry.name.clone(),
            key: pointer.oid,
            md5,
        })
    }

    async fn get(&self, reference: &StorageReference) -> Result<Vec<u8>, StorageError> {
        match std::fs::read(self.object_path(&reference.key)) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::Miss {
                name: reference.name.clone(),
                key: reference.key.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, package: &str) -> Result<Vec<StorageReference>, StorageError> {
        let mut refs = Vec::new();
        for file in self.tree.package_files(package).map_err(tree_error)? {
            let path = self.tree.package_file_path(package, &file.name);
            let Some(raw) = self.tree.read_path(&path).map_err(tree_error)? else {
                continue;
            };
            let Some(pointer) = parse_lfs_pointer(&raw) else {
                continue;
            };
            let mut reference = StorageReference {
                name: file.name,
                key: pointer.oid,
                md5: String::new(),
            };
            // A pointer without its object (fresh clone, pruned store) keeps
            // an empty MD5 so the next export fetches the file again.
            match self.get(&reference).await {
                Ok(content) => reference.md5 = md5_hex(&content),
                Err(StorageError::Miss { .. }) => {
                    warn!(package, file = %reference.name, oid = %reference.key, "LFS object missing");
                }
                Err(e) => return Err(e),
            }
            refs.push(reference);
        }
        Ok(refs)
    }

    async fn untrack(&self, package: &str, name: &str) -> Result<(), StorageError> {
        let tracked = tree_path(&self.tree.package_file_path(package, name));
        self.update_attributes(|set| set.remove(&tracked)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
