//! The local tree an export writes into and an import reads from.
//!
//! Layout:
//!
//! ```text
//! <root>/.obs/_meta                       project metadata
//! <root>/<prefix>/<package>/.obs/_meta    package metadata
//! <root>/<prefix>/<package>/<file>        package sources
//! ```
//!
//! File access goes through plain paths so a `GitTree` can be shared between
//! package tasks; history queries open the repository on demand.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{IndexAddOption, Repository, Signature};
use tracing::{debug, info, instrument};

use crate::errors::TreeError;
use crate::models::FileEntry;

/// Directory holding metadata, at project and at package level.
pub const META_DIR: &str = ".obs";

/// The most recent commit that touched a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub time: DateTime<Utc>,
}

/// A git working tree holding one build-service project.
#[derive(Debug, Clone)]
pub struct GitTree {
    root: PathBuf,
    prefix: PathBuf,
}

impl GitTree {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the git metadata (`<root>/.git`).
    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    /// Whether the root is an existing git repository.
    pub fn exists(&self) -> bool {
        Repository::open(&self.root).is_ok()
    }

    /// Create the repository if it is missing.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn ensure_repo(&self) -> Result<(), TreeError> {
        if self.exists() {
            debug!("using existing repository");
        } else {
            std::fs::create_dir_all(&self.root)?;
            Repository::init(&self.root)?;
            info!("initialized git repository");
        }
        std::fs::create_dir_all(self.root.join(&self.prefix))?;
        Ok(())
    }

    fn open(&self) -> Result<Repository, TreeError> {
        Repository::open(&self.root)
            .map_err(|_| TreeError::RepositoryNotFound(self.root.display().to_string()))
    }

    // -- paths, relative to the root -----------------------------------------

    pub fn project_meta_path(&self, name: &str) -> PathBuf {
        Path::new(META_DIR).join(name)
    }

    pub fn package_path(&self, package: &str) -> PathBuf {
        self.prefix.join(package)
    }

    pub fn package_file_path(&self, package: &str, name: &str) -> PathBuf {
        self.package_path(package).join(name)
    }

    pub fn package_meta_path(&self, package: &str, name: &str) -> PathBuf {
        self.package_path(package).join(META_DIR).join(name)
    }

    // -- file access ----------------------------------------------------------

    /// Read a file. A missing file is `Ok(None)`.
    pub fn read_path(&self, rel: impl AsRef<Path>) -> Result<Option<Vec<u8>>, TreeError> {
        match std::fs::read(self.root.join(rel)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path_exists(&self, rel: impl AsRef<Path>) -> bool {
        self.root.join(rel).exists()
    }

    /// Write a file, creating parent directories.
    pub fn write_path(&self, rel: impl AsRef<Path>, data: &[u8]) -> Result<(), TreeError> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(())
    }

    /// Remove a file or a directory. Removing nothing is not an error.
    pub fn remove_path(&self, rel: impl AsRef<Path>) -> Result<(), TreeError> {
        let path = self.root.join(rel);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Package directories under the prefix, sorted.
    pub fn packages(&self) -> Result<Vec<String>, TreeError> {
        let dir = self.root.join(&self.prefix);
        let mut packages = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(packages),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    packages.push(name.to_string());
                }
            }
        }
        packages.sort();
        Ok(packages)
    }

    /// Source files of a package with their size and MD5, sorted by name.
    /// The metadata directory is not part of the sources.
    pub fn package_files(&self, package: &str) -> Result<Vec<FileEntry>, TreeError> {
        let dir = self.root.join(self.package_path(package));
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let content = std::fs::read(entry.path())?;
            files.push(FileEntry::from_content(name, &content));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    // -- history --------------------------------------------------------------

    /// Hash of HEAD, or `None` for a repository without commits.
    pub fn head_hash(&self) -> Result<Option<String>, TreeError> {
        let repo = self.open()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = head.peel_to_commit()?.id().to_string();
        Ok(Some(id))
    }

    /// The newest commit that changed the package directory.
    pub fn last_change(&self, package: &str) -> Result<Option<CommitSummary>, TreeError> {
        let repo = self.open()?;
        if self.head_hash()?.is_none() {
            return Ok(None);
        }
        let path = self.package_path(package);

        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;
        for oid in revwalk {
            let commit = repo.find_commit(oid?)?;
            let current = commit.tree()?.get_path(&path).ok().map(|e| e.id());
            if current.is_none() {
                continue;
            }
            let previous = match commit.parent(0) {
                Ok(parent) => parent.tree()?.get_path(&path).ok().map(|e| e.id()),
                Err(_) => None,
            };
            if current != previous {
                let author = commit.author();
                let time = DateTime::from_timestamp(author.when().seconds(), 0).unwrap_or_default();
                return Ok(Some(CommitSummary {
                    hash: commit.id().to_string(),
                    author: author.name().unwrap_or("").to_string(),
                    email: author.email().unwrap_or("").to_string(),
                    time,
                }));
            }
        }
        Ok(None)
    }

    /// Stage everything and commit it on HEAD.
    #[instrument(skip(self, message))]
    pub fn commit_all(&self, message: &str, name: &str, email: &str) -> Result<String, TreeError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let signature = Signature::now(name, email)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid.to_string())
    }
}
