//! Domain model types shared by the engines, the storage backends and the
//! build-service client.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Files and listings
// ---------------------------------------------------------------------------

/// One source file of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Hex MD5 of the content, as reported by the build service.
    pub md5: String,
    /// Routed through the storage backend instead of living in the tree.
    #[serde(default)]
    pub large: bool,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64, md5: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            md5: md5.into(),
            large: false,
        }
    }

    /// Build an entry for in-memory content.
    pub fn from_content(name: impl Into<String>, content: &[u8]) -> Self {
        Self::new(name, content.len() as u64, md5_hex(content))
    }

    pub fn is_metadata(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Provenance of an expanded link, as reported in a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub project: String,
    pub package: String,
    pub srcmd5: Option<String>,
    /// Source MD5 of the expanded (link applied) tree.
    pub xsrcmd5: Option<String>,
    pub error: Option<String>,
}

/// A package source listing (`GET /source/<project>/<package>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub rev: Option<String>,
    pub srcmd5: Option<String>,
    pub entries: Vec<FileEntry>,
    pub link_info: Option<LinkInfo>,
}

impl Directory {
    pub fn has_link(&self) -> bool {
        self.entries.iter().any(|e| e.name == "_link")
    }

    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Numeric revision, when the listing carries one.
    pub fn revision(&self) -> Option<u64> {
        self.rev.as_deref().and_then(|r| r.parse().ok())
    }
}

/// Which revision of a package listing to ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Latest,
    /// An expanded source tree, addressed by its `xsrcmd5`.
    Expanded(String),
}

impl Revision {
    pub fn as_query(&self) -> &str {
        match self {
            Self::Latest => "latest",
            Self::Expanded(md5) => md5,
        }
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Overall outcome of an export or import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    PartialFailure,
    TotalFailure,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial failure"),
            Self::TotalFailure => write!(f, "total failure"),
        }
    }
}

/// Per-package results of a run. Failures keep their reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Packages never started because fail-fast stopped scheduling.
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn success(&mut self, package: impl Into<String>) {
        self.succeeded.push(package.into());
    }

    pub fn failure(&mut self, package: impl Into<String>, reason: impl fmt::Display) {
        self.failed.push((package.into(), reason.to_string()));
    }

    /// Sort both lists so reports do not depend on completion order.
    pub fn finish(mut self) -> Self {
        self.succeeded.sort();
        self.failed.sort();
        self.skipped.sort();
        self
    }

    /// An empty run counts as a success.
    pub fn outcome(&self) -> SyncOutcome {
        let failed = self.failed.len() + self.skipped.len();
        match (self.succeeded.len(), failed) {
            (_, 0) => SyncOutcome::Success,
            (0, _) => SyncOutcome::TotalFailure,
            _ => SyncOutcome::PartialFailure,
        }
    }
}

pub(crate) fn md5_hex(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}
