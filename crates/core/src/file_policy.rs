//! Large-file classification.
//!
//! Provides [`FilePolicy`], which decides for every package file whether it
//! is kept directly in the tree or routed through the storage backend.
//!
//! # Decision model
//!
//! | Condition (first match wins) | Decision |
//! |------------------------------|----------|
//! | Name matches a `large_patterns` glob | `LargePattern` |
//! | Name matches a `text_patterns` glob | `TextPattern` |
//! | Known binary or archive extension | `BinaryExtension` |
//! | Known text extension | `Text` |
//! | Size below `large_threshold` | `Text` |
//! | Leading chunk is UTF-8 without NUL bytes | `Text` |
//! | Otherwise | `BinaryContent` |

use tracing::debug;

use crate::config::FilesConfig;

/// Default size below which unknown files are treated as text.
pub const DEFAULT_LARGE_THRESHOLD: u64 = 5 * 1024;

/// How many leading bytes are inspected when sniffing content.
const SNIFF_LEN: usize = 4 * 1024;

const BINARY_EXTENSIONS: &[&str] = &[
    ".xz", ".gz", ".bz2", ".zip", ".gem", ".tgz", ".png", ".pdf", ".jar", ".oxt", ".whl", ".rpm",
    ".obscpio",
];

const TEXT_EXTENSIONS: &[&str] = &[
    ".changes", ".spec", ".patch", ".diff", ".conf", ".yml", ".keyring", ".sig", ".sh", ".dif",
    ".txt", ".service", ".asc", ".cabal", ".desktop", ".xml", ".pom", ".SUSE", ".in", ".obsinfo",
    ".1", ".init", ".kiwi", ".rpmlintrc", ".rules", ".py", ".sysconfig", ".logrotate", ".pl",
    ".dsc", ".c", ".install", ".8", ".md", ".html", ".script", ".test", ".cfg", ".el", ".pamd",
    ".sign", ".macros",
];

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of classifying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    /// Kept directly in the tree.
    Text,
    /// Forced to text by a configured pattern.
    TextPattern { pattern: String },
    /// Forced to the storage backend by a configured pattern.
    LargePattern { pattern: String },
    /// Archive or binary format, recognised by extension.
    BinaryExtension { extension: String },
    /// Content does not look like text.
    BinaryContent { size: u64 },
}

impl FilePolicyDecision {
    /// `true` if the file goes through the storage backend.
    pub fn is_large(&self) -> bool {
        matches!(
            self,
            Self::LargePattern { .. } | Self::BinaryExtension { .. } | Self::BinaryContent { .. }
        )
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::TextPattern { .. } => "text-pattern",
            Self::LargePattern { .. } => "large-pattern",
            Self::BinaryExtension { .. } => "binary-extension",
            Self::BinaryContent { .. } => "binary-content",
        }
    }
}

// ---------------------------------------------------------------------------
// FilePolicy
// ---------------------------------------------------------------------------

/// Classifies package files as text or large.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    large_threshold: u64,
    /// Glob patterns matched against the file name.
    large_patterns: Vec<String>,
    text_patterns: Vec<String>,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LARGE_THRESHOLD, Vec::new(), Vec::new())
    }
}

impl FilePolicy {
    pub fn new(large_threshold: u64, large_patterns: Vec<String>, text_patterns: Vec<String>) -> Self {
        Self {
            large_threshold,
            large_patterns,
            text_patterns,
        }
    }

    /// Classify a file from its name and content.
    pub fn evaluate(&self, name: &str, content: &[u8]) -> FilePolicyDecision {
        let decision = self.classify(name, content);
        debug!(file = name, decision = decision.label(), "classified file");
        decision
    }

    fn classify(&self, name: &str, content: &[u8]) -> FilePolicyDecision {
        if let Some(pattern) = first_match(&self.large_patterns, name) {
            return FilePolicyDecision::LargePattern { pattern };
        }
        if let Some(pattern) = first_match(&self.text_patterns, name) {
            return FilePolicyDecision::TextPattern { pattern };
        }

        if let Some(ext) = extension(name) {
            if BINARY_EXTENSIONS.contains(&ext) {
                return FilePolicyDecision::BinaryExtension {
                    extension: ext.to_string(),
                };
            }
            if TEXT_EXTENSIONS.contains(&ext) {
                return FilePolicyDecision::Text;
            }
        }

        let size = content.len() as u64;
        if size < self.large_threshold || looks_like_text(content) {
            FilePolicyDecision::Text
        } else {
            FilePolicyDecision::BinaryContent { size }
        }
    }

    pub fn large_threshold(&self) -> u64 {
        self.large_threshold
    }
}

impl From<&FilesConfig> for FilePolicy {
    fn from(cfg: &FilesConfig) -> Self {
        Self::new(
            cfg.large_threshold,
            cfg.large_patterns.clone(),
            cfg.text_patterns.clone(),
        )
    }
}

fn first_match(patterns: &[String], name: &str) -> Option<String> {
    patterns
        .iter()
        .find(|p| glob_match::glob_match(p, name))
        .cloned()
}

/// Final suffix including the dot. A leading dot alone (`.bashrc`) is not an
/// extension.
fn extension(name: &str) -> Option<&str> {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rfind('.') {
        Some(0) | None => None,
        Some(i) => Some(&base[i..]),
    }
}

fn looks_like_text(content: &[u8]) -> bool {
    let chunk = &content[..content.len().min(SNIFF_LEN)];
    if chunk.contains(&0) {
        return false;
    }
    match std::str::from_utf8(chunk) {
        Ok(_) => true,
        // A multi-byte sequence cut by the chunk boundary is still text.
        Err(e) => e.error_len().is_none(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
