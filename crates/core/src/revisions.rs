//! Package revision table and release substitution.
//!
//! The table is a two-column CSV (`package,revision`) with an optional
//! header row. Export writes it without a header, sorted by package.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::debug;

use crate::errors::RevisionError;

/// Revision counters keyed by package name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionTable {
    revisions: BTreeMap<String, u64>,
}

impl RevisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CSV text. A first row whose revision column is not a number is
    /// taken as a header.
    pub fn parse(text: &str) -> Result<Self, RevisionError> {
        let mut table = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(',').map(|f| f.trim().trim_matches('"'));
            let package = fields.next().unwrap_or("");
            let revision = fields.next().ok_or_else(|| RevisionError::Malformed {
                line: line_no,
                detail: "missing revision column".into(),
            })?;
            if fields.next().is_some() {
                return Err(RevisionError::Malformed {
                    line: line_no,
                    detail: "expected two columns".into(),
                });
            }
            let revision = match revision.parse::<u64>() {
                Ok(rev) => rev,
                Err(_) if table.is_empty() && line_no == 1 => continue,
                Err(e) => {
                    return Err(RevisionError::Malformed {
                        line: line_no,
                        detail: format!("revision '{}': {}", revision, e),
                    })
                }
            };
            if package.is_empty() {
                return Err(RevisionError::Malformed {
                    line: line_no,
                    detail: "empty package name".into(),
                });
            }
            table.revisions.insert(package.to_string(), revision);
        }
        Ok(table)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RevisionError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table = Self::parse(&text)?;
        debug!(path = %path.as_ref().display(), rows = table.len(), "loaded revision table");
        Ok(table)
    }

    pub fn to_csv(&self) -> String {
        self.revisions
            .iter()
            .map(|(package, rev)| format!("{},{}\n", package, rev))
            .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RevisionError> {
        std::fs::write(path, self.to_csv())?;
        Ok(())
    }

    pub fn insert(&mut self, package: impl Into<String>, revision: u64) {
        self.revisions.insert(package.into(), revision);
    }

    pub fn get(&self, package: &str) -> Option<u64> {
        self.revisions.get(package).copied()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.revisions.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, u64)> for RevisionTable {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            revisions: iter.into_iter().collect(),
        }
    }
}

/// A `Release:` line holding the `0` or `<RELEASE>` placeholder.
static RELEASE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)Release[ \t]*:[ \t]*(?:0|<RELEASE>)[ \t]*$")
        .expect("release placeholder pattern is valid")
});

/// Replace a `Release: 0` or `Release: <RELEASE>` placeholder line of a
/// recipe with the given revision. Returns `None` when the recipe has no
/// placeholder.
pub fn apply_release(recipe: &str, revision: u64) -> Option<String> {
    let re = &*RELEASE_PLACEHOLDER;
    if !re.is_match(recipe) {
        return None;
    }
    let replacement = format!("${{1}}Release: {}", revision);
    Some(re.replace_all(recipe, replacement.as_str()).into_owned())
}
