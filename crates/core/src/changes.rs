//! Changelog annotation for imported `.changes` files.

use crate::git::CommitSummary;

const SEPARATOR_WIDTH: usize = 67;

/// Changelog entry naming the commit a package was imported from.
pub fn sync_entry(commit: &CommitSummary) -> String {
    format!(
        "{}\n{} - {} <{}>\n\n- Last git synchronization: {}\n\n",
        "-".repeat(SEPARATOR_WIDTH),
        commit.time.format("%a %b %d %H:%M:%S UTC %Y"),
        commit.author,
        commit.email,
        commit.hash
    )
}

/// Prepend the entry for `commit` to a changelog.
pub fn annotate(changes: &[u8], commit: &CommitSummary) -> Vec<u8> {
    let mut out = sync_entry(commit).into_bytes();
    out.extend_from_slice(changes);
    out
}

pub fn is_changes_file(name: &str) -> bool {
    name.ends_with(".changes")
}
