//! Local git tree access.

pub mod tree;

pub use tree::{CommitSummary, GitTree, META_DIR};
