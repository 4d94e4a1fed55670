//! Build-service metadata documents (`_meta`, `_link`, ...).

pub mod record;
pub mod xml;

pub use record::{substitute, MetadataKind, MetadataRecord};

/// Project-level metadata files kept under `<tree>/.obs/`, in fetch order.
pub const PROJECT_META_FILES: &[&str] = &["_meta", "_attribute", "_config", "_pattern"];

/// Package-level metadata files kept under `<package>/.obs/`.
pub const PACKAGE_META_FILES: &[&str] = &["_meta", "_attribute"];
