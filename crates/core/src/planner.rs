//! Per-package and per-project sync plans.
//!
//! The skip flags of both commands are folded into an immutable
//! [`SyncPlan`] by pure functions, once per package and once per project.
//! The engines log the plan and then execute it.

use serde::{Deserialize, Serialize};

/// Operator flags shared by export and import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFlags {
    /// Leave the project `_meta` alone.
    pub skip_project_meta: bool,
    /// Leave all project metadata alone when the destination already has it.
    pub skip_all_project_meta: bool,
    /// Leave package `_meta` files alone.
    pub skip_package_meta: bool,
    /// Leave all package metadata alone when the destination already has it.
    pub skip_all_package_meta: bool,
    /// Export only the revision table.
    pub only_revisions: bool,
}

/// What the destination side already holds.
///
/// For an export the destination is the local tree, for an import it is
/// the remote project or package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetState {
    pub meta_present: bool,
}

/// Operations to run for one package, or for the project itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Package name, `None` for the project plan.
    pub package: Option<String>,
    /// Transfer metadata documents at all.
    pub fetch_meta: bool,
    /// Include the `_meta` record among them.
    pub fetch_meta_record: bool,
    /// Transfer source files.
    pub fetch_files: bool,
    /// Record the package revision in the revision table.
    pub record_revision: bool,
}

impl SyncPlan {
    /// Nothing to transfer.
    pub fn is_noop(&self) -> bool {
        !(self.fetch_meta || self.fetch_files || self.record_revision)
    }
}

fn meta_plan(target: &TargetState, skip_all: bool, skip_record: bool) -> (bool, bool) {
    // Skipping everything only applies when there is something to keep.
    let fetch_meta = !(skip_all && target.meta_present);
    (fetch_meta, fetch_meta && !skip_record)
}

/// Plan one package.
pub fn plan(package: &str, target: &TargetState, flags: &SyncFlags) -> SyncPlan {
    if flags.only_revisions {
        return SyncPlan {
            package: Some(package.to_string()),
            fetch_meta: false,
            fetch_meta_record: false,
            fetch_files: false,
            record_revision: true,
        };
    }
    let (fetch_meta, fetch_meta_record) =
        meta_plan(target, flags.skip_all_package_meta, flags.skip_package_meta);
    SyncPlan {
        package: Some(package.to_string()),
        fetch_meta,
        fetch_meta_record,
        fetch_files: true,
        record_revision: false,
    }
}

/// Plan the project-level metadata.
pub fn plan_project(target: &TargetState, flags: &SyncFlags) -> SyncPlan {
    if flags.only_revisions {
        return SyncPlan {
            package: None,
            fetch_meta: false,
            fetch_meta_record: false,
            fetch_files: false,
            record_revision: false,
        };
    }
    let (fetch_meta, fetch_meta_record) =
        meta_plan(target, flags.skip_all_project_meta, flags.skip_project_meta);
    SyncPlan {
        package: None,
        fetch_meta,
        fetch_meta_record,
        fetch_files: false,
        record_revision: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESENT: TargetState = TargetState { meta_present: true };
    const ABSENT: TargetState = TargetState { meta_present: false };

    #[test]
    fn test_default_fetches_everything() {
        let p = plan("gcc", &PRESENT, &SyncFlags::default());
        assert!(p.fetch_meta && p.fetch_meta_record && p.fetch_files);
        assert!(!p.record_revision);
        assert_eq!(p.package.as_deref(), Some("gcc"));
    }

    #[test]
    fn test_skip_all_package_meta() {
        let flags = SyncFlags {
            skip_all_package_meta: true,
            ..Default::default()
        };
        let p = plan("gcc", &PRESENT, &flags);
        assert!(!p.fetch_meta && !p.fetch_meta_record);
        assert!(p.fetch_files);

        // Nothing local to keep: metadata is fetched anyway.
        let p = plan("gcc", &ABSENT, &flags);
        assert!(p.fetch_meta && p.fetch_meta_record && p.fetch_files);
    }

    #[test]
    fn test_skip_package_meta_keeps_other_documents() {
        let flags = SyncFlags {
            skip_package_meta: true,
            ..Default::default()
        };
        let p = plan("gcc", &ABSENT, &flags);
        assert!(p.fetch_meta);
        assert!(!p.fetch_meta_record);
    }

    #[test]
    fn test_only_revisions_transfers_nothing() {
        let flags = SyncFlags {
            only_revisions: true,
            skip_package_meta: true,
            ..Default::default()
        };
        let p = plan("gcc", &ABSENT, &flags);
        assert!(!p.fetch_meta && !p.fetch_files);
        assert!(p.record_revision);
        assert!(plan_project(&ABSENT, &flags).is_noop());
    }

    #[test]
    fn test_project_flags_are_independent() {
        let flags = SyncFlags {
            skip_all_package_meta: true,
            skip_project_meta: true,
            ..Default::default()
        };
        let p = plan_project(&PRESENT, &flags);
        assert!(p.fetch_meta);
        assert!(!p.fetch_meta_record);
        assert!(!p.fetch_files);
        assert_eq!(p.package, None);

        let flags = SyncFlags {
            skip_all_project_meta: true,
            ..Default::default()
        };
        assert!(plan_project(&PRESENT, &flags).is_noop());
        assert!(plan_project(&ABSENT, &flags).fetch_meta);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let flags = SyncFlags {
            skip_all_package_meta: true,
            skip_project_meta: true,
            ..Default::default()
        };
        for target in [PRESENT, ABSENT] {
            assert_eq!(plan("a", &target, &flags), plan("a", &target, &flags));
            assert_eq!(plan_project(&target, &flags), plan_project(&target, &flags));
        }
    }
}
