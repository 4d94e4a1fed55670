//! Export engine: materializes a build-service project into the local tree.
//!
//! Per package: plan, fetch metadata, resolve links, then reconcile the
//! package directory with the remote listing. Large files go through the
//! storage backend, everything else is written into the tree. Files whose
//! MD5 already matches are not downloaded again.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::errors::SyncError;
use crate::file_policy::FilePolicy;
use crate::git::{GitTree, META_DIR};
use crate::link::{self, LinkResolver, ResolvedPackage};
use crate::meta::{MetadataKind, MetadataRecord, PACKAGE_META_FILES, PROJECT_META_FILES};
use crate::models::{FileEntry, SyncReport};
use crate::obs::BuildService;
use crate::planner::{plan, plan_project, SyncFlags, TargetState};
use crate::pool::run_packages;
use crate::revisions::RevisionTable;
use crate::storage::StorageBackend;

/// Where link provenance of an expanded package is kept.
pub const LINKINFO_FILE: &str = "_linkinfo";

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub flags: SyncFlags,
    /// Export a single package instead of the whole project.
    pub package: Option<String>,
    pub jobs: usize,
    pub fail_fast: bool,
    /// Revision table written by a revisions-only export.
    pub revisions_out: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Exporter {
    obs: Arc<dyn BuildService>,
    tree: Arc<GitTree>,
    storage: Arc<dyn StorageBackend>,
    resolver: LinkResolver,
    policy: Arc<FilePolicy>,
    options: Arc<ExportOptions>,
}

impl Exporter {
    pub fn new(
        obs: Arc<dyn BuildService>,
        tree: Arc<GitTree>,
        storage: Arc<dyn StorageBackend>,
        resolver: LinkResolver,
        policy: FilePolicy,
        options: ExportOptions,
    ) -> Self {
        Self {
            obs,
            tree,
            storage,
            resolver,
            policy: Arc::new(policy),
            options: Arc::new(options),
        }
    }

    /// Export `project`. Package failures end up in the report; an `Err`
    /// means the run as a whole could not proceed.
    #[instrument(skip(self))]
    pub async fn export(&self, project: &str) -> Result<SyncReport, SyncError> {
        self.tree.ensure_repo()?;

        if self.options.flags.only_revisions {
            let (report, table) = self.export_revisions(project).await?;
            if let Some(ref path) = self.options.revisions_out {
                table.save(path)?;
                info!(path = %path.display(), rows = table.len(), "wrote revision table");
            }
            return Ok(report);
        }

        let packages = match self.options.package {
            Some(ref package) => {
                // Deletion stays off, but a fresh tree still needs the project.
                if !self.tree.path_exists(META_DIR) {
                    self.export_project_meta(project).await?;
                }
                vec![package.clone()]
            }
            None => {
                self.export_project_meta(project).await?;
                let remote = self.obs.list_packages(project).await?;
                self.remove_stale_packages(&remote)?;
                remote
            }
        };
        info!(project, packages = packages.len(), "exporting packages");

        let this = self.clone();
        let project_name = project.to_string();
        let report = run_packages(packages, self.options.jobs, self.options.fail_fast, move |package| {
            let this = this.clone();
            let project = project_name.clone();
            async move { this.export_package(&project, &package).await }
        })
        .await?;

        self.storage.flush().await?;
        Ok(report.finish())
    }

    /// Collect the revision of every package without touching the tree.
    #[instrument(skip(self))]
    pub async fn export_revisions(
        &self,
        project: &str,
    ) -> Result<(SyncReport, RevisionTable), SyncError> {
        let packages = match self.options.package {
            Some(ref package) => vec![package.clone()],
            None => self.obs.list_packages(project).await?,
        };

        let table = Arc::new(Mutex::new(RevisionTable::new()));
        let this = self.clone();
        let shared = table.clone();
        let project_name = project.to_string();
        let report = run_packages(packages, self.options.jobs, self.options.fail_fast, move |package| {
            let this = this.clone();
            let table = shared.clone();
            let project = project_name.clone();
            async move {
                let sync_plan = plan(&package, &TargetState::default(), &this.options.flags);
                if !sync_plan.record_revision {
                    return Ok(());
                }
                let rev = this.resolver.revision_of(&project, &package).await?;
                debug!(package = %package, rev, "package revision");
                table.lock().await.insert(package, rev);
                Ok(())
            }
        })
        .await?;

        let table = table.lock().await.clone();
        Ok((report.finish(), table))
    }

    async fn export_project_meta(&self, project: &str) -> Result<(), SyncError> {
        let target = TargetState {
            meta_present: self.tree.path_exists(META_DIR),
        };
        let sync_plan = plan_project(&target, &self.options.flags);
        if !sync_plan.fetch_meta {
            debug!(project, "skipping project metadata");
            return Ok(());
        }
        for name in PROJECT_META_FILES {
            if *name == "_meta" && !sync_plan.fetch_meta_record {
                debug!(project, "skipping project _meta");
                continue;
            }
            let Some(raw) = self.obs.get_project_meta(project, name).await? else {
                debug!(project, file = name, "project metadata not present");
                continue;
            };
            if *name == "_meta" {
                MetadataRecord::from_bytes(MetadataKind::Project, &raw)?;
            }
            self.tree.write_path(self.tree.project_meta_path(name), &raw)?;
        }
        info!(project, "exported project metadata");
        Ok(())
    }

    fn remove_stale_packages(&self, remote: &[String]) -> Result<(), SyncError> {
        let remote: BTreeSet<&str> = remote.iter().map(String::as_str).collect();
        for package in self.tree.packages()? {
            if !remote.contains(package.as_str()) {
                info!(package = %package, "removing package gone from the build service");
                self.tree.remove_path(self.tree.package_path(&package))?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn export_package(&self, project: &str, package: &str) -> Result<(), SyncError> {
        let target = TargetState {
            meta_present: self.tree.path_exists(self.tree.package_path(package).join(META_DIR)),
        };
        let sync_plan = plan(package, &target, &self.options.flags);
        debug!(?sync_plan, "package plan");

        if sync_plan.fetch_meta {
            self.export_package_meta(project, package, sync_plan.fetch_meta_record)
                .await?;
        } else {
            debug!("skipping package metadata");
        }

        let resolved = self.resolver.resolve(project, package).await?;
        let linkinfo = self.tree.package_meta_path(package, LINKINFO_FILE);
        match resolved.provenance {
            Some(ref info) => self
                .tree
                .write_path(&linkinfo, link::provenance_document(info).as_bytes())?,
            None => self.tree.remove_path(&linkinfo)?,
        }

        if sync_plan.fetch_files {
            self.export_files(project, package, &resolved).await?;
        }
        info!(decision = resolved.decision.label(), "exported package");
        Ok(())
    }

    async fn export_package_meta(
        &self,
        project: &str,
        package: &str,
        with_record: bool,
    ) -> Result<(), SyncError> {
        for name in PACKAGE_META_FILES {
            if *name == "_meta" && !with_record {
                debug!("skipping package _meta");
                continue;
            }
            let Some(raw) = self.obs.get_package_meta(project, package, name).await? else {
                continue;
            };
            if *name == "_meta" {
                MetadataRecord::from_bytes(MetadataKind::Package, &raw)?;
            }
            self.tree
                .write_path(self.tree.package_meta_path(package, name), &raw)?;
        }
        Ok(())
    }

    async fn export_files(
        &self,
        project: &str,
        package: &str,
        resolved: &ResolvedPackage,
    ) -> Result<(), SyncError> {
        let local: HashMap<String, String> = self
            .tree
            .package_files(package)?
            .into_iter()
            .map(|f| (f.name, f.md5))
            .collect();
        let stored: HashMap<String, String> = self
            .storage
            .list(package)
            .await?
            .into_iter()
            .map(|r| (r.name, r.md5))
            .collect();

        let mut downloaded = 0usize;
        for entry in &resolved.listing.entries {
            let current = stored.get(&entry.name).or_else(|| local.get(&entry.name));
            if current == Some(&entry.md5) {
                continue;
            }
            let content = self
                .obs
                .get_file(project, package, &entry.name, &resolved.rev)
                .await?;
            let decision = self.policy.evaluate(&entry.name, &content);
            if decision.is_large() {
                let entry = FileEntry {
                    large: true,
                    ..entry.clone()
                };
                self.storage.put(package, &entry, content).await?;
            } else {
                if stored.contains_key(&entry.name) {
                    self.storage.untrack(package, &entry.name).await?;
                }
                self.tree
                    .write_path(self.tree.package_file_path(package, &entry.name), &content)?;
            }
            downloaded += 1;
        }

        let remote: BTreeSet<&str> = resolved
            .listing
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        for name in stored.keys().filter(|n| !remote.contains(n.as_str())) {
            self.storage.untrack(package, name).await?;
        }
        for name in local.keys().filter(|n| !remote.contains(n.as_str())) {
            debug!(file = %name, "removing file gone from the build service");
            self.tree
                .remove_path(self.tree.package_file_path(package, name))?;
        }

        debug!(
            files = resolved.listing.entries.len(),
            downloaded, "package files reconciled"
        );
        Ok(())
    }
}
