//! Import engine: pushes the local tree into a build-service project.
//!
//! The project may differ from the one the tree was exported from. Every
//! metadata document is rewritten from the origin project name (the `name`
//! of `.obs/_meta`) to the target project before it is pushed. Links are
//! not rewritten; a link that still names a project the target service
//! does not know fails its package.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::changes;
use crate::errors::{LinkError, RemoteError, SyncError};
use crate::git::GitTree;
use crate::link::LinkDescriptor;
use crate::meta::{self, MetadataKind, MetadataRecord};
use crate::models::{FileEntry, Revision, SyncReport};
use crate::obs::BuildService;
use crate::planner::{plan, plan_project, SyncFlags, TargetState};
use crate::pool::run_packages;
use crate::revisions::{self, RevisionTable};
use crate::storage::{StorageBackend, StorageReference};

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub flags: SyncFlags,
    /// Import a single package instead of the whole tree.
    pub package: Option<String>,
    pub jobs: usize,
    pub fail_fast: bool,
    pub remove_role_project_meta: bool,
    pub remove_role_package_meta: bool,
    /// Do not prepend the sync entry to `.changes` files.
    pub skip_changes_commit_hash: bool,
    /// Revisions substituted into `Release:` placeholders of recipes.
    pub revisions: Option<RevisionTable>,
}

/// Where the content of a file to upload comes from.
enum Source {
    Tree(Vec<u8>),
    Storage(StorageReference),
}

#[derive(Clone)]
pub struct Importer {
    obs: Arc<dyn BuildService>,
    tree: Arc<GitTree>,
    storage: Arc<dyn StorageBackend>,
    options: Arc<ImportOptions>,
}

impl Importer {
    pub fn new(
        obs: Arc<dyn BuildService>,
        tree: Arc<GitTree>,
        storage: Arc<dyn StorageBackend>,
        options: ImportOptions,
    ) -> Self {
        Self {
            obs,
            tree,
            storage,
            options: Arc::new(options),
        }
    }

    /// Project `_meta` of the tree.
    fn origin_record(&self) -> Result<MetadataRecord, SyncError> {
        let path = self.tree.project_meta_path("_meta");
        let raw = self.tree.read_path(&path)?.ok_or_else(|| {
            SyncError::InvalidTree(format!("missing {}", path.display()))
        })?;
        Ok(MetadataRecord::from_bytes(MetadataKind::Project, &raw)?)
    }

    /// Import the tree into `project`. Package failures end up in the
    /// report; an `Err` means the run as a whole could not proceed.
    #[instrument(skip(self))]
    pub async fn import(&self, project: &str) -> Result<SyncReport, SyncError> {
        if !self.tree.exists() {
            return Err(SyncError::InvalidTree(format!(
                "{} is not a git repository",
                self.tree.root().display()
            )));
        }
        let origin = self.origin_record()?;
        let origin = origin.name().to_string();
        info!(origin = %origin, "importing tree");

        let local = self.tree.packages()?;
        let packages = match self.options.package {
            Some(ref package) => {
                if !local.contains(package) {
                    return Err(SyncError::InvalidTree(format!(
                        "package '{}' not found in the tree",
                        package
                    )));
                }
                if !self.obs.project_exists(project).await? {
                    self.import_project_meta(project, &origin, false).await?;
                }
                vec![package.clone()]
            }
            None => {
                let remote_exists = self.obs.project_exists(project).await?;
                self.import_project_meta(project, &origin, remote_exists).await?;
                local.clone()
            }
        };

        // Links go last so their targets exist by then.
        let (links, direct): (Vec<String>, Vec<String>) = packages
            .into_iter()
            .partition(|p| self.tree.path_exists(self.tree.package_file_path(p, "_link")));

        let mut report = self.run_phase(project, &origin, direct).await?;
        if report.skipped.is_empty() {
            let linked = self.run_phase(project, &origin, links).await?;
            report.succeeded.extend(linked.succeeded);
            report.failed.extend(linked.failed);
            report.skipped.extend(linked.skipped);
        } else {
            report.skipped.extend(links);
        }

        if self.options.package.is_none() {
            let local: BTreeSet<&str> = local.iter().map(String::as_str).collect();
            for package in self.obs.list_packages(project).await? {
                if local.contains(package.as_str()) {
                    continue;
                }
                match self.obs.delete_package(project, &package).await {
                    Ok(()) => info!(package = %package, "deleted package missing from the tree"),
                    Err(e) => {
                        error!(package = %package, error = %e, "could not delete package");
                        report.failure(package, &e);
                    }
                }
            }
        }

        Ok(report.finish())
    }

    async fn run_phase(
        &self,
        project: &str,
        origin: &str,
        packages: Vec<String>,
    ) -> Result<SyncReport, SyncError> {
        let this = self.clone();
        let project = project.to_string();
        let origin = origin.to_string();
        run_packages(packages, self.options.jobs, self.options.fail_fast, move |package| {
            let this = this.clone();
            let project = project.clone();
            let origin = origin.clone();
            async move { this.import_package(&project, &origin, &package).await }
        })
        .await
    }

    async fn import_project_meta(
        &self,
        project: &str,
        origin: &str,
        remote_exists: bool,
    ) -> Result<(), SyncError> {
        let sync_plan = plan_project(
            &TargetState {
                meta_present: remote_exists,
            },
            &self.options.flags,
        );
        if !sync_plan.fetch_meta {
            debug!(project, "skipping project metadata");
            return Ok(());
        }

        // `_meta` first: pushing it creates the project.
        if sync_plan.fetch_meta_record {
            let mut record = self.origin_record()?;
            if self.options.remove_role_project_meta {
                record = record.without_roles()?;
            }
            let record = record.rewrite_references(origin, project)?;
            self.obs
                .put_project_meta(project, "_meta", record.into_bytes())
                .await?;
        }

        if let Some(raw) = self.tree.read_path(self.tree.project_meta_path("_config"))? {
            let text = String::from_utf8_lossy(&raw);
            let config = meta::substitute(&text, origin, project);
            self.obs
                .put_project_meta(project, "_config", config.into_bytes())
                .await?;
        }
        info!(project, "imported project metadata");
        Ok(())
    }

    /// Fail when the package is a link whose target cannot be resolved on
    /// the destination.
    async fn check_link(&self, project: &str, package: &str) -> Result<(), SyncError> {
        let Some(raw) = self
            .tree
            .read_path(self.tree.package_file_path(package, "_link"))?
        else {
            return Ok(());
        };
        let link = LinkDescriptor::parse(&raw, project, package)?;
        let resolvable = if link.is_cross_project(project) {
            self.obs.project_exists(&link.target_project).await?
        } else {
            self.tree
                .path_exists(self.tree.package_path(&link.target_package))
                || self
                    .obs
                    .package_exists(project, &link.target_package)
                    .await?
        };
        if !resolvable {
            return Err(LinkError::Unresolved {
                package: package.to_string(),
                target_project: link.target_project,
            }
            .into());
        }
        Ok(())
    }

    #[instrument(skip(self, origin))]
    async fn import_package(
        &self,
        project: &str,
        origin: &str,
        package: &str,
    ) -> Result<(), SyncError> {
        self.check_link(project, package).await?;

        let remote_exists = self.obs.package_exists(project, package).await?;
        let sync_plan = plan(
            package,
            &TargetState {
                meta_present: remote_exists,
            },
            &self.options.flags,
        );
        debug!(?sync_plan, "package plan");

        if sync_plan.fetch_meta_record {
            self.import_package_meta(project, origin, package).await?;
        } else {
            debug!("skipping package metadata");
        }

        if sync_plan.fetch_files {
            self.import_files(project, package).await?;
        }
        info!("imported package");
        Ok(())
    }

    async fn import_package_meta(
        &self,
        project: &str,
        origin: &str,
        package: &str,
    ) -> Result<(), SyncError> {
        let path = self.tree.package_meta_path(package, "_meta");
        let raw = self.tree.read_path(&path)?.ok_or_else(|| {
            SyncError::InvalidTree(format!("missing {}", path.display()))
        })?;
        let mut record = MetadataRecord::from_bytes(MetadataKind::Package, &raw)?;
        let package_origin = record.origin_project().to_string();
        if package_origin != origin {
            warn!(
                package_origin = %package_origin,
                project_origin = %origin,
                "package metadata names a different project, please review it"
            );
        }
        if self.options.remove_role_package_meta {
            record = record.without_roles()?;
        }
        let record = record.rewrite_references(&package_origin, project)?;
        self.obs
            .put_package_meta(project, package, "_meta", record.into_bytes())
            .await?;
        Ok(())
    }

    /// Content of a tree file as it is pushed.
    fn prepare(&self, package: &str, name: &str, content: Vec<u8>) -> Result<Vec<u8>, SyncError> {
        if changes::is_changes_file(name) && !self.options.skip_changes_commit_hash {
            return match self.tree.last_change(package)? {
                Some(commit) => Ok(changes::annotate(&content, &commit)),
                None => {
                    error!(package, "package not found in git history");
                    Ok(content)
                }
            };
        }
        if name.ends_with(".spec") {
            let rev = self
                .options
                .revisions
                .as_ref()
                .and_then(|table| table.get(package));
            if let Some(rev) = rev {
                if let Some(adjusted) = revisions::apply_release(&String::from_utf8_lossy(&content), rev) {
                    debug!(file = name, rev, "adjusted release");
                    return Ok(adjusted.into_bytes());
                }
            }
        }
        Ok(content)
    }

    async fn import_files(&self, project: &str, package: &str) -> Result<(), SyncError> {
        let stored: BTreeMap<String, StorageReference> = self
            .storage
            .list(package)
            .await?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        let mut desired: BTreeMap<String, (FileEntry, Source)> = BTreeMap::new();
        for file in self.tree.package_files(package)? {
            if stored.contains_key(&file.name) {
                continue;
            }
            let raw = self
                .tree
                .read_path(self.tree.package_file_path(package, &file.name))?
                .unwrap_or_default();
            let content = self.prepare(package, &file.name, raw)?;
            let entry = FileEntry::from_content(file.name.clone(), &content);
            desired.insert(file.name, (entry, Source::Tree(content)));
        }
        for (name, reference) in stored {
            let mut entry = FileEntry::new(name.clone(), 0, reference.md5.clone());
            entry.large = true;
            desired.insert(name, (entry, Source::Storage(reference)));
        }

        let remote: BTreeMap<String, String> =
            match self.obs.get_file_list(project, package, &Revision::Latest).await {
                Ok(listing) => listing.entries.into_iter().map(|e| (e.name, e.md5)).collect(),
                Err(RemoteError::NotFound(_)) => BTreeMap::new(),
                Err(e) => return Err(e.into()),
            };

        let mut changed = false;
        for (name, (entry, source)) in &desired {
            if remote.get(name) == Some(&entry.md5) {
                continue;
            }
            let content = match source {
                Source::Tree(content) => content.clone(),
                Source::Storage(reference) => self.storage.get(reference).await?,
            };
            self.obs.put_file(project, package, name, content).await?;
            changed = true;
        }
        for name in remote.keys().filter(|n| !desired.contains_key(*n)) {
            self.obs.delete_file(project, package, name).await?;
            changed = true;
        }

        if changed {
            let entries: Vec<FileEntry> = desired.into_values().map(|(entry, _)| entry).collect();
            let head = self.tree.head_hash()?.unwrap_or_else(|| "unknown".into());
            self.obs
                .commit_filelist(project, package, &entries, &format!("Import {}", head))
                .await?;
            info!(files = entries.len(), "committed package files");
        } else {
            debug!("package files up to date");
        }
        Ok(())
    }
}
