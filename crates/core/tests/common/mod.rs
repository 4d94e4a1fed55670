//! In-memory build service and tree helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use obsgit_core::errors::RemoteError;
use obsgit_core::git::GitTree;
use obsgit_core::models::{Directory, FileEntry, LinkInfo, Revision};
use obsgit_core::obs::parser::build_package_meta;
use obsgit_core::obs::BuildService;

pub fn md5_hex(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

#[derive(Debug, Clone, Default)]
pub struct FakePackage {
    pub meta: BTreeMap<String, Vec<u8>>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Uploaded with `rev=repository`, not yet committed.
    pub staged: BTreeMap<String, Vec<u8>>,
    pub rev: u64,
    pub link_info: Option<LinkInfo>,
    /// Expanded sources of a link, with their xsrcmd5.
    pub expanded: Option<(String, BTreeMap<String, Vec<u8>>)>,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeProject {
    pub meta: BTreeMap<String, Vec<u8>>,
    pub packages: BTreeMap<String, FakePackage>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub projects: BTreeMap<String, FakeProject>,
    pub calls: Vec<String>,
    /// Answer every `put_file` with a server error.
    pub fail_uploads: bool,
}

/// Build service kept in memory. Every call is recorded in `calls`.
#[derive(Debug, Default)]
pub struct FakeObs {
    pub state: Mutex<FakeState>,
}

fn not_found(what: String) -> RemoteError {
    RemoteError::NotFound(what)
}

fn listing(files: &BTreeMap<String, Vec<u8>>) -> Vec<FileEntry> {
    files
        .iter()
        .map(|(name, content)| FileEntry::from_content(name.clone(), content))
        .collect()
}

impl FakeObs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn add_project(&self, project: &str, meta: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.projects.entry(project.to_string()).or_default();
        entry.meta.insert("_meta".into(), meta.as_bytes().to_vec());
    }

    pub fn set_project_meta(&self, project: &str, name: &str, data: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.projects.entry(project.to_string()).or_default();
        entry.meta.insert(name.into(), data.as_bytes().to_vec());
    }

    pub fn add_package(&self, project: &str, package: &str, rev: u64, files: &[(&str, &[u8])]) {
        let mut state = self.state.lock().unwrap();
        let prj = state.projects.entry(project.to_string()).or_default();
        let mut pkg = FakePackage {
            rev,
            ..Default::default()
        };
        pkg.meta.insert(
            "_meta".into(),
            build_package_meta(project, package, false).into_bytes(),
        );
        for (name, content) in files {
            pkg.files.insert(name.to_string(), content.to_vec());
        }
        prj.packages.insert(package.to_string(), pkg);
    }

    /// Make `package` a link to `target_project/target_package`, expanding
    /// to `expanded`.
    pub fn add_link(
        &self,
        project: &str,
        package: &str,
        target_project: &str,
        target_package: &str,
        rev: u64,
        expanded: &[(&str, &[u8])],
    ) {
        let link = format!(
            "<link project=\"{}\" package=\"{}\"/>\n",
            target_project, target_package
        );
        self.add_package(project, package, rev, &[("_link", link.as_bytes())]);
        let expanded: BTreeMap<String, Vec<u8>> = expanded
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_vec()))
            .collect();
        let xsrcmd5 = format!("x{}", md5_hex(package.as_bytes()));
        let mut state = self.state.lock().unwrap();
        let pkg = state
            .projects
            .get_mut(project)
            .and_then(|p| p.packages.get_mut(package))
            .unwrap();
        pkg.link_info = Some(LinkInfo {
            project: target_project.into(),
            package: target_package.into(),
            srcmd5: Some(md5_hex(target_package.as_bytes())),
            xsrcmd5: Some(xsrcmd5.clone()),
            error: None,
        });
        pkg.expanded = Some((xsrcmd5, expanded));
    }

    pub fn package(&self, project: &str, package: &str) -> Option<FakePackage> {
        let state = self.state.lock().unwrap();
        state.projects.get(project)?.packages.get(package).cloned()
    }

    pub fn project(&self, project: &str) -> Option<FakeProject> {
        self.state.lock().unwrap().projects.get(project).cloned()
    }

    pub fn file(&self, project: &str, package: &str, name: &str) -> Option<Vec<u8>> {
        self.package(project, package)?.files.get(name).cloned()
    }

    pub fn file_text(&self, project: &str, package: &str, name: &str) -> Option<String> {
        self.file(project, package, name)
            .map(|c| String::from_utf8(c).unwrap())
    }

    fn with_package<T>(
        &self,
        project: &str,
        package: &str,
        f: impl FnOnce(&mut FakePackage) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let pkg = state
            .projects
            .get_mut(project)
            .and_then(|p| p.packages.get_mut(package))
            .ok_or_else(|| not_found(format!("{}/{}", project, package)))?;
        f(pkg)
    }
}

#[async_trait]
impl BuildService for FakeObs {
    async fn project_exists(&self, project: &str) -> Result<bool, RemoteError> {
        Ok(self.state.lock().unwrap().projects.contains_key(project))
    }

    async fn package_exists(&self, project: &str, package: &str) -> Result<bool, RemoteError> {
        Ok(self.package(project, package).is_some())
    }

    async fn list_packages(&self, project: &str) -> Result<Vec<String>, RemoteError> {
        let state = self.state.lock().unwrap();
        let prj = state
            .projects
            .get(project)
            .ok_or_else(|| not_found(project.to_string()))?;
        Ok(prj.packages.keys().cloned().collect())
    }

    async fn get_project_meta(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .projects
            .get(project)
            .and_then(|p| p.meta.get(name).cloned()))
    }

    async fn get_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(self
            .package(project, package)
            .and_then(|p| p.meta.get(name).cloned()))
    }

    async fn get_file_list(
        &self,
        project: &str,
        package: &str,
        rev: &Revision,
    ) -> Result<Directory, RemoteError> {
        self.record(format!("list {}/{}", project, package));
        let pkg = self
            .package(project, package)
            .ok_or_else(|| not_found(format!("{}/{}", project, package)))?;
        match rev {
            Revision::Latest => Ok(Directory {
                rev: Some(pkg.rev.to_string()),
                srcmd5: None,
                entries: listing(&pkg.files),
                link_info: pkg.link_info.clone(),
            }),
            Revision::Expanded(x) => match pkg.expanded {
                Some((ref xsrcmd5, ref files)) if xsrcmd5 == x => Ok(Directory {
                    rev: Some(pkg.rev.to_string()),
                    srcmd5: Some(x.clone()),
                    entries: listing(files),
                    link_info: pkg.link_info.clone(),
                }),
                _ => Err(not_found(format!("{}/{}@{}", project, package, x))),
            },
        }
    }

    async fn get_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        rev: &Revision,
    ) -> Result<Vec<u8>, RemoteError> {
        self.record(format!("get {}/{}/{}", project, package, name));
        let pkg = self
            .package(project, package)
            .ok_or_else(|| not_found(format!("{}/{}", project, package)))?;
        let files = match rev {
            Revision::Latest => pkg.files,
            Revision::Expanded(_) => pkg.expanded.map(|(_, f)| f).unwrap_or_default(),
        };
        files
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("{}/{}/{}", project, package, name)))
    }

    async fn put_project_meta(
        &self,
        project: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.record(format!("put_meta {}/{}", project, name));
        let mut state = self.state.lock().unwrap();
        if name != "_meta" && !state.projects.contains_key(project) {
            return Err(not_found(project.to_string()));
        }
        let prj = state.projects.entry(project.to_string()).or_default();
        prj.meta.insert(name.to_string(), data);
        Ok(())
    }

    async fn put_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.record(format!("put_meta {}/{}/{}", project, package, name));
        let mut state = self.state.lock().unwrap();
        let prj = state
            .projects
            .get_mut(project)
            .ok_or_else(|| not_found(project.to_string()))?;
        let pkg = prj.packages.entry(package.to_string()).or_default();
        pkg.meta.insert(name.to_string(), data);
        Ok(())
    }

    async fn put_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.record(format!("put {}/{}/{}", project, package, name));
        if self.state.lock().unwrap().fail_uploads {
            return Err(RemoteError::Http {
                status: 503,
                url: format!("{}/{}/{}", project, package, name),
            });
        }
        self.with_package(project, package, |pkg| {
            pkg.staged.insert(name.to_string(), data);
            Ok(())
        })
    }

    async fn delete_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
    ) -> Result<(), RemoteError> {
        self.record(format!("delete {}/{}/{}", project, package, name));
        self.with_package(project, package, |pkg| {
            pkg.files.remove(name);
            Ok(())
        })
    }

    async fn delete_package(&self, project: &str, package: &str) -> Result<(), RemoteError> {
        self.record(format!("delete_package {}/{}", project, package));
        let mut state = self.state.lock().unwrap();
        state
            .projects
            .get_mut(project)
            .and_then(|p| p.packages.remove(package))
            .map(|_| ())
            .ok_or_else(|| not_found(format!("{}/{}", project, package)))
    }

    async fn commit_filelist(
        &self,
        project: &str,
        package: &str,
        entries: &[FileEntry],
        comment: &str,
    ) -> Result<(), RemoteError> {
        self.record(format!("commit {}/{}", project, package));
        self.with_package(project, package, |pkg| {
            let mut files = BTreeMap::new();
            for entry in entries {
                let content = [pkg.staged.get(&entry.name), pkg.files.get(&entry.name)]
                    .into_iter()
                    .flatten()
                    .find(|c| md5_hex(c) == entry.md5)
                    .cloned()
                    .ok_or_else(|| RemoteError::Http {
                        status: 400,
                        url: format!("{}/{}/{} (md5 {})", project, package, entry.name, entry.md5),
                    })?;
                files.insert(entry.name.clone(), content);
            }
            pkg.files = files;
            pkg.staged.clear();
            pkg.rev += 1;
            pkg.comments.push(comment.to_string());
            Ok(())
        })
    }

    async fn create_package(
        &self,
        project: &str,
        package: &str,
        disabled: bool,
    ) -> Result<(), RemoteError> {
        self.record(format!("create {}/{}", project, package));
        let meta = build_package_meta(project, package, disabled).into_bytes();
        self.put_package_meta(project, package, "_meta", meta).await
    }
}

pub fn project_meta(name: &str) -> String {
    format!(
        "<project name=\"{0}\">\n  <title>{0}</title>\n  <description/>\n  \
         <person userid=\"alice\" role=\"maintainer\"/>\n  \
         <repository name=\"standard\">\n    <path project=\"{0}\" repository=\"standard\"/>\n    \
         <arch>x86_64</arch>\n  </repository>\n</project>\n",
        name
    )
}

pub fn read(tree: &GitTree, rel: impl AsRef<Path>) -> Option<String> {
    tree.read_path(rel)
        .unwrap()
        .map(|c| String::from_utf8(c).unwrap())
}
