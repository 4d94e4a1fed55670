//! Package links: parsing `_link`, choosing between keeping and expanding a
//! link, and following link chains.
//!
//! The choice itself is the pure function [`decide`]; [`LinkResolver`] adds
//! the remote lookups around it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{LinkError, MetadataError, RemoteError};
use crate::meta::xml;
use crate::models::{Directory, LinkInfo, Revision};
use crate::obs::BuildService;

/// How linked packages are exported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPolicy {
    /// Keep the `_link` file, never fetch expanded sources.
    #[default]
    Never,
    /// Always store the expanded sources instead of the `_link` file.
    Always,
    /// Expand links into other projects, keep links inside the project.
    Auto,
}

impl std::str::FromStr for LinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown link policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for LinkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Always => write!(f, "always"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

// ---------------------------------------------------------------------------
// Link descriptor
// ---------------------------------------------------------------------------

/// Parsed content of a `_link` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDescriptor {
    pub target_project: String,
    pub target_package: String,
    /// Pinned revision of the target, if any.
    pub rev: Option<String>,
    /// The link carries `<patches>` applied on top of the target.
    pub has_patches: bool,
}

impl LinkDescriptor {
    /// Parse `_link` content of `project/package`. Missing `project` or
    /// `package` attributes default to the linking package's own.
    pub fn parse(raw: &[u8], project: &str, package: &str) -> Result<Self, LinkError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| MetadataError::malformed("link", e.to_string()))?;
        let doc = xml::parse(text).map_err(|e| MetadataError::malformed("link", e))?;
        if doc.root.name() != "link" {
            return Err(MetadataError::malformed(
                "link",
                format!("expected <link> root, found <{}>", doc.root.name()),
            )
            .into());
        }

        let link = Self {
            target_project: non_empty(doc.root.attr("project")).unwrap_or(project).to_string(),
            target_package: non_empty(doc.root.attr("package")).unwrap_or(package).to_string(),
            rev: non_empty(doc.root.attr("rev")).map(str::to_string),
            has_patches: doc
                .root
                .child("patches")
                .is_some_and(|p| !p.children().is_empty()),
        };

        if link.target_project == project && link.target_package == package {
            let id = format!("{}/{}", project, package);
            return Err(LinkError::Cycle {
                chain: vec![id.clone(), id],
            });
        }
        Ok(link)
    }

    pub fn is_cross_project(&self, project: &str) -> bool {
        self.target_project != project
    }

    pub fn target(&self) -> String {
        format!("{}/{}", self.target_project, self.target_package)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What to do with one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDecision {
    /// Not a link.
    Direct,
    /// Store the `_link` file as-is.
    Keep(LinkDescriptor),
    /// Store the expanded sources, without `_link`.
    Expand(LinkDescriptor),
}

impl LinkDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Keep(_) => "keep",
            Self::Expand(_) => "expand",
        }
    }
}

/// Apply `policy` to a package of `project` with an optional link.
pub fn decide(policy: LinkPolicy, project: &str, link: Option<&LinkDescriptor>) -> LinkDecision {
    let Some(link) = link else {
        return LinkDecision::Direct;
    };
    let expand = match policy {
        LinkPolicy::Never => false,
        LinkPolicy::Always => true,
        LinkPolicy::Auto => link.is_cross_project(project),
    };
    if expand {
        LinkDecision::Expand(link.clone())
    } else {
        LinkDecision::Keep(link.clone())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// A package listing after link handling.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub decision: LinkDecision,
    /// Files to materialize. An expanded listing never contains `_link`.
    pub listing: Directory,
    /// Revision to download the files at.
    pub rev: Revision,
    /// Provenance of expanded sources.
    pub provenance: Option<LinkInfo>,
}

/// Classifies packages and follows link chains against a build service.
#[derive(Clone)]
pub struct LinkResolver {
    obs: Arc<dyn BuildService>,
    policy: LinkPolicy,
    strict: bool,
}

impl LinkResolver {
    pub fn new(obs: Arc<dyn BuildService>, policy: LinkPolicy, strict: bool) -> Self {
        Self { obs, policy, strict }
    }

    pub fn policy(&self) -> LinkPolicy {
        self.policy
    }

    /// Read and parse the `_link` of a package, if it is a link.
    async fn link_of(
        &self,
        project: &str,
        package: &str,
        listing: &Directory,
    ) -> Result<Option<LinkDescriptor>, LinkError> {
        if !listing.has_link() {
            return Ok(None);
        }
        let raw = self
            .obs
            .get_file(project, package, "_link", &Revision::Latest)
            .await?;
        LinkDescriptor::parse(&raw, project, package).map(Some)
    }

    /// Walk the chain starting at `project/package`, failing on the first
    /// repeated package. A target that does not exist ends the walk.
    async fn check_chain(
        &self,
        project: &str,
        package: &str,
        first: &LinkDescriptor,
    ) -> Result<(), LinkError> {
        let mut visited = HashSet::new();
        let mut chain = vec![format!("{}/{}", project, package)];
        visited.insert((project.to_string(), package.to_string()));

        let mut next = Some(first.clone());
        while let Some(link) = next.take() {
            chain.push(link.target());
            let key = (link.target_project.clone(), link.target_package.clone());
            if !visited.insert(key) {
                return Err(LinkError::Cycle { chain });
            }
            let listing = match self
                .obs
                .get_file_list(&link.target_project, &link.target_package, &Revision::Latest)
                .await
            {
                Ok(listing) => listing,
                Err(RemoteError::NotFound(_)) => {
                    warn!(link = %link.target(), "link target does not exist");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            next = self
                .link_of(&link.target_project, &link.target_package, &listing)
                .await?;
        }
        debug!(chain = %chain.join(" -> "), "link chain resolved");
        Ok(())
    }

    fn check_kept(&self, project: &str, package: &str, link: &LinkDescriptor) -> Result<(), LinkError> {
        if !link.is_cross_project(project) {
            return Ok(());
        }
        if self.strict {
            return Err(LinkError::CrossProject {
                project: project.to_string(),
                package: package.to_string(),
                target_project: link.target_project.clone(),
                target_package: link.target_package.clone(),
            });
        }
        warn!(
            project,
            package,
            target = %link.target(),
            "keeping link that points outside the project"
        );
        Ok(())
    }

    /// Classify a package and return the listing to materialize.
    pub async fn resolve(&self, project: &str, package: &str) -> Result<ResolvedPackage, LinkError> {
        let listing = self
            .obs
            .get_file_list(project, package, &Revision::Latest)
            .await?;
        let link = self.link_of(project, package, &listing).await?;
        if let Some(ref link) = link {
            self.check_chain(project, package, link).await?;
        }

        let decision = decide(self.policy, project, link.as_ref());
        debug!(project, package, decision = decision.label(), "link decision");
        match decision {
            LinkDecision::Direct => Ok(ResolvedPackage {
                decision,
                listing,
                rev: Revision::Latest,
                provenance: None,
            }),
            LinkDecision::Keep(ref link) => {
                self.check_kept(project, package, link)?;
                Ok(ResolvedPackage {
                    decision,
                    listing,
                    rev: Revision::Latest,
                    provenance: None,
                })
            }
            LinkDecision::Expand(ref link) => {
                let info = listing.link_info.clone().unwrap_or_default();
                let xsrcmd5 = match (&info.error, &info.xsrcmd5) {
                    (None, Some(x)) => x.clone(),
                    _ => {
                        return Err(LinkError::Unresolved {
                            package: package.to_string(),
                            target_project: link.target_project.clone(),
                        })
                    }
                };
                let rev = Revision::Expanded(xsrcmd5);
                let mut expanded = self.obs.get_file_list(project, package, &rev).await?;
                expanded.entries.retain(|e| e.name != "_link");
                Ok(ResolvedPackage {
                    decision,
                    listing: expanded,
                    rev,
                    provenance: Some(info),
                })
            }
        }
    }

    /// Revision counter of a package. For a link this is the counter of the
    /// package it points to.
    pub async fn revision_of(&self, project: &str, package: &str) -> Result<u64, LinkError> {
        let listing = self
            .obs
            .get_file_list(project, package, &Revision::Latest)
            .await?;
        let Some(link) = self.link_of(project, package, &listing).await? else {
            return Ok(self.obs.get_revision_count(project, package).await?);
        };
        self.check_chain(project, package, &link).await?;
        if self.policy == LinkPolicy::Never {
            self.check_kept(project, package, &link)?;
        }
        Ok(self
            .obs
            .get_revision_count(&link.target_project, &link.target_package)
            .await?)
    }
}

/// Serialized provenance of an expanded link, stored as `.obs/_linkinfo`.
pub fn provenance_document(info: &LinkInfo) -> String {
    let mut out = format!(
        "<linkinfo project=\"{}\" package=\"{}\"",
        xml::escape(&info.project),
        xml::escape(&info.package)
    );
    if let Some(ref srcmd5) = info.srcmd5 {
        out.push_str(&format!(" srcmd5=\"{}\"", xml::escape(srcmd5)));
    }
    if let Some(ref xsrcmd5) = info.xsrcmd5 {
        out.push_str(&format!(" xsrcmd5=\"{}\"", xml::escape(xsrcmd5)));
    }
    out.push_str("/>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(project: &str, package: &str) -> LinkDescriptor {
        LinkDescriptor {
            target_project: project.into(),
            target_package: package.into(),
            rev: None,
            has_patches: false,
        }
    }

    #[test]
    fn test_parse_link_defaults_to_own_project() {
        let l = LinkDescriptor::parse(br#"<link package="A"/>"#, "P", "B").unwrap();
        assert_eq!(l, link("P", "A"));
        assert!(!l.is_cross_project("P"));
    }

    #[test]
    fn test_parse_link_with_patches_and_rev() {
        let raw = br#"<link project="openSUSE:Factory" package="gcc" rev="12">
  <patches>
    <apply name="fix.diff"/>
  </patches>
</link>"#;
        let l = LinkDescriptor::parse(raw, "devel:gcc", "gcc").unwrap();
        assert_eq!(l.target(), "openSUSE:Factory/gcc");
        assert_eq!(l.rev.as_deref(), Some("12"));
        assert!(l.has_patches);
        assert!(l.is_cross_project("devel:gcc"));
    }

    #[test]
    fn test_parse_self_link_is_cycle() {
        let err = LinkDescriptor::parse(br#"<link project="P" package="A"/>"#, "P", "A").unwrap_err();
        assert!(matches!(err, LinkError::Cycle { ref chain } if chain.len() == 2));

        let err = LinkDescriptor::parse(b"<link/>", "P", "A").unwrap_err();
        assert!(matches!(err, LinkError::Cycle { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            LinkDescriptor::parse(b"<package name=\"x\"/>", "P", "A"),
            Err(LinkError::Metadata(_))
        ));
        assert!(LinkDescriptor::parse(b"<link", "P", "A").is_err());
    }

    #[test]
    fn test_decide_direct() {
        for policy in [LinkPolicy::Never, LinkPolicy::Always, LinkPolicy::Auto] {
            assert_eq!(decide(policy, "P", None), LinkDecision::Direct);
        }
    }

    #[test]
    fn test_decide_never_and_always() {
        let inside = link("P", "A");
        let outside = link("Q", "A");
        assert_eq!(decide(LinkPolicy::Never, "P", Some(&outside)), LinkDecision::Keep(outside.clone()));
        assert_eq!(decide(LinkPolicy::Always, "P", Some(&inside)), LinkDecision::Expand(inside));
        assert_eq!(decide(LinkPolicy::Always, "P", Some(&outside)), LinkDecision::Expand(outside));
    }

    #[test]
    fn test_decide_auto_same_project_matches_never() {
        let inside = link("P", "A");
        assert_eq!(
            decide(LinkPolicy::Auto, "P", Some(&inside)),
            decide(LinkPolicy::Never, "P", Some(&inside))
        );
        let outside = link("Q", "A");
        assert_eq!(decide(LinkPolicy::Auto, "P", Some(&outside)), LinkDecision::Expand(outside));
    }

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!("auto".parse::<LinkPolicy>().unwrap(), LinkPolicy::Auto);
        assert!("sometimes".parse::<LinkPolicy>().is_err());
        assert_eq!(LinkPolicy::Always.to_string(), "always");
    }

    #[test]
    fn test_provenance_document() {
        let info = LinkInfo {
            project: "Q".into(),
            package: "A".into(),
            srcmd5: Some("s".into()),
            xsrcmd5: Some("x".into()),
            error: None,
        };
        let doc = provenance_document(&info);
        assert_eq!(doc, "<linkinfo project=\"Q\" package=\"A\" srcmd5=\"s\" xsrcmd5=\"x\"/>\n");
        assert!(xml::parse(&doc).is_ok());
    }
}
