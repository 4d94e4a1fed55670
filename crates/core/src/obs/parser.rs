//! Parsers and builders for build-service XML payloads.

use tracing::{debug, warn};

use crate::errors::MetadataError;
use crate::meta::xml::{self, Element};
use crate::models::{Directory, FileEntry, LinkInfo};

/// Parse a source listing (`<directory>`), including `<linkinfo>` when the
/// package is a link.
pub fn parse_directory(raw: &str) -> Result<Directory, MetadataError> {
    debug!("parsing directory XML ({} bytes)", raw.len());
    let doc = xml::parse(raw).map_err(|e| MetadataError::malformed("directory", e))?;
    let root = &doc.root;
    if root.name() != "directory" {
        return Err(MetadataError::malformed(
            "directory",
            format!("unexpected root <{}>", root.name()),
        ));
    }

    let mut entries = Vec::new();
    for entry in root.children().iter().filter(|c| c.name() == "entry") {
        match parse_entry(entry) {
            Some(file) => entries.push(file),
            None => warn!("skipping directory entry without a name"),
        }
    }

    let link_info = root.child("linkinfo").map(|li| LinkInfo {
        project: li.attr("project").unwrap_or_default().to_string(),
        package: li.attr("package").unwrap_or_default().to_string(),
        srcmd5: li.attr("srcmd5").map(str::to_string),
        xsrcmd5: li.attr("xsrcmd5").map(str::to_string),
        error: li.attr("error").map(str::to_string),
    });

    debug!(count = entries.len(), "parsed directory entries");
    Ok(Directory {
        rev: root.attr("rev").map(str::to_string),
        srcmd5: root.attr("srcmd5").map(str::to_string),
        entries,
        link_info,
    })
}

fn parse_entry(entry: &Element) -> Option<FileEntry> {
    let name = entry.attr("name")?;
    let size = entry.attr("size").and_then(|s| s.parse().ok()).unwrap_or(0);
    let md5 = entry.attr("md5").unwrap_or_default();
    Some(FileEntry::new(name, size, md5))
}

/// Names listed in a project listing (`GET /source/<project>`).
pub fn parse_entry_names(raw: &str) -> Result<Vec<String>, MetadataError> {
    let doc = xml::parse(raw).map_err(|e| MetadataError::malformed("directory", e))?;
    Ok(doc
        .root
        .children()
        .iter()
        .filter(|c| c.name() == "entry")
        .filter_map(|c| c.attr("name"))
        .map(str::to_string)
        .collect())
}

/// Body for `cmd=commitfilelist`.
pub fn build_filelist(entries: &[FileEntry]) -> String {
    let mut out = String::from("<directory>\n");
    for entry in entries {
        out.push_str(&format!(
            "  <entry name=\"{}\" md5=\"{}\"/>\n",
            xml::escape(&entry.name),
            xml::escape(&entry.md5)
        ));
    }
    out.push_str("</directory>\n");
    out
}

/// `_meta` for a new package. A disabled package is never built, published
/// or used for other builds.
pub fn build_package_meta(project: &str, package: &str, disabled: bool) -> String {
    let mut out = format!(
        "<package name=\"{}\" project=\"{}\">\n  <title/>\n  <description/>\n",
        xml::escape(package),
        xml::escape(project)
    );
    if disabled {
        for flag in ["build", "publish", "useforbuild"] {
            out.push_str(&format!("  <{0}>\n    <disable/>\n  </{0}>\n", flag));
        }
    }
    out.push_str("</package>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory() {
        let raw = r#"<directory name="gcc" rev="42" vrev="3" srcmd5="0a1b">
  <entry name="gcc.spec" md5="aaa" size="1200" mtime="1700000000"/>
  <entry name="gcc-13.2.tar.xz" md5="bbb" size="90000000" mtime="1700000000"/>
</directory>"#;
        let dir = parse_directory(raw).unwrap();
        assert_eq!(dir.revision(), Some(42));
        assert_eq!(dir.srcmd5.as_deref(), Some("0a1b"));
        assert_eq!(dir.entries.len(), 2);
        assert_eq!(dir.entries[1].name, "gcc-13.2.tar.xz");
        assert_eq!(dir.entries[1].size, 90_000_000);
        assert!(dir.link_info.is_none());
        assert!(!dir.has_link());
    }

    #[test]
    fn test_parse_directory_with_linkinfo() {
        let raw = r#"<directory name="B" rev="7" srcmd5="s1">
  <linkinfo project="P" package="A" srcmd5="s2" xsrcmd5="x9" lsrcmd5="l1"/>
  <entry name="_link" md5="m1" size="60"/>
</directory>"#;
        let dir = parse_directory(raw).unwrap();
        assert!(dir.has_link());
        let info = dir.link_info.unwrap();
        assert_eq!(info.project, "P");
        assert_eq!(info.package, "A");
        assert_eq!(info.xsrcmd5.as_deref(), Some("x9"));
    }

    #[test]
    fn test_parse_directory_rejects_other_roots() {
        assert!(parse_directory("<status code=\"ok\"/>").is_err());
        assert!(parse_directory("<directory").is_err());
    }

    #[test]
    fn test_parse_entry_names() {
        let raw = r#"<directory count="2"><entry name="A"/><entry name="B"/></directory>"#;
        assert_eq!(parse_entry_names(raw).unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_build_filelist() {
        let list = build_filelist(&[FileEntry::new("a&b.spec", 1, "m1")]);
        assert_eq!(
            list,
            "<directory>\n  <entry name=\"a&amp;b.spec\" md5=\"m1\"/>\n</directory>\n"
        );
        assert!(xml::parse(&list).is_ok());
    }

    #[test]
    fn test_build_package_meta_disabled() {
        let meta = build_package_meta("home:me", "storage", true);
        let doc = xml::parse(&meta).unwrap();
        assert_eq!(doc.root.attr("project"), Some("home:me"));
        for flag in ["build", "publish", "useforbuild"] {
            assert!(doc.root.child(flag).unwrap().child("disable").is_some());
        }
        assert!(!build_package_meta("P", "a", false).contains("disable"));
    }
}
