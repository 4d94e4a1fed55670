//! Project and package metadata records.

use tracing::debug;

use super::xml::{self, Document, Element};
use crate::errors::MetadataError;

/// Which kind of `_meta` document a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// `<project name="...">`
    Project,
    /// `<package name="..." project="...">`
    Package,
}

impl MetadataKind {
    fn root(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Package => "package",
        }
    }

    /// Attribute holding the origin project name.
    fn origin_attr(self) -> &'static str {
        match self {
            Self::Project => "name",
            Self::Package => "project",
        }
    }
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.root())
    }
}

/// A project or package metadata document.
///
/// The raw text is the source of truth: [`serialize`](Self::serialize)
/// returns it byte for byte, so elements and attributes this crate does not
/// understand survive a fetch/store/push cycle untouched. The parsed tree is
/// kept alongside for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    kind: MetadataKind,
    raw: String,
    doc: Document,
}

impl MetadataRecord {
    /// Parse a metadata document, checking the root element and its required
    /// attributes.
    pub fn parse(kind: MetadataKind, raw: &str) -> Result<Self, MetadataError> {
        let doc = xml::parse(raw).map_err(|e| MetadataError::malformed(kind.to_string(), e))?;

        if doc.root.name() != kind.root() {
            return Err(MetadataError::malformed(
                kind.to_string(),
                format!("expected <{}> root, found <{}>", kind.root(), doc.root.name()),
            ));
        }
        for required in ["name", kind.origin_attr()] {
            match doc.root.attr(required) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(MetadataError::malformed(
                        kind.to_string(),
                        format!("missing required attribute '{}'", required),
                    ))
                }
            }
        }

        Ok(Self {
            kind,
            raw: raw.to_string(),
            doc,
        })
    }

    /// Parse from bytes as read from disk or the network.
    pub fn from_bytes(kind: MetadataKind, raw: &[u8]) -> Result<Self, MetadataError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| MetadataError::malformed(kind.to_string(), e.to_string()))?;
        Self::parse(kind, text)
    }

    pub fn serialize(&self) -> &str {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw.into_bytes()
    }

    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    /// The `name` attribute of the root element.
    pub fn name(&self) -> &str {
        self.doc.root.attr("name").unwrap_or_default()
    }

    /// The project this record claims to come from. For a project this is
    /// its own name; for a package it is the `project` attribute.
    pub fn origin_project(&self) -> &str {
        self.doc.root.attr(self.kind.origin_attr()).unwrap_or_default()
    }

    pub fn root(&self) -> &Element {
        &self.doc.root
    }

    /// Replace every occurrence of `old` by `new` in attribute values and
    /// text content. Element and attribute names are never touched.
    ///
    /// This is plain substring matching. Occurrences of `old` that are
    /// already part of an occurrence of `new` are left alone, so applying the
    /// same rewrite twice gives the same result as applying it once. A name
    /// edited by hand after an earlier rewrite is not recognised.
    pub fn rewrite_references(&self, old: &str, new: &str) -> Result<Self, MetadataError> {
        if old.is_empty() || old == new || !self.raw.contains(&xml::escape(old)) {
            return Ok(self.clone());
        }

        let (old_raw, new_raw) = (xml::escape(old), xml::escape(new));
        let mut out = String::with_capacity(self.raw.len());
        let mut last = 0;
        for range in &self.doc.values {
            out.push_str(&self.raw[last..range.start]);
            out.push_str(&substitute(&self.raw[range.clone()], &old_raw, &new_raw));
            last = range.end;
        }
        out.push_str(&self.raw[last..]);

        debug!(kind = %self.kind, old, new, "rewrote metadata references");
        Self::parse(self.kind, &out)
    }

    /// Drop every `<person>` and `<group>` element.
    pub fn without_roles(&self) -> Result<Self, MetadataError> {
        let mut spans: Vec<_> = ["person", "group"]
            .iter()
            .flat_map(|name| self.doc.root.descendants(name))
            .map(Element::span)
            .collect();
        if spans.is_empty() {
            return Ok(self.clone());
        }
        spans.sort_by_key(|s| s.start);

        let mut out = String::with_capacity(self.raw.len());
        let mut last = 0;
        for span in spans {
            // Roles are leaves in practice; skip anything nested in a span
            // that was already dropped.
            if span.start < last {
                continue;
            }
            out.push_str(&self.raw[last..span.start]);
            last = drop_blank_line(&self.raw, &mut out, span.end);
        }
        out.push_str(&self.raw[last..]);

        Self::parse(self.kind, &out)
    }
}

/// After removing an element, also remove its line if nothing else is left
/// on it. Returns the position to continue copying from.
fn drop_blank_line(raw: &str, out: &mut String, end: usize) -> usize {
    let line_start = out.rfind('\n').map_or(0, |i| i + 1);
    let rest = &raw[end..];
    let line_end = rest.find('\n');
    let before_blank = out[line_start..].trim().is_empty();
    match line_end {
        Some(n) if before_blank && rest[..n].trim().is_empty() => {
            out.truncate(line_start);
            end + n + 1
        }
        _ => end,
    }
}

/// Replace `old` with `new` in free text, leaving existing occurrences of
/// `new` untouched. Used for documents that are not XML, such as `_config`.
///
/// The result never contains a rewritable occurrence of `old`, so applying
/// the same substitution twice gives the same text as applying it once.
pub fn substitute(text: &str, old: &str, new: &str) -> String {
    if old.is_empty() || old == new {
        return text.to_string();
    }
    if new.contains(old) {
        return substitute_pass(text, old, new, true);
    }

    // A replacement can join the text that follows it into a fresh
    // occurrence, e.g. `A:B:B` with `A:B` -> `A`. Repeat until none is left.
    let mut current = substitute_pass(text, old, new, false);
    let mut passes = text.len();
    while passes > 0 && current.contains(old) {
        current = substitute_pass(&current, old, new, false);
        passes -= 1;
    }
    current
}

fn substitute_pass(text: &str, old: &str, new: &str, guard: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        if guard && rest.starts_with(new) {
            out.push_str(new);
            i += new.len();
        } else if rest.starts_with(old) {
            out.push_str(new);
            i += old.len();
        } else {
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            i += c.len_utf8().max(1);
        }
    }
    out
}
