//! Minimal, lossless XML reader for build-service documents.
//!
//! The reader builds a small element tree for lookups and remembers the byte
//! ranges of every attribute value and text run, so callers can rewrite those
//! values in place while every other byte of the document (declarations,
//! comments, whitespace, attribute quoting) is kept verbatim.

use std::ops::Range;

/// A parsed element. Attribute values and text are entity-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
    span: Range<usize>,
}

impl Element {
    fn new(name: String, start: usize) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            children: Vec::new(),
            text: String::new(),
            span: start..start,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Direct text content, trimmed.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// All descendants (depth-first, document order) with the given name.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    /// Byte range of the whole element (start tag through end tag).
    pub(crate) fn span(&self) -> Range<usize> {
        self.span.clone()
    }
}

/// A parsed document: the root element plus the rewritable byte ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Element,
    /// Ranges of raw attribute values and text runs, in document order.
    pub(crate) values: Vec<Range<usize>>,
}

/// Parse a complete document with exactly one root element.
pub fn parse(input: &str) -> Result<Document, String> {
    let mut pos = 0;
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut values = Vec::new();

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with("<!--") {
            let end = rest.find("-->").ok_or("unterminated comment")?;
            pos += end + 3;
        } else if rest.starts_with("<![CDATA[") {
            let end = rest.find("]]>").ok_or("unterminated CDATA section")?;
            let top = stack.last_mut().ok_or("CDATA outside of the root element")?;
            top.text.push_str(&rest[9..end]);
            pos += end + 3;
        } else if rest.starts_with("<?") {
            let end = rest.find("?>").ok_or("unterminated processing instruction")?;
            pos += end + 2;
        } else if rest.starts_with("<!") {
            let end = rest.find('>').ok_or("unterminated declaration")?;
            pos += end + 1;
        } else if rest.starts_with("</") {
            let end = rest.find('>').ok_or("unterminated end tag")?;
            let name = rest[2..end].trim();
            let mut element = stack
                .pop()
                .ok_or_else(|| format!("unexpected end tag </{}>", name))?;
            if element.name != name {
                return Err(format!(
                    "mismatched end tag: expected </{}>, found </{}>",
                    element.name, name
                ));
            }
            pos += end + 1;
            element.span.end = pos;
            close_element(element, &mut stack, &mut root)?;
        } else if rest.starts_with('<') {
            let (element, self_closing, consumed) = parse_start_tag(input, pos, &mut values)?;
            pos += consumed;
            if self_closing {
                let mut element = element;
                element.span.end = pos;
                close_element(element, &mut stack, &mut root)?;
            } else {
                if stack.is_empty() && root.is_some() {
                    return Err("more than one root element".into());
                }
                stack.push(element);
            }
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            let raw = &rest[..end];
            match stack.last_mut() {
                Some(top) => {
                    top.text.push_str(&unescape(raw));
                    values.push(pos..pos + end);
                }
                None if raw.trim().is_empty() => {}
                None => return Err("text outside of the root element".into()),
            }
            pos += end;
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element <{}>", open.name));
    }
    let root = root.ok_or("document has no root element")?;
    Ok(Document { root, values })
}

fn close_element(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_some() {
                return Err("more than one root element".into());
            }
            *root = Some(element);
        }
    }
    Ok(())
}

/// Parse the start tag beginning at `start`. Returns the element, whether it
/// is self-closing, and the number of bytes consumed.
fn parse_start_tag(
    input: &str,
    start: usize,
    values: &mut Vec<Range<usize>>,
) -> Result<(Element, bool, usize), String> {
    let bytes = input.as_bytes();
    let mut pos = start + 1;
    let name_start = pos;
    while pos < bytes.len() && is_name_byte(bytes[pos]) {
        pos += 1;
    }
    if pos == name_start {
        return Err(format!("invalid tag name at byte {}", start));
    }
    let mut element = Element::new(input[name_start..pos].to_string(), start);

    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match bytes.get(pos) {
            None => return Err(format!("unterminated tag <{}>", element.name)),
            Some(b'>') => return Ok((element, false, pos + 1 - start)),
            Some(b'/') => {
                return if bytes.get(pos + 1) == Some(&b'>') {
                    Ok((element, true, pos + 2 - start))
                } else {
                    Err(format!("stray '/' in tag <{}>", element.name))
                };
            }
            Some(_) => {}
        }

        let attr_start = pos;
        while pos < bytes.len() && is_name_byte(bytes[pos]) {
            pos += 1;
        }
        if pos == attr_start {
            return Err(format!("invalid attribute in tag <{}>", element.name));
        }
        let attr_name = input[attr_start..pos].to_string();
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'=') {
            return Err(format!("attribute '{}' has no value", attr_name));
        }
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let quote = match bytes.get(pos) {
            Some(q @ (b'"' | b'\'')) => *q,
            _ => return Err(format!("attribute '{}' value is not quoted", attr_name)),
        };
        pos += 1;
        let value_start = pos;
        while pos < bytes.len() && bytes[pos] != quote {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(format!("unterminated value for attribute '{}'", attr_name));
        }
        values.push(value_start..pos);
        element
            .attributes
            .push((attr_name, unescape(&input[value_start..pos])));
        pos += 1;
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':') || b >= 0x80
}

/// Escape a value for use in attribute values or text.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode the predefined XML entities and numeric character references.
/// Unknown entities are kept as written.
pub fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').and_then(|semi| {
            let entity = &tail[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
