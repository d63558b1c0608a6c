//! HTML document – converts an HTML string into a simple DOM tree anchored at
//! a base URL.
//!
//! The parser is forgiving in the way hand-written templates need: void
//! elements, unclosed `<p>`/`<li>`/`<td>`, stray end tags and raw text in
//! `<style>`/`<script>` are all handled. It is not an HTML5 tree builder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64_STD, Engine as _};

/// Elements that never have children.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "wbr",
];

/// Elements whose content is raw text, not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["style", "script"];

/// Deepest element nesting kept in the tree. Start tags below this depth are
/// dropped and their content joins the innermost kept element, so every
/// later recursive walk stays bounded.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Block-level tags that implicitly close an open `<p>`.
const CLOSES_P: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "table", "hr", "pre",
    "blockquote", "section", "article", "header", "footer",
];

/// A node in the DOM tree.
#[derive(Debug, Clone, PartialEq)]
pub enum DomNode {
    Element(ElementNode),
    Text(String),
}

/// An element node carrying its lower-case name, attributes and children.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub children: Vec<DomNode>,
}

impl ElementNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            attributes: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn inline_style(&self) -> Option<&str> {
        self.attr("style")
    }

    /// Concatenated text of all descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }
}

fn collect_text(nodes: &[DomNode], out: &mut String) {
    for node in nodes {
        match node {
            DomNode::Text(t) => out.push_str(t),
            DomNode::Element(e) => collect_text(&e.children, out),
        }
    }
}

/// A parsed document plus the context needed to resolve its resources.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    /// Directory that relative resource paths are resolved against.
    pub base_url: PathBuf,
    /// Text of the first `<title>` element.
    pub title: Option<String>,
    /// Contents of every `<style>` element, in document order.
    pub style_blocks: Vec<String>,
    pub nodes: Vec<DomNode>,
}

impl HtmlDocument {
    /// Parse `html`; relative image sources resolve against `base_url`.
    pub fn from_string(html: &str, base_url: impl AsRef<Path>) -> Self {
        let nodes = parse_html(html);
        let mut title = None;
        let mut style_blocks = Vec::new();
        scan_head(&nodes, &mut title, &mut style_blocks);
        Self {
            base_url: base_url.as_ref().to_path_buf(),
            title,
            style_blocks,
            nodes,
        }
    }

    /// Load the bytes behind an image `src`: a base64 `data:` URI, a
    /// `file://` URL, or a path relative to [`HtmlDocument::base_url`].
    pub fn load_resource(&self, src: &str) -> Result<Vec<u8>, String> {
        let src = src.trim();
        if src.starts_with("data:") {
            return parse_data_uri(src);
        }
        if src.starts_with("http://") || src.starts_with("https://") {
            return Err(format!("remote resources are not fetched: {src}"));
        }
        let path = src.strip_prefix("file://").unwrap_or(src);
        let path = Path::new(path);
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_url.join(path)
        };
        std::fs::read(&full).map_err(|e| format!("cannot read {}: {e}", full.display()))
    }
}

fn scan_head(nodes: &[DomNode], title: &mut Option<String>, styles: &mut Vec<String>) {
    for node in nodes {
        if let DomNode::Element(e) = node {
            match e.name.as_str() {
                "title" if title.is_none() => *title = Some(e.text_content().trim().to_string()),
                "style" => styles.push(e.text_content()),
                _ => scan_head(&e.children, title, styles),
            }
        }
    }
}

/// Parse a `data:<mime>;base64,<data>` URI and return the raw decoded bytes.
fn parse_data_uri(src: &str) -> Result<Vec<u8>, String> {
    let rest = &src["data:".len()..];
    let comma_pos = rest
        .find(',')
        .ok_or_else(|| "invalid data URI: missing `,` separator".to_string())?;
    let header = &rest[..comma_pos];
    if !header.contains(";base64") {
        return Err("only base64-encoded data URIs are supported".to_string());
    }
    BASE64_STD
        .decode(rest[comma_pos + 1..].trim())
        .map_err(|e| format!("base64 decode error: {e}"))
}

// ---------------------------------------------------------------------------
// Parser – recursive descent with a stack of open element names
// ---------------------------------------------------------------------------

/// Parse an HTML string into a list of DOM nodes.
pub fn parse_html(html: &str) -> Vec<DomNode> {
    let mut parser = Parser {
        input: html,
        pos: 0,
        flattened: Vec::new(),
    };
    let mut open = Vec::new();
    let nodes = parser.parse_nodes(&mut open);
    if !parser.flattened.is_empty() {
        log::debug!(
            "Flattened {} element(s) nested deeper than {MAX_NESTING_DEPTH}",
            parser.flattened.len()
        );
    }
    nodes
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    /// Start tags dropped for exceeding [`MAX_NESTING_DEPTH`] whose end tag
    /// has not been seen yet.
    flattened: Vec<String>,
}

impl<'a> Parser<'a> {
    /// Parse siblings until the end of input or until an end tag / start tag
    /// that closes the innermost open element.
    fn parse_nodes(&mut self, open: &mut Vec<String>) -> Vec<DomNode> {
        let mut nodes = Vec::new();
        while !self.eof() {
            if self.starts_with("</") {
                let name = self.peek_tag_name(2);
                if self.flattened.last() == Some(&name) {
                    self.flattened.pop();
                    self.skip_tag();
                    continue;
                }
                if open.last() == Some(&name) {
                    self.skip_tag();
                    return nodes;
                }
                if open.contains(&name) {
                    // Closes an ancestor: end this element implicitly.
                    return nodes;
                }
                self.skip_tag();
                continue;
            }
            if self.starts_with("<!--") {
                self.skip_past("-->");
                continue;
            }
            if self.starts_with("<!") || self.starts_with("<?") {
                self.skip_past(">");
                continue;
            }
            if self.starts_with("<") && self.next_is_tag_start() {
                let name = self.peek_tag_name(1);
                if let Some(current) = open.last() {
                    if implicitly_closes(current, &name) {
                        return nodes;
                    }
                }
                if let Some(element) = self.parse_element(open) {
                    nodes.push(element);
                }
            } else {
                let text = self.parse_text();
                if !text.is_empty() {
                    nodes.push(DomNode::Text(text));
                }
            }
        }
        nodes
    }

    fn parse_text(&mut self) -> String {
        let start = self.pos;
        self.advance_char();
        while !self.eof() && !self.starts_with("<") {
            self.advance_char();
        }
        decode_entities(&self.input[start..self.pos])
    }

    /// Parse one element. `None` when the element was dropped for nesting
    /// too deep; its content is then parsed as siblings by the caller.
    fn parse_element(&mut self, open: &mut Vec<String>) -> Option<DomNode> {
        self.pos += 1; // '<'
        let mut elem = ElementNode::new(&self.parse_name());

        loop {
            self.skip_whitespace();
            if self.eof() || self.starts_with(">") || self.starts_with("/>") {
                break;
            }
            let (key, value) = self.parse_attribute();
            if key.is_empty() {
                // Unparseable junk inside the tag.
                self.advance_char();
                continue;
            }
            elem.attributes.entry(key).or_insert(value);
        }

        let self_closed = self.starts_with("/>");
        self.skip_past(">");
        if self_closed || VOID_ELEMENTS.contains(&elem.name.as_str()) {
            return Some(DomNode::Element(elem));
        }

        if RAW_TEXT_ELEMENTS.contains(&elem.name.as_str()) {
            let end = format!("</{}", elem.name);
            let rest = &self.input[self.pos..];
            let len = find_ascii_case_insensitive(rest, &end).unwrap_or(rest.len());
            let raw = &rest[..len];
            if !raw.is_empty() {
                elem.children.push(DomNode::Text(raw.to_string()));
            }
            self.pos += len;
            if !self.eof() {
                self.skip_tag();
            }
            return Some(DomNode::Element(elem));
        }

        if open.len() >= MAX_NESTING_DEPTH {
            self.flattened.push(elem.name);
            return None;
        }

        open.push(elem.name.clone());
        elem.children = self.parse_nodes(open);
        open.pop();
        Some(DomNode::Element(elem))
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.current_char() {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ':' {
                self.advance_char();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_ascii_lowercase()
    }

    fn peek_tag_name(&mut self, offset: usize) -> String {
        let saved = self.pos;
        self.pos += offset;
        let name = self.parse_name();
        self.pos = saved;
        name
    }

    fn next_is_tag_start(&self) -> bool {
        self.input[self.pos + 1..]
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
    }

    fn parse_attribute(&mut self) -> (String, String) {
        let key = self.parse_name();
        self.skip_whitespace();
        if !self.starts_with("=") {
            return (key, String::new());
        }
        self.pos += 1;
        self.skip_whitespace();
        let value = match self.current_char() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.current_char() {
                    if c == q {
                        break;
                    }
                    self.advance_char();
                }
                let val = &self.input[start..self.pos];
                if !self.eof() {
                    self.pos += 1;
                }
                val
            }
            _ => {
                let start = self.pos;
                while let Some(c) = self.current_char() {
                    if c.is_whitespace() || c == '>' {
                        break;
                    }
                    self.advance_char();
                }
                &self.input[start..self.pos]
            }
        };
        (key, decode_entities(value))
    }

    /// Skip a whole `<...>` tag.
    fn skip_tag(&mut self) {
        self.skip_past(">");
    }

    fn skip_past(&mut self, marker: &str) {
        match self.input[self.pos..].find(marker) {
            Some(i) => self.pos += i + marker.len(),
            None => self.pos = self.input.len(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.current_char() {
            if !c.is_whitespace() {
                break;
            }
            self.advance_char();
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn current_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance_char(&mut self) {
        if let Some(c) = self.current_char() {
            self.pos += c.len_utf8();
        }
    }
}

/// Whether starting `next` ends the currently open `current` element.
fn implicitly_closes(current: &str, next: &str) -> bool {
    match current {
        "p" => CLOSES_P.contains(&next),
        "li" => next == "li",
        "td" | "th" => matches!(next, "td" | "th" | "tr"),
        "tr" => next == "tr",
        "option" => next == "option",
        _ => false,
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Decode the named entities templates actually use plus numeric references.
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{00A0}'),
                "copy" => Some('\u{00A9}'),
                "reg" => Some('\u{00AE}'),
                "euro" => Some('\u{20AC}'),
                "mdash" => Some('\u{2014}'),
                "ndash" => Some('\u{2013}'),
                "hellip" => Some('\u{2026}'),
                "bull" => Some('\u{2022}'),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
