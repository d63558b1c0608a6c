//! Stylesheet – parses a CSS string into rules the cascade can apply.
//!
//! Supported: comma-separated selector lists of compound selectors (type,
//! `.class`, `#id`, `*`), `@page` and `@media print/all` blocks. Selectors
//! with combinators, pseudo-classes or attribute tests are dropped.

use serde::{Deserialize, Serialize};

use crate::document::ElementNode;
use crate::fonts::{FontConfiguration, FontRef};

/// Where a stylesheet comes from. Later origins win over earlier ones at
/// equal specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    UserAgent,
    Author,
}

/// A compound selector such as `p.note#intro`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
}

impl Selector {
    /// Parse a single compound selector; `None` when it uses syntax this
    /// cascade does not support.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty()
            || text.contains(|c: char| c.is_whitespace() || "+>~:[()".contains(c))
        {
            return None;
        }
        let mut sel = Selector::default();
        let mut rest = text;
        let head_len = rest.find(['.', '#']).unwrap_or(rest.len());
        let head = &rest[..head_len];
        if !head.is_empty() && head != "*" {
            sel.tag = Some(head.to_ascii_lowercase());
        }
        rest = &rest[head_len..];
        while !rest.is_empty() {
            let marker = rest.as_bytes()[0];
            let body = &rest[1..];
            let len = body.find(['.', '#']).unwrap_or(body.len());
            let name = &body[..len];
            if name.is_empty() {
                return None;
            }
            match marker {
                b'.' => sel.classes.push(name.to_string()),
                _ => sel.id = Some(name.to_string()),
            }
            rest = &body[len..];
        }
        Some(sel)
    }

    /// (ids, classes, types) specificity triple.
    pub fn specificity(&self) -> (u8, u8, u8) {
        (
            u8::from(self.id.is_some()),
            self.classes.len().min(u8::MAX as usize) as u8,
            u8::from(self.tag.is_some()),
        )
    }

    pub fn matches(&self, element: &ElementNode) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != element.name {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.id() != Some(id.as_str()) {
                return false;
            }
        }
        let classes = element.classes();
        self.classes.iter().all(|c| classes.contains(&c.as_str()))
    }
}

/// One `property: value` pair. Property names are lower-cased; `!important`
/// is stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub selectors: Vec<Selector>,
    pub declarations: Vec<Declaration>,
}

/// Page box overrides collected from `@page` rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRule {
    /// (width, height) in points.
    pub size: Option<(f32, f32)>,
    /// Uniform margin in points.
    pub margin: Option<f32>,
}

/// A parsed stylesheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stylesheet {
    pub origin: Origin,
    pub rules: Vec<Rule>,
    pub page: PageRule,
}

/// Built-in defaults for the elements templates use.
pub const USER_AGENT_CSS: &str = r#"
html, body, div, p, h1, h2, h3, h4, h5, h6, ul, ol, dl, dt, dd, pre, blockquote,
section, article, header, footer, main, nav, aside, address, figure, figcaption,
form, fieldset, hr, center { display: block }
head, style, script, title, meta, link, template, noscript { display: none }
li { display: list-item }
table { display: table }
thead, tbody, tfoot { display: table-row-group }
tr { display: table-row }
td, th { display: table-cell; padding: 2px 4px }
th { font-weight: bold; text-align: center }
h1 { font-size: 2em; font-weight: bold; margin: 0.67em 0 }
h2 { font-size: 1.5em; font-weight: bold; margin: 0.83em 0 }
h3 { font-size: 1.17em; font-weight: bold; margin: 1em 0 }
h4 { font-weight: bold; margin: 1.33em 0 }
h5 { font-size: 0.83em; font-weight: bold; margin: 1.67em 0 }
h6 { font-size: 0.67em; font-weight: bold; margin: 2.33em 0 }
p, dl { margin: 1em 0 }
ul, ol { margin: 1em 0; padding-left: 40px }
ul { list-style-type: disc }
ol { list-style-type: decimal }
dd { margin-left: 40px }
blockquote { margin: 1em 40px }
center { text-align: center }
b, strong { font-weight: bold }
i, em, cite, var, dfn { font-style: italic }
u, ins { text-decoration: underline }
pre, code, kbd, samp, tt { font-family: monospace }
pre { white-space: pre; margin: 1em 0 }
small { font-size: 0.83em }
hr { margin: 0.5em 0; border-width: 1px; border-color: #808080 }
"#;

impl Stylesheet {
    /// Parse an author stylesheet. `font-family` declarations are checked
    /// against `fonts`; families it cannot provide are logged.
    pub fn from_string(css: &str, fonts: &FontConfiguration) -> Self {
        let sheet = Self::parse(css, Origin::Author);
        for rule in &sheet.rules {
            for decl in rule.declarations.iter().filter(|d| d.property == "font-family") {
                let families = parse_font_family(&decl.value);
                if fonts.resolve(&families, false, false) == FontRef::DEFAULT
                    && !families.iter().any(|f| f.eq_ignore_ascii_case("helvetica"))
                {
                    log::debug!("font-family '{}' not available, using Helvetica", decl.value);
                }
            }
        }
        sheet
    }

    /// The built-in user-agent stylesheet.
    pub fn user_agent() -> Self {
        Self::parse(USER_AGENT_CSS, Origin::UserAgent)
    }

    fn parse(css: &str, origin: Origin) -> Self {
        let mut sheet = Stylesheet {
            origin,
            rules: Vec::new(),
            page: PageRule::default(),
        };
        let css = strip_comments(css);
        parse_block_list(&css, &mut sheet, 0);
        sheet
    }
}

/// Deepest `@media` nesting that is still read; deeper blocks are ignored.
const MAX_MEDIA_NESTING: usize = 8;

fn parse_block_list(css: &str, sheet: &mut Stylesheet, depth: usize) {
    let mut rest = css;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let brace = rest.find('{');
        let semi = rest.find(';');

        // Statement at-rules: `@import ...;`, `@charset ...;`
        if rest.starts_with('@') {
            if let Some(s) = semi {
                if brace.map_or(true, |b| s < b) {
                    log::debug!("Ignoring at-rule {:?}", rest[..s].trim());
                    rest = &rest[s + 1..];
                    continue;
                }
            }
        }

        let Some(open) = brace else {
            break;
        };
        let prelude = rest[..open].trim();
        let close = matching_brace(rest, open).unwrap_or(rest.len());
        let body = &rest[open + 1..close.min(rest.len())];
        rest = if close < rest.len() { &rest[close + 1..] } else { "" };

        if let Some(at_rule) = prelude.strip_prefix('@') {
            let (name, params) = at_rule.split_once(char::is_whitespace).unwrap_or((at_rule, ""));
            match name.to_ascii_lowercase().as_str() {
                "page" => parse_page_rule(body, &mut sheet.page),
                "media" if depth >= MAX_MEDIA_NESTING => log::debug!("Ignoring @media nested too deep"),
                "media" if media_applies(params) => parse_block_list(body, sheet, depth + 1),
                other => log::debug!("Ignoring @{other} block"),
            }
            continue;
        }

        let selectors: Vec<Selector> = prelude
            .split(',')
            .filter_map(|s| {
                let parsed = Selector::parse(s);
                if parsed.is_none() {
                    log::debug!("Ignoring unsupported selector {:?}", s.trim());
                }
                parsed
            })
            .collect();
        if selectors.is_empty() {
            continue;
        }
        let declarations = parse_declarations(body);
        if !declarations.is_empty() {
            sheet.rules.push(Rule {
                selectors,
                declarations,
            });
        }
    }
}

fn media_applies(query: &str) -> bool {
    let query = query.to_ascii_lowercase();
    query
        .split(',')
        .any(|q| q.contains("print") || q.trim() == "all" || q.trim().starts_with("all "))
}

fn parse_page_rule(body: &str, page: &mut PageRule) {
    for decl in parse_declarations(body) {
        match decl.property.as_str() {
            "size" => {
                if let Some(size) = parse_page_size(&decl.value) {
                    page.size = Some(size);
                }
            }
            "margin" => {
                if let Some(m) = decl
                    .value
                    .split_whitespace()
                    .next()
                    .and_then(|v| parse_length(v, 12.0))
                {
                    page.margin = Some(m);
                }
            }
            _ => {}
        }
    }
}

/// `A4`, `letter landscape`, `210mm 297mm`, ... → (width, height) in points.
pub fn parse_page_size(value: &str) -> Option<(f32, f32)> {
    let mut named: Option<(f32, f32)> = None;
    let mut landscape = None;
    let mut lengths = Vec::new();
    for token in value.split_whitespace() {
        match token.to_ascii_lowercase().as_str() {
            "a3" => named = Some((841.89, 1190.55)),
            "a4" => named = Some((595.28, 841.89)),
            "a5" => named = Some((419.53, 595.28)),
            "letter" => named = Some((612.0, 792.0)),
            "legal" => named = Some((612.0, 1008.0)),
            "landscape" => landscape = Some(true),
            "portrait" => landscape = Some(false),
            other => lengths.push(parse_length(other, 12.0)?),
        }
    }
    let (w, h) = match (named, lengths.as_slice()) {
        (Some(size), []) => size,
        (None, [side]) => (*side, *side),
        (None, [w, h]) => (*w, *h),
        (None, []) => (595.28, 841.89),
        _ => return None,
    };
    Some(match landscape {
        Some(true) => (w.max(h), w.min(h)),
        Some(false) => (w.min(h), w.max(h)),
        None => (w, h),
    })
}

/// Parse the body of a rule or a `style` attribute.
pub fn parse_declarations(body: &str) -> Vec<Declaration> {
    split_top_level(body, ';')
        .into_iter()
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let property = prop.trim().to_ascii_lowercase();
            let value = value.trim();
            let value = value
                .strip_suffix("!important")
                .map(str::trim_end)
                .unwrap_or(value);
            if property.is_empty() || value.is_empty() {
                return None;
            }
            Some(Declaration {
                property,
                value: value.to_string(),
            })
        })
        .collect()
}

/// Split a `font-family` value into unquoted family names.
pub fn parse_font_family(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|f| f.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Parse an absolute or font-relative length into points. `em` is the
/// reference font size in points; `rem` uses the 12pt root size.
pub fn parse_length(value: &str, em: f32) -> Option<f32> {
    let v = value.trim().to_ascii_lowercase();
    if v == "0" {
        return Some(0.0);
    }
    let units: [(&str, f32); 8] = [
        ("rem", 12.0),
        ("em", em),
        ("px", 0.75),
        ("pt", 1.0),
        ("pc", 12.0),
        ("mm", 72.0 / 25.4),
        ("cm", 72.0 / 2.54),
        ("in", 72.0),
    ];
    for (suffix, factor) in units {
        if let Some(num) = v.strip_suffix(suffix) {
            return num.trim().parse::<f32>().ok().map(|n| n * factor);
        }
    }
    None
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Byte index of the `}` that closes the `{` at `open`.
fn matching_brace(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `sep` outside parentheses and quotes.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, c) if c == sep && depth <= 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(css: &str) -> Stylesheet {
        Stylesheet::from_string(css, &FontConfiguration::builtin())
    }

    #[test]
    fn parses_rules_and_selector_lists() {
        let s = sheet("h1, p.note { color: #f00; font-size: 20px !important }");
        assert_eq!(s.rules.len(), 1);
        let rule = &s.rules[0];
        assert_eq!(rule.selectors.len(), 2);
        assert_eq!(rule.selectors[1].tag.as_deref(), Some("p"));
        assert_eq!(rule.selectors[1].classes, vec!["note".to_string()]);
        assert_eq!(rule.declarations[1].value, "20px");
    }

    #[test]
    fn unsupported_selectors_are_dropped() {
        let s = sheet("div > p { color: red } a:hover { color: blue } .ok { color: green }");
        assert_eq!(s.rules.len(), 1);
        assert_eq!(s.rules[0].selectors[0].classes, vec!["ok".to_string()]);
    }

    #[test]
    fn comments_imports_and_media() {
        let s = sheet(
            "@charset \"utf-8\"; /* header */ @media screen { p { color: red } } \
             @media print { p { color: blue } } @font-face { font-family: X }",
        );
        assert_eq!(s.rules.len(), 1);
        assert_eq!(s.rules[0].declarations[0].value, "blue");
    }

    #[test]
    fn deeply_nested_media_is_bounded() {
        let css = format!(
            "@media print {{ p {{ color: red }} }}{}{}",
            "@media all { ".repeat(20_000),
            "}".repeat(20_000)
        );
        let s = sheet(&css);
        assert_eq!(s.rules.len(), 1);
    }

    #[test]
    fn page_rule_size_and_margin() {
        let s = sheet("@page { size: A4 landscape; margin: 1in }");
        let (w, h) = s.page.size.unwrap();
        assert!((w - 841.89).abs() < 0.01 && (h - 595.28).abs() < 0.01);
        assert_eq!(s.page.margin, Some(72.0));
        assert_eq!(parse_page_size("letter"), Some((612.0, 792.0)));
        assert_eq!(parse_page_size("100pt 200pt"), Some((100.0, 200.0)));
        assert_eq!(parse_page_size("huge"), None);
    }

    #[test]
    fn specificity_ordering() {
        let id = Selector::parse("#a").unwrap();
        let class = Selector::parse("p.b.c").unwrap();
        let tag = Selector::parse("p").unwrap();
        assert!(id.specificity() > class.specificity());
        assert!(class.specificity() > tag.specificity());
        assert_eq!(Selector::parse("*").unwrap().specificity(), (0, 0, 0));
    }

    #[test]
    fn selector_matching() {
        let mut el = ElementNode::new("P");
        el.attributes.insert("class".into(), "note big".into());
        el.attributes.insert("id".into(), "x".into());
        assert!(Selector::parse("p.note").unwrap().matches(&el));
        assert!(Selector::parse("#x.big").unwrap().matches(&el));
        assert!(Selector::parse(".note.big").unwrap().matches(&el));
        assert!(!Selector::parse("div.note").unwrap().matches(&el));
        assert!(!Selector::parse(".missing").unwrap().matches(&el));
    }

    #[test]
    fn declarations_respect_parentheses() {
        let decls = parse_declarations("color: rgb(1, 2, 3); background: url('a;b.png'); bogus");
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].value, "rgb(1, 2, 3)");
        assert_eq!(decls[1].value, "url('a;b.png')");
    }

    #[test]
    fn lengths_convert_to_points() {
        assert_eq!(parse_length("16px", 12.0), Some(12.0));
        assert_eq!(parse_length("2em", 10.0), Some(20.0));
        assert_eq!(parse_length("1in", 12.0), Some(72.0));
        assert_eq!(parse_length("0", 12.0), Some(0.0));
        assert_eq!(parse_length("auto", 12.0), None);
    }

    #[test]
    fn user_agent_sheet_parses() {
        let ua = Stylesheet::user_agent();
        assert_eq!(ua.origin, Origin::UserAgent);
        assert!(ua.rules.len() > 20);
    }
}
