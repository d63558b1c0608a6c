//! Style resolver – runs the cascade (user-agent sheet, author sheets, inline
//! `style`) and produces a flat [`ComputedStyle`] per element.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::document::{DomNode, ElementNode};
use crate::stylesheet::{parse_declarations, parse_font_family, parse_length, Declaration, Stylesheet};

/// Fully resolved style for a single element. Lengths are in points.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedStyle {
    pub display: Display,

    // Spacing
    pub margin_top: f32,
    pub margin_right: f32,
    pub margin_bottom: f32,
    pub margin_left: f32,
    pub padding_top: f32,
    pub padding_right: f32,
    pub padding_bottom: f32,
    pub padding_left: f32,

    // Border
    pub border_width: f32,
    pub border_color: Color,

    // Sizing (images only)
    pub width: Dimension,
    pub height: Dimension,

    // Typography (inherited)
    pub font_size: f32,
    pub bold: bool,
    pub italic: bool,
    pub font_family: Vec<String>,
    pub color: Color,
    pub text_align: TextAlign,
    pub line_height: f32,
    pub underline: bool,
    pub white_space_pre: bool,
    pub list_style: ListStyle,

    // Background
    pub background_color: Option<Color>,

    // Page break
    pub page_break_before: bool,
    pub page_break_after: bool,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display: Display::Inline,
            margin_top: 0.0,
            margin_right: 0.0,
            margin_bottom: 0.0,
            margin_left: 0.0,
            padding_top: 0.0,
            padding_right: 0.0,
            padding_bottom: 0.0,
            padding_left: 0.0,
            border_width: 0.0,
            border_color: Color::BLACK,
            width: Dimension::Auto,
            height: Dimension::Auto,
            font_size: 12.0,
            bold: false,
            italic: false,
            font_family: vec!["sans-serif".to_string()],
            color: Color::BLACK,
            text_align: TextAlign::Left,
            line_height: 1.2,
            underline: false,
            white_space_pre: false,
            list_style: ListStyle::Disc,
            background_color: None,
            page_break_before: false,
            page_break_after: false,
        }
    }
}

impl ComputedStyle {
    /// A child's starting style: inherited properties copied, the rest reset.
    fn inherit(parent: &ComputedStyle) -> Self {
        Self {
            font_size: parent.font_size,
            bold: parent.bold,
            italic: parent.italic,
            font_family: parent.font_family.clone(),
            color: parent.color,
            text_align: parent.text_align,
            line_height: parent.line_height,
            underline: parent.underline,
            white_space_pre: parent.white_space_pre,
            list_style: parent.list_style,
            ..Self::default()
        }
    }

    pub fn is_block_level(&self) -> bool {
        !matches!(self.display, Display::Inline | Display::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Display {
    Block,
    Inline,
    ListItem,
    Table,
    TableRowGroup,
    TableRow,
    TableCell,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStyle {
    Disc,
    Decimal,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dimension {
    Auto,
    Pt(f32),
    Percent(f32),
}

/// RGB colour (0.0 – 1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    fn rgb8(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').filter(|h| h.is_ascii())?;
        let digit = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            6 => Some(Self::rgb8(digit(&hex[0..2])?, digit(&hex[2..4])?, digit(&hex[4..6])?)),
            3 => Some(Self::rgb8(
                digit(&hex[0..1].repeat(2))?,
                digit(&hex[1..2].repeat(2))?,
                digit(&hex[2..3].repeat(2))?,
            )),
            _ => None,
        }
    }

    /// `#hex`, `rgb()`/`rgba()` or a named colour. `None` for `transparent`
    /// and anything unparseable.
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        if v.starts_with('#') {
            return Self::from_hex(&v);
        }
        if let Some(args) = v
            .strip_prefix("rgba(")
            .or_else(|| v.strip_prefix("rgb("))
            .and_then(|s| s.strip_suffix(')'))
        {
            let parts: Vec<&str> = args.split([',', ' ', '/']).filter(|p| !p.is_empty()).collect();
            if parts.len() < 3 {
                return None;
            }
            let channel = |p: &str| -> Option<u8> {
                match p.strip_suffix('%') {
                    Some(pct) => pct.parse::<f32>().ok().map(|x| (x.clamp(0.0, 100.0) * 2.55) as u8),
                    None => p.parse::<f32>().ok().map(|x| x.clamp(0.0, 255.0) as u8),
                }
            };
            return Some(Self::rgb8(channel(parts[0])?, channel(parts[1])?, channel(parts[2])?));
        }
        let (r, g, b) = match v.as_str() {
            "black" => (0, 0, 0),
            "white" => (255, 255, 255),
            "red" => (255, 0, 0),
            "green" => (0, 128, 0),
            "blue" => (0, 0, 255),
            "yellow" => (255, 255, 0),
            "orange" => (255, 165, 0),
            "purple" => (128, 0, 128),
            "gray" | "grey" => (128, 128, 128),
            "silver" => (192, 192, 192),
            "lightgray" | "lightgrey" => (211, 211, 211),
            "darkgray" | "darkgrey" => (169, 169, 169),
            "navy" => (0, 0, 128),
            "teal" => (0, 128, 128),
            "maroon" => (128, 0, 0),
            "olive" => (128, 128, 0),
            "lime" => (0, 255, 0),
            "aqua" | "cyan" => (0, 255, 255),
            "fuchsia" | "magenta" => (255, 0, 255),
            _ => return None,
        };
        Some(Self::rgb8(r, g, b))
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

/// A rule flattened for the cascade: one selector, its sort key, and the
/// declarations it carries.
struct CascadeEntry<'a> {
    key: (u8, (u8, u8, u8), usize),
    selector: &'a crate::stylesheet::Selector,
    declarations: &'a [Declaration],
}

/// Resolves styles for elements against an ordered set of stylesheets.
pub struct StyleResolver<'a> {
    entries: Vec<CascadeEntry<'a>>,
}

impl<'a> StyleResolver<'a> {
    /// `sheets` in cascade order: the user-agent sheet first, then author
    /// sheets in the order they apply.
    pub fn new(sheets: &'a [Stylesheet]) -> Self {
        let mut entries = Vec::new();
        let mut order = 0usize;
        for sheet in sheets {
            for rule in &sheet.rules {
                for selector in &rule.selectors {
                    entries.push(CascadeEntry {
                        key: (sheet.origin as u8, selector.specificity(), order),
                        selector,
                        declarations: &rule.declarations,
                    });
                }
                order += 1;
            }
        }
        entries.sort_by_key(|e| e.key);
        Self { entries }
    }

    /// Compute the style of `element` given its parent's computed style.
    pub fn resolve(&self, element: &ElementNode, parent: &ComputedStyle) -> ComputedStyle {
        // Winning value per property: later entries override earlier ones.
        let mut winners: HashMap<String, String> = HashMap::new();
        for entry in self.entries.iter().filter(|e| e.selector.matches(element)) {
            for decl in entry.declarations {
                expand_into(&mut winners, decl);
            }
        }
        if let Some(inline) = element.inline_style() {
            for decl in parse_declarations(inline) {
                expand_into(&mut winners, &decl);
            }
        }

        let mut style = ComputedStyle::inherit(parent);
        // font-size first: em lengths in every other property depend on it.
        if let Some(size) = winners.remove("font-size") {
            if let Some(pt) = font_size(&size, parent.font_size) {
                style.font_size = pt;
            }
        }
        let mut props: Vec<_> = winners.into_iter().collect();
        props.sort();
        for (prop, value) in props {
            apply_property(&mut style, &prop, &value, parent);
        }
        style
    }
}

/// Record a declaration, expanding the box shorthands.
fn expand_into(winners: &mut HashMap<String, String>, decl: &Declaration) {
    match decl.property.as_str() {
        "margin" | "padding" => {
            let parts: Vec<&str> = decl.value.split_whitespace().collect();
            let (t, r, b, l) = match parts.as_slice() {
                [a] => (*a, *a, *a, *a),
                [v, h] => (*v, *h, *v, *h),
                [t, h, b] => (*t, *h, *b, *h),
                [t, r, b, l, ..] => (*t, *r, *b, *l),
                [] => return,
            };
            for (side, value) in [("top", t), ("right", r), ("bottom", b), ("left", l)] {
                winners.insert(format!("{}-{side}", decl.property), value.to_string());
            }
        }
        "border" => {
            for token in decl.value.split_whitespace() {
                if Color::parse(token).is_some() {
                    winners.insert("border-color".into(), token.to_string());
                } else if parse_length(token, 12.0).is_some() {
                    winners.insert("border-width".into(), token.to_string());
                }
            }
        }
        "background" => {
            winners.insert("background-color".into(), decl.value.clone());
        }
        "page-break-before" | "break-before" => {
            winners.insert("break-before".into(), decl.value.clone());
        }
        "page-break-after" | "break-after" => {
            winners.insert("break-after".into(), decl.value.clone());
        }
        _ => {
            winners.insert(decl.property.clone(), decl.value.clone());
        }
    }
}

fn font_size(value: &str, parent_size: f32) -> Option<f32> {
    let v = value.trim();
    if let Some(pct) = v.strip_suffix('%') {
        return pct.trim().parse::<f32>().ok().map(|p| parent_size * p / 100.0);
    }
    match v {
        "xx-small" => Some(7.0),
        "x-small" => Some(7.5),
        "small" => Some(10.0),
        "medium" => Some(12.0),
        "large" => Some(13.5),
        "x-large" => Some(18.0),
        "xx-large" => Some(24.0),
        "smaller" => Some(parent_size / 1.2),
        "larger" => Some(parent_size * 1.2),
        _ => parse_length(v, parent_size),
    }
}

fn apply_property(s: &mut ComputedStyle, prop: &str, val: &str, parent: &ComputedStyle) {
    let val = val.trim();
    let em = s.font_size;
    let length = |v: &str| parse_length(v, em);
    match prop {
        "display" => {
            s.display = match val {
                "block" | "flex" | "grid" | "flow-root" => Display::Block,
                "inline" | "inline-block" => Display::Inline,
                "list-item" => Display::ListItem,
                "table" => Display::Table,
                "table-row-group" | "table-header-group" | "table-footer-group" => {
                    Display::TableRowGroup
                }
                "table-row" => Display::TableRow,
                "table-cell" => Display::TableCell,
                "none" => Display::None,
                _ => s.display,
            }
        }
        "font-weight" => {
            s.bold = match val {
                "bold" | "bolder" => true,
                "normal" | "lighter" => false,
                n => n.parse::<u16>().map(|w| w >= 600).unwrap_or(s.bold),
            }
        }
        "font-style" => s.italic = matches!(val, "italic" | "oblique"),
        "font-family" => {
            let families = parse_font_family(val);
            if !families.is_empty() {
                s.font_family = families;
            }
        }
        "color" => {
            if val == "inherit" {
                s.color = parent.color;
            } else if let Some(c) = Color::parse(val) {
                s.color = c;
            }
        }
        "background-color" => {
            s.background_color = Color::parse(val);
        }
        "text-align" => {
            s.text_align = match val {
                "center" => TextAlign::Center,
                "right" | "end" => TextAlign::Right,
                _ => TextAlign::Left,
            }
        }
        "text-decoration" | "text-decoration-line" => s.underline = val.contains("underline"),
        "line-height" => {
            if val == "normal" {
                s.line_height = 1.2;
            } else if let Ok(factor) = val.parse::<f32>() {
                s.line_height = factor;
            } else if let Some(pct) = val.strip_suffix('%') {
                if let Ok(p) = pct.parse::<f32>() {
                    s.line_height = p / 100.0;
                }
            } else if let Some(pt) = length(val) {
                if s.font_size > 0.0 {
                    s.line_height = pt / s.font_size;
                }
            }
        }
        "white-space" => s.white_space_pre = val.starts_with("pre"),
        "list-style-type" | "list-style" => {
            s.list_style = if val.contains("none") {
                ListStyle::None
            } else if val.contains("decimal") {
                ListStyle::Decimal
            } else {
                ListStyle::Disc
            }
        }
        "width" => s.width = dimension(val, s.font_size),
        "height" => s.height = dimension(val, s.font_size),
        "border-width" => {
            if let Some(pt) = length(val) {
                s.border_width = pt;
            }
        }
        "border-color" => {
            if let Some(c) = Color::parse(val) {
                s.border_color = c;
            }
        }
        "break-before" => s.page_break_before = matches!(val, "always" | "page" | "left" | "right"),
        "break-after" => s.page_break_after = matches!(val, "always" | "page" | "left" | "right"),
        _ => {
            if let Some(side) = prop.strip_prefix("margin-") {
                let pt = if val == "auto" { Some(0.0) } else { length(val) };
                if let Some(pt) = pt {
                    match side {
                        "top" => s.margin_top = pt,
                        "right" => s.margin_right = pt,
                        "bottom" => s.margin_bottom = pt,
                        "left" => s.margin_left = pt,
                        _ => {}
                    }
                }
            } else if let Some(side) = prop.strip_prefix("padding-") {
                if let Some(pt) = length(val) {
                    match side {
                        "top" => s.padding_top = pt,
                        "right" => s.padding_right = pt,
                        "bottom" => s.padding_bottom = pt,
                        "left" => s.padding_left = pt,
                        _ => {}
                    }
                }
            }
        }
    }
}

fn dimension(val: &str, em: f32) -> Dimension {
    if let Some(pct) = val.strip_suffix('%') {
        return pct
            .trim()
            .parse::<f32>()
            .map(Dimension::Percent)
            .unwrap_or(Dimension::Auto);
    }
    parse_length(val, em).map(Dimension::Pt).unwrap_or(Dimension::Auto)
}

// ---------------------------------------------------------------------------
// Styled DOM tree
// ---------------------------------------------------------------------------

/// A DOM node annotated with its computed style.
#[derive(Debug, Clone)]
pub enum StyledNode {
    Element {
        name: String,
        style: ComputedStyle,
        children: Vec<StyledNode>,
        /// Original attributes (image src, width/height hints).
        attrs: HashMap<String, String>,
    },
    Text {
        text: String,
        style: ComputedStyle,
    },
}

impl StyledNode {
    pub fn style(&self) -> &ComputedStyle {
        match self {
            StyledNode::Element { style, .. } | StyledNode::Text { style, .. } => style,
        }
    }
}

/// Build a styled tree from a DOM tree, resolving styles top-down.
/// `display: none` subtrees are dropped.
pub fn build_styled_tree(
    nodes: &[DomNode],
    parent_style: &ComputedStyle,
    resolver: &StyleResolver<'_>,
) -> Vec<StyledNode> {
    let mut result = Vec::new();
    for node in nodes {
        match node {
            DomNode::Element(e) => {
                let style = resolver.resolve(e, parent_style);
                if style.display == Display::None {
                    continue;
                }
                let children = build_styled_tree(&e.children, &style, resolver);
                result.push(StyledNode::Element {
                    name: e.name.clone(),
                    style,
                    children,
                    attrs: e.attributes.clone(),
                });
            }
            DomNode::Text(text) => {
                result.push(StyledNode::Text {
                    text: text.clone(),
                    style: ComputedStyle::inherit(parent_style),
                });
            }
        }
    }
    result
}

/// Root style for a document: block display, default typography.
pub fn root_style() -> ComputedStyle {
    ComputedStyle {
        display: Display::Block,
        ..ComputedStyle::default()
    }
}
