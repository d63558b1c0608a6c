//! Layout – uses Taffy to compute box geometry for the styled tree, then cuts
//! the result into pages.
//!
//! Block elements become `Display::Block` nodes (margins collapse the CSS
//! way), tables become grids of equal columns, and each run of inline content
//! becomes a measured leaf whose words are wrapped to the width Taffy gives
//! it. After layout the tree is flattened into fragments in document
//! coordinates and [`paginate`] places them on pages.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use taffy::prelude::*;
use taffy::TaffyError;

use crate::document::HtmlDocument;
use crate::fonts::{FontConfiguration, FontRef};
use crate::style::{self, Color, ComputedStyle, ListStyle, StyledNode, TextAlign};

/// CSS pixels to points.
const PX_TO_PT: f32 = 0.75;

/// Gap between a list marker and the item text, in points.
const MARKER_GAP: f32 = 6.0;

/// Page size and uniform margin, in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
}

impl PageGeometry {
    /// A4 portrait, 40pt margins.
    pub const A4: Self = Self {
        width: 595.28,
        height: 841.89,
        margin: 40.0,
    };

    pub fn content_width(&self) -> f32 {
        (self.width - 2.0 * self.margin).max(1.0)
    }

    pub fn content_height(&self) -> f32 {
        (self.height - 2.0 * self.margin).max(1.0)
    }
}

/// A complete document layout ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePlan {
    /// Document title embedded in the PDF metadata.
    pub title: String,
    pub page_width: f32,
    pub page_height: f32,
    /// Ordered list of pages; never empty.
    pub pages: Vec<PlannedPage>,
    /// Images referenced by [`PlacedItem::Image`], in first-use order.
    pub images: Vec<ImageResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannedPage {
    /// Items in paint order.
    pub items: Vec<PlacedItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub width: f32,
    pub color: Color,
}

/// Something drawn on a page. Coordinates are relative to the page's
/// top-left corner, in points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacedItem {
    Text {
        x: f32,
        baseline: f32,
        text: String,
        font: FontRef,
        font_size: f32,
        color: Color,
        underline: bool,
        width: f32,
    },
    Rect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        fill: Option<Color>,
        stroke: Option<Stroke>,
    },
    Line {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        stroke: Stroke,
    },
    Image {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        /// Index into [`PagePlan::images`].
        image: usize,
    },
}

impl PlacedItem {
    fn shifted(mut self, dy: f32) -> Self {
        match &mut self {
            PlacedItem::Text { baseline, .. } => *baseline += dy,
            PlacedItem::Rect { y, .. } | PlacedItem::Image { y, .. } => *y += dy,
            PlacedItem::Line { y1, y2, .. } => {
                *y1 += dy;
                *y2 += dy;
            }
        }
        self
    }
}

/// A decoded image source. The bytes are kept for the PDF writer but left
/// out of the serialised plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    pub src: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub px_width: u32,
    pub px_height: u32,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Lay out `nodes` (the styled document) onto pages of `page` geometry.
pub fn layout_document(
    nodes: &[StyledNode],
    root: &ComputedStyle,
    document: &HtmlDocument,
    fonts: &FontConfiguration,
    page: PageGeometry,
    title: String,
) -> Result<PagePlan, TaffyError> {
    let content_width = page.content_width();
    let mut builder = LayoutBuilder::new(fonts, document, page);

    let children = builder.build_children(nodes, root, content_width)?;
    let root_style = Style {
        display: taffy::Display::Block,
        size: Size {
            width: taffy::Dimension::Length(content_width),
            height: taffy::Dimension::Auto,
        },
        ..Default::default()
    };
    let root_id = builder.taffy.new_with_children(root_style, &children)?;

    builder.taffy.compute_layout_with_measure(
        root_id,
        Size {
            width: AvailableSpace::Definite(content_width),
            height: AvailableSpace::MaxContent,
        },
        |known, available, _node, context, _style| match context {
            Some(content) => content.measure(known, available),
            None => Size::ZERO,
        },
    )?;

    let mut extractor = Extractor {
        taffy: &builder.taffy,
        boxes: &builder.boxes,
        marker: None,
    };
    let mut fragments = Vec::new();
    extractor.emit(root_id, page.margin, 0.0, &mut fragments)?;
    let pages = paginate(fragments, page);

    log::debug!(
        "Laid out {} page(s), {} image(s)",
        pages.len(),
        builder.images.len()
    );
    Ok(PagePlan {
        title,
        page_width: page.width,
        page_height: page.height,
        pages,
        images: builder.images,
    })
}

// ---------------------------------------------------------------------------
// Inline content (measured Taffy leaves)
// ---------------------------------------------------------------------------

/// Resolved typography of a run of text.
#[derive(Debug, Clone, PartialEq)]
struct RunStyle {
    font: FontRef,
    font_size: f32,
    color: Color,
    underline: bool,
    line_height: f32,
}

impl RunStyle {
    fn line_box(&self) -> f32 {
        self.font_size * self.line_height
    }
}

#[derive(Debug, Clone)]
enum InlineItem {
    Word {
        text: String,
        style: RunStyle,
        width: f32,
        space_width: f32,
        space_before: bool,
        /// Distance from the line-box top to the baseline (half-leading
        /// included).
        above: f32,
    },
    Image {
        index: usize,
        width: f32,
        height: f32,
        space_before: bool,
    },
    /// Forced line break; `height` is used when the line is empty.
    Break { height: f32 },
}

/// One wrapped line: `items[start..end]` of its [`InlineContent`].
#[derive(Debug, Clone, Copy)]
struct LineBox {
    start: usize,
    end: usize,
    width: f32,
}

/// The context of an inline Taffy leaf: a paragraph's worth of words.
#[derive(Debug, Clone)]
struct InlineContent {
    items: Vec<InlineItem>,
    align: TextAlign,
    /// Gap before an image preceded by whitespace.
    image_gap: f32,
}

impl InlineContent {
    fn gap_before(&self, item: &InlineItem) -> f32 {
        match item {
            InlineItem::Word {
                space_width,
                space_before: true,
                ..
            } => *space_width,
            InlineItem::Image {
                space_before: true, ..
            } => self.image_gap,
            _ => 0.0,
        }
    }

    /// Greedy line breaking at `max_width`.
    fn break_lines(&self, max_width: f32) -> Vec<LineBox> {
        let mut lines = Vec::new();
        let mut start = 0;
        let mut width = 0.0f32;
        for (i, item) in self.items.iter().enumerate() {
            let item_width = match item {
                InlineItem::Break { .. } => {
                    lines.push(LineBox {
                        start,
                        end: i + 1,
                        width,
                    });
                    start = i + 1;
                    width = 0.0;
                    continue;
                }
                InlineItem::Word { width, .. } | InlineItem::Image { width, .. } => *width,
            };
            let gap = if i == start { 0.0 } else { self.gap_before(item) };
            if i > start && width + gap + item_width > max_width {
                lines.push(LineBox { start, end: i, width });
                start = i;
                width = item_width;
            } else {
                width += gap + item_width;
            }
        }
        if start < self.items.len() {
            lines.push(LineBox {
                start,
                end: self.items.len(),
                width,
            });
        }
        lines
    }

    /// Baseline offset and height of a line. Images rest on the baseline.
    fn line_metrics(&self, line: LineBox) -> (f32, f32) {
        let mut ascent = 0.0f32;
        let mut descent = 0.0f32;
        let mut height = 0.0f32;
        let mut empty_height = 0.0f32;
        let mut has_content = false;
        for item in &self.items[line.start..line.end] {
            match item {
                InlineItem::Word { style, above, .. } => {
                    let line_box = style.line_box();
                    ascent = ascent.max(*above);
                    descent = descent.max(line_box - above);
                    height = height.max(line_box);
                    has_content = true;
                }
                InlineItem::Image { height: h, .. } => {
                    ascent = ascent.max(*h);
                    height = height.max(*h);
                    has_content = true;
                }
                InlineItem::Break { height } => empty_height = *height,
            }
        }
        if has_content {
            (ascent, height.max(ascent + descent))
        } else {
            (0.0, empty_height)
        }
    }

    /// Taffy measure function.
    fn measure(&self, known: Size<Option<f32>>, available: Size<AvailableSpace>) -> Size<f32> {
        let wrap_width = known.width.unwrap_or(match available.width {
            AvailableSpace::Definite(width) => width,
            AvailableSpace::MinContent => 0.0,
            AvailableSpace::MaxContent => f32::INFINITY,
        });
        let lines = self.break_lines(wrap_width);
        let content_width = lines.iter().map(|l| l.width).fold(0.0, f32::max);
        let content_height: f32 = lines.iter().map(|l| self.line_metrics(*l).1).sum();
        Size {
            width: known.width.unwrap_or(content_width),
            height: known.height.unwrap_or(content_height),
        }
    }
}

// ---------------------------------------------------------------------------
// Build the Taffy tree from styled nodes
// ---------------------------------------------------------------------------

/// List marker text and the typography it is drawn with.
#[derive(Debug, Clone)]
struct Marker {
    text: String,
    style: RunStyle,
    width: f32,
}

#[derive(Debug, Clone)]
enum BoxKind {
    Block { marker: Option<Marker> },
    Rule,
    Table,
    Cell { row: usize },
    Inline,
}

/// What the extractor needs to know about a Taffy node beyond its geometry.
#[derive(Debug, Clone)]
struct BoxInfo {
    kind: BoxKind,
    fill: Option<Color>,
    stroke: Option<Stroke>,
    break_before: bool,
    break_after: bool,
}

impl BoxInfo {
    fn plain(kind: BoxKind) -> Self {
        Self {
            kind,
            fill: None,
            stroke: None,
            break_before: false,
            break_after: false,
        }
    }

    fn for_style(kind: BoxKind, style: &ComputedStyle) -> Self {
        Self {
            kind,
            fill: style.background_color,
            stroke: border_stroke(style),
            break_before: style.page_break_before,
            break_after: style.page_break_after,
        }
    }
}

struct LayoutBuilder<'a> {
    taffy: TaffyTree<InlineContent>,
    boxes: HashMap<NodeId, BoxInfo>,
    fonts: &'a FontConfiguration,
    document: &'a HtmlDocument,
    page: PageGeometry,
    images: Vec<ImageResource>,
    image_cache: HashMap<String, Option<usize>>,
}

impl<'a> LayoutBuilder<'a> {
    fn new(fonts: &'a FontConfiguration, document: &'a HtmlDocument, page: PageGeometry) -> Self {
        let mut taffy = TaffyTree::new();
        taffy.disable_rounding();
        Self {
            taffy,
            boxes: HashMap::new(),
            fonts,
            document,
            page,
            images: Vec::new(),
            image_cache: HashMap::new(),
        }
    }

    /// Build the children of a block container. Consecutive inline nodes are
    /// gathered into one anonymous inline leaf. `avail` is the container's
    /// content width, used to pre-split overlong words and to fit images.
    fn build_children(
        &mut self,
        nodes: &[StyledNode],
        parent: &ComputedStyle,
        avail: f32,
    ) -> Result<Vec<NodeId>, TaffyError> {
        let mut ids = Vec::new();
        let mut inline_run: Vec<&StyledNode> = Vec::new();
        let mut item_number = 0usize;
        for node in nodes {
            if !node.style().is_block_level() {
                inline_run.push(node);
                continue;
            }
            ids.extend(self.build_inline(&inline_run, parent, avail)?);
            inline_run.clear();

            let marker = if node.style().display == style::Display::ListItem {
                item_number += 1;
                let text = match node.style().list_style {
                    ListStyle::Disc => Some("\u{2022}".to_string()),
                    ListStyle::Decimal => Some(format!("{item_number}.")),
                    ListStyle::None => None,
                };
                text.map(|text| {
                    let style = self.run_style(node.style());
                    let width = self.fonts.measure_text_width(&text, style.font_size, &style.font);
                    Marker { text, style, width }
                })
            } else {
                None
            };
            ids.extend(self.build_element(node, avail, marker)?);
        }
        ids.extend(self.build_inline(&inline_run, parent, avail)?);
        Ok(ids)
    }

    fn build_element(
        &mut self,
        node: &StyledNode,
        avail: f32,
        marker: Option<Marker>,
    ) -> Result<Option<NodeId>, TaffyError> {
        let StyledNode::Element {
            name,
            style,
            children,
            attrs,
        } = node
        else {
            return Ok(None);
        };

        if name == "hr" {
            let thickness = style.border_width.max(PX_TO_PT);
            let mut rule = box_style(style);
            rule.border = uniform(LengthPercentage::Length(0.0));
            rule.size.height = taffy::Dimension::Length(thickness);
            let id = self.taffy.new_leaf(rule)?;
            let mut info = BoxInfo::for_style(BoxKind::Rule, style);
            info.fill = None;
            info.stroke = Some(Stroke {
                width: thickness,
                color: style.border_color,
            });
            self.boxes.insert(id, info);
            return Ok(Some(id));
        }

        if style.display == style::Display::Table {
            let framed = attrs.get("border").is_some_and(|b| b.trim() != "0");
            return self.build_table(style, children, framed, avail);
        }

        let inner = inner_width(style, avail);
        let child_ids = if name == "img" {
            self.build_inline(&[node], style, inner)?.into_iter().collect()
        } else {
            self.build_children(children, style, inner)?
        };
        let id = self.taffy.new_with_children(box_style(style), &child_ids)?;
        self.boxes
            .insert(id, BoxInfo::for_style(BoxKind::Block { marker }, style));
        Ok(Some(id))
    }

    /// Tables: a grid with one equal-width column per cell of the widest row.
    /// Each cell is placed on its row explicitly so short rows leave gaps.
    fn build_table(
        &mut self,
        style: &ComputedStyle,
        children: &[StyledNode],
        framed: bool,
        avail: f32,
    ) -> Result<Option<NodeId>, TaffyError> {
        let rows = table_rows(children);
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        if columns == 0 {
            return Ok(None);
        }
        let inner = inner_width(style, avail);
        let cell_avail = inner / columns.max(1) as f32;

        let mut cell_ids = Vec::new();
        for (row, cells) in rows.into_iter().enumerate() {
            for (column, cell) in cells.into_iter().enumerate() {
                let StyledNode::Element {
                    style: cell_style,
                    children: cell_children,
                    ..
                } = cell
                else {
                    continue;
                };
                let content = self.build_children(cell_children, cell_style, inner_width(cell_style, cell_avail))?;
                let mut taffy_style = box_style(cell_style);
                taffy_style.margin = uniform(LengthPercentageAuto::Length(0.0));
                taffy_style.size.width = taffy::Dimension::Auto;
                taffy_style.grid_row = Line {
                    start: line(grid_line(row)),
                    end: span(1),
                };
                taffy_style.grid_column = Line {
                    start: line(grid_line(column)),
                    end: span(1),
                };
                let id = self.taffy.new_with_children(taffy_style, &content)?;

                let mut info = BoxInfo::for_style(BoxKind::Cell { row }, cell_style);
                if info.stroke.is_none() && (framed || style.border_width > 0.0) {
                    info.stroke = Some(Stroke {
                        width: PX_TO_PT,
                        color: style.border_color,
                    });
                }
                self.boxes.insert(id, info);
                cell_ids.push(id);
            }
        }

        let mut table_style = box_style(style);
        table_style.display = taffy::Display::Grid;
        table_style.grid_template_columns = vec![equal_column(); columns];
        let id = self.taffy.new_with_children(table_style, &cell_ids)?;
        self.boxes.insert(id, BoxInfo::for_style(BoxKind::Table, style));
        Ok(Some(id))
    }

    /// Turn a run of inline nodes into one measured leaf. `None` when the run
    /// holds nothing but collapsible whitespace.
    fn build_inline(
        &mut self,
        nodes: &[&StyledNode],
        block: &ComputedStyle,
        avail: f32,
    ) -> Result<Option<NodeId>, TaffyError> {
        if nodes.is_empty() {
            return Ok(None);
        }
        let mut items = Vec::new();
        let mut space = false;
        for node in nodes {
            self.collect_inline(node, avail, &mut items, &mut space);
        }
        if items.is_empty() {
            return Ok(None);
        }
        let content = InlineContent {
            items,
            align: block.text_align,
            image_gap: block.font_size * 0.25,
        };
        let leaf = Style {
            display: taffy::Display::Block,
            ..Default::default()
        };
        let id = self.taffy.new_leaf_with_context(leaf, content)?;
        self.boxes.insert(id, BoxInfo::plain(BoxKind::Inline));
        Ok(Some(id))
    }

    /// Flatten inline content into words, images and breaks. `space` carries
    /// pending collapsible whitespace across node boundaries.
    fn collect_inline(&mut self, node: &StyledNode, max_width: f32, out: &mut Vec<InlineItem>, space: &mut bool) {
        match node {
            StyledNode::Text { text, style } => {
                let run = self.run_style(style);
                if style.white_space_pre {
                    self.collect_preformatted(text, run, out);
                    *space = false;
                    return;
                }
                if text.starts_with(char::is_whitespace) {
                    *space = true;
                }
                let space_width = self.fonts.measure_text_width(" ", run.font_size, &run.font);
                let above = self.above_baseline(&run);
                let mut words = text.split_whitespace().peekable();
                while let Some(word) = words.next() {
                    let width = self.fonts.measure_text_width(word, run.font_size, &run.font);
                    let pieces = if width > max_width {
                        self.fonts.wrap_text(word, run.font_size, &run.font, max_width)
                    } else {
                        vec![word.to_string()]
                    };
                    for (i, piece) in pieces.into_iter().enumerate() {
                        let width = self.fonts.measure_text_width(&piece, run.font_size, &run.font);
                        out.push(InlineItem::Word {
                            text: piece,
                            style: run.clone(),
                            width,
                            space_width,
                            space_before: i == 0 && *space,
                            above,
                        });
                    }
                    *space = words.peek().is_some() || text.ends_with(char::is_whitespace);
                }
            }
            StyledNode::Element {
                name,
                style,
                children,
                attrs,
            } => match name.as_str() {
                "br" => {
                    out.push(InlineItem::Break {
                        height: style.font_size * style.line_height,
                    });
                    *space = false;
                }
                "img" => {
                    let Some(src) = attrs.get("src") else {
                        return;
                    };
                    let Some(index) = self.load_image(src) else {
                        return;
                    };
                    let resource = &self.images[index];
                    let (width, height) = image_size(
                        style,
                        attr_px(attrs.get("width")),
                        attr_px(attrs.get("height")),
                        (resource.px_width as f32, resource.px_height as f32),
                        max_width,
                        self.page.content_height(),
                    );
                    out.push(InlineItem::Image {
                        index,
                        width,
                        height,
                        space_before: *space,
                    });
                    *space = false;
                }
                _ => {
                    for child in children {
                        self.collect_inline(child, max_width, out, space);
                    }
                }
            },
        }
    }

    /// `white-space: pre`: one word per source line, no wrapping.
    fn collect_preformatted(&self, text: &str, run: RunStyle, out: &mut Vec<InlineItem>) {
        // A newline directly after the opening tag is not content.
        let text = if out.is_empty() {
            text.strip_prefix('\n').unwrap_or(text)
        } else {
            text
        };
        let above = self.above_baseline(&run);
        for (i, source_line) in text.split('\n').enumerate() {
            if i > 0 {
                out.push(InlineItem::Break { height: run.line_box() });
            }
            let source_line = source_line.trim_end_matches('\r');
            if source_line.is_empty() {
                continue;
            }
            let text = source_line.replace('\t', "    ");
            let width = self.fonts.measure_text_width(&text, run.font_size, &run.font);
            out.push(InlineItem::Word {
                text,
                style: run.clone(),
                width,
                space_width: 0.0,
                space_before: false,
                above,
            });
        }
    }

    fn above_baseline(&self, run: &RunStyle) -> f32 {
        (run.line_box() - run.font_size) / 2.0 + self.fonts.ascender(run.font_size, &run.font)
    }

    fn run_style(&self, style: &ComputedStyle) -> RunStyle {
        RunStyle {
            font: self.fonts.resolve(&style.font_family, style.bold, style.italic),
            font_size: style.font_size,
            color: style.color,
            underline: style.underline,
            line_height: style.line_height,
        }
    }

    /// Load and decode an image once per source. Failures are logged and
    /// remembered so the image is skipped everywhere it appears.
    fn load_image(&mut self, src: &str) -> Option<usize> {
        if let Some(cached) = self.image_cache.get(src) {
            return *cached;
        }
        let loaded = match self.document.load_resource(src) {
            Ok(bytes) => match ::image::load_from_memory(&bytes) {
                Ok(decoded) => {
                    self.images.push(ImageResource {
                        src: src.to_string(),
                        px_width: decoded.width(),
                        px_height: decoded.height(),
                        bytes,
                    });
                    Some(self.images.len() - 1)
                }
                Err(e) => {
                    log::warn!("Skipping image: decode error: {e}");
                    None
                }
            },
            Err(e) => {
                log::warn!("Skipping image: {e}");
                None
            }
        };
        self.image_cache.insert(src.to_string(), loaded);
        loaded
    }
}

/// Taffy style for a block-level box: margins, padding, border and size.
fn box_style(s: &ComputedStyle) -> Style {
    let border = LengthPercentage::Length(s.border_width);
    Style {
        display: taffy::Display::Block,
        size: Size {
            width: dim_to_taffy(s.width),
            height: dim_to_taffy(s.height),
        },
        margin: Rect {
            top: LengthPercentageAuto::Length(s.margin_top),
            right: LengthPercentageAuto::Length(s.margin_right),
            bottom: LengthPercentageAuto::Length(s.margin_bottom),
            left: LengthPercentageAuto::Length(s.margin_left),
        },
        padding: Rect {
            top: LengthPercentage::Length(s.padding_top),
            right: LengthPercentage::Length(s.padding_right),
            bottom: LengthPercentage::Length(s.padding_bottom),
            left: LengthPercentage::Length(s.padding_left),
        },
        border: uniform(border),
        ..Default::default()
    }
}

fn uniform<T: Copy>(value: T) -> Rect<T> {
    Rect {
        top: value,
        right: value,
        bottom: value,
        left: value,
    }
}

fn dim_to_taffy(d: style::Dimension) -> taffy::Dimension {
    match d {
        style::Dimension::Auto => taffy::Dimension::Auto,
        style::Dimension::Pt(v) => taffy::Dimension::Length(v),
        style::Dimension::Percent(v) => taffy::Dimension::Percent(v / 100.0),
    }
}

/// One-based grid line for a zero-based row or column index.
fn grid_line(index: usize) -> i16 {
    i16::try_from(index + 1).unwrap_or(i16::MAX)
}

/// `minmax(0, 1fr)`: columns share the width equally whatever their content.
fn equal_column() -> TrackSizingFunction {
    minmax(length(0.0), fr(1.0))
}

fn border_stroke(style: &ComputedStyle) -> Option<Stroke> {
    (style.border_width > 0.0).then_some(Stroke {
        width: style.border_width,
        color: style.border_color,
    })
}

/// Estimated content width of a box inside a containing block of `avail`.
fn inner_width(style: &ComputedStyle, avail: f32) -> f32 {
    let outer = match style.width {
        style::Dimension::Pt(w) => w,
        style::Dimension::Percent(p) => avail * p / 100.0,
        style::Dimension::Auto => avail - style.margin_left - style.margin_right,
    };
    (outer - 2.0 * style.border_width - style.padding_left - style.padding_right).max(1.0)
}

/// Rows of a table (directly or inside row groups), each as its cells.
fn table_rows(children: &[StyledNode]) -> Vec<Vec<&StyledNode>> {
    let mut rows = Vec::new();
    for child in children {
        let StyledNode::Element { style, children, .. } = child else {
            continue;
        };
        match style.display {
            style::Display::TableRowGroup => rows.extend(table_rows(children)),
            style::Display::TableRow => rows.push(
                children
                    .iter()
                    .filter(|c| c.style().display == style::Display::TableCell)
                    .collect(),
            ),
            _ => {}
        }
    }
    rows
}

/// `width="120"` / `height="80px"` attribute, in points.
fn attr_px(value: Option<&String>) -> Option<f32> {
    value?
        .trim()
        .trim_end_matches("px")
        .parse::<f32>()
        .ok()
        .map(|px| px * PX_TO_PT)
}

/// Final image size in points. CSS beats attributes beats intrinsic size; a
/// single given dimension keeps the aspect ratio; the result is scaled down
/// to fit `max_width` × `max_height`.
fn image_size(
    style: &ComputedStyle,
    attr_width: Option<f32>,
    attr_height: Option<f32>,
    (px_width, px_height): (f32, f32),
    max_width: f32,
    max_height: f32,
) -> (f32, f32) {
    let css = |dim: style::Dimension, basis: f32| match dim {
        style::Dimension::Pt(v) => Some(v),
        style::Dimension::Percent(p) => Some(basis * p / 100.0),
        style::Dimension::Auto => None,
    };
    let width = css(style.width, max_width).or(attr_width);
    let height = css(style.height, max_height).or(attr_height);

    let (mut w, mut h) = match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) if px_width > 0.0 => (w, w * px_height / px_width),
        (None, Some(h)) if px_height > 0.0 => (h * px_width / px_height, h),
        (w, h) => (
            w.unwrap_or(px_width * PX_TO_PT),
            h.unwrap_or(px_height * PX_TO_PT),
        ),
    };
    if w > max_width && w > 0.0 {
        h *= max_width / w;
        w = max_width;
    }
    if h > max_height && h > 0.0 {
        w *= max_height / h;
        h = max_height;
    }
    (w, h)
}

// ---------------------------------------------------------------------------
// Extract fragments after layout
// ---------------------------------------------------------------------------

/// Laid-out content in document coordinates (y grows down from the top of
/// the first page's content box).
#[derive(Debug, Clone)]
enum Fragment {
    /// Content that moves between pages as a unit: a line, a rule, a table row.
    Atom {
        top: f32,
        bottom: f32,
        items: Vec<PlacedItem>,
    },
    /// Background and border of a box; split across the pages it spans.
    Decoration {
        x: f32,
        width: f32,
        top: f32,
        bottom: f32,
        fill: Option<Color>,
        stroke: Option<Stroke>,
    },
    /// Forced break before a box whose border edge is at the given y.
    BreakBefore(f32),
    /// Forced break before whatever comes next.
    BreakAfter,
}

struct Extractor<'t> {
    taffy: &'t TaffyTree<InlineContent>,
    boxes: &'t HashMap<NodeId, BoxInfo>,
    /// List marker waiting for the first line of its item.
    marker: Option<Marker>,
}

impl Extractor<'_> {
    fn emit(&mut self, node: NodeId, parent_x: f32, parent_y: f32, out: &mut Vec<Fragment>) -> Result<(), TaffyError> {
        let layout = self.taffy.layout(node)?;
        let x = parent_x + layout.location.x;
        let y = parent_y + layout.location.y;
        let (width, height) = (layout.size.width, layout.size.height);

        let boxes = self.boxes;
        let Some(info) = boxes.get(&node) else {
            // The anonymous root.
            for child in self.taffy.children(node)? {
                self.emit(child, x, y, out)?;
            }
            return Ok(());
        };

        if info.break_before {
            out.push(Fragment::BreakBefore(y));
        }
        match &info.kind {
            BoxKind::Rule => {
                if let Some(stroke) = info.stroke {
                    let mid = y + height / 2.0;
                    out.push(Fragment::Atom {
                        top: y,
                        bottom: y + height,
                        items: vec![PlacedItem::Line {
                            x1: x,
                            y1: mid,
                            x2: x + width,
                            y2: mid,
                            stroke,
                        }],
                    });
                }
            }
            BoxKind::Inline => self.emit_lines(node, x, y, width, out),
            BoxKind::Table => {
                decorate(info, x, y, width, height, out);
                self.emit_table(node, x, y, out)?;
            }
            BoxKind::Block { marker } => {
                decorate(info, x, y, width, height, out);
                if marker.is_some() {
                    self.marker = marker.clone();
                }
                for child in self.taffy.children(node)? {
                    self.emit(child, x, y, out)?;
                }
                if marker.is_some() {
                    self.marker = None;
                }
            }
            BoxKind::Cell { .. } => {
                decorate(info, x, y, width, height, out);
                for child in self.taffy.children(node)? {
                    self.emit(child, x, y, out)?;
                }
            }
        }
        if info.break_after {
            out.push(Fragment::BreakAfter);
        }
        Ok(())
    }

    /// Each table row becomes one atom so rows never split across pages.
    fn emit_table(&mut self, table: NodeId, x: f32, y: f32, out: &mut Vec<Fragment>) -> Result<(), TaffyError> {
        let mut rows: BTreeMap<usize, (f32, f32, Vec<Fragment>)> = BTreeMap::new();
        for cell in self.taffy.children(table)? {
            let Some(BoxInfo {
                kind: BoxKind::Cell { row },
                ..
            }) = self.boxes.get(&cell)
            else {
                continue;
            };
            let layout = self.taffy.layout(cell)?;
            let top = y + layout.location.y;
            let bottom = top + layout.size.height;
            let entry = rows
                .entry(*row)
                .or_insert((f32::INFINITY, f32::NEG_INFINITY, Vec::new()));
            entry.0 = entry.0.min(top);
            entry.1 = entry.1.max(bottom);
            self.emit(cell, x, y, &mut entry.2)?;
        }

        for (top, bottom, fragments) in rows.into_values() {
            let mut items = Vec::new();
            for fragment in fragments {
                match fragment {
                    Fragment::Atom { items: placed, .. } => items.extend(placed),
                    Fragment::Decoration {
                        x,
                        width,
                        top,
                        bottom,
                        fill,
                        stroke,
                    } => items.push(PlacedItem::Rect {
                        x,
                        y: top,
                        width,
                        height: bottom - top,
                        fill,
                        stroke,
                    }),
                    Fragment::BreakBefore(_) | Fragment::BreakAfter => {}
                }
            }
            out.push(Fragment::Atom { top, bottom, items });
        }
        Ok(())
    }

    fn emit_lines(&mut self, node: NodeId, x: f32, y: f32, width: f32, out: &mut Vec<Fragment>) {
        let Some(content) = self.taffy.get_node_context(node) else {
            return;
        };
        let mut top = y;
        for line in content.break_lines(width) {
            let (ascent, height) = content.line_metrics(line);
            let items = &content.items[line.start..line.end];
            if items.iter().all(|i| matches!(i, InlineItem::Break { .. })) {
                top += height;
                continue;
            }
            let baseline = top + ascent;
            let mut placed = Vec::new();

            if let Some(marker) = self.marker.take() {
                placed.push(PlacedItem::Text {
                    x: x - marker.width - MARKER_GAP,
                    baseline,
                    text: marker.text,
                    font: marker.style.font,
                    font_size: marker.style.font_size,
                    color: marker.style.color,
                    underline: false,
                    width: marker.width,
                });
            }

            let slack = (width - line.width).max(0.0);
            let mut cursor = x + match content.align {
                TextAlign::Left => 0.0,
                TextAlign::Center => slack / 2.0,
                TextAlign::Right => slack,
            };

            let mut segment: Option<Segment> = None;
            for (i, item) in items.iter().enumerate() {
                let gap = if i > 0 { content.gap_before(item) } else { 0.0 };
                match item {
                    InlineItem::Word {
                        text, style, width, ..
                    } => {
                        let start = cursor + gap;
                        cursor = start + width;
                        match &mut segment {
                            Some(seg) if seg.style == *style => {
                                if gap > 0.0 {
                                    seg.text.push(' ');
                                }
                                seg.text.push_str(text);
                                seg.width = cursor - seg.x;
                            }
                            _ => {
                                let next = Segment {
                                    x: start,
                                    text: text.clone(),
                                    style: style.clone(),
                                    width: *width,
                                };
                                if let Some(done) = segment.replace(next) {
                                    placed.push(done.into_item(baseline));
                                }
                            }
                        }
                    }
                    InlineItem::Image {
                        index,
                        width,
                        height,
                        ..
                    } => {
                        if let Some(done) = segment.take() {
                            placed.push(done.into_item(baseline));
                        }
                        let start = cursor + gap;
                        cursor = start + width;
                        placed.push(PlacedItem::Image {
                            x: start,
                            y: baseline - height,
                            width: *width,
                            height: *height,
                            image: *index,
                        });
                    }
                    InlineItem::Break { .. } => {}
                }
            }
            if let Some(done) = segment {
                placed.push(done.into_item(baseline));
            }

            out.push(Fragment::Atom {
                top,
                bottom: top + height,
                items: placed,
            });
            top += height;
        }
    }
}

/// A text run being accumulated on the current line.
struct Segment {
    x: f32,
    text: String,
    style: RunStyle,
    width: f32,
}

impl Segment {
    fn into_item(self, baseline: f32) -> PlacedItem {
        PlacedItem::Text {
            x: self.x,
            baseline,
            text: self.text,
            font: self.style.font,
            font_size: self.style.font_size,
            color: self.style.color,
            underline: self.style.underline,
            width: self.width,
        }
    }
}

fn decorate(info: &BoxInfo, x: f32, y: f32, width: f32, height: f32, out: &mut Vec<Fragment>) {
    if info.fill.is_some() || info.stroke.is_some() {
        out.push(Fragment::Decoration {
            x,
            width,
            top: y,
            bottom: y + height,
            fill: info.fill,
            stroke: info.stroke,
        });
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Cut document-space fragments into pages.
///
/// A page shows the document range `[origin, origin + content_height]`. An
/// atom that would cross the bottom starts a new page whose origin is the
/// atom's top, unless it is the first content on the page. Forced breaks
/// are ignored on a page without content. Decorations are painted on every
/// page their box spans, beneath that page's content.
fn paginate(fragments: Vec<Fragment>, page: PageGeometry) -> Vec<PlannedPage> {
    let limit = page.content_height();

    let mut origins = vec![0.0f32];
    let mut placement = Vec::with_capacity(fragments.len());
    let mut has_content = false;
    let mut pending_break = false;
    for fragment in &fragments {
        let new_origin = match fragment {
            Fragment::BreakBefore(at) => {
                pending_break = false;
                has_content.then_some(*at)
            }
            Fragment::BreakAfter => {
                pending_break = true;
                None
            }
            Fragment::Decoration { top, .. } => {
                let forced = pending_break && has_content;
                pending_break = false;
                forced.then_some(*top)
            }
            Fragment::Atom { top, bottom, .. } => {
                let origin = origins.last().copied().unwrap_or(0.0);
                let forced = pending_break || bottom - origin > limit;
                pending_break = false;
                let start = (has_content && forced).then_some(*top);
                has_content = true;
                start
            }
        };
        if let Some(origin) = new_origin {
            origins.push(origin);
            // The atom that opened the page is its first content.
            has_content = matches!(fragment, Fragment::Atom { .. });
        }
        placement.push(origins.len() - 1);
    }

    let to_page = |doc_y: f32, origin: f32| doc_y - origin + page.margin;
    let mut pages = vec![PlannedPage::default(); origins.len()];
    for (fragment, first) in fragments.into_iter().zip(placement) {
        match fragment {
            Fragment::Atom { items, .. } => {
                let dy = to_page(0.0, origins[first]);
                pages[first]
                    .items
                    .extend(items.into_iter().map(|item| item.shifted(dy)));
            }
            Fragment::Decoration {
                x,
                width,
                top,
                bottom,
                fill,
                stroke,
            } => {
                for (index, &origin) in origins.iter().enumerate().skip(first) {
                    if index > first && origin >= bottom {
                        break;
                    }
                    let seg_top = top.max(origin);
                    let seg_bottom = bottom.min(origin + limit);
                    if seg_bottom <= seg_top {
                        continue;
                    }
                    pages[index].items.push(PlacedItem::Rect {
                        x,
                        y: to_page(seg_top, origin),
                        width,
                        height: seg_bottom - seg_top,
                        fill,
                        stroke,
                    });
                }
            }
            Fragment::BreakBefore(_) | Fragment::BreakAfter => {}
        }
    }
    pages
}
