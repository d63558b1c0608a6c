//! PDF writer – takes a [`PagePlan`] and produces PDF bytes using
//! `printpdf` (v0.8 ops-based API).

use std::collections::{BTreeMap, BTreeSet};

use printpdf::*;
use sha2::{Digest, Sha256};

use crate::fonts::{BuiltinFamily, FontConfiguration, FontRef};
use crate::layout::{PagePlan, PlacedItem, Stroke};
use crate::style::Color as StyleColor;

/// Points to millimetres.
const PT_TO_MM: f32 = 0.352778;

/// How a planned font is written: a base-14 font or an embedded face.
#[derive(Clone)]
enum PdfFont {
    Builtin(BuiltinFont),
    Embedded(FontId),
}

/// A printpdf XObject together with the pixel dimensions of the source image.
struct ImageXObject {
    id: XObjectId,
    px_width: u32,
    px_height: u32,
}

/// Render a plan into PDF bytes.
///
/// Embedded faces that fail to load fall back to Helvetica and images that
/// printpdf cannot decode are skipped; both are logged at `warn`.
pub fn render_pdf(
    plan: &PagePlan,
    fonts: &FontConfiguration,
    optimize_images: bool,
) -> Result<Vec<u8>, String> {
    if plan.page_width <= 0.0 || plan.page_height <= 0.0 {
        return Err(format!(
            "invalid page size {}x{}pt",
            plan.page_width, plan.page_height
        ));
    }
    let page_w = Mm(plan.page_width * PT_TO_MM);
    let page_h = Mm(plan.page_height * PT_TO_MM);

    let mut doc = PdfDocument::new(&plan.title);
    let mut warnings: Vec<PdfWarnMsg> = Vec::new();

    // ── Register embedded faces ───────────────────────────────────────────
    let used_faces: BTreeSet<usize> = plan
        .pages
        .iter()
        .flat_map(|page| page.items.iter())
        .filter_map(|item| match item {
            PlacedItem::Text {
                font: FontRef::Face(index),
                ..
            } => Some(*index),
            _ => None,
        })
        .collect();

    let mut embedded: BTreeMap<usize, FontId> = BTreeMap::new();
    for index in used_faces {
        let Some(bytes) = fonts.face_bytes(index) else {
            continue;
        };
        match ParsedFont::from_bytes(bytes, 0, &mut warnings) {
            Some(parsed) => {
                // Resource names follow the plan, not printpdf's random ids.
                let id = FontId(format!("F{index}"));
                doc.resources.fonts.map.insert(id.clone(), parsed);
                embedded.insert(index, id);
            }
            None => log::warn!("Font face {index} could not be embedded, using Helvetica"),
        }
    }

    // ── Register images ───────────────────────────────────────────────────
    let mut images: Vec<Option<ImageXObject>> = Vec::with_capacity(plan.images.len());
    for (index, resource) in plan.images.iter().enumerate() {
        match RawImage::decode_from_bytes(&resource.bytes, &mut warnings) {
            Ok(raw) => {
                let id = XObjectId(format!("Im{index}"));
                doc.resources.xobjects.map.insert(id.clone(), XObject::Image(raw));
                images.push(Some(ImageXObject {
                    id,
                    px_width: resource.px_width,
                    px_height: resource.px_height,
                }));
            }
            Err(e) => {
                log::warn!("Skipping image: PDF encode error: {e}");
                images.push(None);
            }
        }
    }

    // ── Render pages ──────────────────────────────────────────────────────
    let mut pages = Vec::with_capacity(plan.pages.len());
    for planned in &plan.pages {
        let mut ops = Vec::new();
        for item in &planned.items {
            render_item(&mut ops, item, plan.page_height, &embedded, &images);
        }
        pages.push(PdfPage::new(page_w, page_h, ops));
    }
    if pages.is_empty() {
        pages.push(PdfPage::new(page_w, page_h, Vec::new()));
    }

    doc.with_pages(pages);

    let mut options = PdfSaveOptions::default();
    if !optimize_images {
        options.image_optimization = None;
    }
    let mut bytes = doc.save(&options, &mut warnings);
    if !stamp_document_id(&mut bytes, &document_id(plan)) {
        log::debug!("No trailer /ID found, document id left as written");
    }
    log::debug!(
        "Wrote {} page(s), {} bytes, {} printpdf warning(s)",
        plan.pages.len(),
        bytes.len(),
        warnings.len()
    );
    Ok(bytes)
}

/// Length of each string in the trailer `/ID` pair.
const ID_LEN: usize = 32;

/// Document id derived from the plan, so identical plans give identical
/// files: hex of the first half of a SHA-256 over the plan and image bytes.
fn document_id(plan: &PagePlan) -> [u8; ID_LEN] {
    let mut hasher = Sha256::new();
    // A plan holds only numbers, strings and enums; serialisation cannot fail.
    hasher.update(serde_json::to_vec(plan).unwrap_or_default());
    for image in &plan.images {
        hasher.update(&image.bytes);
    }
    let digest = hasher.finalize();

    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut id = [0u8; ID_LEN];
    for (i, byte) in digest.iter().take(ID_LEN / 2).enumerate() {
        id[2 * i] = HEX[usize::from(byte >> 4)];
        id[2 * i + 1] = HEX[usize::from(byte & 0x0f)];
    }
    id
}

/// Overwrite both strings of the last trailer `/ID [(..) (..)]` with `id`.
///
/// printpdf writes 32-character random strings there; the replacement has
/// the same length so no cross-reference offset moves. Returns `false` and
/// leaves `bytes` alone when no such entry is found.
fn stamp_document_id(bytes: &mut [u8], id: &[u8; ID_LEN]) -> bool {
    let Some(key) = bytes.windows(3).rposition(|w| w == b"/ID") else {
        return false;
    };
    let mut pos = key + 3;

    if !skip_to(bytes, &mut pos, b'[') {
        return false;
    }
    let mut slots = [0usize; 2];
    for slot in &mut slots {
        if !skip_to(bytes, &mut pos, b'(') {
            return false;
        }
        *slot = pos;
        pos += ID_LEN;
        if !skip_to(bytes, &mut pos, b')') {
            return false;
        }
    }
    for start in slots {
        bytes[start..start + ID_LEN].copy_from_slice(id);
    }
    true
}

/// Skip whitespace, then consume `byte` if it is next.
fn skip_to(bytes: &[u8], pos: &mut usize, byte: u8) -> bool {
    while bytes.get(*pos).is_some_and(u8::is_ascii_whitespace) {
        *pos += 1;
    }
    if bytes.get(*pos) == Some(&byte) {
        *pos += 1;
        true
    } else {
        false
    }
}

fn render_item(
    ops: &mut Vec<Op>,
    item: &PlacedItem,
    page_height: f32,
    embedded: &BTreeMap<usize, FontId>,
    images: &[Option<ImageXObject>],
) {
    // PDF coordinate system: origin at bottom-left; the plan's is top-left.
    match item {
        PlacedItem::Rect {
            x,
            y,
            width,
            height,
            fill,
            stroke,
        } => {
            let x1 = *x;
            let x2 = x + width;
            let y1 = page_height - y - height;
            let y2 = page_height - y;
            let corners = vec![point(x1, y1), point(x2, y1), point(x2, y2), point(x1, y2)];
            if let Some(fill) = fill {
                ops.push(Op::SetFillColor { col: rgb(fill) });
                ops.push(Op::DrawPolygon {
                    polygon: Polygon {
                        rings: vec![PolygonRing {
                            points: corners.clone(),
                        }],
                        mode: PaintMode::Fill,
                        winding_order: WindingOrder::NonZero,
                    },
                });
            }
            if let Some(stroke) = stroke {
                set_stroke(ops, stroke);
                ops.push(Op::DrawLine {
                    line: Line {
                        points: corners,
                        is_closed: true,
                    },
                });
            }
        }
        PlacedItem::Line {
            x1,
            y1,
            x2,
            y2,
            stroke,
        } => {
            set_stroke(ops, stroke);
            ops.push(Op::DrawLine {
                line: Line {
                    points: vec![point(*x1, page_height - y1), point(*x2, page_height - y2)],
                    is_closed: false,
                },
            });
        }
        PlacedItem::Text {
            x,
            baseline,
            text,
            font,
            font_size,
            color,
            underline,
            width,
        } => {
            if text.is_empty() {
                return;
            }
            let text_y = page_height - baseline;
            let pdf_font = match font {
                FontRef::Builtin {
                    family,
                    bold,
                    italic,
                } => PdfFont::Builtin(builtin_font(*family, *bold, *italic)),
                FontRef::Face(index) => match embedded.get(index) {
                    Some(id) => PdfFont::Embedded(id.clone()),
                    None => PdfFont::Builtin(BuiltinFont::Helvetica),
                },
            };

            ops.push(Op::StartTextSection);
            ops.push(Op::SetTextCursor {
                pos: Point {
                    x: Pt(*x),
                    y: Pt(text_y),
                },
            });
            ops.push(Op::SetFillColor { col: rgb(color) });
            match pdf_font {
                PdfFont::Builtin(font) => {
                    ops.push(Op::SetFontSizeBuiltinFont {
                        size: Pt(*font_size),
                        font,
                    });
                    ops.push(Op::WriteTextBuiltinFont {
                        items: vec![TextItem::Text(to_winlatin(text))],
                        font,
                    });
                }
                PdfFont::Embedded(font) => {
                    ops.push(Op::SetFontSize {
                        size: Pt(*font_size),
                        font: font.clone(),
                    });
                    ops.push(Op::WriteText {
                        items: vec![TextItem::Text(text.clone())],
                        font,
                    });
                }
            }
            ops.push(Op::EndTextSection);

            if *underline {
                let underline_y = text_y - font_size * 0.1;
                set_stroke(
                    ops,
                    &Stroke {
                        width: (font_size / 20.0).max(0.5),
                        color: *color,
                    },
                );
                ops.push(Op::DrawLine {
                    line: Line {
                        points: vec![point(*x, underline_y), point(x + width, underline_y)],
                        is_closed: false,
                    },
                });
            }
        }
        PlacedItem::Image {
            x,
            y,
            width,
            height,
            image,
        } => {
            let Some(Some(res)) = images.get(*image) else {
                return;
            };
            // At dpi=72 printpdf renders 1 px = 1 pt, so scale = desired_pt / px.
            let scale_x = if res.px_width > 0 {
                width / res.px_width as f32
            } else {
                1.0
            };
            let scale_y = if res.px_height > 0 {
                height / res.px_height as f32
            } else {
                1.0
            };
            ops.push(Op::UseXobject {
                id: res.id.clone(),
                transform: XObjectTransform {
                    translate_x: Some(Pt(*x)),
                    translate_y: Some(Pt(page_height - y - height)),
                    dpi: Some(72.0),
                    scale_x: Some(scale_x),
                    scale_y: Some(scale_y),
                    rotate: None,
                },
            });
        }
    }
}

fn builtin_font(family: BuiltinFamily, bold: bool, italic: bool) -> BuiltinFont {
    match (family, bold, italic) {
        (BuiltinFamily::Helvetica, false, false) => BuiltinFont::Helvetica,
        (BuiltinFamily::Helvetica, true, false) => BuiltinFont::HelveticaBold,
        (BuiltinFamily::Helvetica, false, true) => BuiltinFont::HelveticaOblique,
        (BuiltinFamily::Helvetica, true, true) => BuiltinFont::HelveticaBoldOblique,
        (BuiltinFamily::Times, false, false) => BuiltinFont::TimesRoman,
        (BuiltinFamily::Times, true, false) => BuiltinFont::TimesBold,
        (BuiltinFamily::Times, false, true) => BuiltinFont::TimesItalic,
        (BuiltinFamily::Times, true, true) => BuiltinFont::TimesBoldItalic,
        (BuiltinFamily::Courier, false, false) => BuiltinFont::Courier,
        (BuiltinFamily::Courier, true, false) => BuiltinFont::CourierBold,
        (BuiltinFamily::Courier, false, true) => BuiltinFont::CourierOblique,
        (BuiltinFamily::Courier, true, true) => BuiltinFont::CourierBoldOblique,
    }
}

fn rgb(color: &StyleColor) -> Color {
    Color::Rgb(Rgb {
        r: color.r,
        g: color.g,
        b: color.b,
        icc_profile: None,
    })
}

fn point(x: f32, y: f32) -> LinePoint {
    LinePoint {
        p: Point { x: Pt(x), y: Pt(y) },
        bezier: false,
    }
}

fn set_stroke(ops: &mut Vec<Op>, stroke: &Stroke) {
    ops.push(Op::SetOutlineColor {
        col: rgb(&stroke.color),
    });
    ops.push(Op::SetOutlineThickness {
        pt: Pt(stroke.width),
    });
}

/// Convert a UTF-8 string to raw Windows-1252 bytes then wrap in a String so
/// printpdf writes the bytes unchanged into the PDF stream (builtin fonts use
/// WinAnsiEncoding, so each glyph is one byte 0x00–0xFF).
fn to_winlatin(s: &str) -> String {
    let bytes: Vec<u8> = s
        .chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80, // euro
            '\u{201A}' => 0x82, // single low-9 quote
            '\u{201E}' => 0x84, // double low-9 quote
            '\u{2026}' => 0x85, // ellipsis
            '\u{2018}' => 0x91, // left single quote
            '\u{2019}' => 0x92, // right single quote
            '\u{201C}' => 0x93, // left double quote
            '\u{201D}' => 0x94, // right double quote
            '\u{2022}' => 0x95, // bullet
            '\u{2013}' => 0x96, // en dash
            '\u{2014}' => 0x97, // em dash
            '\u{2122}' => 0x99, // trademark
            '\u{00A0}' => 0x20, // non-breaking space
            c if (c as u32) < 256 => c as u8,
            _ => b'?',
        })
        .collect();
    // SAFETY: intentionally non-UTF-8 for 0x80-0xFF; printpdf passes these
    // bytes straight to the PDF stream, decoded by WinAnsiEncoding.
    #[allow(unsafe_code)]
    unsafe {
        String::from_utf8_unchecked(bytes)
    }
}
