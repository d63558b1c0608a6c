//! Pipeline – ties together parsing, styling, layout and PDF writing into a
//! single call against a long-lived [`Renderer`].

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Once;

use crate::document::HtmlDocument;
use crate::error::BridgeError;
use crate::fonts::FontConfiguration;
use crate::layout::{layout_document, PageGeometry, PagePlan};
use crate::render::render_pdf;
use crate::style::{build_styled_tree, root_style, StyleResolver};
use crate::stylesheet::Stylesheet;

/// Title used when the document has no `<title>`.
pub const DEFAULT_TITLE: &str = "forge-bridge output";

/// Configuration for the rendering pipeline.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Directory relative image sources resolve against (default: ".").
    pub base_url: PathBuf,
    /// Let the PDF writer recompress images (default: false).
    pub optimize_images: bool,
    /// Page size and margin; `@page` rules override it per document
    /// (default: A4 portrait, 40pt margins).
    pub page: PageGeometry,
    /// Title embedded when the document has none.
    pub title: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            base_url: PathBuf::from("."),
            optimize_images: false,
            page: PageGeometry::A4,
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

/// Anything that turns HTML (plus optional CSS) into PDF bytes.
///
/// The bridges only depend on this trait.
pub trait PdfRenderer {
    fn render(&self, html: &str, css: Option<&str>) -> Result<Vec<u8>, BridgeError>;
}

/// The document renderer. Owns the font configuration for its whole lifetime
/// so discovery happens once per process.
#[derive(Debug)]
pub struct Renderer {
    fonts: FontConfiguration,
    options: RenderOptions,
}

impl Renderer {
    pub fn new(fonts: FontConfiguration, options: RenderOptions) -> Self {
        Self { fonts, options }
    }

    /// Parse, style and lay out a document without writing the PDF.
    ///
    /// Cascade order: user-agent sheet, the document's `<style>` blocks, then
    /// `css`; inline `style` attributes beat all of them.
    pub fn plan(&self, html: &str, css: Option<&str>) -> Result<PagePlan, BridgeError> {
        let document = HtmlDocument::from_string(html, &self.options.base_url);

        let mut sheets = vec![Stylesheet::user_agent()];
        sheets.extend(
            document
                .style_blocks
                .iter()
                .map(|block| Stylesheet::from_string(block, &self.fonts)),
        );
        if let Some(css) = css.filter(|css| !css.is_empty()) {
            sheets.push(Stylesheet::from_string(css, &self.fonts));
        }

        let mut page = self.options.page;
        for sheet in &sheets {
            if let Some((width, height)) = sheet.page.size {
                page.width = width;
                page.height = height;
            }
            if let Some(margin) = sheet.page.margin {
                page.margin = margin;
            }
        }

        let resolver = StyleResolver::new(&sheets);
        let root = root_style();
        let styled = build_styled_tree(&document.nodes, &root, &resolver);

        let title = document
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.options.title.clone());

        layout_document(&styled, &root, &document, &self.fonts, page, title)
            .map_err(|e| BridgeError::Render(format!("layout failed: {e}")))
    }
}

impl PdfRenderer for Renderer {
    /// Full pipeline: HTML string → PDF bytes. Panics inside the pipeline are
    /// reported as render failures.
    fn render(&self, html: &str, css: Option<&str>) -> Result<Vec<u8>, BridgeError> {
        guarded(|| {
            let plan = self.plan(html, css)?;
            render_pdf(&plan, &self.fonts, self.options.optimize_images).map_err(BridgeError::Render)
        })
    }
}

thread_local! {
    static RENDERING: Cell<bool> = const { Cell::new(false) };
}

static QUIET_HOOK: Once = Once::new();

/// Run `body`, turning a panic into [`BridgeError::Render`].
///
/// While `body` runs on this thread the default panic message is demoted to
/// a debug log, so the diagnostic stream carries only the bridge's own report.
fn guarded<T>(body: impl FnOnce() -> Result<T, BridgeError>) -> Result<T, BridgeError> {
    QUIET_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RENDERING.with(Cell::get) {
                log::debug!("Renderer panicked: {info}");
            } else {
                previous(info);
            }
        }));
    });

    let was_rendering = RENDERING.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    RENDERING.with(|flag| flag.set(was_rendering));

    outcome.unwrap_or_else(|payload| Err(BridgeError::Render(panic_detail(payload.as_ref()))))
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "renderer panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> Renderer {
        Renderer::new(FontConfiguration::builtin(), RenderOptions::default())
    }

    #[test]
    fn pipeline_basic() {
        let bytes = renderer().render("<h1>Hello</h1><p>World</p>", None).unwrap();
        assert_eq!(&bytes[0..5], b"%PDF-");
    }

    #[test]
    fn request_css_changes_font_size() {
        let r = renderer();
        let font_size = |plan: &PagePlan| match &plan.pages[0].items[0] {
            crate::layout::PlacedItem::Text { font_size, .. } => *font_size,
            other => panic!("Expected text, got {other:?}"),
        };
        assert_eq!(font_size(&r.plan("<p>x</p>", None).unwrap()), 12.0);
        assert_eq!(font_size(&r.plan("<p>x</p>", Some("p { font-size: 20pt }")).unwrap()), 20.0);
        assert_eq!(font_size(&r.plan("<p>x</p>", Some("")).unwrap()), 12.0);
    }

    #[test]
    fn request_css_beats_document_style_blocks() {
        let html = "<style>p { font-size: 30pt }</style><p>x</p>";
        let plan = renderer().plan(html, Some("p { font-size: 10pt }")).unwrap();
        let crate::layout::PlacedItem::Text { font_size, .. } = &plan.pages[0].items[0] else {
            panic!("Expected text");
        };
        assert_eq!(*font_size, 10.0);
    }

    #[test]
    fn page_rule_overrides_geometry() {
        let plan = renderer()
            .plan("<p>x</p>", Some("@page { size: letter landscape; margin: 1in }"))
            .unwrap();
        assert_eq!((plan.page_width, plan.page_height), (792.0, 612.0));
        let crate::layout::PlacedItem::Text { x, .. } = &plan.pages[0].items[0] else {
            panic!("Expected text");
        };
        assert_eq!(*x, 72.0);
    }

    #[test]
    fn default_title_when_document_has_none() {
        assert_eq!(renderer().plan("<p>x</p>", None).unwrap().title, DEFAULT_TITLE);
    }

    #[test]
    fn panics_become_render_errors() {
        let result: Result<(), BridgeError> = guarded(|| panic!("boom"));
        assert!(matches!(result, Err(BridgeError::Render(ref detail)) if detail == "boom"));
        assert!(!RENDERING.with(Cell::get));
    }

    #[test]
    fn guarded_passes_results_through() {
        assert_eq!(guarded(|| Ok(7)).unwrap(), 7);
        assert!(matches!(guarded::<()>(|| Err(BridgeError::MissingHtml)), Err(BridgeError::MissingHtml)));
    }
}
