//! Integration tests for the forge bridges.
//!
//! These tests validate:
//! - Both bridges produce valid PDFs through the real renderer
//! - Protocol behaviour: ordering, skipped lines, fatal errors, request ids
//! - Request CSS reaches the cascade (@page, specificity, inline styles)
//! - Pagination and page-break hints
//! - Determinism of the page plan and PDF bytes
//! - Robustness against deeply nested markup

use forge_bridge::bridge::{fast, secure};
use forge_bridge::layout::{PagePlan, PlacedItem};
use forge_bridge::protocol::{split_documents, FatalReport, RenderResponse};
use forge_bridge::{BridgeError, FontConfiguration, PdfRenderer, RenderOptions, Renderer};
use sha2::{Digest, Sha256};

// =====================================================================
// Helpers
// =====================================================================

fn renderer() -> Renderer {
    Renderer::new(FontConfiguration::builtin(), RenderOptions::default())
}

fn assert_valid_pdf(bytes: &[u8]) {
    assert!(bytes.len() > 100, "PDF too small: {} bytes", bytes.len());
    assert_eq!(&bytes[0..5], b"%PDF-", "Missing PDF header");
    let tail = &bytes[bytes.len().saturating_sub(32)..];
    assert!(
        tail.windows(5).any(|w| w == b"%%EOF"),
        "Missing %%EOF trailer"
    );
}

fn request(html: &str, css: Option<&str>, id: Option<&str>) -> String {
    let mut value = serde_json::json!({ "html": html });
    if let Some(css) = css {
        value["css"] = css.into();
    }
    if let Some(id) = id {
        value["request_id"] = id.into();
    }
    format!("{value}\n")
}

fn run_fast(renderer: &dyn PdfRenderer, input: &str) -> (Result<usize, BridgeError>, Vec<u8>, String) {
    let mut out = Vec::new();
    let mut diag = Vec::new();
    let result = fast::serve(renderer, input.as_bytes(), &mut out, &mut diag);
    (result, out, String::from_utf8(diag).unwrap())
}

fn run_secure(renderer: &dyn PdfRenderer, input: &str) -> (RenderResponse, String) {
    let mut out = Vec::new();
    let mut diag = Vec::new();
    let response = secure::handle(renderer, input.as_bytes(), &mut out, &mut diag).unwrap();
    (response, String::from_utf8(out).unwrap())
}

/// Byte offsets of every `%PDF-` header in a concatenated stream.
fn pdf_starts(stream: &[u8]) -> Vec<usize> {
    stream
        .windows(5)
        .enumerate()
        .filter(|(_, w)| *w == b"%PDF-")
        .map(|(i, _)| i)
        .collect()
}

fn texts(plan: &PagePlan) -> Vec<Vec<String>> {
    plan.pages
        .iter()
        .map(|page| {
            page.items
                .iter()
                .filter_map(|item| match item {
                    PlacedItem::Text { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        })
        .collect()
}

struct AlwaysFails;

impl PdfRenderer for AlwaysFails {
    fn render(&self, _html: &str, _css: Option<&str>) -> Result<Vec<u8>, BridgeError> {
        Err(BridgeError::Render("engine unavailable".to_string()))
    }
}

// =====================================================================
// Persistent bridge
// =====================================================================

#[test]
fn fast_renders_one_pdf_per_request_in_order() {
    let r = renderer();
    let input = request("<h1>First</h1>", None, None) + &request("<p>Second</p><p>page</p>", Some("p { color: red }"), None);
    let (result, out, diag) = run_fast(&r, &input);

    assert_eq!(result.unwrap(), 2);
    assert_eq!(diag, "forge bridge ready\n");
    let documents = split_documents(&out);
    assert_eq!(documents.len(), 2, "expected two concatenated PDFs");
    assert_eq!(pdf_starts(&out)[0], 0);
    documents.iter().for_each(|pdf| assert_valid_pdf(pdf));

    // Same bytes as rendering each request directly.
    assert_eq!(documents[0], r.render("<h1>First</h1>", None).unwrap());
}

#[test]
fn fast_skips_malformed_lines() {
    let r = renderer();
    let input = format!("{{not json\n{}", request("<p>ok</p>", None, None));
    let (result, out, _) = run_fast(&r, &input);
    assert_eq!(result.unwrap(), 1);
    assert_eq!(pdf_starts(&out), vec![0]);
}

#[test]
fn fast_empty_html_is_fatal() {
    let r = renderer();
    let input = request("", None, Some("x")) + &request("<p>never</p>", None, None);
    let (result, out, diag) = run_fast(&r, &input);

    assert!(matches!(result, Err(BridgeError::MissingHtml)));
    assert!(out.is_empty(), "no bytes may be written for a failed request");
    let report: FatalReport = serde_json::from_str(diag.lines().last().unwrap()).unwrap();
    assert!(!report.success);
    assert_eq!(report.error, "HTML content is required");
    assert!(!report.traceback.is_empty());
}

#[test]
fn fast_render_failure_is_fatal() {
    let (result, out, diag) = run_fast(&AlwaysFails, &request("<p>x</p>", None, None));
    assert!(matches!(result, Err(BridgeError::Render(_))));
    assert!(out.is_empty());
    assert!(diag.contains("PDF generation failed: engine unavailable"));
}

#[test]
fn fast_empty_input_exits_cleanly() {
    let (result, out, diag) = run_fast(&renderer(), "");
    assert_eq!(result.unwrap(), 0);
    assert!(out.is_empty());
    assert_eq!(diag, "forge bridge ready\n");
}

// =====================================================================
// Single-shot bridge
// =====================================================================

#[test]
fn secure_returns_base64_pdf() {
    let (resp, out) = run_secure(&renderer(), &request("<h1>Report</h1>", Some("h1 { color: navy }"), Some("req-1")));
    assert!(resp.success);
    assert_eq!(resp.request_id, "req-1");
    let pdf = resp.pdf_bytes().unwrap();
    assert_valid_pdf(&pdf);
    assert_eq!(resp.size, Some(pdf.len()));
    assert!(out.starts_with("{\"success\":true,\"request_id\":\"req-1\",\"pdf_base64\":"));
    assert_eq!(out.lines().count(), 1);
}

#[test]
fn secure_without_request_id_uses_unknown() {
    let (resp, _) = run_secure(&renderer(), &request("<p>x</p>", None, None));
    assert!(resp.success);
    assert_eq!(resp.request_id, "unknown");
}

#[test]
fn secure_missing_html_fails() {
    let (resp, out) = run_secure(&renderer(), "{\"request_id\":\"r-9\"}\n");
    assert!(!resp.success);
    assert_eq!(resp.request_id, "r-9");
    assert_eq!(
        out.trim(),
        r#"{"success":false,"request_id":"r-9","error":"HTML content is required"}"#
    );
}

#[test]
fn secure_render_failure_reports_error() {
    let (resp, _) = run_secure(&AlwaysFails, &request("<p>x</p>", None, Some("r-10")));
    assert!(!resp.success);
    assert_eq!(resp.request_id, "r-10");
    assert_eq!(resp.error.as_deref(), Some("PDF generation failed: engine unavailable"));
    assert!(resp.pdf_base64.is_none());
}

#[test]
fn secure_echoes_non_string_request_ids() {
    let (resp, out) = run_secure(&renderer(), "{\"html\":\"<p>x</p>\",\"request_id\":1234}\n");
    assert!(resp.success);
    assert_eq!(resp.request_id, serde_json::json!(1234));
    assert!(out.starts_with("{\"success\":true,\"request_id\":1234,"));

    let (resp, _) = run_secure(&renderer(), "{\"request_id\":[\"batch\",3]}\n");
    assert!(!resp.success);
    assert_eq!(resp.request_id, serde_json::json!(["batch", 3]));
}

#[test]
fn secure_handles_only_the_first_line() {
    let input = request("<p>one</p>", None, Some("a")) + &request("<p>two</p>", None, Some("b"));
    let (resp, out) = run_secure(&renderer(), &input);
    assert_eq!(resp.request_id, "a");
    assert_eq!(out.lines().count(), 1);
}

// =====================================================================
// Rendering semantics
// =====================================================================

#[test]
fn page_rule_sets_pdf_page_size() {
    let plan = renderer().plan("<p>x</p>", Some("@page { size: A5 }")).unwrap();
    assert_eq!((plan.page_width, plan.page_height), (419.53, 595.28));
}

#[test]
fn inline_style_beats_specific_selector() {
    let css = "#intro { font-size: 20pt } .lead { font-size: 16pt } p { font-size: 8pt }";
    let r = renderer();
    let size = |html: &str| match &r.plan(html, Some(css)).unwrap().pages[0].items[0] {
        PlacedItem::Text { font_size, .. } => *font_size,
        other => panic!("Expected text, got {other:?}"),
    };
    assert_eq!(size("<p>x</p>"), 8.0);
    assert_eq!(size(r#"<p class="lead">x</p>"#), 16.0);
    assert_eq!(size(r#"<p class="lead" id="intro">x</p>"#), 20.0);
    assert_eq!(size(r#"<p class="lead" id="intro" style="font-size: 9pt">x</p>"#), 9.0);
}

#[test]
fn long_documents_span_pages() {
    let html: String = (1..=150).map(|i| format!("<p>Line {i}</p>")).collect();
    let plan = renderer().plan(&html, None).unwrap();
    assert!(plan.pages.len() >= 3, "got {} page(s)", plan.pages.len());
    let flat: Vec<String> = texts(&plan).into_iter().flatten().collect();
    assert_eq!(flat.first().map(String::as_str), Some("Line 1"));
    assert_eq!(flat.last().map(String::as_str), Some("Line 150"));
    assert_eq!(flat.len(), 150);

    assert_valid_pdf(&renderer().render(&html, None).unwrap());
}

#[test]
fn page_break_css_from_request() {
    let html = r#"<section>A</section><section class="chapter">B</section>"#;
    let plan = renderer()
        .plan(html, Some(".chapter { page-break-before: always }"))
        .unwrap();
    assert_eq!(texts(&plan), vec![vec!["A".to_string()], vec!["B".to_string()]]);
}

#[test]
fn full_document_with_head_and_styles() {
    let html = r#"<!DOCTYPE html>
<html>
  <head>
    <title>Invoice 42</title>
    <style>h1 { color: #336699 } td { border: 1px solid black }</style>
    <script>console.log("ignored")</script>
  </head>
  <body>
    <h1>Invoice &amp; receipt</h1>
    <table>
      <thead><tr><th>Item</th><th>Price</th></tr></thead>
      <tbody><tr><td>Widget</td><td>&euro;10</td></tr></tbody>
    </table>
    <ul><li>Paid</li></ul>
  </body>
</html>"#;
    let r = renderer();
    let plan = r.plan(html, None).unwrap();
    assert_eq!(plan.title, "Invoice 42");
    let all: Vec<String> = texts(&plan).into_iter().flatten().collect();
    assert!(all.contains(&"Invoice & receipt".to_string()));
    assert!(all.contains(&"\u{20AC}10".to_string()));
    assert!(!all.iter().any(|t| t.contains("console")));
    assert_valid_pdf(&r.render(html, None).unwrap());
}

#[test]
fn images_resolve_against_base_url() {
    let dir = tempfile::tempdir().unwrap();
    let img = image::RgbImage::from_pixel(8, 4, image::Rgb([200, 30, 30]));
    img.save(dir.path().join("logo.png")).unwrap();

    let options = RenderOptions {
        base_url: dir.path().to_path_buf(),
        ..RenderOptions::default()
    };
    let r = Renderer::new(FontConfiguration::builtin(), options);
    let html = r#"<p>Logo:</p><img src="logo.png" width="80">"#;

    let plan = r.plan(html, None).unwrap();
    assert_eq!(plan.images.len(), 1);
    assert_eq!((plan.images[0].px_width, plan.images[0].px_height), (8, 4));
    let placed = plan.pages[0]
        .items
        .iter()
        .find_map(|item| match item {
            PlacedItem::Image { width, height, .. } => Some((*width, *height)),
            _ => None,
        })
        .unwrap();
    assert_eq!(placed, (60.0, 30.0));

    assert_valid_pdf(&r.render(html, None).unwrap());
}

#[test]
fn identical_requests_are_deterministic() {
    let html = "<h1>Stable</h1><p>Same input, same plan.</p><ol><li>a</li><li>b</li></ol>";
    let css = "h1 { text-align: center }";
    let r = renderer();

    let digest = |plan: &PagePlan| Sha256::digest(serde_json::to_vec(plan).unwrap());
    assert_eq!(
        digest(&r.plan(html, Some(css)).unwrap()),
        digest(&r.plan(html, Some(css)).unwrap())
    );

    let a = r.render(html, Some(css)).unwrap();
    let b = r.render(html, Some(css)).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, renderer().render(html, Some(css)).unwrap());
}

#[test]
fn identical_requests_with_images_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    image::RgbImage::from_pixel(6, 6, image::Rgb([10, 120, 40]))
        .save(dir.path().join("dot.png"))
        .unwrap();
    let options = RenderOptions {
        base_url: dir.path().to_path_buf(),
        ..RenderOptions::default()
    };
    let r = Renderer::new(FontConfiguration::builtin(), options);
    let html = r#"<p>Dot <img src="dot.png"> and again <img src="dot.png"></p>"#;
    assert_eq!(r.render(html, None).unwrap(), r.render(html, None).unwrap());
}

// =====================================================================
// Hostile input
// =====================================================================

/// Run `body` on a thread with the same 8 MiB stack the binaries' main
/// thread gets on Linux.
fn with_main_sized_stack<T: Send + 'static>(body: impl FnOnce() -> T + Send + 'static) -> T {
    std::thread::Builder::new()
        .stack_size(8 * 1024 * 1024)
        .spawn(body)
        .unwrap()
        .join()
        .unwrap()
}

#[test]
fn deeply_nested_markup_renders() {
    let pdf = with_main_sized_stack(|| {
        let html = "<div>".repeat(20_000) + "x";
        renderer().render(&html, None)
    });
    assert_valid_pdf(&pdf.unwrap());
}

#[test]
fn deeply_nested_markup_keeps_its_text() {
    let texts = with_main_sized_stack(|| {
        let html = "<ul><li>".repeat(5_000) + "deep" + &"</li></ul>".repeat(5_000) + "<p>after</p>";
        let plan = renderer().plan(&html, None).unwrap();
        texts(&plan).into_iter().flatten().collect::<Vec<_>>()
    });
    assert!(texts.contains(&"deep".to_string()));
    assert_eq!(texts.last().map(String::as_str), Some("after"));
}

#[test]
fn deeply_nested_secure_request_succeeds() {
    let resp = with_main_sized_stack(|| {
        let input = request(&"<div>".repeat(20_000), None, Some("deep"));
        run_secure(&renderer(), &input).0
    });
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.request_id, "deep");
}
