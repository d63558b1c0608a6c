//! Single-shot bridge: exactly one request per process.
//!
//! The response is always one JSON line on the output stream, success or not.
//! The caller reads `success` (or the process exit status) to tell them apart.

use std::io::{BufRead, Write};

use crate::error::BridgeError;
use crate::pipeline::PdfRenderer;
use crate::protocol::{
    recover_request_id, signal_ready, write_json_line, RenderRequest, RenderResponse, UNKNOWN_REQUEST_ID,
};

/// Read one request, render it and write the response.
///
/// `Err` only when the streams themselves fail; request failures come back
/// as `Ok` with `success == false`.
pub fn handle<R, I, O, D>(renderer: &R, mut input: I, output: &mut O, diag: &mut D) -> Result<RenderResponse, BridgeError>
where
    R: PdfRenderer + ?Sized,
    I: BufRead,
    O: Write,
    D: Write,
{
    signal_ready(diag)?;
    let response = respond(renderer, &mut input);
    write_json_line(output, &response)?;
    Ok(response)
}

fn respond<R, I>(renderer: &R, input: &mut I) -> RenderResponse
where
    R: PdfRenderer + ?Sized,
    I: BufRead,
{
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => return RenderResponse::failure(UNKNOWN_REQUEST_ID, &BridgeError::NoInput),
        Ok(_) => {}
        Err(e) => return RenderResponse::failure(UNKNOWN_REQUEST_ID, &BridgeError::Io(e)),
    }

    let request = match RenderRequest::parse(&line) {
        Ok(request) => request,
        Err(err) => {
            log::debug!("Rejecting request: {err}");
            let request_id = recover_request_id(&line).unwrap_or_else(|| UNKNOWN_REQUEST_ID.into());
            return RenderResponse::failure(request_id, &err);
        }
    };

    let request_id = request.request_id();
    let rendered = request
        .html()
        .and_then(|html| renderer.render(html, request.css()));
    match rendered {
        Ok(pdf) => {
            log::debug!("Request {request_id} rendered, {} bytes", pdf.len());
            RenderResponse::success(request_id, &pdf)
        }
        Err(err) => RenderResponse::failure(request_id, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static [u8], &'static str>);

    impl PdfRenderer for Fixed {
        fn render(&self, _html: &str, _css: Option<&str>) -> Result<Vec<u8>, BridgeError> {
            self.0
                .map(<[u8]>::to_vec)
                .map_err(|e| BridgeError::Render(e.to_string()))
        }
    }

    const OK: Fixed = Fixed(Ok(b"%PDF-1.7 fake"));

    fn run(renderer: &Fixed, input: &str) -> (RenderResponse, String, String) {
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let response = handle(renderer, input.as_bytes(), &mut out, &mut diag).unwrap();
        (
            response,
            String::from_utf8(out).unwrap(),
            String::from_utf8(diag).unwrap(),
        )
    }

    #[test]
    fn success_echoes_request_id() {
        let (resp, out, diag) = run(&OK, "{\"html\":\"<p>x</p>\",\"request_id\":\"job-7\"}\n");
        assert!(resp.success);
        assert_eq!(resp.request_id, "job-7");
        assert_eq!(resp.size, Some(13));
        assert_eq!(resp.pdf_bytes().unwrap(), b"%PDF-1.7 fake");
        assert!(out.ends_with('\n'));
        assert_eq!(serde_json::from_str::<RenderResponse>(out.trim()).unwrap(), resp);
        assert_eq!(diag, "forge bridge ready\n");
    }

    #[test]
    fn numeric_id_is_echoed_unchanged() {
        let (resp, out, _) = run(&OK, "{\"html\":\"<p>x</p>\",\"request_id\":42}\n");
        assert!(resp.success);
        assert_eq!(resp.request_id, serde_json::json!(42));
        assert!(out.starts_with("{\"success\":true,\"request_id\":42,"));
    }

    #[test]
    fn missing_id_is_unknown() {
        let (resp, _, _) = run(&OK, "{\"html\":\"<p>x</p>\"}");
        assert_eq!(resp.request_id, "unknown");
    }

    #[test]
    fn empty_html_fails_with_id() {
        let (resp, out, _) = run(&OK, "{\"html\":\"\",\"request_id\":\"r1\"}\n");
        assert!(!resp.success);
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.error.as_deref(), Some("HTML content is required"));
        assert!(!out.contains("pdf_base64"));
    }

    #[test]
    fn render_failure_is_reported() {
        let failing = Fixed(Err("boom"));
        let (resp, _, _) = run(&failing, "{\"html\":\"<p>x</p>\",\"request_id\":\"r2\"}");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("PDF generation failed: boom"));
    }

    #[test]
    fn bad_json_recovers_id_when_possible() {
        let (resp, _, _) = run(&OK, "{\"html\": 5, \"request_id\": \"r3\"}");
        assert!(!resp.success);
        assert_eq!(resp.request_id, "r3");

        let (resp, _, _) = run(&OK, "{\"html\": ");
        assert!(!resp.success);
        assert_eq!(resp.request_id, "unknown");
    }

    #[test]
    fn no_input_is_a_failure() {
        let (resp, out, _) = run(&OK, "");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("No request received on standard input"));
        assert_eq!(out.lines().count(), 1);
    }
}
