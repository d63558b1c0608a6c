//! Persistent bridge: serves requests until end of input.
//!
//! Each successful request produces exactly one PDF on the output stream,
//! written raw and flushed. Documents are concatenated in request order with
//! no length prefix. A document ends at its `startxref` ... `%%EOF` trailer
//! when the next bytes are another `%PDF-` header or the end of the stream;
//! [`split_documents`](crate::protocol::split_documents) cuts the stream
//! that way. Lines that are not JSON are skipped. Any other failure writes a
//! [`FatalReport`] to the diagnostic stream and stops the loop.

use std::io::{BufRead, Write};

use crate::error::BridgeError;
use crate::pipeline::PdfRenderer;
use crate::protocol::{signal_ready, write_json_line, FatalReport, RenderRequest};

/// Run the loop. Returns the number of PDFs written.
pub fn serve<R, I, O, D>(renderer: &R, input: I, output: &mut O, diag: &mut D) -> Result<usize, BridgeError>
where
    R: PdfRenderer + ?Sized,
    I: BufRead,
    O: Write,
    D: Write,
{
    signal_ready(diag)?;
    serve_requests(renderer, input, output).inspect_err(|err| {
        if let Err(report_err) = write_json_line(diag, &FatalReport::new(err)) {
            log::warn!("Could not write fatal report: {report_err}");
        }
    })
}

fn serve_requests<R, I, O>(renderer: &R, mut input: I, output: &mut O) -> Result<usize, BridgeError>
where
    R: PdfRenderer + ?Sized,
    I: BufRead,
    O: Write,
{
    let mut served = 0usize;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            log::debug!("End of input after {served} request(s)");
            return Ok(served);
        }
        let Ok(line) = std::str::from_utf8(&buf) else {
            log::debug!("Skipping request line that is not UTF-8");
            continue;
        };

        let request = match RenderRequest::parse(line) {
            Ok(request) => request,
            Err(err) if err.is_skippable() => {
                log::debug!("Skipping line: {err}");
                continue;
            }
            Err(err) => return Err(err),
        };

        let pdf = renderer.render(request.html()?, request.css())?;
        output.write_all(&pdf)?;
        output.flush()?;
        served += 1;
        log::debug!("Request {} rendered, {} bytes", served, pdf.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records what it was asked to render and answers with a fake PDF.
    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(String, Option<String>)>>,
    }

    impl PdfRenderer for Recorder {
        fn render(&self, html: &str, css: Option<&str>) -> Result<Vec<u8>, BridgeError> {
            self.calls
                .borrow_mut()
                .push((html.to_string(), css.map(str::to_string)));
            Ok(format!("%PDF-{html}%%EOF").into_bytes())
        }
    }

    fn run(input: &str, renderer: &Recorder) -> (Result<usize, BridgeError>, Vec<u8>, String) {
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let result = serve(renderer, input.as_bytes(), &mut out, &mut diag);
        (result, out, String::from_utf8(diag).unwrap())
    }

    #[test]
    fn serves_until_eof() {
        let r = Recorder::default();
        let input = "{\"html\":\"a\"}\n{\"html\":\"b\",\"css\":\"p{}\"}\n";
        let (result, out, diag) = run(input, &r);
        assert_eq!(result.unwrap(), 2);
        assert_eq!(out, b"%PDF-a%%EOF%PDF-b%%EOF");
        assert_eq!(diag, "forge bridge ready\n");
        assert_eq!(r.calls.borrow()[1].1.as_deref(), Some("p{}"));
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        let r = Recorder::default();
        let (result, out, _) = run("not json\n\n   \n{\"html\":\"ok\"}", &r);
        assert_eq!(result.unwrap(), 1);
        assert_eq!(out, b"%PDF-ok%%EOF");
    }

    #[test]
    fn empty_css_is_passed_as_absent() {
        let r = Recorder::default();
        run("{\"html\":\"x\",\"css\":\"\"}\n", &r);
        assert_eq!(r.calls.borrow()[0].1, None);
    }

    #[test]
    fn missing_html_is_fatal() {
        let r = Recorder::default();
        let (result, out, diag) = run("{\"html\":\"\"}\n{\"html\":\"never\"}\n", &r);
        assert!(matches!(result, Err(BridgeError::MissingHtml)));
        assert!(out.is_empty());
        assert!(r.calls.borrow().is_empty());

        let report_line = diag.lines().nth(1).unwrap();
        let report: FatalReport = serde_json::from_str(report_line).unwrap();
        assert!(!report.success);
        assert_eq!(report.error, "HTML content is required");
    }

    #[test]
    fn wrong_shape_is_fatal() {
        let r = Recorder::default();
        let (result, _, diag) = run("{\"html\": 7}\n", &r);
        assert!(matches!(result, Err(BridgeError::InvalidRequest(_))));
        assert!(diag.contains("\"success\":false"));
    }
}
