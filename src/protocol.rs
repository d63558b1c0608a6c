//! Wire protocol shared by both bridges.
//!
//! Requests arrive as one JSON object per line on stdin:
//!
//! ```text
//! {"html": "<h1>Hi</h1>", "css": "h1 { color: red }", "request_id": "42"}
//! ```
//!
//! `request_id` may be any JSON value and is echoed back unchanged. The
//! persistent bridge answers with raw PDF bytes; the single-shot bridge
//! answers with one [`RenderResponse`] JSON line.

use std::io::Write;

use base64::{engine::general_purpose::STANDARD as BASE64_STD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Line written to the diagnostic stream once the process can accept input.
pub const READY_SIGNAL: &str = "forge bridge ready";

/// Request id echoed when the request did not carry one.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// One render request. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub css: Option<String>,
    #[serde(default)]
    pub request_id: Option<Value>,
}

impl RenderRequest {
    /// Parse a single input line. Surrounding whitespace (including the line
    /// terminator) is ignored.
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(line.trim()).map_err(BridgeError::from_json)
    }

    /// The HTML to render; empty or missing HTML is rejected.
    pub fn html(&self) -> Result<&str, BridgeError> {
        match self.html.as_deref() {
            Some(html) if !html.is_empty() => Ok(html),
            _ => Err(BridgeError::MissingHtml),
        }
    }

    /// The request stylesheet, if any. An empty string counts as absent.
    pub fn css(&self) -> Option<&str> {
        self.css.as_deref().filter(|css| !css.is_empty())
    }

    /// The request id, or [`UNKNOWN_REQUEST_ID`] when absent or null.
    pub fn request_id(&self) -> Value {
        self.request_id
            .clone()
            .unwrap_or_else(|| Value::from(UNKNOWN_REQUEST_ID))
    }
}

/// Best-effort recovery of `request_id` from a line that failed to parse as a
/// [`RenderRequest`] (for example because `html` had the wrong type).
pub fn recover_request_id(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    value.get("request_id").filter(|id| !id.is_null()).cloned()
}

/// Split the persistent bridge's output into individual PDFs.
///
/// A document ends at a `%%EOF` marker (plus its line terminator) that
/// follows a `startxref` and is itself followed by the next `%PDF-` header or
/// the end of the stream. A `%%EOF` inside content, such as in an embedded
/// stream, does not end the document. Trailing bytes without a closing
/// marker are returned as a final, incomplete part.
pub fn split_documents(stream: &[u8]) -> Vec<&[u8]> {
    const EOF_MARKER: &[u8] = b"%%EOF";
    const XREF_MARKER: &[u8] = b"startxref";

    let mut documents = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(offset) = find(&stream[search..], EOF_MARKER) {
        let marker = search + offset;
        let mut end = marker + EOF_MARKER.len();
        for terminator in [b'\r', b'\n'] {
            if stream.get(end) == Some(&terminator) {
                end += 1;
            }
        }
        let rest = &stream[end..];
        let closes = find(&stream[start..marker], XREF_MARKER).is_some()
            && (rest.is_empty() || rest.starts_with(b"%PDF-"));
        if closes {
            documents.push(&stream[start..end]);
            start = end;
        }
        search = end;
    }
    if start < stream.len() {
        documents.push(&stream[start..]);
    }
    documents
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Single-shot response envelope.
///
/// Success: `{"success":true,"request_id":..,"pdf_base64":..,"size":..}`
/// Failure: `{"success":false,"request_id":..,"error":..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResponse {
    pub success: bool,
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderResponse {
    pub fn success(request_id: impl Into<Value>, pdf: &[u8]) -> Self {
        Self {
            success: true,
            request_id: request_id.into(),
            pdf_base64: Some(BASE64_STD.encode(pdf)),
            size: Some(pdf.len()),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<Value>, error: &BridgeError) -> Self {
        Self {
            success: false,
            request_id: request_id.into(),
            pdf_base64: None,
            size: None,
            error: Some(error.to_string()),
        }
    }

    /// Decode the embedded PDF. `None` for failures or corrupt payloads.
    pub fn pdf_bytes(&self) -> Option<Vec<u8>> {
        let encoded = self.pdf_base64.as_deref()?;
        BASE64_STD.decode(encoded).ok()
    }
}

/// Diagnostic written to stderr when the persistent bridge gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalReport {
    pub success: bool,
    pub error: String,
    pub traceback: String,
}

impl FatalReport {
    pub fn new(error: &BridgeError) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            traceback: error.cause_chain(),
        }
    }
}

/// Write the readiness line and flush.
pub fn signal_ready<W: Write>(diag: &mut W) -> Result<(), BridgeError> {
    writeln!(diag, "{READY_SIGNAL}")?;
    diag.flush()?;
    Ok(())
}

/// Serialise `value` as a single JSON line and flush.
pub fn write_json_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), BridgeError> {
    serde_json::to_writer(&mut *out, value).map_err(std::io::Error::from)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_request() {
        let req = RenderRequest::parse(
            r#"{"html":"<p>x</p>","css":"p{}","request_id":"r-1","extra":true}"#,
        )
        .unwrap();
        assert_eq!(req.html().unwrap(), "<p>x</p>");
        assert_eq!(req.css(), Some("p{}"));
        assert_eq!(req.request_id(), "r-1");
    }

    #[test]
    fn missing_fields_default() {
        let req = RenderRequest::parse("{}\n").unwrap();
        assert!(matches!(req.html(), Err(BridgeError::MissingHtml)));
        assert_eq!(req.css(), None);
        assert_eq!(req.request_id(), UNKNOWN_REQUEST_ID);
    }

    #[test]
    fn empty_html_and_css_are_absent() {
        let req = RenderRequest::parse(r#"{"html":"","css":""}"#).unwrap();
        assert!(req.html().is_err());
        assert_eq!(req.css(), None);
    }

    #[test]
    fn non_object_is_invalid_not_malformed() {
        let err = RenderRequest::parse("42").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
        let err = RenderRequest::parse("{\"html\": ").unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn recover_id_from_bad_shape() {
        let line = r#"{"html": 7, "request_id": "abc"}"#;
        assert!(RenderRequest::parse(line).is_err());
        assert_eq!(recover_request_id(line), Some(Value::from("abc")));
        assert_eq!(recover_request_id("garbage"), None);
        assert_eq!(recover_request_id(r#"{"request_id": null}"#), None);
    }

    #[test]
    fn request_id_is_any_json_value() {
        let req = RenderRequest::parse(r#"{"html":"x","request_id":17}"#).unwrap();
        assert_eq!(req.request_id(), Value::from(17));
        let req = RenderRequest::parse(r#"{"html":"x","request_id":null}"#).unwrap();
        assert_eq!(req.request_id(), UNKNOWN_REQUEST_ID);
        let resp = RenderResponse::failure(serde_json::json!({"job": [1, 2]}), &BridgeError::MissingHtml);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.starts_with(r#"{"success":false,"request_id":{"job":[1,2]},"#));
    }

    #[test]
    fn split_documents_at_trailers() {
        let first: &[u8] = b"%PDF-1.7\nstream %%EOF inside\nstartxref\n9\n%%EOF\n";
        let second: &[u8] = b"%PDF-1.7\nstartxref\n12\n%%EOF";
        let stream = [first, second].concat();
        assert_eq!(split_documents(&stream), vec![first, second]);
        assert!(split_documents(b"").is_empty());
        let partial: &[u8] = b"%PDF-1.7\nno trailer yet";
        assert_eq!(split_documents(partial), vec![partial]);
    }

    #[test]
    fn success_response_field_order() {
        let resp = RenderResponse::success("id-9", b"%PDF-1.7");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"success":true,"request_id":"id-9","pdf_base64":"JVBERi0xLjc=","size":8}"#
        );
        assert_eq!(resp.pdf_bytes().unwrap(), b"%PDF-1.7");
    }

    #[test]
    fn failure_response_has_no_payload() {
        let resp = RenderResponse::failure(UNKNOWN_REQUEST_ID, &BridgeError::MissingHtml);
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"success":false,"request_id":"unknown","error":"HTML content is required"}"#
        );
        assert!(resp.pdf_bytes().is_none());
    }

    #[test]
    fn ready_signal_is_one_line() {
        let mut buf = Vec::new();
        signal_ready(&mut buf).unwrap();
        assert_eq!(buf, b"forge bridge ready\n");
    }
}
