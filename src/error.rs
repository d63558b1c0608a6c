//! Error taxonomy for both bridge modes.
//!
//! Every variant is terminal for the current process except
//! [`BridgeError::MalformedRequest`], which the persistent bridge skips.

use std::path::PathBuf;

use thiserror::Error;

/// All errors produced while reading, validating or rendering a request.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The input line is not JSON at all (syntax error, empty or truncated line).
    #[error("Malformed request line: {0}")]
    MalformedRequest(#[source] serde_json::Error),

    /// The input line is JSON but not a render request (not an object, wrong
    /// field types).
    #[error("Invalid request: {0}")]
    InvalidRequest(#[source] serde_json::Error),

    /// The request carried no HTML to render.
    #[error("HTML content is required")]
    MissingHtml,

    /// Standard input closed before a request arrived.
    #[error("No request received on standard input")]
    NoInput,

    /// The renderer failed; the message is the underlying cause.
    #[error("PDF generation failed: {0}")]
    Render(String),

    /// A font file could not be parsed.
    #[error("Failed to parse font {path:?}: {detail}")]
    Font { path: PathBuf, detail: String },

    /// Reading stdin or writing stdout/stderr failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify a `serde_json` failure: syntax and EOF problems are framing
    /// errors, anything else means the JSON had the wrong shape.
    pub fn from_json(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() {
            BridgeError::MalformedRequest(err)
        } else {
            BridgeError::InvalidRequest(err)
        }
    }

    /// Whether the persistent bridge should skip the line and keep serving.
    pub fn is_skippable(&self) -> bool {
        matches!(self, BridgeError::MalformedRequest(_))
    }

    /// The error followed by its `source()` chain, one entry per line.
    pub fn cause_chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_errors_are_skippable() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(BridgeError::from_json(err).is_skippable());
    }

    #[test]
    fn empty_line_is_skippable() {
        let err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        assert!(BridgeError::from_json(err).is_skippable());
    }

    #[test]
    fn shape_errors_are_fatal() {
        #[derive(Debug, serde::Deserialize)]
        struct Req {
            #[allow(dead_code)]
            html: String,
        }
        let err = serde_json::from_str::<Req>(r#"{"html": 5}"#).unwrap_err();
        let err = BridgeError::from_json(err);
        assert!(!err.is_skippable());
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[test]
    fn render_error_message_is_wrapped() {
        let err = BridgeError::Render("boom".to_string());
        assert_eq!(err.to_string(), "PDF generation failed: boom");
    }

    #[test]
    fn cause_chain_lists_sources() {
        let inner = serde_json::from_str::<serde_json::Value>("[").unwrap_err();
        let err = BridgeError::from_json(inner);
        let chain = err.cause_chain();
        assert!(chain.starts_with("Malformed request line:"));
        assert!(chain.contains("\ncaused by: "));
    }
}
