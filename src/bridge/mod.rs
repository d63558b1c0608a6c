//! The two bridge loops. Both speak the line protocol in [`crate::protocol`]
//! and render through a [`crate::pipeline::PdfRenderer`].
//!
//! - [`fast`]: one long-lived process, raw PDF bytes per request.
//! - [`secure`]: one request per process, JSON envelope with a base64 PDF.

pub mod fast;
pub mod secure;
