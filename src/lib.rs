//! # forge-bridge – line-oriented HTML/CSS → PDF bridge processes
//!
//! A caller in another process writes one JSON request per line to standard
//! input and reads PDFs back. Two entry points share this library:
//!
//! - `forge-bridge` ([`bridge::fast`]): long-lived, raw PDF bytes per request.
//! - `forge-bridge-secure` ([`bridge::secure`]): one request per process, JSON
//!   response with a base64 PDF.
//!
//! Rendering stages behind [`pipeline::Renderer`]:
//!
//! 1. **Parse** – HTML string → element tree ([`document`])
//! 2. **Style** – user-agent, document and request stylesheets ([`stylesheet`])
//!    cascaded onto each element ([`style`])
//! 3. **Layout** – Taffy box layout, then pagination into a [`layout::PagePlan`]
//! 4. **Render** – emit PDF bytes via printpdf ([`render`])
//!
//! Fonts are discovered once per process ([`fonts::FontConfiguration`]) and
//! reused for every request.

pub mod bridge;
pub mod document;
pub mod error;
pub mod fonts;
pub mod layout;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod style;
pub mod stylesheet;

// Re-exports for convenience
pub use error::BridgeError;
pub use fonts::FontConfiguration;
pub use pipeline::{PdfRenderer, RenderOptions, Renderer};
