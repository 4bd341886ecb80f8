//! HTML-to-PDF rendering pipeline.

mod service;

use std::io;

use thiserror::Error;

pub use service::PdfRenderer;

/// Seam between the session actor and the external conversion tool.
///
/// Implementations are synchronous and blocking; callers that must not stall
/// wrap the call in `tokio::task::spawn_blocking`.
pub trait HtmlRenderer: Send + Sync {
    /// Convert raw HTML to a PDF in the output area and return the produced
    /// file name (not its path).
    fn render(&self, html: &str) -> Result<String, RenderError>;
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to prepare render directories: {0}")]
    Init(#[source] io::Error),
    #[error("failed to stage HTML input: {0}")]
    Staging(#[source] io::Error),
    #[error("renderer unavailable: {0}")]
    Unavailable(#[source] io::Error),
    #[error("conversion failed (exit {exit_code:?}): {detail}")]
    Conversion {
        exit_code: Option<i32>,
        detail: String,
    },
    #[error("render task aborted: {0}")]
    Aborted(String),
}
