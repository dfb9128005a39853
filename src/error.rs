//! Error types shared by the renderer, compositor and signing backend.
//!
//! Display strings are the short snake_case codes the router keeps in
//! `last_error`, optionally followed by `:<detail>`.

use thiserror::Error;

/// Failures while decoding or rasterizing a document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The bytes could not be read from the host path.
    #[error("pdf_read_failed:{0}")]
    Read(String),

    /// Corrupt or unsupported document.
    #[error("decode_failed:{0}")]
    Decode(String),

    /// The document parsed but has no pages to show.
    #[error("decode_failed:no_pages")]
    NoPages,

    /// Scale or device pixel ratio was zero, negative or not finite.
    #[error("invalid_render_request")]
    InvalidRequest,

    /// A page failed after decode succeeded. The detail is logged, never shown.
    #[error("render_failed")]
    PageFailed { page: u32, reason: String },

    /// No page rasterizer could be set up.
    #[error("rasterizer_unavailable:{0}")]
    Rasterizer(String),

    /// No decoded document is installed in the session.
    #[error("no_document_loaded")]
    NoDocument,
}

/// Failures of the burn-in and signing backend.
#[derive(Error, Debug)]
pub enum SignError {
    #[error("pdf_read_failed:{0}")]
    Read(#[source] std::io::Error),

    #[error("pdf_parse_failed:{0}")]
    Parse(String),

    #[error("signature_page_missing_dict")]
    PageDict,

    #[error("signature_add_content_failed:{0}")]
    Content(String),

    #[error("pdf_save_failed:{0}")]
    Save(String),

    #[error("sidecar_write_failed:{0}")]
    Sidecar(String),

    #[error("no_fields_to_sign")]
    NoFields,

    #[error("path_not_utf8")]
    PathNotUtf8,

    #[error("copy_failed:{0}")]
    Copy(#[source] std::io::Error),
}

/// Failures of document intake.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("document_unreadable:{0}")]
    Unreadable(String),

    #[error("unsupported_document:{0}")]
    Unsupported(String),

    #[error("unknown_document:{0}")]
    UnknownDocument(String),
}

/// Failures while building a signature payload.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature_decode_failed:{0}")]
    Decode(String),

    #[error("signature_image_invalid:{0}")]
    Image(String),

    #[error("signature_encode_failed:{0}")]
    Encode(String),

    #[error("signature_text_empty")]
    EmptyText,

    #[error("signature_trace_empty")]
    EmptyTrace,
}

/// Rejected field editor operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EditorError {
    #[error("placement_not_armed")]
    NotArmed,

    #[error("unknown_field:{0}")]
    UnknownField(uuid::Uuid),

    #[error("unknown_signature:{0}")]
    UnknownSignature(uuid::Uuid),

    /// A drag or resize is already holding the pointer.
    #[error("gesture_in_progress")]
    GestureInProgress,
}
