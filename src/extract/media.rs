//! Media type names and classification helpers.

pub const PDF: &str = "application/pdf";
pub const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const XLS: &str = "application/vnd.ms-excel";
pub const CSV: &str = "text/csv";
pub const MARKDOWN: &str = "text/markdown";
pub const PLAIN: &str = "text/plain";
pub const JSON: &str = "application/json";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Types accepted by exact match, on top of images and text-like types.
pub const ALLOWED: &[&str] = &[PDF, DOCX, PPTX, XLSX, XLS, CSV, MARKDOWN, PLAIN, JSON];

/// Lowercases and strips parameters: `Text/Plain; charset=utf-8` -> `text/plain`.
/// Empty input falls back to `application/octet-stream`.
pub fn normalize(raw: &str) -> String {
    let essence = raw.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        OCTET_STREAM.to_string()
    } else {
        essence.to_ascii_lowercase()
    }
}

pub fn is_image(media_type: &str) -> bool {
    media_type.starts_with("image/")
}

pub fn is_text_like(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.contains("json")
        || media_type.contains("javascript")
        || media_type.contains("xml")
        || media_type == OCTET_STREAM
}

pub fn is_supported(media_type: &str) -> bool {
    ALLOWED.contains(&media_type) || is_image(media_type) || is_text_like(media_type)
}
