// src/image.rs

use crate::error::{AuditError, Result};
use tracing::info;

/// Image formats the vision endpoint accepts as-is.
const SUPPORTED_MIMES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Result of inspecting uploaded bytes before any network spend.
#[derive(Debug)]
pub enum ImageContent {
    /// A supported image; `mime` is ready for the data URL.
    Supported { mime: &'static str },
    /// A recognized file type the oracle cannot take (e.g. a PDF).
    Unsupported(String),
    /// Empty or unrecognizable bytes.
    Unknown,
}

/// Sniff the magic bytes of an upload and classify it.
pub fn classify_image(bytes: &[u8]) -> ImageContent {
    if bytes.is_empty() {
        return ImageContent::Unknown;
    }
    match infer::get(bytes) {
        Some(kind) if SUPPORTED_MIMES.contains(&kind.mime_type()) => ImageContent::Supported {
            mime: kind.mime_type(),
        },
        Some(kind) => ImageContent::Unsupported(kind.mime_type().to_string()),
        None => ImageContent::Unknown,
    }
}

/// Gate an upload, returning its mime type or the input error shown to the
/// user. Transcoding is out of scope — bad files are refused, not repaired.
pub fn prepare_image(bytes: &[u8]) -> Result<&'static str> {
    match classify_image(bytes) {
        ImageContent::Supported { mime } => {
            info!(mime, size = bytes.len(), "Image accepted");
            Ok(mime)
        }
        ImageContent::Unsupported(mime) => Err(AuditError::Image(format!(
            "unsupported file type {mime} — expected JPEG, PNG, or WebP"
        ))),
        ImageContent::Unknown => Err(AuditError::Image(
            "file is empty or not a recognizable image".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_magic_is_accepted() {
        let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(prepare_image(&bytes).unwrap(), "image/jpeg");
    }

    #[test]
    fn png_magic_is_accepted() {
        let bytes = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(prepare_image(&bytes).unwrap(), "image/png");
    }

    #[test]
    fn pdf_is_refused_as_unsupported() {
        let err = prepare_image(b"%PDF-1.7 not an image").unwrap_err();
        assert!(matches!(err, AuditError::Image(_)));
        assert!(err.to_string().contains("application/pdf"));
    }

    #[test]
    fn garbage_and_empty_are_refused() {
        assert!(matches!(
            classify_image(b"definitely not an image"),
            ImageContent::Unknown
        ));
        assert!(matches!(classify_image(b""), ImageContent::Unknown));
        assert!(prepare_image(b"").is_err());
    }
}
