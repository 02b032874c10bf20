//! Typed errors that callers need to tell apart.
//!
//! Everything else is a plain [`anyhow::Error`]. These are raised as
//! `anyhow` errors too, so use `err.downcast_ref::<OcrError>()` to classify
//! a failure. Context added on top does not hide them.

use crate::engines::BackendId;

/// Errors with a meaning for the user, rather than "something broke".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OcrError {
    /// The declared media type is not one we accept. Re-upload something else.
    #[error(
        "unsupported media type {media_type:?} (supported: PNG, JPEG, WebP, GIF, BMP, TIFF, PDF)"
    )]
    UnsupportedType { media_type: String },

    /// The bytes are not a valid instance of the declared media type.
    #[error("could not decode {media_type} data: {reason}")]
    Decode { media_type: String, reason: String },

    /// Model weights or tools for a backend could not be loaded. This sticks
    /// for the rest of the process.
    #[error("{backend} backend is unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    /// A single recognition call failed.
    #[error("{backend} recognition failed on page {page}: {reason}")]
    RecognitionFailure {
        backend: BackendId,
        page: usize,
        reason: String,
    },
}

impl OcrError {
    /// Build a [`OcrError::Decode`] from any displayable cause.
    pub fn decode(media_type: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            media_type: media_type.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Find the [`OcrError`] in an error chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&OcrError> {
    err.downcast_ref::<OcrError>()
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    #[test]
    fn classify_sees_through_context() {
        let result: anyhow::Result<()> =
            Err(OcrError::decode("application/pdf", "bad header").into());
        let err = result.context("failed to load pages").unwrap_err();
        assert!(matches!(classify(&err), Some(OcrError::Decode { .. })));
    }

    #[test]
    fn messages_name_the_backend() {
        let err = OcrError::BackendUnavailable {
            backend: BackendId::Printed,
            reason: "tesseract not found".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "printed backend is unavailable: tesseract not found"
        );
    }
}
