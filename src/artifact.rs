//! Uploaded files and their declared media types.

use std::fmt;

use crate::prelude::*;

/// The media types we know how to turn into pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Png,
    Jpeg,
    Webp,
    Gif,
    Bmp,
    Tiff,
    Pdf,
}

impl MediaType {
    /// Parse a MIME type, ignoring case and any `;`-separated parameters.
    /// Returns `None` for anything outside our accepted set.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::Webp),
            "image/gif" => Some(Self::Gif),
            "image/bmp" | "image/x-ms-bmp" | "image/x-bmp" => Some(Self::Bmp),
            "image/tiff" | "image/tiff-fx" => Some(Self::Tiff),
            "application/pdf" | "application/x-pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    /// The canonical MIME type.
    pub fn as_mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Pdf => "application/pdf",
        }
    }

    /// The matching decoder format for single-frame raster types.
    pub fn raster_format(self) -> Option<image::ImageFormat> {
        match self {
            Self::Png => Some(image::ImageFormat::Png),
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Webp => Some(image::ImageFormat::WebP),
            Self::Gif => Some(image::ImageFormat::Gif),
            Self::Bmp => Some(image::ImageFormat::Bmp),
            Self::Tiff | Self::Pdf => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// An uploaded file. Created once per upload and consumed by page loading.
#[derive(Clone)]
pub struct UploadedArtifact {
    /// A human-readable name, usually the file name.
    pub name: String,
    /// The media type the uploader claims this is. Not validated here.
    pub declared_type: String,
    /// The raw bytes.
    pub data: Vec<u8>,
}

impl fmt::Debug for UploadedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedArtifact")
            .field("name", &self.name)
            .field("declared_type", &self.declared_type)
            .field("len", &self.data.len())
            .finish()
    }
}

impl UploadedArtifact {
    /// Create an artifact from in-memory bytes.
    pub fn new(
        name: impl Into<String>,
        declared_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            data,
        }
    }

    /// Read an artifact from disk.
    ///
    /// If `declared_type` is `None`, we guess from the file extension the way
    /// a browser upload would, and fall back to sniffing the content.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path, declared_type: Option<&str>) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        let declared_type = match declared_type {
            Some(mime) => mime.to_owned(),
            None => guess_media_type(path, &data),
        };
        debug!(declared_type = %declared_type, len = data.len(), "Read upload");
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, declared_type, data))
    }

    /// Resolve the declared type against our accepted set.
    pub fn media_type(&self) -> Result<MediaType> {
        MediaType::from_mime(&self.declared_type).ok_or_else(|| {
            OcrError::UnsupportedType {
                media_type: self.declared_type.clone(),
            }
            .into()
        })
    }
}

/// Guess a MIME type from a path, then from the content.
fn guess_media_type(path: &Path, data: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(path).first() {
        return mime.essence_str().to_owned();
    }
    infer::get(data)
        .map(|kind| kind.mime_type().to_owned())
        .unwrap_or_else(|| "application/octet-stream".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_mime_accepts_aliases_and_parameters() {
        assert_eq!(MediaType::from_mime("image/PNG"), Some(MediaType::Png));
        assert_eq!(MediaType::from_mime("image/jpg"), Some(MediaType::Jpeg));
        assert_eq!(
            MediaType::from_mime("application/pdf; name=x.pdf"),
            Some(MediaType::Pdf)
        );
        assert_eq!(MediaType::from_mime("image/x-ms-bmp"), Some(MediaType::Bmp));
    }

    #[test]
    fn from_mime_rejects_everything_else() {
        for mime in ["text/plain", "image/svg+xml", "application/zip", ""] {
            assert_eq!(MediaType::from_mime(mime), None, "{mime}");
        }
    }

    #[test]
    fn media_type_reports_unsupported_type() {
        let artifact = UploadedArtifact::new("notes.txt", "text/plain", b"hi".to_vec());
        let err = artifact.media_type().unwrap_err();
        assert_eq!(
            err.downcast_ref::<OcrError>(),
            Some(&OcrError::UnsupportedType {
                media_type: "text/plain".to_owned()
            })
        );
    }

    #[test]
    fn guess_uses_extension_then_content() {
        assert_eq!(guess_media_type(Path::new("scan.JPG"), b""), "image/jpeg");
        assert_eq!(
            guess_media_type(Path::new("no_extension"), b"%PDF-1.4\n"),
            "application/pdf"
        );
        assert_eq!(
            guess_media_type(Path::new("mystery"), b"\0\0\0"),
            "application/octet-stream"
        );
    }
}
