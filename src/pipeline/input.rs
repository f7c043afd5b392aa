//! Input resolution: load a user-supplied image file into memory.
//!
//! The declared MIME type is taken from the file extension, the same way a
//! browser file picker reports it. Nothing here inspects the bytes; the
//! validator decides whether the declared type is acceptable and the
//! encoder finds out whether the bytes actually decode.

use crate::error::EncodingError;
use crate::pipeline::validate::FileDescriptor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An uploaded image: bytes plus what the uploader claims about them.
#[derive(Clone)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub path: Option<PathBuf>,
}

impl std::fmt::Debug for ImageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .field("path", &self.path)
            .finish()
    }
}

impl ImageFile {
    /// Wrap in-memory bytes (e.g. received over the network).
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
            path: None,
        }
    }

    /// Read a file from disk, declaring its MIME type from the extension.
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, EncodingError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| EncodingError::ReadError {
                path: path.to_path_buf(),
                source,
            })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = mime_from_extension(path).to_string();
        debug!("Read '{}' ({} bytes, {})", path.display(), bytes.len(), mime_type);

        Ok(Self {
            name,
            mime_type,
            bytes,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Metadata view for the validator.
    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::new(self.name.clone(), self.mime_type.clone(), self.size())
    }
}

/// Guess a MIME type from a path's extension.
///
/// Unknown extensions map to `application/octet-stream`, which the
/// validator rejects.
pub fn mime_from_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_mapping() {
        assert_eq!(mime_from_extension(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("dir/b.png")), "image/png");
        assert_eq!(mime_from_extension(Path::new("c.webp")), "image/webp");
        assert_eq!(mime_from_extension(Path::new("d.pdf")), "application/pdf");
        assert_eq!(mime_from_extension(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("question.png");
        std::fs::write(&path, b"\x89PNG fake").unwrap();

        let file = ImageFile::read(&path).await.unwrap();
        assert_eq!(file.name, "question.png");
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.size(), 9);

        let d = file.descriptor();
        assert_eq!(d.size, 9);
        assert_eq!(d.mime_type, "image/png");
    }

    #[tokio::test]
    async fn read_missing_file_is_read_error() {
        let err = ImageFile::read("/definitely/not/here.png").await.unwrap_err();
        assert!(matches!(err, EncodingError::ReadError { .. }));
    }
}
