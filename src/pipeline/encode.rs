//! Image encoding: raw upload → base64 data URL, plus JPEG compression.
//!
//! VLM APIs accept images as base64 data URLs embedded in the JSON request
//! body, and the same string doubles as a display source for a stored
//! record. The plain encoder forwards the original bytes untouched.
//!
//! [`compress`] is only used when storage size matters: it downsizes so
//! neither edge exceeds `max_dimension` (aspect ratio kept) and re-encodes
//! as JPEG at the configured quality.

use crate::config::CompressionConfig;
use crate::error::EncodingError;
use crate::pipeline::input::ImageFile;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::debug;

/// Result of [`compress`].
#[derive(Debug, Clone)]
pub struct CompressedImage {
    /// `data:image/jpeg;base64,…`
    pub data_url: String,
    pub width: u32,
    pub height: u32,
    /// Size of the JPEG payload before base64.
    pub byte_len: usize,
}

/// Encode an uploaded file as a self-describing data URL.
pub fn encode(file: &ImageFile) -> String {
    let url = to_data_url(&file.mime_type, &file.bytes);
    debug!("Encoded '{}' → {} bytes data URL", file.name, url.len());
    url
}

/// `data:{mime};base64,{payload}`
pub fn to_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Split a base64 data URL back into MIME type and bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), EncodingError> {
    let rest = url.strip_prefix("data:").ok_or_else(|| EncodingError::DecodeError {
        detail: "not a data URL".into(),
    })?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| EncodingError::DecodeError {
            detail: "data URL is not base64-encoded".into(),
        })?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| EncodingError::DecodeError {
            detail: format!("invalid base64: {e}"),
        })?;
    Ok((mime.to_string(), bytes))
}

/// Target size fitting `(width, height)` inside a `max × max` box.
///
/// Images already within bounds are returned unchanged. The longer edge
/// becomes exactly `max`; the shorter edge is scaled and rounded, never
/// below 1 px.
pub fn scaled_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    if width >= height {
        if width > max {
            let h = (height as f64 * max as f64 / width as f64).round() as u32;
            return (max, h.max(1));
        }
    } else if height > max {
        let w = (width as f64 * max as f64 / height as f64).round() as u32;
        return (w.max(1), max);
    }
    (width, height)
}

/// Decode, downscale and re-encode an image as JPEG.
///
/// CPU-bound; prefer [`compress_async`] from async code.
pub fn compress(
    bytes: &[u8],
    config: &CompressionConfig,
) -> Result<CompressedImage, EncodingError> {
    let img = image::load_from_memory(bytes).map_err(|e| EncodingError::DecodeError {
        detail: e.to_string(),
    })?;

    let (w, h) = scaled_dimensions(img.width(), img.height(), config.max_dimension);
    let resized = if (w, h) == (img.width(), img.height()) {
        img
    } else {
        debug!("Resizing {}x{} → {}x{}", img.width(), img.height(), w, h);
        img.resize_exact(w, h, FilterType::Triangle)
    };

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(
        &mut buf,
        config.jpeg_quality_percent(),
    ))
    .map_err(|e| EncodingError::DecodeError {
        detail: format!("JPEG encoding failed: {e}"),
    })?;

    debug!("Compressed {} → {} bytes", bytes.len(), buf.len());
    Ok(CompressedImage {
        data_url: to_data_url("image/jpeg", &buf),
        width: w,
        height: h,
        byte_len: buf.len(),
    })
}

/// [`compress`] on the blocking thread pool.
pub async fn compress_async(
    file: &ImageFile,
    config: CompressionConfig,
) -> Result<CompressedImage, EncodingError> {
    let bytes = file.bytes.clone();
    tokio::task::spawn_blocking(move || compress(&bytes, &config))
        .await
        .map_err(|e| EncodingError::DecodeError {
            detail: format!("compression task panicked: {e}"),
        })?
}
