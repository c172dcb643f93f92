//! Image encoding and MIME detection.
//!
//! Rendered pages arrive as `DynamicImage` and leave as PNG or JPEG bytes.
//! Extracted media keeps its original bytes; only its MIME type is worked
//! out, from magic bytes first and the part name's extension second.

use crate::config::Encoding;
use crate::error::StageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page.
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_image(img: &DynamicImage, encoding: Encoding) -> Result<Vec<u8>, StageError> {
    let mut buf = Vec::new();
    let result = match encoding {
        Encoding::Png => img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png),
        Encoding::Jpeg { quality } => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)
        }
    };
    result.map_err(|e| StageError::Encode {
        detail: e.to_string(),
    })?;
    debug!(
        "Encoded {}x{} page → {} bytes {}",
        img.width(),
        img.height(),
        buf.len(),
        encoding.mime_type()
    );
    Ok(buf)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// `data:<mime>;base64,<payload>`
pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, to_base64(bytes))
}

/// MIME type from leading magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
    if bytes.starts_with(PNG) {
        Some("image/png")
    } else if bytes.starts_with(b"\xFF\xD8\xFF") {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some("image/tiff")
    } else {
        None
    }
}

/// MIME type from a file extension (case-insensitive, no leading dot).
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "webp" => Some("image/webp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Magic bytes win; the extension is only consulted when they say nothing.
pub fn detect_mime(bytes: &[u8], ext: &str) -> &'static str {
    sniff_mime(bytes)
        .or_else(|| mime_for_extension(ext))
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_png() {
        let bytes = encode_image(&red(), Encoding::Png).expect("encode should succeed");
        assert_eq!(sniff_mime(&bytes), Some("image/png"));
    }

    #[test]
    fn encode_jpeg_drops_alpha() {
        let bytes = encode_image(&red(), Encoding::Jpeg { quality: 80 }).expect("jpeg");
        assert_eq!(sniff_mime(&bytes), Some("image/jpeg"));
    }

    #[test]
    fn data_url_format() {
        assert_eq!(data_url("image/png", &[1, 2, 3]), "data:image/png;base64,AQID");
    }

    #[test]
    fn magic_beats_extension() {
        let png = encode_image(&red(), Encoding::Png).unwrap();
        assert_eq!(detect_mime(&png, "jpg"), "image/png");
        assert_eq!(detect_mime(b"????", "JPEG"), "image/jpeg");
        assert_eq!(detect_mime(b"????", "xyz"), "application/octet-stream");
    }
}
