//! Decoding raw image bytes into RGB frames.

use crate::pipeline::PipelineError;
use image::RgbImage;
use std::path::Path;

/// Decode an encoded image (PNG, JPEG, ...) into an RGB frame.
///
/// Undecodable or zero-sized input is [`PipelineError::InvalidImage`], never
/// an empty frame.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::InvalidImage("empty buffer".into()));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))?
        .to_rgb8();

    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::InvalidImage(format!(
            "zero-sized image {}x{}",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}

/// Read and decode an image file.
pub fn load_image(path: &Path) -> Result<RgbImage, PipelineError> {
    let bytes = std::fs::read(path).map_err(|source| PipelineError::ReadImage {
        path: path.display().to_string(),
        source,
    })?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read image");
    decode_image(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(7, 5, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();

        let decoded = decode_image(buf.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (7, 5));
        assert_eq!(*decoded.get_pixel(3, 2), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage_is_invalid() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(PipelineError::InvalidImage(_))
        ));
        assert!(matches!(decode_image(&[]), Err(PipelineError::InvalidImage(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_image(Path::new("/nonexistent/face.jpg")),
            Err(PipelineError::ReadImage { .. })
        ));
    }
}
