//! A frame copied out of the region.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::ShmError;

/// One BGRA frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    /// Region sequence the frame was read at.
    pub sequence: u64,
    /// `width * height * 4` bytes, B G R A per pixel.
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Pixels with the alpha channel dropped (B G R per pixel).
    pub fn to_bgr(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() / 4 * 3);
        for px in self.pixels.chunks_exact(4) {
            out.extend_from_slice(&px[..3]);
        }
        out
    }

    /// Pixels reordered to R G B, the order image encoders expect.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() / 4 * 3);
        for px in self.pixels.chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        out
    }

    pub fn timestamp_ms(&self) -> u64 {
        (self.timestamp * 1000.0).max(0.0) as u64
    }

    /// Encodes the frame as a baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, ShmError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &self.to_rgb(),
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            timestamp: 1.5,
            width: 2,
            height: 1,
            sequence: 2,
            pixels: vec![1, 2, 3, 255, 4, 5, 6, 255],
        }
    }

    #[test]
    fn test_to_bgr_drops_alpha() {
        assert_eq!(frame().to_bgr(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_to_rgb_swaps_channels() {
        assert_eq!(frame().to_rgb(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_to_jpeg_has_soi_marker() {
        let jpeg = frame().to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_timestamp_ms() {
        assert_eq!(frame().timestamp_ms(), 1500);
    }
}
