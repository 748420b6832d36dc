//! Region layout.

use std::sync::atomic::AtomicU64;

/// Bytes of the sequence word at the start of the region.
pub const SEQ_BYTES: usize = 8;

/// Bytes of the frame header: `f64` timestamp, `i32` width, `i32` height.
pub const HEADER_BYTES: usize = 16;

/// Offset of the first pixel.
pub const DATA_OFFSET: usize = SEQ_BYTES + HEADER_BYTES;

pub const DEFAULT_MAX_WIDTH: u32 = 3840;
pub const DEFAULT_MAX_HEIGHT: u32 = 2160;

const TIMESTAMP_OFFSET: usize = SEQ_BYTES;
const WIDTH_OFFSET: usize = SEQ_BYTES + 8;
const HEIGHT_OFFSET: usize = SEQ_BYTES + 12;

/// Total region size for frames up to `max_width` x `max_height`.
pub fn region_size(max_width: u32, max_height: u32) -> usize {
    DATA_OFFSET + max_width as usize * max_height as usize * 4
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Header {
    pub timestamp: f64,
    pub width: i32,
    pub height: i32,
}

impl Header {
    pub fn read(region: &[u8]) -> Self {
        let f64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&region[at..at + 8]);
            f64::from_le_bytes(buf)
        };
        let i32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&region[at..at + 4]);
            i32::from_le_bytes(buf)
        };

        Self {
            timestamp: f64_at(TIMESTAMP_OFFSET),
            width: i32_at(WIDTH_OFFSET),
            height: i32_at(HEIGHT_OFFSET),
        }
    }

    pub fn write(&self, region: &mut [u8]) {
        region[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&self.timestamp.to_le_bytes());
        region[WIDTH_OFFSET..WIDTH_OFFSET + 4].copy_from_slice(&self.width.to_le_bytes());
        region[HEIGHT_OFFSET..HEIGHT_OFFSET + 4].copy_from_slice(&self.height.to_le_bytes());
    }

    /// Pixel byte count, or `None` for a non-positive size.
    pub fn payload_len(&self) -> Option<usize> {
        if self.width <= 0 || self.height <= 0 {
            return None;
        }
        Some(self.width as usize * self.height as usize * 4)
    }
}

/// The sequence word of a mapped region.
///
/// # Safety
///
/// `base` must point to a live mapping at least [`SEQ_BYTES`] long that stays
/// mapped for `'a`. Mappings are page aligned, so the word is 8-byte aligned.
pub(crate) unsafe fn sequence_word<'a>(base: *const u8) -> &'a AtomicU64 {
    // SAFETY: upheld by the caller; see above.
    unsafe { AtomicU64::from_ptr(base as *mut u64) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_size_4k() {
        assert_eq!(region_size(3840, 2160), 3840 * 2160 * 4 + 24);
    }

    #[test]
    fn test_header_roundtrip() {
        let mut region = vec![0u8; DATA_OFFSET];
        let header = Header {
            timestamp: 1_700_000_000.25,
            width: 1920,
            height: 1080,
        };
        header.write(&mut region);
        assert_eq!(Header::read(&region), header);
        assert_eq!(&region[..SEQ_BYTES], &[0u8; 8]);
    }

    #[test]
    fn test_payload_len_rejects_non_positive() {
        let header = Header {
            timestamp: 0.0,
            width: 0,
            height: 10,
        };
        assert_eq!(header.payload_len(), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_header_roundtrip(
            timestamp in 0.0f64..4.0e9,
            width in 1i32..=7680,
            height in 1i32..=4320,
        ) {
            let mut region = vec![0u8; DATA_OFFSET];
            let header = Header { timestamp, width, height };
            header.write(&mut region);
            proptest::prop_assert_eq!(Header::read(&region), header);
            proptest::prop_assert_eq!(
                header.payload_len(),
                Some(width as usize * height as usize * 4)
            );
        }
    }
}
