//! Shared-memory error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The region file does not exist yet; the producer has not started.
    #[error("shared memory region not ready: {}", .0.display())]
    NotReady(PathBuf),

    #[error("short read: expected {expected} bytes, region holds {available}")]
    ShortRead { expected: usize, available: usize },

    #[error("frame {width}x{height} exceeds region capacity {max_width}x{max_height}")]
    FrameTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid frame header: {width}x{height}")]
    InvalidHeader { width: i32, height: i32 },

    /// Nothing has been written to the region yet.
    #[error("no frame written yet")]
    NoFrame,

    /// Every attempt overlapped a write.
    #[error("frame still being written after {attempts} attempts")]
    Torn { attempts: u32 },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}
