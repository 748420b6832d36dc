//! # bravebird-shm
//!
//! Zero-copy video transport between the capture host and the brain.
//!
//! One file-backed region holds one frame slot:
//!
//! ```text
//! offset 0   u64  sequence   (odd while a write is in progress)
//! offset 8   f64  timestamp  (seconds since the Unix epoch)
//! offset 16  i32  width
//! offset 20  i32  height
//! offset 24  ...  BGRA pixels, width * height * 4 bytes
//! ```
//!
//! All fields are little endian. There is exactly one writer and one reader.
//! The sequence word turns the slot into a seqlock: the reader copies the
//! frame and keeps it only if the sequence was even and unchanged across the
//! copy.
//!
//! Frames are announced on the bus (`video.frame_ready`); pixels never leave
//! the region.

mod error;
mod frame;
mod layout;
mod reader;
mod writer;

pub use error::ShmError;
pub use frame::Frame;
pub use layout::{
    region_size, DATA_OFFSET, DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH, HEADER_BYTES, SEQ_BYTES,
};
pub use reader::ShmReader;
pub use writer::ShmWriter;

/// Encoding advertised in `video.frame_ready` for frames in this region.
pub const RAW_BGRA: &str = "raw_bgra";
