//! The single producer of a region.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};

use memmap2::MmapMut;
use tracing::info;

use crate::layout::{region_size, sequence_word, Header, DATA_OFFSET};
use crate::ShmError;

/// Writes frames into a region file it owns.
pub struct ShmWriter {
    path: PathBuf,
    mmap: MmapMut,
    max_width: u32,
    max_height: u32,
    sequence: u64,
}

impl ShmWriter {
    /// Creates the region file sized for `max_width` x `max_height` and maps
    /// it read-write.
    ///
    /// An existing file is reused and never shrunk, since a reader may still
    /// have it mapped; it only grows when too small. The sequence word and
    /// header are zeroed, which readers see as "no frame yet".
    pub fn create(path: impl AsRef<Path>, max_width: u32, max_height: u32) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = region_size(max_width, max_height);
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }

        // SAFETY: the file holds at least the full region and only this
        // writer mutates it; the reader maps it read-only and validates every
        // copy with the sequence word.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut writer = Self {
            path,
            mmap,
            max_width,
            max_height,
            sequence: 0,
        };
        writer.sequence_word().store(0, Ordering::Release);
        Header {
            timestamp: 0.0,
            width: 0,
            height: 0,
        }
        .write(&mut writer.mmap);

        info!(
            path = %writer.path.display(),
            size,
            max_width,
            max_height,
            "created shared memory region"
        );
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the last completed write (0 before the first frame).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Writes one frame and returns the new (even) sequence number.
    pub fn write_frame(
        &mut self,
        timestamp: f64,
        width: u32,
        height: u32,
        bgra: &[u8],
    ) -> Result<u64, ShmError> {
        if width == 0 || height == 0 || width > self.max_width || height > self.max_height {
            return Err(ShmError::FrameTooLarge {
                width,
                height,
                max_width: self.max_width,
                max_height: self.max_height,
            });
        }

        let expected = width as usize * height as usize * 4;
        if bgra.len() != expected {
            return Err(ShmError::LengthMismatch {
                expected,
                actual: bgra.len(),
            });
        }

        let writing = self.sequence + 1;
        let done = self.sequence + 2;

        self.sequence_word().store(writing, Ordering::Relaxed);
        fence(Ordering::Release);

        Header {
            timestamp,
            width: width as i32,
            height: height as i32,
        }
        .write(&mut self.mmap);
        self.mmap[DATA_OFFSET..DATA_OFFSET + expected].copy_from_slice(bgra);

        self.sequence_word().store(done, Ordering::Release);
        self.sequence = done;
        Ok(done)
    }

    /// Flushes the mapping to the backing file.
    pub fn flush(&self) -> Result<(), ShmError> {
        self.mmap.flush()?;
        Ok(())
    }

    fn sequence_word(&self) -> &AtomicU64 {
        // SAFETY: the mapping is at least DATA_OFFSET bytes and lives as long
        // as `self`.
        unsafe { sequence_word(self.mmap.as_ptr()) }
    }

    #[cfg(test)]
    pub(crate) fn mark_in_progress(&mut self) {
        self.sequence_word().store(self.sequence + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/video.shm");
        let writer = ShmWriter::create(&path, 64, 32).unwrap();

        let len = std::fs::metadata(writer.path()).unwrap().len();
        assert_eq!(len as usize, region_size(64, 32));
        assert_eq!(writer.sequence(), 0);
    }

    #[test]
    fn test_write_advances_sequence_by_two() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShmWriter::create(dir.path().join("v.shm"), 4, 4).unwrap();
        let pixels = vec![7u8; 4 * 4 * 4];

        assert_eq!(writer.write_frame(1.0, 4, 4, &pixels).unwrap(), 2);
        assert_eq!(writer.write_frame(2.0, 4, 4, &pixels).unwrap(), 4);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShmWriter::create(dir.path().join("v.shm"), 4, 4).unwrap();
        let err = writer.write_frame(0.0, 8, 4, &[0u8; 128]).unwrap_err();
        assert!(matches!(err, ShmError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShmWriter::create(dir.path().join("v.shm"), 4, 4).unwrap();
        let err = writer.write_frame(0.0, 2, 2, &[0u8; 15]).unwrap_err();
        assert!(matches!(err, ShmError::LengthMismatch { expected: 16, actual: 15 }));
    }

    #[test]
    fn test_recreate_keeps_mapped_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.shm");
        let mut first = ShmWriter::create(&path, 8, 8).unwrap();
        first.write_frame(1.0, 8, 8, &[9u8; 8 * 8 * 4]).unwrap();
        let reader = crate::ShmReader::open(&path).unwrap();
        drop(first);

        // A restarted producer asking for a smaller region.
        let mut second = ShmWriter::create(&path, 4, 4).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len as usize, region_size(8, 8));
        assert_eq!(reader.sequence(), 0);
        assert!(matches!(reader.read_latest(), Err(ShmError::NoFrame)));

        second.write_frame(2.0, 4, 4, &[3u8; 4 * 4 * 4]).unwrap();
        let frame = reader.read_latest().unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert_eq!(frame.pixels, vec![3u8; 4 * 4 * 4]);
    }
}
