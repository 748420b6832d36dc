//! The single consumer of a region.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};

use memmap2::Mmap;
use tracing::debug;

use crate::layout::{sequence_word, Header, DATA_OFFSET};
use crate::{Frame, ShmError};

/// Copies attempted by [`ShmReader::read_latest`] before giving up.
const MAX_READ_ATTEMPTS: u32 = 8;

/// Read-only view of a region written by a [`crate::ShmWriter`].
pub struct ShmReader {
    path: PathBuf,
    mmap: Mmap,
}

impl ShmReader {
    /// Maps an existing region read-only.
    ///
    /// Returns [`ShmError::NotReady`] while the producer has not created the
    /// file; callers retry on their next request.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShmError::NotReady(path));
            }
            Err(e) => return Err(e.into()),
        };

        // SAFETY: the mapping is only read. The writer may change bytes
        // concurrently; every frame copy is validated against the sequence
        // word and a torn copy is discarded.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < DATA_OFFSET {
            return Err(ShmError::ShortRead {
                expected: DATA_OFFSET,
                available: mmap.len(),
            });
        }

        debug!(path = %path.display(), size = mmap.len(), "mapped shared memory region");
        Ok(Self { path, mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Current value of the sequence word.
    pub fn sequence(&self) -> u64 {
        self.sequence_word().load(Ordering::Acquire)
    }

    /// Reads exactly `width * height * 4` pixel bytes starting `offset` bytes
    /// past the header, without consulting the sequence word.
    ///
    /// Fails with [`ShmError::ShortRead`] rather than returning fewer bytes.
    pub fn read_frame(&self, width: u32, height: u32, offset: usize) -> Result<Vec<u8>, ShmError> {
        let expected = width as usize * height as usize * 4;
        let start = DATA_OFFSET.saturating_add(offset);
        let available = self.mmap.len().saturating_sub(start);
        if available < expected {
            return Err(ShmError::ShortRead {
                expected,
                available,
            });
        }
        Ok(self.mmap[start..start + expected].to_vec())
    }

    /// Copies the latest complete frame.
    ///
    /// Retries while a write is in progress or the sequence changed during
    /// the copy, and fails with [`ShmError::Torn`] if it never settles.
    pub fn read_latest(&self) -> Result<Frame, ShmError> {
        for attempt in 1..=MAX_READ_ATTEMPTS {
            let before = self.sequence_word().load(Ordering::Acquire);
            if before == 0 {
                return Err(ShmError::NoFrame);
            }
            if before % 2 == 1 {
                std::thread::yield_now();
                continue;
            }

            let header = Header::read(&self.mmap);
            let copied = match header.payload_len() {
                Some(_) => self.read_frame(header.width as u32, header.height as u32, 0),
                None => Err(ShmError::InvalidHeader {
                    width: header.width,
                    height: header.height,
                }),
            };

            fence(Ordering::Acquire);
            let after = self.sequence_word().load(Ordering::Relaxed);
            if after != before {
                debug!(attempt, before, after, "torn frame read, retrying");
                continue;
            }

            // Stable sequence: a bad header is the writer's fault, not a race.
            let pixels = copied?;
            return Ok(Frame {
                timestamp: header.timestamp,
                width: header.width as u32,
                height: header.height as u32,
                sequence: before,
                pixels,
            });
        }

        Err(ShmError::Torn {
            attempts: MAX_READ_ATTEMPTS,
        })
    }

    fn sequence_word(&self) -> &AtomicU64 {
        // SAFETY: `open` checked the mapping holds at least DATA_OFFSET bytes
        // and it lives as long as `self`.
        unsafe { sequence_word(self.mmap.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShmWriter;

    #[test]
    fn test_open_missing_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShmReader::open(dir.path().join("absent.shm")).err().unwrap();
        assert!(matches!(err, ShmError::NotReady(_)));
    }

    #[test]
    fn test_empty_region_has_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.shm");
        let _writer = ShmWriter::create(&path, 4, 4).unwrap();

        let reader = ShmReader::open(&path).unwrap();
        assert!(matches!(reader.read_latest(), Err(ShmError::NoFrame)));
    }

    #[test]
    fn test_in_progress_write_is_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.shm");
        let mut writer = ShmWriter::create(&path, 4, 4).unwrap();
        writer.write_frame(1.0, 4, 4, &[1u8; 64]).unwrap();
        writer.mark_in_progress();

        let reader = ShmReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_latest(),
            Err(ShmError::Torn { attempts: MAX_READ_ATTEMPTS })
        ));
    }

    #[test]
    fn test_truncated_file_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.shm");
        std::fs::write(&path, [0u8; 8]).unwrap();

        let err = ShmReader::open(&path).err().unwrap();
        assert!(matches!(err, ShmError::ShortRead { expected: DATA_OFFSET, available: 8 }));
    }
}
