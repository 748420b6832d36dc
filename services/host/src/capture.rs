//! Screen capture loop.
//!
//! Runs on a dedicated OS thread: capture a frame, write it into the
//! shared-memory region, announce it on the bus, then sleep whatever is left
//! of the frame interval. Pixels never go over the bus.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bravebird_bus::Bus;
use bravebird_events::{channels, FrameReady};
use bravebird_shm::{Frame, ShmError, ShmWriter, RAW_BGRA};
use chrono::Utc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture failed: {0}")]
    Source(String),

    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// One captured screen.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes of BGRA.
    pub bgra: Vec<u8>,
}

/// Something that can grab the screen. Called from the capture thread only.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<CapturedFrame, CaptureError>;
}

/// Synthetic source: a grey screen with a bright bar that moves one step
/// per frame. Stands in for OS screen capture.
pub struct TestPattern {
    width: u32,
    height: u32,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl FrameSource for TestPattern {
    fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        const BAR: u32 = 16;
        let mut bgra = vec![0x40u8; (self.width * self.height * 4) as usize];
        let bar_start = (self.tick * BAR) % self.width.max(1);

        for (i, px) in bgra.chunks_exact_mut(4).enumerate() {
            let x = i as u32 % self.width;
            if x >= bar_start && x < bar_start + BAR {
                px.copy_from_slice(&[0xF0, 0xF0, 0xF0, 0xFF]);
            } else {
                px[3] = 0xFF;
            }
        }

        self.tick = self.tick.wrapping_add(1);
        Ok(CapturedFrame {
            timestamp: now_secs(),
            width: self.width,
            height: self.height,
            bgra,
        })
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The most recent frame, shared with the command receiver.
#[derive(Debug, Clone, Default)]
pub struct FrameCache {
    inner: Arc<RwLock<Option<Frame>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub errors: u64,
}

/// The capture loop and everything it owns.
pub struct CaptureLoop<S: FrameSource> {
    source: S,
    writer: ShmWriter,
    bus: Bus,
    runtime: Handle,
    cache: FrameCache,
    interval: Duration,
    cancel: CancellationToken,
}

impl<S: FrameSource> CaptureLoop<S> {
    /// `runtime` must belong to a runtime that outlives the loop; publishes
    /// are driven on it from the capture thread.
    pub fn new(
        source: S,
        writer: ShmWriter,
        bus: Bus,
        runtime: Handle,
        cache: FrameCache,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            writer,
            bus,
            runtime,
            cache,
            interval,
            cancel,
        }
    }

    /// Starts the loop on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<CaptureStats>> {
        std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || self.run())
    }

    /// Runs until cancelled. Blocks the calling thread.
    pub fn run(mut self) -> CaptureStats {
        info!(
            region = %self.writer.path().display(),
            interval_ms = self.interval.as_millis() as u64,
            "capture loop started"
        );
        let mut stats = CaptureStats::default();

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            match self.step() {
                Ok(ready) => {
                    stats.frames += 1;
                    debug!(sequence = ready.sequence, "frame written");
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(error = %e, "capture iteration failed");
                }
            }

            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        info!(frames = stats.frames, errors = stats.errors, "capture loop stopped");
        stats
    }

    fn step(&mut self) -> Result<FrameReady, CaptureError> {
        let captured = self.source.capture()?;
        let sequence = self.writer.write_frame(
            captured.timestamp,
            captured.width,
            captured.height,
            &captured.bgra,
        )?;

        let frame = Frame {
            timestamp: captured.timestamp,
            width: captured.width,
            height: captured.height,
            sequence,
            pixels: captured.bgra,
        };
        let ready = FrameReady {
            timestamp_ms: frame.timestamp_ms(),
            width: frame.width,
            height: frame.height,
            shm_handle: self.writer.path().display().to_string(),
            encoding: RAW_BGRA.to_string(),
            sequence,
        };
        self.cache.store(frame);

        self.runtime
            .block_on(self.bus.publish(channels::VIDEO_FRAME_READY, &ready));
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_moves() {
        let mut pattern = TestPattern::new(64, 2);
        let first = pattern.capture().unwrap();
        let second = pattern.capture().unwrap();

        assert_eq!(first.bgra.len(), 64 * 2 * 4);
        assert_ne!(first.bgra, second.bgra);
        assert!(first.bgra.chunks_exact(4).all(|px| px[3] == 0xFF));
    }

    #[test]
    fn test_cache_keeps_latest() {
        let cache = FrameCache::new();
        assert!(cache.latest().is_none());

        for sequence in [2, 4] {
            cache.store(Frame {
                timestamp: 0.0,
                width: 1,
                height: 1,
                sequence,
                pixels: vec![0; 4],
            });
        }
        assert_eq!(cache.latest().map(|f| f.sequence), Some(4));
    }
}
