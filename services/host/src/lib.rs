//! Bravebird capture host.
//!
//! Runs next to the desktop being automated:
//!
//! ```text
//! capture thread ──▶ shared-memory region ──▶ brain (reads pixels)
//!        └──────────▶ video.frame_ready   ──▶ brain (bus)
//!
//! brain ──HTTP──▶ command receiver ──▶ input controller
//! ```

pub mod bridge;
pub mod capture;
pub mod config;
pub mod controller;
