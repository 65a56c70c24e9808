//! glcast - in-process streaming core for a screen and audio recorder
//!
//! This library carries typed messages from capture stages through
//! processing stages to consumers over shared packet buffers. The frame
//! capture stage samples rendering surfaces at a target rate, the scale
//! stage downscales and converts frames on a worker pool, and the state
//! tracker replays per-stream configuration to late-joining consumers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use glcast::buffer::PacketBuffer;
//! use glcast::runner::ThreadRunner;
//! use glcast::scale::ScaleStage;
//!
//! # fn main() -> glcast::Result<()> {
//! let uncompressed = PacketBuffer::new(25 * 1024 * 1024);
//! let scaled = PacketBuffer::new(25 * 1024 * 1024);
//!
//! let stage = Arc::new(ScaleStage::new(0.5)?);
//! let runner = ThreadRunner::spawn(
//!     stage,
//!     ThreadRunner::default_threads(),
//!     uncompressed.clone(),
//!     Some(scaled),
//! )?;
//!
//! // ... a capture stage writes frames into `uncompressed`
//!
//! uncompressed.cancel();
//! runner.wait()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod info;
pub mod message;
pub mod runner;
pub mod scale;
pub mod sync;
pub mod tracker;

pub use error::{GlcastError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
