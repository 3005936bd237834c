//! rf-diskio: Disk streaming for playback and capture
//!
//! Moves audio and MIDI between storage and the real-time process thread:
//! - Lock-free SPSC ring buffers with a reservation zone behind the read
//!   pointer for cheap reverse seeks
//! - Disk readers that keep per-channel buffers ahead of the playhead, with
//!   loop-boundary crossfades and varispeed
//! - Disk writers that capture input, honour punch and loop ranges and
//!   turn finished passes into playlist regions
//! - A butler thread that refills, flushes and services transport work
//!   without ever blocking the process thread

// Ring and channel code indexes per channel and per sample
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

mod butler;
mod capture;
mod channel;
mod config;
mod context;
mod declick;
mod error;
mod interpolation;
mod midi_ring;
mod notify;
mod process;
mod reader;
mod ringbuf;
mod session;
mod track;
mod transport;
mod trash;
mod writer;

#[cfg(test)]
mod test_util;

pub use butler::*;
pub use capture::*;
pub use channel::*;
pub use config::*;
pub use context::*;
pub use declick::*;
pub use error::*;
pub use interpolation::*;
pub use midi_ring::*;
pub use notify::*;
pub use process::*;
pub use reader::*;
pub use ringbuf::*;
pub use session::*;
pub use track::*;
pub use transport::*;
pub use trash::*;
pub use writer::*;
