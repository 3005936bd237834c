//! rf-file: Storage collaborators for disk streaming
//!
//! Provides what the disk reader and writer talk to:
//! - Audio sources (in-memory, or loaded from WAV via hound)
//! - Regions and playlists (audio and MIDI) that render timeline ranges
//! - Capture sinks that stream recorded material to disk
//!   - WAV, 32-bit float, one file per channel (via hound)
//!   - Standard MIDI File, format 0 (via midly)
//! - A file sink factory with deterministic take naming

mod error;
mod playlist;
mod sink;
mod source;

pub use error::*;
pub use playlist::*;
pub use sink::*;
pub use source::*;
