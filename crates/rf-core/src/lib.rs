//! rf-core: Shared types for the disk streaming engine
//!
//! Provides the foundational types used across all rf-* crates:
//! - Sample and gain types plus the small buffer helpers the process path needs
//! - Timeline positions, counts and locations
//! - Range overlap classification and loop squishing
//! - Fixed-size MIDI events, a non-allocating event buffer and a note tracker

mod midi;
mod range;
mod sample;
mod time;

pub use midi::*;
pub use range::*;
pub use sample::*;
pub use time::*;
