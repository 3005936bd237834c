//! Disk I/O error types

use rf_core::{SampleCnt, SamplePos};
use rf_file::FileError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskIoError {
    #[error("{track}: cannot read {count} samples from playlist at sample {position}: {source}")]
    PlaylistRead {
        track: String,
        count: SampleCnt,
        position: SamplePos,
        #[source]
        source: FileError,
    },

    #[error("{track}: playlist returned {got} of {wanted} samples at sample {position}")]
    ShortRead {
        track: String,
        wanted: SampleCnt,
        got: SampleCnt,
        position: SamplePos,
    },

    #[error("{track}: cannot write captured data to disk: {source}")]
    CaptureWrite {
        track: String,
        #[source]
        source: FileError,
    },

    #[error("{track}: wrote {written} of {wanted} captured samples")]
    ShortWrite {
        track: String,
        wanted: usize,
        written: usize,
    },

    #[error("{track}: cannot create capture file: {source}")]
    SinkCreation {
        track: String,
        #[source]
        source: FileError,
    },

    #[error("{0}: track is record-safe")]
    RecordSafe(String),

    #[error("{0}: track has no channels to record")]
    NoChannels(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Butler thread error: {0}")]
    Butler(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    File(#[from] FileError),
}

pub type DiskIoResult<T> = Result<T, DiskIoError>;

/// Outcome of one refill or flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Nothing more to do right now
    Done,
    /// More than one chunk is still outstanding; call again
    MoreWork,
}

impl IoStatus {
    #[inline]
    pub fn more_work(self) -> bool {
        self == IoStatus::MoreWork
    }
}
