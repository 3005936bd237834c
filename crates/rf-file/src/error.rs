//! File I/O error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("WAV error: {0}")]
    WavError(String),

    #[error("MIDI file error: {0}")]
    MidiError(String),

    #[error("Read error: {0}")]
    ReadError(String),
}

pub type FileResult<T> = Result<T, FileError>;

impl From<hound::Error> for FileError {
    fn from(err: hound::Error) -> Self {
        FileError::WavError(err.to_string())
    }
}

impl From<midly::Error> for FileError {
    fn from(err: midly::Error) -> Self {
        FileError::MidiError(err.to_string())
    }
}
