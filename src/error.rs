use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("in use by another consumer")]
    InUse,
    #[error("handle not open for reading")]
    NotOpenForReading,
    #[error("handle not open for writing")]
    NotOpenForWriting,
    #[error("another writer is registered for this path")]
    WriterExists,
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid argument {key}: {reason}")]
    Config { key: String, reason: String },
    #[error("bad plugin descriptor: {0}")]
    BadDescriptor(String),
    #[error("peer exited: {0}")]
    PeerExit(String),
}

impl Error {
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
