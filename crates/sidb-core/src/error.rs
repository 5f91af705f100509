//! Error types for sidb-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid magic bytes: expected {expected:?}, got {got:?}")]
    InvalidMagic { expected: [u8; 8], got: [u8; 8] },

    #[error("CRC32 mismatch: expected {expected:#x}, got {got:#x}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("Segment {index} signature mismatch: expected {expected}, got {got}")]
    SignatureMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("Container too large: {size} bytes exceeds maximum {max} bytes")]
    ContainerTooLarge { size: usize, max: usize },

    #[error("Container corrupted: {0}")]
    ContainerCorrupted(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
