//! Error types for CaskStore operations
//!
//! All engine errors are represented by the CaskError enum. Variants carry
//! enough context (paths, offsets, sizes) to tell a caller-misuse error
//! apart from on-disk damage.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// CaskStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum CaskError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Engine construction parameters are unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Key or value exceeds a configured limit
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized component
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },

    /// A hint entry declares a key longer than the configured maximum
    #[error("corrupt key in hint file {}: entry {entry} has key of {key_len} bytes (max {max_key_size})", .path.display())]
    CorruptKey {
        /// Hint file being read
        path: PathBuf,
        /// 1-based position of the offending entry
        entry: u64,
        /// Key length found in the entry header
        key_len: u32,
        /// Configured maximum key size
        max_key_size: usize,
    },

    /// A hint entry is cut short
    #[error("corrupt hint file {} at offset {offset}: {reason}", .path.display())]
    CorruptHint {
        /// Hint file being read
        path: PathBuf,
        /// Byte offset of the entry
        offset: u64,
        /// Description of the damage
        reason: String,
    },

    /// Append attempted on an archive segment
    #[error("segment {segment_id} is read-only")]
    ReadOnlySegment {
        /// Id of the archive segment
        segment_id: u16,
    },

    /// The segment's file handle has been released
    #[error("segment {segment_id} is closed")]
    SegmentClosed {
        /// Id of the closed segment
        segment_id: u16,
    },

    /// The segment grew past what a u32 value offset can address
    #[error("segment {segment_id} cannot address {size} bytes with 32-bit offsets")]
    SegmentOverflow {
        /// Id of the segment
        segment_id: u16,
        /// Size the write would have produced
        size: u64,
    },

    /// No segment id is left in the u16 space
    #[error("segment ids exhausted after {last_id}")]
    SegmentIdsExhausted {
        /// Highest id in use
        last_id: u16,
    },

    /// Operation is not valid in the object's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The engine has been disposed
    #[error("store is closed")]
    Closed,
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl CaskError {
    /// Build an `Io` error that remembers which file it came from.
    pub fn io_at(path: &Path, context: &str, err: io::Error) -> Self {
        CaskError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// True for errors that mean a segment vanished underneath a reader.
    pub fn is_segment_closed(&self) -> bool {
        matches!(self, CaskError::SegmentClosed { .. })
    }
}

/// Convert std::io::Error to CaskError::Io
impl From<io::Error> for CaskError {
    fn from(err: io::Error) -> Self {
        CaskError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Lets `ValueHandle`'s `Read` impl surface engine errors.
impl From<CaskError> for io::Error {
    fn from(err: CaskError) -> Self {
        match err {
            CaskError::Io { kind, message, .. } => io::Error::new(kind, message),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Result type alias for CaskStore operations
pub type CaskResult<T> = Result<T, CaskError>;
