//! Error type for the typed layer.

use caskstore_core::CaskError;
use thiserror::Error;

pub type TypedResult<T> = Result<T, TypedError>;

#[derive(Debug, Error)]
pub enum TypedError {
    #[error(transparent)]
    Engine(#[from] CaskError),

    /// A codec could not encode or decode a value
    #[error("codec error: {0}")]
    Codec(String),

    /// A stored value is larger than any value this store accepts
    #[error("stored value of {len} bytes exceeds the {max} byte limit")]
    CorruptStore { len: u64, max: u64 },

    #[error("store is closed")]
    Closed,
}

impl TypedError {
    pub(crate) fn codec(msg: impl std::fmt::Display) -> Self {
        TypedError::Codec(msg.to_string())
    }
}

impl From<bincode::Error> for TypedError {
    fn from(err: bincode::Error) -> Self {
        TypedError::codec(err)
    }
}
