//! Typed access over CaskStore
//!
//! The core engine stores plain bytes. This crate layers two things on
//! top of its public contract:
//!
//! - `TypedStore`: a map-like wrapper that runs keys and values through
//!   compile-time `Codec`s
//! - `ObservableStore`: opens the engine with a change hook and fans each
//!   committed put or delete out to registered observers
//!
//! Codecs are chosen through type parameters; there is no global registry.

pub mod codec;
pub mod error;
pub mod observable;
pub mod store;

pub use codec::{BincodeCodec, Codec, LeCodec, LeInt, RawCodec, Utf8Codec};
pub use error::{TypedError, TypedResult};
pub use observable::{ObservableStore, Observer, Subscription};
pub use store::TypedStore;
