//! CaskStore Core: an embedded log-structured key-value engine
//!
//! Values live in append-only segment files; an in-memory index maps every
//! key to the location of its latest record, so a lookup is one hash access
//! plus one positioned read.
//!
//! # Architecture
//!
//! - **Segments**: framed, checksummed records; one active segment takes
//!   appends and rolls over to a new one at a size threshold
//! - **Index**: key to (segment, serial, offset, size), rebuilt on open
//!   from hint files or by scanning segments
//! - **Merge**: rewrites archive segments keeping only live records, while
//!   writes continue against the active segment
//! - **Recovery**: a merge manifest lets an interrupted merge finish on the
//!   next open
//!
//! Keys and values are plain bytes here. Typed access and change
//! subscriptions live in the `caskstore-typed` crate.

pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod hint;
pub mod index;
pub mod platform_durability;
pub mod recovery;
pub mod segment;
pub mod value;

// Re-export key types for convenience
pub use compaction::MergeStats;
pub use config::Config;
pub use engine::{CaskStore, Change, ChangeHook, ChangeKind, Iter};
pub use error::{CaskError, CaskResult};
pub use format::KeyInfo;
pub use value::{ValueHandle, MEMORIZE_THRESHOLD};
