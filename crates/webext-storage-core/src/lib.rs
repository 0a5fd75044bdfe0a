//! Core traits and types for reactive storage-backed cells.
//!
//! This crate defines the pieces shared by every storage area implementation:
//! - `Value` / `ShapeTag`: the closed set of storable shapes and their inference
//! - `Serializer`: the string codec registry, one codec per shape
//! - `StorageBackend`: get/set/remove over an asynchronous string store
//! - `ChangeFeed`: ordered batches of key changes, whoever made them
//! - `SyncedCell`: an observable value mirrored to one key of a storage area

mod cell;
pub mod diagnostics;
mod error;
mod memory;
mod options;
mod serializer;
mod shape;
mod storage;
mod value;
mod watch;

pub use cell::{Origin, Snapshot, SyncedCell};
pub use diagnostics::ErrorHandler;
pub use error::{CellError, CodecError, StorageError};
pub use memory::MemoryStorage;
pub use options::{CellOptions, Flush, MergeDefaults, MergeError, MergeFn};
pub use serializer::{
    serializer_for, AnySerializer, BooleanSerializer, DateSerializer, MapSerializer,
    NumberSerializer, ObjectSerializer, Serializer, SetSerializer, StringSerializer,
};
pub use shape::ShapeTag;
pub use storage::{StorageArea, StorageBackend, TimeoutBackend};
pub use value::Value;
pub use watch::{ChangeBatch, ChangeBroadcaster, ChangeFeed, StorageChange, DEFAULT_FEED_CAPACITY};
