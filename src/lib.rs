//! Per-object asynchronous I/O engine for striped, copy-on-write block
//! images stored as fixed-size objects in an object store.
//!
//! An image-level operation is split (by a caller-provided layer) into one
//! request per affected object. Each request drives a small state machine
//! interleaving object-store I/O, object-map updates and copy-up of data
//! inherited from a parent image, then fires its one-shot completion.

pub mod config;
pub mod image;
pub mod io;
pub mod objmap;
pub mod store;
pub mod striper;
pub mod types;

pub use config::ImageOptions;
pub use image::Image;
pub use io::{ObjectReadRequest, ObjectWriteRequest, ReadCompletion, ReadOutcome, WriteCompletion};
pub use objmap::{ExclusiveLock, FixedLockOwner, InMemoryObjectMap, ObjectMap, ObjectState};
pub use store::{MemObjectStore, ObjectStore, WriteBatch, WriteOp};
pub use striper::Layout;
pub use types::{Extent, IoResult, OpFlags, SnapContext, SnapId, NOSNAP};
