use async_trait::async_trait;
use nix::errno::Errno;

use crate::types::{Extent, OpFlags, SnapContext, SnapId};

mod mem;

pub use mem::MemObjectStore;

/// One mutation of an object, applied in order within a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    WriteFull(Vec<u8>),
    Write { offset: u64, data: Vec<u8> },
    Zero { offset: u64, len: u64 },
    Truncate { offset: u64 },
    Remove,
}

/// An atomic batch of mutations against a single object.
///
/// `assert_exists` is the write guard: when set, the whole batch fails with
/// `ENOENT` instead of creating an absent object, so the submitter can detect
/// that parent data must be copied up first.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub assert_exists: bool,
    /// Expected final object size, forwarded as an allocation hint.
    pub alloc_hint: Option<u64>,
    pub flags: OpFlags,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Asynchronous object-store client.
///
/// Reads may return short data when the range extends past the end of the
/// object; absent objects fail with `Errno::ENOENT`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(
        &self,
        oid: &str,
        snap_id: SnapId,
        offset: u64,
        len: u64,
        flags: OpFlags,
    ) -> Result<Vec<u8>, Errno>;

    /// Like `read`, additionally reporting which parts of the range hold
    /// data. The returned extents are object-coordinate ranges matching the
    /// returned bytes in order.
    async fn sparse_read(
        &self,
        oid: &str,
        snap_id: SnapId,
        offset: u64,
        len: u64,
        flags: OpFlags,
    ) -> Result<(Vec<Extent>, Vec<u8>), Errno>;

    /// Apply `batch` atomically, stamped with the writer's snap context.
    async fn mutate(&self, oid: &str, batch: WriteBatch, snapc: &SnapContext)
        -> Result<(), Errno>;
}
