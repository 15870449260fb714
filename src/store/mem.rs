use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::types::{Extent, OpFlags, SnapContext, SnapId, NOSNAP};

use super::{ObjectStore, WriteBatch, WriteOp};

#[derive(Default)]
struct MemObject {
    /// Writable head; `None` after a remove while clones keep the entry alive.
    head: Option<Vec<u8>>,
    /// Preserved copies, oldest first: `(newest snap id at preservation, data)`.
    clones: Vec<(SnapId, Vec<u8>)>,
    write_seq: SnapId,
}

/// In-memory object store with snapshot-on-write clone preservation. Backs
/// the test suites and small demos; the production client lives behind the
/// same [`ObjectStore`] trait.
#[derive(Default)]
pub struct MemObjectStore {
    objects: Mutex<HashMap<String, MemObject>>,
    reads_total: AtomicU64,
    mutations_total: AtomicU64,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self, oid: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(oid)
            .and_then(|object| object.head.clone())
    }

    pub fn exists(&self, oid: &str) -> bool {
        self.head(oid).is_some()
    }

    pub fn reads(&self) -> u64 {
        self.reads_total.load(Ordering::Relaxed)
    }

    /// Mutation attempts, including ones rejected by the existence guard.
    pub fn mutations(&self) -> u64 {
        self.mutations_total.load(Ordering::Relaxed)
    }

    fn object_data(object: &MemObject, snap_id: SnapId) -> Result<Vec<u8>, Errno> {
        if snap_id == NOSNAP {
            return object.head.clone().ok_or(Errno::ENOENT);
        }
        // oldest clone preserved at or after the requested snapshot; an
        // object untouched since the snapshot is served from the head
        for (preserved_at, data) in &object.clones {
            if *preserved_at >= snap_id {
                return Ok(data.clone());
            }
        }
        object.head.clone().ok_or(Errno::ENOENT)
    }

    fn read_range(&self, oid: &str, snap_id: SnapId, offset: u64, len: u64) -> Result<Vec<u8>, Errno> {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.lock();
        let object = objects.get(oid).ok_or(Errno::ENOENT)?;
        let data = Self::object_data(object, snap_id)?;
        let start = offset.min(data.len() as u64) as usize;
        let end = offset.saturating_add(len).min(data.len() as u64) as usize;
        Ok(data[start..end].to_vec())
    }
}

fn apply_op(head: &mut Option<Vec<u8>>, op: &WriteOp) -> Result<(), Errno> {
    match op {
        WriteOp::WriteFull(data) => {
            *head = Some(data.clone());
        }
        WriteOp::Write { offset, data } => {
            let buf = head.get_or_insert_with(Vec::new);
            let end = *offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[*offset as usize..end].copy_from_slice(data);
        }
        WriteOp::Zero { offset, len } => {
            let buf = head.get_or_insert_with(Vec::new);
            let end = (*offset + *len) as usize;
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[*offset as usize..end].fill(0);
        }
        WriteOp::Truncate { offset } => {
            let buf = head.get_or_insert_with(Vec::new);
            buf.resize(*offset as usize, 0);
        }
        WriteOp::Remove => {
            if head.take().is_none() {
                return Err(Errno::ENOENT);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn read(
        &self,
        oid: &str,
        snap_id: SnapId,
        offset: u64,
        len: u64,
        _flags: OpFlags,
    ) -> Result<Vec<u8>, Errno> {
        self.read_range(oid, snap_id, offset, len)
    }

    async fn sparse_read(
        &self,
        oid: &str,
        snap_id: SnapId,
        offset: u64,
        len: u64,
        _flags: OpFlags,
    ) -> Result<(Vec<Extent>, Vec<u8>), Errno> {
        let data = self.read_range(oid, snap_id, offset, len)?;
        let extents = if data.is_empty() {
            Vec::new()
        } else {
            vec![Extent::new(offset, data.len() as u64)]
        };
        Ok((extents, data))
    }

    async fn mutate(
        &self,
        oid: &str,
        batch: WriteBatch,
        snapc: &SnapContext,
    ) -> Result<(), Errno> {
        self.mutations_total.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects.lock();

        let head_exists = objects
            .get(oid)
            .map_or(false, |object| object.head.is_some());
        if batch.assert_exists && !head_exists {
            return Err(Errno::ENOENT);
        }

        let object = objects.entry(oid.to_string()).or_default();
        if let Some(head) = object.head.clone() {
            if snapc.seq > object.write_seq {
                if let Some(newest) = snapc.snaps.first() {
                    object.clones.push((*newest, head));
                }
            }
        }
        object.write_seq = object.write_seq.max(snapc.seq);

        let mut result = Ok(());
        for op in &batch.ops {
            if let Err(err) = apply_op(&mut object.head, op) {
                result = Err(err);
                break;
            }
        }

        let drop_entry = object.head.is_none() && object.clones.is_empty();
        if drop_entry {
            objects.remove(oid);
        }
        result
    }
}
