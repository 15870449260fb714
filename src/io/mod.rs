//! Per-object request state machines.
//!
//! Each image-level operation is decomposed into one request per affected
//! object. A request is submitted once with `send()`, advances by feeding
//! every awaited collaborator result back into its state dispatch, fires its
//! one-shot completion at the terminal state and is dropped.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::image::{Image, ParentState, SnapState};
use crate::striper;
use crate::types::{Extent, IoResult, SnapId};

pub(crate) mod copyup;
mod read;
mod write;

pub use read::ObjectReadRequest;
pub use write::ObjectWriteRequest;

/// Terminal result plus the read buffer. Reads transfer their data to the
/// completion owner; writes complete with a bare [`IoResult`].
#[derive(Debug)]
pub struct ReadOutcome {
    pub result: IoResult,
    pub data: Vec<u8>,
    /// Data-bearing object ranges, populated by sparse reads.
    pub extent_map: Vec<Extent>,
}

pub type ReadCompletion = oneshot::Sender<ReadOutcome>;
pub type WriteCompletion = oneshot::Sender<IoResult>;

/// One round of state dispatch: either the request is terminal with this
/// result, or another operation completed and its result feeds the next
/// round.
pub(crate) enum Step {
    Done(IoResult),
    Pending(IoResult),
}

/// Fields common to every per-object request.
pub(crate) struct ObjectRequest {
    pub(crate) image: Arc<Image>,
    pub(crate) oid: String,
    pub(crate) object_no: u64,
    pub(crate) object_off: u64,
    pub(crate) object_len: u64,
    pub(crate) snap_id: SnapId,
    /// Parent-image ranges backing this object, cached at construction and
    /// refreshed under the lineage locks before any parent operation.
    pub(crate) parent_extents: Vec<Extent>,
    /// Report a terminal `ENOENT` as success (removing an absent object).
    pub(crate) hide_enoent: bool,
}

impl ObjectRequest {
    pub(crate) fn new(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        object_len: u64,
        snap_id: SnapId,
        hide_enoent: bool,
    ) -> Self {
        let mut request = Self {
            image: Arc::clone(image),
            oid: image.object_name(object_no),
            object_no,
            object_off,
            object_len,
            snap_id,
            parent_extents: Vec::new(),
            hide_enoent,
        };
        let snap = request.image.snap.read();
        let parent = request.image.parent.read();
        let (_, extents) = compute_parent_extents(
            &request.image,
            &snap,
            &parent,
            object_no,
            0,
            request.image.object_size(),
            snap_id,
        );
        drop(parent);
        drop(snap);
        request.parent_extents = extents;
        request
    }

    pub(crate) fn has_parent(&self) -> bool {
        !self.parent_extents.is_empty()
    }

    /// Recompute the cached full-object parent extents against the current
    /// lineage. The overlap may have shrunk or vanished since construction.
    pub(crate) fn refresh_parent_extents(&mut self) -> bool {
        let snap = self.image.snap.read();
        let parent = self.image.parent.read();
        let (exists, extents) = compute_parent_extents(
            &self.image,
            &snap,
            &parent,
            self.object_no,
            0,
            self.image.object_size(),
            self.snap_id,
        );
        drop(parent);
        drop(snap);
        self.parent_extents = extents;
        exists
    }
}

/// Translate an object byte range into the parent-image ranges still backing
/// it under the overlap for `snap_id`. Callers hold the snap and parent
/// guards. An overlap-query failure means no parent contribution.
pub(crate) fn compute_parent_extents(
    image: &Image,
    snap: &SnapState,
    parent: &ParentState,
    object_no: u64,
    offset: u64,
    len: u64,
    snap_id: SnapId,
) -> (bool, Vec<Extent>) {
    let overlap = match image.get_parent_overlap(snap_id, snap, parent) {
        Ok(overlap) => overlap,
        Err(err) => {
            warn!(object_no, snap_id, error = %err, "failed to retrieve parent overlap");
            return (false, Vec::new());
        }
    };

    let mut extents = striper::extent_to_file(image.layout(), object_no, offset, len);
    let object_overlap = striper::prune_to_overlap(&mut extents, overlap);
    if object_overlap == 0 {
        return (false, Vec::new());
    }
    debug!(object_no, overlap, ?extents, "parent overlap extents");
    (true, extents)
}
