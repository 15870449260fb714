use std::sync::Arc;

use nix::errno::Errno;
use tokio::task;
use tracing::debug;

use crate::image::Image;
use crate::types::{Extent, IoResult, OpFlags, SnapId, NOSNAP};

use super::{compute_parent_extents, copyup, ObjectRequest, ReadCompletion, ReadOutcome, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// A head miss may still be served by the parent.
    Guard,
    /// The parent read is in flight and its data should be copied up.
    Copyup,
    /// The next completion is terminal.
    Flat,
}

/// What the guard state decided while the lineage locks were held.
enum GuardAction {
    Terminal,
    FallThrough,
    ReadParent(Arc<Image>, Vec<Extent>),
}

pub struct ObjectReadRequest {
    base: ObjectRequest,
    buffer_extents: Vec<Extent>,
    sparse: bool,
    op_flags: OpFlags,
    tried_parent: bool,
    state: ReadState,
    data: Vec<u8>,
    extent_map: Vec<Extent>,
    completion: ReadCompletion,
}

fn is_copy_on_read(image: &Image, snap_id: SnapId) -> bool {
    image.options().clone_copy_on_read
        && !image.options().read_only
        && snap_id == NOSNAP
        && image.is_lock_owner()
}

impl ObjectReadRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn create_read(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        object_len: u64,
        buffer_extents: Vec<Extent>,
        snap_id: SnapId,
        sparse: bool,
        op_flags: OpFlags,
        completion: ReadCompletion,
    ) -> Self {
        let base = ObjectRequest::new(image, object_no, object_off, object_len, snap_id, false);
        let state = if base.has_parent() {
            ReadState::Guard
        } else {
            ReadState::Flat
        };
        Self {
            base,
            buffer_extents,
            sparse,
            op_flags,
            tried_parent: false,
            state,
            data: Vec::new(),
            extent_map: Vec::new(),
            completion,
        }
    }

    /// Buffer placement of this object's bytes within the originating
    /// image-level request.
    pub fn buffer_extents(&self) -> &[Extent] {
        &self.buffer_extents
    }

    pub async fn send(mut self) {
        debug!(
            oid = %self.base.oid,
            offset = self.base.object_off,
            len = self.base.object_len,
            "send read"
        );

        let known_absent = {
            let _snap = self.base.image.snap.read();
            let map = self.base.image.object_map.read();
            map.as_ref()
                .is_some_and(|map| !map.may_exist(self.base.object_no))
        };
        if known_absent {
            // deliver the completion off the submission path
            task::yield_now().await;
            return self.finish(Err(Errno::ENOENT));
        }

        let r = self.send_head_read().await;
        self.complete(r).await;
    }

    async fn send_head_read(&mut self) -> IoResult {
        let flags = self.base.image.read_flags(self.base.snap_id) | self.op_flags;
        let store = Arc::clone(self.base.image.store());
        if self.sparse {
            let (extent_map, data) = store
                .sparse_read(
                    &self.base.oid,
                    self.base.snap_id,
                    self.base.object_off,
                    self.base.object_len,
                    flags,
                )
                .await?;
            self.extent_map = extent_map;
            self.data = data;
        } else {
            self.data = store
                .read(
                    &self.base.oid,
                    self.base.snap_id,
                    self.base.object_off,
                    self.base.object_len,
                    flags,
                )
                .await?;
        }
        Ok(self.data.len() as u64)
    }

    async fn complete(mut self, mut r: IoResult) {
        loop {
            match self.should_complete(r).await {
                Step::Done(result) => return self.finish(result),
                Step::Pending(next) => r = next,
            }
        }
    }

    async fn should_complete(&mut self, r: IoResult) -> Step {
        debug!(oid = %self.base.oid, state = ?self.state, r = ?r, "read should_complete");
        match self.state {
            ReadState::Guard => {
                if self.tried_parent || r != Err(Errno::ENOENT) {
                    return Step::Done(r);
                }

                let action = {
                    let snap = self.base.image.snap.read();
                    let parent = self.base.image.parent.read();
                    match parent.image.clone() {
                        None => {
                            debug!(oid = %self.base.oid, "parent is gone");
                            self.state = ReadState::Flat;
                            GuardAction::FallThrough
                        }
                        Some(parent_image) => {
                            let (exists, extents) = compute_parent_extents(
                                &self.base.image,
                                &snap,
                                &parent,
                                self.base.object_no,
                                self.base.object_off,
                                self.base.object_len,
                                self.base.snap_id,
                            );
                            if exists {
                                self.tried_parent = true;
                                self.state = if is_copy_on_read(&self.base.image, self.base.snap_id)
                                {
                                    ReadState::Copyup
                                } else {
                                    ReadState::Flat
                                };
                                GuardAction::ReadParent(parent_image, extents)
                            } else {
                                GuardAction::Terminal
                            }
                        }
                    }
                };

                match action {
                    GuardAction::Terminal => Step::Done(r),
                    // the flat arm reports the original miss next round
                    GuardAction::FallThrough => Step::Pending(r),
                    GuardAction::ReadParent(parent_image, extents) => {
                        Step::Pending(self.read_from_parent(parent_image, extents).await)
                    }
                }
            }
            ReadState::Copyup => {
                debug_assert!(self.tried_parent);
                if matches!(r, Ok(bytes) if bytes > 0) {
                    // the caller already has its data; materialize the head
                    // object in the background
                    self.send_copyup();
                }
                Step::Done(r)
            }
            ReadState::Flat => Step::Done(r),
        }
    }

    /// Recursive entry into the parent image's read pipeline; the returned
    /// bytes become this request's read buffer.
    async fn read_from_parent(
        &mut self,
        parent_image: Arc<Image>,
        parent_extents: Vec<Extent>,
    ) -> IoResult {
        debug!(oid = %self.base.oid, ?parent_extents, "read from parent");
        let data = Image::aio_read(&parent_image, NOSNAP, parent_extents, self.op_flags).await?;
        let bytes = data.len() as u64;
        self.data = data;
        Ok(bytes)
    }

    fn send_copyup(&mut self) {
        let extents = {
            let snap = self.base.image.snap.read();
            let parent = self.base.image.parent.read();
            let (exists, extents) = compute_parent_extents(
                &self.base.image,
                &snap,
                &parent,
                self.base.object_no,
                0,
                self.base.image.object_size(),
                self.base.snap_id,
            );
            if !exists || !self.base.image.is_lock_owner() {
                return;
            }
            extents
        };
        copyup::enqueue_copyup(
            &self.base.image,
            self.base.object_no,
            self.base.oid.clone(),
            extents,
            None,
        );
    }

    fn finish(self, mut result: IoResult) {
        if self.base.hide_enoent && result == Err(Errno::ENOENT) {
            result = Ok(0);
        }
        debug!(oid = %self.base.oid, result = ?result, "read complete");
        let _ = self.completion.send(ReadOutcome {
            result,
            data: self.data,
            extent_map: self.extent_map,
        });
    }
}
