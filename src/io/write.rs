use std::sync::Arc;

use nix::errno::Errno;
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, error};

use crate::image::Image;
use crate::objmap::{ObjectMap, ObjectState};
use crate::store::{WriteBatch, WriteOp};
use crate::types::{IoResult, OpFlags, SnapContext, SnapId, NOSNAP};

use super::{copyup, ObjectRequest, Step, WriteCompletion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    /// The plain object-store write is in flight.
    Flat,
    /// The guarded write is in flight; `ENOENT` means copy-up first.
    Guard,
    /// The pre object-map update is in flight.
    Pre,
    /// The post object-map update is in flight; its result is terminal.
    Post,
    /// An attached copy-up job is in flight.
    Copyup,
    /// Terminal error.
    Error,
}

/// The four mutation shapes sharing the write state machine. Hook points
/// (`pre_object_map_update`, `post_object_map_update`, `guard_write`,
/// `add_write_ops` and the `send_write` dispatch) switch on this tag.
pub(crate) enum WriteVariant {
    Write { data: Vec<u8>, op_flags: OpFlags },
    Zero,
    Truncate,
    Remove,
}

impl WriteVariant {
    fn kind(&self) -> &'static str {
        match self {
            WriteVariant::Write { .. } => "write",
            WriteVariant::Zero => "zero",
            WriteVariant::Truncate => "truncate",
            WriteVariant::Remove => "remove",
        }
    }
}

pub struct ObjectWriteRequest {
    base: ObjectRequest,
    variant: WriteVariant,
    state: WriteState,
    snap_seq: SnapId,
    snaps: Vec<SnapId>,
    object_exists: bool,
    completion: WriteCompletion,
}

impl ObjectWriteRequest {
    fn new(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        object_len: u64,
        variant: WriteVariant,
        snapc: &SnapContext,
        hide_enoent: bool,
        completion: WriteCompletion,
    ) -> Self {
        debug_assert!(snapc.is_valid());
        Self {
            base: ObjectRequest::new(image, object_no, object_off, object_len, NOSNAP, hide_enoent),
            variant,
            state: WriteState::Flat,
            snap_seq: snapc.seq,
            snaps: snapc.snaps.clone(),
            object_exists: false,
            completion,
        }
    }

    pub fn create_write(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        data: Vec<u8>,
        snapc: &SnapContext,
        op_flags: OpFlags,
        completion: WriteCompletion,
    ) -> Self {
        let object_len = data.len() as u64;
        Self::new(
            image,
            object_no,
            object_off,
            object_len,
            WriteVariant::Write { data, op_flags },
            snapc,
            false,
            completion,
        )
    }

    pub fn create_zero(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        object_len: u64,
        snapc: &SnapContext,
        completion: WriteCompletion,
    ) -> Self {
        Self::new(
            image,
            object_no,
            object_off,
            object_len,
            WriteVariant::Zero,
            snapc,
            false,
            completion,
        )
    }

    pub fn create_truncate(
        image: &Arc<Image>,
        object_no: u64,
        object_off: u64,
        snapc: &SnapContext,
        completion: WriteCompletion,
    ) -> Self {
        Self::new(
            image,
            object_no,
            object_off,
            0,
            WriteVariant::Truncate,
            snapc,
            false,
            completion,
        )
    }

    pub fn create_remove(
        image: &Arc<Image>,
        object_no: u64,
        snapc: &SnapContext,
        completion: WriteCompletion,
    ) -> Self {
        Self::new(
            image,
            object_no,
            0,
            0,
            WriteVariant::Remove,
            snapc,
            true,
            completion,
        )
    }

    pub async fn send(mut self) {
        debug!(
            kind = self.variant.kind(),
            oid = %self.base.oid,
            offset = self.base.object_off,
            len = self.base.object_len,
            "send write"
        );
        let r = match self.send_pre().await {
            Some(update_result) => update_result,
            None => self.send_write().await,
        };
        self.complete(r).await;
    }

    /// Issue the pre object-map update when one is required. Returns its
    /// result, or `None` when the write path can proceed directly.
    async fn send_pre(&mut self) -> Option<IoResult> {
        let update: Option<(Arc<dyn ObjectMap>, ObjectState)> = {
            let _snap = self.base.image.snap.read();
            let map_guard = self.base.image.object_map.read();
            match map_guard.as_ref() {
                None => {
                    self.object_exists = true;
                    None
                }
                Some(map) => {
                    // an active object map implies lock ownership
                    debug_assert!(self.base.image.is_lock_owner());
                    self.object_exists = map.may_exist(self.base.object_no);
                    let new_state = self.pre_object_map_update();
                    if map.update_required(self.base.object_no, new_state) {
                        debug!(oid = %self.base.oid, ?new_state, "send pre");
                        self.state = WriteState::Pre;
                        Some((Arc::clone(map), new_state))
                    } else {
                        None
                    }
                }
            }
        };

        match update {
            Some((map, new_state)) => Some(
                map.update(self.base.object_no, new_state, None)
                    .await
                    .map(|_| 0),
            ),
            None => None,
        }
    }

    /// Main write dispatch, with the per-variant overrides.
    async fn send_write(&mut self) -> IoResult {
        debug!(
            kind = self.variant.kind(),
            oid = %self.base.oid,
            object_exists = self.object_exists,
            "send write op"
        );
        match &self.variant {
            WriteVariant::Write { .. } => {
                let write_full = self.base.object_off == 0
                    && self.base.object_len == self.base.image.object_size();
                if write_full && !self.base.has_parent() {
                    // a full overwrite discards parent data anyway
                    self.send_write_op(false).await
                } else {
                    self.send_write_guarded().await
                }
            }
            WriteVariant::Remove => self.send_write_op(true).await,
            WriteVariant::Truncate if !self.object_exists && !self.base.has_parent() => {
                // nothing to truncate; deliver success off the submission path
                self.state = WriteState::Flat;
                task::yield_now().await;
                Ok(0)
            }
            WriteVariant::Truncate | WriteVariant::Zero => self.send_write_guarded().await,
        }
    }

    async fn send_write_guarded(&mut self) -> IoResult {
        if !self.object_exists && self.base.has_parent() {
            self.state = WriteState::Guard;
            self.handle_write_guard().await
        } else {
            self.send_write_op(true).await
        }
    }

    async fn send_write_op(&mut self, write_guard: bool) -> IoResult {
        self.state = WriteState::Flat;
        let mut batch = WriteBatch::default();
        if write_guard {
            self.guard_write(&mut batch);
        }
        self.add_write_ops(&mut batch);
        debug_assert!(!batch.is_empty());
        let snapc = SnapContext::new(self.snap_seq, self.snaps.clone());
        self.base
            .image
            .store()
            .mutate(&self.base.oid, batch, &snapc)
            .await
            .map(|_| 0)
    }

    /// Arm the "object must exist" assertion so a write against an absent,
    /// parent-backed object fails with `ENOENT` instead of creating it.
    fn guard_write(&mut self, batch: &mut WriteBatch) {
        if let WriteVariant::Remove = self.variant {
            // deep copy-up is only needed while snapshots can see the data
            let snap = self.base.image.snap.read();
            if snap.snaps.is_empty() {
                return;
            }
        }
        if self.base.has_parent() {
            debug!(oid = %self.base.oid, "guarding write");
            self.state = WriteState::Guard;
            batch.assert_exists = true;
        }
    }

    fn add_write_ops(&self, batch: &mut WriteBatch) {
        match &self.variant {
            WriteVariant::Write { data, op_flags } => {
                {
                    let _snap = self.base.image.snap.read();
                    let map = self.base.image.object_map.read();
                    if self.base.image.options().enable_alloc_hint
                        && (map.is_none() || !self.object_exists)
                    {
                        batch.alloc_hint = Some(self.base.image.object_size());
                    }
                }
                if self.base.object_off == 0
                    && self.base.object_len == self.base.image.object_size()
                {
                    batch.ops.push(WriteOp::WriteFull(data.clone()));
                } else {
                    batch.ops.push(WriteOp::Write {
                        offset: self.base.object_off,
                        data: data.clone(),
                    });
                }
                batch.flags = *op_flags;
            }
            WriteVariant::Zero => batch.ops.push(WriteOp::Zero {
                offset: self.base.object_off,
                len: self.base.object_len,
            }),
            WriteVariant::Truncate => batch.ops.push(WriteOp::Truncate {
                offset: self.base.object_off,
            }),
            WriteVariant::Remove => batch.ops.push(WriteOp::Remove),
        }
    }

    /// The guard tripped: the object is absent but was parent-backed at
    /// submission. Re-check the lineage and either copy up or retry plain.
    async fn handle_write_guard(&mut self) -> IoResult {
        let has_parent = self.base.refresh_parent_extents();
        if has_parent {
            self.send_copyup().await
        } else {
            debug!(oid = %self.base.oid, "parent overlap now 0");
            Box::pin(self.send_write()).await
        }
    }

    async fn send_copyup(&mut self) -> IoResult {
        debug!(kind = self.variant.kind(), oid = %self.base.oid, "send copyup");
        self.state = WriteState::Copyup;

        let mut batch = WriteBatch::default();
        self.add_write_ops(&mut batch);
        let parent_extents = std::mem::take(&mut self.base.parent_extents);

        let (done, outcome) = oneshot::channel();
        copyup::enqueue_copyup(
            &self.base.image,
            self.base.object_no,
            self.base.oid.clone(),
            parent_extents,
            Some(copyup::CopyupDependent {
                ops: batch.ops,
                done,
            }),
        );
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(Errno::EIO),
        }
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
        debug!(
            kind = self.variant.kind(),
            oid = %self.base.oid,
            state = ?self.state,
            r = ?r,
            "write should_complete"
        );
        match self.state {
            WriteState::Pre => {
                if r.is_err() {
                    return Step::Done(r);
                }
                Step::Pending(self.send_write().await)
            }
            WriteState::Guard => match r {
                Err(Errno::ENOENT) => Step::Pending(self.handle_write_guard().await),
                Err(_) => {
                    self.state = WriteState::Error;
                    Step::Pending(r)
                }
                Ok(_) => self.send_post(r).await,
            },
            WriteState::Copyup => match r {
                Err(_) => {
                    self.state = WriteState::Error;
                    Step::Pending(r)
                }
                Ok(_) => self.send_post(r).await,
            },
            WriteState::Flat => self.send_post(r).await,
            WriteState::Post => Step::Done(r),
            WriteState::Error => {
                debug_assert!(r.is_err());
                if let Err(err) = r {
                    error!(
                        kind = self.variant.kind(),
                        oid = %self.base.oid,
                        error = %err,
                        "write failed"
                    );
                }
                Step::Done(r)
            }
        }
    }

    /// Finalize object disappearance in the map, gated on the `Pending`
    /// state the pre-update recorded. Without a required update the write's
    /// own result is terminal.
    async fn send_post(&mut self, write_result: IoResult) -> Step {
        let update: Option<Arc<dyn ObjectMap>> = {
            let _snap = self.base.image.snap.read();
            let map_guard = self.base.image.object_map.read();
            match map_guard.as_ref() {
                None => None,
                Some(_) if !self.post_object_map_update() => None,
                Some(map) => {
                    debug_assert!(self.base.image.is_lock_owner());
                    if map.update_required(self.base.object_no, ObjectState::Nonexistent) {
                        debug!(oid = %self.base.oid, "send post");
                        self.state = WriteState::Post;
                        Some(Arc::clone(map))
                    } else {
                        None
                    }
                }
            }
        };

        match update {
            None => Step::Done(write_result),
            Some(map) => Step::Pending(
                map.update(
                    self.base.object_no,
                    ObjectState::Nonexistent,
                    Some(ObjectState::Pending),
                )
                .await
                .map(|_| 0),
            ),
        }
    }

    fn pre_object_map_update(&self) -> ObjectState {
        match &self.variant {
            WriteVariant::Write { .. } | WriteVariant::Zero => ObjectState::Exists,
            WriteVariant::Truncate => {
                if self.base.object_off == 0 {
                    ObjectState::Pending
                } else {
                    ObjectState::Exists
                }
            }
            WriteVariant::Remove => {
                if self.base.has_parent() {
                    // the deep copy-up keeps the object materialized
                    ObjectState::Exists
                } else {
                    ObjectState::Pending
                }
            }
        }
    }

    fn post_object_map_update(&self) -> bool {
        match &self.variant {
            WriteVariant::Write { .. } | WriteVariant::Zero => false,
            WriteVariant::Truncate => self.base.object_off == 0,
            WriteVariant::Remove => !self.base.has_parent(),
        }
    }

    fn finish(self, mut result: IoResult) {
        if self.base.hide_enoent && result == Err(Errno::ENOENT) {
            result = Ok(0);
        }
        debug!(
            kind = self.variant.kind(),
            oid = %self.base.oid,
            result = ?result,
            "write complete"
        );
        let _ = self.completion.send(result);
    }
}
