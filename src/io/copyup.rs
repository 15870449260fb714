//! Copy-up coalescing: materializing parent-backed data into a head object.
//!
//! Concurrent requests against the same object share one in-flight job. The
//! write path attaches its buffered mutations and waits; the copy-on-read
//! path only ensures a job is running. The job reads the parent ranges,
//! writes the materialized bytes plus every attached mutation as one batch
//! and notifies the attached requests.

use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::image::Image;
use crate::store::{WriteBatch, WriteOp};
use crate::types::{Extent, IoResult, OpFlags, NOSNAP};

/// A write request waiting on a copy-up: its object ops ride in the job's
/// head write, and its state machine resumes with the job's outcome.
pub(crate) struct CopyupDependent {
    pub(crate) ops: Vec<WriteOp>,
    pub(crate) done: oneshot::Sender<IoResult>,
}

pub(crate) struct CopyupJob {
    image: Arc<Image>,
    oid: String,
    object_no: u64,
    parent_extents: Vec<Extent>,
    /// Mutated only inside the image's copy-up table lock, so attachment
    /// stays atomic with table membership.
    dependents: Mutex<Vec<CopyupDependent>>,
}

/// Start a copy-up for `object_no` or join the one already in flight.
///
/// The table lock serializes racing requests: the first inserts and starts
/// the job, later ones find the entry. The lock is released before the job
/// task starts, since the job itself takes lineage locks.
pub(crate) fn enqueue_copyup(
    image: &Arc<Image>,
    object_no: u64,
    oid: String,
    parent_extents: Vec<Extent>,
    dependent: Option<CopyupDependent>,
) {
    let job = {
        let mut table = image.copyup.lock();
        if let Some(existing) = table.get(&object_no) {
            debug!(oid = %oid, object_no, "attaching to in-flight copyup");
            if let Some(dependent) = dependent {
                existing.dependents.lock().push(dependent);
            }
            return;
        }
        let job = Arc::new(CopyupJob {
            image: Arc::clone(image),
            oid,
            object_no,
            parent_extents,
            dependents: Mutex::new(dependent.into_iter().collect()),
        });
        table.insert(object_no, Arc::clone(&job));
        job
    };
    tokio::spawn(job.run());
}

impl CopyupJob {
    async fn run(self: Arc<Self>) {
        debug!(oid = %self.oid, object_no = self.object_no, "copyup start");

        let parent = self.image.parent.read().image.clone();
        let data = match parent {
            Some(parent) => {
                Image::aio_read(&parent, NOSNAP, self.parent_extents.clone(), OpFlags::empty())
                    .await
            }
            None => Err(Errno::ENOENT),
        };

        // Seal the job: leave the table and take the dependents in one
        // critical section, so a late request starts a fresh job instead of
        // attaching to a batch that is already being written.
        let dependents = {
            let mut table = self.image.copyup.lock();
            table.remove(&self.object_no);
            std::mem::take(&mut *self.dependents.lock())
        };

        let result = match data {
            Err(err) => Err(err),
            Ok(data) => {
                let mut batch = WriteBatch::default();
                if !data.is_empty() {
                    batch.ops.push(WriteOp::WriteFull(data));
                }
                for dependent in &dependents {
                    batch.ops.extend(dependent.ops.iter().cloned());
                }
                if batch.is_empty() {
                    Ok(0)
                } else {
                    let snapc = self.image.snapc();
                    self.image
                        .store()
                        .mutate(&self.oid, batch, &snapc)
                        .await
                        .map(|_| 0)
                }
            }
        };

        if let Err(err) = result {
            warn!(oid = %self.oid, error = %err, "copyup failed");
        }
        for dependent in dependents {
            let _ = dependent.done.send(result);
        }
        debug!(oid = %self.oid, result = ?result, "copyup finished");
    }
}
