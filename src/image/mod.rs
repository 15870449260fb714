use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::ImageOptions;
use crate::io::copyup::CopyupJob;
use crate::objmap::{ExclusiveLock, ObjectMap};
use crate::store::ObjectStore;
use crate::striper::Layout;
use crate::types::{object_name, OpFlags, SnapContext, SnapId, NOSNAP};

mod read;

#[derive(Debug, Clone, Copy)]
pub struct SnapInfo {
    pub id: SnapId,
    /// Parent overlap recorded when the snapshot was taken; `None` when the
    /// image had no parent at that point.
    pub parent_overlap: Option<u64>,
}

/// Snapshot lineage of an image, guarded by the snap lock. `snaps` is kept
/// newest first, matching the snap-context stamp order.
#[derive(Debug, Default)]
pub struct SnapState {
    pub seq: SnapId,
    pub snaps: Vec<SnapInfo>,
}

impl SnapState {
    pub fn ids(&self) -> Vec<SnapId> {
        self.snaps.iter().map(|info| info.id).collect()
    }

    pub fn get(&self, snap_id: SnapId) -> Option<&SnapInfo> {
        self.snaps.iter().find(|info| info.id == snap_id)
    }
}

/// Parent linkage of a cloned image, guarded by the parent lock. `overlap`
/// is the byte prefix of this image still backed by the parent.
#[derive(Default)]
pub struct ParentState {
    pub image: Option<Arc<Image>>,
    pub overlap: u64,
}

/// Shared, long-lived context for one image: layout, configuration, the
/// store handle, snapshot/parent lineage, the optional object map and the
/// in-flight copy-up table.
///
/// Lock order, outermost first: `snap` → `parent` → `object_map`. The
/// copy-up table mutex is a leaf and is never held while a job starts.
pub struct Image {
    object_prefix: String,
    layout: Layout,
    opts: ImageOptions,
    store: Arc<dyn ObjectStore>,
    pub(crate) snap: RwLock<SnapState>,
    pub(crate) parent: RwLock<ParentState>,
    pub(crate) object_map: RwLock<Option<Arc<dyn ObjectMap>>>,
    exclusive_lock: RwLock<Option<Arc<dyn ExclusiveLock>>>,
    pub(crate) copyup: Mutex<HashMap<u64, Arc<CopyupJob>>>,
}

impl Image {
    pub fn new(
        object_prefix: impl Into<String>,
        opts: ImageOptions,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>> {
        let object_prefix = object_prefix.into();
        if object_prefix.is_empty() {
            bail!("object prefix must not be empty");
        }
        opts.validate()?;
        let layout = opts.layout();
        Ok(Arc::new(Self {
            object_prefix,
            layout,
            opts,
            store,
            snap: RwLock::new(SnapState::default()),
            parent: RwLock::new(ParentState::default()),
            object_map: RwLock::new(None),
            exclusive_lock: RwLock::new(None),
            copyup: Mutex::new(HashMap::new()),
        }))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn options(&self) -> &ImageOptions {
        &self.opts
    }

    pub fn object_size(&self) -> u64 {
        self.layout.object_size
    }

    pub fn object_name(&self, object_no: u64) -> String {
        object_name(&self.object_prefix, object_no)
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Current snap context stamp for writes originating on this image.
    pub fn snapc(&self) -> SnapContext {
        let snap = self.snap.read();
        SnapContext::new(snap.seq, snap.ids())
    }

    /// True when no exclusive lock is configured or this client owns it.
    pub fn is_lock_owner(&self) -> bool {
        self.exclusive_lock
            .read()
            .as_ref()
            .map_or(true, |lock| lock.is_lock_owner())
    }

    /// Replica-placement hints for reads at `snap_id`.
    pub fn read_flags(&self, snap_id: SnapId) -> OpFlags {
        let mut flags = OpFlags::empty();
        if snap_id != NOSNAP {
            if self.opts.balance_snap_reads {
                flags |= OpFlags::BALANCE_READS;
            } else if self.opts.localize_snap_reads {
                flags |= OpFlags::LOCALIZE_READS;
            }
        }
        flags
    }

    /// Parent overlap in effect for `snap_id`. Requires the snap and parent
    /// guards, which callers already hold for extent computation.
    pub(crate) fn get_parent_overlap(
        &self,
        snap_id: SnapId,
        snap: &SnapState,
        parent: &ParentState,
    ) -> Result<u64, Errno> {
        if snap_id == NOSNAP {
            if parent.image.is_some() {
                Ok(parent.overlap)
            } else {
                Ok(0)
            }
        } else {
            match snap.get(snap_id) {
                Some(info) => Ok(info.parent_overlap.unwrap_or(0)),
                // the snapshot was deleted while a request was in flight
                None => Err(Errno::ENOENT),
            }
        }
    }

    pub fn in_flight_copyups(&self) -> usize {
        self.copyup.lock().len()
    }

    // -- external mutators: snapshot create/remove and parent changes --

    pub fn set_parent(&self, parent_image: Option<Arc<Image>>, overlap: u64) {
        let mut parent = self.parent.write();
        debug!(
            prefix = %self.object_prefix,
            overlap,
            has_parent = parent_image.is_some(),
            "parent changed"
        );
        parent.image = parent_image;
        parent.overlap = overlap;
    }

    pub fn set_parent_overlap(&self, overlap: u64) {
        self.parent.write().overlap = overlap;
    }

    pub fn set_object_map(&self, map: Option<Arc<dyn ObjectMap>>) {
        *self.object_map.write() = map;
    }

    pub fn set_exclusive_lock(&self, lock: Option<Arc<dyn ExclusiveLock>>) {
        *self.exclusive_lock.write() = lock;
    }

    pub fn add_snap(&self, snap_id: SnapId) -> Result<()> {
        let mut snap = self.snap.write();
        if snap_id <= snap.seq {
            bail!("snapshot id {snap_id} is not newer than seq {}", snap.seq);
        }
        let parent_overlap = {
            let parent = self.parent.read();
            parent.image.as_ref().map(|_| parent.overlap)
        };
        snap.snaps.insert(
            0,
            SnapInfo {
                id: snap_id,
                parent_overlap,
            },
        );
        snap.seq = snap_id;
        debug!(prefix = %self.object_prefix, snap_id, "snapshot created");
        Ok(())
    }

    pub fn remove_snap(&self, snap_id: SnapId) -> Result<()> {
        let mut snap = self.snap.write();
        let before = snap.snaps.len();
        snap.snaps.retain(|info| info.id != snap_id);
        if snap.snaps.len() == before {
            bail!("snapshot id {snap_id} does not exist");
        }
        debug!(prefix = %self.object_prefix, snap_id, "snapshot removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nix::errno::Errno;

    use crate::config::ImageOptions;
    use crate::store::MemObjectStore;
    use crate::types::NOSNAP;

    use super::Image;

    fn new_image() -> Arc<Image> {
        Image::new(
            "img",
            ImageOptions::default(),
            Arc::new(MemObjectStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn snapc_tracks_snapshots_newest_first() {
        let image = new_image();
        assert_eq!(image.snapc().seq, 0);
        image.add_snap(1).unwrap();
        image.add_snap(4).unwrap();
        let snapc = image.snapc();
        assert_eq!(snapc.seq, 4);
        assert_eq!(snapc.snaps, vec![4, 1]);
        assert!(snapc.is_valid());

        image.remove_snap(1).unwrap();
        assert_eq!(image.snapc().snaps, vec![4]);
        assert!(image.remove_snap(1).is_err());
        assert!(image.add_snap(3).is_err());
    }

    #[test]
    fn head_overlap_follows_the_parent_link() {
        let image = new_image();
        {
            let snap = image.snap.read();
            let parent = image.parent.read();
            assert_eq!(image.get_parent_overlap(NOSNAP, &snap, &parent), Ok(0));
        }

        image.set_parent(Some(new_image()), 1 << 20);
        let snap = image.snap.read();
        let parent = image.parent.read();
        assert_eq!(
            image.get_parent_overlap(NOSNAP, &snap, &parent),
            Ok(1 << 20)
        );
    }

    #[test]
    fn snapshot_overlap_is_the_recorded_one() {
        let image = new_image();
        image.set_parent(Some(new_image()), 4096);
        image.add_snap(2).unwrap();
        image.set_parent_overlap(0);

        let snap = image.snap.read();
        let parent = image.parent.read();
        assert_eq!(image.get_parent_overlap(2, &snap, &parent), Ok(4096));
        assert_eq!(
            image.get_parent_overlap(7, &snap, &parent),
            Err(Errno::ENOENT)
        );
    }
}
