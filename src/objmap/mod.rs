use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;

/// Per-object state tracked by the image's object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Nonexistent,
    Exists,
    /// Deletion in flight; the only state from which `Nonexistent` may be
    /// recorded.
    Pending,
    /// Exists and is known clean against all snapshots.
    ExistsClean,
}

/// Object-map handle. Persistence and invalidation live behind this trait;
/// the engine only consults and updates per-object states.
#[async_trait]
pub trait ObjectMap: Send + Sync {
    fn may_exist(&self, object_no: u64) -> bool;

    /// Whether recording `new_state` would change anything. Consulted before
    /// `update` so requests can skip the asynchronous round-trip.
    fn update_required(&self, object_no: u64, new_state: ObjectState) -> bool;

    /// Record `new_state`. With `expected` set, the update applies only if
    /// the current state matches; a mismatch is a benign no-op.
    async fn update(
        &self,
        object_no: u64,
        new_state: ObjectState,
        expected: Option<ObjectState>,
    ) -> Result<(), Errno>;
}

pub trait ExclusiveLock: Send + Sync {
    fn is_lock_owner(&self) -> bool;
}

/// Exclusive-lock stand-in whose ownership is flipped by tests and demos.
#[derive(Default)]
pub struct FixedLockOwner {
    owned: AtomicBool,
}

impl FixedLockOwner {
    pub fn new(owned: bool) -> Self {
        Self {
            owned: AtomicBool::new(owned),
        }
    }

    pub fn set_owner(&self, owned: bool) {
        self.owned.store(owned, Ordering::Release);
    }
}

impl ExclusiveLock for FixedLockOwner {
    fn is_lock_owner(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }
}

/// Object map held entirely in memory.
pub struct InMemoryObjectMap {
    states: Mutex<Vec<ObjectState>>,
}

impl InMemoryObjectMap {
    pub fn new(num_objects: u64) -> Self {
        Self {
            states: Mutex::new(vec![ObjectState::Nonexistent; num_objects as usize]),
        }
    }

    pub fn state(&self, object_no: u64) -> ObjectState {
        self.states
            .lock()
            .get(object_no as usize)
            .copied()
            .unwrap_or(ObjectState::Nonexistent)
    }

    pub fn set_state(&self, object_no: u64, state: ObjectState) {
        let mut states = self.states.lock();
        if let Some(slot) = states.get_mut(object_no as usize) {
            *slot = state;
        }
    }

    fn required(current: ObjectState, new_state: ObjectState) -> bool {
        if current == new_state {
            return false;
        }
        // a pending deletion of something already absent records nothing,
        // and absence may only be recorded from a pending deletion
        if new_state == ObjectState::Pending && current == ObjectState::Nonexistent {
            return false;
        }
        if new_state == ObjectState::Nonexistent && current != ObjectState::Pending {
            return false;
        }
        true
    }
}

#[async_trait]
impl ObjectMap for InMemoryObjectMap {
    fn may_exist(&self, object_no: u64) -> bool {
        self.state(object_no) != ObjectState::Nonexistent
    }

    fn update_required(&self, object_no: u64, new_state: ObjectState) -> bool {
        Self::required(self.state(object_no), new_state)
    }

    async fn update(
        &self,
        object_no: u64,
        new_state: ObjectState,
        expected: Option<ObjectState>,
    ) -> Result<(), Errno> {
        let mut states = self.states.lock();
        let Some(slot) = states.get_mut(object_no as usize) else {
            return Err(Errno::ERANGE);
        };
        if let Some(expected) = expected {
            if *slot != expected {
                return Ok(());
            }
        }
        if Self::required(*slot, new_state) {
            *slot = new_state;
        }
        Ok(())
    }
}
