use nix::errno::Errno;

pub type SnapId = u64;

/// Snapshot id designating the writable head of an image. All writes and
/// ordinary reads are addressed to the head.
pub const NOSNAP: SnapId = SnapId::MAX;

/// Result currency of the engine: `Ok(n)` carries a byte count (reads) or 0
/// (writes); `Err(errno)` is the operation's failure code. `Errno::ENOENT`
/// specifically signals "object absent" and drives the parent-fallback and
/// copy-up paths.
pub type IoResult = Result<u64, Errno>;

/// The `(seq, live snapshot ids)` pair stamped on every write so the store
/// can preserve snapshot-visible data on first mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapContext {
    pub seq: SnapId,
    /// Live snapshot ids, newest first.
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    pub fn new(seq: SnapId, snaps: Vec<SnapId>) -> Self {
        Self { seq, snaps }
    }

    pub fn empty() -> Self {
        Self {
            seq: 0,
            snaps: Vec::new(),
        }
    }

    /// Snapshot ids must be strictly descending and no newer than `seq`.
    pub fn is_valid(&self) -> bool {
        if let Some(first) = self.snaps.first() {
            if self.seq < *first {
                return false;
            }
        }
        self.snaps.windows(2).all(|pair| pair[0] > pair[1])
    }
}

/// A byte range, in image or object coordinates depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

pub fn total_len(extents: &[Extent]) -> u64 {
    extents.iter().map(|extent| extent.len).sum()
}

/// Backing object name for one stripe object of an image.
pub fn object_name(prefix: &str, object_no: u64) -> String {
    format!("{prefix}.{object_no:016x}")
}

bitflags::bitflags! {
    /// Per-operation hints forwarded to the object store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        const FADVISE_RANDOM = 1 << 0;
        const FADVISE_SEQUENTIAL = 1 << 1;
        const FADVISE_WILLNEED = 1 << 2;
        const FADVISE_DONTNEED = 1 << 3;
        const FADVISE_NOCACHE = 1 << 4;
        /// Spread snapshot reads across replicas.
        const BALANCE_READS = 1 << 8;
        /// Prefer the nearest replica for snapshot reads.
        const LOCALIZE_READS = 1 << 9;
    }
}
