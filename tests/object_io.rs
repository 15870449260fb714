use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

use objimage::{
    Extent, FixedLockOwner, Image, ImageOptions, InMemoryObjectMap, IoResult, MemObjectStore,
    ObjectMap, ObjectReadRequest, ObjectState, ObjectStore, ObjectWriteRequest, OpFlags,
    ReadOutcome, SnapContext, SnapId, WriteBatch, NOSNAP,
};

const OBJECT_SIZE: u64 = 4096;

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .try_init();
}

fn opts() -> ImageOptions {
    ImageOptions {
        object_size_bytes: OBJECT_SIZE,
        ..ImageOptions::default()
    }
}

struct Harness {
    store: Arc<MemObjectStore>,
    image: Arc<Image>,
}

fn harness(prefix: &str, opts: ImageOptions) -> Harness {
    init_logging();
    let store = Arc::new(MemObjectStore::new());
    let image = Image::new(prefix, opts, store.clone()).expect("image setup");
    Harness { store, image }
}

fn parent_bytes() -> Vec<u8> {
    (0..OBJECT_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Parent image holding one fully written object, plus a cloned child with
/// the given head overlap.
async fn seeded_clone(overlap: u64, child_opts: ImageOptions) -> (Harness, Harness) {
    let parent = harness("parent", opts());
    assert_eq!(write(&parent.image, 0, 0, parent_bytes()).await, Ok(0));
    let child = harness("child", child_opts);
    child.image.set_parent(Some(parent.image.clone()), overlap);
    (parent, child)
}

async fn write(image: &Arc<Image>, object_no: u64, offset: u64, data: Vec<u8>) -> IoResult {
    let (done, outcome) = oneshot::channel();
    ObjectWriteRequest::create_write(
        image,
        object_no,
        offset,
        data,
        &image.snapc(),
        OpFlags::empty(),
        done,
    )
    .send()
    .await;
    outcome.await.expect("write completion")
}

async fn zero(image: &Arc<Image>, object_no: u64, offset: u64, len: u64) -> IoResult {
    let (done, outcome) = oneshot::channel();
    ObjectWriteRequest::create_zero(image, object_no, offset, len, &image.snapc(), done)
        .send()
        .await;
    outcome.await.expect("zero completion")
}

async fn truncate(image: &Arc<Image>, object_no: u64, offset: u64) -> IoResult {
    let (done, outcome) = oneshot::channel();
    ObjectWriteRequest::create_truncate(image, object_no, offset, &image.snapc(), done)
        .send()
        .await;
    outcome.await.expect("truncate completion")
}

async fn remove(image: &Arc<Image>, object_no: u64) -> IoResult {
    let (done, outcome) = oneshot::channel();
    ObjectWriteRequest::create_remove(image, object_no, &image.snapc(), done)
        .send()
        .await;
    outcome.await.expect("remove completion")
}

async fn read_at(
    image: &Arc<Image>,
    object_no: u64,
    offset: u64,
    len: u64,
    snap_id: SnapId,
) -> ReadOutcome {
    let (done, outcome) = oneshot::channel();
    ObjectReadRequest::create_read(
        image,
        object_no,
        offset,
        len,
        vec![Extent::new(0, len)],
        snap_id,
        false,
        OpFlags::empty(),
        done,
    )
    .send()
    .await;
    outcome.await.expect("read completion")
}

async fn read(image: &Arc<Image>, object_no: u64, offset: u64, len: u64) -> ReadOutcome {
    read_at(image, object_no, offset, len, NOSNAP).await
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn read_absent_object_without_parent_is_enoent() {
    let h = harness("img", opts());
    h.image
        .set_object_map(Some(Arc::new(InMemoryObjectMap::new(8))));

    let outcome = read(&h.image, 0, 0, 512).await;
    assert_eq!(outcome.result, Err(Errno::ENOENT));
    assert!(outcome.data.is_empty());
    // the object map short-circuits before the store is consulted
    assert_eq!(h.store.reads(), 0);
}

#[tokio::test]
async fn head_miss_falls_back_to_parent() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;

    let outcome = read(&child.image, 0, 1024, 512).await;
    assert_eq!(outcome.result, Ok(512));
    assert_eq!(outcome.data, parent_bytes()[1024..1536].to_vec());

    // no copy-up without copy-on-read
    assert_eq!(child.image.in_flight_copyups(), 0);
    assert_eq!(child.store.mutations(), 0);
    assert!(!child.store.exists(&child.image.object_name(0)));
}

#[tokio::test]
async fn parent_fallback_respects_overlap() {
    let (_parent, child) = seeded_clone(1536, opts()).await;

    let outcome = read(&child.image, 0, 1024, 1024).await;
    assert_eq!(outcome.result, Ok(512));
    assert_eq!(outcome.data, parent_bytes()[1024..1536].to_vec());

    // entirely beyond the overlap nothing is parent-backed
    let outcome = read(&child.image, 0, 2048, 512).await;
    assert_eq!(outcome.result, Err(Errno::ENOENT));
}

#[tokio::test]
async fn copy_on_read_materializes_the_head_object() {
    let child_opts = ImageOptions {
        clone_copy_on_read: true,
        ..opts()
    };
    let (_parent, child) = seeded_clone(OBJECT_SIZE, child_opts).await;

    let outcome = read(&child.image, 0, 0, 512).await;
    assert_eq!(outcome.result, Ok(512));
    assert_eq!(outcome.data, parent_bytes()[..512].to_vec());

    let oid = child.image.object_name(0);
    let store = child.store.clone();
    wait_until("copy-on-read materialization", move || store.exists(&oid)).await;
    let image = child.image.clone();
    wait_until("copyup table drain", move || {
        image.in_flight_copyups() == 0
    })
    .await;

    assert_eq!(child.store.head(&child.image.object_name(0)), Some(parent_bytes()));
    assert_eq!(child.store.mutations(), 1);
}

#[tokio::test]
async fn copy_on_read_requires_lock_ownership() {
    let child_opts = ImageOptions {
        clone_copy_on_read: true,
        ..opts()
    };
    let (_parent, child) = seeded_clone(OBJECT_SIZE, child_opts).await;
    child
        .image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(false))));

    let outcome = read(&child.image, 0, 0, 512).await;
    assert_eq!(outcome.result, Ok(512));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(child.image.in_flight_copyups(), 0);
    assert_eq!(child.store.mutations(), 0);
}

#[tokio::test]
async fn read_falls_through_when_parent_disappears() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;

    let (done, outcome) = oneshot::channel();
    let request = ObjectReadRequest::create_read(
        &child.image,
        0,
        0,
        512,
        vec![Extent::new(0, 512)],
        NOSNAP,
        false,
        OpFlags::empty(),
        done,
    );
    // the parent goes away between construction and the head miss
    child.image.set_parent(None, 0);
    request.send().await;

    let outcome = outcome.await.unwrap();
    assert_eq!(outcome.result, Err(Errno::ENOENT));
    assert!(outcome.data.is_empty());
}

#[tokio::test]
async fn full_object_write_without_parent_skips_the_guard() {
    let h = harness("img", opts());

    let data = vec![9_u8; OBJECT_SIZE as usize];
    assert_eq!(write(&h.image, 0, 0, data.clone()).await, Ok(0));

    assert_eq!(h.store.head(&h.image.object_name(0)), Some(data));
    // exactly one unguarded store write, no copy-up possible
    assert_eq!(h.store.mutations(), 1);
    assert_eq!(h.image.in_flight_copyups(), 0);
}

#[tokio::test]
async fn full_object_write_to_absent_clone_object_still_guards() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;

    let data = vec![9_u8; OBJECT_SIZE as usize];
    assert_eq!(write(&child.image, 0, 0, data.clone()).await, Ok(0));

    // guard miss, then the copy-up batch whose trailing full write wins
    assert_eq!(child.store.mutations(), 2);
    assert_eq!(child.store.head(&child.image.object_name(0)), Some(data));
    assert_eq!(child.image.in_flight_copyups(), 0);
}

#[tokio::test]
async fn partial_write_to_absent_clone_object_copies_up() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;
    let map = Arc::new(InMemoryObjectMap::new(8));
    child.image.set_object_map(Some(map.clone()));
    child
        .image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(true))));

    assert_eq!(write(&child.image, 0, 1024, vec![5_u8; 512]).await, Ok(0));

    assert_eq!(map.state(0), ObjectState::Exists);
    // the known-absent object goes straight to copy-up: one combined write
    assert_eq!(child.store.mutations(), 1);
    let mut expected = parent_bytes();
    expected[1024..1536].fill(5);
    assert_eq!(child.store.head(&child.image.object_name(0)), Some(expected));
    assert_eq!(child.image.in_flight_copyups(), 0);
}

#[tokio::test]
async fn guarded_write_without_object_map_copies_up_after_the_miss() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;

    assert_eq!(write(&child.image, 0, 1024, vec![5_u8; 512]).await, Ok(0));

    // the guarded attempt trips on ENOENT, then the copy-up write lands
    assert_eq!(child.store.mutations(), 2);
    let mut expected = parent_bytes();
    expected[1024..1536].fill(5);
    assert_eq!(child.store.head(&child.image.object_name(0)), Some(expected));
}

#[tokio::test]
async fn guarded_write_retries_plain_when_parent_disappears() {
    let (_parent, child) = seeded_clone(OBJECT_SIZE, opts()).await;

    let (done, outcome) = oneshot::channel();
    let request = ObjectWriteRequest::create_write(
        &child.image,
        0,
        1024,
        vec![5_u8; 512],
        &child.image.snapc(),
        OpFlags::empty(),
        done,
    );
    child.image.set_parent(None, 0);
    request.send().await;
    assert_eq!(outcome.await.unwrap(), Ok(0));

    // failed guarded attempt, then the plain retry; never a copy-up
    assert_eq!(child.store.mutations(), 2);
    assert_eq!(child.image.in_flight_copyups(), 0);
    let mut expected = vec![0_u8; 1536];
    expected[1024..1536].fill(5);
    assert_eq!(child.store.head(&child.image.object_name(0)), Some(expected));
}

#[tokio::test]
async fn write_then_read_roundtrips() {
    let h = harness("img", opts());
    let data = vec![42_u8; 1024];
    assert_eq!(write(&h.image, 3, 512, data.clone()).await, Ok(0));

    let outcome = read(&h.image, 3, 512, 1024).await;
    assert_eq!(outcome.result, Ok(1024));
    assert_eq!(outcome.data, data);

    // reads past the written tail come back short
    let outcome = read(&h.image, 3, 1024, 4096).await;
    assert_eq!(outcome.result, Ok(512));
}

#[tokio::test]
async fn sparse_read_reports_data_extents() {
    let h = harness("img", opts());
    assert_eq!(write(&h.image, 0, 0, vec![1_u8; 2048]).await, Ok(0));

    let (done, outcome) = oneshot::channel();
    ObjectReadRequest::create_read(
        &h.image,
        0,
        1024,
        2048,
        vec![Extent::new(0, 2048)],
        NOSNAP,
        true,
        OpFlags::empty(),
        done,
    )
    .send()
    .await;
    let outcome = outcome.await.unwrap();
    assert_eq!(outcome.result, Ok(1024));
    assert_eq!(outcome.extent_map, vec![Extent::new(1024, 1024)]);
    assert_eq!(outcome.data, vec![1_u8; 1024]);
}

#[tokio::test]
async fn snapshot_reads_see_preserved_data() {
    let h = harness("img", opts());
    let before = vec![1_u8; OBJECT_SIZE as usize];
    let after = vec![2_u8; OBJECT_SIZE as usize];

    assert_eq!(write(&h.image, 0, 0, before.clone()).await, Ok(0));
    h.image.add_snap(1).unwrap();
    assert_eq!(write(&h.image, 0, 0, after.clone()).await, Ok(0));

    let outcome = read_at(&h.image, 0, 0, OBJECT_SIZE, 1).await;
    assert_eq!(outcome.result, Ok(OBJECT_SIZE));
    assert_eq!(outcome.data, before);

    let outcome = read(&h.image, 0, 0, OBJECT_SIZE).await;
    assert_eq!(outcome.data, after);
}

#[tokio::test]
async fn zero_overwrites_a_range_with_zeros() {
    let h = harness("img", opts());
    assert_eq!(write(&h.image, 0, 0, vec![7_u8; 2048]).await, Ok(0));
    assert_eq!(zero(&h.image, 0, 512, 1024).await, Ok(0));

    let head = h.store.head(&h.image.object_name(0)).unwrap();
    assert_eq!(&head[..512], &[7_u8; 512][..]);
    assert_eq!(&head[512..1536], &[0_u8; 1024][..]);
    assert_eq!(&head[1536..], &[7_u8; 512][..]);
}

#[tokio::test]
async fn truncate_of_known_absent_object_is_a_deferred_noop() {
    let h = harness("img", opts());
    h.image
        .set_object_map(Some(Arc::new(InMemoryObjectMap::new(8))));
    h.image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(true))));

    assert_eq!(truncate(&h.image, 0, 100).await, Ok(0));
    assert_eq!(h.store.mutations(), 0);
    assert!(!h.store.exists(&h.image.object_name(0)));
}

#[tokio::test]
async fn truncate_to_zero_finalizes_the_object_map() {
    let h = harness("img", opts());
    assert_eq!(write(&h.image, 0, 0, vec![7_u8; 2048]).await, Ok(0));

    let map = Arc::new(InMemoryObjectMap::new(8));
    map.set_state(0, ObjectState::Exists);
    h.image.set_object_map(Some(map.clone()));
    h.image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(true))));

    assert_eq!(truncate(&h.image, 0, 0).await, Ok(0));
    assert_eq!(map.state(0), ObjectState::Nonexistent);
    assert_eq!(h.store.head(&h.image.object_name(0)), Some(Vec::new()));
}

#[tokio::test]
async fn remove_on_absent_object_hides_enoent() {
    let h = harness("img", opts());
    h.image.add_snap(1).unwrap();

    assert_eq!(remove(&h.image, 0).await, Ok(0));
    assert_eq!(h.store.mutations(), 1);
}

#[tokio::test]
async fn remove_preserves_snapshot_data_and_finalizes_the_map() {
    let h = harness("img", opts());
    let data = vec![3_u8; 1024];
    assert_eq!(write(&h.image, 0, 0, data.clone()).await, Ok(0));

    let map = Arc::new(InMemoryObjectMap::new(8));
    map.set_state(0, ObjectState::Exists);
    h.image.set_object_map(Some(map.clone()));
    h.image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(true))));
    h.image.add_snap(1).unwrap();

    assert_eq!(remove(&h.image, 0).await, Ok(0));

    let oid = h.image.object_name(0);
    assert!(!h.store.exists(&oid));
    assert_eq!(map.state(0), ObjectState::Nonexistent);
    // the snapshot still sees the pre-remove data
    let snap_data = h.store.read(&oid, 1, 0, 1024, OpFlags::empty()).await.unwrap();
    assert_eq!(snap_data, data);
}

struct FailingMap;

#[async_trait]
impl ObjectMap for FailingMap {
    fn may_exist(&self, _object_no: u64) -> bool {
        true
    }

    fn update_required(&self, _object_no: u64, _new_state: ObjectState) -> bool {
        true
    }

    async fn update(
        &self,
        _object_no: u64,
        _new_state: ObjectState,
        _expected: Option<ObjectState>,
    ) -> Result<(), Errno> {
        Err(Errno::EIO)
    }
}

#[tokio::test]
async fn pre_update_failure_aborts_before_any_write() {
    let h = harness("img", opts());
    h.image.set_object_map(Some(Arc::new(FailingMap)));
    h.image
        .set_exclusive_lock(Some(Arc::new(FixedLockOwner::new(true))));

    assert_eq!(write(&h.image, 0, 0, vec![1_u8; 512]).await, Err(Errno::EIO));
    assert_eq!(h.store.mutations(), 0);
}

struct FailStore;

#[async_trait]
impl ObjectStore for FailStore {
    async fn read(
        &self,
        _oid: &str,
        _snap_id: SnapId,
        _offset: u64,
        _len: u64,
        _flags: OpFlags,
    ) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOENT)
    }

    async fn sparse_read(
        &self,
        _oid: &str,
        _snap_id: SnapId,
        _offset: u64,
        _len: u64,
        _flags: OpFlags,
    ) -> Result<(Vec<Extent>, Vec<u8>), Errno> {
        Err(Errno::ENOENT)
    }

    async fn mutate(
        &self,
        _oid: &str,
        _batch: WriteBatch,
        _snapc: &SnapContext,
    ) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }
}

#[tokio::test]
async fn guarded_write_error_is_terminal() {
    init_logging();
    let parent = harness("parent", opts());
    assert_eq!(write(&parent.image, 0, 0, parent_bytes()).await, Ok(0));

    let child = Image::new("child", opts(), Arc::new(FailStore)).unwrap();
    child.set_parent(Some(parent.image.clone()), OBJECT_SIZE);

    assert_eq!(
        write(&child, 0, 1024, vec![5_u8; 512]).await,
        Err(Errno::EROFS)
    );
    assert_eq!(child.in_flight_copyups(), 0);
}

#[tokio::test]
async fn image_read_assembles_striped_extents_and_zero_fills() {
    let striped = ImageOptions {
        object_size_bytes: OBJECT_SIZE,
        stripe_unit_bytes: 1024,
        stripe_count: 2,
        ..ImageOptions::default()
    };
    let h = harness("img", striped);
    // object 0 fully written, object 1 left absent
    assert_eq!(
        write(&h.image, 0, 0, vec![0xAA_u8; OBJECT_SIZE as usize]).await,
        Ok(0)
    );

    let data = Image::aio_read(
        &h.image,
        NOSNAP,
        vec![Extent::new(0, OBJECT_SIZE)],
        OpFlags::empty(),
    )
    .await
    .unwrap();
    assert_eq!(data.len(), OBJECT_SIZE as usize);
    assert_eq!(&data[..1024], &[0xAA_u8; 1024][..]);
    assert_eq!(&data[1024..2048], &[0_u8; 1024][..]);
    assert_eq!(&data[2048..3072], &[0xAA_u8; 1024][..]);
    assert_eq!(&data[3072..], &[0_u8; 1024][..]);

    // stripe-unit-aligned sub-range starting in object 1
    let data = Image::aio_read(&h.image, NOSNAP, vec![Extent::new(1024, 2048)], OpFlags::empty())
        .await
        .unwrap();
    assert_eq!(&data[..1024], &[0_u8; 1024][..]);
    assert_eq!(&data[1024..], &[0xAA_u8; 1024][..]);
}
