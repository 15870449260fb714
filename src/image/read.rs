use futures::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;

use super::*;
use crate::io::ObjectReadRequest;
use crate::striper::{self, ObjectExtent};
use crate::types::{total_len, Extent};

impl Image {
    /// Read image-coordinate `extents` into one buffer, extent order.
    ///
    /// The range is split into per-object read requests which run
    /// concurrently; absent objects and short tails read as zeros. This is
    /// the entry point used by child images reading through their parent
    /// link and by copy-up jobs materializing parent data.
    pub fn aio_read(
        image: &Arc<Image>,
        snap_id: SnapId,
        extents: Vec<Extent>,
        op_flags: OpFlags,
    ) -> BoxFuture<'static, Result<Vec<u8>, Errno>> {
        let image = Arc::clone(image);
        async move { read_extents(image, snap_id, extents, op_flags).await }.boxed()
    }
}

async fn read_extents(
    image: Arc<Image>,
    snap_id: SnapId,
    extents: Vec<Extent>,
    op_flags: OpFlags,
) -> Result<Vec<u8>, Errno> {
    let mut buf = vec![0_u8; total_len(&extents) as usize];

    let mut object_extents: Vec<ObjectExtent> = Vec::new();
    let mut buf_base = 0_u64;
    for extent in &extents {
        let mut mapped = striper::file_to_extents(image.layout(), extent.offset, extent.len);
        for object_extent in &mut mapped {
            for buffer_extent in &mut object_extent.buffer_extents {
                buffer_extent.offset += buf_base;
            }
        }
        object_extents.extend(mapped);
        buf_base += extent.len;
    }

    let mut pending = Vec::with_capacity(object_extents.len());
    for object_extent in object_extents {
        let (done, outcome) = oneshot::channel();
        let request = ObjectReadRequest::create_read(
            &image,
            object_extent.object_no,
            object_extent.offset,
            object_extent.len,
            object_extent.buffer_extents.clone(),
            snap_id,
            false,
            op_flags,
            done,
        );
        tokio::spawn(request.send());
        pending.push((object_extent, outcome));
    }

    for (object_extent, outcome) in pending {
        let outcome = outcome.await.map_err(|_| Errno::EIO)?;
        match outcome.result {
            Ok(_) => {
                let mut src = 0_usize;
                for buffer_extent in &object_extent.buffer_extents {
                    let want = buffer_extent.len as usize;
                    let have = want.min(outcome.data.len().saturating_sub(src));
                    let dst = buffer_extent.offset as usize;
                    buf[dst..dst + have].copy_from_slice(&outcome.data[src..src + have]);
                    src += want;
                }
            }
            // absent objects read as zeros at the image level
            Err(Errno::ENOENT) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(buf)
}
