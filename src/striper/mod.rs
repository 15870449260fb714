//! RAID-0 striping arithmetic: mapping byte ranges between image coordinates
//! and the fixed-size backing objects they land in.
//!
//! An image is carved into stripe units; `stripe_count` consecutive units form
//! a stripe, and each object holds `object_size / stripe_unit` units of one
//! stripe column. With `stripe_count == 1` the mapping degenerates to
//! `file_offset = object_no * object_size + offset_in_object`.

use crate::types::Extent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub object_size: u64,
    pub stripe_unit: u64,
    pub stripe_count: u64,
}

impl Layout {
    pub fn simple(object_size: u64) -> Self {
        Self {
            object_size,
            stripe_unit: object_size,
            stripe_count: 1,
        }
    }

    fn stripes_per_object(&self) -> u64 {
        self.object_size / self.stripe_unit
    }
}

/// One object's share of an image byte range. `buffer_extents` locates the
/// object bytes within the originating request's buffer, in object-offset
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    pub object_no: u64,
    pub offset: u64,
    pub len: u64,
    pub buffer_extents: Vec<Extent>,
}

/// Map an image byte range onto the objects backing it.
pub fn file_to_extents(layout: &Layout, offset: u64, len: u64) -> Vec<ObjectExtent> {
    let mut out: Vec<ObjectExtent> = Vec::new();
    if len == 0 {
        return out;
    }

    let su = layout.stripe_unit;
    let stripes_per_object = layout.stripes_per_object();
    let mut cur = offset;
    let end = offset + len;

    while cur < end {
        let blockno = cur / su;
        let stripeno = blockno / layout.stripe_count;
        let stripepos = blockno % layout.stripe_count;
        let objectsetno = stripeno / stripes_per_object;
        let object_no = objectsetno * layout.stripe_count + stripepos;

        let block_off = cur % su;
        let piece = (su - block_off).min(end - cur);
        let off_in_object = (stripeno % stripes_per_object) * su + block_off;
        let buf_off = cur - offset;

        if let Some(last) = out.last_mut() {
            let buffer_tail = last
                .buffer_extents
                .last()
                .map(Extent::end)
                .unwrap_or_default();
            if last.object_no == object_no
                && last.offset + last.len == off_in_object
                && buffer_tail == buf_off
            {
                last.len += piece;
                if let Some(tail) = last.buffer_extents.last_mut() {
                    tail.len += piece;
                }
                cur += piece;
                continue;
            }
        }

        out.push(ObjectExtent {
            object_no,
            offset: off_in_object,
            len: piece,
            buffer_extents: vec![Extent::new(buf_off, piece)],
        });
        cur += piece;
    }

    out
}

/// Map a byte range of one object back onto image byte ranges, merging
/// contiguous pieces.
pub fn extent_to_file(layout: &Layout, object_no: u64, offset: u64, len: u64) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::new();
    if len == 0 {
        return out;
    }

    let su = layout.stripe_unit;
    let stripes_per_object = layout.stripes_per_object();
    let objectsetno = object_no / layout.stripe_count;
    let stripepos = object_no % layout.stripe_count;
    let mut cur = offset;
    let end = offset + len;

    while cur < end {
        let block_in_object = cur / su;
        let off_in_block = cur % su;
        let stripeno = objectsetno * stripes_per_object + block_in_object;
        let blockno = stripeno * layout.stripe_count + stripepos;
        let file_off = blockno * su + off_in_block;
        let piece = (su - off_in_block).min(end - cur);

        match out.last_mut() {
            Some(last) if last.end() == file_off => last.len += piece,
            _ => out.push(Extent::new(file_off, piece)),
        }
        cur += piece;
    }

    out
}

/// Clamp image-coordinate extents to the parent-overlap prefix, dropping
/// ranges that fall entirely beyond it. Returns the surviving byte count.
pub fn prune_to_overlap(extents: &mut Vec<Extent>, overlap: u64) -> u64 {
    extents.retain_mut(|extent| {
        if extent.offset >= overlap {
            return false;
        }
        extent.len = extent.len.min(overlap - extent.offset);
        extent.len > 0
    });
    extents.iter().map(|extent| extent.len).sum()
}
