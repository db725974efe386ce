//! Slab structure definition and in-slab layout helpers.

use core::ptr::null_mut;
use crate::mm::kmem::KmemCache;
use crate::util::bit;


/// Header of one slab: a single buddy allocation of the cache's
/// `slab_order`, carved into `header | inuse bitmap | color padding |
/// object array`.
///
/// The header sits at the base of the block. Because the buddy hands out
/// blocks aligned to their own size, masking any object pointer down to the
/// slab block size recovers this header in O(1); `cache` then authenticates
/// the result.
#[repr(C)]
pub struct Slab {
    /// Owning cache.
    pub cache: *mut KmemCache,
    /// Inuse bitmap, directly after the header. Bit `i` set means slot `i`
    /// is handed out.
    pub bitmap: *mut u8,
    /// First object slot. Includes the color offset of this slab, so it is
    /// stored rather than recomputed.
    pub objs: *mut u8,
    /// Free slots left in this slab.
    pub free_count: usize,
    /// Buddy order of the backing block.
    pub order: usize,
    /// Index of the next slot to hand out; `-1` means scan the bitmap.
    pub next_free: i32,
    /// Link in one of the owning cache's three lists.
    pub next: *mut Slab,
}

sa::const_assert!(core::mem::size_of::<Slab>() % 8 == 0);

impl Slab {
    /// Address of object slot `index`.
    #[inline(always)]
    pub fn obj(&self, obj_size: usize, index: usize) -> *mut u8 {
        unsafe { self.objs.add(index * obj_size) }
    }

    /// Find the first clear bitmap bit, scanning `count` slots starting at
    /// `start` and wrapping. Returns `-1` when every slot is taken.
    pub fn find_free_from(&self, count: usize, start: usize) -> i32 {
        for k in 0..count {
            let index = (start + k) % count;
            if !bit::test_bit_array(self.bitmap, index) {
                return index as i32;
            }
        }
        -1
    }
}

/// Write the embedded free-slot chain: slot `i` begins with the index of
/// the following free slot, the last slot holds `-1`. A configured
/// constructor overwrites these words immediately afterwards, which is why
/// allocation trusts the bitmap rather than the chain.
pub fn thread_free_chain(objs: *mut u8, obj_size: usize, count: usize) {
    for i in 0..count {
        let next = if i + 1 == count { -1i32 } else { (i + 1) as i32 };
        unsafe {
            (objs.add(i * obj_size) as *mut i32).write(next);
        }
    }
}

/// List push helper: slabs live on exactly one of a cache's three lists.
#[inline]
pub fn push_slab(list: &mut *mut Slab, slab: *mut Slab) {
    unsafe {
        (*slab).next = *list;
    }
    *list = slab;
}

/// Remove `slab` from `list`. The slab must be on that list.
pub fn unlink_slab(list: &mut *mut Slab, slab: *mut Slab) {
    let mut pp: *mut *mut Slab = list;
    unsafe {
        while !(*pp).is_null() {
            if *pp == slab {
                *pp = (*slab).next;
                (*slab).next = null_mut();
                return;
            }
            pp = core::ptr::addr_of_mut!((**pp).next);
        }
    }
    debug_assert!(false, "slab missing from its expected list");
}

/// Number of slabs on a list.
pub fn count_slabs(mut slab: *const Slab) -> usize {
    let mut count = 0usize;
    while !slab.is_null() {
        count += 1;
        slab = unsafe { (*slab).next };
    }
    count
}
