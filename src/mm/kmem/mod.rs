//! Object caches and the small-buffer allocation interface on top of the
//! buddy allocator.
//!
//! A **cache** ([`KmemCache`]) serves objects of one fixed size, optionally
//! running a constructor/destructor pair on them. Backing memory comes from
//! the buddy in slabs of `2^slab_order` pages laid out as:
//!
//! ```text
//! +--------+--------------+---------+-------+-------+-----+
//! | header | inuse bitmap | color   | obj 0 | obj 1 | ... |
//! |        |              | padding |       |       |     |
//! +--------+--------------+---------+-------+-------+-----+
//! ```
//!
//! Each cache keeps its slabs on three lists (`partial`, `full`, `free`)
//! keyed by `free_count`, and each slab is located from any of its object
//! pointers by masking the pointer down to the slab block size. The
//! per-slab color offset staggers the object arrays of sibling slabs to
//! spread them across cache lines.
//!
//! The small-buffer interface ([`KmemState::kmalloc`] /
//! [`KmemState::kfree`]) routes byte-sized requests to power-of-two
//! size-class caches (32 B .. 128 KiB) created lazily under the registry
//! lock. `kfree` carries no back-pointer: it probes the live size-class
//! caches by aligning the pointer down per candidate slab size and testing
//! the owning-cache word, first match wins. A probe therefore reads memory
//! derived from the argument; passing a pointer that was never returned by
//! `kmalloc` is tolerated (logged and dropped) but not validated further.
//!
//! Locking: one spin lock per cache around every cache operation, one
//! registry lock around the cache list and the lazy size-class creation.
//! Cache locks may be held across buddy calls (the buddy lock is leaf
//! level); the registry lock is never held together with a cache lock.

mod slab;

use core::fmt::{self, Write as FmtWrite};
use core::mem::size_of;
use core::ptr::{addr_of_mut, null_mut};
use log::{info, warn};
use crate::base::sync::SpinLockPure;
use crate::mm::buddy::BuddyAllocator;
use crate::mm::{PAGE_ORDER, PAGE_SIZE};
use crate::util::align::{align_down, align_up_by, get_order};
use crate::util::bit;
use self::slab::{count_slabs, push_slab, thread_free_chain, unlink_slab, Slab};


/// Object constructor: runs on every slot when a slab is created and again
/// on each free, so clients always receive the constructed pattern.
pub type ObjCtor = fn(*mut u8);
/// Object destructor: runs on live objects during cache destruction.
pub type ObjDtor = fn(*mut u8);

/// Error codes readable through `cache_error`. Reading clears the code.
pub mod cache_err {
    /// No error recorded.
    pub const OK: i32 = 0;
    /// The buddy could not back a new slab or descriptor.
    pub const NO_MEM: i32 = 1;
    /// Freed pointer does not map to an object slot of its slab.
    pub const BAD_INDEX: i32 = 2;
    /// Freed pointer lives in a slab owned by a different cache.
    pub const WRONG_CACHE: i32 = 3;
    /// Freed slot was not allocated (double free).
    pub const NOT_ALLOCATED: i32 = 4;
}

const CACHE_NAME_LEN: usize = 32;

/// Prefer slab orders that hold at least this many objects.
const MIN_OBJS_PER_SLAB: usize = 4;
/// Largest order tried while aiming for [`MIN_OBJS_PER_SLAB`].
const SLAB_PREFERRED_MAX_ORDER: usize = 10;
/// Hard cap on the slab order when settling for a single object.
const SLAB_MAX_ORDER: usize = 14;

/// Small-buffer size classes: `2^5` .. `2^17` bytes (32 B .. 128 KiB).
pub const SMALL_BUF_MIN_ORDER: usize = 5;
pub const SMALL_BUF_MAX_ORDER: usize = 17;
pub const NUM_SMALL_BUF_SIZES: usize = SMALL_BUF_MAX_ORDER - SMALL_BUF_MIN_ORDER + 1;


/// Metadata of one object cache. The descriptor itself lives in an order-0
/// buddy block obtained at creation time.
#[repr(C)]
pub struct KmemCache {
    name: [u8; CACHE_NAME_LEN],
    /// Client size rounded up to 8 bytes.
    obj_size: usize,
    ctor: Option<ObjCtor>,
    dtor: Option<ObjDtor>,
    lock: SpinLockPure,
    partial_slabs: *mut Slab,
    full_slabs: *mut Slab,
    free_slabs: *mut Slab,
    obj_per_slab: usize,
    slab_order: usize,
    slab_count: usize,
    total_objs: usize,
    free_objs: usize,
    /// Arms the shrink gate: set when the cache grows after it has been
    /// shrunk before, cleared by the gated shrink call.
    grown_since_shrink: bool,
    shrunk_once: bool,
    error: i32,
    /// Colors available given the residual slab bytes, in 8-byte units.
    color_max: usize,
    color_next: usize,
    alloc_count: u64,
    free_count_total: u64,
    /// Buddy instance backing this cache's slabs and descriptor.
    buddy: *mut BuddyAllocator,
    /// Link in the owning registry's cache list.
    next: *mut KmemCache,
}

sa::const_assert!(size_of::<KmemCache>() <= PAGE_SIZE);

// SAFETY: all mutation happens under the per-cache lock; list membership
// changes only there.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

impl KmemCache {
    /// Allocate one object. Returns null when the backing buddy cannot
    /// grow the cache (the error code is set to [`cache_err::NO_MEM`]).
    pub fn alloc(&mut self) -> *mut u8 {
        let flags = self.lock.lock_irq_save();
        let obj = self.alloc_locked();
        self.lock.unlock_irq_restore(flags);
        obj
    }

    /// Return `obj` to the cache. Structural faults (foreign pointer,
    /// double free, out-of-range slot) set the cache error code and leave
    /// the cache untouched.
    pub fn free(&mut self, obj: *mut u8) {
        if obj.is_null() {
            return;
        }
        let flags = self.lock.lock_irq_save();
        self.free_locked(obj);
        self.lock.unlock_irq_restore(flags);
    }

    /// Release every wholly-free slab back to the buddy and return the page
    /// count released. Returns 0 without freeing when the cache has grown
    /// since the previous shrink, so a cache that keeps bouncing between
    /// needing and dropping slabs is not emptied mid-bounce.
    pub fn shrink(&mut self) -> usize {
        let flags = self.lock.lock_irq_save();
        let pages = self.shrink_locked();
        self.lock.unlock_irq_restore(flags);
        pages
    }

    /// Read and clear the last error code.
    pub fn error(&mut self) -> i32 {
        let flags = self.lock.lock_irq_save();
        let err = self.error;
        self.error = cache_err::OK;
        self.lock.unlock_irq_restore(flags);
        err
    }

    /// Log the cache geometry, list population and counters.
    pub fn info(&mut self) {
        let flags = self.lock.lock_irq_save();
        let partial = count_slabs(self.partial_slabs);
        let full = count_slabs(self.full_slabs);
        let free = count_slabs(self.free_slabs);
        info!("cache '{}': objsize {} order {} perslab {} color {}/{}",
            self.name(), self.obj_size, self.slab_order, self.obj_per_slab,
            self.color_next, self.color_max);
        info!("    slabs {} (partial {} full {} free {}) objs {}/{} allocs {} frees {} err {}",
            self.slab_count, partial, full, free,
            self.free_objs, self.total_objs,
            self.alloc_count, self.free_count_total, self.error);
        self.lock.unlock_irq_restore(flags);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(CACHE_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<non-utf8>")
    }

    #[inline(always)]
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    #[inline(always)]
    pub fn obj_per_slab(&self) -> usize {
        self.obj_per_slab
    }

    #[inline(always)]
    pub fn slab_order(&self) -> usize {
        self.slab_order
    }

    #[inline(always)]
    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    #[inline(always)]
    pub fn total_objs(&self) -> usize {
        self.total_objs
    }

    #[inline(always)]
    pub fn free_objs(&self) -> usize {
        self.free_objs
    }

    #[inline(always)]
    pub fn alloc_count(&self) -> u64 {
        self.alloc_count
    }

    #[inline(always)]
    pub fn freed_count(&self) -> u64 {
        self.free_count_total
    }

    /// Snapshot of the (partial, full, free) list lengths.
    pub fn list_lengths(&self) -> (usize, usize, usize) {
        (count_slabs(self.partial_slabs),
         count_slabs(self.full_slabs),
         count_slabs(self.free_slabs))
    }

    //////////////////// locked bodies /////////////////////////

    fn alloc_locked(&mut self) -> *mut u8 {
        let mut slab = self.partial_slabs;
        if slab.is_null() {
            if !self.free_slabs.is_null() {
                slab = self.free_slabs;
                unlink_slab(&mut self.free_slabs, slab);
                push_slab(&mut self.partial_slabs, slab);
            } else {
                slab = self.grow();
                if slab.is_null() {
                    return null_mut();
                }
                push_slab(&mut self.partial_slabs, slab);
            }
        }

        let s = unsafe { &mut *slab };
        let mut index = s.next_free;
        if index < 0 {
            index = s.find_free_from(self.obj_per_slab, 0);
        }
        if index < 0 {
            debug_assert!(false, "slab on partial list has no free slot");
            return null_mut();
        }
        let index = index as usize;

        bit::set_bit_array(s.bitmap, index);
        s.free_count -= 1;
        self.free_objs -= 1;
        self.alloc_count += 1;
        // Refresh the hint with a bounded bitmap scan. The embedded chain
        // word of a slot may hold constructor output by now, so it cannot
        // be trusted as a link.
        s.next_free = s.find_free_from(self.obj_per_slab, index + 1);

        if s.free_count == 0 {
            unlink_slab(&mut self.partial_slabs, slab);
            push_slab(&mut self.full_slabs, slab);
        }

        s.obj(self.obj_size, index)
    }

    fn free_locked(&mut self, obj: *mut u8) {
        let p = obj as usize;
        let slab = align_down(p, PAGE_ORDER + self.slab_order) as *mut Slab;
        if unsafe { (*slab).cache } != self as *mut KmemCache {
            warn!("[kmem] cache '{}': foreign pointer {:p} freed", self.name(), obj);
            self.error = cache_err::WRONG_CACHE;
            return;
        }

        let s = unsafe { &mut *slab };
        debug_assert_eq!(s.order, self.slab_order);
        let base = s.objs as usize;
        let index = (p.wrapping_sub(base)) / self.obj_size;
        if p < base || index >= self.obj_per_slab {
            warn!("[kmem] cache '{}': pointer {:p} outside the object array", self.name(), obj);
            self.error = cache_err::BAD_INDEX;
            return;
        }
        if !bit::test_bit_array(s.bitmap, index) {
            warn!("[kmem] cache '{}': double free of slot {}", self.name(), index);
            self.error = cache_err::NOT_ALLOCATED;
            return;
        }

        let was_full = s.free_count == 0;
        bit::clear_bit_array(s.bitmap, index);
        s.free_count += 1;
        self.free_objs += 1;
        self.free_count_total += 1;
        s.next_free = if s.next_free < 0 {
            index as i32
        } else {
            s.next_free.min(index as i32)
        };

        // Restore the constructed pattern so the next owner of this slot
        // sees it fresh.
        if let Some(ctor) = self.ctor {
            ctor(obj);
        }

        if s.free_count == self.obj_per_slab {
            let list = if was_full { &mut self.full_slabs } else { &mut self.partial_slabs };
            unlink_slab(list, slab);
            push_slab(&mut self.free_slabs, slab);
        } else if was_full {
            unlink_slab(&mut self.full_slabs, slab);
            push_slab(&mut self.partial_slabs, slab);
        }

        debug_assert_eq!(
            s.free_count,
            self.obj_per_slab - bit::count_ones_array(s.bitmap, self.obj_per_slab)
        );
    }

    fn shrink_locked(&mut self) -> usize {
        if self.grown_since_shrink {
            self.grown_since_shrink = false;
            return 0;
        }

        let buddy = unsafe { &mut *self.buddy };
        let mut pages = 0usize;
        while !self.free_slabs.is_null() {
            let slab = self.free_slabs;
            self.free_slabs = unsafe { (*slab).next };
            buddy.free(slab as usize, self.slab_order);
            pages += 1usize << self.slab_order;
            self.slab_count -= 1;
            self.total_objs -= self.obj_per_slab;
            self.free_objs -= self.obj_per_slab;
        }
        self.shrunk_once = true;
        pages
    }

    /// Build one new slab from the buddy: header, zeroed bitmap, colored
    /// object array, embedded free chain, then one constructor pass.
    fn grow(&mut self) -> *mut Slab {
        debug_assert!(self.lock.is_locked());
        let buddy = unsafe { &mut *self.buddy };
        let addr = match buddy.alloc(self.slab_order) {
            Some(a) => a,
            None => {
                self.error = cache_err::NO_MEM;
                return null_mut();
            }
        };
        // The O(1) owner lookup masks object pointers down to the block
        // size, so the block must sit on its own-size boundary.
        debug_assert_eq!(addr & ((PAGE_SIZE << self.slab_order) - 1), 0);

        let bitmap_bytes = (self.obj_per_slab + 7) / 8;
        let bitmap = (addr + size_of::<Slab>()) as *mut u8;
        let color = self.color_next * 8;
        self.color_next = (self.color_next + 1) % (self.color_max + 1);
        let objs = (align_up_by(addr + size_of::<Slab>() + bitmap_bytes, 8) + color) as *mut u8;

        let slab = addr as *mut Slab;
        unsafe {
            slab.write(Slab {
                cache: self as *mut KmemCache,
                bitmap,
                objs,
                free_count: self.obj_per_slab,
                order: self.slab_order,
                next_free: 0,
                next: null_mut(),
            });
            bitmap.write_bytes(0, bitmap_bytes);
            thread_free_chain(objs, self.obj_size, self.obj_per_slab);
            if let Some(ctor) = self.ctor {
                for i in 0..self.obj_per_slab {
                    ctor(objs.add(i * self.obj_size));
                }
            }
        }

        self.slab_count += 1;
        self.total_objs += self.obj_per_slab;
        self.free_objs += self.obj_per_slab;
        if self.shrunk_once {
            self.grown_since_shrink = true;
        }
        slab
    }

    /// Hand every slab back to the buddy. Objects still held by clients are
    /// torn down through the destructor first; the caller guarantees nobody
    /// dereferences them afterwards.
    fn release_slabs(&mut self) {
        debug_assert!(self.lock.is_locked());
        if let Some(dtor) = self.dtor {
            for head in [self.partial_slabs, self.full_slabs] {
                let mut slab = head;
                while !slab.is_null() {
                    let s = unsafe { &*slab };
                    for i in 0..self.obj_per_slab {
                        if bit::test_bit_array(s.bitmap, i) {
                            dtor(s.obj(self.obj_size, i));
                        }
                    }
                    slab = s.next;
                }
            }
        }

        let buddy = unsafe { &mut *self.buddy };
        for head in [self.partial_slabs, self.full_slabs, self.free_slabs] {
            let mut slab = head;
            while !slab.is_null() {
                let next = unsafe { (*slab).next };
                buddy.free(slab as usize, self.slab_order);
                slab = next;
            }
        }
        self.partial_slabs = null_mut();
        self.full_slabs = null_mut();
        self.free_slabs = null_mut();
        self.slab_count = 0;
        self.total_objs = 0;
        self.free_objs = 0;
    }
}


/// Slab-layer instance: the cache registry, the lazily created size-class
/// caches and the buddy every cache of this instance is backed by.
///
/// The kernel exposes one default instance through the `mm` module API;
/// further instances can be built over private buddies.
#[repr(C)]
pub struct KmemState {
    lock: SpinLockPure,
    caches: *mut KmemCache,
    small_buf: [*mut KmemCache; NUM_SMALL_BUF_SIZES],
    buddy: *mut BuddyAllocator,
}

// SAFETY: registry mutation happens under `lock`; `small_buf` entries are
// written once under it and only read afterwards.
unsafe impl Send for KmemState {}
unsafe impl Sync for KmemState {}

impl KmemState {
    pub const fn new() -> Self {
        Self {
            lock: SpinLockPure::new(),
            caches: null_mut(),
            small_buf: [null_mut(); NUM_SMALL_BUF_SIZES],
            buddy: null_mut(),
        }
    }

    /// Bind this instance to the buddy that will back all of its caches.
    pub fn init(&mut self, buddy: *mut BuddyAllocator) {
        self.buddy = buddy;
    }

    /// Create a cache named `name` for objects of `size` bytes. Returns
    /// null for a zero size, when no slab order fits a single object, or
    /// when the descriptor allocation fails.
    pub fn cache_create(&mut self, name: &str, size: usize,
                        ctor: Option<ObjCtor>, dtor: Option<ObjDtor>) -> *mut KmemCache {
        let flags = self.lock.lock_irq_save();
        let cache = self.cache_create_locked(name, size, ctor, dtor);
        self.lock.unlock_irq_restore(flags);
        cache
    }

    /// Tear the cache down: destructors run on live objects, every slab and
    /// the descriptor page return to the buddy, the registry entry goes
    /// away. The caller guarantees no concurrent users of the cache remain.
    pub fn cache_destroy(&mut self, cache: *mut KmemCache) {
        if cache.is_null() {
            return;
        }

        // Register unlink first: the registry lock and a cache lock are
        // never held together.
        let flags = self.lock.lock_irq_save();
        let mut pp: *mut *mut KmemCache = &mut self.caches;
        unsafe {
            while !(*pp).is_null() && *pp != cache {
                pp = addr_of_mut!((**pp).next);
            }
            if !(*pp).is_null() {
                *pp = (*cache).next;
            }
        }
        self.lock.unlock_irq_restore(flags);

        let c = unsafe { &mut *cache };
        let cflags = c.lock.lock_irq_save();
        c.release_slabs();
        c.lock.unlock_irq_restore(cflags);

        let buddy = unsafe { &mut *c.buddy };
        buddy.free(cache as usize, 0);
    }

    /// Allocate a small buffer of at least `size` bytes from the matching
    /// power-of-two size class. Null for `size == 0` or beyond the largest
    /// class.
    pub fn kmalloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let index = match small_buf_index(size) {
            Some(i) => i,
            None => {
                warn!("[kmem] kmalloc: {} byte(s) exceeds the largest size class", size);
                return null_mut();
            }
        };

        let mut cache = self.small_buf[index];
        if cache.is_null() {
            cache = self.create_small_buf_cache(index);
            if cache.is_null() {
                return null_mut();
            }
        }
        unsafe { (*cache).alloc() }
    }

    /// [`kmalloc`] followed by zeroing the requested bytes.
    ///
    /// [`kmalloc`]: Self::kmalloc
    pub fn kzalloc(&mut self, size: usize) -> *mut u8 {
        let ret = self.kmalloc(size);
        if !ret.is_null() {
            unsafe {
                ret.write_bytes(0, size);
            }
        }
        ret
    }

    /// Return a buffer obtained from [`kmalloc`] by locating its owning
    /// size-class cache through the aligned-header probe. A pointer no
    /// class recognizes is reported and dropped.
    ///
    /// [`kmalloc`]: Self::kmalloc
    pub fn kfree(&mut self, obj: *mut u8) {
        if obj.is_null() {
            return;
        }
        let p = obj as usize;
        for index in 0..NUM_SMALL_BUF_SIZES {
            // Entries are written once under the registry lock; reading a
            // stale null only means this class cannot match yet.
            let cache = self.small_buf[index];
            if cache.is_null() {
                continue;
            }
            let c = unsafe { &mut *cache };
            let candidate = align_down(p, PAGE_ORDER + c.slab_order) as *const Slab;
            if unsafe { (*candidate).cache } == cache {
                c.free(obj);
                return;
            }
        }
        warn!("[kmem] kfree: {:p} belongs to no size class", obj);
    }

    //////////////////// registry internals /////////////////////////

    fn cache_create_locked(&mut self, name: &str, size: usize,
                           ctor: Option<ObjCtor>, dtor: Option<ObjDtor>) -> *mut KmemCache {
        if size == 0 || self.buddy.is_null() {
            return null_mut();
        }

        let obj_size = align_up_by(size, 8);
        let slab_order = match choose_slab_order(obj_size) {
            Some(order) => order,
            None => return null_mut(),
        };
        let obj_per_slab = compute_obj_per_slab(obj_size, slab_order);

        let buddy = unsafe { &mut *self.buddy };
        let addr = match buddy.alloc(0) {
            Some(a) => a,
            None => return null_mut(),
        };

        let slab_bytes = PAGE_SIZE << slab_order;
        let overhead = align_up_by(size_of::<Slab>() + (obj_per_slab + 7) / 8, 8);
        let waste = slab_bytes - overhead - obj_per_slab * obj_size;

        let mut name_buf = [0u8; CACHE_NAME_LEN];
        for (dst, src) in name_buf.iter_mut().zip(name.bytes().take(CACHE_NAME_LEN - 1)) {
            *dst = src;
        }

        let cache = addr as *mut KmemCache;
        unsafe {
            cache.write(KmemCache {
                name: name_buf,
                obj_size,
                ctor,
                dtor,
                lock: SpinLockPure::new(),
                partial_slabs: null_mut(),
                full_slabs: null_mut(),
                free_slabs: null_mut(),
                obj_per_slab,
                slab_order,
                slab_count: 0,
                total_objs: 0,
                free_objs: 0,
                grown_since_shrink: false,
                shrunk_once: false,
                error: cache_err::OK,
                color_max: waste / 8,
                color_next: 0,
                alloc_count: 0,
                free_count_total: 0,
                buddy: self.buddy,
                next: self.caches,
            });
        }
        self.caches = cache;
        cache
    }

    /// Double-checked lazy creation of the `size-<bytes>` class cache.
    fn create_small_buf_cache(&mut self, index: usize) -> *mut KmemCache {
        let bytes = 1usize << (SMALL_BUF_MIN_ORDER + index);
        let flags = self.lock.lock_irq_save();
        let mut cache = self.small_buf[index];
        if cache.is_null() {
            let mut name = NameBuf::new();
            let _ = write!(name, "size-{}", bytes);
            cache = self.cache_create_locked(name.as_str(), bytes, None, None);
            self.small_buf[index] = cache;
        }
        self.lock.unlock_irq_restore(flags);
        cache
    }
}


/// Smallest size class holding `size` bytes, as an index into the class
/// table. `None` when `size` exceeds the largest class.
fn small_buf_index(size: usize) -> Option<usize> {
    if size > 1usize << SMALL_BUF_MAX_ORDER {
        return None;
    }
    let order = get_order(size.next_power_of_two()).max(SMALL_BUF_MIN_ORDER);
    Some(order - SMALL_BUF_MIN_ORDER)
}

/// Objects a slab of `order` pages can hold once the header and the inuse
/// bitmap are paid for. Starts from the headerless estimate and walks down
/// until header + bitmap + objects fit.
fn compute_obj_per_slab(obj_size: usize, order: usize) -> usize {
    let total = PAGE_SIZE << order;
    let hdr = align_up_by(size_of::<Slab>(), 8);
    if total <= hdr {
        return 0;
    }

    let mut n = (total - hdr) / obj_size;
    while n > 0 {
        let overhead = align_up_by(size_of::<Slab>() + (n + 7) / 8, 8);
        if overhead + n * obj_size <= total {
            break;
        }
        n -= 1;
    }
    n
}

/// Smallest order giving [`MIN_OBJS_PER_SLAB`] objects per slab, falling
/// back to the smallest order fitting a single object. `None` when even
/// [`SLAB_MAX_ORDER`] cannot hold one.
fn choose_slab_order(obj_size: usize) -> Option<usize> {
    for order in 0..=SLAB_PREFERRED_MAX_ORDER {
        if compute_obj_per_slab(obj_size, order) >= MIN_OBJS_PER_SLAB {
            return Some(order);
        }
    }
    for order in 0..=SLAB_MAX_ORDER {
        if compute_obj_per_slab(obj_size, order) >= 1 {
            return Some(order);
        }
    }
    None
}


/// Fixed-capacity name assembly for the generated size-class cache names.
struct NameBuf {
    buf: [u8; CACHE_NAME_LEN],
    len: usize,
}

impl NameBuf {
    fn new() -> Self {
        Self {
            buf: [0u8; CACHE_NAME_LEN],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Write for NameBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if self.len >= CACHE_NAME_LEN - 1 {
                break;
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::test_support::TestRegion;

    /// A buddy over a private aligned region plus a slab instance bound to
    /// it. Drop order keeps the region alive past the allocator structs.
    struct Arena {
        _region: TestRegion,
        buddy: Box<BuddyAllocator>,
        state: Box<KmemState>,
    }

    impl Arena {
        fn new(bytes: usize) -> Self {
            let region = TestRegion::new(bytes);
            let mut buddy = Box::new(BuddyAllocator::new());
            buddy.init(region.base(), region.end());
            let mut state = Box::new(KmemState::new());
            state.init(&mut *buddy as *mut BuddyAllocator);
            Self { _region: region, buddy, state }
        }
    }

    fn ctor_a5(obj: *mut u8) {
        unsafe {
            obj.write_bytes(0xA5, 7);
        }
    }

    #[test]
    fn create_rejects_degenerate_requests() {
        let mut arena = Arena::new(1024 * 1024);
        assert!(arena.state.cache_create("zero", 0, None, None).is_null());

        let mut unbound = KmemState::new();
        assert!(unbound.cache_create("unbound", 64, None, None).is_null());
    }

    #[test]
    fn cache_geometry_fits_the_slab() {
        let mut arena = Arena::new(1024 * 1024);
        let cache = arena.state.cache_create("t", 48, None, None);
        assert!(!cache.is_null());
        let c = unsafe { &mut *cache };

        assert_eq!(c.obj_size(), 48);
        assert_eq!(c.slab_order(), 0);
        assert!(c.obj_per_slab() >= MIN_OBJS_PER_SLAB);

        let overhead = align_up_by(size_of::<Slab>() + (c.obj_per_slab() + 7) / 8, 8);
        assert!(overhead + c.obj_per_slab() * c.obj_size() <= PAGE_SIZE << c.slab_order());
    }

    #[test]
    fn odd_sizes_align_to_eight_bytes() {
        let mut arena = Arena::new(1024 * 1024);
        let cache = arena.state.cache_create("odd", 7, None, None);
        assert_eq!(unsafe { (*cache).obj_size() }, 8);
    }

    #[test]
    fn saturation_rolls_partial_to_full_and_back() {
        let mut arena = Arena::new(4 * 1024 * 1024);
        let cache = arena.state.cache_create("t", 48, None, None);
        let c = unsafe { &mut *cache };
        let n = c.obj_per_slab();

        let mut objs = Vec::new();
        for _ in 0..n {
            let p = c.alloc();
            assert!(!p.is_null());
            objs.push(p);
        }
        assert_eq!(c.slab_count(), 1);
        assert_eq!(c.list_lengths(), (0, 1, 0), "first slab filled exactly once");

        objs.push(c.alloc());
        assert_eq!(c.slab_count(), 2, "overflow object allocates one new slab");
        assert_eq!(c.list_lengths(), (1, 1, 0));

        for p in objs.drain(..) {
            c.free(p);
        }
        assert_eq!(c.list_lengths(), (0, 0, 2));
        assert_eq!(c.free_objs(), c.total_objs());

        let freed = c.shrink();
        assert_eq!(freed, 2);
        assert_eq!(c.slab_count(), 0);
        assert_eq!(c.shrink(), 0);
    }

    #[test]
    fn constructor_pattern_survives_free_and_reuse() {
        let mut arena = Arena::new(4 * 1024 * 1024);
        let cache = arena.state.cache_create("c", 7, Some(ctor_a5 as ObjCtor), None);
        let c = unsafe { &mut *cache };

        let check = |p: *mut u8| {
            for i in 0..7 {
                assert_eq!(unsafe { p.add(i).read() }, 0xA5);
            }
        };

        let mut objs = Vec::new();
        for _ in 0..500 {
            let p = c.alloc();
            assert!(!p.is_null());
            check(p);
            objs.push(p);
        }

        // Clients may trash the slot; the free path reconstructs it.
        for &p in &objs {
            unsafe {
                p.write_bytes(0x11, 7);
            }
        }
        for p in objs.drain(..).rev() {
            c.free(p);
        }

        for _ in 0..500 {
            let p = c.alloc();
            check(p);
            objs.push(p);
        }
        for p in objs {
            c.free(p);
        }
    }

    #[test]
    fn small_buffers_route_to_their_size_class() {
        let mut arena = Arena::new(8 * 1024 * 1024);

        let a = arena.state.kmalloc(20);
        let b = arena.state.kmalloc(32);
        let big = arena.state.kmalloc(33);
        assert!(!a.is_null() && !b.is_null() && !big.is_null());

        let cache32 = arena.state.small_buf[0];
        let cache64 = arena.state.small_buf[1];
        assert!(!cache32.is_null() && !cache64.is_null());
        assert_eq!(unsafe { (*cache32).name() }, "size-32");
        assert_eq!(unsafe { (*cache64).name() }, "size-64");

        let owner = |p: *mut u8, order: usize| {
            let slab = align_down(p as usize, PAGE_ORDER + order) as *const Slab;
            unsafe { (*slab).cache }
        };
        assert_eq!(owner(a, unsafe { (*cache32).slab_order() }), cache32);
        assert_eq!(owner(b, unsafe { (*cache32).slab_order() }), cache32);
        assert_eq!(owner(big, unsafe { (*cache64).slab_order() }), cache64);

        let allocated = unsafe { (*cache32).total_objs() - (*cache32).free_objs() };
        assert_eq!(allocated, 2);
        arena.state.kfree(a);
        arena.state.kfree(b);
        arena.state.kfree(big);
        assert_eq!(unsafe { (*cache32).free_objs() }, unsafe { (*cache32).total_objs() });
        assert_eq!(unsafe { (*cache64).free_objs() }, unsafe { (*cache64).total_objs() });
    }

    #[test]
    fn kmalloc_bounds() {
        let mut arena = Arena::new(8 * 1024 * 1024);
        assert!(arena.state.kmalloc(0).is_null());
        assert!(arena.state.kmalloc((1 << SMALL_BUF_MAX_ORDER) + 1).is_null());

        let p = arena.state.kmalloc(1 << SMALL_BUF_MAX_ORDER);
        assert!(!p.is_null());
        arena.state.kfree(p);
    }

    #[test]
    fn kzalloc_zeroes_the_buffer() {
        let mut arena = Arena::new(1024 * 1024);
        let p = arena.state.kzalloc(100);
        assert!(!p.is_null());
        for i in 0..100 {
            assert_eq!(unsafe { p.add(i).read() }, 0);
        }
        arena.state.kfree(p);
    }

    #[test]
    fn kfree_of_a_foreign_pointer_is_dropped() {
        let mut arena = Arena::new(1024 * 1024);
        // Force one live size class so the probe loop actually runs.
        let p = arena.state.kmalloc(64);
        assert!(!p.is_null());

        let raw = arena.buddy.alloc(0).unwrap();
        unsafe {
            (raw as *mut u8).write_bytes(0, PAGE_SIZE);
        }
        arena.state.kfree((raw + 16) as *mut u8);

        // The probe must not have freed anything into the class cache.
        let cache64 = arena.state.small_buf[1];
        assert_eq!(unsafe { (*cache64).freed_count() }, 0);
        arena.state.kfree(p);
        arena.buddy.free(raw, 0);
    }

    #[test]
    fn double_free_sets_and_clears_the_error() {
        let mut arena = Arena::new(1024 * 1024);
        let cache = arena.state.cache_create("dbl", 32, None, None);
        let c = unsafe { &mut *cache };

        let p = c.alloc();
        c.free(p);
        assert_eq!(c.error(), cache_err::OK);

        c.free(p);
        assert_eq!(c.error(), cache_err::NOT_ALLOCATED);
        assert_eq!(c.error(), cache_err::OK, "error reads clear");
    }

    #[test]
    fn foreign_cache_free_is_rejected() {
        let mut arena = Arena::new(1024 * 1024);
        let ca = arena.state.cache_create("a", 32, None, None);
        let cb = arena.state.cache_create("b", 32, None, None);
        let (a, b) = unsafe { (&mut *ca, &mut *cb) };

        let p = a.alloc();
        b.free(p);
        assert_eq!(b.error(), cache_err::WRONG_CACHE);

        // The rightful owner still accepts it.
        a.free(p);
        assert_eq!(a.error(), cache_err::OK);
        assert_eq!(a.free_objs(), a.total_objs());
    }

    #[test]
    fn out_of_range_pointer_is_rejected() {
        let mut arena = Arena::new(1024 * 1024);
        let cache = arena.state.cache_create("rng", 32, None, None);
        let c = unsafe { &mut *cache };

        let p = c.alloc();
        // One byte before the object array of p's slab.
        let slab = align_down(p as usize, PAGE_ORDER + c.slab_order()) as *const Slab;
        let below = unsafe { ((*slab).objs as usize - 1) as *mut u8 };
        c.free(below);
        assert_eq!(c.error(), cache_err::BAD_INDEX);
        c.free(p);
    }

    #[test]
    fn bitmap_matches_free_counts() {
        let mut arena = Arena::new(4 * 1024 * 1024);
        let cache = arena.state.cache_create("bm", 24, None, None);
        let c = unsafe { &mut *cache };
        let n = c.obj_per_slab();

        let mut objs = Vec::new();
        for i in 0..(n + n / 2) {
            objs.push(c.alloc());
            if i % 3 == 0 {
                c.free(objs.swap_remove(i / 3));
            }
        }

        let mut seen_free = 0usize;
        for head in [c.partial_slabs, c.full_slabs, c.free_slabs] {
            let mut slab = head;
            while !slab.is_null() {
                let s = unsafe { &*slab };
                let used = bit::count_ones_array(s.bitmap, n);
                assert_eq!(s.free_count, n - used);
                seen_free += s.free_count;
                slab = s.next;
            }
        }
        assert_eq!(seen_free, c.free_objs());
        assert_eq!(c.total_objs(), c.slab_count() * n);
    }

    #[test]
    fn freed_low_slot_is_preferred_on_reuse() {
        let mut arena = Arena::new(1024 * 1024);
        let cache = arena.state.cache_create("hint", 64, None, None);
        let c = unsafe { &mut *cache };
        let n = c.obj_per_slab();

        let objs: Vec<_> = (0..n).map(|_| c.alloc()).collect();
        assert_eq!(c.list_lengths(), (0, 1, 0));

        c.free(objs[0]);
        c.free(objs[n - 1]);
        assert_eq!(c.alloc(), objs[0], "lowest freed slot first");
        assert_eq!(c.alloc(), objs[n - 1]);
        for p in objs {
            c.free(p);
        }
    }

    #[test]
    fn shrink_gate_arms_after_regrowth() {
        let mut arena = Arena::new(4 * 1024 * 1024);
        let cache = arena.state.cache_create("gate", 128, None, None);
        let c = unsafe { &mut *cache };

        let p = c.alloc();
        c.free(p);
        assert!(c.shrink() > 0, "first shrink releases the idle slab");

        // Regrowing after a shrink arms the gate for exactly one call.
        let p = c.alloc();
        c.free(p);
        assert_eq!(c.shrink(), 0);
        assert!(c.shrink() > 0);
        assert_eq!(c.shrink(), 0, "nothing left to release");
    }

    #[test]
    fn allocation_failure_sets_no_mem() {
        // 64 KiB region: the descriptor page fits, but the order-4 slab a
        // 16000-byte cache needs no longer does once the region is split.
        let mut arena = Arena::new(64 * 1024);
        let cache = arena.state.cache_create("big", 16000, None, None);
        assert!(!cache.is_null());
        let c = unsafe { &mut *cache };

        assert!(c.alloc().is_null());
        assert_eq!(c.error(), cache_err::NO_MEM);
        assert_eq!(c.error(), cache_err::OK);
    }

    #[test]
    fn destroy_returns_all_memory_to_the_buddy() {
        let mut arena = Arena::new(4 * 1024 * 1024);
        let before = arena.buddy.snapshot();

        static mut DTOR_RUNS: usize = 0;
        fn dtor(_obj: *mut u8) {
            unsafe {
                DTOR_RUNS += 1;
            }
        }
        unsafe {
            DTOR_RUNS = 0;
        }

        let cache = arena.state.cache_create("gone", 96, None, Some(dtor as ObjDtor));
        let c = unsafe { &mut *cache };
        let live = 10;
        let mut objs: Vec<_> = (0..live + 5).map(|_| c.alloc()).collect();
        for p in objs.drain(live..) {
            c.free(p);
        }

        arena.state.cache_destroy(cache);
        assert_eq!(unsafe { DTOR_RUNS }, live, "destructor covers live objects only");
        assert_eq!(arena.buddy.snapshot(), before);
        assert!(arena.state.caches.is_null());
    }

    #[test]
    fn size_class_mapping() {
        assert_eq!(small_buf_index(1), Some(0));
        assert_eq!(small_buf_index(32), Some(0));
        assert_eq!(small_buf_index(33), Some(1));
        assert_eq!(small_buf_index(1 << 17), Some(12));
        assert_eq!(small_buf_index((1 << 17) + 1), None);
    }
}
