//! Kernel physical memory management.
//!
//! Layering, bottom up:
//!
//! | Layer | Module | Role |
//! | ----- | ------ | ---- |
//! | buddy | [`buddy`] | power-of-two page blocks over a physical region |
//! | pages | [`kalloc`] | `kalloc`/`pgfree` front-end, deployment modes |
//! | slab  | [`kmem`] | object caches + `kmalloc` size classes |
//!
//! The allocators are explicit instances; this module owns the default
//! ones and exposes the C-flavoured kernel API over them. Boot code calls
//! [`kalloc::kinit`] with the physical range and then [`kmem_init`], after
//! which every layer is live.

pub mod buddy;
pub mod kalloc;
pub mod kmem;
#[cfg(all(feature = "global_alloc", not(test)))]
mod rust_alloc;

use core::ptr::{addr_of_mut, null_mut};
use self::kmem::{KmemCache, KmemState, ObjCtor, ObjDtor};


/// Order of page-size.
pub const PAGE_ORDER: usize = 12;
/// Page size.
pub const PAGE_SIZE: usize = 1 << 12;


/// The default slab instance the kernel API below operates on.
static mut KMEM: KmemState = KmemState::new();

#[inline]
fn kmem_state() -> &'static mut KmemState {
    unsafe { &mut *addr_of_mut!(KMEM) }
}

/// Initialize the default slab instance.
///
/// With the `slab_kernel` deployment the arguments are ignored and slabs
/// draw from the kernel-global buddy; otherwise a private buddy is brought
/// up over `[region, region + npages * PAGE_SIZE)` first.
pub fn kmem_init(region: usize, npages: usize) {
    let buddy = kalloc::bind_slab_buddy(region, npages);
    kmem_state().init(buddy);
}

/// Create an object cache on the default instance. See
/// [`KmemState::cache_create`].
pub fn kmem_cache_create(name: &str, size: usize,
                         ctor: Option<ObjCtor>, dtor: Option<ObjDtor>) -> *mut KmemCache {
    kmem_state().cache_create(name, size, ctor, dtor)
}

/// Allocate one object; null cache pointers yield null.
pub fn kmem_cache_alloc(cache: *mut KmemCache) -> *mut u8 {
    if cache.is_null() {
        return null_mut();
    }
    unsafe { (*cache).alloc() }
}

/// Return an object to its cache.
pub fn kmem_cache_free(cache: *mut KmemCache, obj: *mut u8) {
    if cache.is_null() {
        return;
    }
    unsafe {
        (*cache).free(obj);
    }
}

/// Release the cache's idle slabs; returns the page count given back.
pub fn kmem_cache_shrink(cache: *mut KmemCache) -> usize {
    if cache.is_null() {
        return 0;
    }
    unsafe { (*cache).shrink() }
}

/// Tear a cache down and return all of its memory to the buddy.
pub fn kmem_cache_destroy(cache: *mut KmemCache) {
    kmem_state().cache_destroy(cache);
}

/// Log the cache's geometry and counters.
pub fn kmem_cache_info(cache: *mut KmemCache) {
    if cache.is_null() {
        return;
    }
    unsafe {
        (*cache).info();
    }
}

/// Read and clear the cache's last error code; 0 when healthy.
pub fn kmem_cache_error(cache: *mut KmemCache) -> i32 {
    if cache.is_null() {
        return 0;
    }
    unsafe { (*cache).error() }
}

/// Allocate a small buffer of at least `size` bytes.
pub fn kmalloc(size: usize) -> *mut u8 {
    kmem_state().kmalloc(size)
}

/// Allocate a zeroed small buffer of at least `size` bytes.
pub fn kzalloc(size: usize) -> *mut u8 {
    kmem_state().kzalloc(size)
}

/// Free a buffer obtained from [`kmalloc`] / [`kzalloc`].
pub fn kfree(ptr: *mut u8) {
    kmem_state().kfree(ptr);
}
