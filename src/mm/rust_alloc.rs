//! Provides the necessary structs used by the **Rust `alloc` crate**.
//!
//! The global allocator lets kernel code use the collection types of the
//! `alloc` library on top of the small-buffer interface. Size classes hand
//! out 8-byte-aligned objects, which covers the layouts those collections
//! request; stricter alignments are not supported here.

use core::alloc::{GlobalAlloc, Layout};
use crate::mm::{kfree, kzalloc};


// No members: the structure exists only to hang the alloc/dealloc impls on.
struct OsGlobalAlloc;

unsafe impl GlobalAlloc for OsGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.align() <= 8);
        kzalloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The owning size class is recovered from the pointer itself.
        kfree(ptr);
    }
}

#[global_allocator]
static GA: OsGlobalAlloc = OsGlobalAlloc;
