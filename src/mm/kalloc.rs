//! Page-granularity allocation front-end.
//!
//! Two build-time deployments share this interface:
//!
//! * **`slab_kernel` enabled: kernel-global buddy.** One static
//!   [`BuddyAllocator`] owns every physical page handed to [`kinit`].
//!   `kalloc`/`pgfree` are order-0 wrappers over it, `kalloc_order` /
//!   `pgfree_order` expose multi-page blocks, and the slab layer backs its
//!   caches from the same instance.
//! * **default: free-list pages, private slab buddy.** `kalloc`/`pgfree`
//!   run the classic single-page free list over `[start, end)`; ordered
//!   allocation is unavailable (those entry points panic). The slab layer
//!   gets its own static buddy over a reserved window that boot code passes
//!   to `kmem_init`, conventionally the top [`SLAB_RESERVE_PAGES`] pages
//!   of physical memory, kept out of the range given to [`kinit`].
//!
//! Freshly allocated pages are filled with `5`s and freed pages with `1`s
//! so stale pointers surface as garbage instead of quietly working.
//!
//! [`BuddyAllocator`]: crate::mm::buddy::BuddyAllocator

/// Suggested size of the reserved slab window in the default deployment:
/// 8192 pages, 32 MiB.
pub const SLAB_RESERVE_PAGES: usize = 8192;

#[cfg(feature = "slab_kernel")]
mod imp {
    use core::ptr::{addr_of_mut, null_mut};
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::PAGE_SIZE;

    /// The buddy owning all physical memory above the kernel image.
    static mut GLOBAL_BUDDY: BuddyAllocator = BuddyAllocator::new();

    #[inline]
    fn global_buddy() -> *mut BuddyAllocator {
        unsafe { addr_of_mut!(GLOBAL_BUDDY) }
    }

    /// Hand the physical range `[start, end)` to the global buddy.
    pub fn kinit(start: usize, end: usize) {
        unsafe {
            (*global_buddy()).init(start, end);
        }
    }

    /// Allocate one page.
    pub fn kalloc() -> *mut u8 {
        let buddy = unsafe { &mut *global_buddy() };
        match buddy.alloc(0) {
            Some(pa) => {
                let ptr = pa as *mut u8;
                unsafe {
                    ptr.write_bytes(5, PAGE_SIZE);
                }
                ptr
            }
            None => null_mut(),
        }
    }

    /// Free one page obtained from [`kalloc`].
    pub fn pgfree(pa: *mut u8) {
        let addr = pa as usize;
        if addr % PAGE_SIZE != 0 {
            panic!("pgfree");
        }
        unsafe {
            pa.write_bytes(1, PAGE_SIZE);
            (*global_buddy()).free(addr, 0);
        }
    }

    /// Allocate `2^order` contiguous pages.
    pub fn kalloc_order(order: usize) -> *mut u8 {
        let buddy = unsafe { &mut *global_buddy() };
        match buddy.alloc(order) {
            Some(pa) => pa as *mut u8,
            None => null_mut(),
        }
    }

    /// Free a block obtained from [`kalloc_order`].
    pub fn pgfree_order(pa: *mut u8, order: usize) {
        unsafe {
            (*global_buddy()).free(pa as usize, order);
        }
    }

    /// The buddy instance backing the default slab layer. The reserved
    /// window parameters are unused here: slabs draw from the global buddy.
    pub(crate) fn bind_slab_buddy(region: usize, npages: usize) -> *mut BuddyAllocator {
        let _ = (region, npages);
        global_buddy()
    }
}

#[cfg(not(feature = "slab_kernel"))]
mod imp {
    use core::ptr::{addr_of_mut, null_mut};
    use crate::base::sync::SpinLockPure;
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::{PAGE_ORDER, PAGE_SIZE};
    use crate::util::align::align_up;

    #[repr(C)]
    struct Run {
        next: *mut Run,
    }

    struct PageList {
        lock: SpinLockPure,
        freelist: *mut Run,
        start: usize,
        end: usize,
    }

    static mut KMEM_PAGES: PageList = PageList {
        lock: SpinLockPure::new(),
        freelist: null_mut(),
        start: 0,
        end: 0,
    };

    /// The slab layer's private buddy over the reserved window.
    static mut SLAB_BUDDY: BuddyAllocator = BuddyAllocator::new();

    #[inline]
    fn page_list() -> &'static mut PageList {
        unsafe { &mut *addr_of_mut!(KMEM_PAGES) }
    }

    /// Seed the free list with every page of `[start, end)`. The reserved
    /// slab window must not be part of this range.
    pub fn kinit(start: usize, end: usize) {
        {
            let pl = page_list();
            pl.start = align_up(start, PAGE_ORDER);
            pl.end = end;
        }
        let mut pa = align_up(start, PAGE_ORDER);
        while pa + PAGE_SIZE <= end {
            pgfree(pa as *mut u8);
            pa += PAGE_SIZE;
        }
    }

    /// Pop one page off the free list.
    pub fn kalloc() -> *mut u8 {
        let pl = page_list();
        let flags = pl.lock.lock_irq_save();
        let r = pl.freelist;
        if !r.is_null() {
            pl.freelist = unsafe { (*r).next };
        }
        pl.lock.unlock_irq_restore(flags);

        if !r.is_null() {
            unsafe {
                (r as *mut u8).write_bytes(5, PAGE_SIZE);
            }
        }
        r as *mut u8
    }

    /// Push one page back on the free list.
    pub fn pgfree(pa: *mut u8) {
        let addr = pa as usize;
        let pl = page_list();
        if addr % PAGE_SIZE != 0 || addr < pl.start || addr >= pl.end {
            panic!("pgfree");
        }

        unsafe {
            pa.write_bytes(1, PAGE_SIZE);
        }
        let r = addr as *mut Run;
        let flags = pl.lock.lock_irq_save();
        unsafe {
            (*r).next = pl.freelist;
        }
        pl.freelist = r;
        pl.lock.unlock_irq_restore(flags);
    }

    /// Ordered page allocation needs the kernel-global buddy.
    pub fn kalloc_order(_order: usize) -> *mut u8 {
        panic!("kalloc_order: unavailable without the kernel-global buddy");
    }

    /// Ordered page free needs the kernel-global buddy.
    pub fn pgfree_order(_pa: *mut u8, _order: usize) {
        panic!("pgfree_order: unavailable without the kernel-global buddy");
    }

    /// Initialize the private buddy over the reserved window
    /// `[region, region + npages * PAGE_SIZE)` and hand it to the slab
    /// layer.
    pub(crate) fn bind_slab_buddy(region: usize, npages: usize) -> *mut BuddyAllocator {
        let buddy = unsafe { addr_of_mut!(SLAB_BUDDY) };
        unsafe {
            (*buddy).init(region, region + npages * PAGE_SIZE);
        }
        buddy
    }
}

pub use imp::*;
