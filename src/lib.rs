//! Physical memory management core of a teaching RISC-V kernel.
//!
//! Two cooperating allocators, leaves first:
//!
//! * [`mm::buddy`]: a **binary buddy allocator** over a contiguous,
//!   page-aligned physical region. Blocks are `2^order` pages; splits hand
//!   back the lower half and coalescing walks the address-XOR sibling.
//! * [`mm::kmem`]: a **slab allocator** layered on top of the buddy. Named
//!   object caches with optional constructor/destructor, plus the
//!   `kmalloc`/`kfree` small-buffer interface that routes through lazily
//!   created power-of-two size-class caches.
//!
//! The page-granularity front-end ([`mm::kalloc`]) supports two build-time
//! deployments selected by the `slab_kernel` feature; see the module docs.
//!
//! The crate is `no_std` for kernel targets. Unit and integration tests run
//! hosted: the allocators operate on caller-provided memory regions, so the
//! tests hand them ordinary (suitably aligned) heap buffers.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod macros;

mod arch;
mod base;
pub mod driver;
pub mod logk;
pub mod mm;
mod util;
