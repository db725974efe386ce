#[cfg(target_arch = "riscv64")]
mod riscv;
#[cfg(target_arch = "riscv64")]
pub use riscv::*;

// Hosted builds (the allocator test suites) have no interrupt state to
// manage; the mask helpers become no-ops there.
#[cfg(not(target_arch = "riscv64"))]
mod stub;
#[cfg(not(target_arch = "riscv64"))]
pub use stub::*;
