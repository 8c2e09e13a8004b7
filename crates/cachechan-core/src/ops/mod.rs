//! Cache-state capability
//!
//! The protocol only ever asks the hardware four things: evict a line, pull a
//! line in for writing, order memory, and read a cycle counter. Each target
//! supplies one implementation; [`NativeOps`] picks it at build time.

#[cfg(target_arch = "riscv64")]
mod riscv;
pub mod sim;
#[cfg(target_arch = "x86_64")]
mod x86;

use cachechan_shared::CacheLine;

#[cfg(target_arch = "riscv64")]
pub use riscv::RiscvOps;
pub use sim::{EventKind, SimEvent, SimRole, SimulatedCache};
#[cfg(target_arch = "x86_64")]
pub use x86::X86Ops;

/// Hardware back-end for the cache-state operations
pub trait CacheOps {
    /// Evict the line from every cache level. Returns after the eviction is ordered.
    fn flush(&self, line: &CacheLine);

    /// Bring the line into cache in a writable state
    fn prefetch_for_write(&self, line: &CacheLine);

    /// Serializing barrier for all prior and subsequent memory operations
    fn full_fence(&self);

    /// Monotonic high-resolution counter
    fn read_cycle_counter(&self) -> u64;

    /// Read one byte of the line
    #[inline]
    fn load(&self, line: &CacheLine) -> u8 {
        std::hint::black_box(line.read())
    }
}

impl<T: CacheOps + ?Sized> CacheOps for &T {
    fn flush(&self, line: &CacheLine) {
        (**self).flush(line)
    }

    fn prefetch_for_write(&self, line: &CacheLine) {
        (**self).prefetch_for_write(line)
    }

    fn full_fence(&self) {
        (**self).full_fence()
    }

    fn read_cycle_counter(&self) -> u64 {
        (**self).read_cycle_counter()
    }

    fn load(&self, line: &CacheLine) -> u8 {
        (**self).load(line)
    }
}

/// Back-end for the CPU this binary was built for
#[cfg(target_arch = "x86_64")]
pub type NativeOps = X86Ops;

/// Back-end for the CPU this binary was built for
#[cfg(target_arch = "riscv64")]
pub type NativeOps = RiscvOps;
