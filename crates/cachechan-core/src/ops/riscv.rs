//! RISC-V back-end
//!
//! Default: Zicbom `cbo.flush`, Zicbop `prefetch.w`, `fence rw, rw`, `rdcycle`.
//! With the `thead-c910` feature: vendor `dcache.civa` for flush and a plain
//! load standing in for the missing prefetch.
//!
//! Instructions are emitted as raw words so older assemblers without the
//! cache-block extensions still build this file.

use super::CacheOps;
use cachechan_shared::CacheLine;
use std::arch::asm;

/// Cache operations for riscv64
#[derive(Debug, Default, Clone, Copy)]
pub struct RiscvOps;

#[inline(always)]
fn fence_rw() {
    // SAFETY: fence has no operands and cannot fault
    unsafe { asm!("fence rw, rw", options(nostack, preserves_flags)) };
}

impl CacheOps for RiscvOps {
    #[cfg(not(feature = "thead-c910"))]
    #[inline]
    fn flush(&self, line: &CacheLine) {
        // SAFETY: cbo.flush 0(t0) on a mapped address
        unsafe {
            asm!(
                ".4byte 0x0022a00f", // cbo.flush 0(t0)
                in("t0") line.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
        fence_rw();
    }

    #[cfg(feature = "thead-c910")]
    #[inline]
    fn flush(&self, line: &CacheLine) {
        // SAFETY: dcache.civa a7 on a mapped address
        unsafe {
            asm!(
                ".4byte 0x0278800b", // dcache.civa a7
                in("a7") line.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
        fence_rw();
    }

    #[cfg(not(feature = "thead-c910"))]
    #[inline]
    fn prefetch_for_write(&self, line: &CacheLine) {
        // SAFETY: prefetch.w is a hint and never faults
        unsafe {
            asm!(
                ".4byte 0x0032e013", // prefetch.w 0(t0)
                in("t0") line.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
        fence_rw();
    }

    #[cfg(feature = "thead-c910")]
    #[inline]
    fn prefetch_for_write(&self, line: &CacheLine) {
        // SAFETY: the line is 64-byte aligned and mapped, so an 8-byte load is in bounds
        unsafe {
            asm!(
                "ld {tmp}, 0({p})",
                p = in(reg) line.as_ptr(),
                tmp = out(reg) _,
                options(nostack, preserves_flags, readonly),
            );
        }
        fence_rw();
    }

    #[inline]
    fn full_fence(&self) {
        fence_rw();
    }

    #[inline]
    fn read_cycle_counter(&self) -> u64 {
        let v: u64;
        // SAFETY: reads the user-visible cycle CSR
        unsafe { asm!("rdcycle {0}", out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }
}
