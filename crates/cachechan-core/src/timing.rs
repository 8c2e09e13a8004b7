//! Access-latency measurement

use crate::ops::CacheOps;
use cachechan_shared::CacheLine;

/// Time exactly one byte read of `line`, in counter ticks.
///
/// The read is bracketed by full fences so neither earlier nor later memory
/// operations can leak into the measured window.
#[inline]
pub fn measure_access_cycles<O: CacheOps + ?Sized>(ops: &O, line: &CacheLine) -> u64 {
    ops.full_fence();
    let start = ops.read_cycle_counter();
    ops.load(line);
    let end = ops.read_cycle_counter();
    ops.full_fence();
    end.wrapping_sub(start)
}

/// Short busy delay followed by a fence, giving a cache operation time to land
#[inline]
pub fn settle<O: CacheOps + ?Sized>(ops: &O, spins: u32) {
    for _ in 0..spins {
        std::hint::spin_loop();
    }
    ops.full_fence();
}
