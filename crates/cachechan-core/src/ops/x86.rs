//! x86_64 back-end: clflush / prefetchw / mfence / rdtsc

use super::CacheOps;
use cachechan_shared::CacheLine;
use std::arch::x86_64::{_MM_HINT_ET0, _mm_clflush, _mm_mfence, _mm_prefetch, _rdtsc};
use std::sync::atomic::{Ordering, compiler_fence};

/// Cache operations for x86_64
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Ops;

impl CacheOps for X86Ops {
    #[inline]
    fn flush(&self, line: &CacheLine) {
        // SAFETY: clflush on a valid, mapped address has no other effect
        unsafe { _mm_clflush(line.as_ptr()) };
        self.full_fence();
    }

    #[inline]
    fn prefetch_for_write(&self, line: &CacheLine) {
        // SAFETY: prefetch is a hint and never faults
        unsafe { _mm_prefetch::<_MM_HINT_ET0>(line.as_ptr() as *const i8) };
        self.full_fence();
    }

    #[inline]
    fn full_fence(&self) {
        compiler_fence(Ordering::SeqCst);
        // SAFETY: mfence is available on every x86_64 CPU
        unsafe { _mm_mfence() };
        compiler_fence(Ordering::SeqCst);
    }

    #[inline]
    fn read_cycle_counter(&self) -> u64 {
        // SAFETY: rdtsc is available on every x86_64 CPU
        unsafe { _rdtsc() }
    }
}
