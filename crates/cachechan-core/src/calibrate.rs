//! Receiver-side calibration
//!
//! Samples the access latency of `target_line` in a known-cached and a
//! known-evicted state and places the decision threshold between the two
//! means. The threshold is fixed for the rest of the session.

use crate::ops::CacheOps;
use crate::timing::measure_access_cycles;
use cachechan_shared::CacheLine;

/// Calibration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationConfig {
    /// Samples per state
    pub trials: u32,
    /// Touches/flushes used to force a state before sampling
    pub warmup: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            trials: 80,
            warmup: 5,
        }
    }
}

/// Result of one calibration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// Mean latency of cached accesses
    pub avg_cached: u64,
    /// Mean latency of evicted accesses
    pub avg_evicted: u64,
    /// Decision threshold; strictly greater than `avg_cached`
    pub threshold: u64,
}

impl Calibration {
    /// Build a calibration from two means
    pub fn from_means(avg_cached: u64, avg_evicted: u64) -> Self {
        Self {
            avg_cached,
            avg_evicted,
            threshold: derive_threshold(avg_cached, avg_evicted),
        }
    }

    /// Decode one measurement: fast access means the sender kept the line (1)
    #[inline]
    pub fn classify(&self, latency: u64) -> u8 {
        u8::from(latency < self.threshold)
    }
}

/// Midpoint of the two means, clamped so the cached mean always decodes as cached
pub fn derive_threshold(avg_cached: u64, avg_evicted: u64) -> u64 {
    let threshold = avg_cached / 2 + avg_evicted / 2 + (avg_cached % 2 + avg_evicted % 2) / 2;
    if threshold <= avg_cached {
        avg_cached.saturating_add(1)
    } else {
        threshold
    }
}

/// Integer mean of a sample set
fn mean(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u128 = samples.iter().map(|&s| s as u128).sum();
    (sum / samples.len() as u128) as u64
}

/// Cached and evicted latency samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSet {
    /// Samples taken with the line resident
    pub cached: Vec<u64>,
    /// Samples taken right after a flush
    pub evicted: Vec<u64>,
}

impl SampleSet {
    /// Reduce the samples to means and a threshold
    pub fn reduce(&self) -> Calibration {
        Calibration::from_means(mean(&self.cached), mean(&self.evicted))
    }
}

/// Take the cached and evicted samples for `line`
pub fn sample<O: CacheOps + ?Sized>(ops: &O, line: &CacheLine, config: &CalibrationConfig) -> SampleSet {
    let trials = config.trials as usize;
    let mut set = SampleSet {
        cached: Vec::with_capacity(trials),
        evicted: Vec::with_capacity(trials),
    };

    for _ in 0..config.warmup {
        ops.load(line);
    }
    ops.full_fence();
    for _ in 0..trials {
        set.cached.push(measure_access_cycles(ops, line));
    }

    for _ in 0..config.warmup {
        ops.flush(line);
        ops.full_fence();
    }
    for _ in 0..trials {
        set.evicted.push(measure_access_cycles(ops, line));
        ops.flush(line);
        ops.full_fence();
    }

    set
}

/// Sample and reduce in one step
pub fn calibrate<O: CacheOps + ?Sized>(ops: &O, line: &CacheLine, config: &CalibrationConfig) -> Calibration {
    sample(ops, line, config).reduce()
}
