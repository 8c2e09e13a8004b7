//! Simulated cache back-end
//!
//! A deterministic model of one cache shared by two roles. Loads of a resident
//! line cost `hit_cycles`, loads of an evicted line cost `miss_cycles` and make
//! it resident. The cycle counter only advances on loads, so a timed access
//! measures exactly the charged latency.
//!
//! Every operation is appended to an event log tagged with the role of the
//! handle that issued it, which lets tests check turn alternation.

use super::CacheOps;
use cachechan_shared::CacheLine;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which side issued an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimRole {
    /// Operations issued through the sender's handle
    Sender,
    /// Operations issued through the receiver's handle
    Receiver,
}

/// Kind of simulated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Line evicted
    Flush,
    /// Line pulled in for writing
    Prefetch,
    /// Line read; `hit` is the residency observed by the load
    Load {
        /// Whether the load was charged the hit latency
        hit: bool,
    },
}

/// One entry of the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimEvent {
    /// Issuing side
    pub role: SimRole,
    /// What happened
    pub kind: EventKind,
}

#[derive(Debug)]
struct SimState {
    resident: HashSet<usize>,
    clock: u64,
    hit_cycles: u64,
    miss_cycles: u64,
    events: Vec<SimEvent>,
    /// Receiver loads after the sender's first operation, i.e. bit measurements
    bit_loads: usize,
    corrupt_bits: HashSet<usize>,
    sender_started: bool,
}

/// Handle onto a shared simulated cache
#[derive(Debug, Clone)]
pub struct SimulatedCache {
    state: Arc<Mutex<SimState>>,
    role: SimRole,
}

/// Default latency of a cached load
pub const SIM_HIT_CYCLES: u64 = 40;

/// Default latency of an evicted load
pub const SIM_MISS_CYCLES: u64 = 300;

impl SimulatedCache {
    /// New cache with the default latencies; the returned handle acts as the receiver
    pub fn new() -> Self {
        Self::with_latencies(SIM_HIT_CYCLES, SIM_MISS_CYCLES)
    }

    /// New cache with custom hit/miss latencies
    pub fn with_latencies(hit_cycles: u64, miss_cycles: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                resident: HashSet::new(),
                clock: 0,
                hit_cycles,
                miss_cycles,
                events: Vec::new(),
                bit_loads: 0,
                corrupt_bits: HashSet::new(),
                sender_started: false,
            })),
            role: SimRole::Receiver,
        }
    }

    /// Another handle onto the same cache acting as `role`
    pub fn handle(&self, role: SimRole) -> Self {
        Self {
            state: Arc::clone(&self.state),
            role,
        }
    }

    /// Invert the residency seen by the receiver's measurement of bit `index`
    pub fn corrupt_bit(&self, index: usize) {
        self.lock().corrupt_bits.insert(index);
    }

    /// Copy of the event log
    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().events.clone()
    }

    /// Whether the line is currently resident
    pub fn is_resident(&self, line: &CacheLine) -> bool {
        self.lock().resident.contains(&(line.as_ptr() as usize))
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the other side's result
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, state: &mut SimState, kind: EventKind) {
        if self.role == SimRole::Sender {
            state.sender_started = true;
        }
        state.events.push(SimEvent {
            role: self.role,
            kind,
        });
    }
}

impl Default for SimulatedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheOps for SimulatedCache {
    fn flush(&self, line: &CacheLine) {
        let mut state = self.lock();
        state.resident.remove(&(line.as_ptr() as usize));
        self.record(&mut state, EventKind::Flush);
    }

    fn prefetch_for_write(&self, line: &CacheLine) {
        let mut state = self.lock();
        state.resident.insert(line.as_ptr() as usize);
        self.record(&mut state, EventKind::Prefetch);
    }

    fn full_fence(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn read_cycle_counter(&self) -> u64 {
        self.lock().clock
    }

    fn load(&self, line: &CacheLine) -> u8 {
        let mut state = self.lock();
        let addr = line.as_ptr() as usize;
        let mut hit = state.resident.contains(&addr);

        if self.role == SimRole::Receiver && state.sender_started {
            if state.corrupt_bits.contains(&state.bit_loads) {
                hit = !hit;
            }
            state.bit_loads += 1;
        }

        let cost = if hit { state.hit_cycles } else { state.miss_cycles };
        state.clock += cost;
        state.resident.insert(addr);
        self.record(&mut state, EventKind::Load { hit });
        line.read()
    }
}
