//! cachechan core - signaling protocol over one shared cache line
//!
//! The sender encodes each bit in the residency of `target_line`: resident
//! for 1, evicted for 0. The receiver times one access to the line and
//! compares it against a threshold it calibrated at session start. The two
//! sides take strict turns through the `turn` field of the shared region.
//!
//! Hardware specifics stay behind [`CacheOps`]; [`SimulatedCache`] stands in
//! for real hardware in tests.

pub mod calibrate;
pub mod ops;
pub mod poll;
pub mod receiver;
pub mod sender;
pub mod timing;

pub use calibrate::{Calibration, CalibrationConfig};
pub use ops::{CacheOps, SimulatedCache};
pub use poll::PollPolicy;
pub use receiver::{BitSample, Receiver, ReceiverPhase, SessionReport};
pub use sender::{Sender, SenderPhase};
