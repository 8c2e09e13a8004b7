//! Receiver state machine
//!
//! ```text
//! Calibrate -> AwaitMessageLength -> ReceiveBit(0..total_bits) -> Reconstruct -> Done
//!     ^                                                                        |
//!     +------------------------------------------------------------------------+
//! ```
//!
//! Every session starts by reinitializing the region and calibrating, and only
//! then publishes `ready`. A session that aborts (bad length, sender gave up)
//! discards whatever bits were collected and the loop starts over.
//!
//! The stop flag is honored by every wait. A complete message is not handed
//! out until the sender has raised `done`, so no store from a finished sender
//! can reach the next session.

use crate::calibrate::{Calibration, CalibrationConfig, calibrate};
use crate::ops::CacheOps;
use crate::poll::{PollPolicy, backoff};
use crate::timing::measure_access_cycles;
use cachechan_shared::framing::{decode_bits, validate_length};
use cachechan_shared::{ChannelError, LINE_FILL, SharedRegion, Termination, Turn};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Where the receiver is in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverPhase {
    /// Reinitialize the region, sample latencies, publish `ready`
    Calibrate,
    /// Waiting for the sender to publish `msg_len`
    AwaitMessageLength(Calibration),
    /// Measuring bit `bits.len()` of `len * 8`
    ReceiveBit {
        /// Threshold in force for this session
        calibration: Calibration,
        /// Message length in bytes
        len: usize,
        /// Bits decoded so far
        bits: Vec<u8>,
    },
    /// All bits collected
    Reconstruct {
        /// Threshold in force for this session
        calibration: Calibration,
        /// Complete bit stream
        bits: Vec<u8>,
    },
    /// Session complete
    Done(SessionReport),
}

/// Outcome of one successful session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Threshold used to decode this session
    pub calibration: Calibration,
    /// Decoded bit stream, LSB-first per byte
    pub bits: Vec<u8>,
    /// Reconstructed message
    pub message: Vec<u8>,
}

/// Measurement taken for one bit (passed to observers, e.g. for verbose output)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSample {
    /// Bit index within the session
    pub index: usize,
    /// Measured access latency
    pub latency: u64,
    /// Decoded value
    pub bit: u8,
}

/// Receives messages over a shared region, one session at a time
pub struct Receiver<'r, O: CacheOps> {
    region: &'r SharedRegion,
    ops: O,
    policy: PollPolicy,
    calibration: CalibrationConfig,
    on_bit: Option<Box<dyn FnMut(BitSample) + 'r>>,
}

impl<'r, O: CacheOps> Receiver<'r, O> {
    /// Create a receiver over `region`
    pub fn new(
        region: &'r SharedRegion,
        ops: O,
        policy: PollPolicy,
        calibration: CalibrationConfig,
    ) -> Self {
        Self {
            region,
            ops,
            policy,
            calibration,
            on_bit: None,
        }
    }

    /// Observe every decoded bit
    pub fn on_bit(mut self, f: impl FnMut(BitSample) + 'r) -> Self {
        self.on_bit = Some(Box::new(f));
        self
    }

    /// Serve sessions until `stop` is raised or `max_sessions` (if any) have ended.
    ///
    /// Every session outcome, successful or not, goes to `on_session`. Session
    /// errors do not stop the loop; the region is reinitialized for the next one.
    pub fn serve(
        &mut self,
        stop: &AtomicBool,
        max_sessions: Option<usize>,
        mut on_session: impl FnMut(Result<SessionReport, ChannelError>),
    ) -> usize {
        let mut sessions = 0;
        while !stop.load(Ordering::SeqCst) && max_sessions.is_none_or(|max| sessions < max) {
            let outcome = self.run_session(stop);
            if let Err(e) = &outcome {
                warn!("session aborted: {e}");
            }
            on_session(outcome);
            sessions += 1;
        }
        sessions
    }

    /// Run one complete session from calibration to reconstructed message
    pub fn run_session(&mut self, stop: &AtomicBool) -> Result<SessionReport, ChannelError> {
        let mut phase = ReceiverPhase::Calibrate;
        loop {
            phase = match phase {
                ReceiverPhase::Done(report) => return Ok(report),
                other => self.step(other, stop)?,
            };
        }
    }

    /// Advance the state machine by one phase
    pub fn step(
        &mut self,
        phase: ReceiverPhase,
        stop: &AtomicBool,
    ) -> Result<ReceiverPhase, ChannelError> {
        match phase {
            ReceiverPhase::Calibrate => Ok(ReceiverPhase::AwaitMessageLength(
                self.begin_session(),
            )),
            ReceiverPhase::AwaitMessageLength(calibration) => {
                let len = self.await_message_length(stop)?;
                info!("receiving {} bytes ({} bits)", len, len * 8);
                Ok(ReceiverPhase::ReceiveBit {
                    calibration,
                    len,
                    bits: Vec::with_capacity(len * 8),
                })
            }
            ReceiverPhase::ReceiveBit {
                calibration,
                len,
                mut bits,
            } => {
                let total = len * 8;
                let bit = self.receive_bit(&calibration, bits.len(), total, stop)?;
                bits.push(bit);
                if bits.len() == total {
                    Ok(ReceiverPhase::Reconstruct { calibration, bits })
                } else {
                    Ok(ReceiverPhase::ReceiveBit {
                        calibration,
                        len,
                        bits,
                    })
                }
            }
            ReceiverPhase::Reconstruct { calibration, bits } => {
                self.await_sender_close(stop);
                let message = decode_bits(&bits)
                    .ok_or(ChannelError::InvalidMessageLength(bits.len() as i64 / 8))?;
                self.region.set_done();
                Ok(ReceiverPhase::Done(SessionReport {
                    calibration,
                    bits,
                    message,
                }))
            }
            ReceiverPhase::Done(report) => Ok(ReceiverPhase::Done(report)),
        }
    }

    /// Reinitialize the region, calibrate, then announce readiness
    pub fn begin_session(&mut self) -> Calibration {
        self.region.reinitialize(LINE_FILL);
        self.ops.full_fence();

        let calibration = calibrate(&self.ops, self.region.target_line(), &self.calibration);
        info!(
            "calibrated: avg_cached={} avg_evicted={} threshold={}",
            calibration.avg_cached, calibration.avg_evicted, calibration.threshold
        );

        self.region.publish_ready();
        calibration
    }

    /// Wait until the sender publishes a length, or gives up
    fn await_message_length(&self, stop: &AtomicBool) -> Result<usize, ChannelError> {
        loop {
            let len = self.region.msg_len();
            if len != 0 {
                return validate_length(len as i64);
            }
            if self.region.is_done() {
                return Err(ChannelError::PrematureTermination(Termination::BeforeLength));
            }
            if stop.load(Ordering::SeqCst) {
                return Err(ChannelError::PrematureTermination(Termination::Stopped));
            }
            backoff(self.policy.length_interval);
        }
    }

    /// Wait for the sender's own `done` so its store cannot land in the next session.
    ///
    /// Only a stop request ends the wait early; `serve` never starts another
    /// session after that.
    fn await_sender_close(&self, stop: &AtomicBool) {
        while !self.region.is_done() {
            if stop.load(Ordering::SeqCst) {
                warn!("stop requested before the sender closed the session");
                return;
            }
            backoff(self.policy.length_interval);
        }
    }

    /// Wait for the turn, measure, classify, hand the turn back
    fn receive_bit(
        &mut self,
        calibration: &Calibration,
        index: usize,
        total: usize,
        stop: &AtomicBool,
    ) -> Result<u8, ChannelError> {
        while !self.region.is_turn(Turn::Receiver) {
            if stop.load(Ordering::SeqCst) {
                return Err(ChannelError::PrematureTermination(Termination::Stopped));
            }
            // done with the turn still on the sender's side means it left mid-message
            if self.region.is_done() && self.region.turn() != Some(Turn::Receiver) {
                return Err(ChannelError::PrematureTermination(
                    Termination::MidTransmission {
                        received: index,
                        expected: total,
                    },
                ));
            }
            backoff(self.policy.receiver_turn_interval);
        }

        self.ops.full_fence();
        let latency = measure_access_cycles(&self.ops, self.region.target_line());
        let bit = calibration.classify(latency);

        self.region.set_bit_value(bit);
        debug!("bit {:4}: measured={:4} => {}", index, latency, bit);
        if let Some(f) = self.on_bit.as_mut() {
            f(BitSample {
                index,
                latency,
                bit,
            });
        }

        self.region.set_turn(Turn::Sender);
        Ok(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{EventKind, SimEvent, SimRole, SimulatedCache};
    use crate::sender::Sender;
    use cachechan_shared::RegionSnapshot;
    use cachechan_shared::framing::{bit_at, encode_bits};
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config() -> CalibrationConfig {
        CalibrationConfig {
            trials: 8,
            warmup: 2,
        }
    }

    /// Run one sender and one receiver session concurrently over a fresh region
    fn transfer(msg: &[u8], cache: &SimulatedCache) -> Result<SessionReport, ChannelError> {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            let sender_ops = cache.handle(SimRole::Sender);
            let region = &region;
            let sent = s.spawn(move || {
                Sender::new(region, sender_ops, PollPolicy::immediate()).send(msg)
            });
            let mut receiver = Receiver::new(
                region,
                cache.handle(SimRole::Receiver),
                PollPolicy::immediate(),
                test_config(),
            );
            let report = receiver.run_session(&stop);
            sent.join().unwrap().unwrap();
            report
        })
    }

    /// Roles of the bit-exchange events, with runs of the same role collapsed
    fn turn_holders(events: &[SimEvent]) -> Vec<SimRole> {
        let first_sender = events
            .iter()
            .position(|e| e.role == SimRole::Sender)
            .unwrap_or(events.len());
        let mut holders: Vec<SimRole> = Vec::new();
        for e in &events[first_sender..] {
            if holders.last() != Some(&e.role) {
                holders.push(e.role);
            }
        }
        holders
    }

    #[test]
    fn test_round_trip_hi() {
        let cache = SimulatedCache::new();
        let report = transfer(b"HI", &cache).unwrap();
        assert_eq!(
            report.bits,
            vec![0, 0, 0, 1, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 0]
        );
        assert_eq!(report.message, b"HI");
        assert!(report.calibration.threshold > report.calibration.avg_cached);
    }

    #[test]
    fn test_round_trip_lengths() {
        for msg in [
            vec![0xA5],
            b"covert".to_vec(),
            (0..128u8).map(|b| b.wrapping_mul(37)).collect::<Vec<u8>>(),
        ] {
            let cache = SimulatedCache::new();
            let report = transfer(&msg, &cache).unwrap();
            assert_eq!(report.message, msg);
            assert_eq!(report.bits, encode_bits(&msg));
        }
    }

    #[test]
    fn test_turn_alternation() {
        let cache = SimulatedCache::new();
        transfer(b"OK", &cache).unwrap();

        let holders = turn_holders(&cache.events());
        assert_eq!(holders.len(), 2 * 16);
        for pair in holders.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(holders[0], SimRole::Sender);
        assert_eq!(holders.last(), Some(&SimRole::Receiver));
    }

    #[test]
    fn test_one_measurement_per_bit() {
        let cache = SimulatedCache::new();
        transfer(b"Z", &cache).unwrap();

        let events = cache.events();
        let first_sender = events.iter().position(|e| e.role == SimRole::Sender).unwrap();
        let receiver_loads = events[first_sender..]
            .iter()
            .filter(|e| e.role == SimRole::Receiver && matches!(e.kind, EventKind::Load { .. }))
            .count();
        assert_eq!(receiver_loads, 8);
    }

    #[test]
    fn test_corrupted_bit_is_not_corrected() {
        let cache = SimulatedCache::new();
        // Bit 3 of 'H' (0x48) is a 1; the receiver sees it evicted
        cache.corrupt_bit(3);
        let report = transfer(b"HI", &cache).unwrap();

        assert_eq!(report.message, vec![0x40, 0x49]);
        // Sender drove each bit exactly once: no retransmission took place
        let sender_ops = cache
            .events()
            .iter()
            .filter(|e| e.role == SimRole::Sender)
            .count();
        // prefetch + touch for a 1, two flushes for a 0
        assert_eq!(sender_ops, 2 * 16);
    }

    #[test]
    fn test_done_before_length_aborts() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        region.set_done();
        let result = receiver.step(ReceiverPhase::AwaitMessageLength(calibration), &stop);
        assert!(matches!(
            result,
            Err(ChannelError::PrematureTermination(Termination::BeforeLength))
        ));
    }

    #[test]
    fn test_invalid_length_aborts_without_bits() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let cache = SimulatedCache::new();
        let mut receiver = Receiver::new(&region, cache.clone(), PollPolicy::immediate(), test_config());

        let calibration = receiver.begin_session();
        let events_before = cache.events().len();
        region.set_msg_len(129);
        let result = receiver.step(ReceiverPhase::AwaitMessageLength(calibration), &stop);
        assert!(matches!(
            result,
            Err(ChannelError::InvalidMessageLength(129))
        ));
        assert_eq!(cache.events().len(), events_before);
    }

    #[test]
    fn test_sender_leaving_mid_message_aborts() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        region.set_msg_len(1);
        let phase = receiver
            .step(ReceiverPhase::AwaitMessageLength(calibration), &stop)
            .unwrap();

        // One bit arrives, then the sender gives up with the turn still its own
        region.set_turn(Turn::Receiver);
        let phase = receiver.step(phase, &stop).unwrap();
        assert!(region.is_turn(Turn::Sender));
        region.set_done();

        let result = receiver.step(phase, &stop);
        assert!(matches!(
            result,
            Err(ChannelError::PrematureTermination(Termination::MidTransmission {
                received: 1,
                expected: 8
            }))
        ));
    }

    #[test]
    fn test_done_with_turn_handed_over_still_measures() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        region.set_msg_len(1);
        let phase = receiver
            .step(ReceiverPhase::AwaitMessageLength(calibration), &stop)
            .unwrap();

        region.set_turn(Turn::Receiver);
        region.set_done();
        let phase = receiver.step(phase, &stop).unwrap();
        assert!(matches!(phase, ReceiverPhase::ReceiveBit { ref bits, .. } if bits.len() == 1));
    }

    #[test]
    fn test_reinitialization_between_sessions() {
        let cache = SimulatedCache::new();
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            let region = &region;
            let sender_ops = cache.handle(SimRole::Sender);
            let sent = s.spawn(move || {
                Sender::new(region, sender_ops, PollPolicy::immediate()).send(b"HI")
            });
            let mut receiver = Receiver::new(
                region,
                cache.handle(SimRole::Receiver),
                PollPolicy::immediate(),
                test_config(),
            );
            assert_eq!(receiver.run_session(&stop).unwrap().message, b"HI");
            sent.join().unwrap().unwrap();

            // Dirty state left by the first session
            let after = region.snapshot();
            assert!(after.done);
            assert_eq!(after.msg_len, 2);

            receiver.begin_session();
            assert_eq!(
                region.snapshot(),
                RegionSnapshot {
                    ready: true,
                    turn: Turn::Sender as i32,
                    bit_value: 0,
                    msg_len: 0,
                    done: false,
                }
            );
            assert_eq!(region.target_line().read(), LINE_FILL);
        });
    }

    #[test]
    fn test_serve_multiple_sessions() {
        let cache = SimulatedCache::new();
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let messages: [&[u8]; 3] = [b"one", b"two", b"three"];

        let received = std::thread::scope(|s| {
            let region = &region;
            let sender_ops = cache.handle(SimRole::Sender);
            s.spawn(move || {
                let policy = PollPolicy {
                    ready_attempts: u32::MAX,
                    ..PollPolicy::immediate()
                };
                let mut sender = Sender::new(region, sender_ops, policy);
                for msg in messages {
                    sender.send(msg).unwrap();
                }
            });

            let mut received = Vec::new();
            let mut receiver = Receiver::new(
                region,
                cache.handle(SimRole::Receiver),
                PollPolicy::immediate(),
                test_config(),
            );
            let served = receiver.serve(&stop, Some(messages.len()), |outcome| {
                received.push(outcome.unwrap().message);
            });
            assert_eq!(served, 3);
            received
        });

        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_serve_stops_on_signal() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(true);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );
        let served = receiver.serve(&stop, None, |_| panic!("no session expected"));
        assert_eq!(served, 0);
    }

    #[test]
    fn test_stop_while_awaiting_length() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        let result = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::SeqCst);
            });
            receiver.step(ReceiverPhase::AwaitMessageLength(calibration), &stop)
        });
        assert!(matches!(
            result,
            Err(ChannelError::PrematureTermination(Termination::Stopped))
        ));
    }

    #[test]
    fn test_stop_while_awaiting_turn() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        region.set_msg_len(1);
        let phase = receiver
            .step(ReceiverPhase::AwaitMessageLength(calibration), &stop)
            .unwrap();

        // Sender never takes its turn
        let result = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::SeqCst);
            });
            receiver.step(phase, &stop)
        });
        assert!(matches!(
            result,
            Err(ChannelError::PrematureTermination(Termination::Stopped))
        ));
    }

    #[test]
    fn test_reconstruct_waits_for_sender_close() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let closed = AtomicBool::new(false);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        region.set_msg_len(1);
        let phase = ReceiverPhase::Reconstruct {
            calibration,
            bits: encode_bits(b"A"),
        };

        // A slow sender: its done arrives well after the last bit
        let phase = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                closed.store(true, Ordering::SeqCst);
                region.set_done();
            });
            receiver.step(phase, &stop)
        })
        .unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(phase, ReceiverPhase::Done(ref report) if report.message == b"A"));

        // Nothing is left to write into the next session
        receiver.begin_session();
        assert!(!region.is_done());
        assert!(region.is_ready());
    }

    #[test]
    fn test_stop_ends_close_wait() {
        let region = SharedRegion::default();
        let stop = AtomicBool::new(true);
        let mut receiver = Receiver::new(
            &region,
            SimulatedCache::new(),
            PollPolicy::immediate(),
            test_config(),
        );

        let calibration = receiver.begin_session();
        let phase = ReceiverPhase::Reconstruct {
            calibration,
            bits: encode_bits(b"A"),
        };
        let phase = receiver.step(phase, &stop).unwrap();
        assert!(matches!(phase, ReceiverPhase::Done(ref report) if report.message == b"A"));
        assert!(region.is_done());
    }

    #[test]
    fn test_turn_field_alternates() {
        let cache = SimulatedCache::new();
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let holders: Mutex<Vec<Option<Turn>>> = Mutex::new(Vec::new());
        let msg = b"OK";

        let report = std::thread::scope(|s| {
            let region = &region;
            let holders = &holders;
            let ops = cache.handle(SimRole::Sender);

            // Minimal sender that logs the turn field each time it acts
            s.spawn(move || {
                while region.is_done() || !region.is_ready() {
                    std::thread::yield_now();
                }
                region.set_msg_len(msg.len() as i32);
                for i in 0..msg.len() * 8 {
                    while region.turn() != Some(Turn::Sender) {
                        std::thread::yield_now();
                    }
                    holders.lock().unwrap().push(region.turn());
                    if bit_at(msg, i) == 1 {
                        ops.prefetch_for_write(region.target_line());
                    } else {
                        ops.flush(region.target_line());
                    }
                    region.set_turn(Turn::Receiver);
                }
                while region.turn() != Some(Turn::Sender) {
                    std::thread::yield_now();
                }
                region.set_done();
            });

            let mut receiver = Receiver::new(
                region,
                cache.handle(SimRole::Receiver),
                PollPolicy::immediate(),
                test_config(),
            )
            .on_bit(move |_| holders.lock().unwrap().push(region.turn()));
            receiver.run_session(&stop).unwrap()
        });

        assert_eq!(report.message, msg);
        let holders = holders.into_inner().unwrap();
        assert_eq!(holders.len(), 2 * 16);
        for (i, holder) in holders.iter().enumerate() {
            let expected = if i % 2 == 0 { Turn::Sender } else { Turn::Receiver };
            assert_eq!(*holder, Some(expected), "acquisition {i}");
        }
    }

    #[test]
    fn test_bit_observer() {
        let cache = SimulatedCache::new();
        let region = SharedRegion::default();
        let stop = AtomicBool::new(false);
        let mut samples = Vec::new();

        std::thread::scope(|s| {
            let region = &region;
            let sender_ops = cache.handle(SimRole::Sender);
            s.spawn(move || {
                Sender::new(region, sender_ops, PollPolicy::immediate())
                    .send(&[0xA5])
                    .unwrap()
            });
            let mut receiver = Receiver::new(
                region,
                cache.handle(SimRole::Receiver),
                PollPolicy::immediate(),
                test_config(),
            )
            .on_bit(|sample| samples.push(sample));
            receiver.run_session(&stop).unwrap();
        });

        let bits: Vec<u8> = samples.iter().map(|s| s.bit).collect();
        assert_eq!(bits, vec![1, 0, 1, 0, 0, 1, 0, 1]);
        assert!(samples.iter().enumerate().all(|(i, s)| s.index == i));
    }
}
