//! Sender state machine
//!
//! ```text
//! AwaitReceiverReady -> PublishLength -> TransmitBit(0..total_bits) -> Done
//! ```
//!
//! A 1 bit leaves `target_line` resident (prefetch for write, then touch), a
//! 0 bit leaves it evicted (flush twice). After each bit the turn goes to the
//! receiver; the next bit waits until it comes back. Bits are fire-and-forget:
//! nothing is ever retransmitted.

use crate::ops::CacheOps;
use crate::poll::{PollPolicy, backoff};
use crate::timing::settle;
use cachechan_shared::framing::{bit_at, validate_length};
use cachechan_shared::{ChannelError, SharedRegion, Turn};
use log::{debug, info};

/// Where the sender is in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    /// Waiting for a freshly initialized receiver
    AwaitReceiverReady,
    /// Writing `msg_len`
    PublishLength,
    /// Driving bit `i` into the line
    TransmitBit(usize),
    /// All bits handed over, `done` raised
    Done,
}

/// Drives one message at a time through a shared region
pub struct Sender<'r, O: CacheOps> {
    region: &'r SharedRegion,
    ops: O,
    policy: PollPolicy,
}

impl<'r, O: CacheOps> Sender<'r, O> {
    /// Create a sender over `region` using the given back-end and policy
    pub fn new(region: &'r SharedRegion, ops: O, policy: PollPolicy) -> Self {
        Self { region, ops, policy }
    }

    /// Send one message. The length is checked before the region is touched.
    pub fn send(&mut self, msg: &[u8]) -> Result<(), ChannelError> {
        validate_length(msg.len() as i64)?;

        let total_bits = msg.len() * 8;
        let mut phase = SenderPhase::AwaitReceiverReady;
        loop {
            phase = match phase {
                SenderPhase::AwaitReceiverReady => {
                    self.await_receiver_ready()?;
                    SenderPhase::PublishLength
                }
                SenderPhase::PublishLength => {
                    self.publish_length(msg.len())?;
                    SenderPhase::TransmitBit(0)
                }
                SenderPhase::TransmitBit(i) if i < total_bits => {
                    self.transmit_bit(i, bit_at(msg, i));
                    SenderPhase::TransmitBit(i + 1)
                }
                SenderPhase::TransmitBit(_) => {
                    self.finish();
                    SenderPhase::Done
                }
                SenderPhase::Done => break,
            };
        }

        info!("sent {} bytes ({} bits)", msg.len(), total_bits);
        Ok(())
    }

    /// Wait for a session that is ready and has not been used yet.
    ///
    /// `done` is read before `ready` so a stale `ready` left over from the
    /// previous session is never mistaken for a fresh one.
    fn await_receiver_ready(&self) -> Result<(), ChannelError> {
        let attempts = self.policy.ready_attempts.max(1);
        for _ in 0..attempts {
            if !self.region.is_done() && self.region.is_ready() && self.region.msg_len() == 0 {
                return Ok(());
            }
            backoff(self.policy.ready_interval);
        }
        Err(ChannelError::ReceiverUnavailable { attempts })
    }

    fn publish_length(&self, len: usize) -> Result<(), ChannelError> {
        let len = validate_length(len as i64)?;
        self.region.set_msg_len(len as i32);
        debug!("published msg_len={len}");
        self.ops.full_fence();
        settle(&self.ops, self.policy.settle_spins);
        Ok(())
    }

    fn await_turn(&self) {
        while !self.region.is_turn(Turn::Sender) {
            backoff(self.policy.sender_turn_interval);
        }
    }

    fn transmit_bit(&self, index: usize, bit: u8) {
        self.await_turn();

        self.region.set_bit_value(bit);

        let line = self.region.target_line();
        if bit == 1 {
            self.ops.prefetch_for_write(line);
            self.ops.load(line);
        } else {
            // Second flush catches a speculative refetch between the two
            self.ops.flush(line);
            self.ops.flush(line);
        }

        self.ops.full_fence();
        settle(&self.ops, self.policy.settle_spins);

        debug!("bit {:4}: sent {}", index, bit);
        self.region.set_turn(Turn::Receiver);
    }

    /// Wait for the last measurement to complete, then close the session
    fn finish(&self) {
        self.await_turn();
        self.region.set_done();
    }
}
