//! Shared control region layout
//!
//! ```text
//! offset  field        meaning
//! 0       ready        receiver sets 1 once the session is initialized
//! 4       turn         0 = sender may act, 1 = receiver may act
//! 8       bit_value    last bit sent/decoded (diagnostic only)
//! 12      msg_len      bytes in this session's message (0 until published)
//! 16      done         session finished (or sender gave up)
//! 64      target_line  64-byte aligned line whose residency carries the bit
//! ```
//!
//! Every access is a sequentially consistent atomic operation, including the
//! bytes of `target_line`.

use crate::CACHELINE;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering, fence};

/// Which side currently holds the turn token
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// The sender may drive the line
    Sender = 0,
    /// The receiver may measure the line
    Receiver = 1,
}

impl Turn {
    /// Decode a raw `turn` field; unknown values belong to nobody
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(Turn::Sender),
            1 => Some(Turn::Receiver),
            _ => None,
        }
    }
}

/// One cache line of signaling memory. Its content is irrelevant, its residency is the signal.
#[repr(C, align(64))]
pub struct CacheLine([AtomicU8; CACHELINE]);

impl Default for CacheLine {
    fn default() -> Self {
        Self([const { AtomicU8::new(0) }; CACHELINE])
    }
}

impl CacheLine {
    /// Address of the first byte (what flush/prefetch instructions operate on)
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr() as *const u8
    }

    /// Read the first byte of the line
    #[inline]
    pub fn read(&self) -> u8 {
        self.0[0].load(Ordering::SeqCst)
    }

    /// Overwrite every byte of the line
    pub fn fill(&self, byte: u8) {
        for b in &self.0 {
            b.store(byte, Ordering::SeqCst);
        }
    }

    /// Copy of the line content
    pub fn bytes(&self) -> [u8; CACHELINE] {
        std::array::from_fn(|i| self.0[i].load(Ordering::SeqCst))
    }
}

/// The region both processes map
#[repr(C)]
#[derive(Default)]
pub struct SharedRegion {
    ready: AtomicI32,
    turn: AtomicI32,
    bit_value: AtomicI32,
    msg_len: AtomicI32,
    done: AtomicI32,
    target_line: CacheLine,
}

const _: () = {
    assert!(std::mem::offset_of!(SharedRegion, ready) == 0);
    assert!(std::mem::offset_of!(SharedRegion, turn) == 4);
    assert!(std::mem::offset_of!(SharedRegion, bit_value) == 8);
    assert!(std::mem::offset_of!(SharedRegion, msg_len) == 12);
    assert!(std::mem::offset_of!(SharedRegion, done) == 16);
    assert!(std::mem::offset_of!(SharedRegion, target_line) == CACHELINE);
    assert!(std::mem::size_of::<SharedRegion>() == 2 * CACHELINE);
};

/// Size of the region in bytes (part of the wire contract)
pub const SHARED_REGION_SIZE: usize = std::mem::size_of::<SharedRegion>();

/// Plain copy of the control fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSnapshot {
    /// `ready` flag
    pub ready: bool,
    /// Raw `turn` value
    pub turn: i32,
    /// Last diagnostic bit
    pub bit_value: i32,
    /// Published message length
    pub msg_len: i32,
    /// `done` flag
    pub done: bool,
}

impl SharedRegion {
    /// Reset every control field and the line content for a new session.
    ///
    /// `ready` is withdrawn first so a sender never sees a half-reset region.
    /// The caller publishes `ready` again once it is prepared to receive.
    pub fn reinitialize(&self, fill: u8) {
        self.ready.store(0, Ordering::SeqCst);
        self.turn.store(Turn::Sender as i32, Ordering::SeqCst);
        self.bit_value.store(0, Ordering::SeqCst);
        self.msg_len.store(0, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.target_line.fill(fill);
        fence(Ordering::SeqCst);
    }

    /// Announce that the receiver is waiting for a message
    pub fn publish_ready(&self) {
        self.ready.store(1, Ordering::SeqCst);
    }

    /// Check if the receiver has published readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) != 0
    }

    /// Current turn holder, `None` for a value outside the protocol
    pub fn turn(&self) -> Option<Turn> {
        Turn::from_raw(self.turn.load(Ordering::SeqCst))
    }

    /// Check whether `side` holds the turn
    #[inline]
    pub fn is_turn(&self, side: Turn) -> bool {
        self.turn.load(Ordering::SeqCst) == side as i32
    }

    /// Hand the turn to `side`
    pub fn set_turn(&self, side: Turn) {
        self.turn.store(side as i32, Ordering::SeqCst);
    }

    /// Last bit recorded by either side
    pub fn bit_value(&self) -> i32 {
        self.bit_value.load(Ordering::SeqCst)
    }

    /// Record the bit just sent or decoded
    pub fn set_bit_value(&self, bit: u8) {
        self.bit_value.store(bit as i32, Ordering::SeqCst);
    }

    /// Published message length (0 = not yet sent)
    pub fn msg_len(&self) -> i32 {
        self.msg_len.load(Ordering::SeqCst)
    }

    /// Publish the message length
    pub fn set_msg_len(&self, len: i32) {
        self.msg_len.store(len, Ordering::SeqCst);
    }

    /// Check if the session was marked finished
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst) != 0
    }

    /// Mark the session finished
    pub fn set_done(&self) {
        self.done.store(1, Ordering::SeqCst);
    }

    /// The signaling line
    pub fn target_line(&self) -> &CacheLine {
        &self.target_line
    }

    /// Copy all control fields
    pub fn snapshot(&self) -> RegionSnapshot {
        RegionSnapshot {
            ready: self.is_ready(),
            turn: self.turn.load(Ordering::SeqCst),
            bit_value: self.bit_value(),
            msg_len: self.msg_len(),
            done: self.is_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LINE_FILL;

    #[test]
    fn test_layout() {
        assert_eq!(SHARED_REGION_SIZE, 128);
        assert_eq!(std::mem::align_of::<CacheLine>(), CACHELINE);
        let region = SharedRegion::default();
        assert_eq!(region.target_line().as_ptr() as usize % CACHELINE, 0);
    }

    #[test]
    fn test_turn_from_raw() {
        assert_eq!(Turn::from_raw(0), Some(Turn::Sender));
        assert_eq!(Turn::from_raw(1), Some(Turn::Receiver));
        assert_eq!(Turn::from_raw(7), None);
    }

    #[test]
    fn test_reinitialize_resets_everything() {
        let region = SharedRegion::default();
        region.publish_ready();
        region.set_turn(Turn::Receiver);
        region.set_bit_value(1);
        region.set_msg_len(42);
        region.set_done();

        region.reinitialize(LINE_FILL);

        assert_eq!(
            region.snapshot(),
            RegionSnapshot {
                ready: false,
                turn: Turn::Sender as i32,
                bit_value: 0,
                msg_len: 0,
                done: false,
            }
        );
        assert!(region.target_line().bytes().iter().all(|&b| b == LINE_FILL));
    }

    #[test]
    fn test_unknown_turn_belongs_to_nobody() {
        let region = SharedRegion::default();
        region.turn.store(5, Ordering::SeqCst);
        assert_eq!(region.turn(), None);
        assert!(!region.is_turn(Turn::Sender));
        assert!(!region.is_turn(Turn::Receiver));
    }
}
