//! Message framing
//!
//! A message of `n` bytes travels as `n * 8` bits: byte 0 first, and within
//! each byte bit 0 (least significant) first.
//!
//! ```text
//! 0x48 'H' -> 0 0 0 1 0 0 1 0
//! 0x49 'I' -> 1 0 0 1 0 0 1 0
//! ```

use crate::{ChannelError, MESSAGE_MAX_LEN};

/// Check a message length against `1..=MESSAGE_MAX_LEN`
pub fn validate_length(len: i64) -> Result<usize, ChannelError> {
    if (1..=MESSAGE_MAX_LEN as i64).contains(&len) {
        Ok(len as usize)
    } else {
        Err(ChannelError::InvalidMessageLength(len))
    }
}

/// Bit `i` of the message stream (0 or 1)
#[inline]
pub fn bit_at(msg: &[u8], i: usize) -> u8 {
    (msg[i / 8] >> (i % 8)) & 1
}

/// Expand a message into its bit stream
pub fn encode_bits(msg: &[u8]) -> Vec<u8> {
    (0..msg.len() * 8).map(|i| bit_at(msg, i)).collect()
}

/// Pack a bit stream back into bytes. Returns `None` if the stream is not a whole number of bytes.
pub fn decode_bits(bits: &[u8]) -> Option<Vec<u8>> {
    if bits.len() % 8 != 0 {
        return None;
    }
    Some(
        bits.chunks_exact(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (k, &bit)| byte | ((bit & 1) << k))
            })
            .collect(),
    )
}
