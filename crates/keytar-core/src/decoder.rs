//! Packet decoder: raw status report → active-switch set.
//!
//! The keyboard reports its switches in bytes 5 through 8, most-significant
//! bit first:
//!
//! ```text
//! byte:   5         6         7         8
//! bit:    76543210  76543210  76543210  7-------
//! index:  0......7  8.....15  16....23  24
//! ```
//!
//! The low seven bits of byte 8 carry device data that is not a switch and
//! are ignored.

use crate::error::{CoreError, CoreResult};
use crate::types::{ActiveSet, SwitchIndex};

/// Offset of the first byte holding switch bits.
pub const SWITCH_BYTE_OFFSET: usize = 5;

/// Shortest buffer [`decode`] accepts.
pub const MIN_PACKET_LEN: usize = 9;

/// Length of a full status report from the device.
pub const REPORT_LEN: usize = 27;

/// Byte offset and bit mask holding `index`.
const fn bit_position(index: SwitchIndex) -> (usize, u8) {
    let i = index.get() as usize;
    (SWITCH_BYTE_OFFSET + i / 8, 0x80 >> (i % 8))
}

/// Decode one status report into the set of pressed switches.
///
/// Pure and deterministic. Buffers longer than [`MIN_PACKET_LEN`] are
/// accepted and the trailing bytes ignored.
///
/// # Errors
///
/// Returns [`CoreError::MalformedPacket`] if `buffer` is shorter than
/// [`MIN_PACKET_LEN`]. No partial result is produced.
///
/// # Example
///
/// ```
/// use keytar_core::{decode, SwitchIndex};
///
/// let mut report = [0u8; 27];
/// report[5] = 0b1000_0001;
/// let set = decode(&report).unwrap();
/// assert_eq!(
///     set.to_sorted_vec(),
///     vec![SwitchIndex::new(0).unwrap(), SwitchIndex::new(7).unwrap()]
/// );
/// ```
pub fn decode(buffer: &[u8]) -> CoreResult<ActiveSet> {
    if buffer.len() < MIN_PACKET_LEN {
        return Err(CoreError::MalformedPacket {
            len: buffer.len(),
            required: MIN_PACKET_LEN,
        });
    }

    Ok(SwitchIndex::all()
        .filter(|index| {
            let (byte, mask) = bit_position(*index);
            buffer[byte] & mask != 0
        })
        .collect())
}

/// Build a full-length report whose switch bytes encode `set`.
///
/// Every other byte is zero. `decode(&encode(set)) == Ok(set)` for any set;
/// simulated devices and tests use this to produce reports.
pub fn encode(set: ActiveSet) -> [u8; REPORT_LEN] {
    let mut report = [0u8; REPORT_LEN];
    for index in set.iter() {
        let (byte, mask) = bit_position(index);
        report[byte] |= mask;
    }
    report
}
