//! Core data types shared by the broker and the clients.
//!
//! Key types:
//! - [`Role`]: what a connected peer declared itself to be
//! - [`SampleBatch`]: one multi-channel tick produced by a source
//! - [`SampleBlock`]: ticks of one source coalesced channel-wise (client side)
//! - [`SequenceTracker`]: per-source continuity and channel-count checks

use crate::error::{Error, Result};
use std::fmt;

/// Registry identifier of a connected peer
pub type ClientId = u32;

/// Role a peer declares over the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Connected but has not sent `eeg` or `display` yet
    #[default]
    Unassigned,
    /// Produces sample batches (`eeg`)
    Source,
    /// Consumes sample batches of the sources it watches (`display`)
    Subscriber,
}

impl Role {
    /// Name used on the wire (`status` and `role` replies)
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "Unassigned",
            Role::Source => "Source",
            Role::Subscriber => "Subscriber",
        }
    }

    /// Parse a role name as printed by [`Role::as_str`]
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "Unassigned" => Some(Role::Unassigned),
            "Source" => Some(Role::Source),
            "Subscriber" => Some(Role::Subscriber),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tick of multi-channel data
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Registry id of the producing client (0 until stamped by the broker)
    pub source_id: ClientId,
    /// Monotonically increasing per source
    pub sequence: u64,
    /// One value per channel
    pub values: Vec<f64>,
}

impl SampleBatch {
    /// Create a batch that has not been stamped with a source id yet
    pub fn new(sequence: u64, values: Vec<f64>) -> Self {
        Self {
            source_id: 0,
            sequence,
            values,
        }
    }

    /// Number of channels carried by this batch
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.values.len()
    }
}

/// Consecutive ticks of one source, stored channel-wise
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBlock {
    pub source_id: ClientId,
    /// Sequence number of every tick in the block, in arrival order
    pub sequences: Vec<u64>,
    /// `channels[c][i]` is the value of channel `c` at tick `sequences[i]`
    pub channels: Vec<Vec<f64>>,
}

impl SampleBlock {
    /// Create an empty block for `channel_count` channels
    pub fn new(source_id: ClientId, channel_count: usize) -> Self {
        Self {
            source_id,
            sequences: Vec::new(),
            channels: vec![Vec::new(); channel_count],
        }
    }

    /// Number of ticks in the block
    #[inline]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Append one tick; `values.len()` must match the block's channel count
    pub fn push(&mut self, sequence: u64, values: &[f64]) -> Result<()> {
        if values.len() != self.channels.len() {
            return Err(Error::ChannelCountMismatch {
                expected: self.channels.len(),
                actual: values.len(),
            });
        }
        self.sequences.push(sequence);
        for (channel, &value) in self.channels.iter_mut().zip(values) {
            channel.push(value);
        }
        Ok(())
    }

    /// Concatenate `other` after `self`, channel by channel
    ///
    /// An empty block adopts the shape of the first block appended to it.
    pub fn extend(&mut self, other: SampleBlock) -> Result<()> {
        if self.is_empty() && self.channels.iter().all(Vec::is_empty) {
            self.source_id = other.source_id;
            self.sequences = other.sequences;
            self.channels = other.channels;
            return Ok(());
        }
        if other.channels.len() != self.channels.len() {
            return Err(Error::ChannelCountMismatch {
                expected: self.channels.len(),
                actual: other.channels.len(),
            });
        }
        self.sequences.extend(other.sequences);
        for (dst, src) in self.channels.iter_mut().zip(other.channels) {
            dst.extend(src);
        }
        Ok(())
    }
}

/// Outcome of feeding a sequence number to a [`SequenceTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// First batch of the session, or exactly `previous + 1`
    InOrder,
    /// Sequence did not follow the previous one; processing continues
    Gap { expected: u64, actual: u64 },
}

/// Per-source sequence and channel-count bookkeeping
///
/// A sequence gap is informational. A channel-count change is an error,
/// since it means the source is malfunctioning.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_sequence: Option<u64>,
    channel_count: Option<usize>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel count established by the first observed batch
    pub fn channel_count(&self) -> Option<usize> {
        self.channel_count
    }

    /// Record one batch
    ///
    /// The channel count is checked before anything is recorded, so a
    /// rejected batch leaves the tracker untouched.
    pub fn observe(&mut self, sequence: u64, channel_count: usize) -> Result<Continuity> {
        match self.channel_count {
            Some(expected) if expected != channel_count => {
                return Err(Error::ChannelCountMismatch {
                    expected,
                    actual: channel_count,
                });
            }
            Some(_) => {}
            None => self.channel_count = Some(channel_count),
        }

        let continuity = match self.last_sequence {
            Some(last) if last.wrapping_add(1) != sequence => Continuity::Gap {
                expected: last.wrapping_add(1),
                actual: sequence,
            },
            _ => Continuity::InOrder,
        };
        self.last_sequence = Some(sequence);
        Ok(continuity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_round_trip() {
        for role in [Role::Unassigned, Role::Source, Role::Subscriber] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("EEG"), None);
    }

    #[test]
    fn test_tracker_in_order_and_gap() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(3, 1).unwrap(), Continuity::InOrder);
        assert_eq!(tracker.observe(4, 1).unwrap(), Continuity::InOrder);
        assert_eq!(
            tracker.observe(6, 1).unwrap(),
            Continuity::Gap {
                expected: 5,
                actual: 6
            }
        );
        // Continuity resumes from the new sequence
        assert_eq!(tracker.observe(7, 1).unwrap(), Continuity::InOrder);
    }

    #[test]
    fn test_tracker_channel_mismatch_leaves_state() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(0, 2).unwrap();
        let err = tracker.observe(1, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::ChannelCountMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(tracker.channel_count(), Some(2));
        assert_eq!(tracker.observe(1, 2).unwrap(), Continuity::InOrder);
    }

    #[test]
    fn test_block_push_and_extend() {
        let mut block = SampleBlock::new(0, 2);
        block.push(0, &[1.0, 2.0]).unwrap();
        assert!(block.push(1, &[1.0]).is_err());

        let mut other = SampleBlock::new(0, 2);
        other.push(1, &[3.0, 4.0]).unwrap();
        block.extend(other).unwrap();

        assert_eq!(block.sequences, vec![0, 1]);
        assert_eq!(block.channels, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn test_empty_block_adopts_shape() {
        let mut acc = SampleBlock::default();
        let mut block = SampleBlock::new(5, 3);
        block.push(9, &[1.0, 2.0, 3.0]).unwrap();
        acc.extend(block).unwrap();
        assert_eq!(acc.source_id, 5);
        assert_eq!(acc.channel_count(), 3);
        assert_eq!(acc.len(), 1);
    }
}
