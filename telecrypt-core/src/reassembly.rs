//! Receive-side accumulation of one message.
//!
//! Units are appended in arrival order. Headered units also record their
//! sequence number so out-of-order arrivals are put back in order on take, and
//! so completion can be detected without waiting for inactivity. Growth is
//! bounded by a byte limit and fallible; on failure the partial message is
//! dropped and the error says whether the node should restart.

use std::fmt;

use serde::Deserialize;
use tokio::time::{Duration, Instant};

use crate::chunk::Arrival;
use crate::cipher::BLOCK_SIZE;

/// What the receiving node does when the reassembly buffer cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocPolicy {
    /// Treat as fatal; the host exits so its supervisor restarts it.
    #[default]
    Restart,
    /// Drop the partial message and keep receiving.
    Discard,
}

impl fmt::Display for AllocPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocPolicy::Restart => "restart",
            AllocPolicy::Discard => "discard",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("cannot grow reassembly buffer by {requested} bytes while holding {held} (policy: {policy})")]
    AllocationFailure {
        requested: usize,
        held: usize,
        policy: AllocPolicy,
    },
    #[error("accumulated {len} bytes is not a whole number of blocks; message discarded")]
    Malformed { len: usize },
    #[error("only {received} of {total} frames arrived; message discarded")]
    Incomplete { received: usize, total: u16 },
}

impl ReassemblyError {
    /// True when the receiver should stop and let the host restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReassemblyError::AllocationFailure {
                policy: AllocPolicy::Restart,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// More units are expected (or, for raw framing, may follow).
    Accumulating,
    /// Every frame of a headered message is present.
    Complete,
    /// A headered frame whose sequence was already held; ignored.
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    sequence: usize,
    start: usize,
    len: usize,
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    data: Vec<u8>,
    segments: Vec<Segment>,
    expected: Option<u16>,
    last_arrival: Option<Instant>,
    max_len: usize,
    policy: AllocPolicy,
}

impl ReassemblyBuffer {
    pub fn new(max_len: usize, policy: AllocPolicy) -> Self {
        Self {
            data: Vec::new(),
            segments: Vec::new(),
            expected: None,
            last_arrival: None,
            max_len,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Units held for the current message.
    pub fn units(&self) -> usize {
        self.segments.len()
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.last_arrival
    }

    pub fn append(
        &mut self,
        arrival: Arrival,
        now: Instant,
    ) -> Result<AppendOutcome, ReassemblyError> {
        let (sequence, payload) = match arrival {
            Arrival::Framed {
                sequence,
                total,
                payload,
            } => {
                match self.expected {
                    Some(expected) if expected != total => {
                        tracing::warn!(
                            expected,
                            total,
                            held = self.segments.len(),
                            "frame total changed mid-message; discarding partial message"
                        );
                        self.reset();
                        self.expected = Some(total);
                    }
                    None => self.expected = Some(total),
                    Some(_) => {}
                }
                if self.segments.iter().any(|s| s.sequence == sequence as usize) {
                    tracing::debug!(sequence, "duplicate frame ignored");
                    return Ok(AppendOutcome::Duplicate);
                }
                (sequence as usize, payload)
            }
            Arrival::Raw(payload) => (self.segments.len(), payload),
        };

        self.grow(payload.len())?;
        let start = self.data.len();
        self.data.extend_from_slice(&payload);
        self.segments.push(Segment {
            sequence,
            start,
            len: payload.len(),
        });
        self.last_arrival = Some(now);

        Ok(if self.is_complete() {
            AppendOutcome::Complete
        } else {
            AppendOutcome::Accumulating
        })
    }

    fn grow(&mut self, additional: usize) -> Result<(), ReassemblyError> {
        let held = self.data.len();
        let fits = held
            .checked_add(additional)
            .is_some_and(|needed| needed <= self.max_len);
        if fits && self.data.try_reserve(additional).is_ok() {
            return Ok(());
        }
        self.reset();
        Err(ReassemblyError::AllocationFailure {
            requested: additional,
            held,
            policy: self.policy,
        })
    }

    /// Every frame of a headered message is held. Raw messages are never complete.
    pub fn is_complete(&self) -> bool {
        self.expected
            .is_some_and(|total| self.segments.len() == total as usize)
    }

    /// When inactivity would end the current message, if one is in progress.
    pub fn deadline(&self, inactivity: Duration) -> Option<Instant> {
        self.last_arrival.map(|t| t + inactivity)
    }

    pub fn is_idle(&self, now: Instant, inactivity: Duration) -> bool {
        self.deadline(inactivity).is_some_and(|d| now >= d)
    }

    /// Hand over the accumulated ciphertext in sequence order and reset for the next
    /// message. Incomplete headered messages and non-block-multiple lengths are
    /// discarded with an error.
    pub fn take_message(&mut self) -> Result<Vec<u8>, ReassemblyError> {
        let result = self.assemble();
        self.reset();
        result
    }

    fn assemble(&mut self) -> Result<Vec<u8>, ReassemblyError> {
        if let Some(total) = self.expected {
            if self.segments.len() != total as usize {
                return Err(ReassemblyError::Incomplete {
                    received: self.segments.len(),
                    total,
                });
            }
        }
        if self.data.len() % BLOCK_SIZE != 0 {
            return Err(ReassemblyError::Malformed {
                len: self.data.len(),
            });
        }
        let in_order = self
            .segments
            .windows(2)
            .all(|w| w[0].sequence < w[1].sequence);
        if in_order {
            return Ok(std::mem::take(&mut self.data));
        }
        let mut segments = self.segments.clone();
        segments.sort_by_key(|s| s.sequence);
        let mut out = Vec::with_capacity(self.data.len());
        for s in segments {
            out.extend_from_slice(&self.data[s.start..s.start + s.len]);
        }
        Ok(out)
    }

    /// Drop everything held. Capacity is kept for the next message.
    pub fn reset(&mut self) {
        self.data.clear();
        self.segments.clear();
        self.expected = None;
        self.last_arrival = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(sequence: u16, total: u16, payload: &[u8]) -> Arrival {
        Arrival::Framed {
            sequence,
            total,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn headered_completes_on_last_frame() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        assert_eq!(
            buf.append(framed(0, 2, &[1; 16]), now).unwrap(),
            AppendOutcome::Accumulating
        );
        assert_eq!(
            buf.append(framed(1, 2, &[2; 16]), now).unwrap(),
            AppendOutcome::Complete
        );
        let msg = buf.take_message().unwrap();
        assert_eq!(&msg[..16], &[1u8; 16]);
        assert_eq!(&msg[16..], &[2u8; 16]);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn out_of_order_frames_are_reordered() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        buf.append(framed(2, 3, &[3; 8]), now).unwrap();
        buf.append(framed(0, 3, &[1; 16]), now).unwrap();
        assert_eq!(
            buf.append(framed(1, 3, &[2; 8]), now).unwrap(),
            AppendOutcome::Complete
        );
        let msg = buf.take_message().unwrap();
        let mut expected = vec![1u8; 16];
        expected.extend_from_slice(&[2u8; 8]);
        expected.extend_from_slice(&[3u8; 8]);
        assert_eq!(msg, expected);
    }

    #[test]
    fn duplicate_sequence_is_ignored() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        buf.append(framed(0, 2, &[1; 16]), now).unwrap();
        assert_eq!(
            buf.append(framed(0, 2, &[9; 16]), now).unwrap(),
            AppendOutcome::Duplicate
        );
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn total_change_starts_new_message() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        buf.append(framed(0, 3, &[1; 16]), now).unwrap();
        assert_eq!(
            buf.append(framed(0, 1, &[7; 16]), now).unwrap(),
            AppendOutcome::Complete
        );
        assert_eq!(buf.take_message().unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn incomplete_headered_message_is_discarded() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        buf.append(framed(0, 3, &[1; 16]), now).unwrap();
        assert!(matches!(
            buf.take_message(),
            Err(ReassemblyError::Incomplete {
                received: 1,
                total: 3
            })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn raw_units_concatenate_in_arrival_order() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        for b in [1u8, 2, 3, 4] {
            assert_eq!(
                buf.append(Arrival::Raw(vec![b; 4]), now).unwrap(),
                AppendOutcome::Accumulating
            );
        }
        assert!(!buf.is_complete());
        let msg = buf.take_message().unwrap();
        assert_eq!(msg, [[1u8; 4], [2; 4], [3; 4], [4; 4]].concat());
    }

    #[test]
    fn partial_block_is_malformed() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        buf.append(Arrival::Raw(vec![0; 20]), now).unwrap();
        assert!(matches!(
            buf.take_message(),
            Err(ReassemblyError::Malformed { len: 20 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn over_limit_fails_per_policy() {
        let now = Instant::now();
        let mut buf = ReassemblyBuffer::new(32, AllocPolicy::Restart);
        buf.append(Arrival::Raw(vec![0; 16]), now).unwrap();
        let err = buf.append(Arrival::Raw(vec![0; 32]), now).unwrap_err();
        assert!(err.is_fatal());
        assert!(buf.is_empty());

        let mut buf = ReassemblyBuffer::new(32, AllocPolicy::Discard);
        let err = buf.append(Arrival::Raw(vec![0; 48]), now).unwrap_err();
        assert!(matches!(
            err,
            ReassemblyError::AllocationFailure {
                requested: 48,
                held: 0,
                policy: AllocPolicy::Discard
            }
        ));
        assert!(!err.is_fatal());
        buf.append(Arrival::Raw(vec![0; 16]), now).unwrap();
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn idle_after_inactivity_window() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut buf = ReassemblyBuffer::new(1024, AllocPolicy::Restart);
        assert!(!buf.is_idle(start + window, window));
        assert_eq!(buf.deadline(window), None);
        buf.append(Arrival::Raw(vec![0; 16]), start).unwrap();
        assert!(!buf.is_idle(start + Duration::from_millis(99), window));
        assert!(buf.is_idle(start + window, window));
        assert_eq!(buf.deadline(window), Some(start + window));
    }
}
