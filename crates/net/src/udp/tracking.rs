use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::id::sequence_greater_than;

pub const SENT_WINDOW_SIZE: usize = 1024;
const RECENT_SEQUENCES: usize = 128;

/// What a sent datagram carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Control,
    Unreliable,
    Reliable(u32),
}

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub sequence: u32,
    pub kind: SentKind,
    pub sent_at: Instant,
    pub acked: bool,
}

/// Fixed-size ring of recently sent datagrams, indexed by `sequence % size`.
/// A newer sequence overwrites its slot, which ages the older one out.
#[derive(Debug)]
pub struct SentWindow {
    records: Vec<Option<SentRecord>>,
}

impl Default for SentWindow {
    fn default() -> Self {
        Self::new(SENT_WINDOW_SIZE)
    }
}

impl SentWindow {
    pub fn new(size: usize) -> Self {
        Self {
            records: (0..size.max(1)).map(|_| None).collect(),
        }
    }

    fn slot(&self, sequence: u32) -> usize {
        sequence as usize % self.records.len()
    }

    pub fn insert(&mut self, sequence: u32, kind: SentKind, now: Instant) {
        let slot = self.slot(sequence);
        self.records[slot] = Some(SentRecord {
            sequence,
            kind,
            sent_at: now,
            acked: false,
        });
    }

    pub fn get(&self, sequence: u32) -> Option<&SentRecord> {
        self.records[self.slot(sequence)]
            .as_ref()
            .filter(|r| r.sequence == sequence)
    }

    /// Marks `sequence` acked. Returns what it carried and its round trip the
    /// first time; `None` if unknown, aged out or already acked.
    pub fn acknowledge(&mut self, sequence: u32, now: Instant) -> Option<(SentKind, Duration)> {
        let slot = self.slot(sequence);
        let record = self.records[slot]
            .as_mut()
            .filter(|r| r.sequence == sequence && !r.acked)?;
        record.acked = true;
        Some((record.kind, now.saturating_duration_since(record.sent_at)))
    }
}

/// Remembers which remote sequences arrived, for duplicate filtering and for
/// the ack fields of outgoing headers.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: Option<u32>,
    received_bitfield: u32,
    recent_sequences: VecDeque<u32>,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: None,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(RECENT_SEQUENCES),
        }
    }

    /// Returns false for a duplicate.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= RECENT_SEQUENCES {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        let Some(last) = self.last_received else {
            self.last_received = Some(sequence);
            return true;
        };

        if sequence_greater_than(sequence, last) {
            let diff = sequence.wrapping_sub(last);
            self.received_bitfield = if diff < 32 {
                (self.received_bitfield << diff) | (1 << (diff - 1))
            } else if diff == 32 {
                1 << 31
            } else {
                0
            };
            self.last_received = Some(sequence);
        } else {
            let diff = last.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn ack_data(&self) -> (Option<u32>, u32) {
        (self.last_received, self.received_bitfield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, Some(3));
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, Some(3));
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_gap_is_not_acked() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(0);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, Some(2));
        assert_eq!(bitfield & 0b11, 0b10);
    }

    #[test]
    fn test_nothing_received_acks_nothing() {
        let tracker = ReceiveTracker::new();
        assert_eq!(tracker.ack_data(), (None, 0));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_sent_window_ack_once() {
        let now = Instant::now();
        let mut window = SentWindow::new(8);

        window.insert(3, SentKind::Unreliable, now);
        assert!(window.acknowledge(3, now).is_some());
        assert!(window.acknowledge(3, now).is_none());
        assert!(window.get(3).unwrap().acked);
    }

    #[test]
    fn test_sent_window_ages_out() {
        let now = Instant::now();
        let mut window = SentWindow::new(8);

        window.insert(1, SentKind::Unreliable, now);
        window.insert(9, SentKind::Control, now);

        assert!(window.get(1).is_none());
        assert!(window.acknowledge(1, now).is_none());
        assert_eq!(window.get(9).unwrap().kind, SentKind::Control);
    }
}
