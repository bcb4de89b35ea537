use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::id::sequence_greater_than;
use crate::metrics::MAX_RTO;

#[derive(Debug, Clone)]
struct ReliableMessage {
    sequence: u32,
    packet_type: u16,
    payload: Vec<u8>,
    attempts: u32,
    last_sent: Option<Instant>,
}

/// A reliable message due for (re)transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReliable {
    pub sequence: u32,
    pub packet_type: u16,
    pub payload: Vec<u8>,
    pub retransmit: bool,
}

/// Returned when a message used up every transmission attempt without an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted {
    pub sequence: u32,
    pub attempts: u32,
}

/// Outgoing reliable messages awaiting acknowledgment.
///
/// Only messages within `max_in_flight` sequences of the oldest unacked one
/// are transmitted, so nothing is sent past the receiver's window while the
/// head is missing. A message is retransmitted once `rto * 2^(attempts - 1)`
/// (capped at the maximum RTO) has passed since its last transmission, for at
/// most `max_attempts` transmissions in total.
#[derive(Debug)]
pub struct ReliableSender {
    next_sequence: u32,
    queue: VecDeque<ReliableMessage>,
    capacity: usize,
    max_in_flight: usize,
    max_attempts: u32,
}

impl ReliableSender {
    pub fn new(capacity: usize, max_in_flight: usize, max_attempts: u32) -> Self {
        Self {
            next_sequence: 0,
            queue: VecDeque::with_capacity(capacity),
            capacity,
            max_in_flight: max_in_flight.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queues a message; `None` when the queue is full.
    pub fn push(&mut self, packet_type: u16, payload: Vec<u8>) -> Option<u32> {
        if self.queue.len() >= self.capacity {
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.queue.push_back(ReliableMessage {
            sequence,
            packet_type,
            payload,
            attempts: 0,
            last_sent: None,
        });
        Some(sequence)
    }

    pub fn acknowledge(&mut self, sequence: u32) -> bool {
        match self.queue.iter().position(|m| m.sequence == sequence) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Collects the messages due at `now`, oldest first, among those less
    /// than `max_in_flight` sequences past the oldest unacked message.
    pub fn poll(&mut self, now: Instant, rto: Duration) -> Result<Vec<OutgoingReliable>, RetryExhausted> {
        let mut due = Vec::new();
        let Some(oldest) = self.queue.front().map(|m| m.sequence) else {
            return Ok(due);
        };
        let window = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);

        for message in self.queue.iter_mut() {
            if message.sequence.wrapping_sub(oldest) >= window {
                break;
            }
            if let Some(last_sent) = message.last_sent {
                if now.saturating_duration_since(last_sent) < backoff(rto, message.attempts) {
                    continue;
                }
                if message.attempts >= self.max_attempts {
                    return Err(RetryExhausted {
                        sequence: message.sequence,
                        attempts: message.attempts,
                    });
                }
            }

            message.attempts += 1;
            message.last_sent = Some(now);
            due.push(OutgoingReliable {
                sequence: message.sequence,
                packet_type: message.packet_type,
                payload: message.payload.clone(),
                retransmit: message.attempts > 1,
            });
        }

        Ok(due)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn backoff(rto: Duration, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    rto.saturating_mul(1 << shift).min(MAX_RTO)
}

/// Delivers reliable messages in sequence order, holding early arrivals
/// until the gap before them fills.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    pending: BTreeMap<u32, (u16, Vec<u8>)>,
    window: u32,
}

impl ReliableReceiver {
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            window: window.max(1) as u32,
        }
    }

    /// Returns every message that became deliverable, in order. Duplicates
    /// and messages beyond the receive window are discarded.
    pub fn receive(&mut self, sequence: u32, packet_type: u16, payload: Vec<u8>) -> Vec<(u16, Vec<u8>)> {
        let mut ready = Vec::new();

        if sequence == self.next_expected {
            ready.push((packet_type, payload));
            self.next_expected = self.next_expected.wrapping_add(1);
            while let Some(next) = self.pending.remove(&self.next_expected) {
                ready.push(next);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
        } else if sequence_greater_than(sequence, self.next_expected)
            && sequence.wrapping_sub(self.next_expected) < self.window
        {
            self.pending.entry(sequence).or_insert((packet_type, payload));
        }

        ready
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
