use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Artificial network degradation applied to outgoing traffic. All zero
/// means no degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "QualitySettings")]
pub struct ConnectionQuality {
    loss_percentage: i32,
    latency: Duration,
    variance: Duration,
}

/// Unchecked form read from configuration files.
#[derive(Deserialize)]
#[serde(default)]
struct QualitySettings {
    loss_percentage: i32,
    latency: Duration,
    variance: Duration,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            loss_percentage: 0,
            latency: Duration::ZERO,
            variance: Duration::ZERO,
        }
    }
}

impl From<QualitySettings> for ConnectionQuality {
    fn from(settings: QualitySettings) -> Self {
        Self::new(settings.loss_percentage, settings.latency, settings.variance)
    }
}

impl ConnectionQuality {
    pub fn new(loss_percentage: i32, latency: Duration, variance: Duration) -> Self {
        Self {
            loss_percentage: loss_percentage.clamp(0, 100),
            latency,
            variance,
        }
    }

    pub fn loss_percentage(&self) -> i32 {
        self.loss_percentage
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn variance(&self) -> Duration {
        self.variance
    }

    pub fn set_loss_percentage(&mut self, loss_percentage: i32) {
        self.loss_percentage = loss_percentage.clamp(0, 100);
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    pub fn set_variance(&mut self, variance: Duration) {
        self.variance = variance;
    }

    pub fn is_degraded(&self) -> bool {
        self.loss_percentage > 0 || !self.latency.is_zero() || !self.variance.is_zero()
    }

    pub fn should_drop(&self) -> bool {
        if self.loss_percentage <= 0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percentage as f32
    }

    /// Latency plus a uniform offset in `[-variance, +variance]`, never negative.
    pub fn sample_delay(&self) -> Duration {
        if self.variance.is_zero() {
            return self.latency;
        }
        let span = self.variance.mul_f32(2.0 * rand_percent());
        (self.latency + span).saturating_sub(self.variance)
    }
}

#[derive(Debug)]
struct Delayed<T> {
    release_time: Instant,
    order: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Holds items until their release time. Items released at the same instant
/// come out in insertion order.
#[derive(Debug)]
pub struct LatencyQueue<T> {
    heap: BinaryHeap<Delayed<T>>,
    next_order: u64,
}

impl<T> Default for LatencyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatencyQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }

    pub fn push(&mut self, item: T, release_time: Instant) {
        let order = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        self.heap.push(Delayed {
            release_time,
            order,
            item,
        });
    }

    pub fn take_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while self.heap.peek().is_some_and(|d| d.release_time <= now) {
            if let Some(delayed) = self.heap.pop() {
                ready.push(delayed.item);
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Uniform value in `[0, 1)`.
pub(crate) fn rand_percent() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

pub(crate) fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
    );
    hasher.finish()
}
