use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);

const MIN_RTO: Duration = Duration::from_millis(100);
pub(crate) const MAX_RTO: Duration = Duration::from_millis(2000);

/// Whether a user packet travelled the reliable or the unreliable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Reliable,
    Unreliable,
}

/// Smoothed round-trip estimate in milliseconds.
#[derive(Debug, Clone)]
pub struct RoundTripTime {
    srtt: f32,
    rtt_var: f32,
    samples: u64,
}

impl Default for RoundTripTime {
    fn default() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
            samples: 0,
        }
    }
}

impl RoundTripTime {
    pub fn update(&mut self, sample: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = sample.as_secs_f32() * 1000.0;
        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        self.samples += 1;
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var_ms(&self) -> f32 {
        self.rtt_var
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Retransmission timeout derived from the current estimate.
    pub fn rto(&self) -> Duration {
        let rto_ms = self.srtt + 4.0 * self.rtt_var;
        Duration::from_secs_f32(rto_ms.max(0.0) / 1000.0).clamp(MIN_RTO, MAX_RTO)
    }
}

/// Bytes per second over the last complete window.
#[derive(Debug, Clone)]
pub struct DataRate {
    window_start: Instant,
    window_bytes: u64,
    bytes_per_sec: f32,
}

impl DataRate {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
            bytes_per_sec: 0.0,
        }
    }

    pub fn record(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.window_bytes += bytes as u64;
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            self.bytes_per_sec = self.window_bytes as f32 / elapsed.as_secs_f32();
            self.window_bytes = 0;
            self.window_start = now;
        }
    }

    /// Rate as of `now`. A window that ended without further traffic is
    /// averaged over the whole idle span.
    pub fn bytes_per_sec(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            self.window_bytes as f32 / elapsed.as_secs_f32()
        } else {
            self.bytes_per_sec
        }
    }
}

/// Per-connection counters and derived statistics. Written only by the
/// owning connection through the `record_*` methods.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    reliable_packets_sent: u64,
    unreliable_packets_sent: u64,
    reliable_packets_received: u64,
    unreliable_packets_received: u64,
    datagrams_sent: u64,
    datagrams_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    packets_resent: u64,
    packets_lost: u64,
    packets_acked: u64,
    rtt: RoundTripTime,
    send_rate: DataRate,
    receive_rate: DataRate,
    created_at: Instant,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl ConnectionMetrics {
    pub fn new(now: Instant) -> Self {
        Self {
            reliable_packets_sent: 0,
            unreliable_packets_sent: 0,
            reliable_packets_received: 0,
            unreliable_packets_received: 0,
            datagrams_sent: 0,
            datagrams_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packets_resent: 0,
            packets_lost: 0,
            packets_acked: 0,
            rtt: RoundTripTime::default(),
            send_rate: DataRate::new(now),
            receive_rate: DataRate::new(now),
            created_at: now,
        }
    }

    pub fn record_packet_sent(&mut self, kind: PacketKind) {
        match kind {
            PacketKind::Reliable => self.reliable_packets_sent += 1,
            PacketKind::Unreliable => self.unreliable_packets_sent += 1,
        }
    }

    pub fn record_packet_received(&mut self, kind: PacketKind) {
        match kind {
            PacketKind::Reliable => self.reliable_packets_received += 1,
            PacketKind::Unreliable => self.unreliable_packets_received += 1,
        }
    }

    pub fn record_datagram_sent(&mut self, bytes: usize, now: Instant) {
        self.datagrams_sent += 1;
        self.bytes_sent += bytes as u64;
        self.send_rate.record(bytes, now);
    }

    pub fn record_datagram_received(&mut self, bytes: usize, now: Instant) {
        self.datagrams_received += 1;
        self.bytes_received += bytes as u64;
        self.receive_rate.record(bytes, now);
    }

    pub fn record_resent(&mut self) {
        self.packets_resent += 1;
    }

    pub fn record_lost(&mut self) {
        self.packets_lost += 1;
    }

    pub fn record_acked(&mut self, rtt_sample: Duration) {
        self.packets_acked += 1;
        self.rtt.update(rtt_sample);
    }

    /// User packets accepted for sending, reliable and unreliable.
    pub fn packets_sent(&self) -> u64 {
        self.reliable_packets_sent + self.unreliable_packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.reliable_packets_received + self.unreliable_packets_received
    }

    pub fn reliable_packets_sent(&self) -> u64 {
        self.reliable_packets_sent
    }

    pub fn unreliable_packets_sent(&self) -> u64 {
        self.unreliable_packets_sent
    }

    pub fn reliable_packets_received(&self) -> u64 {
        self.reliable_packets_received
    }

    pub fn unreliable_packets_received(&self) -> u64 {
        self.unreliable_packets_received
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent
    }

    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn packets_resent(&self) -> u64 {
        self.packets_resent
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn packets_acked(&self) -> u64 {
        self.packets_acked
    }

    pub fn round_trip_time(&self) -> &RoundTripTime {
        &self.rtt
    }

    pub fn send_rate(&self, now: Instant) -> f32 {
        self.send_rate.bytes_per_sec(now)
    }

    pub fn receive_rate(&self, now: Instant) -> f32 {
        self.receive_rate.bytes_per_sec(now)
    }

    /// Fraction of sent datagrams that were dropped, as a percentage.
    pub fn packet_loss_percent(&self) -> f32 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        (self.packets_lost as f32 / self.datagrams_sent as f32) * 100.0
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
