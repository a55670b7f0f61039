//! Latency and message statistics.
//!
//! RTT samples from the three probe paths (direct, via relay, local
//! network) are collected per peer in a fixed ring of the most recent
//! samples; roll-ups compute order statistics over a sorted copy. All
//! statistics are advisory: they inform the UI and the relay, never the
//! data path.

use std::fmt;

use serde::Serialize;

/// Default ring capacity of a [`PingStatCollector`].
pub const PING_RING_SIZE: usize = 2048;

// ────────────────────────────────────────────────────────────────────────────
// Ping statistics
// ────────────────────────────────────────────────────────────────────────────

/// Ring-buffer collector for round-trip times of one probe path to one
/// peer.
pub struct PingStatCollector {
    data: Vec<f64>,
    idx: usize,
    filled: usize,
    sum: f64,
    /// Probes sent since creation.
    pub sent: u64,
    /// Echoes received since creation.
    pub received: u64,
    state_sent: u64,
    state_received: u64,
}

impl Default for PingStatCollector {
    fn default() -> Self {
        Self::new(PING_RING_SIZE)
    }
}

impl PingStatCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity.max(1)],
            idx: 0,
            filled: 0,
            sum: 0.0,
            sent: 0,
            received: 0,
            state_sent: 0,
            state_received: 0,
        }
    }

    /// Record one round-trip time in milliseconds.
    pub fn add_value(&mut self, rtt_ms: f64) {
        self.received += 1;
        self.sum -= self.data[self.idx];
        self.data[self.idx] = rtt_ms;
        self.sum += rtt_ms;
        self.idx += 1;
        if self.idx >= self.data.len() {
            self.idx = 0;
        }
        if self.filled < self.data.len() {
            self.filled += 1;
        }
    }

    /// Produce a report over the ring and the probes seen since the
    /// previous roll-up, then mark the roll-up point. `received` and
    /// `lost` count the interval, the quantiles describe the ring.
    pub fn rollup(&mut self) -> PingStat {
        let mut stat = PingStat {
            received: self.received - self.state_received,
            ..PingStat::default()
        };
        let sent_interval = self.sent - self.state_sent;
        stat.lost = sent_interval.saturating_sub(stat.received);
        self.state_sent = self.sent;
        self.state_received = self.received;

        if self.filled == 0 {
            return stat;
        }

        let mut sorted = self.data[..self.filled].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("RTT samples are finite"));
        let idx_med = (0.5 * (self.filled - 1) as f64).round() as usize;
        let idx_p99 = (0.99 * (self.filled - 1) as f64).round() as usize;
        stat.t_med = sorted[idx_med];
        if self.filled % 2 == 0 {
            // Even number of samples: median is the mean of the two
            // neighbouring order statistics.
            stat.t_med += if idx_med > 0 {
                sorted[idx_med - 1]
            } else {
                sorted[idx_med + 1]
            };
            stat.t_med *= 0.5;
        }
        stat.t_min = sorted[0];
        stat.t_p99 = sorted[idx_p99];
        stat.t_mean = self.sum / self.filled as f64;
        stat
    }
}

/// One latency roll-up. Times are in milliseconds; `-1.0` means "no
/// samples yet".
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PingStat {
    pub t_min: f64,
    pub t_med: f64,
    pub t_p99: f64,
    pub t_mean: f64,
    /// Echoes received since the previous roll-up.
    pub received: u64,
    /// Probes without an echo since the previous roll-up.
    pub lost: u64,
}

impl Default for PingStat {
    fn default() -> Self {
        Self {
            t_min: -1.0,
            t_med: -1.0,
            t_p99: -1.0,
            t_mean: -1.0,
            received: 0,
            lost: 0,
        }
    }
}

impl fmt::Display for PingStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min={:.2}ms median={:.2}ms p99={:.2}ms mean={:.2}ms received={} lost={}",
            self.t_min, self.t_med, self.t_p99, self.t_mean, self.received, self.lost
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Message statistics
// ────────────────────────────────────────────────────────────────────────────

/// Per-peer counters maintained by the message sorter.
///
/// `lost` is signed on purpose: a dropout charges the gap width, and a
/// late arrival of an older message compensates it back, so a repaired
/// swap nets to zero loss. Reports clamp at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageStat {
    pub received: u64,
    pub lost: i64,
    /// Arrivals whose sequence went backwards.
    pub seqerr_in: u64,
    /// Emissions whose sequence went backwards (not repaired in time).
    pub seqerr_out: u64,
}

impl MessageStat {
    /// Counters accumulated since `prev` (a snapshot of the same peer's
    /// statistics at the previous report).
    pub fn since(&self, prev: &MessageStat) -> MessageStat {
        MessageStat {
            received: self.received.saturating_sub(prev.received),
            lost: (self.lost - prev.lost).max(0),
            seqerr_in: self.seqerr_in.saturating_sub(prev.seqerr_in),
            seqerr_out: self.seqerr_out.saturating_sub(prev.seqerr_out),
        }
    }

    /// Messages that were received out of order but emitted in order.
    pub fn recovered(&self) -> u64 {
        self.seqerr_in.saturating_sub(self.seqerr_out)
    }
}

impl fmt::Display for MessageStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lost = self.lost.max(0) as u64;
        let pct = 100.0 * lost as f64 / (self.received + lost).max(1) as f64;
        write!(
            f,
            "received={} lost={} ({:.2}%) seqerr={} recovered={}",
            self.received,
            lost,
            pct,
            self.seqerr_in,
            self.recovered()
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-peer roll-up
// ────────────────────────────────────────────────────────────────────────────

/// Everything the periodic reporter knows about one peer: message
/// counters since the previous report and one latency roll-up per probe
/// path.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClientStats {
    pub packages: MessageStat,
    pub ping_p2p: PingStat,
    pub ping_srv: PingStat,
    pub ping_local: PingStat,
}
