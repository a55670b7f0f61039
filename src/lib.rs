//! Session transport engine for low-latency multi-party audio stages.
//!
//! A *stage* is an ephemeral session of up to 32 devices that exchange
//! UDP media and control datagrams through a relay server and, where
//! possible, directly peer-to-peer. Each device runs a [`StageClient`]
//! which registers with the relay, discovers peers, continuously probes
//! link quality, bridges incoming media streams to local UDP sinks and
//! forwards locally produced streams to the right set of remote
//! endpoints.
//!
//! The crate deliberately ends at the datagram boundary: audio
//! rendering, stage configuration discovery and the CLI are external
//! collaborators. The renderer talks to the client through plain UDP on
//! localhost; configuration arrives as one immutable [`StageConfig`];
//! lifecycle notifications leave through a [`StageEvent`] channel.
//!
//! ## Architecture
//!
//! ```text
//!  renderer ──UDP──► local socket ──► forwarding policy ──► peers / relay
//!  peers / relay ──► session socket ──► sorter ──► local UDP sinks
//!                          │
//!                          └──► ping service ──► latency statistics
//! ```
//!
//! Media loss is surfaced as statistics, never retransmitted; the
//! transport is not congestion controlled and not a general routing
//! overlay (one relay star plus an all-pairs mesh per session).

pub mod client;
pub mod config;
pub mod forward;
pub mod log;
pub mod peers;
pub mod protocol;
pub mod socket;
pub mod sorter;
pub mod stats;
pub mod tunnel;

use std::net::SocketAddrV4;

pub use client::StageClient;
pub use config::StageConfig;
pub use protocol::StageError;
pub use stats::ClientStats;
pub use tunnel::TcpTunnel;

pub use self::log::setup_logger;

/// Which probe path a latency sample was measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    /// Probe sent directly to the peer's public endpoint.
    Direct,
    /// Probe routed through the relay server.
    Relay,
    /// Probe sent to the peer's local-network endpoint.
    Local,
}

/// Lifecycle and telemetry notifications of a [`StageClient`].
///
/// Delivered over a bounded channel; the client never blocks on it, so
/// a slow consumer loses events rather than stalling the media path.
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// A peer slot went live (or re-announced itself after changing its
    /// operation mode).
    NewConnection {
        cid: u8,
        endpoint: SocketAddrV4,
        mode: u8,
        version: String,
    },
    /// A peer missed 120 ping periods and was dropped.
    ConnectionLost { cid: u8 },
    /// One probe echo arrived.
    PingEcho {
        cid: u8,
        rtt_ms: f64,
        via: PingKind,
        endpoint: SocketAddrV4,
    },
    /// Per-peer statistics roll-up, once a minute.
    LatencyReport { cid: u8, stats: ClientStats },
    /// A datagram had to be emitted out of order.
    SequenceError {
        cid: u8,
        dest_port: u16,
        expected: i16,
        received: i16,
    },
}
