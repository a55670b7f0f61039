//! Peer endpoint table with liveness tracking.
//!
//! A stage holds at most [`MAX_STAGE_ID`](crate::protocol::MAX_STAGE_ID)
//! devices, so the table is a fixed array indexed by caller id rather
//! than a dictionary: lookups and the per-tick scan stay allocation-free.
//!
//! Each slot carries a ttl measured in ping periods. Control traffic from
//! a peer refreshes the ttl to [`CALLER_TTL`]; the liveness tick
//! decrements it. The 0→live transition announces a new connection, the
//! live→0 transition announces the loss and clears the slot.

use std::net::{Ipv4Addr, SocketAddrV4};

use parking_lot::RwLock;

use crate::protocol::{MAX_STAGE_ID, MODE_PEER2PEER};

/// Ttl of a freshly refreshed slot, in ping periods (≈ 60 s at the
/// default 500 ms period).
pub const CALLER_TTL: u32 = 120;

/// State of one caller-id slot.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    /// Public endpoint as observed by the relay.
    pub public: SocketAddrV4,
    /// Self-reported local-network endpoint (0.0.0.0 when unknown).
    pub local: SocketAddrV4,
    /// Remaining liveness ticks; 0 means the slot is free.
    pub ttl: u32,
    /// True once the current connection has been announced.
    pub announced: bool,
    /// Mode bitmask of the device.
    pub mode: u8,
    /// Version string from the registration, if any.
    pub version: String,
    /// X25519 public key of the peer, once received.
    pub pubkey: Option<[u8; 32]>,
    // Advisory round-trip accumulator, cleared on every roll-up.
    pub ping_min: f64,
    pub ping_max: f64,
    pub ping_sum: f64,
    pub ping_count: u32,
}

impl Default for PeerDescriptor {
    fn default() -> Self {
        Self {
            public: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            ttl: 0,
            announced: false,
            mode: MODE_PEER2PEER,
            version: String::new(),
            pubkey: None,
            ping_min: 10000.0,
            ping_max: 0.0,
            ping_sum: 0.0,
            ping_count: 0,
        }
    }
}

impl PeerDescriptor {
    pub fn is_live(&self) -> bool {
        self.ttl > 0
    }
}

/// Liveness transition observed by one tick of the status scan.
#[derive(Debug, Clone)]
pub enum PeerTransition {
    Up(u8, PeerDescriptor),
    Down(u8),
}

/// Advisory ping summary of one slot, produced by
/// [`PeerTable::rollup_advisory`].
#[derive(Debug, Clone, Copy)]
pub struct AdvisoryPing {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// Fixed-capacity endpoint table keyed by caller id.
pub struct PeerTable {
    slots: RwLock<Vec<PeerDescriptor>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![PeerDescriptor::default(); MAX_STAGE_ID]),
        }
    }

    /// Create or refresh the slot for `cid`: store the public endpoint
    /// and mode, refresh the ttl, and re-arm the announcement when the
    /// mode changed while the slot was live.
    pub fn register(&self, cid: u8, public: SocketAddrV4, mode: u8, version: &str) {
        if cid as usize >= MAX_STAGE_ID {
            return;
        }
        let mut slots = self.slots.write();
        let slot = &mut slots[cid as usize];
        slot.public = public;
        if slot.mode != mode {
            slot.announced = false;
        }
        slot.mode = mode;
        slot.ttl = CALLER_TTL;
        slot.version = version.to_string();
    }

    /// Store the self-reported local endpoint of `cid`. The caller has
    /// already normalized the wire image to IPv4 (the family field of
    /// foreign sockaddr images is not trusted).
    pub fn set_local_ip(&self, cid: u8, local: SocketAddrV4) {
        if cid as usize >= MAX_STAGE_ID {
            return;
        }
        self.slots.write()[cid as usize].local = local;
    }

    /// Store the 32-byte public key of `cid`.
    pub fn set_pubkey(&self, cid: u8, key: [u8; 32]) {
        if cid as usize >= MAX_STAGE_ID {
            return;
        }
        self.slots.write()[cid as usize].pubkey = Some(key);
    }

    /// Record a round-trip sample and refresh the ttl.
    ///
    /// Uses a try-lock: when the table is contended the sample is
    /// dropped. The accumulator is advisory and must never stall the
    /// receive path.
    pub fn set_ping_time(&self, cid: u8, rtt_ms: f64) {
        if cid as usize >= MAX_STAGE_ID || rtt_ms <= 0.0 {
            return;
        }
        if let Some(mut slots) = self.slots.try_write() {
            let slot = &mut slots[cid as usize];
            slot.ttl = CALLER_TTL;
            slot.ping_count += 1;
            slot.ping_sum += rtt_ms;
            slot.ping_max = rtt_ms.max(slot.ping_max);
            slot.ping_min = rtt_ms.min(slot.ping_min);
        }
    }

    /// Number of live slots.
    pub fn num_live(&self) -> u32 {
        self.slots.read().iter().filter(|s| s.is_live()).count() as u32
    }

    /// Clone of one slot.
    pub fn get(&self, cid: u8) -> Option<PeerDescriptor> {
        self.slots.read().get(cid as usize).cloned()
    }

    /// Snapshot of all 32 slots for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.slots.read().clone()
    }

    /// One liveness tick: decrement the ttl of every live slot and
    /// return the transitions to announce. A slot that ran out of ttl is
    /// reset to its default state.
    pub fn tick(&self) -> Vec<PeerTransition> {
        let mut transitions = Vec::new();
        let mut slots = self.slots.write();
        for (cid, slot) in slots.iter_mut().enumerate() {
            if slot.ttl > 0 {
                if !slot.announced {
                    transitions.push(PeerTransition::Up(cid as u8, slot.clone()));
                    slot.announced = true;
                }
                slot.ttl -= 1;
            } else if slot.announced {
                transitions.push(PeerTransition::Down(cid as u8));
                *slot = PeerDescriptor::default();
            }
        }
        transitions
    }

    /// Roll up and clear the advisory ping accumulator of a live slot.
    /// Returns `None` for dead slots or slots without samples.
    pub fn rollup_advisory(&self, cid: u8) -> Option<AdvisoryPing> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(cid as usize)?;
        if !slot.is_live() || slot.ping_count == 0 {
            return None;
        }
        let summary = AdvisoryPing {
            min: slot.ping_min,
            mean: slot.ping_sum / slot.ping_count as f64,
            max: slot.ping_max,
        };
        slot.ping_min = 10000.0;
        slot.ping_max = 0.0;
        slot.ping_sum = 0.0;
        slot.ping_count = 0;
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MODE_DONOTSEND, MODE_PEER2PEER};

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn register_makes_slot_live() {
        let table = PeerTable::new();
        assert_eq!(0, table.num_live());
        table.register(3, ep(192, 168, 1, 2, 4464), MODE_PEER2PEER, "0.1.0");
        assert_eq!(1, table.num_live());
        let slot = table.get(3).unwrap();
        assert_eq!(CALLER_TTL, slot.ttl);
        assert_eq!(ep(192, 168, 1, 2, 4464), slot.public);
        assert_eq!("0.1.0", slot.version);
    }

    #[test]
    fn out_of_range_ids_are_ignored() {
        let table = PeerTable::new();
        table.register(32, ep(1, 2, 3, 4, 1), 0, "");
        table.register(0xff, ep(1, 2, 3, 4, 1), 0, "");
        assert_eq!(0, table.num_live());
    }

    #[test]
    fn slot_expires_after_exactly_caller_ttl_ticks() {
        let table = PeerTable::new();
        table.register(5, ep(10, 0, 0, 1, 9000), MODE_PEER2PEER, "");

        // First tick announces the new connection.
        let transitions = table.tick();
        assert!(matches!(transitions.as_slice(), [PeerTransition::Up(5, _)]));

        // ttl ticks down; the slot stays live until tick number 120.
        for _ in 0..CALLER_TTL - 1 {
            assert_eq!(1, table.num_live());
            assert!(table.tick().is_empty());
        }
        assert_eq!(0, table.num_live());

        // The tick after exhaustion announces the loss and clears the slot.
        let transitions = table.tick();
        assert!(matches!(transitions.as_slice(), [PeerTransition::Down(5)]));
        assert_eq!(0, table.get(5).unwrap().ttl);
        assert!(table.get(5).unwrap().version.is_empty());
    }

    #[test]
    fn refresh_keeps_slot_alive() {
        let table = PeerTable::new();
        table.register(1, ep(10, 0, 0, 1, 9000), MODE_PEER2PEER, "");
        for _ in 0..CALLER_TTL {
            table.tick();
        }
        table.register(1, ep(10, 0, 0, 1, 9000), MODE_PEER2PEER, "");
        assert_eq!(1, table.num_live());
        assert_eq!(CALLER_TTL, table.get(1).unwrap().ttl);
    }

    #[test]
    fn mode_change_is_reannounced() {
        let table = PeerTable::new();
        table.register(2, ep(10, 0, 0, 2, 9000), MODE_PEER2PEER, "");
        let transitions = table.tick();
        assert_eq!(1, transitions.len());

        // Same mode: no new announcement.
        table.register(2, ep(10, 0, 0, 2, 9000), MODE_PEER2PEER, "");
        assert!(table.tick().is_empty());

        // Changed mode: the transition is signalled again.
        table.register(2, ep(10, 0, 0, 2, 9000), MODE_PEER2PEER | MODE_DONOTSEND, "");
        let transitions = table.tick();
        match transitions.as_slice() {
            [PeerTransition::Up(2, desc)] => {
                assert_eq!(MODE_PEER2PEER | MODE_DONOTSEND, desc.mode)
            }
            other => panic!("unexpected transitions: {:?}", other),
        }
    }

    #[test]
    fn ping_time_refreshes_ttl_and_accumulates() {
        let table = PeerTable::new();
        table.register(7, ep(10, 0, 0, 7, 9000), MODE_PEER2PEER, "");
        for _ in 0..10 {
            table.tick();
        }
        table.set_ping_time(7, 4.0);
        table.set_ping_time(7, 8.0);
        table.set_ping_time(7, 6.0);
        assert_eq!(CALLER_TTL, table.get(7).unwrap().ttl);

        let summary = table.rollup_advisory(7).unwrap();
        assert_eq!(4.0, summary.min);
        assert_eq!(8.0, summary.max);
        assert!((summary.mean - 6.0).abs() < 1e-9);

        // The accumulator is cleared by the roll-up.
        assert!(table.rollup_advisory(7).is_none());
    }

    #[test]
    fn non_positive_samples_are_discarded() {
        let table = PeerTable::new();
        table.register(4, ep(10, 0, 0, 4, 9000), MODE_PEER2PEER, "");
        table.set_ping_time(4, 0.0);
        table.set_ping_time(4, -3.0);
        assert!(table.rollup_advisory(4).is_none());
    }
}
