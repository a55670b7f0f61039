//! Forwarding policy.
//!
//! For every locally produced datagram the client has to decide which
//! endpoints receive it: each peer directly (peer-to-peer mode), the
//! relay server (for devices without peer-to-peer connectivity), or a
//! peer's local-network endpoint when both devices sit behind the same
//! NAT. The decision is a pure function over a snapshot of the peer
//! table so it can be tested without sockets.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::peers::PeerDescriptor;
use crate::protocol::{
    MODE_DONOTSEND, MODE_PEER2PEER, MODE_RECEIVEDOWNMIX, MODE_SENDDOWNMIX, MODE_USINGPROXY,
};

/// True when both addresses are set and share the same /24 network.
pub fn same_net(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let a = u32::from(a);
    let b = u32::from(b);
    (a >> 8) == (b >> 8) && a != 0 && b != 0
}

/// Destinations for one outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    /// Direct per-peer destinations.
    pub destinations: Vec<SocketAddrV4>,
    /// Whether the datagram also goes to the relay: always for devices
    /// not in peer-to-peer mode, and whenever at least one live peer
    /// cannot be reached directly.
    pub to_relay: bool,
}

/// Compute the set of destinations for a datagram produced by
/// `self_cid`.
///
/// `peers` is a full snapshot of the table (the own slot supplies the
/// public address the relay observed for us). `send_local` enables the
/// same-network shortcut to a peer's local endpoint.
pub fn plan(
    self_cid: u8,
    own_mode: u8,
    send_local: bool,
    peers: &[PeerDescriptor],
) -> ForwardPlan {
    let mut to_relay = own_mode & MODE_PEER2PEER == 0;
    let mut destinations = Vec::new();

    if own_mode & MODE_PEER2PEER != 0 {
        let own_public = peers
            .get(self_cid as usize)
            .map(|slot| *slot.public.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        for (cid, peer) in peers.iter().enumerate() {
            if !peer.is_live() || cid as u8 == self_cid {
                continue;
            }
            if peer.mode & MODE_PEER2PEER == 0 {
                // The peer only listens to the relay.
                to_relay = true;
                continue;
            }

            let in_same_network =
                same_net(own_public, *peer.public.ip()) && *peer.local.ip() != Ipv4Addr::UNSPECIFIED;

            // DONOTSEND suppresses delivery unless the peer uses a proxy
            // and we are its local sibling.
            let deliver = peer.mode & MODE_DONOTSEND == 0
                || (peer.mode & MODE_USINGPROXY != 0 && in_same_network);
            if !deliver {
                continue;
            }

            // Downmix gating: a downmix sender feeds exactly the devices
            // that want a downmix, a track sender everyone else.
            if (peer.mode & MODE_RECEIVEDOWNMIX != 0) != (own_mode & MODE_SENDDOWNMIX != 0) {
                continue;
            }

            destinations.push(if send_local && in_same_network {
                peer.local
            } else {
                peer.public
            });
        }
    }

    ForwardPlan {
        destinations,
        to_relay,
    }
}
