//! Stage wire protocol.
//!
//! Every datagram exchanged between stage devices and the relay server is
//! `HEADER || payload`, where the header is a fixed 9-byte prefix carrying
//! the session secret, the sender's caller id, a destination port and a
//! sequence number. All message types exchanged over the session socket are
//! defined here so that every sub-module speaks the same language.

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Maximum datagram size in bytes. This limits the size of unpacked
/// payloads to `BUFSIZE - HEADER_LEN`.
pub const BUFSIZE: usize = 8192;

/// Length of the packed header prefix.
pub const HEADER_LEN: usize = 9;

/// Largest payload that still fits into a [`BUFSIZE`] datagram.
pub const MAX_PAYLOAD: usize = BUFSIZE - HEADER_LEN;

/// Maximum number of devices in a stage.
pub const MAX_STAGE_ID: usize = 32;

/// Special caller id of the relay server.
pub const STAGE_ID_SERVER: u8 = 0xff;

/// Wire size of a serialized IPv4 endpoint (legacy `sockaddr_in` image).
pub const ENDPOINT_WIRE_LEN: usize = 16;

// Destination-port values below `MAX_SPECIAL_PORT` are control opcodes;
// everything at or above it is a "user port" mapping onto a local UDP sink.

/// Register or refresh this device in a session. The `sequence` field
/// carries the sender's mode bitmask and the payload its version string.
pub const PORT_REGISTER: u16 = 0;
/// Roster entry from the relay: one peer's caller id and public endpoint.
/// The `sequence` field carries the peer's mode flags.
pub const PORT_LISTCID: u16 = 1;
/// Latency probe sent directly to a peer's public endpoint.
pub const PORT_PING: u16 = 2;
/// Echo of [`PORT_PING`], caller id rewritten to the responder's.
pub const PORT_PONG: u16 = 3;
/// Advisory per-peer latency report (six `f64` values).
pub const PORT_PEERLATREP: u16 = 4;
/// Advisory sequence-error report.
pub const PORT_SEQREP: u16 = 5;
/// Self-reported local endpoint of a device.
pub const PORT_SETLOCALIP: u16 = 6;
/// Latency probe routed through the relay; payload is prefixed with the
/// target caller id.
pub const PORT_PING_SRV: u16 = 7;
/// Echo of [`PORT_PING_SRV`].
pub const PORT_PONG_SRV: u16 = 8;
/// Latency probe sent to a peer's local-network endpoint.
pub const PORT_PING_LOCAL: u16 = 9;
/// Echo of [`PORT_PING_LOCAL`].
pub const PORT_PONG_LOCAL: u16 = 10;
/// 32-byte X25519 public key of a device.
pub const PORT_PUBKEY: u16 = 11;
/// First non-control port value.
pub const MAX_SPECIAL_PORT: u16 = 12;

// Device operation mode bitmask, carried in REGISTER / LISTCID messages.

/// Exchange media directly with other peer-to-peer devices.
pub const MODE_PEER2PEER: u8 = 0x01;
/// Device can only receive downmixed signals.
pub const MODE_RECEIVEDOWNMIX: u8 = 0x02;
/// Do not send media to this device. If `MODE_USINGPROXY` is also set,
/// devices in the same local network still send.
pub const MODE_DONOTSEND: u8 = 0x04;
/// Device is sending a session downmix, not individual tracks.
pub const MODE_SENDDOWNMIX: u8 = 0x08;
/// Device receives external traffic through a proxy in its network.
pub const MODE_USINGPROXY: u8 = 0x10;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Errors surfaced during construction and configuration. Transient
/// network errors are not represented here; they are retried or dropped
/// at the call site.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no such host: {0}")]
    HostResolve(String),
    #[error("binding port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ────────────────────────────────────────────────────────────────────────────
// Header codec
// ────────────────────────────────────────────────────────────────────────────

/// Decoded 9-byte message header.
///
/// Multi-byte fields are little-endian on the wire, bit-identical to the
/// host-order layout of the legacy implementation on the platforms it
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Session access token; receivers drop datagrams with a foreign secret.
    pub secret: u32,
    /// Caller id of the sending device, or [`STAGE_ID_SERVER`].
    pub caller_id: u8,
    /// Control opcode or user port.
    pub dest_port: u16,
    /// Per-(sender, port) sequence number; wrap-safe signed arithmetic.
    pub sequence: i16,
}

/// Serialize a header and payload into `dest`.
///
/// Returns the total packed length, or `0` when `dest` is too small to
/// hold header and payload — callers must treat `0` as "drop".
pub fn pack_msg(
    dest: &mut [u8],
    secret: u32,
    caller_id: u8,
    dest_port: u16,
    sequence: i16,
    payload: &[u8],
) -> usize {
    if dest.len() < HEADER_LEN + payload.len() {
        return 0;
    }
    dest[0..4].copy_from_slice(&secret.to_le_bytes());
    dest[4] = caller_id;
    dest[5..7].copy_from_slice(&dest_port.to_le_bytes());
    dest[7..9].copy_from_slice(&sequence.to_le_bytes());
    dest[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    HEADER_LEN + payload.len()
}

/// Decode the header prefix of a received datagram.
/// Returns `None` when the buffer is shorter than [`HEADER_LEN`].
pub fn unpack_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(Header {
        secret: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        caller_id: buf[4],
        dest_port: u16::from_le_bytes([buf[5], buf[6]]),
        sequence: i16::from_le_bytes([buf[7], buf[8]]),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Message buffer
// ────────────────────────────────────────────────────────────────────────────

/// An unpacked datagram: header fields, payload bytes and the sender's
/// address as observed by the receiving socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMsg {
    pub cid: u8,
    pub dest_port: u16,
    pub seq: i16,
    pub payload: Vec<u8>,
    pub sender: SocketAddrV4,
}

impl StageMsg {
    /// Unpack a raw datagram. The secret has already been validated by the
    /// receiving socket; only the length is checked here.
    pub fn unpack(buf: &[u8], sender: SocketAddrV4) -> Option<Self> {
        let header = unpack_header(buf)?;
        Some(Self {
            cid: header.caller_id,
            dest_port: header.dest_port,
            seq: header.sequence,
            payload: buf[HEADER_LEN..].to_vec(),
            sender,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Endpoint image codec
// ────────────────────────────────────────────────────────────────────────────

/// Encode an IPv4 endpoint as the 16-byte legacy `sockaddr_in` image:
/// family `AF_INET` (2, little-endian), port in network byte order, the
/// four address octets, and eight bytes of zero padding.
pub fn encode_endpoint(ep: SocketAddrV4) -> [u8; ENDPOINT_WIRE_LEN] {
    let mut buf = [0u8; ENDPOINT_WIRE_LEN];
    buf[0..2].copy_from_slice(&2u16.to_le_bytes());
    buf[2..4].copy_from_slice(&ep.port().to_be_bytes());
    buf[4..8].copy_from_slice(&ep.ip().octets());
    buf
}

/// Decode a 16-byte endpoint image.
///
/// The family field is ignored and the result is always an IPv4 endpoint:
/// some foreign systems transmit sockaddr images with corrupted family or
/// padding bytes, so the address is reconstructed from port and octets
/// alone.
pub fn decode_endpoint(buf: &[u8]) -> Option<SocketAddrV4> {
    if buf.len() < ENDPOINT_WIRE_LEN {
        return None;
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Some(SocketAddrV4::new(ip, port))
}

// ────────────────────────────────────────────────────────────────────────────
// Ping payloads
// ────────────────────────────────────────────────────────────────────────────

/// Build a `PING` / `PING_LOCAL` payload: send time in seconds since
/// session start followed by the sender's endpoint image.
pub fn encode_ping(t_send: f64, sender: SocketAddrV4) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + ENDPOINT_WIRE_LEN);
    buf.extend_from_slice(&t_send.to_le_bytes());
    buf.extend_from_slice(&encode_endpoint(sender));
    buf
}

/// Build a `PING_SRV` payload: the target caller id, then the regular
/// ping payload. The relay uses the prefix to deliver the probe.
pub fn encode_ping_srv(target_cid: u8, t_send: f64, sender: SocketAddrV4) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + ENDPOINT_WIRE_LEN);
    buf.push(target_cid);
    buf.extend_from_slice(&encode_ping(t_send, sender));
    buf
}

/// Extract the send time from a pong payload. `skip` is the number of
/// leading bytes to ignore (one for `PONG_SRV`, zero otherwise).
pub fn decode_ping_time(payload: &[u8], skip: usize) -> Option<f64> {
    let rest = payload.get(skip..)?;
    if rest.len() < 8 {
        return None;
    }
    Some(f64::from_le_bytes(rest[..8].try_into().ok()?))
}

/// Build a `PEERLATREP` payload: six `f64` values
/// `(cid, min, median, p99, received, lost)`.
pub fn encode_latency_report(cid: u8, values: [f64; 5]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 * 8);
    buf.extend_from_slice(&f64::from(cid).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}
