//! UDP endpoints for stage traffic.
//!
//! [`StageSocket`] owns one bound UDP socket with the QoS options the
//! media path wants (IP-TOS CS6 or DSCP EF, SO_PRIORITY on Linux) and
//! atomic byte counters. [`SessionSocket`] layers the session framing on
//! top: secret validation on receive and header packing with per-port
//! sequence numbering on send.
//!
//! Sockets are created with the [`socket2`] crate so that reuse-address
//! and TOS can be set *before* binding, then converted std → tokio.
//! Failure to apply a QoS option is logged and non-fatal.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::protocol::{self, StageError, StageMsg, HEADER_LEN, MAX_SPECIAL_PORT};

/// IP type-of-service for class-selector 6 (network control), the
/// default for all stage sockets.
const IPTOS_CS6: u32 = 0xc0;

/// IP type-of-service for the expedited-forwarding PHB (RFC 2598):
/// low loss, low latency, low jitter, assured bandwidth.
const IPTOS_DSCP_EF: u32 = 0xb8;

/// SO_PRIORITY value applied on Linux.
const NET_PRIORITY: i32 = 6;

// ────────────────────────────────────────────────────────────────────────────
// StageSocket
// ────────────────────────────────────────────────────────────────────────────

/// A bound UDP socket with QoS options, a configurable default
/// destination host, and atomic tx/rx byte counters.
pub struct StageSocket {
    socket: UdpSocket,
    /// IP of the default destination used by [`send_to_port`].
    dest_ip: Mutex<Ipv4Addr>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    /// State of the previous bitrate probe: instant and byte counters.
    bitrate_state: Mutex<(Instant, u64, u64)>,
}

impl StageSocket {
    /// Open and bind a UDP socket.
    ///
    /// Binds to `127.0.0.1` when `loopback` is set, `0.0.0.0` otherwise,
    /// with reuse-address enabled. A `port` of 0 asks the OS for an
    /// ephemeral port; the actually bound port is available via
    /// [`local_port`](Self::local_port).
    pub async fn bind(port: u16, loopback: bool) -> Result<Self, StageError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| StageError::Bind { port, source })?;

        // SO_REUSEADDR — allow rebinding a port in TIME_WAIT; non-fatal.
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("SO_REUSEADDR failed (non-fatal): {}", e);
        }
        if let Err(e) = socket.set_tos(IPTOS_CS6) {
            warn!("IP_TOS failed (non-fatal): {}", e);
        }
        set_net_priority(&socket, NET_PRIORITY);

        // Set non-blocking *before* converting to a tokio socket.
        socket
            .set_nonblocking(true)
            .map_err(|source| StageError::Bind { port, source })?;

        let ip = if loopback {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        socket
            .bind(&socket2::SockAddr::from(SocketAddrV4::new(ip, port)))
            .map_err(|source| StageError::Bind { port, source })?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|source| StageError::Bind { port, source })?;

        Ok(Self {
            socket,
            dest_ip: Mutex::new(Ipv4Addr::LOCALHOST),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            bitrate_state: Mutex::new((Instant::now(), 0, 0)),
        })
    }

    /// Resolve `host` and use its first IPv4 address as the default
    /// destination for [`send_to_port`](Self::send_to_port).
    pub async fn set_destination(&self, host: &str) -> Result<(), StageError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| StageError::HostResolve(host.to_string()))?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                *self.dest_ip.lock() = *v4.ip();
                return Ok(());
            }
        }
        Err(StageError::HostResolve(host.to_string()))
    }

    /// IP of the configured default destination.
    pub fn destination(&self) -> Ipv4Addr {
        *self.dest_ip.lock()
    }

    /// The port this socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Switch IP-TOS to the expedited-forwarding PHB.
    pub fn set_expedited_forwarding(&self) {
        if let Err(e) = SockRef::from(&self.socket).set_tos(IPTOS_DSCP_EF) {
            warn!("IP_TOS DSCP-EF failed (non-fatal): {}", e);
        }
        set_net_priority(&self.socket, NET_PRIORITY);
    }

    /// Send a datagram to an explicit endpoint, updating the tx counter.
    pub async fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> std::io::Result<usize> {
        let n = self.socket.send_to(buf, dest).await?;
        self.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Send a datagram to `port` at the default destination.
    ///
    /// Port 0 is a no-op that reports the nominal length, so callers can
    /// leave unwanted branches wired up without special-casing them.
    pub async fn send_to_port(&self, buf: &[u8], port: u16) -> std::io::Result<usize> {
        if port == 0 {
            return Ok(buf.len());
        }
        let dest = SocketAddrV4::new(self.destination(), port);
        self.send_to(buf, dest).await
    }

    /// Receive one datagram, updating the rx counter. Non-IPv4 senders
    /// are skipped (the protocol is IPv4-only).
    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddrV4)> {
        loop {
            let (n, addr) = self.socket.recv_from(buf).await?;
            self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
            match addr {
                SocketAddr::V4(v4) => return Ok((n, v4)),
                SocketAddr::V6(_) => debug!("ignoring datagram from IPv6 sender {}", addr),
            }
        }
    }

    /// Total bytes sent through this socket.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes received through this socket.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Transmit and receive rates in bits per second since the previous
    /// call.
    pub fn bitrate(&self) -> (f64, f64) {
        let now = Instant::now();
        let tx = self.tx_bytes();
        let rx = self.rx_bytes();
        let mut state = self.bitrate_state.lock();
        let (last_t, last_tx, last_rx) = *state;
        let dt = now.duration_since(last_t).as_secs_f64().max(1e-6);
        *state = (now, tx, rx);
        let scale = 8.0 / dt;
        (
            scale * tx.saturating_sub(last_tx) as f64,
            scale * rx.saturating_sub(last_rx) as f64,
        )
    }
}

/// Apply SO_PRIORITY where the platform supports it. Best effort only.
#[cfg(target_os = "linux")]
fn set_net_priority<T: std::os::fd::AsRawFd>(socket: &T, priority: i32) {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            &priority as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(
            "SO_PRIORITY failed (non-fatal): {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_net_priority<T>(_socket: &T, _priority: i32) {}

// ────────────────────────────────────────────────────────────────────────────
// SessionSocket
// ────────────────────────────────────────────────────────────────────────────

/// A [`StageSocket`] bound to one session: it knows the session secret
/// and this device's caller id, validates the secret on receive, and
/// numbers outgoing user-port datagrams with per-port sequence counters.
pub struct SessionSocket {
    socket: StageSocket,
    secret: u32,
    caller_id: u8,
    /// Outgoing sequence number per destination port. Control ports stay
    /// at zero; user ports increment per packed message.
    seq_map: Mutex<HashMap<u16, i16>>,
    t_start: Instant,
}

impl SessionSocket {
    pub async fn bind(
        port: u16,
        loopback: bool,
        secret: u32,
        caller_id: u8,
    ) -> Result<Self, StageError> {
        Ok(Self {
            socket: StageSocket::bind(port, loopback).await?,
            secret,
            caller_id,
            seq_map: Mutex::new(HashMap::new()),
            t_start: Instant::now(),
        })
    }

    pub fn secret(&self) -> u32 {
        self.secret
    }

    pub fn caller_id(&self) -> u8 {
        self.caller_id
    }

    /// Seconds since this socket was created. Ping timestamps are
    /// relative to this origin.
    pub fn time_since_start(&self) -> f64 {
        self.t_start.elapsed().as_secs_f64()
    }

    /// Pack a message with the session secret, this device's caller id
    /// and the next sequence number for `dest_port`.
    ///
    /// Returns the packed length, or 0 when `dest` is too small (the
    /// message must then be dropped). Only user ports consume sequence
    /// numbers; control messages carry 0.
    pub fn pack_into(&self, dest: &mut [u8], dest_port: u16, payload: &[u8]) -> usize {
        let seq = if dest_port >= MAX_SPECIAL_PORT {
            let mut map = self.seq_map.lock();
            let seq = map.entry(dest_port).or_insert(0);
            *seq = seq.wrapping_add(1);
            *seq
        } else {
            0
        };
        protocol::pack_msg(dest, self.secret, self.caller_id, dest_port, seq, payload)
    }

    /// Pack `payload` for `dest_port` and send it to `remote_port` at the
    /// default destination. Returns false when packing or sending failed.
    pub async fn pack_and_send(&self, dest_port: u16, payload: &[u8], remote_port: u16) -> bool {
        let mut buf = [0u8; crate::protocol::BUFSIZE];
        let len = self.pack_into(&mut buf, dest_port, payload);
        if len == 0 {
            return false;
        }
        self.socket.send_to_port(&buf[..len], remote_port).await.is_ok()
    }

    /// Send a latency probe of kind `proto` (`PORT_PING`, `PORT_PING_SRV`
    /// or `PORT_PING_LOCAL`) to `ep`. `sender` is this device's public
    /// endpoint as far as it is known.
    pub async fn send_ping(
        &self,
        ep: SocketAddrV4,
        target_cid: u8,
        proto: u16,
        sender: SocketAddrV4,
    ) {
        let t_send = self.time_since_start();
        let payload = if proto == protocol::PORT_PING_SRV {
            protocol::encode_ping_srv(target_cid, t_send, sender)
        } else {
            protocol::encode_ping(t_send, sender)
        };
        let mut buf = [0u8; crate::protocol::BUFSIZE];
        let len = self.pack_into(&mut buf, proto, &payload);
        if len > 0 {
            let _ = self.send_to(&buf[..len], ep).await;
        }
    }

    /// Send the periodic registration burst to `remote_port` at the relay:
    /// `REGISTER` (mode bitmask in the sequence field, version string as
    /// payload), `SETLOCALIP` with our local endpoint, and `PUBKEY` when a
    /// key has been provisioned.
    pub async fn send_registration(
        &self,
        mode: u8,
        remote_port: u16,
        local_ep: SocketAddrV4,
        version: &str,
        pubkey: Option<&[u8; 32]>,
    ) {
        let mut buf = [0u8; crate::protocol::BUFSIZE];

        // NUL-terminated version string, mode carried in the sequence
        // field rather than a per-port counter.
        let mut payload = Vec::with_capacity(version.len() + 1);
        payload.extend_from_slice(version.as_bytes());
        payload.push(0);
        let len = protocol::pack_msg(
            &mut buf,
            self.secret,
            self.caller_id,
            protocol::PORT_REGISTER,
            mode as i16,
            &payload,
        );
        if len > 0 {
            let _ = self.send_to_port(&buf[..len], remote_port).await;
        }

        let local_image = protocol::encode_endpoint(local_ep);
        self.pack_and_send(protocol::PORT_SETLOCALIP, &local_image, remote_port)
            .await;
        if let Some(key) = pubkey {
            self.pack_and_send(protocol::PORT_PUBKEY, key, remote_port)
                .await;
        }
    }

    /// Receive one datagram and validate the header: datagrams shorter
    /// than the header or carrying a foreign secret yield `Ok(None)` and
    /// are dropped silently.
    pub async fn recv_sec(&self, buf: &mut [u8]) -> std::io::Result<Option<StageMsg>> {
        let (n, sender) = self.socket.recv_from(buf).await?;
        if n < HEADER_LEN {
            return Ok(None);
        }
        match protocol::unpack_header(&buf[..n]) {
            Some(header) if header.secret == self.secret => {
                Ok(StageMsg::unpack(&buf[..n], sender))
            }
            _ => Ok(None),
        }
    }
}

impl std::ops::Deref for SessionSocket {
    type Target = StageSocket;

    fn deref(&self) -> &Self::Target {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{unpack_header, BUFSIZE};

    #[tokio::test]
    async fn bind_returns_actual_port() {
        let socket = StageSocket::bind(0, true).await.unwrap();
        assert_ne!(0, socket.local_port());
    }

    #[tokio::test]
    async fn send_updates_byte_counters() {
        let a = StageSocket::bind(0, true).await.unwrap();
        let b = StageSocket::bind(0, true).await.unwrap();
        let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, b.local_port());

        let before = a.tx_bytes();
        let n = a.send_to(b"hello", dest).await.unwrap();
        assert_eq!(5, n);
        assert_eq!(before + 5, a.tx_bytes());

        let mut buf = [0u8; 64];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(5, n);
        assert_eq!(5, b.rx_bytes());
    }

    #[tokio::test]
    async fn send_to_port_zero_is_a_noop() {
        let socket = StageSocket::bind(0, true).await.unwrap();
        let before = socket.tx_bytes();
        let n = socket.send_to_port(b"discarded", 0).await.unwrap();
        assert_eq!(9, n);
        assert_eq!(before, socket.tx_bytes());
    }

    #[tokio::test]
    async fn session_sequence_numbers_are_per_port() {
        let socket = SessionSocket::bind(0, true, 12345678, 13).await.unwrap();
        let mut buf = [0u8; BUFSIZE];

        let len = socket.pack_into(&mut buf, 9876, b"");
        assert_eq!(HEADER_LEN, len);
        let h = unpack_header(&buf).unwrap();
        assert_eq!((12345678, 13, 9876, 1), (h.secret, h.caller_id, h.dest_port, h.sequence));

        let _ = socket.pack_into(&mut buf, 9876, b"");
        assert_eq!(2, unpack_header(&buf).unwrap().sequence);

        let _ = socket.pack_into(&mut buf, 9877, b"");
        assert_eq!(1, unpack_header(&buf).unwrap().sequence);

        let _ = socket.pack_into(&mut buf, 9876, b"");
        assert_eq!(3, unpack_header(&buf).unwrap().sequence);

        // Control ports do not consume sequence numbers.
        let _ = socket.pack_into(&mut buf, crate::protocol::PORT_PING, b"");
        assert_eq!(0, unpack_header(&buf).unwrap().sequence);
    }

    #[tokio::test]
    async fn recv_sec_drops_foreign_and_short_datagrams() {
        let rx = SessionSocket::bind(0, true, 0xaffe, 1).await.unwrap();
        let tx = SessionSocket::bind(0, true, 0xdead, 2).await.unwrap();
        let good = SessionSocket::bind(0, true, 0xaffe, 3).await.unwrap();
        let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, rx.local_port());

        // Wrong secret.
        let mut buf = [0u8; BUFSIZE];
        let len = tx.pack_into(&mut buf, 100, b"x");
        tx.send_to(&buf[..len], dest).await.unwrap();
        // Too short for a header.
        tx.send_to(b"tiny", dest).await.unwrap();
        // Valid.
        let len = good.pack_into(&mut buf, 100, b"y");
        good.send_to(&buf[..len], dest).await.unwrap();

        let mut rbuf = [0u8; BUFSIZE];
        assert!(rx.recv_sec(&mut rbuf).await.unwrap().is_none());
        assert!(rx.recv_sec(&mut rbuf).await.unwrap().is_none());
        let msg = rx.recv_sec(&mut rbuf).await.unwrap().unwrap();
        assert_eq!(3, msg.cid);
        assert_eq!(100, msg.dest_port);
        assert_eq!(b"y".as_slice(), msg.payload.as_slice());
    }
}
