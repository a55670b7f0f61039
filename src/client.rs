//! Stage client runtime.
//!
//! [`StageClient`] ties the transport engine together. It owns two
//! sockets — the session socket facing relay and peers, and the local
//! socket facing the audio renderer — and runs four cooperating tasks on
//! one [`CancellationToken`]:
//!
//! 1. **Inbound** — secret-validated receive from the session socket,
//!    sorter feed/drain, control dispatch and local delivery.
//! 2. **Outbound** — reads the local UDP source port, wraps each datagram
//!    in a session header and applies the forwarding policy.
//! 3. **Ping** — periodic registration burst plus latency probes to every
//!    live peer (direct, via relay, local network).
//! 4. **Liveness** — ttl bookkeeping on the peer table and the
//!    once-a-minute statistics roll-up.
//!
//! Additional receiver tasks can be attached for auxiliary source ports,
//! mirroring the outbound behavior. Lifecycle notifications are emitted
//! on an event channel instead of callbacks.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::StageConfig;
use crate::forward::{self, same_net};
use crate::peers::{PeerTable, PeerTransition};
use crate::protocol::{
    self, decode_endpoint, decode_ping_time, encode_latency_report, StageError, StageMsg, BUFSIZE,
    MAX_SPECIAL_PORT, PORT_LISTCID, PORT_PEERLATREP, PORT_PING, PORT_PING_LOCAL, PORT_PING_SRV,
    PORT_PONG, PORT_PONG_LOCAL, PORT_PONG_SRV, PORT_PUBKEY, PORT_SETLOCALIP,
};
use crate::socket::{SessionSocket, StageSocket};
use crate::sorter::{MessageSorter, SharedMessageStats};
use crate::stats::{ClientStats, MessageStat, PingStatCollector};
use crate::{PingKind, StageEvent};

/// Statistics are rolled up and reported once a minute.
const REPORT_INTERVAL_MS: u64 = 60_000;

/// One ring-buffer collector map per probe path.
#[derive(Default)]
struct PingCollectors {
    p2p: Mutex<HashMap<u8, PingStatCollector>>,
    srv: Mutex<HashMap<u8, PingStatCollector>>,
    local: Mutex<HashMap<u8, PingStatCollector>>,
}

/// State shared by all tasks of one client.
struct ClientCtx {
    cfg: StageConfig,
    /// Resolved relay endpoint.
    relay_ep: SocketAddrV4,
    /// Session socket towards relay and peers.
    remote: SessionSocket,
    /// Loopback socket towards the audio renderer.
    local: StageSocket,
    peers: PeerTable,
    /// Our local-network endpoint as reported to the relay.
    local_ep: SocketAddrV4,
    /// How long the sorter may hold a deferred datagram, in
    /// milliseconds. Adjustable at runtime.
    reorder_deadline_ms: AtomicU64,
    /// X25519 public key announced with the registration, once set.
    pubkey: RwLock<Option<[u8; 32]>>,
    proxy_clients: RwLock<HashMap<u8, SocketAddrV4>>,
    /// Additional port offsets for duplicated local delivery.
    extra_ports: RwLock<Vec<u16>>,
    collectors: PingCollectors,
    msg_stats: SharedMessageStats,
    /// Statistics snapshot at the previous roll-up, per peer.
    prev_stats: Mutex<HashMap<u8, MessageStat>>,
    events: mpsc::Sender<StageEvent>,
}

impl ClientCtx {
    fn emit(&self, event: StageEvent) {
        // The event channel is advisory; a full or closed channel must
        // never stall the data path.
        let _ = self.events.try_send(event);
    }
}

/// The session transport engine of one stage device.
pub struct StageClient {
    ctx: Arc<ClientCtx>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl StageClient {
    /// Resolve the relay, bind the sockets and start all runtime tasks.
    ///
    /// Lifecycle notifications are delivered on `events`; dropping the
    /// receiver silently disables them.
    pub async fn connect(
        cfg: StageConfig,
        events: mpsc::Sender<StageEvent>,
    ) -> Result<Self, StageError> {
        cfg.validate()?;

        let local = StageSocket::bind(cfg.recv_port, true).await?;
        let remote =
            SessionSocket::bind(0, false, cfg.session_secret, cfg.caller_id).await?;
        remote.set_destination(&cfg.relay_host).await?;
        if cfg.ef_phb {
            remote.set_expedited_forwarding();
        }
        let relay_ep = SocketAddrV4::new(remote.destination(), cfg.relay_port);
        let local_ep = SocketAddrV4::new(discover_local_ip(relay_ep), remote.local_port());

        let sorter = MessageSorter::new();
        let ctx = Arc::new(ClientCtx {
            relay_ep,
            local_ep,
            reorder_deadline_ms: AtomicU64::new(cfg.reorder_deadline_ms.max(1)),
            remote,
            local,
            peers: PeerTable::new(),
            pubkey: RwLock::new(None),
            proxy_clients: RwLock::new(HashMap::new()),
            extra_ports: RwLock::new(Vec::new()),
            collectors: PingCollectors::default(),
            msg_stats: sorter.stats_handle(),
            prev_stats: Mutex::new(HashMap::new()),
            events,
            cfg,
        });

        info!(
            "stage client {} up: relay {}, local receiver port {}, local endpoint {}",
            ctx.cfg.caller_id,
            relay_ep,
            ctx.local.local_port(),
            local_ep
        );

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        // ── Inbound: session socket → sorter → dispatch ──────────────────
        {
            let ctx = Arc::clone(&ctx);
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                inbound_task(ctx, sorter, ct).await;
            }));
        }

        // ── Outbound: local source port → forwarding policy ──────────────
        {
            let ctx = Arc::clone(&ctx);
            let ct = cancel.clone();
            let wrap_port = ctx.cfg.recv_port;
            handles.push(tokio::spawn(async move {
                outbound_task(&ctx, None, wrap_port, ct).await;
            }));
        }

        // ── Ping: registration burst + probes ────────────────────────────
        {
            let ctx = Arc::clone(&ctx);
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                ping_task(ctx, ct).await;
            }));
        }

        // ── Liveness: ttl bookkeeping + statistics roll-up ───────────────
        {
            let ctx = Arc::clone(&ctx);
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                liveness_task(ctx, ct).await;
            }));
        }

        Ok(Self {
            ctx,
            cancel,
            handles,
        })
    }

    /// Duplicate inbound user-port delivery to `dest_port + offset`.
    pub fn add_extra_port(&self, offset: u16) {
        self.ctx.extra_ports.write().push(offset);
    }

    /// Register a proxy client: inbound media arriving from outside our
    /// network is re-sent, unwrapped, to this host.
    pub async fn add_proxy_client(&self, cid: u8, host: &str) -> Result<(), StageError> {
        let mut resolved = None;
        for addr in tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| StageError::HostResolve(host.to_string()))?
        {
            if let std::net::SocketAddr::V4(v4) = addr {
                resolved = Some(*v4.ip());
                break;
            }
        }
        let ip = resolved.ok_or_else(|| StageError::HostResolve(host.to_string()))?;
        self.ctx
            .proxy_clients
            .write()
            .insert(cid, SocketAddrV4::new(ip, 0));
        Ok(())
    }

    /// Attach an auxiliary receiver: datagrams arriving on local
    /// `src_port` are forwarded like primary media, wrapped for
    /// `dest_port`.
    pub async fn add_receiver_port(
        &mut self,
        src_port: u16,
        dest_port: u16,
    ) -> Result<(), StageError> {
        let source = StageSocket::bind(src_port, false).await?;
        let ctx = Arc::clone(&self.ctx);
        let ct = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            outbound_task(&ctx, Some(source), dest_port, ct).await;
        }));
        Ok(())
    }

    /// Provide the 32-byte public key announced with the registration.
    /// Key generation and any use of the key live in the encryption
    /// collaborator, not in the transport engine.
    pub fn set_public_key(&self, key: [u8; 32]) {
        *self.ctx.pubkey.write() = Some(key);
    }

    /// Adjust how long the sorter waits for a straggler before releasing
    /// deferred datagrams out of order. Values below 1 ms are clamped.
    pub fn set_reorder_deadline(&self, deadline_ms: u64) {
        self.ctx
            .reorder_deadline_ms
            .store(deadline_ms.max(1), Ordering::Relaxed);
    }

    /// Re-mark the session socket with the expedited-forwarding PHB.
    pub fn set_expedited_forwarding(&self) {
        self.ctx.remote.set_expedited_forwarding();
    }

    /// Caller id of this device.
    pub fn caller_id(&self) -> u8 {
        self.ctx.cfg.caller_id
    }

    /// Number of live peer slots (including our own, once the relay
    /// lists us).
    pub fn num_live(&self) -> u32 {
        self.ctx.peers.num_live()
    }

    /// Port of the session socket (towards relay and peers).
    pub fn session_port(&self) -> u16 {
        self.ctx.remote.local_port()
    }

    /// Transmit and receive rates of the session socket in bits per
    /// second since the previous call.
    pub fn bitrate(&self) -> (f64, f64) {
        self.ctx.remote.bitrate()
    }

    /// Message statistics of one peer.
    pub fn message_stat(&self, cid: u8) -> MessageStat {
        self.ctx
            .msg_stats
            .lock()
            .get(&cid)
            .copied()
            .unwrap_or_default()
    }

    /// Stop all tasks and wait for them. Worst-case latency is bounded
    /// by the reorder deadline and the ping period.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Stop all tasks without waiting.
    pub fn abort(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Source address the OS routes towards the relay with. A connected UDP
/// socket reveals it without sending a datagram.
fn discover_local_ip(relay: SocketAddrV4) -> Ipv4Addr {
    let probe = || -> std::io::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(relay)?;
        match socket.local_addr()? {
            std::net::SocketAddr::V4(v4) => Ok(*v4.ip()),
            std::net::SocketAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
        }
    };
    probe().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound task
// ────────────────────────────────────────────────────────────────────────────

async fn inbound_task(ctx: Arc<ClientCtx>, mut sorter: MessageSorter, cancel: CancellationToken) {
    let mut buf = vec![0u8; BUFSIZE];
    loop {
        let deadline = Duration::from_millis(ctx.reorder_deadline_ms.load(Ordering::Relaxed));
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = timeout(deadline, ctx.remote.recv_sec(&mut buf)) => {
                match incoming {
                    Ok(Ok(Some(msg))) => {
                        for ready in sorter.process(msg) {
                            process_msg(&ctx, ready).await;
                        }
                        for err in sorter.drain_errors() {
                            ctx.emit(StageEvent::SequenceError {
                                cid: err.cid,
                                dest_port: err.dest_port,
                                expected: err.expected,
                                received: err.received,
                            });
                        }
                    }
                    // Short datagram or foreign secret: dropped.
                    Ok(Ok(None)) => {}
                    // A failing session socket cannot recover; bring the
                    // whole client down cleanly.
                    Ok(Err(e)) => {
                        error!("session socket failed: {}", e);
                        cancel.cancel();
                        break;
                    }
                    // Reorder deadline elapsed without input: release any
                    // deferred datagrams.
                    Err(_) => {
                        for ready in sorter.flush() {
                            process_msg(&ctx, ready).await;
                        }
                    }
                }
            }
        }
    }
}

async fn process_msg(ctx: &ClientCtx, msg: StageMsg) {
    // Loopback filter: our own datagrams come back from the relay; only
    // the roster entry about ourselves is of interest.
    if msg.cid == ctx.cfg.caller_id && msg.dest_port != PORT_LISTCID {
        return;
    }

    if msg.dest_port > MAX_SPECIAL_PORT {
        deliver_user_msg(ctx, msg).await;
        return;
    }

    match msg.dest_port {
        PORT_PING | PORT_PING_SRV | PORT_PING_LOCAL => echo_ping(ctx, msg).await,
        PORT_PONG | PORT_PONG_SRV | PORT_PONG_LOCAL => ingest_pong(ctx, msg),
        PORT_SETLOCALIP => {
            if let Some(ep) = decode_endpoint(&msg.payload) {
                ctx.peers.set_local_ip(msg.cid, ep);
            }
        }
        PORT_LISTCID => {
            if let Some(ep) = decode_endpoint(&msg.payload) {
                // The sequence field carries the peer's mode flags.
                ctx.peers.register(msg.cid, ep, msg.seq as u8, "");
            }
        }
        PORT_PUBKEY => {
            if let Ok(key) = <[u8; 32]>::try_from(msg.payload.as_slice()) {
                ctx.peers.set_pubkey(msg.cid, key);
            }
        }
        _ => {}
    }
}

/// Deliver a user-port datagram to the local sinks and fan it out to the
/// proxy clients when it arrived from outside our network.
async fn deliver_user_msg(ctx: &ClientCtx, msg: StageMsg) {
    let primary = msg.dest_port.wrapping_add(ctx.cfg.port_offset);
    if primary != ctx.cfg.recv_port {
        let _ = ctx.local.send_to_port(&msg.payload, primary).await;
    }
    let extra = ctx.extra_ports.read().clone();
    for offset in extra {
        let port = msg.dest_port.wrapping_add(offset);
        if port != ctx.cfg.recv_port {
            let _ = ctx.local.send_to_port(&msg.payload, port).await;
        }
    }

    if !same_net(*msg.sender.ip(), *ctx.local_ep.ip()) {
        let proxies: Vec<(u8, SocketAddrV4)> = ctx
            .proxy_clients
            .read()
            .iter()
            .map(|(cid, ep)| (*cid, *ep))
            .collect();
        for (cid, proxy) in proxies {
            if cid != msg.cid {
                let dest = SocketAddrV4::new(*proxy.ip(), msg.dest_port);
                let _ = ctx.remote.send_to(&msg.payload, dest).await;
            }
        }
    }
}

/// Echo a latency probe: same payload, matching pong opcode, our caller
/// id. For relayed probes the target-id prefix is replaced with the
/// originator's id so the relay can route the echo back.
async fn echo_ping(ctx: &ClientCtx, msg: StageMsg) {
    let pong_port = match msg.dest_port {
        PORT_PING => PORT_PONG,
        PORT_PING_SRV => PORT_PONG_SRV,
        _ => PORT_PONG_LOCAL,
    };
    let mut payload = msg.payload;
    if msg.dest_port == PORT_PING_SRV {
        if payload.is_empty() {
            return;
        }
        payload[0] = msg.cid;
    }
    let mut buf = [0u8; BUFSIZE];
    let len = protocol::pack_msg(
        &mut buf,
        ctx.cfg.session_secret,
        ctx.cfg.caller_id,
        pong_port,
        msg.seq,
        &payload,
    );
    if len > 0 {
        let _ = ctx.remote.send_to(&buf[..len], msg.sender).await;
    }
}

/// Ingest a probe echo: compute the round trip, feed the matching
/// collector, refresh the peer's liveness and advisory statistics.
fn ingest_pong(ctx: &ClientCtx, msg: StageMsg) {
    let (kind, skip) = match msg.dest_port {
        PORT_PONG => (PingKind::Direct, 0),
        PORT_PONG_SRV => (PingKind::Relay, 1),
        _ => (PingKind::Local, 0),
    };
    let Some(t_send) = decode_ping_time(&msg.payload, skip) else {
        return;
    };
    let rtt_ms = (ctx.remote.time_since_start() - t_send) * 1000.0;
    if rtt_ms <= 0.0 {
        return;
    }
    let collectors = match kind {
        PingKind::Direct => &ctx.collectors.p2p,
        PingKind::Relay => &ctx.collectors.srv,
        PingKind::Local => &ctx.collectors.local,
    };
    collectors
        .lock()
        .entry(msg.cid)
        .or_default()
        .add_value(rtt_ms);
    ctx.peers.set_ping_time(msg.cid, rtt_ms);
    ctx.emit(StageEvent::PingEcho {
        cid: msg.cid,
        rtt_ms,
        via: kind,
        endpoint: msg.sender,
    });
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound task
// ────────────────────────────────────────────────────────────────────────────

/// Read datagrams from a local source socket, wrap them for `wrap_port`
/// and apply the forwarding policy. `source` is `None` for the primary
/// receiver (the client's own local socket).
async fn outbound_task(
    ctx: &ClientCtx,
    source: Option<StageSocket>,
    wrap_port: u16,
    cancel: CancellationToken,
) {
    let source = source.as_ref().unwrap_or(&ctx.local);
    let mut buf = vec![0u8; BUFSIZE];
    let mut packed = vec![0u8; BUFSIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = source.recv_from(&mut buf) => {
                let n = match received {
                    Ok((n, _)) => n,
                    Err(e) => {
                        error!("local source socket failed: {}", e);
                        cancel.cancel();
                        break;
                    }
                };
                let len = ctx.remote.pack_into(&mut packed, wrap_port, &buf[..n]);
                if len == 0 {
                    warn!("dropping oversized local datagram ({} bytes)", n);
                    continue;
                }
                let snapshot = ctx.peers.snapshot();
                let plan = forward::plan(
                    ctx.cfg.caller_id,
                    ctx.cfg.mode_flags,
                    ctx.cfg.send_local_shortcut,
                    &snapshot,
                );
                for dest in &plan.destinations {
                    let _ = ctx.remote.send_to(&packed[..len], *dest).await;
                }
                if plan.to_relay {
                    let _ = ctx.remote.send_to_port(&packed[..len], ctx.cfg.relay_port).await;
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Ping task
// ────────────────────────────────────────────────────────────────────────────

async fn ping_task(ctx: Arc<ClientCtx>, cancel: CancellationToken) {
    let period = Duration::from_millis(ctx.cfg.ping_period_ms());
    let version = env!("CARGO_PKG_VERSION");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        let pubkey = *ctx.pubkey.read();
        ctx.remote
            .send_registration(
                ctx.cfg.mode_flags,
                ctx.cfg.relay_port,
                ctx.local_ep,
                version,
                pubkey.as_ref(),
            )
            .await;

        let snapshot = ctx.peers.snapshot();
        let own_public = snapshot[ctx.cfg.caller_id as usize].public;
        for (cid, peer) in snapshot.iter().enumerate() {
            let cid = cid as u8;
            if !peer.is_live() || cid == ctx.cfg.caller_id {
                continue;
            }
            ctx.remote
                .send_ping(peer.public, cid, PORT_PING, own_public)
                .await;
            ctx.collectors.p2p.lock().entry(cid).or_default().sent += 1;

            ctx.remote
                .send_ping(ctx.relay_ep, cid, PORT_PING_SRV, own_public)
                .await;
            ctx.collectors.srv.lock().entry(cid).or_default().sent += 1;

            if same_net(*own_public.ip(), *peer.public.ip())
                && *peer.local.ip() != Ipv4Addr::UNSPECIFIED
            {
                ctx.remote
                    .send_ping(peer.local, cid, PORT_PING_LOCAL, own_public)
                    .await;
                ctx.collectors.local.lock().entry(cid).or_default().sent += 1;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Liveness task
// ────────────────────────────────────────────────────────────────────────────

async fn liveness_task(ctx: Arc<ClientCtx>, cancel: CancellationToken) {
    let period = Duration::from_millis(ctx.cfg.ping_period_ms());
    let report_every = (REPORT_INTERVAL_MS / ctx.cfg.ping_period_ms()).max(1);
    let mut countdown = report_every;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        for transition in ctx.peers.tick() {
            match transition {
                PeerTransition::Up(cid, desc) if cid != ctx.cfg.caller_id => {
                    info!(
                        "new connection for {} from {} in {}-mode{}{} v{}",
                        cid,
                        desc.public,
                        if desc.mode & protocol::MODE_PEER2PEER != 0 {
                            "peer-to-peer"
                        } else {
                            "server"
                        },
                        if desc.mode & protocol::MODE_RECEIVEDOWNMIX != 0 {
                            " receivedownmix"
                        } else {
                            ""
                        },
                        if desc.mode & protocol::MODE_DONOTSEND != 0 {
                            " donotsend"
                        } else {
                            ""
                        },
                        desc.version,
                    );
                    ctx.emit(StageEvent::NewConnection {
                        cid,
                        endpoint: desc.public,
                        mode: desc.mode,
                        version: desc.version,
                    });
                }
                PeerTransition::Down(cid) if cid != ctx.cfg.caller_id => {
                    info!("connection for {} lost", cid);
                    ctx.emit(StageEvent::ConnectionLost { cid });
                }
                _ => {}
            }
        }

        countdown -= 1;
        if countdown == 0 {
            countdown = report_every;
            report_statistics(&ctx).await;
        }
    }
}

/// Roll up and publish per-peer statistics: log lines, one
/// [`StageEvent::LatencyReport`] per live peer, and an advisory
/// `PEERLATREP` to the relay. All accumulators restart from here.
async fn report_statistics(ctx: &ClientCtx) {
    let snapshot = ctx.peers.snapshot();
    for (cid, peer) in snapshot.iter().enumerate() {
        let cid = cid as u8;
        if !peer.is_live() || cid == ctx.cfg.caller_id {
            continue;
        }

        let current = ctx
            .msg_stats
            .lock()
            .get(&cid)
            .copied()
            .unwrap_or_default();
        let previous = {
            let mut prev = ctx.prev_stats.lock();
            let entry = prev.entry(cid).or_default();
            let snapshot = *entry;
            *entry = current;
            snapshot
        };
        let stats = ClientStats {
            packages: current.since(&previous),
            ping_p2p: ctx.collectors.p2p.lock().entry(cid).or_default().rollup(),
            ping_srv: ctx.collectors.srv.lock().entry(cid).or_default().rollup(),
            ping_local: ctx.collectors.local.lock().entry(cid).or_default().rollup(),
        };

        info!("packages {} {}", cid, stats.packages);
        if stats.ping_p2p.received > 0 {
            info!("lat-p2p {} {}", cid, stats.ping_p2p);
        }
        if stats.ping_srv.received > 0 {
            info!("lat-srv {} {}", cid, stats.ping_srv);
        }
        if stats.ping_local.received > 0 {
            info!("lat-loc {} {}", cid, stats.ping_local);
        }

        let payload = encode_latency_report(
            cid,
            [
                stats.ping_p2p.t_min,
                stats.ping_p2p.t_med,
                stats.ping_p2p.t_p99,
                stats.ping_p2p.received as f64,
                stats.ping_p2p.lost as f64,
            ],
        );
        ctx.remote
            .pack_and_send(PORT_PEERLATREP, &payload, ctx.cfg.relay_port)
            .await;

        ctx.peers.rollup_advisory(cid);
        ctx.emit(StageEvent::LatencyReport { cid, stats });
    }
}
