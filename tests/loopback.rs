//! End-to-end loopback scenarios.
//!
//! The tests play the roles of all external collaborators at once: the
//! relay server (a plain UDP socket the clients register with), the
//! audio renderer (datagrams sent to a client's local receiver port) and
//! the local sinks (sockets observing what a client delivers).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use stagelink::protocol::{
    encode_endpoint, pack_msg, unpack_header, BUFSIZE, MAX_SPECIAL_PORT, MODE_DONOTSEND,
    MODE_PEER2PEER, PORT_LISTCID,
};
use stagelink::{PingKind, StageClient, StageConfig, StageEvent};

const SECRET: u32 = 424_242;

async fn local_udp() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

/// Reserve `N` distinct, probably-free UDP ports. The reservation
/// sockets are held until all ports are known, so no port appears twice.
async fn free_udp_ports<const N: usize>() -> [u16; N] {
    let mut sockets = Vec::with_capacity(N);
    let mut ports = [0u16; N];
    for port in ports.iter_mut() {
        let (socket, p) = local_udp().await;
        sockets.push(socket);
        *port = p;
    }
    ports
}

async fn start_client(
    caller_id: u8,
    relay_port: u16,
    recv_port: u16,
    port_offset: u16,
    mode_flags: u8,
) -> (StageClient, mpsc::Receiver<StageEvent>) {
    let cfg = StageConfig {
        relay_host: "127.0.0.1".to_string(),
        relay_port,
        recv_port,
        port_offset,
        session_secret: SECRET,
        caller_id,
        mode_flags,
        reorder_deadline_ms: 10,
        send_local_shortcut: false,
        hires_ping: true,
        ..StageConfig::default()
    };
    let (tx, rx) = mpsc::channel(256);
    (StageClient::connect(cfg, tx).await.unwrap(), rx)
}

/// Act as the relay: announce the full roster to every client.
async fn distribute_roster(relay: &UdpSocket, clients: &[&StageClient], modes: &[u8]) {
    for client in clients {
        for (cid, peer) in clients.iter().enumerate() {
            let image =
                encode_endpoint(SocketAddrV4::new(Ipv4Addr::LOCALHOST, peer.session_port()));
            let mut buf = [0u8; BUFSIZE];
            let len = pack_msg(
                &mut buf,
                SECRET,
                cid as u8,
                PORT_LISTCID,
                modes[cid] as i16,
                &image,
            );
            assert!(len > 0);
            relay
                .send_to(&buf[..len], (Ipv4Addr::LOCALHOST, client.session_port()))
                .await
                .unwrap();
        }
    }
    // Let the inbound tasks ingest the roster.
    sleep(Duration::from_millis(300)).await;
}

/// Drain the relay socket and assert that only control traffic
/// (registrations, relayed probes) reached it — never user-port media.
async fn assert_no_media_at_relay(relay: &UdpSocket) {
    let mut buf = [0u8; BUFSIZE];
    let deadline = Instant::now() + Duration::from_millis(300);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, relay.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                let header = unpack_header(&buf[..n]).expect("relay got a short datagram");
                assert!(
                    header.dest_port < MAX_SPECIAL_PORT,
                    "relay received media on user port {}",
                    header.dest_port
                );
            }
            _ => break,
        }
    }
}

async fn expect_datagram(socket: &UdpSocket, what: &str) -> (Vec<u8>, SocketAddrV4) {
    let mut buf = [0u8; BUFSIZE];
    let (n, sender) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap_or_else(|_| panic!("{} did not arrive", what))
        .unwrap();
    let sender = match sender {
        std::net::SocketAddr::V4(v4) => v4,
        other => panic!("unexpected sender {}", other),
    };
    (buf[..n].to_vec(), sender)
}

async fn expect_silence(socket: &UdpSocket, what: &str) {
    let mut buf = [0u8; BUFSIZE];
    if let Ok(Ok((n, _))) = timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
        panic!("{}: unexpected {}-byte datagram", what, n);
    }
}

#[tokio::test]
async fn peer_to_peer_mesh_delivers_without_the_relay() {
    let (relay, relay_port) = local_udp().await;

    // Sinks observing the local delivery of clients 1 and 2; the port
    // offsets map client 0's user port onto the sink ports.
    let (sink1, sink1_port) = local_udp().await;
    let (sink2, sink2_port) = local_udp().await;

    let [p0, p1, p2] = free_udp_ports().await;

    let p2p = MODE_PEER2PEER;
    let (c0, _e0) = start_client(0, relay_port, p0, 0, p2p).await;
    let (c1, _e1) = start_client(1, relay_port, p1, sink1_port.wrapping_sub(p0), p2p).await;
    let (c2, _e2) = start_client(2, relay_port, p2, sink2_port.wrapping_sub(p0), p2p).await;

    distribute_roster(&relay, &[&c0, &c1, &c2], &[p2p, p2p, p2p]).await;

    // The renderer hands client 0 one media datagram.
    let (producer, _) = local_udp().await;
    producer
        .send_to(b"take one", (Ipv4Addr::LOCALHOST, p0))
        .await
        .unwrap();

    // Both peers deliver it locally, with header stripped.
    let (payload, _) = expect_datagram(&sink1, "datagram at client 1").await;
    assert_eq!(b"take one".as_slice(), payload.as_slice());
    let (payload, _) = expect_datagram(&sink2, "datagram at client 2").await;
    assert_eq!(b"take one".as_slice(), payload.as_slice());

    // Exactly one copy each, and the relay saw no media.
    expect_silence(&sink1, "client 1 duplicate").await;
    expect_silence(&sink2, "client 2 duplicate").await;
    assert_no_media_at_relay(&relay).await;

    c0.shutdown().await;
    c1.shutdown().await;
    c2.shutdown().await;
}

#[tokio::test]
async fn donotsend_peer_is_not_served() {
    let (relay, relay_port) = local_udp().await;
    let (sink1, sink1_port) = local_udp().await;
    let (sink2, sink2_port) = local_udp().await;

    let [p0, p1, p2] = free_udp_ports().await;

    let p2p = MODE_PEER2PEER;
    let muted = MODE_PEER2PEER | MODE_DONOTSEND;
    let (c0, _e0) = start_client(0, relay_port, p0, 0, p2p).await;
    let (c1, _e1) = start_client(1, relay_port, p1, sink1_port.wrapping_sub(p0), p2p).await;
    let (c2, _e2) = start_client(2, relay_port, p2, sink2_port.wrapping_sub(p0), muted).await;

    distribute_roster(&relay, &[&c0, &c1, &c2], &[p2p, p2p, muted]).await;

    let (producer, _) = local_udp().await;
    producer
        .send_to(b"take two", (Ipv4Addr::LOCALHOST, p0))
        .await
        .unwrap();

    let (payload, _) = expect_datagram(&sink1, "datagram at client 1").await;
    assert_eq!(b"take two".as_slice(), payload.as_slice());

    // The muted client receives nothing, and the relay still no media.
    expect_silence(&sink2, "muted client 2").await;
    assert_no_media_at_relay(&relay).await;

    c0.shutdown().await;
    c1.shutdown().await;
    c2.shutdown().await;
}

#[tokio::test]
async fn direct_ping_yields_a_loopback_round_trip() {
    let (relay, relay_port) = local_udp().await;

    let [p0, p1] = free_udp_ports().await;

    let p2p = MODE_PEER2PEER;
    let (c0, mut e0) = start_client(0, relay_port, p0, 0, p2p).await;
    let (c1, _e1) = start_client(1, relay_port, p1, 0, p2p).await;

    distribute_roster(&relay, &[&c0, &c1], &[p2p, p2p]).await;

    // The new peer is announced before (or while) probes start flowing.
    let mut announced = false;
    let mut echoed = false;
    let deadline = Instant::now() + Duration::from_secs(3);
    while (!announced || !echoed) && Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(Some(event)) = timeout(remaining, e0.recv()).await else {
            break;
        };
        match event {
            StageEvent::NewConnection { cid: 1, .. } => announced = true,
            StageEvent::PingEcho {
                cid: 1,
                rtt_ms,
                via: PingKind::Direct,
                ..
            } => {
                assert!(
                    rtt_ms > 0.0 && rtt_ms < 50.0,
                    "loopback round trip out of range: {} ms",
                    rtt_ms
                );
                echoed = true;
            }
            _ => {}
        }
    }
    assert!(announced, "peer 1 was never announced");
    assert!(echoed, "no direct ping echo from peer 1");

    c0.shutdown().await;
    c1.shutdown().await;
}
