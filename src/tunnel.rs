//! TCP tunnel transport.
//!
//! Some venue networks forbid UDP entirely. The tunnel carries the
//! session's UDP datagrams over one persistent TCP connection as
//! length-prefixed frames (`len_le_u32 || bytes`) and bridges them onto
//! an auxiliary loopback UDP socket on each side:
//!
//! ```text
//!   local UDP ──► aux socket ──frame──► TCP ──frame──► aux socket ──► 127.0.0.1:target
//! ```
//!
//! Framing is strict: a short read on the length or the body, or a
//! length above [`BUFSIZE`], closes the connection. The auxiliary socket
//! and the pump task of a connection are released on every exit path.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{StageError, BUFSIZE};

/// A running tunnel endpoint (server or client side).
pub struct TcpTunnel {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TcpTunnel {
    /// Accept tunnel connections on `listen_port` (0 for an ephemeral
    /// port) and relay decoded frames to `127.0.0.1:target_port`. Each
    /// connection gets its own auxiliary UDP socket bound to
    /// `udp_response_port` (usually 0).
    ///
    /// Returns the tunnel handle and the actually bound TCP port.
    pub async fn serve(
        listen_port: u16,
        target_port: u16,
        udp_response_port: u16,
    ) -> Result<(Self, u16), StageError> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, listen_port))
            .await
            .map_err(|source| StageError::Bind {
                port: listen_port,
                source,
            })?;
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        info!("tunnel server listening on port {}", bound);

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                info!("tunnel connection from {}", peer);
                                let ct = accept_cancel.child_token();
                                tokio::spawn(async move {
                                    match run_connection(stream, target_port, udp_response_port, ct).await {
                                        Ok(()) => info!("closing tunnel connection from {}", peer),
                                        Err(e) => warn!("tunnel connection from {} ended: {:#}", peer, e),
                                    }
                                });
                            }
                            Err(e) => warn!("tunnel accept error: {}", e),
                        }
                    }
                }
            }
            debug!("tunnel server stopped");
        });

        Ok((Self { cancel, handle }, bound))
    }

    /// Connect to a tunnel server and relay decoded frames to
    /// `127.0.0.1:target_port`.
    ///
    /// Returns the tunnel handle and the port of the auxiliary UDP
    /// socket; local producers send their datagrams there.
    pub async fn connect(
        server: SocketAddrV4,
        target_port: u16,
        udp_response_port: u16,
    ) -> Result<(Self, u16), StageError> {
        let stream = TcpStream::connect(server).await?;
        let udp = bind_aux_socket(udp_response_port).await?;
        let udp_port = udp.local_addr().map(|a| a.port()).unwrap_or(0);
        info!(
            "tunnel connected to {}, UDP listening on port {}, sending to {}",
            server, udp_port, target_port
        );

        let cancel = CancellationToken::new();
        let ct = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_bridged(stream, target_port, udp, ct).await {
                warn!("tunnel connection to {} ended: {:#}", server, e);
            }
        });

        Ok((Self { cancel, handle }, udp_port))
    }

    /// Stop the tunnel and wait for its tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn bind_aux_socket(port: u16) -> Result<Arc<UdpSocket>, StageError> {
    let udp = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .await
        .map_err(|source| StageError::Bind { port, source })?;
    Ok(Arc::new(udp))
}

/// Server-side connection handler: bind the auxiliary socket, then run
/// the bridge.
async fn run_connection(
    stream: TcpStream,
    target_port: u16,
    udp_response_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let udp = bind_aux_socket(udp_response_port)
        .await
        .context("binding auxiliary UDP socket")?;
    run_bridged(stream, target_port, udp, cancel).await
}

/// Bidirectional bridge between one TCP stream and one auxiliary UDP
/// socket. Returns when the stream closes, a protocol error occurs, or
/// the token is cancelled.
async fn run_bridged(
    stream: TcpStream,
    target_port: u16,
    udp: Arc<UdpSocket>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    // UDP → TCP pump; owns the write half.
    let pump_cancel = cancel.child_token();
    let pump_udp = Arc::clone(&udp);
    let pump = tokio::spawn(pump_udp_to_tcp(pump_udp, writer, pump_cancel.clone()));

    let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, target_port);
    let mut buf = vec![0u8; BUFSIZE];
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = read_frame(&mut reader, &mut buf) => {
                match frame {
                    Ok(0) => {} // keepalive frame, nothing to deliver
                    Ok(n) => {
                        if let Err(e) = udp.send_to(&buf[..n], target).await {
                            break Err(e).context("relaying frame to UDP");
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    // Release the write half and the pump on every exit path.
    pump_cancel.cancel();
    let _ = pump.await;
    result
}

/// Read one length-prefixed frame into `buf`; the frame must fit into
/// [`BUFSIZE`] bytes.
async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<usize> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("reading frame length")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > BUFSIZE {
        bail!("frame too large: {} bytes (max {})", len, BUFSIZE);
    }
    reader
        .read_exact(&mut buf[..len])
        .await
        .context("reading frame body")?;
    Ok(len)
}

async fn pump_udp_to_tcp(udp: Arc<UdpSocket>, mut writer: OwnedWriteHalf, cancel: CancellationToken) {
    let mut buf = [0u8; BUFSIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = udp.recv_from(&mut buf) => {
                match received {
                    Ok((n, _)) => {
                        let mut frame = Vec::with_capacity(4 + n);
                        frame.extend_from_slice(&(n as u32).to_le_bytes());
                        frame.extend_from_slice(&buf[..n]);
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("tunnel UDP receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
