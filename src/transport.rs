//! UDP broadcast transport.
//!
//! One socket, bound to the well-known port with address reuse and
//! broadcast enabled. A dedicated std thread blocks on `recv_from` with a
//! short timeout (so the process can wind down promptly) and pushes decoded,
//! filtered frames into a bounded channel; a single sender task drains the
//! outbound channel. Every send targets the limited broadcast address —
//! receivers filter on the destination MAC in the header, so the engines
//! never touch a socket directly and stay unit-testable.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration as StdDuration;

use anyhow::Context;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::identity::NodeDirectory;
use crate::wire::Frame;

/// Poll timeout on the receive socket; bounds shutdown latency.
const RECV_POLL_TIMEOUT_MS: u64 = 100;

/// Largest datagram the mesh carries (header + JSON payload).
const MAX_DATAGRAM: usize = 2048;

/// Depth of the inbound frame channel (receive thread -> dispatch task).
pub const FRAME_QUEUE_SIZE: usize = 64;
pub type FrameQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;
pub type FrameQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;
pub type FrameQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;

/// Depth of the outbound frame channel (engines -> sender task).
pub const TX_QUEUE_SIZE: usize = 64;
pub type TxQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Frame, TX_QUEUE_SIZE>;
pub type TxQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, Frame, TX_QUEUE_SIZE>;
pub type TxQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, Frame, TX_QUEUE_SIZE>;

/// Bind the mesh socket: `0.0.0.0:port`, address reuse, broadcast.
pub fn open_socket(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("create UDP socket")?;
    socket.set_reuse_address(true).context("enable address reuse")?;
    socket.set_broadcast(true).context("enable broadcast")?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into()).with_context(|| format!("bind 0.0.0.0:{}", port))?;
    Ok(socket.into())
}

/// Reception filter: a decoded frame is processed only with TTL budget
/// left and when addressed to this node or to everyone.
fn should_accept(frame: &Frame, directory: &NodeDirectory) -> bool {
    frame.ttl > 0 && directory.accepts(frame.dst_mac)
}

/// Receive loop, run on its own thread. Applies the reception filter
/// (decodable header, TTL not exhausted, addressed to us or broadcast)
/// before handing frames to the dispatch task. A full queue drops the
/// frame; the mesh tolerates loss by design of every protocol above it.
pub fn receiver_loop(socket: UdpSocket, directory: NodeDirectory, frames: FrameQueueSender) {
    if let Err(err) = socket.set_read_timeout(Some(StdDuration::from_millis(RECV_POLL_TIMEOUT_MS))) {
        log::error!("failed to set receive timeout: {}", err);
        return;
    }
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => {
                let Some(frame) = Frame::decode(&buf[..len]) else {
                    continue;
                };
                if !should_accept(&frame, &directory) {
                    continue;
                }
                if frames.try_send(frame).is_err() {
                    log::warn!("inbound frame queue full, dropping frame");
                }
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(err) => {
                log::error!("udp receive error: {}", err);
                std::thread::sleep(StdDuration::from_millis(RECV_POLL_TIMEOUT_MS));
            }
        }
    }
}

/// Single sender task: drains the TX channel onto the wire. Sends are
/// best-effort; a failed send is logged and the frame is gone.
#[embassy_executor::task]
pub async fn tx_task(socket: UdpSocket, port: u16, tx_rx: TxQueueReceiver) {
    let target: SocketAddr = (Ipv4Addr::BROADCAST, port).into();
    loop {
        let frame = tx_rx.receive().await;
        let bytes = frame.encode();
        match socket.send_to(&bytes, target) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("udp send would block, frame dropped");
            }
            Err(err) => {
                log::debug!("udp send failed: {}", err);
            }
        }
    }
}
