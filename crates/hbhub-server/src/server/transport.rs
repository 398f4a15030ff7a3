// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Outbound datagram path.
//!
//! Every datagram leaving the hub goes through one mpsc queue drained by a
//! single writer task that owns the send half of the UDP socket. Command
//! replies are queued directly with the peer address; routed DMRD frames
//! arrive on the bus `outgoing` channel and are addressed through the
//! presence store using the repeater ID at offset 11.

use super::packet::{read_repeater_id, DATA_FRAME_LEN, DATA_TAG, REPEATER_ID_OFFSET};
use super::presence::{ConnectionPhase, PresenceStore};
use super::protocol::Reply;
use crate::bus::{BusError, BusSubscription};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// A datagram queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub addr: SocketAddr,
}

/// Transport counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Datagrams written to the socket.
    pub sent: AtomicU64,
    /// Outgoing frames with no live session to address.
    pub unaddressed: AtomicU64,
    /// Socket write failures.
    pub send_errors: AtomicU64,
}

/// Cloneable handle for queueing outbound datagrams.
#[derive(Clone)]
pub struct ReplySender {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl ReplySender {
    /// Create a sender and the queue its writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue raw bytes. Returns `false` once the writer is gone.
    pub fn send(&self, addr: SocketAddr, data: Vec<u8>) -> bool {
        self.tx.send(Datagram { data, addr }).is_ok()
    }

    /// Queue a command reply carrying a radio ID or salt.
    pub fn reply(&self, addr: SocketAddr, reply: Reply, value: u32) -> bool {
        self.send(addr, reply.encode(&value.to_be_bytes()))
    }
}

/// Drain the queue into the socket until shutdown.
pub async fn run_writer(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Datagram>,
    stats: Arc<TransportStats>,
    shutdown: Arc<Notify>,
) {
    let shutdown = shutdown.notified();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            datagram = rx.recv() => {
                let Some(datagram) = datagram else { break };
                match socket.send_to(&datagram.data, datagram.addr).await {
                    Ok(_) => {
                        stats.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.send_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Send to {} failed: {}", datagram.addr, e);
                    }
                }
            }
            _ = &mut shutdown => {
                debug!("Writer shutting down");
                break;
            }
        }
    }
}

/// Address one `outgoing` bus message to a connected repeater. Returns
/// `true` if it was queued.
pub fn dispatch_outgoing(
    data: &[u8],
    presence: &PresenceStore,
    replies: &ReplySender,
    stats: &TransportStats,
) -> bool {
    if data.len() < DATA_FRAME_LEN || &data[..DATA_TAG.len()] != DATA_TAG {
        warn!("Dropping malformed outgoing frame ({} bytes)", data.len());
        return false;
    }

    let repeater_id = read_repeater_id(data);
    match presence.get(repeater_id) {
        Some(session) if session.phase == ConnectionPhase::Connected => {
            replies.send(session.addr, data.to_vec())
        }
        Some(session) => {
            stats.unaddressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Repeater {} is {:?}, dropping outgoing frame",
                repeater_id, session.phase
            );
            false
        }
        None => {
            stats.unaddressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "No session for repeater {} (offset {}), dropping outgoing frame",
                repeater_id, REPEATER_ID_OFFSET
            );
            false
        }
    }
}

/// Consume the bus `outgoing` channel until shutdown.
pub async fn run_outgoing(
    mut subscription: BusSubscription,
    presence: Arc<PresenceStore>,
    replies: ReplySender,
    stats: Arc<TransportStats>,
    shutdown: Arc<Notify>,
) {
    let shutdown = shutdown.notified();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            msg = subscription.recv() => match msg {
                Ok(payload) => {
                    dispatch_outgoing(&payload, &presence, &replies, &stats);
                }
                Err(BusError::Lagged(n)) => {
                    warn!("Outgoing consumer lagged, {} frames lost", n);
                }
                Err(e) => {
                    warn!("Outgoing channel ended: {}", e);
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::packet::tests::voice_packet;
    use crate::server::presence::RepeaterSession;
    use std::time::Duration;

    #[test]
    fn test_reply_bytes() {
        let (replies, mut rx) = ReplySender::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 40000));
        assert!(replies.reply(addr, Reply::Ack, 0x0102_0304));

        let datagram = rx.try_recv().unwrap();
        assert_eq!(datagram.addr, addr);
        assert_eq!(datagram.data, b"RPTACK\x01\x02\x03\x04".to_vec());
    }

    #[test]
    fn test_send_after_writer_gone() {
        let (replies, rx) = ReplySender::new();
        drop(rx);
        assert!(!replies.send(SocketAddr::from(([127, 0, 0, 1], 1)), vec![1]));
    }

    #[tokio::test]
    async fn test_dispatch_outgoing_uses_session_address() {
        let presence = PresenceStore::new(Duration::from_secs(60));
        let addr = SocketAddr::from(([10, 1, 2, 3], 50000));
        let mut session = RepeaterSession::new(312_750, addr);
        session.phase = ConnectionPhase::Connected;
        presence.store(session);

        let (replies, mut rx) = ReplySender::new();
        let stats = TransportStats::default();

        let frame = voice_packet(3_120_001, 9, 312_750, 1).encode();
        assert!(dispatch_outgoing(&frame, &presence, &replies, &stats));
        assert_eq!(rx.try_recv().unwrap(), Datagram { data: frame, addr });

        let unknown = voice_packet(3_120_001, 9, 1, 1).encode();
        assert!(!dispatch_outgoing(&unknown, &presence, &replies, &stats));
        assert_eq!(stats.unaddressed.load(Ordering::Relaxed), 1);

        assert!(!dispatch_outgoing(b"DMRD", &presence, &replies, &stats));
    }

    #[tokio::test]
    async fn test_dispatch_outgoing_skips_unfinished_login() {
        let presence = PresenceStore::new(Duration::from_secs(60));
        let (replies, mut rx) = ReplySender::new();
        let stats = TransportStats::default();

        for phase in [
            ConnectionPhase::Unregistered,
            ConnectionPhase::ChallengeSent,
            ConnectionPhase::WaitingConfig,
        ] {
            let addr = SocketAddr::from(([10, 1, 2, 3], 50000));
            let mut session = RepeaterSession::new(312_750, addr);
            session.phase = phase;
            presence.store(session);

            let frame = voice_packet(3_120_001, 9, 312_750, 1).encode();
            assert!(!dispatch_outgoing(&frame, &presence, &replies, &stats));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.unaddressed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_writer_sends_over_udp() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let (replies, rx) = ReplySender::new();
        let stats = Arc::new(TransportStats::default());
        let shutdown = Arc::new(Notify::new());
        let writer = tokio::spawn(run_writer(
            server,
            rx,
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        ));

        replies.reply(client_addr, Reply::Pong, 7);
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"MSTPONG\0\0\0\x07");

        shutdown.notify_waiters();
        writer.await.unwrap();
        assert_eq!(stats.sent.load(Ordering::Relaxed), 1);
    }
}
