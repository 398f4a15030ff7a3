// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Hub server core: UDP receive loop, dispatch and background tasks.

use crate::bus::{MemoryBus, PubSub, OUTGOING_CHANNEL};
use crate::config::{ConfigError, ServerConfig};
use crate::directory::{Directory, DirectoryError, MemoryDirectory};
use crate::events::EventBus;
use regex::Regex;
use ring::rand::SystemRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

pub mod auth;
pub mod calls;
pub mod packet;
pub mod parrot;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod subscription;
pub mod transport;

pub use calls::CallTracker;
pub use packet::{FrameType, Packet};
pub use parrot::{Parrot, ParrotStore, ReplayPacing};
pub use presence::{ConnectionPhase, PresenceStore, RepeaterSession};
pub use protocol::{Command, Frame, ProtocolError, RepeaterDetails, Reply};
pub use subscription::{LinkError, LinkKind, ListenerKey, SubscriptionManager};
pub use transport::{Datagram, ReplySender, TransportStats};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 1500;

/// Shared state handed to every datagram task.
pub struct HubContext {
    config: ServerConfig,
    callsign_pattern: Regex,
    rng: SystemRandom,
    presence: Arc<PresenceStore>,
    directory: Arc<dyn Directory>,
    bus: Arc<dyn PubSub>,
    events: EventBus,
    replies: ReplySender,
    subscriptions: SubscriptionManager,
    calls: Arc<CallTracker>,
    parrot: Arc<Parrot>,
}

impl HubContext {
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn Directory>,
        bus: Arc<dyn PubSub>,
        events: EventBus,
        replies: ReplySender,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let callsign_pattern = config.callsign_regex()?;

        let calls = Arc::new(CallTracker::new(Arc::clone(&directory), events.clone()));
        let parrot = Arc::new(Parrot::new(
            config.parrot_ttl(),
            ReplayPacing {
                settle_delay: config.parrot_delay(),
                frame_interval: config.parrot_frame_interval(),
            },
            Arc::clone(&bus),
            Arc::clone(&calls),
        ));

        Ok(Self {
            presence: Arc::new(PresenceStore::new(config.session_ttl())),
            subscriptions: SubscriptionManager::new(Arc::clone(&bus), Arc::clone(&directory)),
            callsign_pattern,
            rng: SystemRandom::new(),
            config,
            directory,
            bus,
            events,
            replies,
            calls,
            parrot,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn bus(&self) -> &Arc<dyn PubSub> {
        &self.bus
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn replies(&self) -> &ReplySender {
        &self.replies
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn calls(&self) -> &Arc<CallTracker> {
        &self.calls
    }

    pub fn parrot(&self) -> &Arc<Parrot> {
        &self.parrot
    }

    pub(crate) fn callsign_pattern(&self) -> &Regex {
        &self.callsign_pattern
    }

    pub(crate) fn rng(&self) -> &SystemRandom {
        &self.rng
    }

    pub(crate) fn verbose(&self) -> bool {
        self.config.verbose
    }

    /// Drop expired sessions, parrot recordings and idle bus channels.
    pub fn sweep(&self) {
        let expired = self.presence.remove_expired();
        if !expired.is_empty() {
            info!("Removed {} expired repeater sessions", expired.len());
            for id in &expired {
                debug!("  - {}", id);
            }
        }
        let purged = self.parrot.store().remove_expired();
        if purged > 0 {
            debug!("Purged {} expired parrot entries", purged);
        }
        let pruned = self.bus.prune();
        if pruned > 0 {
            debug!("Pruned {} idle bus channels", pruned);
        }
    }
}

/// Decode one datagram and hand it to its handler.
pub async fn handle_datagram(hub: Arc<HubContext>, data: Vec<u8>, addr: SocketAddr) {
    let frame = match Frame::decode(&data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping datagram from {}: {}", addr, e);
            return;
        }
    };

    match frame {
        Frame::Login { repeater_id } => auth::handle_login(&hub, repeater_id, addr),
        Frame::KeyResponse {
            repeater_id,
            challenge,
        } => auth::handle_key_response(&hub, repeater_id, challenge, addr),
        Frame::Config { repeater_id, data } => {
            auth::handle_config(&hub, repeater_id, &data, addr)
        }
        Frame::Disconnect { repeater_id } => auth::handle_disconnect(&hub, repeater_id, addr),
        Frame::Ping { repeater_id } => auth::handle_ping(&hub, repeater_id, addr),
        Frame::Options {
            repeater_id,
            options,
        } => auth::handle_options(&hub, repeater_id, &options, addr),
        Frame::TalkAlias { repeater_id } => auth::handle_talk_alias(&hub, repeater_id, addr),
        Frame::Data(packet) => {
            router::handle_data(&hub, packet, data, addr).await;
        }
        Frame::Peer(peer) => {
            debug!("Ignoring {} from {}", Command::Peer(peer).name(), addr);
        }
    }
}

/// Homebrew repeater hub.
#[derive(Clone)]
pub struct HubServer {
    hub: Arc<HubContext>,
    reply_rx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>>,
    transport_stats: Arc<TransportStats>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl HubServer {
    /// Create a hub over the given collaborators.
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn Directory>,
        bus: Arc<dyn PubSub>,
    ) -> Result<Self, ServerError> {
        let (replies, reply_rx) = ReplySender::new();
        let events = EventBus::new(config.bus_capacity);
        let hub = HubContext::new(config, directory, bus, events, replies)?;

        Ok(Self {
            hub: Arc::new(hub),
            reply_rx: Arc::new(parking_lot::Mutex::new(Some(reply_rx))),
            transport_stats: Arc::new(TransportStats::default()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a hub with the in-process bus and directory.
    ///
    /// The directory is seeded from `config.directory_path` when set.
    pub fn in_memory(config: ServerConfig) -> Result<Self, ServerError> {
        let directory = match &config.directory_path {
            Some(path) => MemoryDirectory::from_file(path)?,
            None => MemoryDirectory::new(),
        };
        let stats = directory.stats();
        info!(
            "Directory: {} repeaters, {} talkgroups, {} users",
            stats.repeaters, stats.talkgroups, stats.users
        );
        let bus = MemoryBus::new(config.bus_capacity);
        Self::new(config, Arc::new(directory), Arc::new(bus))
    }

    pub fn hub(&self) -> &Arc<HubContext> {
        &self.hub
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<UdpSocket, ServerError> {
        let addr = SocketAddr::new(self.hub.config.bind_address, self.hub.config.port);
        UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let socket = self.bind().await?;
        self.serve(socket).await
    }

    /// Serve on an already bound socket until shutdown.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let Some(reply_rx) = self.reply_rx.lock().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(ServerError::AlreadyRunning);
        };

        let socket = Arc::new(socket);
        let local = socket.local_addr()?;
        info!("Hub listening on udp://{}", local);

        let hub = Arc::clone(&self.hub);
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        tokio::spawn(transport::run_writer(
            Arc::clone(&socket),
            reply_rx,
            Arc::clone(&self.transport_stats),
            Arc::clone(&self.shutdown),
        ));
        tokio::spawn(transport::run_outgoing(
            hub.bus.subscribe(OUTGOING_CHANNEL),
            Arc::clone(&hub.presence),
            hub.replies.clone(),
            Arc::clone(&self.transport_stats),
            Arc::clone(&self.shutdown),
        ));

        if let Err(e) = hub.subscriptions.subscribe_all() {
            error!("Failed to subscribe repeaters at startup: {}", e);
        }

        // Sweeper
        let sweep_hub = Arc::clone(&hub);
        let sweep_shutdown = Arc::clone(&self.shutdown);
        let sweep_interval = hub.config.sweep_interval();
        tokio::spawn(async move {
            let shutdown = sweep_shutdown.notified();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => sweep_hub.sweep(),
                    _ = &mut shutdown => {
                        debug!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            if len < protocol::MIN_FRAME_LEN {
                                warn!("Runt datagram ({} bytes) from {}", len, addr);
                                continue;
                            }
                            let data = buf[..len].to_vec();
                            let hub = Arc::clone(&hub);
                            tokio::spawn(handle_datagram(hub, data, addr));
                        }
                        Err(e) => {
                            warn!("Receive error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        hub.subscriptions.shutdown();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the server to shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn transport_stats(&self) -> &TransportStats {
        &self.transport_stats
    }

    /// Connected repeater count.
    pub fn connected_count(&self) -> usize {
        self.hub
            .presence
            .sessions_in(ConnectionPhase::Connected)
            .len()
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{RepeaterConfig, Talkgroup};

    pub(crate) struct TestHub {
        pub hub: Arc<HubContext>,
        pub bus: Arc<MemoryBus>,
        pub directory: Arc<MemoryDirectory>,
        pub sent: mpsc::UnboundedReceiver<Datagram>,
    }

    impl TestHub {
        /// Drain queued datagrams.
        pub fn sent(&mut self) -> Vec<Datagram> {
            let mut out = Vec::new();
            while let Ok(d) = self.sent.try_recv() {
                out.push(d);
            }
            out
        }
    }

    pub(crate) fn repeater_addr() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 10], 62031))
    }

    /// Hub with repeaters 312750 and 312751 (password "secret") and
    /// talkgroups 9 and 91.
    pub(crate) fn test_hub() -> TestHub {
        let directory = Arc::new(MemoryDirectory::new());
        for id in [312_750, 312_751] {
            directory.insert_repeater(RepeaterConfig::new(id, "secret"));
        }
        for id in [9, 91] {
            directory.insert_talkgroup(Talkgroup {
                id,
                name: format!("TG {}", id),
                description: String::new(),
            });
        }

        let bus = Arc::new(MemoryBus::new(256));
        let (replies, sent) = ReplySender::new();
        let hub = HubContext::new(
            ServerConfig::default(),
            directory.clone(),
            bus.clone(),
            EventBus::new(256),
            replies,
        )
        .unwrap();

        TestHub {
            hub: Arc::new(hub),
            bus,
            directory,
            sent,
        }
    }

    /// Put a repeater straight into the connected phase.
    pub(crate) fn connect(hub: &HubContext, radio_id: u32, addr: SocketAddr) {
        let mut session = RepeaterSession::new(radio_id, addr);
        session.phase = ConnectionPhase::Connected;
        hub.presence().store(session);
    }

    #[tokio::test]
    async fn test_handle_datagram_drops_garbage() {
        let mut t = test_hub();
        handle_datagram(Arc::clone(&t.hub), b"XXXXjunk".to_vec(), repeater_addr()).await;
        handle_datagram(Arc::clone(&t.hub), b"RPTL\0".to_vec(), repeater_addr()).await;
        handle_datagram(Arc::clone(&t.hub), b"MSTPONG\0\0\0\x01".to_vec(), repeater_addr()).await;
        assert!(t.sent().is_empty());
        assert!(t.hub.presence().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            HubServer::in_memory(config),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(&path, r#"{"repeaters": [{"radio_id": 1, "password": "pw"}]}"#).unwrap();

        let server = HubServer::in_memory(ServerConfig {
            directory_path: Some(path),
            ..Default::default()
        })
        .unwrap();
        assert!(server.hub().directory().repeater_exists(1).unwrap());
        assert!(!server.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_sessions() {
        let t = test_hub();
        connect(&t.hub, 312_750, repeater_addr());
        tokio::time::advance(t.hub.config().session_ttl() + std::time::Duration::from_secs(1))
            .await;
        t.hub.sweep();
        assert!(t.hub.presence().is_empty());
    }
}
