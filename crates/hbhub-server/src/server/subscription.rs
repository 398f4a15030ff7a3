// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Per-repeater bus listeners.
//!
//! Every connected repeater listens on its own `repeater:<id>` channel and
//! on each talkgroup linked to either timeslot. Listeners forward accepted
//! frames to the `outgoing` channel, rewritten for the receiving repeater.
//!
//! Listeners are tasks kept in a registry keyed by (repeater, channel).
//! Dropping a registry entry cancels its task.

use super::packet::Packet;
use crate::bus::{
    repeater_channel, talkgroup_channel, BusError, BusSubscription, PubSub, RawFrame,
    OUTGOING_CHANNEL,
};
use crate::directory::{Directory, DirectoryError};
use crate::models::RepeaterConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a listener is subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerChannel {
    Repeater,
    Talkgroup(u32),
}

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub repeater_id: u32,
    pub channel: ListenerChannel,
}

impl ListenerKey {
    pub fn repeater(repeater_id: u32) -> Self {
        Self {
            repeater_id,
            channel: ListenerChannel::Repeater,
        }
    }

    pub fn talkgroup(repeater_id: u32, talkgroup_id: u32) -> Self {
        Self {
            repeater_id,
            channel: ListenerChannel::Talkgroup(talkgroup_id),
        }
    }

    /// Bus channel name.
    pub fn channel_name(&self) -> String {
        match self.channel {
            ListenerChannel::Repeater => repeater_channel(self.repeater_id),
            ListenerChannel::Talkgroup(id) => talkgroup_channel(id),
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.repeater_id, self.channel_name())
    }
}

/// Static or dynamic talkgroup link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Static,
    Dynamic,
}

/// Decide whether a repeater wants a talkgroup frame, and on which slot.
///
/// Priority: addressed to the repeater itself (keeps the frame's slot),
/// then dynamic TS2, dynamic TS1, static TS2, static TS1.
pub fn want_rx(config: &RepeaterConfig, packet: &Packet) -> Option<bool> {
    let dst = packet.dst;
    if dst == config.radio_id {
        return Some(packet.slot);
    }
    if config.ts2_dynamic_talkgroup == Some(dst) {
        return Some(true);
    }
    if config.ts1_dynamic_talkgroup == Some(dst) {
        return Some(false);
    }
    if config.ts2_static_talkgroups.contains(&dst) {
        return Some(true);
    }
    if config.ts1_static_talkgroups.contains(&dst) {
        return Some(false);
    }
    None
}

struct ListenerHandle {
    generation: u64,
    _cancel: watch::Sender<()>,
}

type Registry = DashMap<ListenerKey, ListenerHandle>;

enum Delivery {
    Forwarded,
    Skipped,
    Unlinked,
}

/// Listener registry.
pub struct SubscriptionManager {
    bus: Arc<dyn PubSub>,
    directory: Arc<dyn Directory>,
    listeners: Arc<Registry>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(bus: Arc<dyn PubSub>, directory: Arc<dyn Directory>) -> Self {
        Self {
            bus,
            directory,
            listeners: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start a listener unless one already runs for `key`.
    ///
    /// The bus subscription is taken before returning, so frames published
    /// afterwards are seen by the new listener.
    pub fn start(&self, key: ListenerKey) -> bool {
        let vacant = match self.listeners.entry(key) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => vacant,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let subscription = self.bus.subscribe(&key.channel_name());
        let (cancel_tx, cancel_rx) = watch::channel(());
        vacant.insert(ListenerHandle {
            generation,
            _cancel: cancel_tx,
        });

        tokio::spawn(run_listener(
            key,
            generation,
            subscription,
            cancel_rx,
            Arc::clone(&self.bus),
            Arc::clone(&self.directory),
            Arc::clone(&self.listeners),
        ));
        debug!("Listener started: {}", key);
        true
    }

    /// Stop the listener for `key`.
    pub fn cancel(&self, key: &ListenerKey) -> bool {
        let removed = self.listeners.remove(key).is_some();
        if removed {
            debug!("Listener cancelled: {}", key);
        }
        removed
    }

    /// Stop every listener of a repeater.
    pub fn cancel_all(&self, repeater_id: u32) -> usize {
        let mut removed = 0;
        self.listeners.retain(|k, _| {
            let keep = k.repeater_id != repeater_id;
            removed += usize::from(!keep);
            keep
        });
        if removed > 0 {
            debug!("Cancelled {} listeners of repeater {}", removed, repeater_id);
        }
        removed
    }

    /// Stop everything.
    pub fn shutdown(&self) {
        self.listeners.clear();
    }

    pub fn is_listening(&self, key: &ListenerKey) -> bool {
        self.listeners.contains_key(key)
    }

    /// Listener keys of one repeater, sorted.
    pub fn list(&self, repeater_id: u32) -> Vec<ListenerKey> {
        let mut keys: Vec<ListenerKey> = self
            .listeners
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.repeater_id == repeater_id)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Start the repeater channel and every linked talkgroup.
    pub fn subscribe_repeater(&self, config: &RepeaterConfig) -> usize {
        let mut started = usize::from(self.start(ListenerKey::repeater(config.radio_id)));
        for talkgroup in config.linked_talkgroups() {
            started += usize::from(self.start(ListenerKey::talkgroup(config.radio_id, talkgroup)));
        }
        started
    }

    /// Subscribe every repeater in the directory.
    pub fn subscribe_all(&self) -> Result<usize, DirectoryError> {
        let repeaters = self.directory.list_repeaters()?;
        let started: usize = repeaters
            .iter()
            .map(|config| self.subscribe_repeater(config))
            .sum();
        info!(
            "Subscribed {} repeaters ({} listeners)",
            repeaters.len(),
            started
        );
        Ok(started)
    }

    /// Link a talkgroup to a repeater slot, persist, and listen to it.
    ///
    /// A dynamic link replaces the slot's previous dynamic talkgroup.
    pub fn link(
        &self,
        repeater_id: u32,
        kind: LinkKind,
        slot: bool,
        talkgroup_id: u32,
    ) -> Result<RepeaterConfig, LinkError> {
        if !self.directory.talkgroup_exists(talkgroup_id)? {
            return Err(LinkError::UnknownTalkgroup(talkgroup_id));
        }

        let (config, previous) = match kind {
            LinkKind::Static => {
                let config = self
                    .directory
                    .update_repeater(repeater_id, &mut |config: &mut RepeaterConfig| {
                        let list = config.static_talkgroups_mut(slot);
                        if !list.contains(&talkgroup_id) {
                            list.push(talkgroup_id);
                        }
                    })?
                    .ok_or(LinkError::UnknownRepeater(repeater_id))?;
                (config, None)
            }
            LinkKind::Dynamic => {
                let update = self
                    .directory
                    .set_dynamic_talkgroup(repeater_id, slot, Some(talkgroup_id))?
                    .ok_or(LinkError::UnknownRepeater(repeater_id))?;
                let previous = update.previous.filter(|&tg| tg != talkgroup_id);
                (update.config, previous)
            }
        };

        self.start(ListenerKey::talkgroup(repeater_id, talkgroup_id));
        if let Some(previous) = previous {
            self.release(&config, previous);
        }
        Ok(config)
    }

    /// Remove a talkgroup link, persist, and stop listening if no other
    /// link on the repeater still uses it.
    pub fn unlink(
        &self,
        repeater_id: u32,
        kind: LinkKind,
        slot: bool,
        talkgroup_id: u32,
    ) -> Result<RepeaterConfig, LinkError> {
        let (config, changed) = match kind {
            LinkKind::Static => {
                let mut changed = false;
                let config = self
                    .directory
                    .update_repeater(repeater_id, &mut |config: &mut RepeaterConfig| {
                        let list = config.static_talkgroups_mut(slot);
                        let before = list.len();
                        list.retain(|&tg| tg != talkgroup_id);
                        changed = list.len() != before;
                    })?
                    .ok_or(LinkError::UnknownRepeater(repeater_id))?;
                (config, changed)
            }
            LinkKind::Dynamic => {
                let update = self
                    .directory
                    .compare_and_set_dynamic_talkgroup(repeater_id, slot, Some(talkgroup_id), None)?
                    .ok_or(LinkError::UnknownRepeater(repeater_id))?;
                (update.config, update.previous == Some(talkgroup_id))
            }
        };
        if !changed {
            return Err(LinkError::NotLinked(talkgroup_id));
        }

        self.release(&config, talkgroup_id);
        Ok(config)
    }

    /// Cancel a talkgroup listener that `config` no longer links.
    pub fn release(&self, config: &RepeaterConfig, talkgroup_id: u32) -> bool {
        if config.links_talkgroup(talkgroup_id) {
            return false;
        }
        self.cancel(&ListenerKey::talkgroup(config.radio_id, talkgroup_id))
    }
}

async fn run_listener(
    key: ListenerKey,
    generation: u64,
    mut subscription: BusSubscription,
    mut cancel: watch::Receiver<()>,
    bus: Arc<dyn PubSub>,
    directory: Arc<dyn Directory>,
    listeners: Arc<Registry>,
) {
    loop {
        tokio::select! {
            // Resolves with Err once the registry entry is dropped.
            _ = cancel.changed() => break,
            msg = subscription.recv() => match msg {
                Ok(payload) => {
                    match deliver(&key, &payload, bus.as_ref(), directory.as_ref()) {
                        Delivery::Forwarded | Delivery::Skipped => {}
                        Delivery::Unlinked => {
                            info!("Listener {} no longer linked, unsubscribing", key);
                            listeners.remove_if(&key, |_, h| h.generation == generation);
                            break;
                        }
                    }
                }
                Err(BusError::Lagged(n)) => {
                    warn!("Listener {} lagged, {} frames lost", key, n);
                }
                Err(e) => {
                    warn!("Listener {} stopped: {}", key, e);
                    listeners.remove_if(&key, |_, h| h.generation == generation);
                    break;
                }
            },
        }
    }
    debug!("Listener {} finished", key);
}

fn deliver(key: &ListenerKey, payload: &[u8], bus: &dyn PubSub, directory: &dyn Directory) -> Delivery {
    let frame = match RawFrame::from_bytes(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Listener {}: {}", key, e);
            return Delivery::Skipped;
        }
    };
    let mut packet = match Packet::decode(&frame.data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Listener {}: undecodable frame from {}: {}", key, frame.remote_ip, e);
            return Delivery::Skipped;
        }
    };

    let own_id = key.repeater_id;
    match key.channel {
        ListenerChannel::Repeater => {
            packet.repeater = own_id;
        }
        ListenerChannel::Talkgroup(_) => {
            if packet.src == own_id || packet.repeater == own_id {
                return Delivery::Skipped;
            }

            let config = match directory.get_repeater(own_id) {
                Ok(Some(config)) => config,
                Ok(None) => return Delivery::Unlinked,
                Err(e) => {
                    error!("Listener {}: repeater lookup failed: {}", key, e);
                    return Delivery::Skipped;
                }
            };

            match want_rx(&config, &packet) {
                Some(slot) => {
                    packet.repeater = own_id;
                    packet.slot = slot;
                }
                None => return Delivery::Unlinked,
            }
        }
    }

    match bus.publish(OUTGOING_CHANNEL, packet.encode()) {
        Ok(_) => Delivery::Forwarded,
        Err(e) => {
            error!("Listener {}: publish failed: {}", key, e);
            Delivery::Skipped
        }
    }
}

/// Link/unlink error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("unknown repeater {0}")]
    UnknownRepeater(u32),

    #[error("unknown talkgroup {0}")]
    UnknownTalkgroup(u32),

    #[error("talkgroup {0} is not linked")]
    NotLinked(u32),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::directory::{MemoryDirectory, RepeaterDirectory};
    use crate::models::Talkgroup;
    use crate::server::packet::tests::voice_packet;
    use std::time::Duration;

    fn raw(packet: &Packet) -> Vec<u8> {
        RawFrame {
            data: packet.encode(),
            remote_ip: "10.0.0.1".into(),
            remote_port: 62031,
        }
        .to_bytes()
        .unwrap()
    }

    fn setup() -> (SubscriptionManager, Arc<MemoryBus>, Arc<MemoryDirectory>) {
        let bus = Arc::new(MemoryBus::new(64));
        let directory = Arc::new(MemoryDirectory::new());
        for id in [9, 91, 3100] {
            directory.insert_talkgroup(Talkgroup {
                id,
                name: format!("TG {}", id),
                description: String::new(),
            });
        }
        let manager = SubscriptionManager::new(bus.clone(), directory.clone());
        (manager, bus, directory)
    }

    async fn next_outgoing(sub: &mut BusSubscription) -> Packet {
        let payload = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("outgoing frame")
            .unwrap();
        Packet::decode(&payload).unwrap()
    }

    #[test]
    fn test_want_rx_priority() {
        let mut config = RepeaterConfig::new(312_750, "");
        config.ts1_static_talkgroups = vec![91];
        config.ts2_dynamic_talkgroup = Some(91);

        let packet = voice_packet(3_120_001, 91, 1, 1);
        assert_eq!(want_rx(&config, &packet), Some(true));

        config.ts2_dynamic_talkgroup = None;
        assert_eq!(want_rx(&config, &packet), Some(false));

        config.ts1_dynamic_talkgroup = Some(91);
        config.ts2_static_talkgroups = vec![91];
        assert_eq!(want_rx(&config, &packet), Some(false));

        let mut direct = voice_packet(3_120_001, 312_750, 1, 1);
        direct.slot = true;
        assert_eq!(want_rx(&config, &direct), Some(true));

        assert_eq!(want_rx(&config, &voice_packet(1, 9, 1, 1)), None);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (manager, bus, _) = setup();
        let key = ListenerKey::talkgroup(312_750, 9);

        assert!(manager.start(key));
        assert!(!manager.start(key));
        assert_eq!(manager.len(), 1);
        assert_eq!(bus.subscriber_count("talkgroup:9"), 1);

        assert!(manager.cancel(&key));
        assert!(!manager.cancel(&key));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_repeater_and_list() {
        let (manager, _, _) = setup();
        let mut config = RepeaterConfig::new(312_750, "");
        config.ts1_static_talkgroups = vec![9, 3100];
        config.ts2_dynamic_talkgroup = Some(91);

        assert_eq!(manager.subscribe_repeater(&config), 4);
        assert_eq!(
            manager.list(312_750),
            vec![
                ListenerKey::repeater(312_750),
                ListenerKey::talkgroup(312_750, 9),
                ListenerKey::talkgroup(312_750, 91),
                ListenerKey::talkgroup(312_750, 3100),
            ]
        );

        manager.start(ListenerKey::repeater(1));
        assert_eq!(manager.cancel_all(312_750), 4);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_talkgroup_forward_on_preferred_slot() {
        let (manager, bus, directory) = setup();
        let mut config = RepeaterConfig::new(312_751, "");
        config.ts1_static_talkgroups = vec![9];
        config.ts2_dynamic_talkgroup = Some(9);
        directory.insert_repeater(config.clone());
        manager.subscribe_repeater(&config);

        let mut outgoing = bus.subscribe(OUTGOING_CHANNEL);
        bus.publish("talkgroup:9", raw(&voice_packet(3_120_001, 9, 312_750, 1)))
            .unwrap();

        let forwarded = next_outgoing(&mut outgoing).await;
        assert_eq!(forwarded.repeater, 312_751);
        assert!(forwarded.slot);
        assert_eq!(forwarded.src, 3_120_001);
    }

    #[tokio::test]
    async fn test_self_originated_dropped() {
        let (manager, bus, directory) = setup();
        let mut config = RepeaterConfig::new(312_751, "");
        config.ts1_static_talkgroups = vec![9];
        directory.insert_repeater(config.clone());
        manager.subscribe_repeater(&config);

        let mut outgoing = bus.subscribe(OUTGOING_CHANNEL);
        // sourced by the listener's own id
        bus.publish("talkgroup:9", raw(&voice_packet(312_751, 9, 1, 1)))
            .unwrap();
        // relayed by the listener's own repeater
        bus.publish("talkgroup:9", raw(&voice_packet(3_120_001, 9, 312_751, 2)))
            .unwrap();
        bus.publish("talkgroup:9", raw(&voice_packet(3_120_001, 9, 1, 3)))
            .unwrap();

        let forwarded = next_outgoing(&mut outgoing).await;
        assert_eq!(forwarded.stream_id, 3);
    }

    #[tokio::test]
    async fn test_unwanted_frame_unsubscribes() {
        let (manager, bus, directory) = setup();
        let mut config = RepeaterConfig::new(312_751, "");
        config.ts1_static_talkgroups = vec![9];
        directory.insert_repeater(config.clone());
        manager.subscribe_repeater(&config);
        let key = ListenerKey::talkgroup(312_751, 9);
        assert!(manager.is_listening(&key));

        // unlinked behind the listener's back
        config.ts1_static_talkgroups.clear();
        directory.save_repeater(&config).unwrap();
        bus.publish("talkgroup:9", raw(&voice_packet(3_120_001, 9, 1, 1)))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_listening(&key) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener removed itself");
        assert!(manager.is_listening(&ListenerKey::repeater(312_751)));
    }

    #[tokio::test]
    async fn test_repeater_channel_rewrites_origin() {
        let (manager, bus, _) = setup();
        manager.start(ListenerKey::repeater(312_751));

        let mut outgoing = bus.subscribe(OUTGOING_CHANNEL);
        let mut private = voice_packet(3_120_001, 312_751, 312_750, 4);
        private.group_call = false;
        private.slot = true;
        bus.publish("repeater:312751", raw(&private)).unwrap();

        let forwarded = next_outgoing(&mut outgoing).await;
        assert_eq!(forwarded.repeater, 312_751);
        assert!(forwarded.slot);
        assert!(!forwarded.group_call);
    }

    #[tokio::test]
    async fn test_link_and_unlink() {
        let (manager, _, directory) = setup();
        directory.insert_repeater(RepeaterConfig::new(312_750, ""));

        let config = manager.link(312_750, LinkKind::Dynamic, true, 91).unwrap();
        assert_eq!(config.ts2_dynamic_talkgroup, Some(91));
        assert!(manager.is_listening(&ListenerKey::talkgroup(312_750, 91)));

        // replacing the dynamic link drops the old listener
        manager.link(312_750, LinkKind::Dynamic, true, 3100).unwrap();
        assert!(!manager.is_listening(&ListenerKey::talkgroup(312_750, 91)));

        manager.link(312_750, LinkKind::Static, false, 3100).unwrap();
        manager.unlink(312_750, LinkKind::Dynamic, true, 3100).unwrap();
        // still statically linked on TS1
        assert!(manager.is_listening(&ListenerKey::talkgroup(312_750, 3100)));

        manager.unlink(312_750, LinkKind::Static, false, 3100).unwrap();
        assert!(!manager.is_listening(&ListenerKey::talkgroup(312_750, 3100)));
        assert!(directory
            .get_repeater(312_750)
            .unwrap()
            .unwrap()
            .linked_talkgroups()
            .is_empty());

        assert!(matches!(
            manager.link(312_750, LinkKind::Static, false, 4242),
            Err(LinkError::UnknownTalkgroup(4242))
        ));
        assert!(matches!(
            manager.unlink(312_750, LinkKind::Static, false, 9),
            Err(LinkError::NotLinked(9))
        ));
        assert!(matches!(
            manager.link(1, LinkKind::Static, false, 9),
            Err(LinkError::UnknownRepeater(1))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_all() {
        let (manager, _, directory) = setup();
        let mut a = RepeaterConfig::new(1, "");
        a.ts1_static_talkgroups = vec![9];
        directory.insert_repeater(a);
        directory.insert_repeater(RepeaterConfig::new(2, ""));

        assert_eq!(manager.subscribe_all().unwrap(), 3);
    }
}
