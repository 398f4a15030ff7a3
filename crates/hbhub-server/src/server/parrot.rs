// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Parrot (echo test) service on private/group ID 9990.
//!
//! A stream addressed to the parrot is recorded with source and destination
//! swapped, then replayed to the originating repeater once the voice
//! terminator arrives and a short settle delay has passed. Replay keeps
//! 60 ms between frames so the repeater does not drop them.

use super::calls::CallTracker;
use super::packet::Packet;
use crate::bus::{PubSub, OUTGOING_CHANNEL};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Destination ID of the parrot.
pub const PARROT_ID: u32 = 9990;

#[derive(Debug)]
struct Marker {
    repeater_id: u32,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Recording {
    packets: Vec<Packet>,
    expires_at: Option<Instant>,
}

/// Recorded parrot streams with a sliding TTL.
#[derive(Debug)]
pub struct ParrotStore {
    ttl: Duration,
    markers: DashMap<u32, Marker>,
    recordings: DashMap<u32, Recording>,
}

impl ParrotStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            markers: DashMap::new(),
            recordings: DashMap::new(),
        }
    }

    /// Whether `stream_id` is currently being recorded.
    pub fn is_started(&self, stream_id: u32) -> bool {
        let now = Instant::now();
        self.markers
            .get(&stream_id)
            .map(|m| m.expires_at > now)
            .unwrap_or(false)
    }

    /// Mark a stream as recording for `repeater_id`.
    ///
    /// Fails if the stream already has a live marker.
    pub fn start_stream(&self, stream_id: u32, repeater_id: u32) -> bool {
        let now = Instant::now();
        let marker = Marker {
            repeater_id,
            expires_at: now + self.ttl,
        };

        match self.markers.entry(stream_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    warn!("Parrot stream {:#010x} already started", stream_id);
                    return false;
                }
                occupied.insert(marker);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
            }
        }
        true
    }

    /// Append a frame, rewritten to travel back to its origin.
    ///
    /// Returns `false` if the stream has no marker.
    pub fn record_packet(&self, stream_id: u32, packet: &Packet) -> bool {
        let now = Instant::now();
        let repeater_id = match self.markers.get_mut(&stream_id) {
            Some(mut marker) if marker.expires_at > now => {
                marker.expires_at = now + self.ttl;
                marker.repeater_id
            }
            _ => {
                error!("No parrot marker for stream {:#010x}", stream_id);
                return false;
            }
        };

        let mut echo = packet.clone();
        echo.repeater = repeater_id;
        std::mem::swap(&mut echo.src, &mut echo.dst);
        echo.group_call = false;
        echo.ber = -1.0;
        echo.rssi = -1.0;

        let mut recording = self.recordings.entry(stream_id).or_default();
        recording.packets.push(echo);
        recording.expires_at = Some(now + self.ttl);
        true
    }

    /// Stop recording. The buffer stays until taken or expired.
    pub fn stop_stream(&self, stream_id: u32) -> Option<u32> {
        self.markers.remove(&stream_id).map(|(_, m)| m.repeater_id)
    }

    /// Remove and return the recorded frames.
    pub fn take_stream(&self, stream_id: u32) -> Vec<Packet> {
        self.recordings
            .remove(&stream_id)
            .map(|(_, r)| r.packets)
            .unwrap_or_default()
    }

    /// Purge markers and recordings past their TTL.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.markers.retain(|_, m| {
            let keep = m.expires_at > now;
            removed += usize::from(!keep);
            keep
        });
        self.recordings.retain(|_, r| {
            let keep = r.expires_at.map(|t| t > now).unwrap_or(false);
            removed += usize::from(!keep);
            keep
        });
        removed
    }
}

/// Replay timing.
#[derive(Debug, Clone, Copy)]
pub struct ReplayPacing {
    /// Pause after the terminator before the first echoed frame
    pub settle_delay: Duration,
    /// Target spacing between echoed frames
    pub frame_interval: Duration,
}

impl Default for ReplayPacing {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            frame_interval: Duration::from_millis(60),
        }
    }
}

/// Replay counters.
#[derive(Debug, Default)]
pub struct ParrotStats {
    pub streams_replayed: AtomicU64,
    pub frames_replayed: AtomicU64,
    /// Iterations whose work exceeded the frame interval.
    pub overruns: AtomicU64,
}

/// Records parrot streams and plays them back.
pub struct Parrot {
    store: ParrotStore,
    pacing: ReplayPacing,
    bus: Arc<dyn PubSub>,
    calls: Arc<CallTracker>,
    stats: ParrotStats,
}

impl Parrot {
    pub fn new(
        ttl: Duration,
        pacing: ReplayPacing,
        bus: Arc<dyn PubSub>,
        calls: Arc<CallTracker>,
    ) -> Self {
        Self {
            store: ParrotStore::new(ttl),
            pacing,
            bus,
            calls,
            stats: ParrotStats::default(),
        }
    }

    pub fn store(&self) -> &ParrotStore {
        &self.store
    }

    pub fn stats(&self) -> &ParrotStats {
        &self.stats
    }

    /// Record one voice frame addressed to the parrot.
    ///
    /// On the voice terminator the stream is closed and replay is spawned;
    /// the handle is returned so callers may wait for it.
    pub fn handle(
        self: &Arc<Self>,
        packet: &Packet,
        repeater_id: u32,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.store.is_started(packet.stream_id) {
            info!(
                "Parrot call from {} on repeater {}",
                packet.src, repeater_id
            );
            self.store.start_stream(packet.stream_id, repeater_id);
        }
        self.store.record_packet(packet.stream_id, packet);

        if !packet.is_voice_terminator() {
            return None;
        }

        self.store.stop_stream(packet.stream_id);
        let packets = self.store.take_stream(packet.stream_id);
        let parrot = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::time::sleep(parrot.pacing.settle_delay).await;
            parrot.replay(packets).await;
        }))
    }

    /// Send recorded frames back to their repeater, one per frame interval.
    ///
    /// Each deadline is measured from the start of its own iteration: an
    /// iteration that runs long is logged and followed immediately by the
    /// next one, without catching up on lost time.
    pub async fn replay(&self, packets: Vec<Packet>) {
        let Some(last) = packets.len().checked_sub(1) else {
            return;
        };
        let interval = self.pacing.frame_interval;
        debug!(
            "Replaying {} parrot frames to repeater {}",
            packets.len(),
            packets[0].repeater
        );

        for (i, packet) in packets.iter().enumerate() {
            let started = Instant::now();

            if let Err(e) = self.bus.publish(OUTGOING_CHANNEL, packet.encode()) {
                error!("Failed to publish parrot frame: {}", e);
            }
            self.stats.frames_replayed.fetch_add(1, Ordering::Relaxed);

            if i == 0 {
                self.calls.start_call(packet);
            }
            self.calls.process_call_packet(packet);
            if i == last {
                self.calls.end_call(packet);
                break;
            }

            let elapsed = started.elapsed();
            if elapsed > interval {
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
                warn!("Parrot frame took {:?}, over the {:?} budget", elapsed, interval);
            } else {
                tokio::time::sleep(interval - elapsed).await;
            }
        }

        self.stats.streams_replayed.fetch_add(1, Ordering::Relaxed);
    }
}
