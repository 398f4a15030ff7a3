// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Per-stream voice call statistics.
//!
//! One aggregate per active (stream, source, destination, slot, call type)
//! tuple. Every step is persisted through the [`CallSink`] and announced as
//! a [`HubEvent`].
//!
//! [`CallSink`]: crate::directory::CallSink

use super::packet::{FrameType, Packet, DMR_PAYLOAD_LEN};
use crate::directory::Directory;
use crate::events::{EventBus, HubEvent};
use crate::models::{Call, CallDestination, CallKey};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Nominal spacing of voice bursts.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(60);

/// Voice bursts A-F of a superframe carry sequence numbers 0-5.
const SUPERFRAME_LEN: u8 = 6;

#[derive(Debug)]
struct ActiveCall {
    call: Call,
    last_arrival: Option<Instant>,
    ber_samples: u32,
    rssi_samples: u32,
}

/// Tracks active calls.
pub struct CallTracker {
    directory: Arc<dyn Directory>,
    events: EventBus,
    active: DashMap<CallKey, ActiveCall>,
    next_id: AtomicU64,
}

impl CallTracker {
    pub fn new(directory: Arc<dyn Directory>, events: EventBus) -> Self {
        Self {
            directory,
            events,
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_call_active(&self, key: &CallKey) -> bool {
        if self.active.contains_key(key) {
            return true;
        }
        match self.directory.find_active_call(key) {
            Ok(found) => found.is_some(),
            Err(e) => {
                error!("Active call lookup failed: {}", e);
                false
            }
        }
    }

    /// Open a call for `packet` unless one is already active.
    ///
    /// Returns `true` if a new call was created.
    pub fn start_call(&self, packet: &Packet) -> bool {
        let key = CallKey::of(packet);

        let call = match self.active.entry(key) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                let resumed = match self.directory.find_active_call(&key) {
                    Ok(found) => found,
                    Err(e) => {
                        error!("Active call lookup failed: {}", e);
                        None
                    }
                };
                if let Some(call) = resumed {
                    vacant.insert(ActiveCall::resume(call));
                    return false;
                }

                let call = self.new_call(packet);
                vacant.insert(ActiveCall::resume(call.clone()));
                call
            }
        };

        debug!(
            "Call {} started: {} -> {} ({:?}) TS{} stream {:#010x}",
            call.id,
            call.user_id,
            call.destination_id,
            call.destination,
            packet.slot_number(),
            call.stream_id
        );
        self.persist(&call);
        self.events.emit(HubEvent::CallStarted { call });
        true
    }

    /// Fold one voice frame into its call.
    pub fn process_call_packet(&self, packet: &Packet) {
        self.process_call_packet_at(packet, Instant::now());
    }

    fn process_call_packet_at(&self, packet: &Packet, now: Instant) {
        let key = CallKey::of(packet);
        let call = {
            let Some(mut active) = self.active.get_mut(&key) else {
                warn!(
                    "Frame for unknown call: stream {:#010x} from {}",
                    packet.stream_id, packet.src
                );
                return;
            };
            active.update(packet, now);
            active.call.clone()
        };

        self.persist(&call);
        self.events.emit(HubEvent::CallUpdated { call });
    }

    /// Close the call for `packet`.
    pub fn end_call(&self, packet: &Packet) {
        let key = CallKey::of(packet);
        let Some((_, mut active)) = self.active.remove(&key) else {
            debug!("End of unknown call: stream {:#010x}", packet.stream_id);
            return;
        };

        let call = &mut active.call;
        call.active = false;
        call.duration = elapsed_since(call);
        debug!(
            "Call {} ended after {:?}: {} packets, loss {:.1}%, jitter {:.1} ms",
            call.id,
            call.duration,
            call.total_packets,
            call.loss * 100.0,
            call.jitter
        );

        self.persist(call);
        self.events.emit(HubEvent::CallEnded {
            call: active.call,
        });
    }

    /// Start, update and end a call as one frame passes through.
    pub fn track(&self, packet: &Packet) {
        self.start_call(packet);
        self.process_call_packet(packet);
        if packet.is_voice_terminator() {
            self.end_call(packet);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn new_call(&self, packet: &Packet) -> Call {
        let destination = if packet.group_call {
            CallDestination::Talkgroup
        } else {
            match self.directory.user_exists(packet.dst) {
                Ok(true) => CallDestination::User,
                Ok(false) => CallDestination::Repeater,
                Err(e) => {
                    error!("User lookup failed: {}", e);
                    CallDestination::Repeater
                }
            }
        };

        Call {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream_id: packet.stream_id,
            start_time: Utc::now(),
            duration: Duration::ZERO,
            active: true,
            user_id: packet.src,
            repeater_id: packet.repeater,
            time_slot: packet.slot,
            group_call: packet.group_call,
            destination,
            destination_id: packet.dst,
            total_packets: 0,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            ber: 0.0,
            rssi: 0.0,
            total_bits: 0,
            last_frame_num: None,
            last_packet_time: None,
            has_header: false,
            has_term: false,
        }
    }

    fn persist(&self, call: &Call) {
        if let Err(e) = self.directory.save_call(call) {
            error!("Failed to save call {}: {}", call.id, e);
        }
    }
}

impl ActiveCall {
    fn resume(call: Call) -> Self {
        Self {
            call,
            last_arrival: None,
            ber_samples: 0,
            rssi_samples: 0,
        }
    }

    fn update(&mut self, packet: &Packet, now: Instant) {
        let call = &mut self.call;
        call.total_packets += 1;
        call.total_bits += (DMR_PAYLOAD_LEN * 8) as u64;

        if matches!(packet.frame_type, FrameType::Voice | FrameType::VoiceSync) {
            let vseq = packet.dtype_vseq % SUPERFRAME_LEN;
            if let Some(last) = call.last_frame_num {
                let expected = (last + 1) % SUPERFRAME_LEN;
                let gap = (vseq + SUPERFRAME_LEN - expected) % SUPERFRAME_LEN;
                call.lost_sequences += u32::from(gap);
            }
            call.last_frame_num = Some(vseq);
        }
        let expected_frames = call.total_packets + call.lost_sequences;
        call.loss = call.lost_sequences as f32 / expected_frames as f32;

        if let Some(previous) = self.last_arrival {
            let interval_ms = now.duration_since(previous).as_secs_f32() * 1000.0;
            let deviation = (interval_ms - FRAME_INTERVAL.as_secs_f32() * 1000.0).abs();
            let intervals = call.total_packets.saturating_sub(1).max(1) as f32;
            call.jitter += (deviation - call.jitter) / intervals;
        }
        self.last_arrival = Some(now);

        if packet.ber >= 0.0 {
            self.ber_samples += 1;
            call.ber += (packet.ber - call.ber) / self.ber_samples as f32;
        }
        if packet.rssi >= 0.0 {
            self.rssi_samples += 1;
            call.rssi += (packet.rssi - call.rssi) / self.rssi_samples as f32;
        }

        call.has_header |= packet.is_voice_header();
        call.has_term |= packet.is_voice_terminator();
        call.last_packet_time = Some(Utc::now());
        call.duration = elapsed_since(call);
    }
}

fn elapsed_since(call: &Call) -> Duration {
    (Utc::now() - call.start_time).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::models::User;
    use crate::server::packet::tests::voice_packet;
    use crate::server::packet::DTYPE_VOICE_TERMINATOR;

    fn tracker() -> (CallTracker, Arc<MemoryDirectory>, EventBus) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_user(User {
            id: 3_120_002,
            callsign: "KC1ABC".into(),
            username: "kc1abc".into(),
        });
        let events = EventBus::new(64);
        let tracker = CallTracker::new(directory.clone(), events.clone());
        (tracker, directory, events)
    }

    #[tokio::test]
    async fn test_start_call_idempotent() {
        let (tracker, directory, _) = tracker();
        let packet = voice_packet(3_120_001, 9, 312_750, 77);

        assert!(tracker.start_call(&packet));
        assert!(!tracker.start_call(&packet));
        assert!(tracker.is_call_active(&CallKey::of(&packet)));
        assert_eq!(directory.active_calls().len(), 1);
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_creates_one_call() {
        let (tracker, directory, _) = tracker();
        let tracker = Arc::new(tracker);
        let packet = voice_packet(3_120_001, 9, 312_750, 78);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let packet = packet.clone();
                tokio::spawn(async move { tracker.start_call(&packet) })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(directory.active_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_destination_classification() {
        let (tracker, directory, _) = tracker();

        tracker.start_call(&voice_packet(3_120_001, 9, 1, 1));

        let mut private_user = voice_packet(3_120_001, 3_120_002, 1, 2);
        private_user.group_call = false;
        tracker.start_call(&private_user);

        let mut private_repeater = voice_packet(3_120_001, 312_751, 1, 3);
        private_repeater.group_call = false;
        tracker.start_call(&private_repeater);

        let kinds: Vec<CallDestination> =
            directory.calls().iter().map(|c| c.destination).collect();
        assert_eq!(
            kinds,
            vec![
                CallDestination::Talkgroup,
                CallDestination::User,
                CallDestination::Repeater
            ]
        );
    }

    #[tokio::test]
    async fn test_loss_from_sequence_gap() {
        let (tracker, directory, _) = tracker();
        let mut packet = voice_packet(3_120_001, 9, 1, 5);
        tracker.start_call(&packet);

        // 0, 1, 4: bursts 2 and 3 missing
        for vseq in [0u8, 1, 4] {
            packet.dtype_vseq = vseq;
            tracker.process_call_packet(&packet);
        }

        let call = &directory.calls()[0];
        assert_eq!(call.total_packets, 3);
        assert_eq!(call.lost_sequences, 2);
        assert!((call.loss - 0.4).abs() < 1e-6);
        assert_eq!(call.last_frame_num, Some(4));
        assert_eq!(call.total_bits, 3 * 264);
    }

    #[tokio::test]
    async fn test_jitter_mean_deviation() {
        let (tracker, directory, _) = tracker();
        let mut packet = voice_packet(3_120_001, 9, 1, 6);
        tracker.start_call(&packet);

        let t0 = Instant::now();
        // intervals 60 ms and 80 ms: deviations 0 and 20
        for (vseq, offset) in [(0u8, 0u64), (1, 60), (2, 140)] {
            packet.dtype_vseq = vseq;
            tracker.process_call_packet_at(&packet, t0 + Duration::from_millis(offset));
        }

        let call = &directory.calls()[0];
        assert!((call.jitter - 10.0).abs() < 0.01, "jitter {}", call.jitter);
    }

    #[tokio::test]
    async fn test_metrics_ignore_unknown() {
        let (tracker, directory, _) = tracker();
        let mut packet = voice_packet(3_120_001, 9, 1, 7);
        tracker.start_call(&packet);

        for (ber, rssi) in [(2.0, 80.0), (-1.0, -1.0), (4.0, 90.0)] {
            packet.ber = ber;
            packet.rssi = rssi;
            tracker.process_call_packet(&packet);
        }

        let call = &directory.calls()[0];
        assert!((call.ber - 3.0).abs() < 1e-6);
        assert!((call.rssi - 85.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_terminator_ends_call() {
        let (tracker, directory, events) = tracker();
        let mut rx = events.subscribe();
        let mut packet = voice_packet(3_120_001, 9, 1, 8);

        tracker.track(&packet);
        packet.frame_type = FrameType::DataSync;
        packet.dtype_vseq = DTYPE_VOICE_TERMINATOR;
        tracker.track(&packet);

        assert!(!tracker.is_call_active(&CallKey::of(&packet)));
        let call = &directory.calls()[0];
        assert!(!call.active);
        assert!(call.has_term);
        assert_eq!(call.total_packets, 2);

        assert!(matches!(rx.recv().await.unwrap(), HubEvent::CallStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::CallUpdated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::CallUpdated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::CallEnded { .. }));
    }

    #[tokio::test]
    async fn test_frame_for_unknown_call_ignored() {
        let (tracker, directory, _) = tracker();
        tracker.process_call_packet(&voice_packet(1, 9, 1, 99));
        tracker.end_call(&voice_packet(1, 9, 1, 99));
        assert!(directory.calls().is_empty());
    }
}
