// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Publish/subscribe bus used for frame fan-out.
//!
//! Channels:
//! - `talkgroup:<id>` - group calls addressed to a talkgroup
//! - `repeater:<id>` - private calls addressed to a repeater
//! - `outgoing` - frames ready to leave the process toward a repeater
//!
//! [`MemoryBus`] is the in-process implementation: one `tokio::sync::broadcast`
//! channel per name, created lazily on first subscribe.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Outbound sink channel consumed by the UDP transport.
pub const OUTGOING_CHANNEL: &str = "outgoing";

pub fn talkgroup_channel(talkgroup_id: u32) -> String {
    format!("talkgroup:{}", talkgroup_id)
}

pub fn repeater_channel(repeater_id: u32) -> String {
    format!("repeater:{}", repeater_id)
}

/// Bus payload type.
pub type Payload = Arc<[u8]>;

/// Raw datagram as published on talkgroup and repeater channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub remote_ip: String,
    pub remote_port: u16,
}

impl RawFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Decode(e.to_string()))
    }
}

/// Publish/subscribe primitive.
pub trait PubSub: Send + Sync {
    /// Publish to a channel, returning how many subscribers received it.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BusError>;

    /// Subscribe to a channel.
    fn subscribe(&self, channel: &str) -> BusSubscription;

    /// Drop channels nobody listens to anymore, returning how many.
    fn prune(&self) -> usize {
        0
    }
}

/// A live subscription to one channel.
pub struct BusSubscription {
    channel: String,
    rx: broadcast::Receiver<Payload>,
}

impl BusSubscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Payload>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message.
    ///
    /// `BusError::Lagged` is recoverable; the next call continues with the
    /// oldest retained message.
    pub async fn recv(&mut self) -> Result<Payload, BusError> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => BusError::Lagged(n),
            broadcast::error::RecvError::Closed => BusError::Closed,
        })
    }
}

/// In-process bus backed by broadcast channels.
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Payload>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PubSub for MemoryBus {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        match self.channels.get(channel) {
            // A send error only means there are no receivers right now.
            Some(tx) => Ok(tx.send(Payload::from(payload)).unwrap_or(0)),
            None => Ok(0),
        }
    }

    fn subscribe(&self, channel: &str) -> BusSubscription {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        BusSubscription::new(channel, rx)
    }

    fn prune(&self) -> usize {
        let mut removed = 0;
        self.channels.retain(|_, tx| {
            let keep = tx.receiver_count() > 0;
            removed += usize::from(!keep);
            keep
        });
        removed
    }
}

/// Bus error types.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("subscriber lagged behind by {0} messages")]
    Lagged(u64),

    #[error("channel closed")]
    Closed,

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(talkgroup_channel(9), "talkgroup:9");
        assert_eq!(repeater_channel(312_750), "repeater:312750");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new(8);
        assert_eq!(bus.publish("talkgroup:1", vec![1]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let bus = MemoryBus::new(8);
        let mut a = bus.subscribe("talkgroup:9");
        let mut b = bus.subscribe("talkgroup:9");
        let mut other = bus.subscribe("talkgroup:10");

        assert_eq!(bus.publish("talkgroup:9", vec![1, 2, 3]).unwrap(), 2);

        assert_eq!(&*a.recv().await.unwrap(), &[1, 2, 3]);
        assert_eq!(&*b.recv().await.unwrap(), &[1, 2, 3]);
        assert!(other.rx.try_recv().is_err());
        assert_eq!(a.channel(), "talkgroup:9");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_recovers() {
        let bus = MemoryBus::new(2);
        let mut sub = bus.subscribe("repeater:1");
        for i in 0..5u8 {
            bus.publish("repeater:1", vec![i]).unwrap();
        }

        assert!(matches!(sub.recv().await, Err(BusError::Lagged(3))));
        assert_eq!(&*sub.recv().await.unwrap(), &[3]);
    }

    #[test]
    fn test_prune_unused_channels() {
        let bus = MemoryBus::new(4);
        let sub = bus.subscribe("talkgroup:1");
        let _keep = bus.subscribe("talkgroup:2");
        assert_eq!(bus.channel_count(), 2);

        drop(sub);
        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.subscriber_count("talkgroup:2"), 1);
    }

    #[test]
    fn test_prune_while_subscribing() {
        let bus = Arc::new(MemoryBus::new(4));
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        drop(bus.subscribe(&format!("talkgroup:{}", n * 10_000 + i)));
                    }
                })
            })
            .collect();

        let mut pruned = 0;
        while workers.iter().any(|w| !w.is_finished()) {
            pruned += bus.prune();
        }
        for worker in workers {
            worker.join().unwrap();
        }
        pruned += bus.prune();

        assert_eq!(pruned, 8_000);
        assert_eq!(bus.channel_count(), 0);
    }

    #[test]
    fn test_raw_frame_json() {
        let frame = RawFrame {
            data: vec![b'D', b'M', b'R', b'D'],
            remote_ip: "10.0.0.1".into(),
            remote_port: 62031,
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(RawFrame::from_bytes(&bytes).unwrap(), frame);
    }
}
