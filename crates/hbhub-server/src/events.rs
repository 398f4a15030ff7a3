// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Hub events for collaborators (dashboards, loggers, admin surfaces).

use crate::models::Call;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something observable happened in the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    RepeaterConnected { radio_id: u32, callsign: String },
    RepeaterDisconnected { radio_id: u32 },
    CallStarted { call: Call },
    CallUpdated { call: Call },
    CallEnded { call: Call },
    DynamicTalkgroupChanged {
        radio_id: u32,
        slot: bool,
        talkgroup: Option<u32>,
    },
}

/// Broadcast fan-out of [`HubEvent`]s.
///
/// Emitting never blocks; with no subscribers the event is discarded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let events = EventBus::new(4);
        events.emit(HubEvent::RepeaterDisconnected { radio_id: 1 });

        let mut rx = events.subscribe();
        events.emit(HubEvent::RepeaterConnected {
            radio_id: 312_750,
            callsign: "W1AW".into(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            HubEvent::RepeaterConnected {
                radio_id: 312_750,
                callsign: "W1AW".into()
            }
        );
    }

    #[test]
    fn test_event_json_tag() {
        let json = serde_json::to_string(&HubEvent::DynamicTalkgroupChanged {
            radio_id: 1,
            slot: true,
            talkgroup: Some(91),
        })
        .unwrap();
        assert!(json.contains(r#""type":"dynamic_talkgroup_changed""#));
    }
}
