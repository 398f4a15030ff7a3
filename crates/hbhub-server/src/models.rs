// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Persistent records shared with the directory collaborators.

use crate::server::packet::Packet;
use crate::server::protocol::RepeaterDetails;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Stored configuration of a repeater or hotspot.
///
/// Timeslots are `false` for TS1 and `true` for TS2, matching the wire bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterConfig {
    pub radio_id: u32,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub rx_frequency: u32,
    #[serde(default)]
    pub tx_frequency: u32,
    #[serde(default)]
    pub tx_power: u32,
    #[serde(default)]
    pub color_code: u8,
    #[serde(default)]
    pub latitude: f32,
    #[serde(default)]
    pub longitude: f32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub slots: u8,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub software_id: String,
    #[serde(default)]
    pub package_id: String,

    /// Shared secret for the login challenge.
    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub ts1_static_talkgroups: Vec<u32>,
    #[serde(default)]
    pub ts2_static_talkgroups: Vec<u32>,
    #[serde(default)]
    pub ts1_dynamic_talkgroup: Option<u32>,
    #[serde(default)]
    pub ts2_dynamic_talkgroup: Option<u32>,

    #[serde(default)]
    pub owner_id: u32,
    #[serde(default)]
    pub hotspot: bool,

    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_ping: Option<DateTime<Utc>>,
}

impl RepeaterConfig {
    pub fn new(radio_id: u32, password: impl Into<String>) -> Self {
        Self {
            radio_id,
            callsign: String::new(),
            rx_frequency: 0,
            tx_frequency: 0,
            tx_power: 0,
            color_code: 0,
            latitude: 0.0,
            longitude: 0.0,
            height: 0,
            location: String::new(),
            description: String::new(),
            slots: 0,
            url: String::new(),
            software_id: String::new(),
            package_id: String::new(),
            password: password.into(),
            ts1_static_talkgroups: Vec::new(),
            ts2_static_talkgroups: Vec::new(),
            ts1_dynamic_talkgroup: None,
            ts2_dynamic_talkgroup: None,
            owner_id: 0,
            hotspot: false,
            connected_at: None,
            last_ping: None,
        }
    }

    /// Overwrite station details from a configuration frame.
    ///
    /// Password, talkgroup links and ownership are left untouched.
    pub fn apply_details(&mut self, details: &RepeaterDetails) {
        self.callsign = details.callsign.clone();
        self.rx_frequency = details.rx_frequency;
        self.tx_frequency = details.tx_frequency;
        self.tx_power = details.tx_power;
        self.color_code = details.color_code;
        self.latitude = details.latitude;
        self.longitude = details.longitude;
        self.height = details.height;
        self.location = details.location.clone();
        self.description = details.description.clone();
        self.slots = details.slots;
        self.url = details.url.clone();
        self.software_id = details.software_id.clone();
        self.package_id = details.package_id.clone();
    }

    pub fn static_talkgroups(&self, slot: bool) -> &[u32] {
        if slot {
            &self.ts2_static_talkgroups
        } else {
            &self.ts1_static_talkgroups
        }
    }

    pub fn static_talkgroups_mut(&mut self, slot: bool) -> &mut Vec<u32> {
        if slot {
            &mut self.ts2_static_talkgroups
        } else {
            &mut self.ts1_static_talkgroups
        }
    }

    pub fn dynamic_talkgroup(&self, slot: bool) -> Option<u32> {
        if slot {
            self.ts2_dynamic_talkgroup
        } else {
            self.ts1_dynamic_talkgroup
        }
    }

    pub fn set_dynamic_talkgroup(&mut self, slot: bool, talkgroup: Option<u32>) {
        if slot {
            self.ts2_dynamic_talkgroup = talkgroup;
        } else {
            self.ts1_dynamic_talkgroup = talkgroup;
        }
    }

    /// Whether any slot links `talkgroup`, statically or dynamically.
    pub fn links_talkgroup(&self, talkgroup: u32) -> bool {
        self.ts1_dynamic_talkgroup == Some(talkgroup)
            || self.ts2_dynamic_talkgroup == Some(talkgroup)
            || self.ts1_static_talkgroups.contains(&talkgroup)
            || self.ts2_static_talkgroups.contains(&talkgroup)
    }

    /// Every talkgroup linked on either slot.
    pub fn linked_talkgroups(&self) -> BTreeSet<u32> {
        self.ts1_static_talkgroups
            .iter()
            .chain(self.ts2_static_talkgroups.iter())
            .copied()
            .chain(self.ts1_dynamic_talkgroup)
            .chain(self.ts2_dynamic_talkgroup)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Talkgroup {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A registered subscriber. Owned repeaters are found through
/// [`RepeaterConfig::owner_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub username: String,
}

/// What a call was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDestination {
    Talkgroup,
    User,
    Repeater,
}

/// Identity of an active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub stream_id: u32,
    pub src: u32,
    pub dst: u32,
    pub slot: bool,
    pub group_call: bool,
}

impl CallKey {
    pub fn of(packet: &Packet) -> Self {
        Self {
            stream_id: packet.stream_id,
            src: packet.src,
            dst: packet.dst,
            slot: packet.slot,
            group_call: packet.group_call,
        }
    }
}

/// Aggregate statistics of one voice call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub stream_id: u32,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub active: bool,
    pub user_id: u32,
    pub repeater_id: u32,
    pub time_slot: bool,
    pub group_call: bool,
    pub destination: CallDestination,
    pub destination_id: u32,
    pub total_packets: u32,
    pub lost_sequences: u32,
    pub loss: f32,
    pub jitter: f32,
    pub ber: f32,
    pub rssi: f32,
    pub total_bits: u64,
    pub last_frame_num: Option<u8>,
    pub last_packet_time: Option<DateTime<Utc>>,
    pub has_header: bool,
    pub has_term: bool,
}

impl Call {
    pub fn key(&self) -> CallKey {
        CallKey {
            stream_id: self.stream_id,
            src: self.user_id,
            dst: self.destination_id,
            slot: self.time_slot,
            group_call: self.group_call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::protocol::tests::sample_details;

    #[test]
    fn test_apply_details_keeps_links() {
        let mut config = RepeaterConfig::new(312_750, "secret");
        config.ts1_static_talkgroups = vec![9];
        config.owner_id = 3_120_001;

        config.apply_details(&sample_details("W1AW"));

        assert_eq!(config.callsign, "W1AW");
        assert_eq!(config.color_code, 7);
        assert_eq!(config.password, "secret");
        assert_eq!(config.ts1_static_talkgroups, vec![9]);
        assert_eq!(config.owner_id, 3_120_001);
    }

    #[test]
    fn test_slot_accessors() {
        let mut config = RepeaterConfig::new(1, "");
        config.set_dynamic_talkgroup(true, Some(91));
        config.static_talkgroups_mut(false).push(3100);

        assert_eq!(config.dynamic_talkgroup(true), Some(91));
        assert_eq!(config.dynamic_talkgroup(false), None);
        assert_eq!(config.static_talkgroups(false), &[3100]);
        assert!(config.links_talkgroup(91));
        assert!(!config.links_talkgroup(9));
        assert_eq!(
            config.linked_talkgroups().into_iter().collect::<Vec<_>>(),
            vec![91, 3100]
        );
    }

    #[test]
    fn test_seed_json_defaults() {
        let config: RepeaterConfig =
            serde_json::from_str(r#"{"radio_id": 312750, "password": "secret"}"#).unwrap();
        assert_eq!(config, RepeaterConfig::new(312_750, "secret"));
    }
}
