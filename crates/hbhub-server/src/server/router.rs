// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! DMRD routing.
//!
//! Decides where a data frame from a connected repeater goes: the parrot,
//! a talkgroup channel, one or more repeater channels, or nowhere. Group
//! calls also pull the talkgroup onto the sending slot as its dynamic
//! talkgroup.

use super::auth::require;
use super::packet::Packet;
use super::presence::ConnectionPhase;
use super::subscription::ListenerKey;
use super::HubContext;
use crate::bus::{repeater_channel, talkgroup_channel, RawFrame};
use crate::events::HubEvent;
use crate::models::RepeaterConfig;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Loop-back test talkgroup.
pub use super::parrot::PARROT_ID;

/// Private call to this ID clears the slot's dynamic talkgroup.
pub const UNLINK_ID: u32 = 4000;

/// Lowest subscriber radio ID.
pub const SUBSCRIBER_ID_MIN: u32 = 1_000_000;
/// Highest subscriber radio ID.
pub const SUBSCRIBER_ID_MAX: u32 = 9_999_999;
/// Highest destination still treated as addressable.
pub const DESTINATION_ID_MAX: u32 = 99_999_999;

/// Outcome of routing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Not forwarded anywhere.
    Dropped,
    /// Recorded for loop-back.
    Parrot,
    /// Slot's dynamic talkgroup cleared.
    Unlinked { slot: bool, talkgroup: Option<u32> },
    /// Published on a talkgroup channel.
    Talkgroup(u32),
    /// Published on a repeater channel.
    Repeater(u32),
    /// Published on the channels of a subscriber's live repeaters.
    Subscriber { user_id: u32, repeaters: Vec<u32> },
    /// Non-voice data, not forwarded.
    Data,
}

/// Validate and route one `DMRD` datagram.
pub async fn handle_data(
    hub: &Arc<HubContext>,
    packet: Packet,
    data: Vec<u8>,
    addr: SocketAddr,
) -> Option<Route> {
    let repeater_id = packet.repeater;
    require(hub, "DMRD", repeater_id, ConnectionPhase::Connected, addr)?;
    hub.presence().refresh(repeater_id);

    let config = match hub.directory().touch_last_ping(repeater_id, Utc::now()) {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("DMRD from repeater {} missing from directory", repeater_id);
            return None;
        }
        Err(e) => {
            error!("Failed to persist last ping for repeater {}: {}", repeater_id, e);
            return None;
        }
    };

    let frame = RawFrame {
        data,
        remote_ip: addr.ip().to_string(),
        remote_port: addr.port(),
    };
    Some(route_packet(hub, &config, &packet, &frame).await)
}

/// Route a validated frame from the repeater described by `config`.
pub async fn route_packet(
    hub: &Arc<HubContext>,
    config: &RepeaterConfig,
    packet: &Packet,
    frame: &RawFrame,
) -> Route {
    if packet.dst == 0 {
        debug!("Dropping frame with destination 0 from {}", config.radio_id);
        return Route::Dropped;
    }

    if !packet.is_voice() {
        warn!(
            "Unhandled data packet from {} to {} on repeater {}",
            packet.src, packet.dst, config.radio_id
        );
        return Route::Data;
    }

    if packet.dst == PARROT_ID {
        // The replay task is detached; it ends after the last echoed frame.
        if hub.parrot().handle(packet, config.radio_id).is_some() {
            debug!("Parrot replay scheduled for stream {:#010x}", packet.stream_id);
        }
        return Route::Parrot;
    }

    if packet.dst == UNLINK_ID {
        return unlink_dynamic_talkgroup(hub, config.radio_id, packet.slot);
    }

    let route = if packet.group_call {
        let reconcile = {
            let hub = Arc::clone(hub);
            let (repeater_id, slot, talkgroup) = (config.radio_id, packet.slot, packet.dst);
            tokio::spawn(async move {
                reconcile_dynamic_talkgroup(&hub, repeater_id, slot, talkgroup);
            })
        };
        publish(hub, &talkgroup_channel(packet.dst), frame);
        if let Err(e) = reconcile.await {
            error!("Dynamic talkgroup reconciliation failed: {}", e);
        }
        Route::Talkgroup(packet.dst)
    } else {
        route_private(hub, packet, frame)
    };

    if route != Route::Dropped {
        hub.calls().track(packet);
    }
    route
}

fn route_private(hub: &HubContext, packet: &Packet, frame: &RawFrame) -> Route {
    let dst = packet.dst;
    if !(SUBSCRIBER_ID_MIN..=DESTINATION_ID_MAX).contains(&dst) {
        publish(hub, &repeater_channel(dst), frame);
        return Route::Repeater(dst);
    }

    if dst > SUBSCRIBER_ID_MAX {
        debug!("Dropping private call to unroutable ID {}", dst);
        return Route::Dropped;
    }

    let owned = match hub.directory().owned_repeaters(dst) {
        Ok(owned) => owned,
        Err(e) => {
            error!("Repeater lookup for subscriber {} failed: {}", dst, e);
            return Route::Dropped;
        }
    };
    let repeaters: Vec<u32> = owned
        .into_iter()
        .filter(|id| hub.presence().exists(*id))
        .collect();
    for id in &repeaters {
        publish(hub, &repeater_channel(*id), frame);
    }
    Route::Subscriber {
        user_id: dst,
        repeaters,
    }
}

fn publish(hub: &HubContext, channel: &str, frame: &RawFrame) {
    let payload = match frame.to_bytes() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode frame for {}: {}", channel, e);
            return;
        }
    };
    match hub.bus().publish(channel, payload) {
        Ok(n) => debug!("Published on {} to {} listeners", channel, n),
        Err(e) => error!("Publish on {} failed: {}", channel, e),
    }
}

/// Clear the dynamic talkgroup of one slot.
fn unlink_dynamic_talkgroup(hub: &HubContext, repeater_id: u32, slot: bool) -> Route {
    let update = match hub.directory().set_dynamic_talkgroup(repeater_id, slot, None) {
        Ok(Some(update)) => update,
        Ok(None) => return Route::Dropped,
        Err(e) => {
            error!("Failed to clear dynamic talkgroup of {}: {}", repeater_id, e);
            return Route::Dropped;
        }
    };

    let previous = update.previous;
    if let Some(talkgroup) = previous {
        hub.subscriptions().release(&update.config, talkgroup);
    }

    info!(
        "Repeater {} TS{} dynamic talkgroup cleared (was {:?})",
        repeater_id,
        u8::from(slot) + 1,
        previous
    );
    hub.events().emit(HubEvent::DynamicTalkgroupChanged {
        radio_id: repeater_id,
        slot,
        talkgroup: None,
    });
    Route::Unlinked {
        slot,
        talkgroup: previous,
    }
}

/// Make `talkgroup` the dynamic talkgroup of `slot` if it is a known
/// talkgroup and not already set. Returns whether anything changed.
///
/// Only the addressed slot is written, in one directory update, so traffic
/// on the other slot never loses its mapping.
pub fn reconcile_dynamic_talkgroup(
    hub: &HubContext,
    repeater_id: u32,
    slot: bool,
    talkgroup: u32,
) -> bool {
    match hub.directory().talkgroup_exists(talkgroup) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            error!("Talkgroup lookup for {} failed: {}", talkgroup, e);
            return false;
        }
    }

    let update = match hub
        .directory()
        .set_dynamic_talkgroup(repeater_id, slot, Some(talkgroup))
    {
        Ok(Some(update)) => update,
        Ok(None) => return false,
        Err(e) => {
            error!("Failed to set dynamic talkgroup of {}: {}", repeater_id, e);
            return false;
        }
    };
    if update.previous == Some(talkgroup) {
        return false;
    }

    hub.subscriptions()
        .start(ListenerKey::talkgroup(repeater_id, talkgroup));

    info!(
        "Repeater {} TS{} dynamic talkgroup set to {}",
        repeater_id,
        u8::from(slot) + 1,
        talkgroup
    );
    hub.events().emit(HubEvent::DynamicTalkgroupChanged {
        radio_id: repeater_id,
        slot,
        talkgroup: Some(talkgroup),
    });
    true
}
