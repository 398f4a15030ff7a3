// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Repeater login handshake and keepalive handling.
//!
//! A repeater moves `Unregistered -> ChallengeSent -> WaitingConfig ->
//! Connected`. Every step after login is only accepted from the IP address
//! the login came from and only in the expected phase; anything else is
//! answered with `MSTNAK` and leaves the session untouched.

use super::presence::{ConnectionPhase, RepeaterSession};
use super::protocol::{RepeaterDetails, Reply};
use super::HubContext;
use crate::events::HubEvent;
use crate::models::RepeaterConfig;
use chrono::Utc;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Draw a login salt. A broken system RNG is unrecoverable.
fn generate_salt(rng: &SystemRandom) -> u32 {
    let mut bytes = [0u8; 4];
    if let Err(e) = rng.fill(&mut bytes) {
        error!("System random source failed: {:?}", e);
        std::process::exit(1);
    }
    u32::from_be_bytes(bytes)
}

/// First four bytes of `SHA-256(salt || password)` as a big-endian u32.
pub fn expected_challenge(salt: u32, password: &str) -> u32 {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(&salt.to_be_bytes());
    ctx.update(password.as_bytes());
    let hash = ctx.finish();
    let bytes = hash.as_ref();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn nak(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    hub.replies().reply(addr, Reply::Nak, repeater_id);
}

fn ack(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    hub.replies().reply(addr, Reply::Ack, repeater_id);
}

/// Run the validity check, answering NAK on failure.
pub(crate) fn require(
    hub: &HubContext,
    command: &str,
    repeater_id: u32,
    phase: ConnectionPhase,
    addr: SocketAddr,
) -> Option<RepeaterSession> {
    match hub.presence().check(repeater_id, phase, addr.ip()) {
        Ok(session) => Some(session),
        Err(rejection) => {
            warn!(
                "{} from repeater {} at {} rejected: {}",
                command, repeater_id, addr, rejection
            );
            nak(hub, repeater_id, addr);
            None
        }
    }
}

/// Copy the session's last ping onto the stored repeater config.
fn persist_last_ping(hub: &HubContext, session: &RepeaterSession) {
    if let Err(e) = hub
        .directory()
        .touch_last_ping(session.radio_id, session.last_ping)
    {
        error!(
            "Failed to persist last ping for repeater {}: {}",
            session.radio_id, e
        );
    }
}

/// `RPTL`: start a login.
pub fn handle_login(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    let mut session = RepeaterSession::new(repeater_id, addr);

    let known = match hub.directory().repeater_exists(repeater_id) {
        Ok(known) => known,
        Err(e) => {
            error!("Directory lookup for repeater {} failed: {}", repeater_id, e);
            return;
        }
    };

    if !known {
        warn!("Login from unknown repeater {} at {}", repeater_id, addr);
        hub.presence().store(session);
        nak(hub, repeater_id, addr);
        return;
    }

    session.salt = generate_salt(hub.rng());
    session.phase = ConnectionPhase::ChallengeSent;
    let salt = session.salt;
    hub.presence().store(session);

    if hub.verbose() {
        info!("Login from repeater {} at {}", repeater_id, addr);
    }
    hub.replies().reply(addr, Reply::Ack, salt);
}

/// `RPTK`: check the challenge response.
pub fn handle_key_response(hub: &HubContext, repeater_id: u32, challenge: u32, addr: SocketAddr) {
    let Some(session) = require(hub, "RPTK", repeater_id, ConnectionPhase::ChallengeSent, addr)
    else {
        return;
    };

    let config = match hub.directory().get_repeater(repeater_id) {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("RPTK from repeater {} missing from directory", repeater_id);
            nak(hub, repeater_id, addr);
            return;
        }
        Err(e) => {
            error!("Directory lookup for repeater {} failed: {}", repeater_id, e);
            return;
        }
    };

    if config.password.is_empty() {
        warn!("Repeater {} has no password set", repeater_id);
        nak(hub, repeater_id, addr);
        return;
    }

    if expected_challenge(session.salt, &config.password) != challenge {
        warn!("Failed password check for repeater {} at {}", repeater_id, addr);
        nak(hub, repeater_id, addr);
        return;
    }

    hub.presence()
        .set_phase(repeater_id, ConnectionPhase::WaitingConfig);
    if hub.verbose() {
        info!("Repeater {} authenticated", repeater_id);
    }
    ack(hub, repeater_id, addr);
}

/// `RPTC`: accept repeater details and finish the handshake.
pub fn handle_config(hub: &HubContext, repeater_id: u32, data: &[u8], addr: SocketAddr) {
    if require(hub, "RPTC", repeater_id, ConnectionPhase::WaitingConfig, addr).is_none() {
        return;
    }

    let details = match RepeaterDetails::parse(data, hub.callsign_pattern()) {
        Ok(details) => details,
        Err(e) => {
            warn!("Invalid config from repeater {}: {}", repeater_id, e);
            return;
        }
    };

    let now = Utc::now();
    let mut apply = |config: &mut RepeaterConfig| {
        config.apply_details(&details);
        config.connected_at = Some(now);
        config.last_ping = Some(now);
    };
    let config = match hub.directory().update_repeater(repeater_id, &mut apply) {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("RPTC from repeater {} missing from directory", repeater_id);
            return;
        }
        Err(e) => {
            error!("Failed to save repeater {}: {}", repeater_id, e);
            return;
        }
    };

    hub.presence().update(repeater_id, |s| {
        s.phase = ConnectionPhase::Connected;
        s.connected_at = now;
        s.last_ping = now;
    });
    ack(hub, repeater_id, addr);

    info!(
        "Repeater {} ({}) connected from {}",
        repeater_id, config.callsign, addr
    );
    hub.events().emit(HubEvent::RepeaterConnected {
        radio_id: repeater_id,
        callsign: config.callsign.clone(),
    });
    let started = hub.subscriptions().subscribe_repeater(&config);
    debug!("Started {} listeners for repeater {}", started, repeater_id);
}

/// `RPTPING`: keepalive.
pub fn handle_ping(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    if require(hub, "RPTPING", repeater_id, ConnectionPhase::Connected, addr).is_none() {
        return;
    }
    let Some(session) = hub.presence().ping(repeater_id) else {
        return;
    };
    persist_last_ping(hub, &session);

    if hub.verbose() {
        debug!(
            "Ping from repeater {} ({} total)",
            repeater_id, session.pings_received
        );
    }
    hub.replies().reply(addr, Reply::Pong, repeater_id);
}

/// `RPTCL`: repeater is going away.
pub fn handle_disconnect(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    if hub
        .presence()
        .check(repeater_id, ConnectionPhase::Connected, addr.ip())
        .is_ok()
    {
        nak(hub, repeater_id, addr);
    }

    if hub.presence().delete(repeater_id).is_none() {
        debug!("Disconnect from repeater {} without a session", repeater_id);
        return;
    }

    let cancelled = hub.subscriptions().cancel_all(repeater_id);
    info!(
        "Repeater {} disconnected ({} listeners cancelled)",
        repeater_id, cancelled
    );
    hub.events().emit(HubEvent::RepeaterDisconnected {
        radio_id: repeater_id,
    });
}

/// `RPTO`: repeater options. Logged, otherwise ignored.
pub fn handle_options(hub: &HubContext, repeater_id: u32, options: &str, addr: SocketAddr) {
    if require(hub, "RPTO", repeater_id, ConnectionPhase::Connected, addr).is_none() {
        return;
    }
    hub.presence().refresh(repeater_id);
    info!("Options from repeater {}: {}", repeater_id, options);
    ack(hub, repeater_id, addr);
}

/// `DMRA`: talker alias. Only counts as a sign of life.
pub fn handle_talk_alias(hub: &HubContext, repeater_id: u32, addr: SocketAddr) {
    if require(hub, "DMRA", repeater_id, ConnectionPhase::Connected, addr).is_none() {
        return;
    }
    if let Some(session) = hub.presence().ping(repeater_id) {
        persist_last_ping(hub, &session);
    }
}
