// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Ephemeral per-repeater session state with a sliding TTL.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Where a repeater is in the login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Unregistered,
    ChallengeSent,
    WaitingConfig,
    Connected,
}

/// Live session of one repeater.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeaterSession {
    /// Repeater radio ID
    pub radio_id: u32,

    /// Address the handshake came from
    pub addr: SocketAddr,

    /// Handshake phase
    pub phase: ConnectionPhase,

    /// Login challenge
    pub salt: u32,

    pub connected_at: DateTime<Utc>,

    pub last_ping: DateTime<Utc>,

    pub pings_received: u64,
}

impl RepeaterSession {
    /// Create an unregistered session bound to `addr`.
    pub fn new(radio_id: u32, addr: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            radio_id,
            addr,
            phase: ConnectionPhase::Unregistered,
            salt: 0,
            connected_at: now,
            last_ping: now,
            pings_received: 0,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }
}

/// Why a frame was refused for a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionRejection {
    #[error("no session")]
    Missing,

    #[error("phase {actual:?}, expected {expected:?}")]
    WrongPhase {
        expected: ConnectionPhase,
        actual: ConnectionPhase,
    },

    #[error("address {actual} does not match session address {expected}")]
    AddressMismatch { expected: IpAddr, actual: IpAddr },
}

#[derive(Debug)]
struct Entry {
    session: RepeaterSession,
    expires_at: Instant,
}

/// Sessions keyed by radio ID.
///
/// Reads of an expired entry behave as if it were absent. Updates are a
/// plain read-modify-write without locking across the two halves: two
/// concurrent updates of the same repeater may lose one of the writes.
#[derive(Debug)]
pub struct PresenceStore {
    sessions: DashMap<u32, Entry>,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a session, restarting its TTL.
    pub fn store(&self, session: RepeaterSession) {
        let entry = Entry {
            session,
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.insert(entry.session.radio_id, entry);
    }

    pub fn get(&self, radio_id: u32) -> Option<RepeaterSession> {
        let now = Instant::now();
        self.sessions
            .get(&radio_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.session.clone())
    }

    pub fn exists(&self, radio_id: u32) -> bool {
        self.get(radio_id).is_some()
    }

    /// Read, apply `f`, write back with a fresh TTL.
    pub fn update<F>(&self, radio_id: u32, f: F) -> Option<RepeaterSession>
    where
        F: FnOnce(&mut RepeaterSession),
    {
        let mut session = self.get(radio_id)?;
        f(&mut session);
        self.store(session.clone());
        Some(session)
    }

    /// Restart the TTL without changing the session.
    pub fn refresh(&self, radio_id: u32) -> bool {
        self.update(radio_id, |_| {}).is_some()
    }

    pub fn set_phase(&self, radio_id: u32, phase: ConnectionPhase) -> bool {
        self.update(radio_id, |s| s.phase = phase).is_some()
    }

    /// Record a keepalive.
    pub fn ping(&self, radio_id: u32) -> Option<RepeaterSession> {
        self.update(radio_id, |s| {
            s.last_ping = Utc::now();
            s.pings_received += 1;
        })
    }

    pub fn delete(&self, radio_id: u32) -> Option<RepeaterSession> {
        self.sessions.remove(&radio_id).map(|(_, e)| e.session)
    }

    /// Session must exist, be in `phase`, and have been bound to `ip`.
    pub fn check(
        &self,
        radio_id: u32,
        phase: ConnectionPhase,
        ip: IpAddr,
    ) -> Result<RepeaterSession, SessionRejection> {
        let session = self.get(radio_id).ok_or(SessionRejection::Missing)?;
        if session.phase != phase {
            return Err(SessionRejection::WrongPhase {
                expected: phase,
                actual: session.phase,
            });
        }
        if session.ip() != ip {
            return Err(SessionRejection::AddressMismatch {
                expected: session.ip(),
                actual: ip,
            });
        }
        Ok(session)
    }

    /// Radio IDs of all live sessions.
    pub fn list(&self) -> Vec<u32> {
        let now = Instant::now();
        let mut ids: Vec<u32> = self
            .sessions
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Live sessions in the given phase.
    pub fn sessions_in(&self, phase: ConnectionPhase) -> Vec<RepeaterSession> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|e| e.expires_at > now && e.session.phase == phase)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Drop expired sessions, returning their radio IDs.
    pub fn remove_expired(&self) -> Vec<u32> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.sessions.retain(|id, e| {
            if e.expires_at > now {
                true
            } else {
                expired.push(*id);
                false
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
