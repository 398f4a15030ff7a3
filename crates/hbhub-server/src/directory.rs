// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Collaborator interfaces for repeater, talkgroup and user records.
//!
//! The hub only reads and writes through these traits; durable storage is
//! somebody else's job. [`MemoryDirectory`] backs them with in-process maps
//! and can be seeded from a JSON file:
//!
//! ```json
//! {
//!   "repeaters": [{ "radio_id": 312750, "password": "secret", "ts1_static_talkgroups": [9] }],
//!   "talkgroups": [{ "id": 9, "name": "Local" }],
//!   "users": [{ "id": 3120001, "callsign": "W1AW" }]
//! }
//! ```

use crate::models::{Call, CallKey, RepeaterConfig, Talkgroup, User};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Repeater records.
pub trait RepeaterDirectory: Send + Sync {
    fn repeater_exists(&self, radio_id: u32) -> Result<bool, DirectoryError>;

    fn get_repeater(&self, radio_id: u32) -> Result<Option<RepeaterConfig>, DirectoryError>;

    /// Insert or replace.
    fn save_repeater(&self, repeater: &RepeaterConfig) -> Result<(), DirectoryError>;

    /// Apply `update` to the stored record atomically and return the
    /// updated copy, or `None` if the repeater is unknown.
    ///
    /// Concurrent updates of one record must not overwrite each other's
    /// fields; in-place edits go through here rather than `save_repeater`.
    fn update_repeater(
        &self,
        radio_id: u32,
        update: &mut dyn FnMut(&mut RepeaterConfig),
    ) -> Result<Option<RepeaterConfig>, DirectoryError>;

    fn list_repeaters(&self) -> Result<Vec<RepeaterConfig>, DirectoryError>;

    /// Record a sign of life without touching any other field.
    fn touch_last_ping(
        &self,
        radio_id: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<RepeaterConfig>, DirectoryError> {
        self.update_repeater(radio_id, &mut |config: &mut RepeaterConfig| {
            config.last_ping = Some(at);
        })
    }

    /// Replace the dynamic talkgroup of one slot.
    fn set_dynamic_talkgroup(
        &self,
        radio_id: u32,
        slot: bool,
        talkgroup: Option<u32>,
    ) -> Result<Option<SlotUpdate>, DirectoryError> {
        let mut previous = None;
        let config = self.update_repeater(radio_id, &mut |config: &mut RepeaterConfig| {
            previous = config.dynamic_talkgroup(slot);
            config.set_dynamic_talkgroup(slot, talkgroup);
        })?;
        Ok(config.map(|config| SlotUpdate { previous, config }))
    }

    /// Replace the dynamic talkgroup of one slot only while it still holds
    /// `expected`. Compare [`SlotUpdate::previous`] with `expected` to see
    /// whether the write happened.
    fn compare_and_set_dynamic_talkgroup(
        &self,
        radio_id: u32,
        slot: bool,
        expected: Option<u32>,
        talkgroup: Option<u32>,
    ) -> Result<Option<SlotUpdate>, DirectoryError> {
        let mut previous = None;
        let config = self.update_repeater(radio_id, &mut |config: &mut RepeaterConfig| {
            previous = config.dynamic_talkgroup(slot);
            if previous == expected {
                config.set_dynamic_talkgroup(slot, talkgroup);
            }
        })?;
        Ok(config.map(|config| SlotUpdate { previous, config }))
    }
}

/// Result of a slot-scoped dynamic talkgroup write.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotUpdate {
    /// Value the slot held right before the write.
    pub previous: Option<u32>,
    /// Record as stored after the write.
    pub config: RepeaterConfig,
}

/// Talkgroup records.
pub trait TalkgroupDirectory: Send + Sync {
    fn talkgroup_exists(&self, id: u32) -> Result<bool, DirectoryError>;

    fn get_talkgroup(&self, id: u32) -> Result<Option<Talkgroup>, DirectoryError>;
}

/// Subscriber records.
pub trait UserDirectory: Send + Sync {
    fn user_exists(&self, id: u32) -> Result<bool, DirectoryError>;

    /// Radio IDs of the repeaters owned by `user_id`.
    fn owned_repeaters(&self, user_id: u32) -> Result<Vec<u32>, DirectoryError>;
}

/// Call history sink.
pub trait CallSink: Send + Sync {
    /// Insert or replace by call ID.
    fn save_call(&self, call: &Call) -> Result<(), DirectoryError>;

    /// The active call matching `key`, if any.
    fn find_active_call(&self, key: &CallKey) -> Result<Option<Call>, DirectoryError>;
}

/// Everything the hub needs from its collaborators.
pub trait Directory: RepeaterDirectory + TalkgroupDirectory + UserDirectory + CallSink {}

impl<T> Directory for T where T: RepeaterDirectory + TalkgroupDirectory + UserDirectory + CallSink {}

/// JSON seed file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub repeaters: Vec<RepeaterConfig>,
    #[serde(default)]
    pub talkgroups: Vec<Talkgroup>,
    #[serde(default)]
    pub users: Vec<User>,
}

/// In-memory directory.
#[derive(Default)]
pub struct MemoryDirectory {
    repeaters: RwLock<HashMap<u32, RepeaterConfig>>,
    talkgroups: RwLock<HashMap<u32, Talkgroup>>,
    users: RwLock<HashMap<u32, User>>,
    calls: RwLock<HashMap<u64, Call>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let directory = Self::new();
        for repeater in seed.repeaters {
            directory.insert_repeater(repeater);
        }
        for talkgroup in seed.talkgroups {
            directory.insert_talkgroup(talkgroup);
        }
        for user in seed.users {
            directory.insert_user(user);
        }
        directory
    }

    /// Load a JSON seed file.
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DirectoryError::Io(e.to_string()))?;
        let seed: DirectorySeed =
            serde_json::from_str(&content).map_err(|e| DirectoryError::Parse(e.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_repeater(&self, repeater: RepeaterConfig) {
        self.repeaters.write().insert(repeater.radio_id, repeater);
    }

    pub fn remove_repeater(&self, radio_id: u32) -> Option<RepeaterConfig> {
        self.repeaters.write().remove(&radio_id)
    }

    pub fn insert_talkgroup(&self, talkgroup: Talkgroup) {
        self.talkgroups.write().insert(talkgroup.id, talkgroup);
    }

    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self.calls.read().values().cloned().collect();
        calls.sort_by_key(|c| c.id);
        calls
    }

    pub fn active_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.active).collect()
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            repeaters: self.repeaters.read().len(),
            talkgroups: self.talkgroups.read().len(),
            users: self.users.read().len(),
            calls: self.calls.read().len(),
        }
    }
}

impl RepeaterDirectory for MemoryDirectory {
    fn repeater_exists(&self, radio_id: u32) -> Result<bool, DirectoryError> {
        Ok(self.repeaters.read().contains_key(&radio_id))
    }

    fn get_repeater(&self, radio_id: u32) -> Result<Option<RepeaterConfig>, DirectoryError> {
        Ok(self.repeaters.read().get(&radio_id).cloned())
    }

    fn save_repeater(&self, repeater: &RepeaterConfig) -> Result<(), DirectoryError> {
        self.insert_repeater(repeater.clone());
        Ok(())
    }

    fn update_repeater(
        &self,
        radio_id: u32,
        update: &mut dyn FnMut(&mut RepeaterConfig),
    ) -> Result<Option<RepeaterConfig>, DirectoryError> {
        let mut repeaters = self.repeaters.write();
        Ok(repeaters.get_mut(&radio_id).map(|config| {
            update(config);
            config.clone()
        }))
    }

    fn list_repeaters(&self) -> Result<Vec<RepeaterConfig>, DirectoryError> {
        let mut repeaters: Vec<RepeaterConfig> =
            self.repeaters.read().values().cloned().collect();
        repeaters.sort_by_key(|r| r.radio_id);
        Ok(repeaters)
    }
}

impl TalkgroupDirectory for MemoryDirectory {
    fn talkgroup_exists(&self, id: u32) -> Result<bool, DirectoryError> {
        Ok(self.talkgroups.read().contains_key(&id))
    }

    fn get_talkgroup(&self, id: u32) -> Result<Option<Talkgroup>, DirectoryError> {
        Ok(self.talkgroups.read().get(&id).cloned())
    }
}

impl UserDirectory for MemoryDirectory {
    fn user_exists(&self, id: u32) -> Result<bool, DirectoryError> {
        Ok(self.users.read().contains_key(&id))
    }

    fn owned_repeaters(&self, user_id: u32) -> Result<Vec<u32>, DirectoryError> {
        let mut owned: Vec<u32> = self
            .repeaters
            .read()
            .values()
            .filter(|r| r.owner_id == user_id)
            .map(|r| r.radio_id)
            .collect();
        owned.sort_unstable();
        Ok(owned)
    }
}

impl CallSink for MemoryDirectory {
    fn save_call(&self, call: &Call) -> Result<(), DirectoryError> {
        self.calls.write().insert(call.id, call.clone());
        Ok(())
    }

    fn find_active_call(&self, key: &CallKey) -> Result<Option<Call>, DirectoryError> {
        Ok(self
            .calls
            .read()
            .values()
            .find(|c| c.active && c.key() == *key)
            .cloned())
    }
}

/// Record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub repeaters: usize,
    pub talkgroups: usize,
    pub users: usize,
    pub calls: usize,
}

/// Directory error types.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn seeded() -> MemoryDirectory {
        let mut owned = RepeaterConfig::new(312_750, "secret");
        owned.owner_id = 3_120_001;
        let mut other = RepeaterConfig::new(312_751, "secret");
        other.owner_id = 3_120_001;

        MemoryDirectory::from_seed(DirectorySeed {
            repeaters: vec![other, owned, RepeaterConfig::new(1, "x")],
            talkgroups: vec![Talkgroup {
                id: 9,
                name: "Local".into(),
                description: String::new(),
            }],
            users: vec![User {
                id: 3_120_001,
                callsign: "W1AW".into(),
                username: "hiram".into(),
            }],
        })
    }

    #[test]
    fn test_lookups() {
        let dir = seeded();
        assert!(dir.repeater_exists(312_750).unwrap());
        assert!(!dir.repeater_exists(2).unwrap());
        assert!(dir.talkgroup_exists(9).unwrap());
        assert!(dir.user_exists(3_120_001).unwrap());
        assert_eq!(dir.get_talkgroup(9).unwrap().unwrap().name, "Local");
        assert_eq!(
            dir.stats(),
            DirectoryStats {
                repeaters: 3,
                talkgroups: 1,
                users: 1,
                calls: 0
            }
        );
    }

    #[test]
    fn test_owned_repeaters() {
        let dir = seeded();
        assert_eq!(dir.owned_repeaters(3_120_001).unwrap(), vec![312_750, 312_751]);
        assert!(dir.owned_repeaters(42).unwrap().is_empty());
    }

    #[test]
    fn test_save_repeater_replaces() {
        let dir = seeded();
        let mut config = dir.get_repeater(312_750).unwrap().unwrap();
        config.callsign = "W1AW".into();
        dir.save_repeater(&config).unwrap();

        assert_eq!(dir.get_repeater(312_750).unwrap().unwrap().callsign, "W1AW");
        let ids: Vec<u32> = dir
            .list_repeaters()
            .unwrap()
            .iter()
            .map(|r| r.radio_id)
            .collect();
        assert_eq!(ids, vec![1, 312_750, 312_751]);
    }

    #[test]
    fn test_slot_writes_keep_other_fields() {
        let dir = seeded();
        let update = dir
            .set_dynamic_talkgroup(312_750, true, Some(91))
            .unwrap()
            .unwrap();
        assert_eq!(update.previous, None);
        assert_eq!(update.config.ts2_dynamic_talkgroup, Some(91));

        dir.set_dynamic_talkgroup(312_750, false, Some(9)).unwrap();
        let at = Utc::now();
        let touched = dir.touch_last_ping(312_750, at).unwrap().unwrap();
        assert_eq!(touched.last_ping, Some(at));
        assert_eq!(touched.ts1_dynamic_talkgroup, Some(9));
        assert_eq!(touched.ts2_dynamic_talkgroup, Some(91));

        let updated = dir
            .update_repeater(312_750, &mut |c: &mut RepeaterConfig| {
                c.callsign = "N0CALL".into()
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.callsign, "N0CALL");
        assert_eq!(updated.ts2_dynamic_talkgroup, Some(91));
        assert!(dir.touch_last_ping(2, at).unwrap().is_none());
        assert!(dir.set_dynamic_talkgroup(2, false, Some(9)).unwrap().is_none());
    }

    #[test]
    fn test_compare_and_set_dynamic_talkgroup() {
        let dir = seeded();
        dir.set_dynamic_talkgroup(312_750, false, Some(9)).unwrap();

        let missed = dir
            .compare_and_set_dynamic_talkgroup(312_750, false, Some(91), None)
            .unwrap()
            .unwrap();
        assert_eq!(missed.previous, Some(9));
        assert_eq!(missed.config.ts1_dynamic_talkgroup, Some(9));

        let hit = dir
            .compare_and_set_dynamic_talkgroup(312_750, false, Some(9), None)
            .unwrap()
            .unwrap();
        assert_eq!(hit.previous, Some(9));
        assert_eq!(hit.config.ts1_dynamic_talkgroup, None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"repeaters": [{{"radio_id": 7, "password": "pw", "ts2_static_talkgroups": [91]}}],
                "talkgroups": [{{"id": 91}}]}}"#
        )
        .unwrap();

        let dir = MemoryDirectory::from_file(file.path()).unwrap();
        let repeater = dir.get_repeater(7).unwrap().unwrap();
        assert_eq!(repeater.ts2_static_talkgroups, vec![91]);
        assert!(dir.talkgroup_exists(91).unwrap());
        assert_eq!(dir.stats().users, 0);
    }

    #[test]
    fn test_from_file_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            MemoryDirectory::from_file(file.path()),
            Err(DirectoryError::Parse(_))
        ));
    }
}
