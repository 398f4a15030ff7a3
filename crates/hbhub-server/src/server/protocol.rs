// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Homebrew repeater wire protocol.
//!
//! Every datagram starts with an ASCII command tag (4 to 7 bytes) followed by
//! fixed-offset binary or space-padded text fields:
//!
//! ```text
//! RPTL    | id(4)                                   login, 8 bytes
//! RPTK    | id(4) | sha256(32)                      key response, 40 bytes
//! RPTC    | id(4) | config text fields (294)        configuration, 302 bytes
//! RPTCL   | id(4)                                   disconnect, 9 bytes
//! RPTPING | id(4)                                   keepalive, 11 bytes
//! RPTO    | id(4) | option text                     options
//! DMRA    | id(4) | talker alias                    talk alias
//! DMRD    | see packet.rs                           voice/data, 53 or 55 bytes
//! ```
//!
//! Replies are `RPTACK`, `MSTNAK` and `MSTPONG` followed by a payload.

use super::packet::Packet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

pub const LOGIN_LEN: usize = 8;
pub const KEY_RESPONSE_LEN: usize = 40;
pub const CONFIG_LEN: usize = 302;
pub const DISCONNECT_LEN: usize = 9;
pub const PING_LEN: usize = 11;

/// Shortest datagram that can carry a command tag.
pub const MIN_FRAME_LEN: usize = 4;

const CALLSIGN: Range<usize> = 8..16;
const RX_FREQUENCY: Range<usize> = 16..25;
const TX_FREQUENCY: Range<usize> = 25..34;
const TX_POWER: Range<usize> = 34..36;
const COLOR_CODE: Range<usize> = 36..38;
const LATITUDE: Range<usize> = 38..46;
const LONGITUDE: Range<usize> = 46..55;
const HEIGHT: Range<usize> = 55..58;
const LOCATION: Range<usize> = 58..78;
const DESCRIPTION: Range<usize> = 78..97;
const SLOTS: Range<usize> = 97..98;
const URL: Range<usize> = 98..222;
const SOFTWARE_ID: Range<usize> = 222..262;
const PACKAGE_ID: Range<usize> = 262..302;

const MAX_LOCATION: usize = 20;
const MAX_DESCRIPTION: usize = 20;
const MAX_URL: usize = 124;
const MAX_SOFTWARE_ID: usize = 40;
const MAX_PACKAGE_ID: usize = 40;
const MAX_TX_POWER: u32 = 99;
const MAX_HEIGHT: i32 = 999;
const MAX_COLOR_CODE: u8 = 15;

/// Inbound tags from peers that are accepted but not acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    RepeaterAck,
    MasterNak,
    MasterPong,
    MasterClose,
    MasterN,
    MasterP,
    MasterC,
    RepeaterA,
    RepeaterS,
    RepeaterBeacon,
}

/// Command decoded from the datagram tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login,
    KeyResponse,
    Config,
    Disconnect,
    Ping,
    Options,
    Data,
    TalkAlias,
    Peer(PeerCommand),
}

/// Tag table, longest tags first so `RPTCL` wins over `RPTC`.
const COMMAND_TAGS: &[(&[u8], Command)] = &[
    (b"RPTPING", Command::Ping),
    (b"RPTSBKN", Command::Peer(PeerCommand::RepeaterBeacon)),
    (b"MSTPONG", Command::Peer(PeerCommand::MasterPong)),
    (b"RPTACK", Command::Peer(PeerCommand::RepeaterAck)),
    (b"MSTNAK", Command::Peer(PeerCommand::MasterNak)),
    (b"RPTCL", Command::Disconnect),
    (b"MSTCL", Command::Peer(PeerCommand::MasterClose)),
    (b"RPTL", Command::Login),
    (b"RPTK", Command::KeyResponse),
    (b"RPTC", Command::Config),
    (b"RPTO", Command::Options),
    (b"DMRD", Command::Data),
    (b"DMRA", Command::TalkAlias),
    (b"MSTN", Command::Peer(PeerCommand::MasterN)),
    (b"MSTP", Command::Peer(PeerCommand::MasterP)),
    (b"MSTC", Command::Peer(PeerCommand::MasterC)),
    (b"RPTA", Command::Peer(PeerCommand::RepeaterA)),
    (b"RPTS", Command::Peer(PeerCommand::RepeaterS)),
];

impl Command {
    /// Match the tag at the head of a datagram.
    pub fn parse(data: &[u8]) -> Option<Self> {
        COMMAND_TAGS
            .iter()
            .find(|(tag, _)| data.starts_with(tag))
            .map(|(_, command)| *command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Login => "RPTL",
            Self::KeyResponse => "RPTK",
            Self::Config => "RPTC",
            Self::Disconnect => "RPTCL",
            Self::Ping => "RPTPING",
            Self::Options => "RPTO",
            Self::Data => "DMRD",
            Self::TalkAlias => "DMRA",
            Self::Peer(peer) => match peer {
                PeerCommand::RepeaterAck => "RPTACK",
                PeerCommand::MasterNak => "MSTNAK",
                PeerCommand::MasterPong => "MSTPONG",
                PeerCommand::MasterClose => "MSTCL",
                PeerCommand::MasterN => "MSTN",
                PeerCommand::MasterP => "MSTP",
                PeerCommand::MasterC => "MSTC",
                PeerCommand::RepeaterA => "RPTA",
                PeerCommand::RepeaterS => "RPTS",
                PeerCommand::RepeaterBeacon => "RPTSBKN",
            },
        }
    }
}

/// A fully decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Login { repeater_id: u32 },
    KeyResponse { repeater_id: u32, challenge: u32 },
    /// Configuration text fields are parsed after the session check, see
    /// [`RepeaterDetails::parse`].
    Config { repeater_id: u32, data: Vec<u8> },
    Disconnect { repeater_id: u32 },
    Ping { repeater_id: u32 },
    Options { repeater_id: u32, options: String },
    TalkAlias { repeater_id: u32 },
    Data(Packet),
    Peer(PeerCommand),
}

impl Frame {
    /// Decode a datagram, checking the length contract of its command.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MIN_FRAME_LEN {
            return Err(ProtocolError::TooShort(data.len()));
        }

        let command = Command::parse(data).ok_or_else(|| {
            ProtocolError::UnknownCommand(String::from_utf8_lossy(&data[..4]).into_owned())
        })?;

        let frame = match command {
            Command::Login => {
                expect_len(command, data, LOGIN_LEN)?;
                Self::Login {
                    repeater_id: read_id(data, 4),
                }
            }
            Command::KeyResponse => {
                expect_len(command, data, KEY_RESPONSE_LEN)?;
                Self::KeyResponse {
                    repeater_id: read_id(data, 4),
                    challenge: read_id(data, 8),
                }
            }
            Command::Config => {
                expect_len(command, data, CONFIG_LEN)?;
                Self::Config {
                    repeater_id: read_id(data, 4),
                    data: data.to_vec(),
                }
            }
            Command::Disconnect => {
                expect_len(command, data, DISCONNECT_LEN)?;
                Self::Disconnect {
                    repeater_id: read_id(data, 5),
                }
            }
            Command::Ping => {
                expect_len(command, data, PING_LEN)?;
                Self::Ping {
                    repeater_id: read_id(data, 7),
                }
            }
            Command::Options => {
                expect_min_len(command, data, 8)?;
                Self::Options {
                    repeater_id: read_id(data, 4),
                    options: trim_text(&data[8..]),
                }
            }
            Command::TalkAlias => {
                expect_min_len(command, data, 8)?;
                Self::TalkAlias {
                    repeater_id: read_id(data, 4),
                }
            }
            Command::Data => Self::Data(Packet::decode(data)?),
            Command::Peer(peer) => Self::Peer(peer),
        };

        Ok(frame)
    }

    /// Repeater the frame claims to come from, if it names one.
    pub fn repeater_id(&self) -> Option<u32> {
        match self {
            Self::Login { repeater_id }
            | Self::KeyResponse { repeater_id, .. }
            | Self::Config { repeater_id, .. }
            | Self::Disconnect { repeater_id }
            | Self::Ping { repeater_id }
            | Self::Options { repeater_id, .. }
            | Self::TalkAlias { repeater_id } => Some(*repeater_id),
            Self::Data(packet) => Some(packet.repeater),
            Self::Peer(_) => None,
        }
    }
}

/// Replies the hub sends to repeaters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak,
    Pong,
}

impl Reply {
    pub fn tag(&self) -> &'static [u8] {
        match self {
            Self::Ack => b"RPTACK",
            Self::Nak => b"MSTNAK",
            Self::Pong => b"MSTPONG",
        }
    }

    /// Tag followed by payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let tag = self.tag();
        let mut out = Vec::with_capacity(tag.len() + payload.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out
    }
}

/// Station details carried by an `RPTC` configuration frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterDetails {
    pub callsign: String,
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub tx_power: u32,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: i32,
    pub location: String,
    pub description: String,
    pub slots: u8,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

impl RepeaterDetails {
    /// Parse and validate the text fields of a 302-byte configuration frame.
    pub fn parse(data: &[u8], callsign_pattern: &Regex) -> Result<Self, ProtocolError> {
        if data.len() != CONFIG_LEN {
            return Err(ProtocolError::InvalidLength {
                command: "RPTC",
                actual: data.len(),
            });
        }

        let callsign = trim_text(&data[CALLSIGN]).to_uppercase();
        if !(4..=8).contains(&callsign.chars().count()) {
            return Err(invalid("callsign", format!("bad length: {:?}", callsign)));
        }
        if !callsign_pattern.is_match(&callsign) {
            return Err(invalid("callsign", format!("no pattern match: {:?}", callsign)));
        }

        let color_code: u8 = parse_number(data, COLOR_CODE, "color_code")?;
        if color_code > MAX_COLOR_CODE {
            return Err(invalid("color_code", format!("{} > {}", color_code, MAX_COLOR_CODE)));
        }

        let latitude: f32 = parse_number(data, LATITUDE, "latitude")?;
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid("latitude", format!("{} out of range", latitude)));
        }

        let longitude: f32 = parse_number(data, LONGITUDE, "longitude")?;
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid("longitude", format!("{} out of range", longitude)));
        }

        let tx_power: u32 = parse_number(data, TX_POWER, "tx_power")?;
        let height: i32 = parse_number(data, HEIGHT, "height")?;

        let mut software_id = truncate(trim_text(&data[SOFTWARE_ID]), MAX_SOFTWARE_ID);
        if software_id.is_empty() {
            software_id = format!("hbhub-server v{}", env!("CARGO_PKG_VERSION"));
        }
        let mut package_id = truncate(trim_text(&data[PACKAGE_ID]), MAX_PACKAGE_ID);
        if package_id.is_empty() {
            package_id = format!("v{}", env!("CARGO_PKG_VERSION"));
        }

        Ok(Self {
            callsign,
            rx_frequency: parse_number(data, RX_FREQUENCY, "rx_frequency")?,
            tx_frequency: parse_number(data, TX_FREQUENCY, "tx_frequency")?,
            tx_power: tx_power.min(MAX_TX_POWER),
            color_code,
            latitude,
            longitude,
            height: height.min(MAX_HEIGHT),
            location: truncate(trim_text(&data[LOCATION]), MAX_LOCATION),
            description: truncate(trim_text(&data[DESCRIPTION]), MAX_DESCRIPTION),
            slots: parse_number(data, SLOTS, "slots")?,
            url: truncate(trim_text(&data[URL]), MAX_URL),
            software_id,
            package_id,
        })
    }

    /// Encode as a full `RPTC` frame for `repeater_id`.
    pub fn encode(&self, repeater_id: u32) -> Vec<u8> {
        let mut out = vec![b' '; CONFIG_LEN];
        out[..4].copy_from_slice(b"RPTC");
        out[4..8].copy_from_slice(&repeater_id.to_be_bytes());

        put_text(&mut out, CALLSIGN, &self.callsign);
        put_text(&mut out, RX_FREQUENCY, &self.rx_frequency.to_string());
        put_text(&mut out, TX_FREQUENCY, &self.tx_frequency.to_string());
        put_text(&mut out, TX_POWER, &self.tx_power.to_string());
        put_text(&mut out, COLOR_CODE, &self.color_code.to_string());
        put_text(&mut out, LATITUDE, &format!("{:.4}", self.latitude));
        put_text(&mut out, LONGITUDE, &format!("{:.4}", self.longitude));
        put_text(&mut out, HEIGHT, &self.height.to_string());
        put_text(&mut out, LOCATION, &self.location);
        put_text(&mut out, DESCRIPTION, &self.description);
        put_text(&mut out, SLOTS, &self.slots.to_string());
        put_text(&mut out, URL, &self.url);
        put_text(&mut out, SOFTWARE_ID, &self.software_id);
        put_text(&mut out, PACKAGE_ID, &self.package_id);
        out
    }
}

/// Protocol error types.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown command tag {0:?}")]
    UnknownCommand(String),

    #[error("invalid {command} length: {actual} bytes")]
    InvalidLength { command: &'static str, actual: usize },

    #[error("invalid frame type {0}")]
    InvalidFrameType(u8),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn expect_len(command: Command, data: &[u8], len: usize) -> Result<(), ProtocolError> {
    if data.len() != len {
        return Err(ProtocolError::InvalidLength {
            command: command.name(),
            actual: data.len(),
        });
    }
    Ok(())
}

fn expect_min_len(command: Command, data: &[u8], len: usize) -> Result<(), ProtocolError> {
    if data.len() < len {
        return Err(ProtocolError::InvalidLength {
            command: command.name(),
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_id(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn trim_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

fn truncate(s: String, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s
    }
}

fn parse_number<T: std::str::FromStr>(
    data: &[u8],
    range: Range<usize>,
    field: &'static str,
) -> Result<T, ProtocolError>
where
    T::Err: std::fmt::Display,
{
    let text = trim_text(&data[range]);
    text.parse::<T>()
        .map_err(|e| invalid(field, format!("{:?}: {}", text, e)))
}

fn put_text(out: &mut [u8], range: Range<usize>, value: &str) {
    let width = range.len();
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    out[range.start..range.start + n].copy_from_slice(&bytes[..n]);
}

fn invalid(field: &'static str, reason: String) -> ProtocolError {
    ProtocolError::InvalidField { field, reason }
}
