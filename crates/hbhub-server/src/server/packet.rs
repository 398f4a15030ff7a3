// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! DMRD voice/data frame codec.
//!
//! Wire format (53 or 55 bytes):
//! ```text
//! +--------+-----+--------+--------+-----------+-------+-----------+--------------+-----+------+
//! | "DMRD" | seq | src 3B | dst 3B | repeater  | bits  | stream 4B | payload 33B  | BER | RSSI |
//! | 0..4   | 4   | 5..8   | 8..11  | 11..15    | 15    | 16..20    | 20..53       | 53  | 54   |
//! +--------+-----+--------+--------+-----------+-------+-----------+--------------+-----+------+
//! ```
//!
//! The `bits` byte packs the timeslot (bit 7, set = TS2), the call type
//! (bit 6, set = private), the frame type (bits 5-4) and the data type or
//! voice sequence (bits 3-0). BER and RSSI are optional trailing bytes.

use super::protocol::ProtocolError;

/// Tag at the head of every voice/data frame.
pub const DATA_TAG: &[u8; 4] = b"DMRD";

/// Length of a frame without signal metrics.
pub const DATA_FRAME_LEN: usize = 53;

/// Length of a frame carrying BER and RSSI.
pub const DATA_FRAME_LEN_WITH_METRICS: usize = 55;

/// Offset of the originating repeater ID.
pub const REPEATER_ID_OFFSET: usize = 11;

/// Size of the embedded DMR burst.
pub const DMR_PAYLOAD_LEN: usize = 33;

/// Sentinel for an unknown BER or RSSI value.
pub const UNKNOWN_METRIC: f32 = -1.0;

/// Data type marking a voice header in a data-sync frame.
pub const DTYPE_VOICE_HEADER: u8 = 1;

/// Data type marking a voice terminator in a data-sync frame.
pub const DTYPE_VOICE_TERMINATOR: u8 = 2;

/// Frame type carried in bits 5-4 of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Voice,
    VoiceSync,
    DataSync,
}

impl FrameType {
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(Self::Voice),
            1 => Ok(Self::VoiceSync),
            2 => Ok(Self::DataSync),
            other => Err(ProtocolError::InvalidFrameType(other)),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Voice => 0,
            Self::VoiceSync => 1,
            Self::DataSync => 2,
        }
    }
}

/// A decoded DMRD frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub seq: u8,
    pub src: u32,
    pub dst: u32,
    pub repeater: u32,
    /// `false` = timeslot 1, `true` = timeslot 2.
    pub slot: bool,
    pub group_call: bool,
    pub frame_type: FrameType,
    pub dtype_vseq: u8,
    pub stream_id: u32,
    pub payload: [u8; DMR_PAYLOAD_LEN],
    pub ber: f32,
    pub rssi: f32,
}

impl Packet {
    /// Decode a DMRD datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != DATA_FRAME_LEN && data.len() != DATA_FRAME_LEN_WITH_METRICS {
            return Err(ProtocolError::InvalidLength {
                command: "DMRD",
                actual: data.len(),
            });
        }
        if &data[..4] != DATA_TAG {
            return Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(&data[..4]).into_owned(),
            ));
        }

        let bits = data[15];
        let mut payload = [0u8; DMR_PAYLOAD_LEN];
        payload.copy_from_slice(&data[20..53]);

        let (ber, rssi) = if data.len() == DATA_FRAME_LEN_WITH_METRICS {
            (f32::from(data[53]), f32::from(data[54]))
        } else {
            (UNKNOWN_METRIC, UNKNOWN_METRIC)
        };

        Ok(Self {
            seq: data[4],
            src: read_u24(&data[5..8]),
            dst: read_u24(&data[8..11]),
            repeater: read_repeater_id(data),
            slot: bits & 0x80 != 0,
            group_call: bits & 0x40 == 0,
            frame_type: FrameType::from_bits((bits & 0x30) >> 4)?,
            dtype_vseq: bits & 0x0F,
            stream_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            payload,
            ber,
            rssi,
        })
    }

    /// Encode into the wire layout.
    ///
    /// Emits the 55-byte form when either metric is known; an unknown metric
    /// is then written as zero.
    pub fn encode(&self) -> Vec<u8> {
        let with_metrics = self.ber >= 0.0 || self.rssi >= 0.0;
        let mut out = Vec::with_capacity(DATA_FRAME_LEN_WITH_METRICS);

        out.extend_from_slice(DATA_TAG);
        out.push(self.seq);
        out.extend_from_slice(&self.src.to_be_bytes()[1..]);
        out.extend_from_slice(&self.dst.to_be_bytes()[1..]);
        out.extend_from_slice(&self.repeater.to_be_bytes());

        let mut bits = (self.frame_type.to_bits() << 4) | (self.dtype_vseq & 0x0F);
        if self.slot {
            bits |= 0x80;
        }
        if !self.group_call {
            bits |= 0x40;
        }
        out.push(bits);

        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);

        if with_metrics {
            out.push(metric_byte(self.ber));
            out.push(metric_byte(self.rssi));
        }
        out
    }

    /// Voice header, voice terminator, voice and voice-sync frames carry voice.
    pub fn is_voice(&self) -> bool {
        match self.frame_type {
            FrameType::Voice | FrameType::VoiceSync => true,
            FrameType::DataSync => {
                self.dtype_vseq == DTYPE_VOICE_HEADER || self.dtype_vseq == DTYPE_VOICE_TERMINATOR
            }
        }
    }

    pub fn is_voice_header(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_HEADER
    }

    pub fn is_voice_terminator(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_TERMINATOR
    }

    /// Timeslot as a 1-based number for logs.
    pub fn slot_number(&self) -> u8 {
        if self.slot {
            2
        } else {
            1
        }
    }
}

/// Read the originating repeater ID of a DMRD frame without a full decode.
///
/// The caller guarantees at least 15 bytes.
pub fn read_repeater_id(data: &[u8]) -> u32 {
    u32::from_be_bytes([
        data[REPEATER_ID_OFFSET],
        data[REPEATER_ID_OFFSET + 1],
        data[REPEATER_ID_OFFSET + 2],
        data[REPEATER_ID_OFFSET + 3],
    ])
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2])
}

fn metric_byte(value: f32) -> u8 {
    if value < 0.0 {
        0
    } else {
        value.round().min(255.0) as u8
    }
}
