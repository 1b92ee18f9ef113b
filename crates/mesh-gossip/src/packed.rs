//! Packed mesh-info word
//!
//! Link-state summary carried by every node-state message, packed into one
//! `u64` (least-significant bit first):
//!
//! ```text
//! bits  0..=4   neighbor_count   0-31 (capped)
//! bits  5..=14  centrality       0.0-1.0 in 1023 steps
//! bits 15..=22  signal magnitude -128..=0 dBm, stored negated
//! bits 23..=29  battery_level    0-100
//! bit  30       connected
//! bit  31       charging
//! bits 32..=39  link_quality     0-255
//! bits 40..=63  reserved, zero
//! ```
//!
//! [`MeshInfo::new`] snaps every field onto what the word can carry. Packing
//! a value built field by field fails instead of silently losing precision,
//! so whatever packs also unpacks to the same value.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const MAX_NEIGHBORS: u8 = 31;
const CENTRALITY_STEPS: u16 = 1023;
const MAX_SIGNAL_MAGNITUDE: u64 = 128;

const NEIGHBOR_SHIFT: u32 = 0;
const CENTRALITY_SHIFT: u32 = 5;
const SIGNAL_SHIFT: u32 = 15;
const BATTERY_SHIFT: u32 = 23;
const CONNECTED_BIT: u32 = 30;
const CHARGING_BIT: u32 = 31;
const LINK_SHIFT: u32 = 32;
const RESERVED_SHIFT: u32 = 40;

/// Decoded link-state summary of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshInfo {
    pub neighbor_count: u8,
    /// Normalised betweenness estimate, always on the 1023-step grid
    pub centrality: f32,
    pub signal_dbm: i8,
    pub battery_level: u8,
    pub connected: bool,
    pub charging: bool,
    pub link_quality: u8,
}

impl MeshInfo {
    /// Build a value clamped to the packable ranges, so that
    /// `unpack(pack(x)) == x` holds exactly.
    pub fn new(
        neighbor_count: u8,
        centrality: f32,
        signal_dbm: i8,
        battery_level: u8,
        connected: bool,
        charging: bool,
        link_quality: u8,
    ) -> Self {
        Self {
            neighbor_count: neighbor_count.min(MAX_NEIGHBORS),
            centrality: dequantise(quantise(centrality)),
            signal_dbm: signal_dbm.min(0),
            battery_level: battery_level.min(100),
            connected,
            charging,
            link_quality,
        }
    }

    pub fn pack(&self) -> Result<u64, CodecError> {
        if self.neighbor_count > MAX_NEIGHBORS {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.neighbor_count",
                value: u64::from(self.neighbor_count),
            });
        }
        let steps = quantise(self.centrality);
        if self.centrality.is_nan() || dequantise(steps) != self.centrality {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.centrality",
                value: u64::from(self.centrality.to_bits()),
            });
        }
        if self.signal_dbm > 0 {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.signal",
                value: self.signal_dbm as u64,
            });
        }
        if self.battery_level > 100 {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.battery",
                value: u64::from(self.battery_level),
            });
        }

        let neighbors = u64::from(self.neighbor_count);
        let centrality = u64::from(steps);
        let signal = (-i16::from(self.signal_dbm)) as u64;
        let battery = u64::from(self.battery_level);

        Ok((neighbors << NEIGHBOR_SHIFT)
            | (centrality << CENTRALITY_SHIFT)
            | (signal << SIGNAL_SHIFT)
            | (battery << BATTERY_SHIFT)
            | (u64::from(self.connected) << CONNECTED_BIT)
            | (u64::from(self.charging) << CHARGING_BIT)
            | (u64::from(self.link_quality) << LINK_SHIFT))
    }

    pub fn unpack(word: u64) -> Result<Self, CodecError> {
        let reserved = word >> RESERVED_SHIFT;
        if reserved != 0 {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.reserved",
                value: reserved,
            });
        }

        let signal = field(word, SIGNAL_SHIFT, 8);
        if signal > MAX_SIGNAL_MAGNITUDE {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.signal",
                value: signal,
            });
        }
        let battery = field(word, BATTERY_SHIFT, 7);
        if battery > 100 {
            return Err(CodecError::FieldOutOfRange {
                field: "mesh_info.battery",
                value: battery,
            });
        }

        Ok(Self {
            neighbor_count: field(word, NEIGHBOR_SHIFT, 5) as u8,
            centrality: dequantise(field(word, CENTRALITY_SHIFT, 10) as u16),
            signal_dbm: (-(signal as i16)) as i8,
            battery_level: battery as u8,
            connected: field(word, CONNECTED_BIT, 1) == 1,
            charging: field(word, CHARGING_BIT, 1) == 1,
            link_quality: field(word, LINK_SHIFT, 8) as u8,
        })
    }
}

impl Default for MeshInfo {
    fn default() -> Self {
        Self::new(0, 0.0, 0, 100, false, false, 0)
    }
}

fn field(word: u64, shift: u32, width: u32) -> u64 {
    (word >> shift) & ((1u64 << width) - 1)
}

fn quantise(centrality: f32) -> u16 {
    if centrality.is_nan() {
        return 0;
    }
    (centrality.clamp(0.0, 1.0) * f32::from(CENTRALITY_STEPS)).round() as u16
}

fn dequantise(steps: u16) -> f32 {
    f32::from(steps.min(CENTRALITY_STEPS)) / f32::from(CENTRALITY_STEPS)
}
