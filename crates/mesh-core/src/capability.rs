//! Device capability snapshots.
//!
//! Hardware sampling lives outside this workspace. Callers describe the device
//! with a [`DeviceProfile`] value and take point-in-time snapshots from it with
//! the pure [`snapshot`] function; nothing here holds shared mutable state.

use serde::{Deserialize, Serialize};

use crate::types::unix_millis;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Battery reading consumed by the sync gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge percentage, 0-100
    pub level: u8,
    pub charging: bool,
}

impl BatteryState {
    pub fn new(level: u8, charging: bool) -> Self {
        Self {
            level: level.min(100),
            charging,
        }
    }

    /// Mains-powered devices report a full, charging battery.
    pub fn mains() -> Self {
        Self::new(100, true)
    }
}

/// Static description of a device, supplied by configuration or a platform layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub battery_level: u8,
    pub charging: bool,
    pub thermal: ThermalState,
    pub cpu_cores: u16,
    pub free_storage_bytes: u64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            battery_level: 100,
            charging: true,
            thermal: ThermalState::Nominal,
            cpu_cores: 4,
            free_storage_bytes: 0,
        }
    }
}

/// Point-in-time description of a node's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub battery: BatteryState,
    pub thermal: ThermalState,
    pub cpu_cores: u16,
    pub free_storage_bytes: u64,
    pub taken_at: u64,
}

impl CapabilitySnapshot {
    /// Thermally throttled devices should not volunteer for heavy work.
    pub fn is_throttled(&self) -> bool {
        matches!(self.thermal, ThermalState::Serious | ThermalState::Critical)
    }
}

/// Take a snapshot of `profile`.
pub fn snapshot(profile: &DeviceProfile) -> CapabilitySnapshot {
    CapabilitySnapshot {
        battery: BatteryState::new(profile.battery_level, profile.charging),
        thermal: profile.thermal,
        cpu_cores: profile.cpu_cores.max(1),
        free_storage_bytes: profile.free_storage_bytes,
        taken_at: unix_millis(),
    }
}
