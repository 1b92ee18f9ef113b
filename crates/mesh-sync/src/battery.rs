//! Battery-aware sync gate.
//!
//! ```text
//! charging                       → Allow
//! level >= critical_only (30%)   → Allow
//! deny (15%) <= level < 30%      → CriticalOnly
//! level < deny (15%)             → Deny
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use mesh_core::config::BatteryConfig;
use mesh_core::{snapshot, BatteryState, DeviceProfile, SyncPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Only CRITICAL operations may run
    CriticalOnly,
    Deny,
}

impl GateDecision {
    pub fn permits(&self, priority: SyncPriority) -> bool {
        match self {
            GateDecision::Allow => true,
            GateDecision::CriticalOnly => priority == SyncPriority::Critical,
            GateDecision::Deny => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatteryPolicy {
    config: BatteryConfig,
}

impl BatteryPolicy {
    pub fn new(config: BatteryConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, battery: BatteryState) -> GateDecision {
        if battery.charging || battery.level >= self.config.critical_only_threshold {
            GateDecision::Allow
        } else if battery.level >= self.config.deny_threshold {
            GateDecision::CriticalOnly
        } else {
            GateDecision::Deny
        }
    }

    /// Whether the battery is comfortably above the healthy mark.
    pub fn is_healthy(&self, battery: BatteryState) -> bool {
        battery.charging || battery.level >= self.config.allow_threshold
    }
}

/// Capability collaborator supplying battery readings to the gate.
pub trait PowerSource: Send + Sync {
    fn battery(&self) -> BatteryState;
}

impl PowerSource for DeviceProfile {
    fn battery(&self) -> BatteryState {
        snapshot(self).battery
    }
}

/// A battery reading that can be changed at runtime (platform callbacks, tests).
#[derive(Debug)]
pub struct FixedPower {
    level: AtomicU8,
    charging: AtomicBool,
}

impl FixedPower {
    pub fn new(level: u8, charging: bool) -> Self {
        Self {
            level: AtomicU8::new(level.min(100)),
            charging: AtomicBool::new(charging),
        }
    }

    pub fn set(&self, level: u8, charging: bool) {
        self.level.store(level.min(100), Ordering::Relaxed);
        self.charging.store(charging, Ordering::Relaxed);
    }
}

impl PowerSource for FixedPower {
    fn battery(&self) -> BatteryState {
        BatteryState::new(
            self.level.load(Ordering::Relaxed),
            self.charging.load(Ordering::Relaxed),
        )
    }
}
