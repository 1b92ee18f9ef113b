//! mesh-core: shared vocabulary for the meshstage control plane and storage engine
//!
//! - `types`: staged files, lifecycle states, priorities, replication levels
//! - `config`: `mesh.toml` schema
//! - `error`: the error taxonomy shared by every crate
//! - `checksum`: BLAKE3 content fingerprints used for conflict detection
//! - `capability`: device capability snapshots (battery, thermal, storage)

pub mod capability;
pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use capability::{snapshot, BatteryState, CapabilitySnapshot, DeviceProfile, ThermalState};
pub use error::{MeshError, MeshResult};
pub use types::*;
