//! mesh-sync: local-first staging with background mesh sync
//!
//! - `state`: staged-file map persisted through OpenDAL
//! - `queue`: priority queue with per-path dedup and completion handles
//! - `battery`: battery-aware gate
//! - `transfer`: the narrow mesh-transfer interface the worker depends on
//! - `conflict`: checksum reconciliation
//! - `engine`: `SyncQueue`, the public API and the worker

pub mod battery;
pub mod conflict;
pub mod engine;
pub mod local;
pub mod queue;
pub mod state;
pub mod transfer;

pub use battery::{BatteryPolicy, FixedPower, GateDecision, PowerSource};
pub use conflict::{ReconcileOutcome, Resolution};
pub use engine::{DeleteOutcome, SkipReason, SyncQueue, TickOutcome};
pub use queue::{SyncHandle, SyncResult};
pub use transfer::{ConnectivityProbe, DalTransfer, MeshTransfer};
