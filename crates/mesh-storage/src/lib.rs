//! mesh-storage: distributed storage manager
//!
//! - `manager`: quota-checked, encrypted store/retrieve/delete with mesh
//!   distribution and a background health/expiry monitor
//! - `replication`: per-path replica targets and health
//! - `quota`: byte quota
//! - `mesh`: the mesh-network collaborator interface

pub mod manager;
pub mod mesh;
pub mod quota;
pub mod replication;

pub use manager::{select_replication_nodes, DistributedStorageManager, MaintenanceReport};
pub use mesh::MeshNetwork;
pub use quota::QuotaManager;
pub use replication::ReplicationTracker;
