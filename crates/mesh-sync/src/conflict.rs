//! Checksum-based divergence detection between the local copy and the mesh.
//!
//! A conflict is never resolved automatically: the file is marked CONFLICT,
//! the local copy keeps being served, and the caller picks a [`Resolution`].

use mesh_core::FileState;
use serde::{Deserialize, Serialize};

/// Metadata key recording the mesh checksum seen when a conflict was detected.
pub const MESH_CHECKSUM_KEY: &str = "conflict.mesh_checksum";
/// Metadata key recording when the conflict was detected (unix ms).
pub const DETECTED_AT_KEY: &str = "conflict.detected_at";

/// How to resolve a CONFLICT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local version and upload it over the mesh copy.
    KeepLocal,
    /// Replace the local copy with the mesh version.
    KeepMesh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    InSync,
    Conflict { local: String, mesh: String },
    /// No node holds a copy anymore; the file is queued for re-upload.
    MeshMissing,
    /// Only SYNCED files are reconciled.
    Skipped(FileState),
}

/// Compare a local checksum with what the mesh reports.
pub fn compare(local: &str, mesh: Option<&str>) -> ReconcileOutcome {
    match mesh {
        None => ReconcileOutcome::MeshMissing,
        Some(m) if m.eq_ignore_ascii_case(local) => ReconcileOutcome::InSync,
        Some(m) => ReconcileOutcome::Conflict {
            local: local.to_string(),
            mesh: m.to_string(),
        },
    }
}
