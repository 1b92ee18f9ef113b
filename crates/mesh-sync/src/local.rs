//! OpenDAL Operator factory for the local staging area

use std::path::Path;

use anyhow::{Context, Result};
use opendal::Operator;

/// Operator rooted at `data_dir` on the local filesystem.
///
/// Writes go through a temp directory under `data_dir` and are renamed into
/// place, so a crash never leaves a half-written metadata document.
pub fn build_operator(data_dir: &Path) -> Result<Operator> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir: {}", data_dir.display()))?;

    let root = data_dir.to_string_lossy();
    let tmp = data_dir.join(".tmp");
    let builder = opendal::services::Fs::default()
        .root(&root)
        .atomic_write_dir(&tmp.to_string_lossy());

    Ok(Operator::new(builder)
        .with_context(|| format!("creating OpenDAL Fs operator at {}", data_dir.display()))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(opendal::layers::RetryLayer::new().with_max_times(3).with_jitter())
        .finish())
}

/// Volatile in-memory operator (tests, ephemeral nodes).
pub fn build_memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish())
}
