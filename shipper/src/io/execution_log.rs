//! Execution records under `.shipper/executions/` and the bounded run history.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::history::RingBuffer;
use crate::core::protocol::{ExecutionSummary, ProtocolExecution};
use crate::io::atomic::write_json_atomic;
use crate::io::init::ShipperPaths;

/// Write the full execution record, replacing any earlier copy.
pub fn write_execution(paths: &ShipperPaths, execution: &ProtocolExecution) -> Result<()> {
    write_json_atomic(&paths.execution_path(&execution.execution_id), execution)
}

pub fn load_execution(paths: &ShipperPaths, execution_id: &str) -> Result<Option<ProtocolExecution>> {
    let path = paths.execution_path(execution_id);
    if !path.is_file() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read execution {}", path.display()))?;
    let execution = serde_json::from_str(&contents)
        .with_context(|| format!("parse execution {}", path.display()))?;
    Ok(Some(execution))
}

/// Load history, resized to `capacity`. A missing file is an empty history.
pub fn load_history(path: &Path, capacity: usize) -> Result<RingBuffer<ExecutionSummary>> {
    if !path.exists() {
        return Ok(RingBuffer::new(capacity));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read history {}", path.display()))?;
    let mut history: RingBuffer<ExecutionSummary> = serde_json::from_str(&contents)
        .with_context(|| format!("parse history {}", path.display()))?;
    history.resize(capacity);
    Ok(history)
}

/// Append `summary`, evicting the oldest entry once `capacity` is reached.
pub fn append_history(path: &Path, capacity: usize, summary: ExecutionSummary) -> Result<()> {
    let mut history = load_history(path, capacity)?;
    if let Some(evicted) = history.push(summary) {
        debug!(execution = %evicted.execution_id, "history entry evicted");
    }
    write_json_atomic(path, &history)
}

/// Allocate an id not yet used under `executions/`.
pub fn next_execution_id(paths: &ShipperPaths) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let base = format!("exec-{stamp}");
    let mut id = base.clone();
    let mut n = 1;
    while paths.execution_path(&id).exists() {
        n += 1;
        id = format!("{base}-{n}");
    }
    id
}
