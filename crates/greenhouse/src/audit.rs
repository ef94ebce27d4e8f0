//! Append-only CSV audit log of sample cycles and actuator events.
//!
//! One row per line, no header:
//! `time,kind,label,value,detail` where `kind` is `sample` or `event`.

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::sampler::SampleReport;

/// Timestamp layout of the `time` column.
pub const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Sample,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub time: String,
    pub kind: RowKind,
    pub label: String,
    pub value: u16,
    pub detail: String,
}

impl LogRow {
    pub fn sample(report: &SampleReport) -> Self {
        Self {
            time: report.time.format(TIME_FORMAT).to_string(),
            kind: RowKind::Sample,
            label: report.kind.to_string(),
            value: report.aggregate,
            detail: report
                .readings
                .iter()
                .map(|(id, v)| format!("{id}={v}"))
                .collect::<Vec<_>>()
                .join(";"),
        }
    }

    pub fn event(time: DateTime<Local>, label: &str, value: u16, detail: impl Into<String>) -> Self {
        Self {
            time: time.format(TIME_FORMAT).to_string(),
            kind: RowKind::Event,
            label: label.to_string(),
            value,
            detail: detail.into(),
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    path: Arc<PathBuf>,
    // Serialises appends from concurrent loops.
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &LogRow) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .serialize(row)
            .context("failed to encode audit row")?;
        writer
            .flush()
            .with_context(|| format!("failed to write audit log {}", self.path.display()))?;
        Ok(())
    }

    /// Append and log instead of propagating; a full disk must not stop
    /// the control loops.
    pub fn record(&self, row: &LogRow) {
        if let Err(e) = self.append(row) {
            tracing::error!("audit log append failed: {e:#}");
        }
    }

    /// The last `n` rows, newest first.  A missing file reads as empty.
    pub fn recent(&self, n: usize) -> anyhow::Result<Vec<LogRow>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(self.path.as_path())
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;

        let mut rows = Vec::new();
        for result in reader.deserialize::<LogRow>() {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!("skipping unreadable audit row: {e}"),
            }
        }

        let skip = rows.len().saturating_sub(n);
        Ok(rows.into_iter().skip(skip).rev().collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
