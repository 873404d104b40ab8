use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Failing rows of one routine within one series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcLogRecord {
    pub parameter: Vec<String>,
    pub pressure: Vec<Option<f64>>,
    pub parameter_data: Vec<Option<f64>>,
    pub info: Vec<String>,
}

/// One failing row as reported by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct QcLogEntry {
    pub parameter: String,
    pub pressure: Option<f64>,
    pub value: Option<f64>,
    pub info: String,
}

/// Run log: series id → routine name → failing rows.
///
/// Owned by one session; cleared with `reset` and written with `write`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QcLog {
    series: BTreeMap<String, BTreeMap<String, QcLogRecord>>,
}

impl QcLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, series: &str, routine: &str, entry: QcLogEntry) {
        let record = self
            .series
            .entry(series.to_string())
            .or_default()
            .entry(routine.to_string())
            .or_default();
        record.parameter.push(entry.parameter);
        record.pressure.push(entry.pressure);
        record.parameter_data.push(entry.value);
        record.info.push(entry.info);
    }

    pub fn get(&self, series: &str, routine: &str) -> Option<&QcLogRecord> {
        self.series.get(series)?.get(routine)
    }

    pub fn series(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn reset(&mut self) {
        self.series.clear();
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        info!("QC log written to {}", path.display());
        Ok(())
    }
}
