//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::memory::Responsiveness;
use crate::value::BusValue;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Bus monitor notification as recorded in a replay file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    DeviceAdded {
        service: String,
        instance: u32,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        values: BTreeMap<String, Option<BusValue>>,
    },
    DeviceRemoved {
        service: String,
    },
    Value {
        service: String,
        path: String,
        #[serde(default)]
        value: Option<BusValue>,
    },
    System {
        path: String,
        #[serde(default)]
        value: Option<BusValue>,
    },
    Responsiveness {
        service: String,
        mode: Responsiveness,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayRecord {
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(flatten)]
    pub event: MonitorEvent,
}

/// Read monitor events from a newline-delimited JSON file.
///
/// Each line holds one event object tagged by `event`, with an optional `delay_ms`
/// to wait before it is applied. Blank lines and lines starting with `#` are skipped.
pub fn read_replay<P: AsRef<Path>>(path: P) -> Result<Vec<ReplayRecord>, ReplayError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}
