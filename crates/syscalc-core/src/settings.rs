//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::delegate::SettingSpec;
use crate::error::{HostError, Result};

#[derive(Debug, Clone)]
struct Entry {
    owner: &'static str,
    spec: SettingSpec,
    value: i64,
}

/// Bounded integer settings declared by the delegates, keyed by setting name.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    entries: IndexMap<&'static str, Entry>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a setting at its default. Names must be unique across delegates.
    pub fn declare(&mut self, owner: &'static str, spec: SettingSpec) -> Result<()> {
        if let Some(existing) = self.entries.get(spec.name) {
            return Err(HostError::DuplicateSetting {
                name: spec.name.to_owned(),
                first: existing.owner,
                second: owner,
            });
        }
        let value = spec.default.clamp(spec.min, spec.max);
        self.entries.insert(spec.name, Entry { owner, spec, value });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries.get(name).map(|entry| entry.value)
    }

    /// Store a value clamped to the setting's bounds and return what was stored.
    pub fn set(&mut self, name: &str, value: i64) -> Result<i64> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| HostError::UnknownSetting(name.to_owned()))?;
        let clamped = value.clamp(entry.spec.min, entry.spec.max);
        if clamped != value {
            warn!(setting = name, requested = value, stored = clamped, "setting clamped to bounds");
        }
        debug!(setting = name, value = clamped, "setting updated");
        entry.value = clamped;
        Ok(clamped)
    }

    /// Setting name registered under a settings-store path.
    pub fn name_for_path(&self, path: &str) -> Option<&'static str> {
        self.entries
            .values()
            .find(|entry| entry.spec.path == path)
            .map(|entry| entry.spec.name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &SettingSpec> {
        self.entries.values().map(|entry| &entry.spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
