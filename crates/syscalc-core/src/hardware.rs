//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Text-file backed GPIO channels.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unexpected content {content:?} in {path}")]
    Parse { path: PathBuf, content: String },
}

/// GPIO directories listed in `list_file`, whitespace separated.
///
/// A missing or unreadable list means no channels.
pub fn gpio_paths(list_file: &Path) -> Vec<PathBuf> {
    match fs::read_to_string(list_file) {
        Ok(contents) => contents.split_whitespace().map(PathBuf::from).collect(),
        Err(err) => {
            debug!(list = %list_file.display(), error = %err, "gpio list not readable");
            Vec::new()
        }
    }
}

/// The `value` file of one GPIO channel, holding `"0"` or `"1"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareFile {
    path: PathBuf,
}

impl HardwareFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Channel file inside a GPIO directory.
    pub fn in_gpio_dir(dir: &Path) -> Self {
        Self::new(dir.join("value"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_state(&self) -> Result<i64, HardwareError> {
        let content = fs::read_to_string(&self.path).map_err(|source| HardwareError::Io {
            path: self.path.clone(),
            source,
        })?;
        content
            .trim()
            .parse::<i64>()
            .map_err(|_| HardwareError::Parse {
                path: self.path.clone(),
                content: content.trim().to_owned(),
            })
    }

    /// Replace the file content with the single token `"1"` or `"0"`.
    pub fn write_state(&self, on: bool) -> Result<(), HardwareError> {
        fs::write(&self.path, if on { "1" } else { "0" }).map_err(|source| HardwareError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
