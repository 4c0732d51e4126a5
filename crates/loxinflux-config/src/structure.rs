// ── Structure snapshot on disk ──
//
// `<data_dir>/structure.json`:
//
//   { "lastModified": "2026-01-01 12:00:00",
//     "devices": [ { "uuid": "..", "name": "..", "type": "..", ... } ] }

use std::path::{Path, PathBuf};

use loxinflux_core::{CoreError, Device, StructureIndex, StructureSource};
use serde::Deserialize;

pub const STRUCTURE_FILE: &str = "structure.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    last_modified: Option<String>,
    devices: Vec<Device>,
}

/// Reads the persisted structure snapshot on every load.
#[derive(Debug, Clone)]
pub struct FileStructureSource {
    path: PathBuf,
}

impl FileStructureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/structure.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STRUCTURE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl std::fmt::Display) -> CoreError {
        CoreError::Structure {
            message: format!("{}: {reason}", self.path.display()),
        }
    }
}

impl StructureSource for FileStructureSource {
    fn load(&self) -> Result<StructureIndex, CoreError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| self.error(e))?;
        let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|e| self.error(e))?;
        tracing::debug!(
            path = %self.path.display(),
            devices = snapshot.devices.len(),
            "structure snapshot read"
        );
        Ok(StructureIndex::new(snapshot.devices, snapshot.last_modified))
    }
}
