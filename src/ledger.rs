use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::DatasetKey;
use crate::error::OneError;
use crate::fs_util;

/// Datasets materialized through an `App`, kept only when recording is switched on.
#[derive(Debug, Clone, Default)]
pub struct LoadedLedger {
    enabled: bool,
    loaded: Vec<DatasetKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerExport {
    pub ids: Vec<Uuid>,
    pub file: Option<Utf8PathBuf>,
}

#[derive(Serialize)]
struct DatasetRow {
    dataset_uuid: Uuid,
}

#[derive(Serialize)]
struct SessionRow {
    session_uuid: Uuid,
}

impl LoadedLedger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            loaded: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn record(&mut self, keys: impl IntoIterator<Item = DatasetKey>) {
        if !self.enabled {
            return;
        }
        for key in keys {
            if !self.loaded.contains(&key) {
                self.loaded.push(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn dataset_ids(&self) -> Vec<Uuid> {
        self.loaded.iter().map(|key| key.id).collect()
    }

    /// Distinct session ids in first-loaded order.
    pub fn session_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for key in &self.loaded {
            if !ids.contains(&key.eid) {
                ids.push(key.eid);
            }
        }
        ids
    }

    pub fn clear(&mut self) {
        self.loaded.clear();
    }

    /// Writes the recorded ids as a one-column CSV into `dir`. An empty ledger writes
    /// nothing.
    pub fn export(
        &mut self,
        dir: &Utf8Path,
        sessions_only: bool,
        clear: bool,
    ) -> Result<LedgerExport, OneError> {
        if self.loaded.is_empty() {
            warn!("no datasets loaded; nothing to save");
            return Ok(LedgerExport {
                ids: Vec::new(),
                file: None,
            });
        }

        let (ids, kind) = if sessions_only {
            (self.session_ids(), "session")
        } else {
            (self.dataset_ids(), "dataset")
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        for id in &ids {
            let written = if sessions_only {
                writer.serialize(SessionRow { session_uuid: *id })
            } else {
                writer.serialize(DatasetRow { dataset_uuid: *id })
            };
            written.map_err(|err| OneError::Filesystem(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| OneError::Filesystem(err.into_error().to_string()))?;

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        let file = dir.join(format!("{stamp}_loaded_{kind}_uuids.csv"));
        fs_util::write_atomic(&file, &bytes)?;
        info!(%file, count = ids.len(), "saved loaded {kind} ids");

        if clear {
            self.clear();
        }
        Ok(LedgerExport {
            ids,
            file: Some(file),
        })
    }
}
