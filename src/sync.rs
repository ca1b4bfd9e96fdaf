use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{CacheInfo, CatalogClient, RecordFilter};
use crate::domain::TableName;
use crate::error::{Advisory, OneError};
use crate::fs_util;
use crate::store::{CACHE_INFO_FILE, CacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Never contact the catalog.
    Local,
    /// Fetch on every refresh.
    Remote,
    /// Fetch only when the cache is stale.
    #[default]
    Auto,
    /// Fetch regardless of staleness.
    Refresh,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Remote => "remote",
            Mode::Auto => "auto",
            Mode::Refresh => "refresh",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "remote" => Ok(Mode::Remote),
            "auto" => Ok(Mode::Auto),
            "refresh" => Ok(Mode::Refresh),
            _ => Err(OneError::InvalidMode(value.to_string())),
        }
    }
}

/// Keeps a `CacheStore` in step with the remote catalog.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    cache_dir: Utf8PathBuf,
    tag: Option<String>,
    offline: bool,
    advisories: Vec<Advisory>,
}

impl Synchronizer {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            tag: None,
            offline: false,
            advisories: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn set_tag(&mut self, tag: Option<String>) {
        self.tag = tag;
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Where the tables live: the cache root, or `<cache>/<tag>` for tagged snapshots.
    pub fn tables_dir(&self) -> Utf8PathBuf {
        match &self.tag {
            Some(tag) => self.cache_dir.join(tag),
            None => self.cache_dir.clone(),
        }
    }

    /// True once a connection failure has switched this synchronizer to local mode.
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Advisories raised by the last refresh.
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn refresh(
        &mut self,
        catalog: &dyn CatalogClient,
        store: &mut CacheStore,
        mode: Mode,
    ) -> Result<Option<DateTime<Utc>>, OneError> {
        self.advisories.clear();
        let mode = if self.offline && mode == Mode::Auto {
            Mode::Local
        } else {
            mode
        };
        match mode {
            Mode::Local => return Ok(store.loaded_time()),
            Mode::Auto if !store.is_stale(Utc::now()) => {
                debug!("cache is fresh");
                return Ok(store.loaded_time());
            }
            Mode::Auto => {
                if let Some(loaded) = store.loaded_time() {
                    info!(loaded = %loaded, "cache over {:?} old", store.expiry());
                }
            }
            Mode::Remote | Mode::Refresh => {}
        }
        self.fetch(catalog, store)
    }

    fn fetch(
        &mut self,
        catalog: &dyn CatalogClient,
        store: &mut CacheStore,
    ) -> Result<Option<DateTime<Utc>>, OneError> {
        let tag = self.tag.clone();
        let info = match catalog.cache_info(tag.as_deref()) {
            Ok(info) => info,
            Err(err) => return self.degrade(err, store),
        };
        self.check_compatibility(&info, store)?;

        fs::create_dir_all(self.cache_dir.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        let scratch = tempfile::Builder::new()
            .prefix(".one-snapshot")
            .tempdir_in(self.cache_dir.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        let scratch_dir = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| OneError::Filesystem("non UTF-8 scratch path".to_string()))?;

        if let Err(err) = catalog.download_snapshot(tag.as_deref(), scratch.path()) {
            return self.degrade(err, store);
        }

        let mut fresh = CacheStore::new(store.expiry()).with_lock_settings(store.lock_settings());
        let loaded = fresh.load(scratch_dir)?;
        if let Some(Advisory::MissingTable { table }) = loaded.first() {
            return Err(OneError::Transfer(format!(
                "cache snapshot has no {table} table"
            )));
        }
        stamp_provenance(&mut fresh, &info, tag.as_deref());
        fresh.save(scratch_dir, true)?;

        let tables_dir = self.tables_dir();
        {
            let _lock = fs_util::acquire_lock(tables_dir.as_std_path(), &store.lock_settings())?;
            // sidecar last so a reader never sees provenance for tables not yet in place
            let files = [
                TableName::Sessions.file_name(),
                TableName::Datasets.file_name(),
                CACHE_INFO_FILE.to_string(),
            ];
            fs_util::install_files(scratch_dir, &tables_dir, &files)?;
        }
        store.replace(fresh, tables_dir.clone());
        self.offline = false;
        info!(%tables_dir, "installed remote cache snapshot");
        Ok(store.loaded_time())
    }

    fn degrade(
        &mut self,
        err: OneError,
        store: &mut CacheStore,
    ) -> Result<Option<DateTime<Utc>>, OneError> {
        match err {
            OneError::Connection(reason) | OneError::Transfer(reason) => {
                let advisory = Advisory::LocalFallback {
                    reason: format!("remote catalog unavailable: {reason}"),
                };
                warn!("{advisory}");
                self.advisories.push(advisory);
                self.offline = true;
                Ok(store.loaded_time())
            }
            OneError::HttpStatus { status, message } => {
                warn!(status, "Failed to load remote cache: {message}");
                Ok(store.loaded_time())
            }
            setup @ (OneError::MissingConfig | OneError::Configuration(_)) => {
                Err(OneError::Configuration(format!(
                    "remote catalog is not set up ({setup}); run `one setup`"
                )))
            }
            other => Err(other),
        }
    }

    fn check_compatibility(
        &mut self,
        info: &CacheInfo,
        store: &CacheStore,
    ) -> Result<(), OneError> {
        let current = env!("CARGO_PKG_VERSION");
        if let Some(required) = info.min_api_version.as_deref() {
            if compare_versions(required, current) == Ordering::Greater {
                let advisory = Advisory::OutdatedClient {
                    required: required.to_string(),
                    current: current.to_string(),
                };
                warn!("{advisory}");
                self.advisories.push(advisory);
            }
        }

        match self.tag.as_deref() {
            Some(tag) => {
                if !info.database_tags.iter().any(|remote| remote == tag) {
                    return Err(OneError::TagNotFound(tag.to_string()));
                }
            }
            None => {
                let local = store.meta().database_tags();
                let remote = info.database_tags.iter().cloned().collect::<BTreeSet<_>>();
                if !local.is_empty() && !info.database_tags.is_empty() && local != remote {
                    return Err(OneError::IncompatibleCache(format!(
                        "local tables were built from tags {local:?}, remote serves {remote:?}"
                    )));
                }
            }
        }

        if let Some(origin) = info.origin.as_deref() {
            let local = store.meta().origins();
            if !local.is_empty() && !local.contains(origin) {
                let advisory = Advisory::MixedOrigins {
                    local: local.into_iter().collect::<Vec<_>>().join(", "),
                    remote: origin.to_string(),
                };
                warn!("{advisory}");
                self.advisories.push(advisory);
            }
        }
        Ok(())
    }

    /// Fetches one session and its datasets and merges them into the store.
    pub fn update_session(
        &mut self,
        catalog: &dyn CatalogClient,
        store: &mut CacheStore,
        eid: &Uuid,
    ) -> Result<(), OneError> {
        let sessions = catalog.list_records(TableName::Sessions, RecordFilter::Session(*eid))?;
        if sessions.is_empty() {
            return Err(OneError::NotFound(format!("session {eid}")));
        }
        let datasets = catalog.list_records(TableName::Datasets, RecordFilter::Session(*eid))?;
        debug!(%eid, datasets = datasets.len(), "updating session records");
        store.merge(sessions, false)?;
        store.merge(datasets, false)?;
        Ok(())
    }
}

fn stamp_provenance(store: &mut CacheStore, info: &CacheInfo, tag: Option<&str>) {
    store.mark_loaded(Utc::now());
    let meta = store.meta_mut();
    meta.tag = tag.map(str::to_string);
    if meta.date_created.is_none() {
        meta.date_created = info.date_created;
    }
    for table in [TableName::Sessions, TableName::Datasets] {
        let entry = meta.tables.entry(table.as_str().to_string()).or_default();
        if entry.origin.is_none() {
            entry.origin = info.origin.clone();
        }
        if entry.min_api_version.is_none() {
            entry.min_api_version = info.min_api_version.clone();
        }
        if entry.database_tags.is_empty() {
            entry.database_tags = info.database_tags.clone();
        }
        if entry.date_created.is_none() {
            entry.date_created = info.date_created;
        }
    }
}

/// Compares dotted numeric versions; non-numeric suffixes such as `-rc1` are ignored.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |version: &str| -> Vec<u64> {
        version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                let digits = part
                    .chars()
                    .take_while(|ch| ch.is_ascii_digit())
                    .collect::<String>();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (mut left, mut right) = (parse(left), parse(right));
    let len = left.len().max(right.len());
    left.resize(len, 0);
    right.resize(len, 0);
    left.cmp(&right)
}
