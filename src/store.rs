use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{DatasetKey, DatasetRecord, EXISTS_PREFIX, SessionRecord, TableName};
use crate::error::{Advisory, OneError};
use crate::fs_util::{self, LOCK_FILE, LockSettings};

pub const CACHE_INFO_FILE: &str = "cache_info.json";

const TABLES: [TableName; 2] = [TableName::Sessions, TableName::Datasets];

/// Provenance of one cache table, as reported by the catalog that built it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub min_api_version: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub database_tags: Vec<String>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_modified: Option<DateTime<Utc>>,
    /// Columns beyond the fixed record fields, in schema order.
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Contents of `cache_info.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_modified: Option<DateTime<Utc>>,
    /// When these tables were last fetched from the catalog.
    #[serde(default)]
    pub loaded_time: Option<DateTime<Utc>>,
    /// Expiry in force when the tables were last saved. The configured expiry still wins
    /// on load.
    #[serde(default)]
    pub expiry_secs: Option<u64>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableInfo>,
}

impl CacheMeta {
    pub fn table(&self, table: TableName) -> Option<&TableInfo> {
        self.tables.get(table.as_str())
    }

    /// Union of the database tags of every table.
    pub fn database_tags(&self) -> BTreeSet<String> {
        self.tables
            .values()
            .flat_map(|info| info.database_tags.iter().cloned())
            .collect()
    }

    pub fn origins(&self) -> BTreeSet<String> {
        self.tables
            .values()
            .filter_map(|info| info.origin.clone())
            .collect()
    }
}

/// What to do with an `exists_*` schema column an incoming dataset record does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillRule {
    /// Copy the record's generic `exists` value.
    #[default]
    FromGenericExists,
    /// Leave the column unknown.
    Unknown,
}

#[derive(Debug, Clone)]
pub enum TableUpdate {
    Sessions(Vec<SessionRecord>),
    Datasets(Vec<DatasetRecord>),
}

impl TableUpdate {
    pub fn table(&self) -> TableName {
        match self {
            TableUpdate::Sessions(_) => TableName::Sessions,
            TableUpdate::Datasets(_) => TableName::Datasets,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableUpdate::Sessions(records) => records.len(),
            TableUpdate::Datasets(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    sessions: BTreeMap<Uuid, SessionRecord>,
    datasets: BTreeMap<DatasetKey, DatasetRecord>,
    columns: BTreeMap<TableName, Vec<String>>,
    meta: CacheMeta,
    tables_dir: Option<Utf8PathBuf>,
    loaded_time: Option<DateTime<Utc>>,
    modified_time: Option<DateTime<Utc>>,
    expired: bool,
    dirty: bool,
    expiry: Duration,
    lock: LockSettings,
    backfill: BackfillRule,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl CacheStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            sessions: BTreeMap::new(),
            datasets: BTreeMap::new(),
            columns: BTreeMap::new(),
            meta: CacheMeta::default(),
            tables_dir: None,
            loaded_time: None,
            modified_time: None,
            expired: false,
            dirty: false,
            expiry,
            lock: LockSettings::default(),
            backfill: BackfillRule::default(),
        }
    }

    pub fn with_lock_settings(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_backfill(mut self, backfill: BackfillRule) -> Self {
        self.backfill = backfill;
        self
    }

    /// Replaces the in-memory tables with the ones persisted in `dir`.
    pub fn load(&mut self, dir: &Utf8Path) -> Result<Vec<Advisory>, OneError> {
        let mut advisories = Vec::new();
        let meta = read_meta(dir)?;
        let mut sessions = BTreeMap::new();
        let mut datasets = BTreeMap::new();
        let mut columns = BTreeMap::new();
        let mut missing = false;

        for table in TABLES {
            let path = dir.join(table.file_name());
            if !path.as_std_path().is_file() {
                let advisory = Advisory::MissingTable {
                    table: table.to_string(),
                };
                warn!(%path, "{advisory}");
                advisories.push(advisory);
                missing = true;
                continue;
            }
            match table {
                TableName::Sessions => {
                    let rows: Vec<SessionRecord> = read_table(&path, table, &["id"])?;
                    let schema = schema_columns(&meta, table, rows.iter().map(|row| &row.extra));
                    columns.insert(table, schema);
                    sessions = rows.into_iter().map(|row| (row.id, row)).collect();
                }
                TableName::Datasets => {
                    let rows: Vec<DatasetRecord> = read_table(&path, table, &["eid", "id"])?;
                    let schema = schema_columns(&meta, table, rows.iter().map(|row| &row.extra));
                    columns.insert(table, schema);
                    datasets = rows.into_iter().map(|row| (row.key(), row)).collect();
                }
            }
        }
        warn_unrecognised(dir);

        let loaded_time = if columns.is_empty() {
            None
        } else {
            meta.loaded_time
                .or(meta.date_created)
                .or_else(|| file_modified(&dir.join(TableName::Sessions.file_name())))
        };
        self.sessions = sessions;
        self.datasets = datasets;
        self.columns = columns;
        self.meta = meta;
        self.tables_dir = Some(dir.to_path_buf());
        self.loaded_time = loaded_time;
        self.modified_time = None;
        self.expired = missing;
        self.dirty = false;
        info!(
            %dir,
            sessions = self.sessions.len(),
            datasets = self.datasets.len(),
            "loaded cache tables"
        );
        Ok(advisories)
    }

    /// Upserts records by key. With `strict`, incoming columns the schema does not
    /// already have are rejected.
    pub fn merge(&mut self, update: TableUpdate, strict: bool) -> Result<(), OneError> {
        let table = update.table();
        if update.is_empty() {
            return Ok(());
        }
        let schema = self.columns.entry(table).or_default();
        let incoming = match &update {
            TableUpdate::Sessions(records) => extra_columns(records.iter().map(|row| &row.extra)),
            TableUpdate::Datasets(records) => extra_columns(records.iter().map(|row| &row.extra)),
        };
        let added = incoming
            .into_iter()
            .filter(|column| !schema.contains(column))
            .collect::<Vec<_>>();
        if strict && !added.is_empty() {
            return Err(OneError::SchemaMismatch {
                table: table.to_string(),
                columns: added.join(", "),
            });
        }
        schema.extend(added);

        let count = update.len();
        match update {
            TableUpdate::Sessions(records) => {
                for record in records {
                    self.sessions.insert(record.id, record);
                }
            }
            TableUpdate::Datasets(records) => {
                let exists_columns = schema
                    .iter()
                    .filter_map(|column| column.strip_prefix(EXISTS_PREFIX))
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                for mut record in records {
                    if self.backfill == BackfillRule::FromGenericExists {
                        for backend in &exists_columns {
                            if record.backend_exists(backend).is_none() {
                                record.set_backend_exists(backend, record.exists);
                            }
                        }
                    }
                    self.datasets.insert(record.key(), record);
                }
            }
        }
        self.touch();
        debug!(%table, records = count, "merged records into cache");
        Ok(())
    }

    /// Sets the generic `exists` flag, or the `exists_<backend>` flag when a backend is
    /// named. Returns false when the record is not in the cache.
    pub fn set_exists(&mut self, key: &DatasetKey, backend: Option<&str>, value: bool) -> bool {
        let Some(record) = self.datasets.get_mut(key) else {
            return false;
        };
        match backend {
            None => {
                if record.exists == value {
                    return true;
                }
                record.exists = value;
            }
            Some(name) => {
                if record.backend_exists(name) == Some(value) {
                    return true;
                }
                record.set_backend_exists(name, value);
                let column = format!("{EXISTS_PREFIX}{name}");
                let schema = self.columns.entry(TableName::Datasets).or_default();
                if !schema.contains(&column) {
                    schema.push(column);
                }
            }
        }
        self.touch();
        true
    }

    /// Records a fresh fetch from the catalog; persisted with the sidecar on the next
    /// save.
    pub fn mark_loaded(&mut self, at: DateTime<Utc>) {
        self.meta.loaded_time = Some(at);
        self.loaded_time = Some(at);
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.expired {
            return true;
        }
        let Some(loaded) = self.loaded_time else {
            return true;
        };
        match (now - loaded).to_std() {
            Ok(age) => age > self.expiry,
            Err(_) => false,
        }
    }

    /// Writes the tables and sidecar to `dir` when they changed since the last load or
    /// save, or unconditionally with `force`.
    pub fn save(&mut self, dir: &Utf8Path, force: bool) -> Result<Vec<Utf8PathBuf>, OneError> {
        if !force && !self.dirty {
            debug!(%dir, "cache unchanged, skipping save");
            return Ok(Vec::new());
        }
        let _lock = fs_util::acquire_lock(dir.as_std_path(), &self.lock)?;

        let now = Utc::now();
        for table in TABLES {
            let info = self.meta.tables.entry(table.as_str().to_string()).or_default();
            info.columns = self.columns.get(&table).cloned().unwrap_or_default();
            if self.dirty {
                info.date_modified = Some(now);
            }
        }
        if self.dirty {
            self.meta.date_modified = Some(now);
        }
        self.meta.expiry_secs = Some(self.expiry.as_secs());

        let mut written = Vec::new();
        let sessions = self.sessions.values().collect::<Vec<_>>();
        written.push(write_json(&dir.join(TableName::Sessions.file_name()), &sessions)?);
        let datasets = self.datasets.values().collect::<Vec<_>>();
        written.push(write_json(&dir.join(TableName::Datasets.file_name()), &datasets)?);
        written.push(write_json(&dir.join(CACHE_INFO_FILE), &self.meta)?);

        self.dirty = false;
        if self.tables_dir.is_none() {
            self.tables_dir = Some(dir.to_path_buf());
        }
        info!(%dir, files = written.len(), "saved cache tables");
        Ok(written)
    }

    /// Swaps in freshly loaded tables, keeping this store's settings.
    pub fn replace(&mut self, fresh: CacheStore, tables_dir: Utf8PathBuf) {
        self.sessions = fresh.sessions;
        self.datasets = fresh.datasets;
        self.columns = fresh.columns;
        self.meta = fresh.meta;
        self.loaded_time = fresh.loaded_time.or_else(|| Some(Utc::now()));
        self.modified_time = None;
        self.expired = fresh.expired;
        self.dirty = false;
        self.tables_dir = Some(tables_dir);
    }

    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    pub fn session(&self, eid: &Uuid) -> Option<&SessionRecord> {
        self.sessions.get(eid)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.values()
    }

    pub fn dataset(&self, key: &DatasetKey) -> Option<&DatasetRecord> {
        self.datasets.get(key)
    }

    pub fn datasets(&self) -> impl Iterator<Item = &DatasetRecord> {
        self.datasets.values()
    }

    pub fn datasets_for(&self, eid: &Uuid) -> impl Iterator<Item = &DatasetRecord> {
        let lower = DatasetKey {
            eid: *eid,
            id: Uuid::nil(),
        };
        let upper = DatasetKey {
            eid: *eid,
            id: Uuid::from_u128(u128::MAX),
        };
        self.datasets.range(lower..=upper).map(|(_, record)| record)
    }

    pub fn columns(&self, table: TableName) -> &[String] {
        self.columns.get(&table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn meta(&self) -> &CacheMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut CacheMeta {
        &mut self.meta
    }

    pub fn tables_dir(&self) -> Option<&Utf8Path> {
        self.tables_dir.as_deref()
    }

    pub fn loaded_time(&self) -> Option<DateTime<Utc>> {
        self.loaded_time
    }

    pub fn modified_time(&self) -> Option<DateTime<Utc>> {
        self.modified_time
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn lock_settings(&self) -> LockSettings {
        self.lock
    }

    pub fn set_expiry(&mut self, expiry: Duration) {
        self.expiry = expiry;
    }

    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.datasets.is_empty()
    }

    fn touch(&mut self) {
        self.modified_time = Some(Utc::now());
        self.dirty = true;
    }
}

fn read_meta(dir: &Utf8Path) -> Result<CacheMeta, OneError> {
    let path = dir.join(CACHE_INFO_FILE);
    if !path.as_std_path().is_file() {
        return Ok(CacheMeta::default());
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| OneError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| OneError::Filesystem(format!("parse {path}: {err}")))
}

fn read_table<T: DeserializeOwned>(
    path: &Utf8Path,
    table: TableName,
    identity: &[&str],
) -> Result<Vec<T>, OneError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| OneError::Filesystem(format!("read {path}: {err}")))?;
    let rows: Vec<Value> = serde_json::from_str(&content)
        .map_err(|err| OneError::Filesystem(format!("parse {path}: {err}")))?;
    rows.into_iter()
        .map(|row| {
            if let Some(column) = identity.iter().find(|column| row.get(**column).is_none()) {
                return Err(OneError::MissingIdentityColumns {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            serde_json::from_value(row)
                .map_err(|err| OneError::Filesystem(format!("parse {path}: {err}")))
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<Utf8PathBuf, OneError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| OneError::Filesystem(err.to_string()))?;
    fs_util::write_atomic(path, &content)?;
    Ok(path.to_path_buf())
}

fn extra_columns<'a>(maps: impl Iterator<Item = &'a BTreeMap<String, Value>>) -> Vec<String> {
    let mut columns = Vec::new();
    for map in maps {
        for key in map.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn schema_columns<'a>(
    meta: &CacheMeta,
    table: TableName,
    maps: impl Iterator<Item = &'a BTreeMap<String, Value>>,
) -> Vec<String> {
    let mut columns = meta
        .table(table)
        .map(|info| info.columns.clone())
        .unwrap_or_default();
    for column in extra_columns(maps) {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns
}

fn file_modified(path: &Utf8Path) -> Option<DateTime<Utc>> {
    fs::metadata(path.as_std_path())
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn warn_unrecognised(dir: &Utf8Path) {
    let Ok(entries) = dir.read_dir_utf8() else {
        return;
    };
    let known = [
        TableName::Sessions.file_name(),
        TableName::Datasets.file_name(),
        CACHE_INFO_FILE.to_string(),
        LOCK_FILE.to_string(),
    ];
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_file = entry.file_type().map(|kind| kind.is_file()).unwrap_or(false);
        if is_file && name.ends_with(".json") && !known.iter().any(|known| known == name) {
            warn!(file = name, "ignoring unrecognised table {name}");
        }
    }
}

pub(crate) fn one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(tag)) => vec![tag],
        Some(Raw::Many(tags)) => tags,
    })
}
