#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use one_client::backend::{Backend, BackendKind};
use one_client::catalog::{CacheInfo, CatalogClient, RecordFilter};
use one_client::config::{Config, ConfigLoader, EnvOverrides, ResolvedConfig};
use one_client::domain::{DatasetRecord, Qc, SessionRecord, TableName};
use one_client::error::OneError;
use one_client::store::TableUpdate;

pub fn utf8_tempdir() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, path)
}

pub fn resolved_config(cache_dir: &Utf8Path) -> ResolvedConfig {
    let mut config = Config::new("https://catalog.example.org");
    config.cache_dir = Some(cache_dir.to_path_buf());
    ConfigLoader::resolve_config(config, EnvOverrides::default()).unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn session(id: u128, subject: &str, date: &str, number: u32) -> SessionRecord {
    SessionRecord {
        id: Uuid::from_u128(id),
        lab: "cortexlab".to_string(),
        subject: subject.to_string(),
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        number,
        task_protocol: "_iblrig_tasks_biasedChoiceWorld6.4.2".to_string(),
        projects: vec!["ibl_neuropixel_brainwide_01".to_string()],
        start_time: None,
        end_time: None,
        qc: Qc::NotSet,
        extra: Default::default(),
    }
}

/// A record that exists remotely, with size and hash of `content`.
pub fn dataset(eid: &SessionRecord, id: u128, rel_path: &str, content: &[u8]) -> DatasetRecord {
    let mut record = DatasetRecord::new(eid.id, Uuid::from_u128(id), rel_path);
    record.file_size = Some(content.len() as u64);
    record.hash = Some(sha256_hex(content));
    record.exists = true;
    record
}

/// Bare record for selection tests.
pub fn row(eid: u128, id: u128, rel_path: &str) -> DatasetRecord {
    let mut record = DatasetRecord::new(Uuid::from_u128(eid), Uuid::from_u128(id), rel_path);
    record.exists = true;
    record
}

pub fn write_tables(dir: &Utf8Path, sessions: &[SessionRecord], datasets: &[DatasetRecord]) {
    std::fs::create_dir_all(dir.as_std_path()).unwrap();
    std::fs::write(
        dir.join(TableName::Sessions.file_name()).as_std_path(),
        serde_json::to_vec(sessions).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join(TableName::Datasets.file_name()).as_std_path(),
        serde_json::to_vec(datasets).unwrap(),
    )
    .unwrap();
}

pub fn connection_error() -> OneError {
    OneError::Connection("connection refused".to_string())
}

pub fn server_error() -> OneError {
    OneError::HttpStatus {
        status: 500,
        message: "internal error".to_string(),
    }
}

pub struct MockCatalog {
    pub info: CacheInfo,
    pub info_error: Option<fn() -> OneError>,
    pub snapshot_error: Option<fn() -> OneError>,
    pub sessions: Vec<SessionRecord>,
    pub datasets: Vec<DatasetRecord>,
    pub info_calls: Mutex<usize>,
    pub snapshot_calls: Mutex<usize>,
    pub list_calls: Mutex<usize>,
    pub flagged: Mutex<Vec<Uuid>>,
}

impl MockCatalog {
    pub fn new(sessions: Vec<SessionRecord>, datasets: Vec<DatasetRecord>) -> Self {
        Self {
            info: CacheInfo {
                min_api_version: Some("0.0.1".to_string()),
                database_tags: Vec::new(),
                origin: Some("alyx".to_string()),
                date_created: None,
            },
            info_error: None,
            snapshot_error: None,
            sessions,
            datasets,
            info_calls: Mutex::new(0),
            snapshot_calls: Mutex::new(0),
            list_calls: Mutex::new(0),
            flagged: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.info.database_tags = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn failing(mut self, error: fn() -> OneError) -> Self {
        self.info_error = Some(error);
        self
    }

    pub fn snapshots(&self) -> usize {
        *self.snapshot_calls.lock().unwrap()
    }

    pub fn flagged(&self) -> Vec<Uuid> {
        self.flagged.lock().unwrap().clone()
    }
}

impl CatalogClient for MockCatalog {
    fn cache_info(&self, _tag: Option<&str>) -> Result<CacheInfo, OneError> {
        *self.info_calls.lock().unwrap() += 1;
        match self.info_error {
            Some(error) => Err(error()),
            None => Ok(self.info.clone()),
        }
    }

    fn list_records(
        &self,
        table: TableName,
        filter: RecordFilter,
    ) -> Result<TableUpdate, OneError> {
        *self.list_calls.lock().unwrap() += 1;
        let keep = |eid: &Uuid| match filter {
            RecordFilter::All => true,
            RecordFilter::Session(wanted) => *eid == wanted,
        };
        Ok(match table {
            TableName::Sessions => TableUpdate::Sessions(
                self.sessions
                    .iter()
                    .filter(|session| keep(&session.id))
                    .cloned()
                    .collect(),
            ),
            TableName::Datasets => TableUpdate::Datasets(
                self.datasets
                    .iter()
                    .filter(|record| keep(&record.eid))
                    .cloned()
                    .collect(),
            ),
        })
    }

    fn read_record(&self, table: TableName, id: &Uuid) -> Result<Value, OneError> {
        let found = match table {
            TableName::Sessions => self
                .sessions
                .iter()
                .find(|session| session.id == *id)
                .map(|session| serde_json::to_value(session).unwrap()),
            TableName::Datasets => self
                .datasets
                .iter()
                .find(|record| record.id == *id)
                .map(|record| serde_json::to_value(record).unwrap()),
        };
        found.ok_or_else(|| OneError::NotFound(id.to_string()))
    }

    fn download_snapshot(
        &self,
        _tag: Option<&str>,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, OneError> {
        *self.snapshot_calls.lock().unwrap() += 1;
        if let Some(error) = self.snapshot_error {
            return Err(error());
        }
        let dir = Utf8Path::from_path(destination).unwrap();
        write_tables(dir, &self.sessions, &self.datasets);
        Ok(vec![
            destination.join(TableName::Sessions.file_name()),
            destination.join(TableName::Datasets.file_name()),
        ])
    }

    fn flag_mismatch(&self, dataset_id: &Uuid) -> Result<(), OneError> {
        self.flagged.lock().unwrap().push(*dataset_id);
        Ok(())
    }
}

/// In-memory backend serving `session_path/rel_path` keys.
pub struct MockBackend {
    pub name: String,
    pub kind: BackendKind,
    pub files: HashMap<String, Vec<u8>>,
    pub offline: bool,
    pub delay: Option<Duration>,
    pub requested: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn http() -> Self {
        Self::new("http", BackendKind::Http)
    }

    pub fn object_store(name: &str) -> Self {
        Self::new(name, BackendKind::ObjectStore)
    }

    fn new(name: &str, kind: BackendKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            files: HashMap::new(),
            offline: false,
            delay: None,
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn serve(mut self, session: &SessionRecord, rel_path: &str, content: &[u8]) -> Self {
        self.files.insert(
            format!("{}/{rel_path}", session.session_path()),
            content.to_vec(),
        );
        self
    }

    /// Handle on the request log that survives boxing the backend.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.requested)
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn source_url(&self, session_path: &str, record: &DatasetRecord) -> Result<String, OneError> {
        Ok(format!("mock://{}/{session_path}/{}", self.name, record.rel_path))
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, OneError> {
        self.requested.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.offline {
            return Err(connection_error());
        }
        let key = url
            .strip_prefix(&format!("mock://{}/", self.name))
            .unwrap_or(url);
        let Some(content) = self.files.get(key) else {
            return Err(OneError::HttpStatus {
                status: 404,
                message: "Not Found".to_string(),
            });
        };
        sink.write_all(content)
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        Ok(content.len() as u64)
    }
}
