use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alf::{DatasetSelector, Field, FieldSelector, Pattern, Scope};
use crate::backend::{Backend, HttpBackend, ObjectStoreBackend};
use crate::catalog::CatalogClient;
use crate::config::ResolvedConfig;
use crate::domain::{
    DatasetKey, DatasetRecord, DateRange, Qc, SessionRecord, SessionRef, TableName,
};
use crate::download::{DownloadRequest, Downloader, MaterializeOptions, Materialized};
use crate::error::{Advisory, OneError};
use crate::filter::{self, FilterOptions};
use crate::ledger::{LedgerExport, LoadedLedger};
use crate::store::{CacheStore, TableUpdate};
use crate::sync::{Mode, Synchronizer};

/// Session search criteria; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub subject: Option<String>,
    pub lab: Option<String>,
    pub date_range: Option<DateRange>,
    pub number: Option<u32>,
    /// Substring of the task protocol.
    pub task_protocol: Option<String>,
    /// Substring of any project name.
    pub project: Option<String>,
    /// Every pattern must match the filename of an existing dataset of the session.
    pub datasets: Vec<String>,
}

/// Best-effort listing of dataset records.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub dataset: DatasetSelector,
    pub collection: Option<String>,
    pub revision: Option<String>,
    pub revision_last_before: bool,
    pub qc_threshold: Qc,
    pub ignore_qc_not_set: bool,
    pub include_missing: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            dataset: DatasetSelector::Any,
            collection: None,
            revision: None,
            revision_last_before: false,
            qc_threshold: Qc::Critical,
            ignore_qc_not_set: false,
            include_missing: false,
        }
    }
}

/// One dataset to resolve uniquely within a session.
#[derive(Debug, Clone, Default)]
pub struct DatasetQuery {
    pub dataset: DatasetSelector,
    pub collection: Option<String>,
    pub revision: Option<String>,
}

impl DatasetQuery {
    pub fn new(dataset: impl Into<DatasetSelector>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: None,
            revision: None,
        }
    }

    pub fn in_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    pub fn at_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    fn describe(&self) -> String {
        let name = match &self.dataset {
            DatasetSelector::Any => "*".to_string(),
            DatasetSelector::Name(name) => name.clone(),
            DatasetSelector::Names(names) => names.join("|"),
            DatasetSelector::Fields(fields) => format!("{fields:?}"),
        };
        match &self.collection {
            Some(collection) if !collection.is_empty() => format!("{collection}/{name}"),
            _ => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Embed the dataset UUID in the local filename.
    pub keep_uuid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub mode: Mode,
    pub loaded_time: Option<DateTime<Utc>>,
    pub advisories: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub eid: Uuid,
    pub files: Vec<Option<Utf8PathBuf>>,
    pub advisories: Vec<String>,
}

/// Cache handle tying the store, the catalog and the delivery backends together.
pub struct App<C: CatalogClient> {
    config: ResolvedConfig,
    catalog: C,
    backends: Vec<Box<dyn Backend>>,
    store: CacheStore,
    sync: Synchronizer,
    ledger: LoadedLedger,
    wildcards: bool,
}

impl<C: CatalogClient> App<C> {
    pub fn new(config: ResolvedConfig, catalog: C, backends: Vec<Box<dyn Backend>>) -> Self {
        let store = CacheStore::new(config.cache_expiry).with_lock_settings(config.lock);
        let sync = Synchronizer::new(config.cache_dir.clone()).with_tag(config.tag.clone());
        let ledger = LoadedLedger::new(config.record_loaded);
        Self {
            config,
            catalog,
            backends,
            store,
            sync,
            ledger,
            wildcards: false,
        }
    }

    /// Builds the app, loads the persisted tables and refreshes per the configured mode.
    pub fn open(
        config: ResolvedConfig,
        catalog: C,
        backends: Vec<Box<dyn Backend>>,
    ) -> Result<Self, OneError> {
        let mode = config.mode;
        let mut app = Self::new(config, catalog, backends);
        app.load_cache()?;
        app.refresh(mode)?;
        Ok(app)
    }

    /// Object store first when configured, then the HTTP data server.
    pub fn default_backends(config: &ResolvedConfig) -> Result<Vec<Box<dyn Backend>>, OneError> {
        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        if let Some(url) = &config.object_store_url {
            backends.push(Box::new(ObjectStoreBackend::new("aws", url)?));
        }
        backends.push(Box::new(HttpBackend::new(&config.data_server)?));
        Ok(backends)
    }

    pub fn with_wildcards(mut self, wildcards: bool) -> Self {
        self.wildcards = wildcards;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CacheStore {
        &mut self.store
    }

    pub fn ledger(&self) -> &LoadedLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut LoadedLedger {
        &mut self.ledger
    }

    pub fn load_cache(&mut self) -> Result<Vec<Advisory>, OneError> {
        let dir = self.sync.tables_dir();
        self.store.load(&dir)
    }

    pub fn refresh(&mut self, mode: Mode) -> Result<RefreshResult, OneError> {
        let loaded_time = self.sync.refresh(&self.catalog, &mut self.store, mode)?;
        Ok(RefreshResult {
            mode,
            loaded_time,
            advisories: self
                .sync
                .advisories()
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    pub fn save(&mut self) -> Result<Vec<Utf8PathBuf>, OneError> {
        let dir = self
            .store
            .tables_dir()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_else(|| self.sync.tables_dir());
        self.store.save(&dir, false)
    }

    /// Resolves a UUID or a `subject/date/number` reference to a session eid.
    pub fn to_eid(&self, reference: &str) -> Result<Uuid, OneError> {
        match reference.parse::<SessionRef>()? {
            SessionRef::Eid(eid) => Ok(eid),
            SessionRef::Triple {
                subject,
                date,
                number,
            } => {
                let matches = self
                    .store
                    .sessions()
                    .filter(|session| {
                        session.subject == subject
                            && session.date == date
                            && session.number == number
                    })
                    .map(|session| session.id)
                    .collect::<Vec<_>>();
                match matches.as_slice() {
                    [] => Err(OneError::NotFound(format!("session {reference}"))),
                    [eid] => Ok(*eid),
                    _ => Err(OneError::MultipleObjectsFound(format!(
                        "{} sessions match {reference}",
                        matches.len()
                    ))),
                }
            }
        }
    }

    /// Sessions matching every criterion, newest first.
    pub fn search(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, OneError> {
        let patterns = query
            .datasets
            .iter()
            .map(|pattern| Pattern::compile(pattern, self.wildcards, Scope::Filename))
            .collect::<Result<Vec<_>, _>>()?;

        let mut sessions = self
            .store
            .sessions()
            .filter(|session| {
                query.subject.as_ref().is_none_or(|subject| &session.subject == subject)
                    && query.lab.as_ref().is_none_or(|lab| &session.lab == lab)
                    && query.number.is_none_or(|number| session.number == number)
                    && query
                        .date_range
                        .is_none_or(|range| range.contains(session.date))
                    && query
                        .task_protocol
                        .as_ref()
                        .is_none_or(|protocol| session.task_protocol.contains(protocol.as_str()))
                    && query.project.as_ref().is_none_or(|project| {
                        session
                            .projects
                            .iter()
                            .any(|name| name.contains(project.as_str()))
                    })
            })
            .filter(|session| {
                patterns.iter().all(|pattern| {
                    self.store
                        .datasets_for(&session.id)
                        .any(|record| record.exists && pattern.is_match(record.filename()))
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.date.cmp(&a.date).then(b.number.cmp(&a.number)));
        debug!(matches = sessions.len(), "session search");
        Ok(sessions)
    }

    pub fn get_details(&self, eid: &Uuid) -> Result<SessionRecord, OneError> {
        self.store
            .session(eid)
            .cloned()
            .ok_or_else(|| OneError::NotFound(format!("session {eid}")))
    }

    pub fn list_datasets(
        &self,
        eid: Option<&Uuid>,
        query: &ListQuery,
    ) -> Result<Vec<DatasetRecord>, OneError> {
        let options = FilterOptions {
            assert_unique: false,
            ignore_qc_not_set: query.ignore_qc_not_set,
            qc_threshold: query.qc_threshold,
            wildcards: self.wildcards,
            revision_last_before: query.revision_last_before,
            assert_consistent: false,
        };
        let candidates = self
            .candidates(eid)
            .filter(|record| query.include_missing || record.exists)
            .collect::<Vec<_>>();
        let filtered = filter::filter_datasets(
            candidates,
            &query.dataset,
            query.collection.as_deref(),
            query.revision.as_deref(),
            &options,
        )?;
        Ok(filtered.cloned())
    }

    pub fn list_collections(&self, eid: Option<&Uuid>) -> Vec<String> {
        filter::list_collections(self.candidates(eid).filter(|record| record.exists))
    }

    pub fn list_revisions(&self, eid: Option<&Uuid>) -> Vec<String> {
        filter::list_revisions(self.candidates(eid).filter(|record| record.exists))
    }

    /// Resolves exactly one dataset and returns its local path, downloading if needed.
    pub fn load_dataset(
        &mut self,
        eid: &Uuid,
        query: &DatasetQuery,
        options: &LoadOptions,
    ) -> Result<Utf8PathBuf, OneError> {
        let result = self.load_datasets(eid, std::slice::from_ref(query), true, options)?;
        result
            .files
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| OneError::NotFound(query.describe()))
    }

    /// Resolves each query independently. Unresolved or undownloadable datasets leave a
    /// `None` slot, or fail the call with `assert_present`.
    pub fn load_datasets(
        &mut self,
        eid: &Uuid,
        queries: &[DatasetQuery],
        assert_present: bool,
        options: &LoadOptions,
    ) -> Result<LoadResult, OneError> {
        let session = self.session_or_fetch(eid)?;
        let filter_options = FilterOptions {
            wildcards: self.wildcards,
            ..FilterOptions::default()
        };
        let mut advisories = Vec::new();
        let mut resolved = Vec::with_capacity(queries.len());
        for query in queries {
            let filtered = filter::filter_datasets(
                self.store.datasets_for(eid),
                &query.dataset,
                query.collection.as_deref(),
                query.revision.as_deref(),
                &filter_options,
            )?;
            advisories.extend(filtered.advisories.iter().map(ToString::to_string));
            match filtered.records.first() {
                Some(record) => resolved.push(Some((*record).clone())),
                None if assert_present => {
                    return Err(OneError::NotFound(format!(
                        "{} in session {eid}",
                        query.describe()
                    )));
                }
                None => {
                    warn!(dataset = %query.describe(), %eid, "dataset not found");
                    resolved.push(None);
                }
            }
        }

        let requests = resolved
            .iter()
            .flatten()
            .map(|record| DownloadRequest::new(&session, record.clone()))
            .collect::<Vec<_>>();
        let report = self.materialize(requests, options);
        advisories.extend(report.advisories.iter().map(ToString::to_string));

        let mut paths = report.paths.into_iter();
        let files = resolved
            .iter()
            .map(|record| record.as_ref().and_then(|_| paths.next().flatten()))
            .collect::<Vec<_>>();

        let missing = queries
            .iter()
            .zip(&files)
            .filter(|(_, file)| file.is_none())
            .map(|(query, _)| query.describe())
            .collect::<Vec<_>>();
        if assert_present && !missing.is_empty() {
            return Err(OneError::NotFound(format!(
                "{} not found on disk: {}",
                missing.len(),
                missing.join(", ")
            )));
        }
        Ok(LoadResult {
            eid: *eid,
            files,
            advisories,
        })
    }

    /// Loads every attribute of an object from a single collection.
    pub fn load_object(
        &mut self,
        eid: &Uuid,
        object: &str,
        collection: Option<&str>,
        revision: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Vec<Utf8PathBuf>, OneError> {
        let session = self.session_or_fetch(eid)?;
        let selector =
            DatasetSelector::from(FieldSelector::default().with(Field::Object, &[object]));
        let filter_options = FilterOptions {
            assert_unique: false,
            wildcards: self.wildcards,
            ..FilterOptions::default()
        };
        let filtered = filter::filter_datasets(
            self.store.datasets_for(eid),
            &selector,
            collection,
            revision,
            &filter_options,
        )?;
        if filtered.is_empty() {
            return Err(OneError::NotFound(format!("object {object} in session {eid}")));
        }
        let collections = filter::list_collections(filtered.records.iter().copied());
        if collections.len() > 1 {
            return Err(OneError::MultipleCollectionsFound(collections.join(", ")));
        }
        let requests = filtered
            .records
            .iter()
            .map(|record| DownloadRequest::new(&session, (*record).clone()))
            .collect::<Vec<_>>();
        let expected = requests.len();
        let report = self.materialize(requests, options);
        let files = report.paths.into_iter().flatten().collect::<Vec<_>>();
        if files.is_empty() {
            return Err(OneError::NotFound(format!(
                "object {object} not found on disk"
            )));
        }
        if files.len() < expected {
            warn!(object, missing = expected - files.len(), "some attributes are unavailable");
        }
        Ok(files)
    }

    /// Loads every dataset of one collection, optionally narrowed to one object.
    pub fn load_collection(
        &mut self,
        eid: &Uuid,
        collection: &str,
        object: Option<&str>,
        revision: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Vec<Utf8PathBuf>, OneError> {
        if collection.is_empty() {
            return Err(OneError::InvalidSelector {
                selector: String::new(),
                reason: "a collection name is required".to_string(),
            });
        }
        let session = self.session_or_fetch(eid)?;
        let selector = match object {
            Some(object) => {
                DatasetSelector::from(FieldSelector::default().with(Field::Object, &[object]))
            }
            None => DatasetSelector::Any,
        };
        let filter_options = FilterOptions {
            assert_unique: false,
            wildcards: self.wildcards,
            ..FilterOptions::default()
        };
        let filtered = filter::filter_datasets(
            self.store.datasets_for(eid),
            &selector,
            Some(collection),
            revision,
            &filter_options,
        )?;
        let described = match object {
            Some(object) => format!("{collection}/{object}"),
            None => collection.to_string(),
        };
        if filtered.is_empty() {
            return Err(OneError::NotFound(format!("{described} in session {eid}")));
        }
        let requests = filtered
            .records
            .iter()
            .map(|record| DownloadRequest::new(&session, (*record).clone()))
            .collect::<Vec<_>>();
        let expected = requests.len();
        let report = self.materialize(requests, options);
        let files = report.paths.into_iter().flatten().collect::<Vec<_>>();
        if files.is_empty() {
            return Err(OneError::NotFound(format!("{described} not found on disk")));
        }
        if files.len() < expected {
            warn!(collection, missing = expected - files.len(), "some datasets are unavailable");
        }
        Ok(files)
    }

    /// Loads a dataset by its own UUID. A dataset missing from the cache is looked up in
    /// the catalog when online.
    pub fn load_dataset_from_id(
        &mut self,
        id: &Uuid,
        options: &LoadOptions,
    ) -> Result<Utf8PathBuf, OneError> {
        let mut matches = self
            .store
            .datasets()
            .filter(|record| record.id == *id)
            .cloned()
            .collect::<Vec<_>>();
        if matches.is_empty() && !self.offline() {
            info!(%id, "dataset not cached, querying catalog");
            let value = self.catalog.read_record(TableName::Datasets, id)?;
            let record: DatasetRecord = serde_json::from_value(value).map_err(|err| {
                OneError::Connection(format!("malformed dataset record {id}: {err}"))
            })?;
            self.store
                .merge(TableUpdate::Datasets(vec![record.clone()]), false)?;
            matches.push(record);
        }
        let record = match matches.as_slice() {
            [] => return Err(OneError::NotFound(format!("dataset {id}"))),
            [record] => record.clone(),
            _ => {
                return Err(OneError::MultipleObjectsFound(format!(
                    "dataset {id} is listed under {} sessions",
                    matches.len()
                )));
            }
        };
        let session = self.session_or_fetch(&record.eid)?;
        let report = self.materialize(vec![DownloadRequest::new(&session, record)], options);
        report
            .paths
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| OneError::NotFound(format!("dataset {id} not found on disk")))
    }

    /// Sorted distinct subject names of the cached sessions.
    pub fn list_subjects(&self) -> Vec<String> {
        self.store
            .sessions()
            .map(|session| session.subject.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn eid2path(&self, eid: &Uuid) -> Option<Utf8PathBuf> {
        self.store
            .session(eid)
            .map(|session| self.config.cache_dir.join(session.session_path()))
    }

    pub fn save_loaded_ids(
        &mut self,
        sessions_only: bool,
        clear: bool,
    ) -> Result<LedgerExport, OneError> {
        self.ledger
            .export(&self.config.cache_dir, sessions_only, clear)
    }

    fn candidates<'a>(
        &'a self,
        eid: Option<&'a Uuid>,
    ) -> Box<dyn Iterator<Item = &'a DatasetRecord> + 'a> {
        match eid {
            Some(eid) => Box::new(self.store.datasets_for(eid)),
            None => Box::new(self.store.datasets()),
        }
    }

    fn offline(&self) -> bool {
        self.config.mode == Mode::Local || self.sync.is_offline()
    }

    /// The cached session, fetched from the catalog when missing and online.
    fn session_or_fetch(&mut self, eid: &Uuid) -> Result<SessionRecord, OneError> {
        if let Some(session) = self.store.session(eid) {
            return Ok(session.clone());
        }
        if self.offline() {
            return Err(OneError::NotFound(format!("session {eid}")));
        }
        info!(%eid, "session not cached, querying catalog");
        self.sync
            .update_session(&self.catalog, &mut self.store, eid)?;
        self.get_details(eid)
    }

    fn materialize(&mut self, requests: Vec<DownloadRequest>, options: &LoadOptions) -> Materialized {
        let mut materialize = MaterializeOptions::new(self.config.cache_dir.clone());
        materialize.keep_uuid = options.keep_uuid;
        materialize.workers = self.config.workers;
        materialize.offline = self.offline();

        let keys = requests
            .iter()
            .map(|request| request.record.key())
            .collect::<Vec<DatasetKey>>();
        let downloader = Downloader::new(&self.backends).with_reporter(&self.catalog);
        let report = downloader.materialize(&mut self.store, requests, &materialize);
        self.ledger.record(
            keys.into_iter()
                .zip(&report.paths)
                .filter(|(_, path)| path.is_some())
                .map(|(key, _)| key),
        );
        report
    }
}
