use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::alf;
use crate::backend::{AttemptOutcome, Backend, BackendKind, TransferAttempt};
use crate::catalog::CatalogClient;
use crate::domain::{DatasetRecord, SessionRecord};
use crate::error::{Advisory, OneError};
use crate::fs_util::{HashKind, hash_file, matches_hash};
use crate::store::CacheStore;

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// `lab/Subjects/subject/date/NNN` of the owning session.
    pub session_path: String,
    pub record: DatasetRecord,
}

impl DownloadRequest {
    pub fn new(session: &SessionRecord, record: DatasetRecord) -> Self {
        Self {
            session_path: session.session_path(),
            record,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    pub cache_dir: Utf8PathBuf,
    pub keep_uuid: bool,
    pub workers: usize,
    /// Transfers not started by this instant are cancelled.
    pub deadline: Option<Instant>,
    pub check_hash: bool,
    /// Only files already on disk are returned; nothing is transferred.
    pub offline: bool,
}

impl MaterializeOptions {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            keep_uuid: false,
            workers: DEFAULT_WORKERS,
            deadline: None,
            check_hash: true,
            offline: false,
        }
    }

    pub fn destination(&self, request: &DownloadRequest) -> Utf8PathBuf {
        let rel_path = if self.keep_uuid {
            alf::with_uuid(&request.record.rel_path, request.record.id)
        } else {
            request.record.rel_path.clone()
        };
        self.cache_dir.join(&request.session_path).join(rel_path)
    }
}

/// Per-request results, in request order.
#[derive(Debug, Default)]
pub struct Materialized {
    pub paths: Vec<Option<Utf8PathBuf>>,
    pub attempts: Vec<Vec<TransferAttempt>>,
    pub advisories: Vec<Advisory>,
    pub cancelled: usize,
}

impl Materialized {
    fn with_len(len: usize) -> Self {
        Self {
            paths: vec![None; len],
            attempts: vec![Vec::new(); len],
            advisories: Vec::new(),
            cancelled: 0,
        }
    }

    pub fn missing(&self) -> usize {
        self.paths.iter().filter(|path| path.is_none()).count()
    }
}

struct Job {
    index: usize,
    request: DownloadRequest,
    destination: Utf8PathBuf,
}

enum Outcome {
    Transferred {
        path: Utf8PathBuf,
        attempts: Vec<TransferAttempt>,
        mismatches: Vec<Advisory>,
    },
    Failed {
        attempts: Vec<TransferAttempt>,
    },
    Cancelled,
}

pub struct Downloader<'a> {
    backends: &'a [Box<dyn Backend>],
    reporter: Option<&'a dyn CatalogClient>,
}

impl<'a> Downloader<'a> {
    pub fn new(backends: &'a [Box<dyn Backend>]) -> Self {
        Self {
            backends,
            reporter: None,
        }
    }

    /// Catalog told about files failing verification.
    pub fn with_reporter(mut self, reporter: &'a dyn CatalogClient) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn materialize(
        &self,
        store: &mut CacheStore,
        requests: Vec<DownloadRequest>,
        options: &MaterializeOptions,
    ) -> Materialized {
        let mut report = Materialized::with_len(requests.len());
        let mut queue = Vec::new();
        for (index, request) in requests.into_iter().enumerate() {
            let destination = options.destination(&request);
            if is_present(&destination, &request.record, options.check_hash) {
                debug!(path = %destination, "dataset already on disk");
                store.set_exists(&request.record.key(), None, true);
                report.paths[index] = Some(destination);
            } else {
                queue.push(Job {
                    index,
                    request,
                    destination,
                });
            }
        }
        if queue.is_empty() {
            return report;
        }
        if options.offline {
            debug!(missing = queue.len(), "offline, not downloading");
            return report;
        }

        let workers = options.workers.max(1).min(queue.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let next = &next;
                scope.spawn(move || {
                    loop {
                        let position = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = queue.get(position) else {
                            break;
                        };
                        let expired = options.deadline.is_some_and(|at| Instant::now() >= at);
                        let outcome = if expired {
                            Outcome::Cancelled
                        } else {
                            self.transfer(job, options)
                        };
                        if tx.send((position, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (position, outcome) in rx {
                self.apply(store, &queue[position], outcome, &mut report);
            }
        });

        info!(
            requested = report.paths.len(),
            missing = report.missing(),
            cancelled = report.cancelled,
            "materialized datasets"
        );
        report
    }

    fn transfer(&self, job: &Job, options: &MaterializeOptions) -> Outcome {
        let record = &job.request.record;
        let mut attempts = Vec::new();
        for backend in self.backends {
            if backend.kind() == BackendKind::ObjectStore
                && record.backend_exists(backend.name()) != Some(true)
            {
                continue;
            }
            let url = match backend.source_url(&job.request.session_path, record) {
                Ok(url) => url,
                Err(err) => {
                    debug!(backend = backend.name(), "no source url: {err}");
                    attempts.push(TransferAttempt {
                        backend: backend.name().to_string(),
                        url: None,
                        outcome: AttemptOutcome::Failed {
                            reason: err.to_string(),
                        },
                    });
                    continue;
                }
            };
            let outcome = match fetch_into(backend.as_ref(), &url, &job.destination) {
                Ok(bytes) => AttemptOutcome::Transferred { bytes },
                Err(err) if err.is_not_found() => {
                    debug!(backend = backend.name(), %url, "not found on backend");
                    AttemptOutcome::NotFound
                }
                Err(err) => {
                    debug!(backend = backend.name(), %url, "transfer failed: {err}");
                    AttemptOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            let done = matches!(outcome, AttemptOutcome::Transferred { .. });
            attempts.push(TransferAttempt {
                backend: backend.name().to_string(),
                url: Some(url),
                outcome,
            });
            if done {
                let mismatches = verify(record, &job.destination, options.check_hash);
                return Outcome::Transferred {
                    path: job.destination.clone(),
                    attempts,
                    mismatches,
                };
            }
        }
        Outcome::Failed { attempts }
    }

    fn apply(
        &self,
        store: &mut CacheStore,
        job: &Job,
        outcome: Outcome,
        report: &mut Materialized,
    ) {
        let record = &job.request.record;
        let key = record.key();
        match outcome {
            Outcome::Cancelled => {
                debug!(dataset = %record.rel_path, "transfer cancelled");
                report.cancelled += 1;
            }
            Outcome::Failed { attempts } => {
                mark_missing_backends(store, record, &attempts);
                store.set_exists(&key, None, false);
                warn!(
                    dataset = %record.rel_path,
                    attempts = attempts.len(),
                    "failed to download dataset"
                );
                report.attempts[job.index] = attempts;
            }
            Outcome::Transferred {
                path,
                attempts,
                mismatches,
            } => {
                mark_missing_backends(store, record, &attempts);
                store.set_exists(&key, None, true);
                if !mismatches.is_empty() {
                    for advisory in &mismatches {
                        warn!("{advisory}");
                    }
                    self.report_mismatch(record);
                    report.advisories.extend(mismatches);
                }
                report.paths[job.index] = Some(path);
                report.attempts[job.index] = attempts;
            }
        }
    }

    fn report_mismatch(&self, record: &DatasetRecord) {
        let Some(reporter) = self.reporter else {
            return;
        };
        match reporter.flag_mismatch(&record.id) {
            Ok(()) => debug!(dataset = %record.id, "flagged file record as mismatched"),
            Err(err) if err.is_permission_denied() => {
                warn!(dataset = %record.id, "no permission to flag mismatched file record")
            }
            Err(err) => {
                warn!(dataset = %record.id, "failed to flag mismatched file record: {err}")
            }
        }
    }
}

/// A local copy counts only when its size, and its digest when hashes are checked, agree
/// with the record.
fn is_present(path: &Utf8Path, record: &DatasetRecord, check_hash: bool) -> bool {
    let sized = match fs::metadata(path.as_std_path()) {
        Ok(meta) => meta.is_file() && record.file_size.is_none_or(|size| meta.len() == size),
        Err(_) => false,
    };
    if !sized || !check_hash {
        return sized;
    }
    let expected = record.hash.as_deref().map(str::trim).unwrap_or_default();
    match matches_hash(path.as_std_path(), expected) {
        Ok(Some(false)) => {
            debug!(%path, "local copy does not match catalog hash");
            false
        }
        Ok(_) => true,
        Err(err) => {
            warn!(%path, "unable to hash local copy: {err}");
            false
        }
    }
}

/// Streams into a temp file beside `destination`; the file only appears on success.
fn fetch_into(backend: &dyn Backend, url: &str, destination: &Utf8Path) -> Result<u64, OneError> {
    let parent = destination
        .parent()
        .ok_or_else(|| OneError::Filesystem(format!("invalid destination path {destination}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".one-part")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    let bytes = backend.fetch(url, temp.as_file_mut())?;
    temp.persist(destination.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    Ok(bytes)
}

fn verify(record: &DatasetRecord, path: &Utf8Path, check_hash: bool) -> Vec<Advisory> {
    let mut mismatches = Vec::new();
    let dataset = record.rel_path.clone();
    if let Some(expected) = record.file_size {
        match fs::metadata(path.as_std_path()) {
            Ok(meta) if meta.len() != expected => mismatches.push(Advisory::SizeMismatch {
                dataset: dataset.clone(),
                expected,
                actual: meta.len(),
            }),
            Ok(_) => {}
            Err(err) => warn!(%path, "unable to stat downloaded file: {err}"),
        }
    }
    let expected = record.hash.as_deref().map(str::trim).unwrap_or_default();
    if check_hash && !expected.is_empty() {
        let Some(kind) = HashKind::of_hex(expected) else {
            debug!(%dataset, "skipping verification of unrecognised hash format");
            return mismatches;
        };
        match hash_file(path.as_std_path(), kind) {
            Ok(actual) if !actual.eq_ignore_ascii_case(expected) => {
                mismatches.push(Advisory::HashMismatch {
                    dataset,
                    expected: expected.to_string(),
                    actual,
                })
            }
            Ok(_) => {}
            Err(err) => warn!(%path, "unable to hash downloaded file: {err}"),
        }
    }
    mismatches
}

fn mark_missing_backends(
    store: &mut CacheStore,
    record: &DatasetRecord,
    attempts: &[TransferAttempt],
) {
    for attempt in attempts {
        if attempt.outcome == AttemptOutcome::NotFound
            && record.backend_exists(&attempt.backend).is_some()
        {
            debug!(
                backend = %attempt.backend,
                dataset = %record.rel_path,
                "updating exists field"
            );
            store.set_exists(&record.key(), Some(&attempt.backend), false);
        }
    }
}
