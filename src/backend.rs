use std::io::Write;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::debug;

use crate::alf;
use crate::catalog::{check_status, send_with_retries};
use crate::domain::DatasetRecord;
use crate::error::OneError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Only consulted for records whose `exists_<name>` flag is true.
    ObjectStore,
    Http,
}

/// A delivery route for dataset files.
pub trait Backend: Send + Sync {
    /// Suffix of the record's `exists_<name>` column.
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;
    fn source_url(&self, session_path: &str, record: &DatasetRecord) -> Result<String, OneError>;
    /// Streams the file at `url` into `sink`, returning the number of bytes written.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, OneError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Transferred { bytes: u64 },
    NotFound,
    Failed { reason: String },
}

/// One try of one backend for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferAttempt {
    pub backend: String,
    pub url: Option<String>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl TransferAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Transferred { .. })
    }
}

#[derive(Clone)]
struct Fetcher {
    client: Client,
}

impl Fetcher {
    fn new() -> Result<Self, OneError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("one-client/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OneError::Configuration(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| OneError::Connection(err.to_string()))?;
        Ok(Self { client })
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, OneError> {
        let url = Url::parse(url).map_err(|err| OneError::InvalidUrl(format!("{url}: {err}")))?;
        let mut response = send_with_retries(|| self.client.get(url.clone()))
            .and_then(|response| check_status(response, "file request failed"))?;
        let bytes =
            std::io::copy(&mut response, sink).map_err(|err| OneError::Transfer(err.to_string()))?;
        debug!(%url, bytes, "fetched file");
        Ok(bytes)
    }
}

fn join_url(base: &str, parts: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in parts.iter().filter(|part| !part.is_empty()) {
        url.push('/');
        url.push_str(part.trim_matches('/'));
    }
    url
}

/// Plain HTTP data server. File names on the server always carry the dataset UUID.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    fetcher: Fetcher,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, OneError> {
        Url::parse(base_url).map_err(|err| OneError::InvalidUrl(format!("{base_url}: {err}")))?;
        Ok(Self {
            base_url: base_url.to_string(),
            fetcher: Fetcher::new()?,
        })
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn source_url(&self, session_path: &str, record: &DatasetRecord) -> Result<String, OneError> {
        let rel_path = alf::with_uuid(&record.rel_path, record.id);
        Ok(join_url(&self.base_url, &[session_path, &rel_path]))
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, OneError> {
        self.fetcher.fetch(url, sink)
    }
}

/// Public object-store bucket laid out as `<bucket>/data/<session path>/<rel path>`.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    name: String,
    bucket_url: String,
    fetcher: Fetcher,
}

impl ObjectStoreBackend {
    pub fn new(name: &str, bucket_url: &str) -> Result<Self, OneError> {
        Url::parse(bucket_url)
            .map_err(|err| OneError::InvalidUrl(format!("{bucket_url}: {err}")))?;
        Ok(Self {
            name: name.to_string(),
            bucket_url: bucket_url.to_string(),
            fetcher: Fetcher::new()?,
        })
    }
}

impl Backend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn source_url(&self, session_path: &str, record: &DatasetRecord) -> Result<String, OneError> {
        let rel_path = alf::with_uuid(&record.rel_path, record.id);
        Ok(join_url(&self.bucket_url, &["data", session_path, &rel_path]))
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, OneError> {
        self.fetcher.fetch(url, sink)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn record() -> DatasetRecord {
        DatasetRecord::new(
            Uuid::parse_str("d3372b15-f696-4279-9be5-98f15783b5bb").unwrap(),
            Uuid::parse_str("91546fc6-b67c-4a69-badc-5e66088519c4").unwrap(),
            "alf/_ibl_wheel.position.npy",
        )
    }

    #[test]
    fn http_url_embeds_uuid() {
        let backend = HttpBackend::new("https://data.example.org/public/").unwrap();
        let url = backend
            .source_url("cortexlab/Subjects/KS005/2019-04-04/004", &record())
            .unwrap();
        assert_eq!(
            url,
            "https://data.example.org/public/cortexlab/Subjects/KS005/2019-04-04/004/alf/\
             _ibl_wheel.position.91546fc6-b67c-4a69-badc-5e66088519c4.npy"
        );
    }

    #[test]
    fn object_store_url_under_data_prefix() {
        let backend = ObjectStoreBackend::new("aws", "https://bucket.example.org").unwrap();
        let url = backend.source_url("lab/Subjects/s/2020-01-01/001", &record()).unwrap();
        assert!(url.starts_with("https://bucket.example.org/data/lab/Subjects/s/2020-01-01/001/"));
        assert_eq!(backend.kind(), BackendKind::ObjectStore);
    }
}
