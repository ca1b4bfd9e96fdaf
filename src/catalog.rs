use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{DatasetRecord, SessionRecord, TableName};
use crate::error::OneError;
use crate::fs_util::extract_zip;
use crate::store::{TableUpdate, one_or_many};

/// Snapshot metadata reported by the remote catalog before any table is fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(default)]
    pub min_api_version: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub database_tags: Vec<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    Session(Uuid),
}

impl RecordFilter {
    fn query(&self, table: TableName) -> Vec<(&'static str, String)> {
        match (self, table) {
            (RecordFilter::All, _) => Vec::new(),
            (RecordFilter::Session(eid), TableName::Sessions) => vec![("id", eid.to_string())],
            (RecordFilter::Session(eid), TableName::Datasets) => {
                vec![("session", eid.to_string())]
            }
        }
    }
}

pub trait CatalogClient: Send + Sync {
    fn cache_info(&self, tag: Option<&str>) -> Result<CacheInfo, OneError>;
    fn list_records(
        &self,
        table: TableName,
        filter: RecordFilter,
    ) -> Result<TableUpdate, OneError>;
    fn read_record(&self, table: TableName, id: &Uuid) -> Result<Value, OneError>;
    /// Downloads the table snapshot and unpacks it into `destination`.
    fn download_snapshot(
        &self,
        tag: Option<&str>,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, OneError>;
    /// Marks the file record of a dataset as failing verification.
    fn flag_mismatch(&self, dataset_id: &Uuid) -> Result<(), OneError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: Url,
}

impl CatalogHttpClient {
    pub fn new(base_url: &str) -> Result<Self, OneError> {
        if base_url.trim().is_empty() {
            return Err(OneError::Configuration(
                "no catalog URL configured; run `one setup`".to_string(),
            ));
        }
        let mut base_url =
            Url::parse(base_url.trim()).map_err(|err| OneError::InvalidUrl(err.to_string()))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("one-client/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OneError::Configuration(err.to_string()))?,
        );
        if let Ok(token) = std::env::var("ONE_TOKEN") {
            if !token.trim().is_empty() {
                headers.insert(
                    "Authorization",
                    HeaderValue::from_str(&format!("Token {}", token.trim()))
                        .map_err(|err| OneError::Configuration(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| OneError::Connection(err.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, OneError> {
        self.base_url
            .join(path)
            .map_err(|err| OneError::InvalidUrl(err.to_string()))
    }

    fn get_json(&self, url: Url, query: &[(&str, String)]) -> Result<Value, OneError> {
        debug!(%url, "GET");
        let response = send_with_retries(|| self.client.get(url.clone()).query(query))
            .and_then(|response| check_status(response, "catalog request failed"))?;
        response
            .json()
            .map_err(|err| OneError::Connection(err.to_string()))
    }
}

impl CatalogClient for CatalogHttpClient {
    fn cache_info(&self, tag: Option<&str>) -> Result<CacheInfo, OneError> {
        let url = self.endpoint("cache/info")?;
        let query = tag
            .map(|tag| vec![("tag", tag.to_string())])
            .unwrap_or_default();
        let value = self.get_json(url, &query)?;
        serde_json::from_value(value).map_err(|err| OneError::Connection(err.to_string()))
    }

    fn list_records(
        &self,
        table: TableName,
        filter: RecordFilter,
    ) -> Result<TableUpdate, OneError> {
        let url = self.endpoint(table.as_str())?;
        let value = self.get_json(url, &filter.query(table))?;
        let decode = |err: serde_json::Error| {
            OneError::Connection(format!("malformed {table} records: {err}"))
        };
        match table {
            TableName::Sessions => serde_json::from_value::<Vec<SessionRecord>>(value)
                .map(TableUpdate::Sessions)
                .map_err(decode),
            TableName::Datasets => serde_json::from_value::<Vec<DatasetRecord>>(value)
                .map(TableUpdate::Datasets)
                .map_err(decode),
        }
    }

    fn read_record(&self, table: TableName, id: &Uuid) -> Result<Value, OneError> {
        let url = self.endpoint(&format!("{}/{id}", table.as_str()))?;
        self.get_json(url, &[])
    }

    fn download_snapshot(
        &self,
        tag: Option<&str>,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, OneError> {
        let url = self.endpoint("cache.zip")?;
        let query = tag
            .map(|tag| vec![("tag", tag.to_string())])
            .unwrap_or_default();
        debug!(%url, "downloading cache snapshot");
        let mut response = send_with_retries(|| self.client.get(url.clone()).query(&query))
            .and_then(|response| check_status(response, "snapshot request failed"))?;

        fs::create_dir_all(destination).map_err(|err| OneError::Filesystem(err.to_string()))?;
        let zip_path = destination.join("cache.zip");
        let mut file =
            File::create(&zip_path).map_err(|err| OneError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| OneError::Transfer(err.to_string()))?;
        drop(file);

        let files = extract_zip(&zip_path, destination)?;
        fs::remove_file(&zip_path).map_err(|err| OneError::Filesystem(err.to_string()))?;
        Ok(files)
    }

    fn flag_mismatch(&self, dataset_id: &Uuid) -> Result<(), OneError> {
        let url = self.endpoint(&format!("files/{dataset_id}"))?;
        let body = json!({ "json": { "mismatch_hash": true } });
        send_with_retries(|| self.client.patch(url.clone()).json(&body))
            .and_then(|response| check_status(response, "flag request failed"))?;
        Ok(())
    }
}

const MAX_RETRIES: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(200);

/// Sends the request built by `make_req`, retrying throttling, server errors and
/// connection failures with a linear backoff. The final response is returned whatever
/// its status.
pub(crate) fn send_with_retries<F>(mut make_req: F) -> Result<Response, OneError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        match make_req().send() {
            Ok(response)
                if attempt < MAX_RETRIES && is_retryable_status(response.status().as_u16()) =>
            {
                debug!(status = response.status().as_u16(), attempt, "retrying request");
            }
            Ok(response) => return Ok(response),
            Err(err) if attempt < MAX_RETRIES && is_retryable_error(&err) => {
                debug!(attempt, "retrying request: {err}");
            }
            Err(err) => return Err(OneError::Connection(err.to_string())),
        }
        attempt += 1;
        thread::sleep(BASE_DELAY * attempt);
    }
}

/// Turns a non-success response into `HttpStatus`, using the body as the message.
pub(crate) fn check_status(response: Response, fallback: &str) -> Result<Response, OneError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response.text().unwrap_or_else(|_| fallback.to_string());
    Err(OneError::HttpStatus { status, message })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
