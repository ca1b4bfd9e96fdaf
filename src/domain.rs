use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::alf;
use crate::error::OneError;

/// Prefix shared by every per-backend existence column (`exists_aws`, ...).
pub const EXISTS_PREFIX: &str = "exists_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Qc {
    #[default]
    NotSet,
    Pass,
    Warning,
    Fail,
    Critical,
}

impl Qc {
    pub const ALL: [Qc; 5] = [Qc::NotSet, Qc::Pass, Qc::Warning, Qc::Fail, Qc::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Qc::NotSet => "NOT_SET",
            Qc::Pass => "PASS",
            Qc::Warning => "WARNING",
            Qc::Fail => "FAIL",
            Qc::Critical => "CRITICAL",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Qc::NotSet => 0,
            Qc::Pass => 10,
            Qc::Warning => 30,
            Qc::Fail => 40,
            Qc::Critical => 50,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, OneError> {
        Qc::ALL
            .into_iter()
            .find(|qc| u64::from(qc.code()) == code)
            .ok_or_else(|| OneError::InvalidQc(code.to_string()))
    }
}

impl fmt::Display for Qc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Qc {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(code) = trimmed.parse::<u64>() {
            return Qc::from_code(code);
        }
        let normalized = trimmed.to_uppercase().replace('-', "_");
        Qc::ALL
            .into_iter()
            .find(|qc| qc.as_str() == normalized)
            .ok_or_else(|| OneError::InvalidQc(value.to_string()))
    }
}

impl Serialize for Qc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Qc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(u64),
            Name(String),
        }
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(Qc::NotSet),
            Some(Raw::Code(code)) => Qc::from_code(code).map_err(serde::de::Error::custom),
            Some(Raw::Name(name)) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableName {
    Sessions,
    Datasets,
}

impl TableName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Sessions => "sessions",
            TableName::Datasets => "datasets",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "sessions" => Ok(TableName::Sessions),
            "datasets" => Ok(TableName::Datasets),
            other => Err(OneError::UnknownTable(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub lab: String,
    pub subject: String,
    pub date: NaiveDate,
    pub number: u32,
    #[serde(default)]
    pub task_protocol: String,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub qc: Qc,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionRecord {
    /// `lab/Subjects/subject/date/NNN`, relative to the cache root.
    pub fn session_path(&self) -> String {
        alf::session_path(&self.lab, &self.subject, self.date, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub eid: Uuid,
    pub id: Uuid,
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.eid, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub eid: Uuid,
    pub id: Uuid,
    pub rel_path: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub qc: Qc,
    #[serde(default)]
    pub default_revision: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DatasetRecord {
    pub fn new(eid: Uuid, id: Uuid, rel_path: impl Into<String>) -> Self {
        Self {
            eid,
            id,
            rel_path: rel_path.into(),
            file_size: None,
            hash: None,
            exists: false,
            qc: Qc::NotSet,
            default_revision: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> DatasetKey {
        DatasetKey {
            eid: self.eid,
            id: self.id,
        }
    }

    pub fn collection(&self) -> &str {
        alf::split_rel_path(&self.rel_path).0
    }

    /// Revision label without the `#` delimiters; empty when unrevised.
    pub fn revision(&self) -> &str {
        alf::split_rel_path(&self.rel_path).1
    }

    pub fn filename(&self) -> &str {
        alf::split_rel_path(&self.rel_path).2
    }

    /// Relative path with the revision segment removed, used to group revisions of
    /// the same object.
    pub fn identity(&self) -> String {
        let (collection, _, filename) = alf::split_rel_path(&self.rel_path);
        if collection.is_empty() {
            filename.to_string()
        } else {
            format!("{collection}/{filename}")
        }
    }

    pub fn backend_exists(&self, backend: &str) -> Option<bool> {
        self.extra
            .get(&format!("{EXISTS_PREFIX}{backend}"))
            .and_then(Value::as_bool)
    }

    pub fn set_backend_exists(&mut self, backend: &str, value: bool) {
        self.extra
            .insert(format!("{EXISTS_PREFIX}{backend}"), Value::Bool(value));
    }
}

/// A session reference as typed by a user: either the eid itself or the
/// `subject/date/number` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Eid(Uuid),
    Triple {
        subject: String,
        date: NaiveDate,
        number: u32,
    },
}

impl FromStr for SessionRef {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_matches('/');
        if let Ok(eid) = Uuid::parse_str(trimmed) {
            return Ok(SessionRef::Eid(eid));
        }
        let parts = trimmed.rsplitn(3, '/').collect::<Vec<_>>();
        let [number, date, subject] = parts.as_slice() else {
            return Err(OneError::InvalidSessionRef(value.to_string()));
        };
        let subject = subject.rsplit('/').next().unwrap_or(subject);
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| OneError::InvalidSessionRef(value.to_string()))?;
        let number = number
            .parse::<u32>()
            .map_err(|_| OneError::InvalidSessionRef(value.to_string()))?;
        if subject.is_empty() {
            return Err(OneError::InvalidSessionRef(value.to_string()));
        }
        Ok(SessionRef::Triple {
            subject: subject.to_string(),
            date,
            number,
        })
    }
}

/// Inclusive date window used by session search. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn on(date: NaiveDate) -> Self {
        Self {
            from: Some(date),
            to: Some(date),
        }
    }

    /// One value selects a single day; two values give `[from, to]` where either
    /// may be absent.
    pub fn parse(bounds: &[Option<&str>]) -> Result<Self, OneError> {
        let parse = |value: Option<&str>| -> Result<Option<NaiveDate>, OneError> {
            value
                .map(|raw| {
                    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                        .map_err(|_| OneError::InvalidDateRange(raw.to_string()))
                })
                .transpose()
        };
        match bounds {
            [single] => {
                let date = parse(*single)?
                    .ok_or_else(|| OneError::InvalidDateRange("empty date".to_string()))?;
                Ok(Self::on(date))
            }
            [from, to] => {
                let range = Self {
                    from: parse(*from)?,
                    to: parse(*to)?,
                };
                if let (Some(from), Some(to)) = (range.from, range.to) {
                    if from > to {
                        return Err(OneError::InvalidDateRange(format!("{from} > {to}")));
                    }
                }
                Ok(range)
            }
            _ => Err(OneError::InvalidDateRange(format!(
                "expected one or two dates, got {}",
                bounds.len()
            ))),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IdKind {
    Datasets,
    Sessions,
}
