//! ALF relative paths: `collection/#revision#/_namespace_object.attribute_timescale.extra.ext`.
//!
//! Parsing is a hand-written scanner rather than one large regular expression so that
//! the collection/revision boundary is decided structurally. Selectors are compiled to
//! anchored [`Pattern`]s and matched per component.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use uuid::Uuid;

use crate::error::OneError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlfPath {
    pub collection: Option<String>,
    pub revision: Option<String>,
    pub namespace: Option<String>,
    pub object: String,
    pub attribute: String,
    pub timescale: Option<String>,
    pub extra: Vec<String>,
    pub extension: String,
}

impl AlfPath {
    pub fn parse(path: &str) -> Result<Self, OneError> {
        let normalized = normalize(path);
        let fail = |reason: &str| OneError::PathFormat {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let (collection, revision, filename) = split_rel_path(&normalized);
        if !collection.is_empty() {
            for segment in collection.split('/') {
                if segment.is_empty() || !segment.chars().all(is_collection_char) {
                    return Err(fail("invalid collection segment"));
                }
            }
        }
        if !revision.is_empty() && !revision.chars().all(is_revision_char) {
            return Err(fail("invalid revision"));
        }

        let parts = filename.split('.').collect::<Vec<_>>();
        if parts.len() < 3 {
            return Err(fail("expected object.attribute.extension"));
        }
        if parts.iter().any(|part| part.is_empty()) {
            return Err(fail("empty filename part"));
        }

        let (namespace, object) = split_namespace(parts[0]).ok_or_else(|| fail("invalid object"))?;
        let (attribute, timescale) =
            split_attribute(parts[1]).ok_or_else(|| fail("invalid attribute"))?;
        let extension = parts[parts.len() - 1];
        if !extension.chars().all(is_word_char) {
            return Err(fail("invalid extension"));
        }
        let extra = parts[2..parts.len() - 1]
            .iter()
            .map(|part| {
                if part.chars().all(|ch| is_word_char(ch) || ch == '-') {
                    Ok(part.to_string())
                } else {
                    Err(fail("invalid extra part"))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            collection: (!collection.is_empty()).then(|| collection.to_string()),
            revision: (!revision.is_empty()).then(|| revision.to_string()),
            namespace,
            object,
            attribute,
            timescale,
            extra,
            extension: extension.to_string(),
        })
    }

    pub fn filename(&self) -> String {
        let mut name = String::new();
        if let Some(namespace) = &self.namespace {
            name.push('_');
            name.push_str(namespace);
            name.push('_');
        }
        name.push_str(&self.object);
        name.push('.');
        name.push_str(&self.attribute);
        if let Some(timescale) = &self.timescale {
            name.push('_');
            name.push_str(timescale);
        }
        for part in &self.extra {
            name.push('.');
            name.push_str(part);
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }

    pub fn component(&self, field: Field) -> &str {
        match field {
            Field::Namespace => self.namespace.as_deref().unwrap_or(""),
            Field::Object => &self.object,
            Field::Attribute => &self.attribute,
            Field::Timescale => self.timescale.as_deref().unwrap_or(""),
            Field::Extension => &self.extension,
            Field::Extra => "",
        }
    }
}

impl fmt::Display for AlfPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(collection) = &self.collection {
            write!(f, "{collection}/")?;
        }
        if let Some(revision) = &self.revision {
            write!(f, "#{revision}#/")?;
        }
        f.write_str(&self.filename())
    }
}

impl FromStr for AlfPath {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

pub fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// Splits a relative path into `(collection, revision, filename)` without validating
/// the filename. Missing parts are empty strings.
pub fn split_rel_path(rel_path: &str) -> (&str, &str, &str) {
    let rel_path = rel_path.trim_matches('/');
    let (dir, filename) = rel_path.rsplit_once('/').unwrap_or(("", rel_path));
    let (collection, last) = dir.rsplit_once('/').unwrap_or(("", dir));
    if last.len() >= 2 && last.starts_with('#') && last.ends_with('#') {
        (collection, &last[1..last.len() - 1], filename)
    } else {
        (dir, "", filename)
    }
}

pub fn session_path(lab: &str, subject: &str, date: NaiveDate, number: u32) -> String {
    format!("{lab}/Subjects/{subject}/{}/{number:03}", date.format("%Y-%m-%d"))
}

/// Inserts the dataset id before the extension: `obj.attr.npy` -> `obj.attr.<id>.npy`.
pub fn with_uuid(rel_path: &str, id: Uuid) -> String {
    let (dir, filename) = match rel_path.rsplit_once('/') {
        Some((dir, filename)) => (format!("{dir}/"), filename),
        None => (String::new(), rel_path),
    };
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{dir}{stem}.{id}.{ext}"),
        _ => format!("{dir}{filename}.{id}"),
    }
}

fn split_namespace(part: &str) -> Option<(Option<String>, String)> {
    let (namespace, object) = match part.strip_prefix('_') {
        Some(rest) => {
            let (namespace, object) = rest.split_once('_')?;
            if namespace.is_empty() || !namespace.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return None;
            }
            (Some(namespace.to_string()), object)
        }
        None => (None, part),
    };
    if object.is_empty() || !object.chars().all(is_word_char) {
        return None;
    }
    Some((namespace, object.to_string()))
}

fn split_attribute(part: &str) -> Option<(String, Option<String>)> {
    let (prefix, body) = match part.strip_prefix('_') {
        Some(rest) => {
            let (prefix, body) = rest.split_once('_')?;
            if prefix.is_empty() || !prefix.chars().all(|ch| ch.is_ascii_lowercase()) {
                return None;
            }
            (Some(prefix), body)
        }
        None => (None, part),
    };
    let mut tokens = body.split('_');
    let base = tokens.next()?;
    if base.is_empty() || !base.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    let mut attribute = match prefix {
        Some(prefix) => format!("_{prefix}_{base}"),
        None => base.to_string(),
    };
    let rest = tokens.collect::<Vec<_>>();
    let rest = match rest.first() {
        Some(&suffix @ ("times" | "intervals")) => {
            attribute.push('_');
            attribute.push_str(suffix);
            &rest[1..]
        }
        _ => &rest[..],
    };
    let timescale = (!rest.is_empty()).then(|| rest.join("_"));
    if timescale.as_deref() == Some("") {
        return None;
    }
    Some((attribute, timescale))
}

fn is_word_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn is_collection_char(ch: char) -> bool {
    is_word_char(ch) || ch == '-' || ch == '.'
}

fn is_revision_char(ch: char) -> bool {
    is_word_char(ch) || ch == '-' || ch == '.'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Globs never match `/`.
    Filename,
    /// Globs may span `/`; the whole collection string must match.
    Collection,
}

/// A compiled, fully anchored matcher for one path component.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// The empty selector: the component must be absent.
    Absent,
    Literal(String),
    Glob(GlobMatcher),
    Regex(Regex),
}

impl Pattern {
    pub fn compile(selector: &str, wildcards: bool, scope: Scope) -> Result<Self, OneError> {
        if selector.is_empty() {
            return Ok(Pattern::Absent);
        }
        let invalid = |reason: String| OneError::InvalidSelector {
            selector: selector.to_string(),
            reason,
        };
        if wildcards {
            if !selector.contains(['*', '?', '[', '{']) {
                return Ok(Pattern::Literal(selector.to_string()));
            }
            let glob = GlobBuilder::new(selector)
                .literal_separator(scope == Scope::Filename)
                .backslash_escape(true)
                .build()
                .map_err(|err| invalid(err.to_string()))?;
            Ok(Pattern::Glob(glob.compile_matcher()))
        } else {
            let regex = Regex::new(&format!("^(?:{selector})$"))
                .map_err(|err| invalid(err.to_string()))?;
            Ok(Pattern::Regex(regex))
        }
    }

    /// `value` is the component text; an absent component is the empty string.
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Pattern::Absent => value.is_empty(),
            Pattern::Literal(literal) => literal == value,
            Pattern::Glob(glob) => !value.is_empty() && glob.is_match(value),
            Pattern::Regex(regex) => regex.is_match(value),
        }
    }
}

fn compile_any(
    selectors: &[String],
    wildcards: bool,
    scope: Scope,
) -> Result<Vec<Pattern>, OneError> {
    selectors
        .iter()
        .map(|selector| Pattern::compile(selector, wildcards, scope))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Namespace,
    Object,
    Attribute,
    Timescale,
    Extension,
    Extra,
}

/// Per-field selector. A list within a field is a logical OR, distinct fields are
/// combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    pub namespace: Option<Vec<String>>,
    pub object: Option<Vec<String>>,
    pub attribute: Option<Vec<String>>,
    pub timescale: Option<Vec<String>>,
    pub extension: Option<Vec<String>>,
    pub extra: Option<Vec<String>>,
}

impl FieldSelector {
    pub fn with(mut self, field: Field, values: &[&str]) -> Self {
        let values = Some(values.iter().map(|value| value.to_string()).collect());
        match field {
            Field::Namespace => self.namespace = values,
            Field::Object => self.object = values,
            Field::Attribute => self.attribute = values,
            Field::Timescale => self.timescale = values,
            Field::Extension => self.extension = values,
            Field::Extra => self.extra = values,
        }
        self
    }

    fn entries(&self) -> Vec<(Field, &Vec<String>)> {
        [
            (Field::Namespace, &self.namespace),
            (Field::Object, &self.object),
            (Field::Attribute, &self.attribute),
            (Field::Timescale, &self.timescale),
            (Field::Extension, &self.extension),
            (Field::Extra, &self.extra),
        ]
        .into_iter()
        .filter_map(|(field, values)| values.as_ref().map(|values| (field, values)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DatasetSelector {
    #[default]
    Any,
    Name(String),
    Names(Vec<String>),
    Fields(FieldSelector),
}

impl From<&str> for DatasetSelector {
    fn from(value: &str) -> Self {
        DatasetSelector::Name(value.to_string())
    }
}

impl From<Vec<&str>> for DatasetSelector {
    fn from(values: Vec<&str>) -> Self {
        DatasetSelector::Names(values.into_iter().map(str::to_string).collect())
    }
}

impl From<FieldSelector> for DatasetSelector {
    fn from(value: FieldSelector) -> Self {
        DatasetSelector::Fields(value)
    }
}

/// Where a name selector may start matching within a relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Only the filename.
    Filename,
    /// The filename, optionally preceded by the revision segment.
    AfterCollection,
    /// Any tail that starts on a segment boundary.
    AnyTail,
}

#[derive(Debug, Clone)]
pub enum DatasetMatcher {
    Any,
    Names(Vec<Pattern>),
    Fields(Vec<(Field, Vec<Pattern>)>),
}

impl DatasetSelector {
    pub fn compile(&self, wildcards: bool) -> Result<DatasetMatcher, OneError> {
        match self {
            DatasetSelector::Any => Ok(DatasetMatcher::Any),
            DatasetSelector::Name(name) => Ok(DatasetMatcher::Names(vec![Pattern::compile(
                name,
                wildcards,
                Scope::Filename,
            )?])),
            DatasetSelector::Names(names) => Ok(DatasetMatcher::Names(compile_any(
                names,
                wildcards,
                Scope::Filename,
            )?)),
            DatasetSelector::Fields(fields) => {
                let compiled = fields
                    .entries()
                    .into_iter()
                    .map(|(field, values)| {
                        Ok((field, compile_any(values, wildcards, Scope::Filename)?))
                    })
                    .collect::<Result<Vec<_>, OneError>>()?;
                Ok(DatasetMatcher::Fields(compiled))
            }
        }
    }
}

impl DatasetMatcher {
    pub fn matches(&self, rel_path: &str, anchor: Anchor) -> bool {
        match self {
            DatasetMatcher::Any => true,
            DatasetMatcher::Names(patterns) => tails(rel_path, anchor)
                .into_iter()
                .any(|tail| patterns.iter().any(|pattern| pattern.is_match(tail))),
            DatasetMatcher::Fields(fields) => {
                let Ok(parsed) = AlfPath::parse(rel_path) else {
                    return false;
                };
                fields.iter().all(|(field, patterns)| match field {
                    Field::Extra => {
                        let joined = parsed.extra.join(".");
                        patterns.iter().any(|pattern| pattern.is_match(&joined))
                    }
                    _ => {
                        let value = parsed.component(*field);
                        patterns.iter().any(|pattern| pattern.is_match(value))
                    }
                })
            }
        }
    }
}

fn tails(rel_path: &str, anchor: Anchor) -> Vec<&str> {
    let rel_path = rel_path.trim_matches('/');
    let (_, revision, filename) = split_rel_path(rel_path);
    match anchor {
        Anchor::Filename => vec![filename],
        Anchor::AfterCollection => {
            let mut out = vec![filename];
            if !revision.is_empty() {
                // `#rev#/filename` is the last two segments of the path
                let start = rel_path.len() - filename.len() - revision.len() - 3;
                out.push(&rel_path[start..]);
            }
            out
        }
        Anchor::AnyTail => {
            let mut out = vec![rel_path];
            out.extend(
                rel_path
                    .match_indices('/')
                    .map(|(index, _)| &rel_path[index + 1..]),
            );
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_full_path() {
        let path = AlfPath::parse("alf/probe00/#2020-08-31#/_ibl_trials.intervals_bpod.npy")
            .unwrap();
        assert_eq!(path.collection.as_deref(), Some("alf/probe00"));
        assert_eq!(path.revision.as_deref(), Some("2020-08-31"));
        assert_eq!(path.namespace.as_deref(), Some("ibl"));
        assert_eq!(path.object, "trials");
        assert_eq!(path.attribute, "intervals");
        assert_eq!(path.timescale.as_deref(), Some("bpod"));
        assert_eq!(path.extension, "npy");
    }

    #[test]
    fn times_suffix_stays_in_attribute() {
        let path = AlfPath::parse("_ibl_trials.stimOn_times_bpod.npy").unwrap();
        assert_eq!(path.attribute, "stimOn_times");
        assert_eq!(path.timescale.as_deref(), Some("bpod"));
    }

    #[test]
    fn bare_collection_is_not_a_revision() {
        let path = AlfPath::parse("2020-01-01/spikes.times.npy").unwrap();
        assert_eq!(path.collection.as_deref(), Some("2020-01-01"));
        assert!(path.revision.is_none());
    }

    #[test]
    fn rejects_missing_extension() {
        let err = AlfPath::parse("alf/spikes.npy").unwrap_err();
        assert_matches!(err, OneError::PathFormat { .. });
    }

    #[test]
    fn uuid_goes_before_extension() {
        let id = Uuid::parse_str("91546fc6-b67c-4a69-badc-5e66088519c4").unwrap();
        assert_eq!(
            with_uuid("alf/_ibl_wheel.position.npy", id),
            "alf/_ibl_wheel.position.91546fc6-b67c-4a69-badc-5e66088519c4.npy"
        );
    }

    #[test]
    fn filename_glob_does_not_cross_segments() {
        let pattern = Pattern::compile("*.meta", true, Scope::Filename).unwrap();
        assert!(pattern.is_match("_spikeglx_ephysData_g0_t0.nidq.meta"));
        assert!(!pattern.is_match("probe00/_spikeglx_ephysData_g0_t0.imec.ap.meta"));
    }
}
