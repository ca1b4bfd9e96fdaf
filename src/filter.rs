use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::alf::{Anchor, DatasetSelector, Pattern, Scope};
use crate::domain::{DatasetRecord, Qc};
use crate::error::{Advisory, OneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    pub assert_unique: bool,
    pub ignore_qc_not_set: bool,
    /// Rows with a QC outcome at or above this value are dropped.
    pub qc_threshold: Qc,
    pub wildcards: bool,
    pub revision_last_before: bool,
    /// Treat revision disagreement between groups as an error instead of an advisory.
    pub assert_consistent: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            assert_unique: true,
            ignore_qc_not_set: false,
            qc_threshold: Qc::Critical,
            wildcards: false,
            revision_last_before: true,
            assert_consistent: false,
        }
    }
}

impl FilterOptions {
    pub fn listing() -> Self {
        Self {
            assert_unique: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filtered<'a> {
    pub records: Vec<&'a DatasetRecord>,
    pub advisories: Vec<Advisory>,
}

impl<'a> Filtered<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rel_paths(&self) -> Vec<&'a str> {
        self.records
            .iter()
            .map(|record| record.rel_path.as_str())
            .collect()
    }

    pub fn cloned(&self) -> Vec<DatasetRecord> {
        self.records.iter().map(|record| (*record).clone()).collect()
    }
}

/// Selects datasets by name, collection and revision, resolves revisions and applies
/// the QC threshold.
///
/// With `revision_last_before` the revision argument is a cutoff: each object resolves
/// to its default revision, or to the latest revision not after the cutoff. Otherwise it
/// is a pattern matched against the revision label.
pub fn filter_datasets<'a, I>(
    records: I,
    dataset: &DatasetSelector,
    collection: Option<&str>,
    revision: Option<&str>,
    options: &FilterOptions,
) -> Result<Filtered<'a>, OneError>
where
    I: IntoIterator<Item = &'a DatasetRecord>,
{
    let matcher = dataset.compile(options.wildcards)?;
    let collection_pattern = collection
        .map(|value| Pattern::compile(value, options.wildcards, Scope::Collection))
        .transpose()?;
    let revision_pattern = match revision {
        Some(value) if !options.revision_last_before => {
            Some(Pattern::compile(value, options.wildcards, Scope::Filename)?)
        }
        _ => None,
    };
    let anchor = if revision_pattern.is_some() {
        Anchor::Filename
    } else if collection_pattern.is_some() {
        Anchor::AfterCollection
    } else {
        Anchor::AnyTail
    };

    let matched = records
        .into_iter()
        .filter(|record| {
            collection_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(record.collection()))
                && revision_pattern
                    .as_ref()
                    .is_none_or(|pattern| pattern.is_match(record.revision()))
                && matcher.matches(&record.rel_path, anchor)
        })
        .collect::<Vec<_>>();

    let mut out = Filtered::default();
    if matched.is_empty() {
        return Ok(out);
    }

    if options.assert_unique {
        let collections = distinct(matched.iter().map(|record| record.collection()));
        if collections.len() > 1 {
            return Err(OneError::MultipleCollectionsFound(quoted(&collections)));
        }
    }

    let resolved = if options.revision_last_before {
        resolve_last_before(
            matched,
            revision,
            options.assert_unique,
            options.assert_consistent,
            &mut out.advisories,
        )?
    } else {
        if options.assert_unique {
            let revisions = distinct(matched.iter().map(|record| record.revision()));
            if revisions.len() > 1 {
                return Err(OneError::MultipleRevisionsFound(quoted(&revisions)));
            }
        }
        matched
    };

    out.records = resolved
        .into_iter()
        .filter(|record| {
            record.qc < options.qc_threshold
                && !(options.ignore_qc_not_set && record.qc == Qc::NotSet)
        })
        .collect();

    if options.assert_unique {
        let identities = distinct(out.records.iter().map(|record| record.identity()));
        if identities.len() > 1 {
            return Err(OneError::MultipleObjectsFound(quoted(&identities)));
        }
    }
    Ok(out)
}

/// Index of the latest revision not after `cutoff`, or of the latest revision overall
/// when there is no cutoff. The empty revision sorts before every dated one.
pub fn index_last_before(revisions: &[&str], cutoff: Option<&str>) -> Option<usize> {
    revisions
        .iter()
        .enumerate()
        .filter(|(_, revision)| cutoff.is_none_or(|cutoff| **revision <= cutoff))
        .fold(None, |best: Option<(usize, &str)>, (index, revision)| match best {
            Some((_, current)) if current >= *revision => best,
            _ => Some((index, *revision)),
        })
        .map(|(index, _)| index)
}

pub fn resolve_last_before<'a>(
    rows: Vec<&'a DatasetRecord>,
    cutoff: Option<&str>,
    assert_unique: bool,
    assert_consistent: bool,
    advisories: &mut Vec<Advisory>,
) -> Result<Vec<&'a DatasetRecord>, OneError> {
    let mut order = Vec::<String>::new();
    let mut groups = HashMap::<String, Vec<(usize, &'a DatasetRecord)>>::new();
    for (position, row) in rows.into_iter().enumerate() {
        let identity = row.identity();
        if !groups.contains_key(&identity) {
            order.push(identity.clone());
        }
        groups.entry(identity).or_default().push((position, row));
    }

    let mut winners = Vec::new();
    for identity in order {
        let group = groups.remove(&identity).unwrap_or_default();
        if let Some(winner) = pick_revision(&identity, group, cutoff, assert_unique, advisories)? {
            winners.push(winner);
        }
    }
    winners.sort_by_key(|(position, _)| *position);
    let winners = winners.into_iter().map(|(_, row)| row).collect::<Vec<_>>();

    let mut revisions = Vec::<String>::new();
    for row in &winners {
        if !revisions.iter().any(|revision| revision == row.revision()) {
            revisions.push(row.revision().to_string());
        }
    }
    if revisions.len() > 1 {
        if assert_consistent {
            return Err(OneError::MultipleRevisionsFound(quoted(&revisions)));
        }
        let advisory = Advisory::MultipleRevisions { revisions };
        warn!("{advisory}");
        advisories.push(advisory);
    }
    Ok(winners)
}

fn pick_revision<'a>(
    identity: &str,
    group: Vec<(usize, &'a DatasetRecord)>,
    cutoff: Option<&str>,
    assert_unique: bool,
    advisories: &mut Vec<Advisory>,
) -> Result<Option<(usize, &'a DatasetRecord)>, OneError> {
    if cutoff.is_none() {
        if group.iter().any(|(_, row)| row.default_revision.is_some()) {
            let defaults = group
                .iter()
                .filter(|(_, row)| row.default_revision == Some(true))
                .collect::<Vec<_>>();
            if assert_unique && defaults.len() > 1 {
                let revisions = defaults
                    .iter()
                    .map(|(_, row)| row.revision().to_string())
                    .collect::<Vec<_>>();
                return Err(OneError::MultipleRevisionsFound(quoted(&revisions)));
            }
            if let [only] = defaults.as_slice() {
                return Ok(Some(**only));
            }
            if let [only] = group.as_slice() {
                return Ok(Some(*only));
            }
            if assert_unique {
                return Err(OneError::NoDefaultRevision(identity.to_string()));
            }
        }
        let advisory = Advisory::NoDefaultRevision {
            dataset: identity.to_string(),
        };
        warn!("{advisory}");
        advisories.push(advisory);
    }

    let revisions = group
        .iter()
        .map(|(_, row)| row.revision())
        .collect::<Vec<_>>();
    Ok(index_last_before(&revisions, cutoff).map(|index| group[index]))
}

/// Sorted distinct collections of a record set; the root collection is `""`.
pub fn list_collections<'a, I>(records: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a DatasetRecord>,
{
    distinct(records.into_iter().map(|record| record.collection()))
}

pub fn list_revisions<'a, I>(records: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a DatasetRecord>,
{
    distinct(records.into_iter().map(|record| record.revision()))
}

fn distinct<T: AsRef<str>>(values: impl IntoIterator<Item = T>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn quoted(values: &[String]) -> String {
    format!("\"{}\"", values.join("\", \""))
}
