mod common;

use assert_matches::assert_matches;

use one_client::alf::{DatasetSelector, Field, FieldSelector};
use one_client::domain::{DatasetRecord, Qc};
use one_client::error::{Advisory, OneError};
use one_client::filter::{FilterOptions, filter_datasets, list_collections, list_revisions};

use common::row;

fn session_rows() -> Vec<DatasetRecord> {
    [
        "alf/_ibl_wheel.position.npy",
        "alf/_ibl_wheel.timestamps.npy",
        "raw_video_data/_iblrig_leftCamera.raw.mp4",
        "raw_behavior_data/_iblrig_taskSettings.raw.json",
        "raw_video_data/_iblrig_leftCamera.timestamps.ssv",
    ]
    .into_iter()
    .enumerate()
    .map(|(index, rel_path)| row(1, index as u128 + 1, rel_path))
    .collect()
}

fn revision_rows() -> Vec<DatasetRecord> {
    [
        "alf/probe00/#2020-01-01#/spikes.times.npy",
        "alf/probe00/#2020-08-31#/spikes.times.npy",
        "alf/probe00/spikes.times.npy",
        "alf/probe00/#2021-xx-xx#/spikes.times.npy",
        "alf/probe01/#2020-01-01#/spikes.times.npy",
    ]
    .into_iter()
    .enumerate()
    .map(|(index, rel_path)| row(1, index as u128 + 1, rel_path))
    .collect()
}

fn exact() -> FilterOptions {
    FilterOptions {
        revision_last_before: false,
        ..FilterOptions::default()
    }
}

fn listing_exact() -> FilterOptions {
    FilterOptions {
        assert_unique: false,
        revision_last_before: false,
        ..FilterOptions::default()
    }
}

#[test]
fn no_selectors_return_everything() {
    let rows = session_rows();
    let filtered = filter_datasets(&rows, &DatasetSelector::Any, None, None, &listing_exact())
        .unwrap();
    assert_eq!(filtered.len(), rows.len());
}

#[test]
fn collection_filter() {
    let mut rows = session_rows();
    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, Some("alf"), None, &listing_exact())
            .unwrap();
    assert_eq!(filtered.len(), 2);

    let err = filter_datasets(&rows, &DatasetSelector::Any, Some("raw.*"), None, &exact())
        .unwrap_err();
    assert_matches!(err, OneError::MultipleCollectionsFound(_));

    rows[4].rel_path = "_ibl_trials.rewardVolume.npy".to_string();
    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, Some(""), None, &exact()).unwrap();
    assert_eq!(filtered.rel_paths(), vec!["_ibl_trials.rewardVolume.npy"]);
}

#[test]
fn dataset_name_filter() {
    let rows = session_rows();
    let filtered = filter_datasets(
        &rows,
        &DatasetSelector::from("_iblrig_.*"),
        None,
        None,
        &listing_exact(),
    )
    .unwrap();
    assert_eq!(filtered.len(), 3);

    let err = filter_datasets(
        &rows,
        &DatasetSelector::from("_iblrig_.*"),
        Some("raw_video_data"),
        None,
        &exact(),
    )
    .unwrap_err();
    assert_matches!(err, OneError::MultipleObjectsFound(_));
}

#[test]
fn name_list_is_a_logical_or() {
    let rows = session_rows();
    let selector = DatasetSelector::from(vec!["alf/_ibl_wheel.*", "_ibl_trials.*"]);
    let filtered = filter_datasets(&rows, &selector, None, None, &listing_exact()).unwrap();
    assert_eq!(
        filtered.rel_paths(),
        vec!["alf/_ibl_wheel.position.npy", "alf/_ibl_wheel.timestamps.npy"]
    );
}

#[test]
fn field_selectors() {
    let rows = session_rows();
    let selector = DatasetSelector::from(
        FieldSelector::default()
            .with(Field::Namespace, &["ibl"])
            .with(Field::Object, &["wheel"]),
    );
    let filtered = filter_datasets(&rows, &selector, None, None, &listing_exact()).unwrap();
    assert_eq!(filtered.len(), 2);

    let selector =
        DatasetSelector::from(FieldSelector::default().with(Field::Attribute, &["time.+", "raw"]));
    let filtered = filter_datasets(&rows, &selector, None, None, &listing_exact()).unwrap();
    assert_eq!(filtered.len(), 4);

    let options = FilterOptions {
        wildcards: true,
        ..listing_exact()
    };
    let selector = DatasetSelector::from(
        FieldSelector::default().with(Field::Attribute, &["timestamp?", "raw"]),
    );
    let filtered = filter_datasets(&rows, &selector, None, None, &options).unwrap();
    assert_eq!(filtered.len(), 4);
}

#[test]
fn qc_threshold() {
    let mut rows = session_rows();
    for (row, qc) in rows.iter_mut().zip(Qc::ALL) {
        row.qc = qc;
    }
    let listing = FilterOptions::listing();
    let filtered = filter_datasets(&rows, &DatasetSelector::Any, None, None, &listing).unwrap();
    assert_eq!(filtered.len(), 4);
    assert!(filtered.records.iter().all(|row| row.qc < Qc::Critical));

    let options = FilterOptions {
        ignore_qc_not_set: true,
        ..listing
    };
    let filtered = filter_datasets(&rows, &DatasetSelector::Any, None, None, &options).unwrap();
    assert_eq!(filtered.len(), 3);
    assert!(filtered.records.iter().all(|row| row.qc > Qc::NotSet));

    let options = FilterOptions {
        qc_threshold: "FAIL".parse().unwrap(),
        ..listing
    };
    let filtered = filter_datasets(&rows, &DatasetSelector::Any, None, None, &options).unwrap();
    assert_eq!(filtered.len(), 3);

    let options = FilterOptions {
        qc_threshold: Qc::Warning,
        ignore_qc_not_set: true,
        ..listing
    };
    let filtered = filter_datasets(&rows, &DatasetSelector::Any, None, None, &options).unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered.records[0].qc, Qc::Pass);
}

#[test]
fn last_before_mixed_revisions_warn() {
    let rows = revision_rows();
    let filtered = filter_datasets(
        &rows,
        &DatasetSelector::Any,
        None,
        Some("2020-09-06"),
        &FilterOptions::listing(),
    )
    .unwrap();
    assert_eq!(
        filtered.rel_paths(),
        vec![
            "alf/probe00/#2020-08-31#/spikes.times.npy",
            "alf/probe01/#2020-01-01#/spikes.times.npy",
        ]
    );
    assert_eq!(filtered.advisories.len(), 1);
    assert_eq!(
        filtered.advisories[0].to_string(),
        "Multiple revisions: \"2020-08-31\", \"2020-01-01\""
    );
}

#[test]
fn latest_revision_without_default_column() {
    let rows = revision_rows();
    let options = FilterOptions {
        wildcards: true,
        ..FilterOptions::default()
    };
    let filtered = filter_datasets(
        &rows,
        &DatasetSelector::from("*spikes.times*"),
        Some("alf/probe00"),
        None,
        &options,
    )
    .unwrap();
    assert_eq!(filtered.rel_paths(), vec!["alf/probe00/#2021-xx-xx#/spikes.times.npy"]);
    assert_matches!(
        filtered.advisories.as_slice(),
        [Advisory::NoDefaultRevision { .. }]
    );

    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, None, None, &FilterOptions::listing())
            .unwrap();
    let revisions = filtered
        .records
        .iter()
        .map(|row| row.revision())
        .collect::<Vec<_>>();
    assert_eq!(revisions, vec!["2021-xx-xx", "2020-01-01"]);
}

#[test]
fn revision_pattern_when_not_last_before() {
    let rows = revision_rows();
    let filtered = filter_datasets(
        &rows,
        &DatasetSelector::Any,
        None,
        Some(r"2020-08-\d{2}"),
        &listing_exact(),
    )
    .unwrap();
    assert_eq!(filtered.rel_paths(), vec!["alf/probe00/#2020-08-31#/spikes.times.npy"]);

    let err = filter_datasets(
        &rows,
        &DatasetSelector::Any,
        Some(".*probe00"),
        Some(r"2020-0[18]-\d{2}"),
        &exact(),
    )
    .unwrap_err();
    assert_matches!(err, OneError::MultipleRevisionsFound(_));
}

#[test]
fn empty_cutoff_selects_unrevised() {
    let rows = revision_rows();
    let listing = FilterOptions::listing();
    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, None, Some(""), &listing).unwrap();
    assert_eq!(filtered.rel_paths(), vec!["alf/probe00/spikes.times.npy"]);

    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, Some(".*01"), Some(""), &listing).unwrap();
    assert!(filtered.is_empty());

    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, Some(".*01"), None, &listing).unwrap();
    assert_eq!(filtered.rel_paths(), vec!["alf/probe01/#2020-01-01#/spikes.times.npy"]);
}

#[test]
fn default_revision_wins() {
    let mut rows = revision_rows();
    for (index, row) in rows.iter_mut().enumerate() {
        row.default_revision = Some(index == 0);
    }
    let filtered =
        filter_datasets(&rows, &DatasetSelector::Any, None, None, &FilterOptions::listing())
            .unwrap();
    assert_eq!(filtered.records[0].rel_path, rows[0].rel_path);

    let options = FilterOptions {
        wildcards: true,
        ..FilterOptions::default()
    };
    let filtered = filter_datasets(
        &rows,
        &DatasetSelector::from("*spikes.times*"),
        Some("alf/probe00"),
        None,
        &options,
    )
    .unwrap();
    assert_eq!(filtered.rel_paths(), vec!["alf/probe00/#2020-01-01#/spikes.times.npy"]);
    assert!(filtered.advisories.is_empty());

    let options = FilterOptions {
        wildcards: true,
        revision_last_before: false,
        ..FilterOptions::default()
    };
    let err = filter_datasets(
        &rows,
        &DatasetSelector::from("*spikes.times*"),
        Some("alf/probe00"),
        None,
        &options,
    )
    .unwrap_err();
    assert_matches!(err, OneError::MultipleRevisionsFound(_));
}

#[test]
fn two_defaults_are_ambiguous() {
    let mut rows = revision_rows();
    rows[0].default_revision = Some(true);
    rows[1].default_revision = Some(true);
    let err = filter_datasets(
        &rows,
        &DatasetSelector::from("spikes.times.npy"),
        Some("alf/probe00"),
        None,
        &FilterOptions::default(),
    )
    .unwrap_err();
    assert_matches!(err, OneError::MultipleRevisionsFound(_));
}

#[test]
fn filename_glob_does_not_capture_subcollections() {
    let rows = [
        "raw_ephys_data/_spikeglx_ephysData_g0_t0.nidq.meta",
        "raw_ephys_data/probe00/_spikeglx_ephysData_g0_t0.imec0.ap.meta",
        "raw_ephys_data/probe01/_spikeglx_ephysData_g0_t0.imec1.ap.meta",
    ]
    .into_iter()
    .enumerate()
    .map(|(index, rel_path)| row(1, index as u128 + 1, rel_path))
    .collect::<Vec<_>>();
    let options = FilterOptions {
        wildcards: true,
        ..listing_exact()
    };
    let selector = DatasetSelector::from("*.meta");

    let filtered = filter_datasets(&rows, &selector, Some("raw_ephys_data"), None, &options)
        .unwrap();
    assert_eq!(
        filtered.rel_paths(),
        vec!["raw_ephys_data/_spikeglx_ephysData_g0_t0.nidq.meta"]
    );
    let filtered =
        filter_datasets(&rows, &selector, Some("raw_ephys_data/probe??"), None, &options)
            .unwrap();
    assert_eq!(filtered.len(), 2);
    let filtered = filter_datasets(&rows, &selector, Some("raw_ephys_data*"), None, &options)
        .unwrap();
    assert_eq!(filtered.len(), 3);
}

#[test]
fn collections_and_revisions_are_sorted_and_distinct() {
    let rows = revision_rows();
    assert_eq!(list_collections(&rows), vec!["alf/probe00", "alf/probe01"]);
    assert_eq!(
        list_revisions(&rows),
        vec!["", "2020-01-01", "2020-08-31", "2021-xx-xx"]
    );
}

#[test]
fn last_before_is_idempotent() {
    let mut rows = revision_rows();
    let mut defaulted = revision_rows();
    defaulted[1].default_revision = Some(true);
    rows.extend(session_rows().into_iter().map(|mut row| {
        row.id = uuid::Uuid::from_u128(row.id.as_u128() + 100);
        row
    }));

    for (records, cutoff) in [
        (&rows, Some("2020-09-06")),
        (&rows, None),
        (&rows, Some("")),
        (&defaulted, Some("2020-01-05")),
        (&defaulted, None),
    ] {
        let options = FilterOptions::listing();
        let once = filter_datasets(records.iter(), &DatasetSelector::Any, None, cutoff, &options)
            .unwrap();
        let twice = filter_datasets(
            once.records.iter().copied(),
            &DatasetSelector::Any,
            None,
            cutoff,
            &options,
        )
        .unwrap();
        assert_eq!(once.rel_paths(), twice.rel_paths(), "cutoff {cutoff:?}");
    }
}
