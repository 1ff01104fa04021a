//! Version-sequence reconciliation for registry parents.
//!
//! A registry assigns version numbers contiguously from 1, while an exported model
//! may have holes (deleted versions, earlier failures). Before replay the sequence is
//! made contiguous by synthesizing archived placeholder copies, so that creating the
//! versions in ascending order reproduces the source numbering exactly.

use crate::error::{MigrateError, Result};
use crate::store::{ChildEntity, STAGE_ARCHIVED};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub fn placeholder_description(copied_version: u64) -> String {
    format!(
        "Copy of version {} fixed to not mess with the version ordering",
        copied_version
    )
}

fn version_of(child: &ChildEntity) -> Option<u64> {
    child.as_version().map(|v| v.version)
}

/// Sort registry children by ascending version number.
pub fn sort_by_version(versions: &mut [ChildEntity]) {
    versions.sort_by_key(|c| version_of(c).unwrap_or(u64::MAX));
}

/// Drop versions produced by runs of experiments that no longer exist.
///
/// Returns the number of versions removed.
pub fn remove_missing_experiments(versions: &mut Vec<ChildEntity>, missing: &[String]) -> usize {
    if missing.is_empty() {
        return 0;
    }
    let before = versions.len();
    versions.retain(|child| {
        let excluded = child
            .as_version()
            .and_then(|v| v.experiment_name.as_ref())
            .is_some_and(|name| missing.contains(name));
        if excluded {
            debug!("Dropping version {} of {}: experiment is missing", child.id, child.parent_id);
        }
        !excluded
    });
    before - versions.len()
}

/// Synthesize placeholders for every gap in `[1, max]`.
///
/// Gap `g` is filled with a copy of version `g - 1` (which may itself be a
/// placeholder), or of the lowest existing version when `g == 1`. Returns only the
/// placeholders, in ascending order.
pub fn fill_version_gaps(versions: &[ChildEntity]) -> Vec<ChildEntity> {
    let by_number: BTreeMap<u64, &ChildEntity> = versions
        .iter()
        .filter_map(|c| version_of(c).map(|v| (v, c)))
        .collect();
    let (Some((&lowest, _)), Some((&highest, _))) =
        (by_number.first_key_value(), by_number.last_key_value())
    else {
        return Vec::new();
    };

    let mut placeholders: BTreeMap<u64, ChildEntity> = BTreeMap::new();
    for gap in (1..=highest).filter(|n| !by_number.contains_key(n)) {
        let template = if gap == 1 {
            by_number.get(&lowest).copied()
        } else {
            by_number
                .get(&(gap - 1))
                .copied()
                .or_else(|| placeholders.get(&(gap - 1)))
        };
        let Some(mut placeholder) = template.cloned() else {
            continue;
        };

        placeholder.id = gap.to_string();
        if let Some(data) = placeholder.as_version_mut() {
            data.description = Some(placeholder_description(data.version));
            data.version = gap;
            data.current_stage = STAGE_ARCHIVED.to_string();
        }
        placeholders.insert(gap, placeholder);
    }

    if !placeholders.is_empty() {
        let numbers: Vec<&u64> = placeholders.keys().collect();
        info!("Synthesized placeholder versions {:?}", numbers);
    }
    placeholders.into_values().collect()
}

/// Replace the run of every version that references one of `missing_run_ids` with the
/// run of the nearest lower-numbered version.
///
/// Returns the number of versions rewritten.
pub fn apply_missing_run_overrides(
    versions: &mut [ChildEntity],
    missing_run_ids: &[String],
) -> Result<usize> {
    let mut fixed = 0;
    for run_id in missing_run_ids {
        let Some(broken) = versions
            .iter()
            .position(|c| c.as_version().is_some_and(|v| &v.run_id == run_id))
        else {
            warn!("No version references missing run {}", run_id);
            continue;
        };
        let broken_number = version_of(&versions[broken]).unwrap_or_default();

        let donor = versions
            .iter()
            .filter_map(|c| c.as_version())
            .filter(|v| v.version < broken_number)
            .max_by_key(|v| v.version)
            .cloned()
            .ok_or_else(|| {
                MigrateError::config(format!(
                    "version {} references missing run {} and has no lower version to copy",
                    broken_number, run_id
                ))
            })?;

        if let Some(data) = versions[broken].as_version_mut() {
            data.description = Some(placeholder_description(donor.version));
            data.current_stage = STAGE_ARCHIVED.to_string();
            data.run_id = donor.run_id.clone();
            data.source = donor.source.clone();
            data.user_id = donor.user_id.clone();
            data.run_artifact_uri = donor.run_artifact_uri.clone();
            data.experiment_name = donor.experiment_name.clone();
            info!(
                "Fixed version {} with version {}, new run_id {}",
                data.version, donor.version, data.run_id
            );
            fixed += 1;
        }
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VersionData;
    use proptest::prelude::*;

    fn version(n: u64, run: &str) -> ChildEntity {
        ChildEntity::version(
            "churn",
            VersionData::new(n, run, format!("s3://b/1/{}/artifacts/model", run))
                .with_stage("Production")
                .with_experiment_name("/Shared/churn"),
        )
    }

    fn numbers(versions: &[ChildEntity]) -> Vec<u64> {
        versions.iter().filter_map(version_of).collect()
    }

    #[test]
    fn test_fills_interior_gaps() {
        let existing = vec![version(1, "a"), version(2, "b"), version(4, "d"), version(6, "f")];
        let placeholders = fill_version_gaps(&existing);
        assert_eq!(numbers(&placeholders), vec![3, 5]);

        let three = placeholders[0].as_version().unwrap();
        assert_eq!(three.run_id, "b");
        assert_eq!(three.current_stage, STAGE_ARCHIVED);
        assert_eq!(
            three.description.as_deref(),
            Some("Copy of version 2 fixed to not mess with the version ordering")
        );
        assert_eq!(placeholders[0].id, "3");
        assert_eq!(placeholders[1].as_version().unwrap().run_id, "d");
    }

    #[test]
    fn test_leading_gap_copies_lowest() {
        let placeholders = fill_version_gaps(&[version(3, "c")]);
        assert_eq!(numbers(&placeholders), vec![1, 2]);
        assert!(placeholders
            .iter()
            .all(|p| p.as_version().unwrap().run_id == "c"));
        // Version 2 chains from placeholder 1.
        assert_eq!(
            placeholders[1].as_version().unwrap().description.as_deref(),
            Some("Copy of version 1 fixed to not mess with the version ordering")
        );
    }

    #[test]
    fn test_wide_gap_chains_from_previous_placeholder() {
        let placeholders = fill_version_gaps(&[version(1, "a"), version(20_000, "z")]);
        assert_eq!(placeholders.len(), 19_998);
        assert_eq!(numbers(&placeholders), (2..20_000).collect::<Vec<_>>());
        assert!(placeholders
            .iter()
            .all(|p| p.as_version().unwrap().run_id == "a"));
        assert_eq!(
            placeholders[19_997].as_version().unwrap().description.as_deref(),
            Some("Copy of version 19998 fixed to not mess with the version ordering")
        );
    }

    #[test]
    fn test_no_gaps_and_empty() {
        assert!(fill_version_gaps(&[version(1, "a"), version(2, "b")]).is_empty());
        assert!(fill_version_gaps(&[]).is_empty());
    }

    #[test]
    fn test_remove_missing_experiments() {
        let mut versions = vec![
            version(1, "a"),
            ChildEntity::version(
                "churn",
                VersionData::new(2, "b", "s3://b/2/b/model").with_experiment_name("/Users/gone"),
            ),
        ];
        let removed = remove_missing_experiments(&mut versions, &["/Users/gone".to_string()]);
        assert_eq!(removed, 1);
        assert_eq!(numbers(&versions), vec![1]);
    }

    #[test]
    fn test_missing_run_override_copies_lower_version() {
        let mut versions = vec![version(1, "a"), version(2, "broken"), version(3, "c")];
        let fixed = apply_missing_run_overrides(&mut versions, &["broken".to_string()]).unwrap();
        assert_eq!(fixed, 1);

        let two = versions[1].as_version().unwrap();
        assert_eq!(two.version, 2);
        assert_eq!(two.run_id, "a");
        assert_eq!(two.source, "s3://b/1/a/artifacts/model");
        assert_eq!(two.current_stage, STAGE_ARCHIVED);
    }

    #[test]
    fn test_missing_run_override_on_first_version_fails() {
        let mut versions = vec![version(1, "broken"), version(2, "b")];
        let err = apply_missing_run_overrides(&mut versions, &["broken".to_string()]).unwrap_err();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn test_unknown_missing_run_is_ignored() {
        let mut versions = vec![version(1, "a")];
        assert_eq!(
            apply_missing_run_overrides(&mut versions, &["zzz".to_string()]).unwrap(),
            0
        );
        assert_eq!(versions[0].as_version().unwrap().current_stage, "Production");
    }

    proptest! {
        #[test]
        fn prop_reconciled_sequence_is_contiguous(
            existing in proptest::collection::btree_set(1u64..60, 1..20)
        ) {
            let versions: Vec<ChildEntity> = existing
                .iter()
                .map(|n| version(*n, &format!("run-{}", n)))
                .collect();
            let placeholders = fill_version_gaps(&versions);

            let mut all = versions.clone();
            all.extend(placeholders.iter().cloned());
            sort_by_version(&mut all);

            let max = *existing.iter().max().unwrap();
            prop_assert_eq!(numbers(&all), (1..=max).collect::<Vec<_>>());
            prop_assert_eq!(placeholders.len() as u64, max - existing.len() as u64);

            for p in &placeholders {
                let data = p.as_version().unwrap();
                prop_assert_eq!(data.current_stage.as_str(), STAGE_ARCHIVED);
                let expected_run = if data.version == 1 {
                    all.iter().find(|c| existing.contains(&version_of(c).unwrap()))
                        .and_then(|c| c.as_version()).map(|v| v.run_id.clone())
                } else {
                    all[(data.version - 2) as usize].as_version().map(|v| v.run_id.clone())
                };
                prop_assert_eq!(Some(data.run_id.clone()), expected_run);
            }
        }
    }
}
