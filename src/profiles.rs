// 👤 Profile Updater - gender and country attributes from the affiliation feed

use crate::feeds::AffiliationRecord;
use crate::store::{ProfileChanges, ProfileStore};
use anyhow::Result;
use std::collections::{BTreeSet, HashSet};

/// Column changes a record implies; unknown country codes are logged and dropped
pub fn profile_changes(record: &AffiliationRecord, countries: &HashSet<String>) -> ProfileChanges {
    let mut changes = ProfileChanges::default();

    match record.sex.as_deref() {
        Some("m") => changes.gender = Some("male".to_string()),
        Some("f") => changes.gender = Some("female".to_string()),
        _ => {}
    }

    if let Some(prob) = record.sex_prob {
        changes.gender_acc = Some((prob * 100.0) as i64);
    }

    if let Some(country) = record.country_id.as_deref().filter(|c| !c.is_empty()) {
        if countries.contains(&country.to_lowercase()) {
            changes.country_code = Some(country.to_uppercase());
        } else {
            tracing::warn!(login = %record.login, country, "unknown country code, skipped");
        }
    }

    changes
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProfileReport {
    pub updated: BTreeSet<String>,
    pub not_updated: BTreeSet<String>,
}

/// Apply record attributes to every matched identity
pub fn apply_profile_updates(
    store: &ProfileStore,
    matches: &[(AffiliationRecord, BTreeSet<String>)],
    countries: &HashSet<String>,
) -> Result<ProfileReport> {
    let mut report = ProfileReport::default();

    for (record, uuids) in matches {
        let changes = profile_changes(record, countries);
        for uuid in uuids {
            if !changes.is_empty() && store.update_profile(uuid, &changes)? > 0 {
                report.updated.insert(uuid.clone());
            } else {
                report.not_updated.insert(uuid.clone());
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countries() -> HashSet<String> {
        ["pl", "us"].iter().map(|c| c.to_string()).collect()
    }

    fn record(sex: Option<&str>, prob: Option<f64>, country: Option<&str>) -> AffiliationRecord {
        AffiliationRecord {
            login: "jdoe".into(),
            sex: sex.map(str::to_string),
            sex_prob: prob,
            country_id: country.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_changes_map_sex_probability_and_country() {
        let changes = profile_changes(&record(Some("f"), Some(0.876), Some("pl")), &countries());

        assert_eq!(changes.gender.as_deref(), Some("female"));
        assert_eq!(changes.gender_acc, Some(87));
        assert_eq!(changes.country_code.as_deref(), Some("PL"));
    }

    #[test]
    fn test_unknown_values_are_skipped() {
        let changes = profile_changes(&record(Some("x"), None, Some("zz")), &countries());
        assert!(changes.is_empty());

        let male = profile_changes(&record(Some("m"), None, None), &countries());
        assert_eq!(male.gender.as_deref(), Some("male"));
    }

    #[test]
    fn test_apply_reports_updated_and_not_updated() {
        let store = ProfileStore::open_in_memory().unwrap();
        store.add_identity("u1", None, Some("jdoe"), "github");
        store.add_country("PL");

        let matches = vec![
            (
                record(Some("m"), Some(0.5), Some("PL")),
                BTreeSet::from(["u1".to_string(), "ghost".to_string()]),
            ),
            (record(None, None, None), BTreeSet::from(["u2".to_string()])),
        ];
        let known: HashSet<String> = store.load_country_codes().unwrap().into_iter().collect();

        let report = apply_profile_updates(&store, &matches, &known).unwrap();

        assert_eq!(report.updated, BTreeSet::from(["u1".to_string()]));
        assert_eq!(
            report.not_updated,
            BTreeSet::from(["ghost".to_string(), "u2".to_string()])
        );
        assert_eq!(store.profile_column("u1", "country_code").as_deref(), Some("PL"));
        assert_eq!(store.profile_column("u1", "gender_acc").as_deref(), Some("50"));
    }
}
