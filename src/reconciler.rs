// ⚖️ Enrollment Reconciler - intervals × memberships → enrollment rows
//
// Every affiliation interval of an identity is enrolled once per project the
// identity contributed to. Rows are keyed by (uuid, valid_from, valid_until, project).

use crate::intervals::AffiliationInterval;
use crate::membership::MembershipMap;
use crate::store::{EnrollmentRow, OrganizationInsert, ProfileStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

const PROGRESS_EVERY: usize = 1000;

// ============================================================================
// COMPANY CACHE
// ============================================================================

/// Lower-cased company name → organization id
#[derive(Debug, Default)]
pub struct CompanyCache {
    ids: HashMap<String, i64>,
    created: usize,
}

impl CompanyCache {
    pub fn new(ids: HashMap<String, i64>) -> Self {
        CompanyCache { ids, created: 0 }
    }

    pub fn load(store: &ProfileStore) -> Result<Self> {
        Ok(Self::new(store.load_organizations()?))
    }

    pub fn get(&self, company: &str) -> Option<i64> {
        self.ids.get(&company.to_lowercase()).copied()
    }

    /// Organizations inserted by this cache
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id for `company`, inserting the organization on first use
    pub fn ensure(&mut self, store: &ProfileStore, company: &str) -> Result<i64> {
        let key = company.to_lowercase();
        if let Some(id) = self.ids.get(&key) {
            return Ok(*id);
        }

        let id = match store.insert_organization(company)? {
            OrganizationInsert::Created(id) => {
                self.created += 1;
                id
            }
            OrganizationInsert::Existing(id) => {
                tracing::warn!(company, id, "organization name collision, using existing row");
                id
            }
        };
        self.ids.insert(key, id);
        Ok(id)
    }
}

// ============================================================================
// PLANNING
// ============================================================================

/// One enrollment the run intends to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCandidate {
    pub uuid: String,
    pub company: String,
    pub project: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Candidates of one interval; nothing when the identity has no membership
pub fn candidates_for(
    interval: &AffiliationInterval,
    memberships: &MembershipMap,
) -> Vec<EnrollmentCandidate> {
    memberships
        .get(&interval.uuid)
        .map(|projects| {
            projects
                .iter()
                .map(|project| EnrollmentCandidate {
                    uuid: interval.uuid.clone(),
                    company: interval.company.clone(),
                    project: project.clone(),
                    valid_from: interval.valid_from,
                    valid_until: interval.valid_until,
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn plan(intervals: &[AffiliationInterval], memberships: &MembershipMap) -> Vec<EnrollmentCandidate> {
    intervals
        .iter()
        .flat_map(|interval| candidates_for(interval, memberships))
        .collect()
}

/// Write the plan as CSV (one row per candidate)
pub fn export_plan_csv(path: &Path, candidates: &[EnrollmentCandidate]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create plan file {}", path.display()))?;
    for candidate in candidates {
        writer.serialize(candidate)?;
    }
    writer.flush()?;
    Ok(())
}

// ============================================================================
// APPLYING
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertMode {
    /// Keep existing rows with the same key
    #[default]
    Idempotent,
    /// Delete rows with the same key, then insert
    Replace,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Identities with at least one enrollment written
    pub updated: BTreeSet<String>,
    /// Identities with a candidate already present, or with no membership at all
    pub not_updated: BTreeSet<String>,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
}

impl ReconcileReport {
    fn merge_candidate(&mut self, uuid: &str, written: bool) {
        if written {
            self.updated.insert(uuid.to_string());
        } else {
            self.not_updated.insert(uuid.to_string());
        }
    }
}

pub struct EnrollmentReconciler<'a> {
    store: &'a ProfileStore,
    mode: UpsertMode,
}

impl<'a> EnrollmentReconciler<'a> {
    pub fn new(store: &'a ProfileStore, mode: UpsertMode) -> Self {
        EnrollmentReconciler { store, mode }
    }

    /// Enroll every interval into each project of its identity
    pub fn reconcile(
        &self,
        companies: &mut CompanyCache,
        intervals: &[AffiliationInterval],
        memberships: &MembershipMap,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for (i, interval) in intervals.iter().enumerate() {
            if i > 0 && i % PROGRESS_EVERY == 0 {
                tracing::info!(done = i, total = intervals.len(), "enrollment progress");
            }
            let candidates = candidates_for(interval, memberships);
            if candidates.is_empty() {
                report.merge_candidate(&interval.uuid, false);
            }
            for candidate in &candidates {
                self.apply_one(companies, candidate, &mut report)?;
            }
        }

        Ok(report)
    }

    fn apply_one(
        &self,
        companies: &mut CompanyCache,
        candidate: &EnrollmentCandidate,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let EnrollmentCandidate {
            uuid,
            project,
            valid_from,
            valid_until,
            ..
        } = candidate;

        match self.mode {
            UpsertMode::Idempotent => {
                if self
                    .store
                    .enrollment_exists(uuid, valid_from, valid_until, project)?
                {
                    report.skipped += 1;
                    report.merge_candidate(uuid, false);
                    return Ok(());
                }
            }
            UpsertMode::Replace => {
                report.replaced += self
                    .store
                    .delete_enrollment(uuid, valid_from, valid_until, project)?;
            }
        }

        let organization_id = companies.ensure(self.store, &candidate.company)?;
        self.store.insert_enrollment(&EnrollmentRow {
            uuid: uuid.clone(),
            organization_id,
            project: project.clone(),
            valid_from: *valid_from,
            valid_until: *valid_until,
        })?;
        report.inserted += 1;
        report.merge_candidate(uuid, true);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
