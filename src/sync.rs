// 🔄 Sync Pipeline - one full affiliation pass over the profile store
//
// Order matters: everything that can fail on bad input (alias rules, dates)
// runs before the first profile or enrollment write.

use crate::feeds::AffiliationRecord;
use crate::identities::IdentityIndex;
use crate::intervals::{parse_spans, AffiliationInterval};
use crate::membership::{MembershipFetcher, DEFAULT_FETCH_SIZE, DEFAULT_TERMS_SIZE};
use crate::profiles::{apply_profile_updates, ProfileReport};
use crate::reconciler::{
    export_plan_csv, plan, CompanyCache, EnrollmentReconciler, ReconcileReport, UpsertMode,
};
use crate::resolver::{AliasRule, CompanyResolver};
use crate::search::SearchBackend;
use crate::store::ProfileStore;
use crate::touch::{BatchTouchUpdater, DEFAULT_TOUCH_BATCH_SIZE};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use tracing::Instrument;
use uuid::Uuid;

// ============================================================================
// OPTIONS & INPUTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub mode: UpsertMode,
    pub only_github: bool,
    pub profile_updates: bool,
    pub cleanup: bool,
    pub test_connect: bool,
    pub dry_run: bool,
    pub plan_csv: Option<PathBuf>,
    pub fetch_size: usize,
    pub terms_size: usize,
    pub touch_batch_size: usize,
    /// Membership pool size override
    pub workers: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            mode: UpsertMode::Idempotent,
            only_github: false,
            profile_updates: true,
            cleanup: false,
            test_connect: false,
            dry_run: false,
            plan_csv: None,
            fetch_size: DEFAULT_FETCH_SIZE,
            terms_size: DEFAULT_TERMS_SIZE,
            touch_batch_size: DEFAULT_TOUCH_BATCH_SIZE,
            workers: None,
        }
    }
}

/// Everything read from local feeds before the run starts
#[derive(Debug, Clone, Default)]
pub struct SyncInputs {
    pub records: Vec<AffiliationRecord>,
    pub rules: Vec<AliasRule>,
    pub projects: Vec<String>,
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub test_connect: bool,
    pub dry_run: bool,
    /// Records that matched at least one identity
    pub hits: usize,
    /// Intervals across all matched identities
    pub affiliations: usize,
    pub companies: usize,
    pub updated_profiles: usize,
    pub not_updated_profiles: usize,
    pub updated_enrollments: usize,
    pub not_updated_enrollments: usize,
    pub updated_uuids: usize,
    pub not_updated_uuids: usize,
    /// Identity rows stamped as modified
    pub actual_updates: usize,
    pub planned_enrollments: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub uuids_without_projects: usize,
    pub failed_fetch_tasks: usize,
    pub resolver_lines: Vec<String>,
    pub used_mappings: Vec<(String, String)>,
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.test_connect {
            return writeln!(f, "Test mode: connection ok");
        }
        if self.dry_run {
            writeln!(
                f,
                "Dry run: {} enrollments planned, nothing written",
                self.planned_enrollments
            )?;
        }
        writeln!(
            f,
            "Hits: {}, affiliations: {}, companies: {}, updated profiles: {}, updated enrollments: {}, \
             updated uuids: {}, actual updates: {}, not updated profiles: {}, not updated enrollments: {}, \
             not updated uuids: {}",
            self.hits,
            self.affiliations,
            self.companies,
            self.updated_profiles,
            self.updated_enrollments,
            self.updated_uuids,
            self.actual_updates,
            self.not_updated_profiles,
            self.not_updated_enrollments,
            self.not_updated_uuids,
        )?;
        writeln!(
            f,
            "Enrollments: {} planned, {} inserted, {} replaced, {} skipped; {} uuids in no project, {} failed fetch tasks",
            self.planned_enrollments,
            self.inserted,
            self.replaced,
            self.skipped,
            self.uuids_without_projects,
            self.failed_fetch_tasks,
        )?;
        for line in &self.resolver_lines {
            writeln!(f, "{}", line)?;
        }
        for (raw, canonical) in &self.used_mappings {
            writeln!(f, "Used mapping '{}' --> '{}'", raw, canonical)?;
        }
        Ok(())
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Run one sync pass; each run gets its own id in the log span
pub async fn run_sync<B: SearchBackend + ?Sized>(
    store: &ProfileStore,
    backend: &B,
    inputs: SyncInputs,
    options: &SyncOptions,
) -> Result<SyncSummary> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("sync", %run_id, dry_run = options.dry_run);
    sync_pass(store, backend, inputs, options).instrument(span).await
}

async fn sync_pass<B: SearchBackend + ?Sized>(
    store: &ProfileStore,
    backend: &B,
    inputs: SyncInputs,
    options: &SyncOptions,
) -> Result<SyncSummary> {
    let SyncInputs {
        records,
        rules,
        projects,
    } = inputs;
    let writes = !options.dry_run;
    let mut summary = SyncSummary {
        dry_run: options.dry_run,
        ..Default::default()
    };

    // 1. Alias rules
    let mut resolver = CompanyResolver::new(rules).context("Invalid alias rules")?;
    tracing::info!(rules = resolver.rule_count(), "alias rules validated");

    // 2. Cleanup
    if options.cleanup && writes {
        let (enrollments, organizations) = store.cleanup(&projects)?;
        tracing::info!(enrollments, organizations, "current affiliation data cleaned");
    }

    // 3. Identities
    let identities = store.load_identities().context("Failed to load identities")?;
    if options.test_connect {
        tracing::info!(identities = identities.len(), "test mode: connection ok");
        summary.test_connect = true;
        return Ok(summary);
    }
    let index = IdentityIndex::build(&identities, options.only_github);
    tracing::info!(
        identities = identities.len(),
        emails = index.email_count(),
        usernames = index.username_count(),
        "identity index built"
    );

    // 4. Organizations and countries
    let mut companies = CompanyCache::load(store)?;
    let countries: HashSet<String> = store.load_country_codes()?.into_iter().collect();

    // 5. Match records and build intervals
    let mut matches: Vec<(AffiliationRecord, BTreeSet<String>)> = Vec::new();
    let mut intervals: Vec<AffiliationInterval> = Vec::new();
    let mut used_companies: BTreeSet<String> = BTreeSet::new();
    let mut all_uuids: BTreeSet<String> = BTreeSet::new();

    for record in records {
        let uuids = index.lookup(&record.email, &record.login);
        if uuids.is_empty() {
            continue;
        }
        summary.hits += 1;

        let spans = parse_spans(&mut resolver, &record.affiliation)
            .with_context(|| format!("Bad affiliation for login '{}'", record.login))?;
        for span in &spans {
            used_companies.insert(span.company.clone());
            intervals.extend(uuids.iter().map(|uuid| span.for_identity(uuid)));
        }

        all_uuids.extend(uuids.iter().cloned());
        matches.push((record, uuids));
    }
    summary.affiliations = intervals.len();
    summary.companies = used_companies.len();
    tracing::info!(
        hits = summary.hits,
        uuids = all_uuids.len(),
        intervals = intervals.len(),
        "affiliation records matched"
    );

    // 6. Profiles
    let profiles = if options.profile_updates && writes {
        apply_profile_updates(store, &matches, &countries)?
    } else {
        ProfileReport {
            updated: BTreeSet::new(),
            not_updated: all_uuids.clone(),
        }
    };

    // 7. Memberships
    let mut fetcher = MembershipFetcher::new(backend)
        .with_fetch_size(options.fetch_size)
        .with_terms_size(options.terms_size);
    if let Some(workers) = options.workers {
        fetcher = fetcher.with_pool_size(workers);
    }
    let membership = fetcher.fetch(&all_uuids, &projects).await;
    for line in membership.histogram_lines() {
        tracing::info!("{}", line);
    }
    summary.uuids_without_projects = membership.missing(&all_uuids).len();
    summary.failed_fetch_tasks = membership.tasks_failed;
    tracing::info!(
        missing = summary.uuids_without_projects,
        failed_tasks = membership.tasks_failed,
        "memberships fetched"
    );

    // 8-9. Companies and enrollments
    let planned = plan(&intervals, &membership.memberships);
    summary.planned_enrollments = planned.len();
    if let Some(path) = &options.plan_csv {
        export_plan_csv(path, &planned)?;
        tracing::info!(path = %path.display(), rows = planned.len(), "enrollment plan exported");
    }

    let enrollments = if writes {
        for company in &used_companies {
            companies.ensure(store, company)?;
        }
        tracing::info!(companies = used_companies.len(), "companies processed");

        EnrollmentReconciler::new(store, options.mode).reconcile(
            &mut companies,
            &intervals,
            &membership.memberships,
        )?
    } else {
        ReconcileReport::default()
    };
    tracing::info!(
        inserted = enrollments.inserted,
        replaced = enrollments.replaced,
        skipped = enrollments.skipped,
        "affiliations processed"
    );

    // 10. Touch
    let updated: BTreeSet<String> = profiles
        .updated
        .union(&enrollments.updated)
        .cloned()
        .collect();
    let not_updated: BTreeSet<String> = profiles
        .not_updated
        .union(&enrollments.not_updated)
        .cloned()
        .collect();
    if writes {
        let to_touch: Vec<String> = updated.iter().cloned().collect();
        if to_touch.is_empty() {
            tracing::info!("no identities to update");
        }
        let touched = BatchTouchUpdater::new(options.touch_batch_size).touch_all(store, &to_touch)?;
        summary.actual_updates = touched.total_affected;
    }

    // 11. Summary
    summary.updated_profiles = profiles.updated.len();
    summary.not_updated_profiles = profiles.not_updated.len();
    summary.updated_enrollments = enrollments.updated.len();
    summary.not_updated_enrollments = enrollments.not_updated.len();
    summary.updated_uuids = updated.len();
    summary.not_updated_uuids = not_updated.len();
    summary.inserted = enrollments.inserted;
    summary.replaced = enrollments.replaced;
    summary.skipped = enrollments.skipped;
    summary.resolver_lines = resolver.stats().report_lines();
    summary.used_mappings = resolver.used_mappings();

    Ok(summary)
}

// ============================================================================
// TESTS
// ============================================================================
