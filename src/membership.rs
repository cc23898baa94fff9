// 👥 Membership Fetcher - which identities contributed to which projects
// Fans (project × uuid batch) queries out over a fixed-size worker pool

use crate::search::{CursorPager, SearchBackend, SearchError, SqlQuery};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// identity uuid → projects it authored in
pub type MembershipMap = BTreeMap<String, BTreeSet<String>>;

/// Default page size requested from the backend
pub const DEFAULT_FETCH_SIZE: usize = 20_000;

/// Default maximum uuids per `in (...)` predicate
pub const DEFAULT_TERMS_SIZE: usize = 0xffff;

/// max(1, available parallelism / 4)
pub fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 4).max(1)
}

/// Index pattern holding git authorship data for a project
pub fn project_table_pattern(project: &str) -> String {
    format!("sds-{}-git*,-*-for-merge,-*-raw", project.replace('/', "-"))
}

// ============================================================================
// FETCH TASKS
// ============================================================================

#[derive(Debug, Clone)]
struct FetchTask {
    project: String,
    batch: usize,
    query: SqlQuery,
}

/// Split uuids into `in (...)` clauses of at most `terms_size` entries
pub fn uuid_conditions(uuids: &BTreeSet<String>, terms_size: usize) -> Vec<String> {
    let terms_size = terms_size.max(1);
    let all: Vec<&String> = uuids.iter().collect();
    all.chunks(terms_size)
        .map(|chunk| {
            let quoted = chunk
                .iter()
                .map(|uuid| format!("'{}'", uuid.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(",");
            format!("author_uuid in ({})", quoted)
        })
        .collect()
}

pub fn authors_query(project: &str, condition: &str, fetch_size: usize) -> SqlQuery {
    SqlQuery {
        query: format!(
            "select author_uuid from \"{}\" where author_uuid is not null and author_uuid != '' and {} group by author_uuid",
            project_table_pattern(project),
            condition
        ),
        fetch_size,
    }
}

// ============================================================================
// FETCH REPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MembershipReport {
    pub memberships: MembershipMap,

    /// Number of uuid batches per project
    pub batches: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
}

impl MembershipReport {
    /// membership count → number of identities with that many projects
    pub fn histogram(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for projects in self.memberships.values() {
            *counts.entry(projects.len()).or_insert(0) += 1;
        }
        counts
    }

    /// Identities in `uuids` that were found in no project
    pub fn missing<'a>(&self, uuids: &'a BTreeSet<String>) -> Vec<&'a String> {
        uuids
            .iter()
            .filter(|uuid| !self.memberships.contains_key(*uuid))
            .collect()
    }

    pub fn histogram_lines(&self) -> Vec<String> {
        self.histogram()
            .iter()
            .map(|(projects, uuids)| format!("{:03} projects: {} uuids", projects, uuids))
            .collect()
    }
}

// ============================================================================
// MEMBERSHIP FETCHER
// ============================================================================

pub struct MembershipFetcher<'a, B: SearchBackend + ?Sized> {
    backend: &'a B,
    pool_size: usize,
    fetch_size: usize,
    terms_size: usize,
}

impl<'a, B: SearchBackend + ?Sized> MembershipFetcher<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        MembershipFetcher {
            backend,
            pool_size: default_pool_size(),
            fetch_size: DEFAULT_FETCH_SIZE,
            terms_size: DEFAULT_TERMS_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    pub fn with_terms_size(mut self, terms_size: usize) -> Self {
        self.terms_size = terms_size.max(1);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Run every (project, batch) task through the pool and merge the results.
    ///
    /// A failing task is logged and dropped; the others still contribute.
    pub async fn fetch(&self, uuids: &BTreeSet<String>, projects: &[String]) -> MembershipReport {
        let conditions = uuid_conditions(uuids, self.terms_size);
        let tasks: Vec<FetchTask> = projects
            .iter()
            .flat_map(|project| {
                conditions.iter().enumerate().map(move |(batch, condition)| FetchTask {
                    project: project.clone(),
                    batch,
                    query: authors_query(project, condition, self.fetch_size),
                })
            })
            .collect();

        tracing::info!(
            workers = self.pool_size,
            projects = projects.len(),
            uuids = uuids.len(),
            batches = conditions.len(),
            tasks = tasks.len(),
            "Fetching project memberships"
        );

        let merged: Mutex<MembershipMap> = Mutex::new(MembershipMap::new());

        let outcomes: Vec<Result<usize, SearchError>> = stream::iter(tasks)
            .map(|task| self.run_task(task, &merged))
            .buffer_unordered(self.pool_size)
            .collect()
            .await;

        let tasks_failed = outcomes.iter().filter(|o| o.is_err()).count();
        let memberships = merged.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());

        MembershipReport {
            memberships,
            batches: conditions.len(),
            tasks_succeeded: outcomes.len() - tasks_failed,
            tasks_failed,
        }
    }

    async fn run_task(&self, task: FetchTask, merged: &Mutex<MembershipMap>) -> Result<usize, SearchError> {
        let pager = CursorPager::new(self.backend, task.query);
        let authors = match pager.collect_first_column().await {
            Ok(authors) => authors,
            Err(e) => {
                tracing::error!(
                    project = %task.project,
                    batch = task.batch,
                    error = %e,
                    "Membership query failed, dropping task"
                );
                return Err(e);
            }
        };

        tracing::debug!(project = %task.project, batch = task.batch, authors = authors.len(), "Task done");

        let found = authors.len();
        let mut map = merged.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for uuid in authors {
            map.entry(uuid).or_default().insert(task.project.clone());
        }
        Ok(found)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::fake::FakeSearchBackend;

    fn uuid_set(uuids: &[&str]) -> BTreeSet<String> {
        uuids.iter().map(|u| u.to_string()).collect()
    }

    fn projects(names: &[&str]) -> Vec<String> {
        names.iter().map(|p| p.to_string()).collect()
    }

    fn backend() -> FakeSearchBackend {
        FakeSearchBackend::new(2)
            .with_authors(&project_table_pattern("cncf/k8s"), &["u1", "u2", "u3", "u5"])
            .with_authors(&project_table_pattern("cncf/helm"), &["u2", "u4"])
            .with_authors(&project_table_pattern("cncf/envoy"), &["u1", "u4", "u5", "u6"])
    }

    #[test]
    fn test_table_pattern() {
        assert_eq!(
            project_table_pattern("cncf/k8s"),
            "sds-cncf-k8s-git*,-*-for-merge,-*-raw"
        );
    }

    #[test]
    fn test_uuid_conditions_chunking() {
        let uuids = uuid_set(&["a", "b", "c", "d", "e"]);
        let conditions = uuid_conditions(&uuids, 2);

        assert_eq!(
            conditions,
            vec![
                "author_uuid in ('a','b')".to_string(),
                "author_uuid in ('c','d')".to_string(),
                "author_uuid in ('e')".to_string(),
            ]
        );
        assert!(uuid_conditions(&BTreeSet::new(), 2).is_empty());
    }

    #[test]
    fn test_authors_query_text() {
        let query = authors_query("cncf/k8s", "author_uuid in ('a')", 100);
        assert_eq!(query.fetch_size, 100);
        assert!(query.query.starts_with(
            "select author_uuid from \"sds-cncf-k8s-git*,-*-for-merge,-*-raw\" where"
        ));
        assert!(query.query.ends_with("author_uuid in ('a') group by author_uuid"));
    }

    #[tokio::test]
    async fn test_fetch_merges_all_projects() {
        let backend = backend();
        let uuids = uuid_set(&["u1", "u2", "u3", "u4", "u5", "u6", "u7"]);
        let report = MembershipFetcher::new(&backend)
            .with_pool_size(3)
            .with_terms_size(3)
            .fetch(&uuids, &projects(&["cncf/k8s", "cncf/helm", "cncf/envoy"]))
            .await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.tasks_succeeded, 9);
        assert_eq!(report.tasks_failed, 0);
        assert_eq!(
            report.memberships["u1"],
            uuid_set(&["cncf/k8s", "cncf/envoy"])
        );
        assert_eq!(report.memberships["u4"], uuid_set(&["cncf/helm", "cncf/envoy"]));
        assert!(!report.memberships.contains_key("u7"));
        assert_eq!(report.missing(&uuids), vec![&"u7".to_string()]);
        assert_eq!(backend.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_result_independent_of_pool_size() {
        let uuids = uuid_set(&["u1", "u2", "u3", "u4", "u5", "u6"]);
        let all = projects(&["cncf/k8s", "cncf/helm", "cncf/envoy"]);

        let mut results = Vec::new();
        for pool in [1, 2, 4, 9] {
            let backend = backend();
            let report = MembershipFetcher::new(&backend)
                .with_pool_size(pool)
                .with_terms_size(2)
                .fetch(&uuids, &all)
                .await;
            results.push(report.memberships);
        }

        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
    }

    #[tokio::test]
    async fn test_failed_task_is_dropped_not_fatal() {
        let mut backend = backend();
        backend
            .failing_tables
            .insert(project_table_pattern("cncf/helm"));
        let uuids = uuid_set(&["u1", "u2", "u4"]);

        let report = MembershipFetcher::new(&backend)
            .with_pool_size(2)
            .fetch(&uuids, &projects(&["cncf/k8s", "cncf/helm", "cncf/envoy"]))
            .await;

        assert_eq!(report.tasks_failed, 1);
        assert_eq!(report.tasks_succeeded, 2);
        assert_eq!(report.memberships["u2"], uuid_set(&["cncf/k8s"]));
        assert_eq!(report.memberships["u4"], uuid_set(&["cncf/envoy"]));
    }

    #[tokio::test]
    async fn test_failed_continuation_releases_cursor() {
        let mut backend = backend();
        backend
            .failing_continuations
            .insert(project_table_pattern("cncf/k8s"));
        let uuids = uuid_set(&["u1", "u2", "u3", "u5"]);

        let report = MembershipFetcher::new(&backend)
            .with_pool_size(1)
            .fetch(&uuids, &projects(&["cncf/k8s"]))
            .await;

        assert_eq!(report.tasks_failed, 1);
        assert!(report.memberships.is_empty());
        assert_eq!(backend.closed_cursors().len(), 1);
        assert_eq!(backend.open_cursor_count(), 0);
    }

    #[test]
    fn test_histogram() {
        let mut report = MembershipReport::default();
        report.memberships.insert("a".into(), uuid_set(&["p1"]));
        report.memberships.insert("b".into(), uuid_set(&["p1", "p2"]));
        report.memberships.insert("c".into(), uuid_set(&["p2"]));

        let histogram = report.histogram();
        assert_eq!(histogram[&1], 2);
        assert_eq!(histogram[&2], 1);
        assert_eq!(
            report.histogram_lines(),
            vec!["001 projects: 2 uuids".to_string(), "002 projects: 1 uuids".to_string()]
        );
    }

    #[test]
    fn test_default_pool_size_at_least_one() {
        assert!(default_pool_size() >= 1);
    }
}
