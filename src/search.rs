// 🔎 Search Backend - paginated SQL queries against the analytics store
// open → next* → close, with close guaranteed once a cursor exists

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("cannot decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Initial query body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlQuery {
    pub query: String,
    pub fetch_size: usize,
}

#[derive(Debug, Serialize)]
struct CursorRequest<'a> {
    cursor: &'a str,
}

/// One page of results. The backend omits `cursor` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub cursor: Option<String>,

    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Page {
    /// First column of every row as a string (nulls and non-strings dropped)
    pub fn first_column(&self) -> impl Iterator<Item = String> + '_ {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|value| value.as_str().map(str::to_string))
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn open(&self, query: &SqlQuery) -> Result<Page, SearchError>;

    async fn next(&self, cursor: &str) -> Result<Page, SearchError>;

    async fn close(&self, cursor: &str) -> Result<(), SearchError>;
}

// ============================================================================
// CURSOR PAGER
// ============================================================================

/// Stateful pager over one query.
///
/// `collect_first_column` drains every page and then releases the cursor on
/// every exit path, including a failed continuation request.
pub struct CursorPager<'a, B: SearchBackend + ?Sized> {
    backend: &'a B,
    query: SqlQuery,
    cursor: Option<String>,
    opened: bool,
    exhausted: bool,
}

impl<'a, B: SearchBackend + ?Sized> CursorPager<'a, B> {
    pub fn new(backend: &'a B, query: SqlQuery) -> Self {
        CursorPager {
            backend,
            query,
            cursor: None,
            opened: false,
            exhausted: false,
        }
    }

    /// Fetch the next page; `Ok(None)` once the result set is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Page>, SearchError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = if !self.opened {
            self.opened = true;
            self.backend.open(&self.query).await?
        } else {
            match self.cursor.as_deref() {
                Some(cursor) => self.backend.next(cursor).await?,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        };

        // Keep the last cursor handed out; it is the one to release
        if let Some(cursor) = &page.cursor {
            self.cursor = Some(cursor.clone());
        }
        if page.rows.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        if page.cursor.is_none() {
            self.exhausted = true;
        }
        Ok(Some(page))
    }

    /// Release the server-side cursor, if one was handed out
    pub async fn close(&mut self) -> Result<(), SearchError> {
        match self.cursor.take() {
            Some(cursor) => self.backend.close(&cursor).await,
            None => Ok(()),
        }
    }

    pub async fn collect_first_column(mut self) -> Result<Vec<String>, SearchError> {
        let drained = self.drain().await;
        if let Err(e) = self.close().await {
            tracing::warn!(error = %e, "Failed to release search cursor");
        }
        drained
    }

    async fn drain(&mut self) -> Result<Vec<String>, SearchError> {
        let mut values = Vec::new();
        while let Some(page) = self.next_page().await? {
            values.extend(page.first_column());
        }
        Ok(values)
    }
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

/// Elasticsearch-style `_sql` endpoint client
pub struct SqlSearchClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl SqlSearchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SearchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Network {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(SqlSearchClient {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn query_url(&self) -> String {
        format!("{}/_sql?format=json", self.base_url)
    }

    fn close_url(&self) -> String {
        format!("{}/_sql/close", self.base_url)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<String, SearchError> {
        tracing::debug!(url = %url, "POST search backend");

        let response = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| SearchError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| SearchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(SearchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    fn decode_page(url: &str, body: &str) -> Result<Page, SearchError> {
        serde_json::from_str(body).map_err(|e| SearchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SearchBackend for SqlSearchClient {
    async fn open(&self, query: &SqlQuery) -> Result<Page, SearchError> {
        let url = self.query_url();
        let body = self.post(&url, query).await?;
        Self::decode_page(&url, &body)
    }

    async fn next(&self, cursor: &str) -> Result<Page, SearchError> {
        let url = self.query_url();
        let body = self.post(&url, &CursorRequest { cursor }).await?;
        Self::decode_page(&url, &body)
    }

    async fn close(&self, cursor: &str) -> Result<(), SearchError> {
        let url = self.close_url();
        self.post(&url, &CursorRequest { cursor }).await.map(|_| ())
    }
}

// ============================================================================
// IN-MEMORY BACKEND (tests)
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::fake::FakeSearchBackend;
    use super::*;

    fn query_for(table: &str, uuids: &[&str]) -> SqlQuery {
        let list = uuids
            .iter()
            .map(|u| format!("'{}'", u))
            .collect::<Vec<_>>()
            .join(",");
        SqlQuery {
            query: format!(
                "select author_uuid from \"{}\" where author_uuid in ({}) group by author_uuid",
                table, list
            ),
            fetch_size: 2,
        }
    }

    #[test]
    fn test_page_decodes_with_and_without_cursor() {
        let page: Page =
            serde_json::from_str(r#"{"cursor":"abc","rows":[["u1"],["u2"],[null]]}"#).unwrap();
        assert_eq!(page.cursor.as_deref(), Some("abc"));
        assert_eq!(page.first_column().collect::<Vec<_>>(), vec!["u1", "u2"]);

        let last: Page = serde_json::from_str(r#"{"rows":[]}"#).unwrap();
        assert!(last.cursor.is_none());
        assert!(last.rows.is_empty());
    }

    #[tokio::test]
    async fn test_pager_drains_all_pages_and_closes() {
        let backend = FakeSearchBackend::new(2).with_authors("t", &["a", "b", "c", "d", "e"]);
        let pager = CursorPager::new(&backend, query_for("t", &["a", "b", "c", "d", "e", "x"]));

        let mut values = pager.collect_first_column().await.unwrap();
        values.sort();

        assert_eq!(values, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(backend.closed_cursors().len(), 1);
        assert_eq!(backend.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_pager_closes_cursor_after_failed_continuation() {
        let mut backend = FakeSearchBackend::new(1).with_authors("t", &["a", "b", "c"]);
        backend.failing_continuations.insert("t".to_string());
        let pager = CursorPager::new(&backend, query_for("t", &["a", "b", "c"]));

        let result = pager.collect_first_column().await;

        assert!(result.is_err());
        assert_eq!(backend.closed_cursors(), vec!["cursor-1".to_string()]);
        assert_eq!(backend.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_has_nothing_to_close() {
        let mut backend = FakeSearchBackend::new(10);
        backend.failing_tables.insert("t".to_string());
        let pager = CursorPager::new(&backend, query_for("t", &["a"]));

        assert!(pager.collect_first_column().await.is_err());
        assert!(backend.closed_cursors().is_empty());
    }

    #[test]
    fn test_client_urls() {
        let client = SqlSearchClient::new("http://localhost:9200/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.query_url(), "http://localhost:9200/_sql?format=json");
        assert_eq!(client.close_url(), "http://localhost:9200/_sql/close");
    }
}
