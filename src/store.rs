// 🗄️ Profile Store - SQLite persistence for identities, organizations and enrollments

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One identity row: a source-specific email/username bound to a profile uuid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRow {
    pub uuid: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub source: String,
}

/// Enrollment key + organization, as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRow {
    pub uuid: String,
    pub organization_id: i64,
    pub project: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Profile columns that the sync may change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileChanges {
    pub gender: Option<String>,
    pub gender_acc: Option<i64>,
    pub country_code: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.gender.is_none() && self.gender_acc.is_none() && self.country_code.is_none()
    }
}

/// Outcome of an organization insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrganizationInsert {
    Created(i64),
    /// Name (case-insensitively) already present; carries the existing id
    Existing(i64),
}

impl OrganizationInsert {
    pub fn id(&self) -> i64 {
        match self {
            OrganizationInsert::Created(id) | OrganizationInsert::Existing(id) => *id,
        }
    }
}

/// Timestamps are stored as RFC 3339 text so equality on keys is exact
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ============================================================================
// PROFILE STORE
// ============================================================================

/// SQLite-backed identity/profile store
pub struct ProfileStore {
    conn: Connection,
}

impl ProfileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open profile store {}", path.display()))?;
        let store = ProfileStore { conn };
        store.setup()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = ProfileStore {
            conn: Connection::open_in_memory()?,
        };
        store.setup()?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn setup(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profiles (
                uuid TEXT PRIMARY KEY,
                name TEXT,
                email TEXT,
                gender TEXT,
                gender_acc INTEGER,
                country_code TEXT,
                is_bot INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                email TEXT,
                username TEXT,
                source TEXT NOT NULL,
                last_modified TEXT
            );

            CREATE TABLE IF NOT EXISTS organizations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE
            );

            CREATE TABLE IF NOT EXISTS enrollments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                organization_id INTEGER NOT NULL,
                project_slug TEXT NOT NULL,
                valid_from TEXT NOT NULL,
                valid_until TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS countries (
                code TEXT PRIMARY KEY,
                name TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_identities_uuid ON identities(uuid);
            CREATE INDEX IF NOT EXISTS idx_enrollments_key
                ON enrollments(uuid, valid_from, valid_until, project_slug);",
        )?;

        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn load_identities(&self) -> Result<Vec<IdentityRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uuid, email, username, source FROM identities")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentityRow {
                    uuid: row.get(0)?,
                    email: row.get(1)?,
                    username: row.get(2)?,
                    source: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Lower-cased organization name → id
    pub fn load_organizations(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM organizations")?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let name: String = row.get(1)?;
                Ok((name.to_lowercase(), id))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Lower-cased country codes
    pub fn load_country_codes(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT code FROM countries")?;
        let codes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|code| code.map(|c| c.to_lowercase()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(codes)
    }

    pub fn organization_id(&self, name: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM organizations WHERE name = ?1")?;
        let mut rows = stmt.query_map([name], |row| row.get::<_, i64>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn enrollment_exists(
        &self,
        uuid: &str,
        valid_from: &DateTime<Utc>,
        valid_until: &DateTime<Utc>,
        project: &str,
    ) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM enrollments
             WHERE uuid = ?1 AND valid_from = ?2 AND valid_until = ?3 AND project_slug = ?4",
            params![uuid, ts(valid_from), ts(valid_until), project],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn enrollments_for(&self, uuid: &str) -> Result<Vec<EnrollmentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, organization_id, project_slug, valid_from, valid_until
             FROM enrollments WHERE uuid = ?1
             ORDER BY valid_from, project_slug",
        )?;
        let rows = stmt
            .query_map([uuid], |row| {
                let from: String = row.get(3)?;
                let until: String = row.get(4)?;
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, from, until))
            })?
            .collect::<Result<Vec<(String, i64, String, String, String)>, _>>()?;

        rows.into_iter()
            .map(|(uuid, organization_id, project, from, until)| {
                Ok(EnrollmentRow {
                    uuid,
                    organization_id,
                    project,
                    valid_from: DateTime::parse_from_rfc3339(&from)
                        .with_context(|| format!("Bad valid_from '{}'", from))?
                        .with_timezone(&Utc),
                    valid_until: DateTime::parse_from_rfc3339(&until)
                        .with_context(|| format!("Bad valid_until '{}'", until))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    pub fn count_enrollments(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert an organization; a unique-name collision returns the existing id
    pub fn insert_organization(&self, name: &str) -> Result<OrganizationInsert> {
        let result = self
            .conn
            .execute("INSERT INTO organizations (name) VALUES (?1)", [name]);

        match result {
            Ok(_) => Ok(OrganizationInsert::Created(self.conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let id = self
                    .organization_id(name)?
                    .with_context(|| format!("Organization '{}' collided but cannot be read back", name))?;
                Ok(OrganizationInsert::Existing(id))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to insert organization '{}'", name)),
        }
    }

    /// Returns the number of profile rows changed
    pub fn update_profile(&self, uuid: &str, changes: &ProfileChanges) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(gender) = &changes.gender {
            columns.push("gender = ?");
            values.push(gender.clone().into());
        }
        if let Some(acc) = changes.gender_acc {
            columns.push("gender_acc = ?");
            values.push(acc.into());
        }
        if let Some(code) = &changes.country_code {
            columns.push("country_code = ?");
            values.push(code.clone().into());
        }
        values.push(uuid.to_string().into());

        let sql = format!("UPDATE profiles SET {} WHERE uuid = ?", columns.join(", "));
        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .with_context(|| format!("Profile update failed: {}", sql))?;
        Ok(changed)
    }

    pub fn insert_enrollment(&self, row: &EnrollmentRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO enrollments (uuid, organization_id, project_slug, valid_from, valid_until)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.uuid,
                    row.organization_id,
                    row.project,
                    ts(&row.valid_from),
                    ts(&row.valid_until),
                ],
            )
            .with_context(|| format!("Failed to insert enrollment for {}", row.uuid))?;
        Ok(())
    }

    pub fn delete_enrollment(
        &self,
        uuid: &str,
        valid_from: &DateTime<Utc>,
        valid_until: &DateTime<Utc>,
        project: &str,
    ) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM enrollments
             WHERE uuid = ?1 AND valid_from = ?2 AND valid_until = ?3 AND project_slug = ?4",
            params![uuid, ts(valid_from), ts(valid_until), project],
        )?;
        Ok(deleted)
    }

    /// Set `last_modified` on every identity row of the given uuids.
    ///
    /// Returns the number of distinct uuids touched, not identity rows.
    pub fn touch_identities(&self, uuids: &[String], at: &DateTime<Utc>) -> Result<usize> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; uuids.len()].join(",");
        let update = format!(
            "UPDATE identities SET last_modified = ? WHERE uuid IN ({})",
            placeholders
        );
        let count = format!(
            "SELECT COUNT(DISTINCT uuid) FROM identities WHERE uuid IN ({})",
            placeholders
        );
        let at = ts(at);

        self.conn
            .execute(
                &update,
                params_from_iter(std::iter::once(&at).chain(uuids.iter())),
            )
            .context("Failed to touch identities")?;
        let touched: i64 = self
            .conn
            .query_row(&count, params_from_iter(uuids.iter()), |row| row.get(0))
            .context("Failed to count touched identities")?;
        Ok(touched as usize)
    }

    /// Drop enrollments of the given projects and organizations nothing refers to
    pub fn cleanup(&self, projects: &[String]) -> Result<(usize, usize)> {
        let mut enrollments = 0;
        for project in projects {
            enrollments += self
                .conn
                .execute("DELETE FROM enrollments WHERE project_slug = ?1", [project])?;
        }
        let organizations = self.conn.execute(
            "DELETE FROM organizations
             WHERE id NOT IN (SELECT DISTINCT organization_id FROM enrollments)",
            [],
        )?;
        Ok((enrollments, organizations))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

#[cfg(test)]
impl ProfileStore {
    pub(crate) fn add_identity(&self, uuid: &str, email: Option<&str>, username: Option<&str>, source: &str) {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO profiles (uuid) VALUES (?1)",
                [uuid],
            )
            .unwrap();
        self.conn
            .execute(
                "INSERT INTO identities (uuid, email, username, source) VALUES (?1, ?2, ?3, ?4)",
                params![uuid, email, username, source],
            )
            .unwrap();
    }

    pub(crate) fn add_country(&self, code: &str) {
        self.conn
            .execute("INSERT INTO countries (code) VALUES (?1)", [code])
            .unwrap();
    }

    pub(crate) fn profile_column(&self, uuid: &str, column: &str) -> Option<String> {
        self.conn
            .query_row(
                &format!("SELECT CAST({} AS TEXT) FROM profiles WHERE uuid = ?1", column),
                [uuid],
                |row| row.get(0),
            )
            .unwrap()
    }

    pub(crate) fn last_modified(&self, uuid: &str) -> Option<String> {
        self.conn
            .query_row(
                "SELECT last_modified FROM identities WHERE uuid = ?1",
                [uuid],
                |row| row.get(0),
            )
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_setup_is_repeatable() {
        let store = ProfileStore::open_in_memory().unwrap();
        store.setup().unwrap();
        assert_eq!(store.count_enrollments().unwrap(), 0);
    }

    #[test]
    fn test_insert_organization_collision_returns_existing_id() {
        let store = ProfileStore::open_in_memory().unwrap();

        let first = store.insert_organization("Red Hat Inc.").unwrap();
        let again = store.insert_organization("red hat inc.").unwrap();

        assert!(matches!(first, OrganizationInsert::Created(_)));
        assert_eq!(again, OrganizationInsert::Existing(first.id()));
        assert_eq!(
            store.load_organizations().unwrap().get("red hat inc."),
            Some(&first.id())
        );
    }

    #[test]
    fn test_enrollment_key_roundtrip() {
        let store = ProfileStore::open_in_memory().unwrap();
        let from = Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        let row = EnrollmentRow {
            uuid: "u1".into(),
            organization_id: 7,
            project: "cncf/k8s".into(),
            valid_from: from,
            valid_until: until,
        };

        store.insert_enrollment(&row).unwrap();

        assert!(store.enrollment_exists("u1", &from, &until, "cncf/k8s").unwrap());
        assert!(!store.enrollment_exists("u1", &from, &until, "cncf/helm").unwrap());
        assert_eq!(store.enrollments_for("u1").unwrap(), vec![row]);
        assert_eq!(store.delete_enrollment("u1", &from, &until, "cncf/k8s").unwrap(), 1);
        assert_eq!(store.count_enrollments().unwrap(), 0);
    }

    #[test]
    fn test_update_profile_columns() {
        let store = ProfileStore::open_in_memory().unwrap();
        store.add_identity("u1", Some("a@b.c"), None, "git");

        let changes = ProfileChanges {
            gender: Some("female".into()),
            gender_acc: Some(87),
            country_code: Some("PL".into()),
        };
        assert_eq!(store.update_profile("u1", &changes).unwrap(), 1);
        assert_eq!(store.update_profile("missing", &changes).unwrap(), 0);
        assert_eq!(store.update_profile("u1", &ProfileChanges::default()).unwrap(), 0);

        assert_eq!(store.profile_column("u1", "gender").as_deref(), Some("female"));
        assert_eq!(store.profile_column("u1", "gender_acc").as_deref(), Some("87"));
        assert_eq!(store.profile_column("u1", "country_code").as_deref(), Some("PL"));
    }

    #[test]
    fn test_touch_identities_counts_rows() {
        let store = ProfileStore::open_in_memory().unwrap();
        store.add_identity("u1", None, Some("one"), "github");
        store.add_identity("u2", None, Some("two"), "github");
        let now = Utc::now();

        let touched = store
            .touch_identities(&["u1".to_string(), "ghost".to_string()], &now)
            .unwrap();

        assert_eq!(touched, 1);
        assert_eq!(store.last_modified("u1"), Some(now.to_rfc3339()));
        assert_eq!(store.last_modified("u2"), None);
        assert_eq!(store.touch_identities(&[], &now).unwrap(), 0);
    }

    #[test]
    fn test_touch_counts_identities_not_rows() {
        let store = ProfileStore::open_in_memory().unwrap();
        store.add_identity("u1", Some("one@example.com"), None, "git");
        store.add_identity("u1", None, Some("one"), "github");
        store.add_identity("u1", None, Some("one"), "gerrit");
        let now = Utc::now();

        let touched = store.touch_identities(&["u1".to_string()], &now).unwrap();

        assert_eq!(touched, 1);
        let stamped: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM identities WHERE uuid = 'u1' AND last_modified = ?1",
                [now.to_rfc3339()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stamped, 3);
    }

    #[test]
    fn test_cleanup_removes_project_enrollments_and_orphans() {
        let store = ProfileStore::open_in_memory().unwrap();
        let kept = store.insert_organization("Kept").unwrap().id();
        let orphan = store.insert_organization("Orphan").unwrap().id();
        let now = Utc::now();
        for (project, org) in [("cncf/k8s", orphan), ("other/x", kept)] {
            store
                .insert_enrollment(&EnrollmentRow {
                    uuid: "u1".into(),
                    organization_id: org,
                    project: project.into(),
                    valid_from: now,
                    valid_until: now,
                })
                .unwrap();
        }

        let (enrollments, organizations) = store.cleanup(&["cncf/k8s".to_string()]).unwrap();

        assert_eq!(enrollments, 1);
        assert_eq!(organizations, 1);
        assert_eq!(store.organization_id("Kept").unwrap(), Some(kept));
        assert_eq!(store.organization_id("Orphan").unwrap(), None);
    }
}
