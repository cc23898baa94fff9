// 🔎 Identity Matcher - raw feed records → identity uuids

use crate::store::IdentityRow;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

/// `local!domain` as written by the affiliation feed
static BANG_EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s!]+)!([^\s!]+)").unwrap());

/// Sources whose usernames are trusted when matching on GitHub logins only
const GITHUB_SOURCES: [&str; 2] = ["git", "github"];

/// Lookup tables over the store's identities
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_email: HashMap<String, BTreeSet<String>>,
    by_username: HashMap<String, BTreeSet<String>>,
}

impl IdentityIndex {
    pub fn build(rows: &[IdentityRow], only_github: bool) -> Self {
        let mut index = IdentityIndex::default();

        for row in rows {
            if let Some(email) = row.email.as_deref().filter(|e| !e.is_empty()) {
                index
                    .by_email
                    .entry(email.to_lowercase())
                    .or_default()
                    .insert(row.uuid.clone());
            }

            let trusted = !only_github || GITHUB_SOURCES.contains(&row.source.as_str());
            if let Some(username) = row.username.as_deref().filter(|u| !u.is_empty()) {
                if trusted {
                    index
                        .by_username
                        .entry(username.to_string())
                        .or_default()
                        .insert(row.uuid.clone());
                }
            }
        }

        index
    }

    pub fn email_count(&self) -> usize {
        self.by_email.len()
    }

    pub fn username_count(&self) -> usize {
        self.by_username.len()
    }

    /// Union of uuids matched by the decoded email and by the login
    pub fn lookup(&self, email: &str, login: &str) -> BTreeSet<String> {
        let mut uuids = BTreeSet::new();

        if let Some(found) = self.by_email.get(&decode_email(email)) {
            uuids.extend(found.iter().cloned());
        }
        if let Some(found) = self.by_username.get(login) {
            uuids.extend(found.iter().cloned());
        }

        uuids
    }
}

/// `user!example.com` → `user@example.com`, lower-cased
pub fn decode_email(raw: &str) -> String {
    BANG_EMAIL_RE.replace_all(raw, "$1@$2").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(uuid: &str, email: Option<&str>, username: Option<&str>, source: &str) -> IdentityRow {
        IdentityRow {
            uuid: uuid.to_string(),
            email: email.map(str::to_string),
            username: username.map(str::to_string),
            source: source.to_string(),
        }
    }

    #[test]
    fn test_decode_email() {
        assert_eq!(decode_email("Jane.Doe!Example.com"), "jane.doe@example.com");
        assert_eq!(decode_email("plain@example.com"), "plain@example.com");
        assert_eq!(decode_email("no-separator"), "no-separator");
    }

    #[test]
    fn test_lookup_unions_email_and_login() {
        let rows = vec![
            row("u1", Some("Jane@Example.com"), None, "git"),
            row("u2", None, Some("jdoe"), "github"),
            row("u3", Some("other@example.com"), Some("other"), "gerrit"),
        ];
        let index = IdentityIndex::build(&rows, false);

        let found = index.lookup("jane!example.com", "jdoe");

        assert_eq!(found, BTreeSet::from(["u1".to_string(), "u2".to_string()]));
        assert!(index.lookup("nobody!example.com", "nobody").is_empty());
    }

    #[test]
    fn test_only_github_limits_username_matches() {
        let rows = vec![
            row("u1", None, Some("jdoe"), "gerrit"),
            row("u2", Some("jd@example.com"), Some("jd"), "jira"),
        ];

        let all = IdentityIndex::build(&rows, false);
        let github = IdentityIndex::build(&rows, true);

        assert_eq!(all.lookup("", "jdoe").len(), 1);
        assert!(github.lookup("", "jdoe").is_empty());
        assert_eq!(github.username_count(), 0);
        // emails are indexed regardless of source
        assert_eq!(github.lookup("jd!example.com", "").len(), 1);
    }

    #[test]
    fn test_empty_values_are_not_indexed() {
        let rows = vec![row("u1", Some(""), Some(""), "git")];
        let index = IdentityIndex::build(&rows, false);

        assert_eq!(index.email_count(), 0);
        assert_eq!(index.username_count(), 0);
        assert!(index.lookup("", "").is_empty());
    }
}
