// ⚙️ Configuration - command line flags with environment fallbacks

use crate::membership::{DEFAULT_FETCH_SIZE, DEFAULT_TERMS_SIZE};
use crate::reconciler::UpsertMode;
use crate::sync::SyncOptions;
use crate::touch::DEFAULT_TOUCH_BATCH_SIZE;
use clap::builder::FalseyValueParser;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// SQLite allows 32766 bound parameters; the touch statement also binds its timestamp
pub const MAX_TOUCH_BATCH_SIZE: usize = 32_765;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("profile store path is required (--db or SH_DB_PATH)")]
    MissingDatabase,

    #[error("search backend URL is required (--es-url or ES_URL)")]
    MissingSearchUrl,

    #[error("project registry is required (--projects or PROJECTS_PATH)")]
    MissingProjects,

    #[error("{name} must be greater than zero")]
    ZeroSize { name: &'static str },

    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: usize },
}

/// Sync contributor affiliations into the profile store
#[derive(Parser, Debug, Clone)]
#[command(name = "affiliation-sync")]
#[command(about = "Reconcile contributor affiliations into project enrollments")]
#[command(version)]
pub struct Config {
    /// SQLite profile store
    #[arg(long, env = "SH_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Search backend base URL
    #[arg(long, env = "ES_URL")]
    pub es_url: Option<String>,

    /// Affiliation feed (JSON array)
    #[arg(long, env = "SH_LOCAL_JSON_PATH", default_value = "github_users.json")]
    pub affiliations: PathBuf,

    /// Alias rules (YAML `acquisitions` list)
    #[arg(long, env = "SH_LOCAL_YAML_PATH", default_value = "companies.yaml")]
    pub companies: PathBuf,

    /// Project registry
    #[arg(long, env = "PROJECTS_PATH")]
    pub projects: Option<PathBuf>,

    /// Delete and re-insert enrollments with the same key
    #[arg(long, env = "REPLACE", value_parser = FalseyValueParser::new())]
    pub replace: bool,

    /// Match logins only against git/github identities
    #[arg(long, env = "ONLY_GITHUB", value_parser = FalseyValueParser::new())]
    pub only_github: bool,

    #[arg(long, env = "NO_PROFILE_UPDATE", value_parser = FalseyValueParser::new())]
    pub no_profile_update: bool,

    /// Remove enrollments of registered projects and orphaned organizations first
    #[arg(long, env = "SH_CLEANUP", value_parser = FalseyValueParser::new())]
    pub cleanup: bool,

    /// Only check that the store can be read
    #[arg(long, env = "SH_TEST_CONNECT", value_parser = FalseyValueParser::new())]
    pub test_connect: bool,

    /// Plan without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Write planned enrollments to this CSV file
    #[arg(long)]
    pub plan_csv: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_FETCH_SIZE)]
    pub fetch_size: usize,

    #[arg(long, default_value_t = DEFAULT_TERMS_SIZE)]
    pub terms_size: usize,

    #[arg(long, default_value_t = DEFAULT_TOUCH_BATCH_SIZE)]
    pub touch_batch_size: usize,

    /// Concurrent membership queries (default: CPUs / 4)
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
}

impl Config {
    /// Reject configurations that would fail after mutating the store
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db.is_none() {
            return Err(ConfigError::MissingDatabase);
        }
        if self.test_connect {
            return Ok(());
        }
        if self.es_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
            return Err(ConfigError::MissingSearchUrl);
        }
        if self.projects.is_none() {
            return Err(ConfigError::MissingProjects);
        }

        let sizes = [
            ("fetch-size", self.fetch_size),
            ("terms-size", self.terms_size),
            ("touch-batch-size", self.touch_batch_size),
            ("workers", self.workers.unwrap_or(1)),
            ("request-timeout-secs", self.request_timeout_secs as usize),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroSize { name: *name });
        }
        if self.touch_batch_size > MAX_TOUCH_BATCH_SIZE {
            return Err(ConfigError::TooLarge {
                name: "touch-batch-size",
                max: MAX_TOUCH_BATCH_SIZE,
            });
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            mode: if self.replace {
                UpsertMode::Replace
            } else {
                UpsertMode::Idempotent
            },
            only_github: self.only_github,
            profile_updates: !self.no_profile_update,
            cleanup: self.cleanup,
            test_connect: self.test_connect,
            dry_run: self.dry_run,
            plan_csv: self.plan_csv.clone(),
            fetch_size: self.fetch_size,
            terms_size: self.terms_size,
            touch_batch_size: self.touch_batch_size,
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["affiliation-sync"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--db", "sh.db", "--es-url", "http://es:9200", "--projects", "p.yaml"]);

        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.fetch_size, 20_000);
        assert_eq!(config.terms_size, 65_535);
        assert_eq!(config.touch_batch_size, 1000);
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.affiliations, PathBuf::from("github_users.json"));

        let options = config.sync_options();
        assert_eq!(options.mode, UpsertMode::Idempotent);
        assert!(options.profile_updates);
    }

    #[test]
    fn test_missing_search_url_is_rejected() {
        let config = parse(&["--db", "sh.db", "--projects", "p.yaml", "--es-url", " "]);
        assert_eq!(config.validate(), Err(ConfigError::MissingSearchUrl));
    }

    #[test]
    fn test_test_connect_needs_only_the_store() {
        let config = parse(&["--db", "sh.db", "--test-connect"]);
        assert_eq!(config.validate(), Ok(()));

        let config = parse(&["--test-connect"]);
        assert_eq!(config.validate(), Err(ConfigError::MissingDatabase));
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let config = parse(&[
            "--db", "sh.db", "--es-url", "http://es", "--projects", "p", "--workers", "0",
        ]);
        assert_eq!(config.validate(), Err(ConfigError::ZeroSize { name: "workers" }));
    }

    #[test]
    fn test_touch_batch_size_above_sqlite_limit_rejected() {
        let base = ["--db", "sh.db", "--es-url", "http://es", "--projects", "p"];

        let mut args = base.to_vec();
        args.extend(["--touch-batch-size", "32766"]);
        assert_eq!(
            parse(&args).validate(),
            Err(ConfigError::TooLarge {
                name: "touch-batch-size",
                max: MAX_TOUCH_BATCH_SIZE,
            })
        );

        let mut args = base.to_vec();
        args.extend(["--touch-batch-size", "32765"]);
        assert_eq!(parse(&args).validate(), Ok(()));
    }

    #[test]
    fn test_flags_map_to_options() {
        let config = parse(&[
            "--db", "sh.db", "--replace", "--no-profile-update", "--plan-csv", "plan.csv",
        ]);
        let options = config.sync_options();

        assert_eq!(options.mode, UpsertMode::Replace);
        assert!(!options.profile_updates);
        assert_eq!(options.plan_csv, Some(PathBuf::from("plan.csv")));
    }
}
