// Affiliation Sync - Core Library
// Exposes all modules for use in the CLI and tests

pub mod resolver;    // Company Resolver - alias/acquisition canonicalization
pub mod intervals;   // Affiliation Interval Builder
pub mod search;      // Cursor-paginated SQL search backend
pub mod membership;  // Membership Fetcher - bounded concurrent fan-out
pub mod store;       // SQLite profile store
pub mod identities;  // Identity Matcher
pub mod profiles;    // Profile Updater
pub mod reconciler;  // Enrollment Reconciler
pub mod touch;       // Batch Touch Updater
pub mod feeds;       // Local feed loaders
pub mod config;      // CLI / env configuration
pub mod sync;        // Full sync pass

// Re-export commonly used types
pub use resolver::{AliasRule, CompanyResolver, MatchCounts, ResolverError, ResolverStats};
pub use intervals::{
    build_intervals, end_of_time, parse_date_any, start_of_time,
    AffiliationInterval, IntervalError,
};
pub use search::{CursorPager, Page, SearchBackend, SearchError, SqlQuery, SqlSearchClient};
pub use membership::{MembershipFetcher, MembershipMap, MembershipReport};
pub use store::{EnrollmentRow, IdentityRow, OrganizationInsert, ProfileChanges, ProfileStore};
pub use identities::{decode_email, IdentityIndex};
pub use profiles::{apply_profile_updates, profile_changes, ProfileReport};
pub use reconciler::{
    plan, CompanyCache, EnrollmentCandidate, EnrollmentReconciler, ReconcileReport, UpsertMode,
};
pub use touch::{BatchTouchUpdater, TouchReport, TouchTarget};
pub use feeds::{load_affiliations, load_alias_rules, load_projects, AffiliationRecord};
pub use config::{Config, ConfigError};
pub use sync::{run_sync, SyncInputs, SyncOptions, SyncSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
