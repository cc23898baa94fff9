// ⏰ Affiliation Intervals - time made explicit
// Turns a free-text affiliation record into contiguous valid_from/valid_until spans
//
// "Company A < 2015-01-01, Company B" reads as: Company A until 2015-01-01,
// then Company B with no known end.

use crate::resolver::CompanyResolver;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Affiliation values that carry no information
pub const UNKNOWN_AFFILIATIONS: [&str; 5] = ["NotFound", "(Unknown)", "?", "-", ""];

const SEGMENT_SEPARATOR: &str = ", ";
const DATE_SEPARATOR: &str = " < ";

/// 1900-01-01T00:00:00Z
const START_OF_TIME_SECS: i64 = -2_208_988_800;
/// 2100-01-01T00:00:00Z
const END_OF_TIME_SECS: i64 = 4_102_444_800;

/// Sentinel "beginning of time" for the first interval of every record
pub fn start_of_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(START_OF_TIME_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sentinel "end of time" for an open-ended interval
pub fn end_of_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(END_OF_TIME_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("cannot parse date '{raw}' in affiliation '{affiliation}'")]
    UnparsableDate { raw: String, affiliation: String },
}

// ============================================================================
// AFFILIATION INTERVAL
// ============================================================================

/// One identity working for one canonical company during [valid_from, valid_until)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationInterval {
    pub uuid: String,
    pub company: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Company span before it is attached to identities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanySpan {
    pub company: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl CompanySpan {
    pub fn for_identity(&self, uuid: &str) -> AffiliationInterval {
        AffiliationInterval {
            uuid: uuid.to_string(),
            company: self.company.clone(),
            valid_from: self.valid_from,
            valid_until: self.valid_until,
        }
    }
}

// ============================================================================
// PARSING
// ============================================================================

pub fn is_unknown_affiliation(affiliation: &str) -> bool {
    UNKNOWN_AFFILIATIONS.contains(&affiliation)
}

/// Parse the affiliation text into canonical company spans.
///
/// An unparsable date is fatal for the whole record, even on a segment whose
/// company is empty.
pub fn parse_spans(
    resolver: &mut CompanyResolver,
    affiliation: &str,
) -> Result<Vec<CompanySpan>, IntervalError> {
    if is_unknown_affiliation(affiliation) {
        return Ok(Vec::new());
    }

    let mut spans = Vec::new();
    let mut cursor = start_of_time();

    for segment in affiliation.split(SEGMENT_SEPARATOR) {
        let mut parts = segment.split(DATE_SEPARATOR);
        let company = parts.next().unwrap_or_default().trim();

        let valid_until = match parts.next() {
            Some(raw_date) => parse_date_any(raw_date).ok_or_else(|| IntervalError::UnparsableDate {
                raw: raw_date.to_string(),
                affiliation: affiliation.to_string(),
            })?,
            None => end_of_time(),
        };

        if company.is_empty() {
            continue;
        }

        let canonical = resolver.resolve(company);
        if canonical.is_empty() {
            continue;
        }

        spans.push(CompanySpan {
            company: canonical,
            valid_from: cursor,
            valid_until,
        });
        cursor = valid_until;
    }

    Ok(spans)
}

/// Build intervals for one identity
pub fn build_intervals(
    resolver: &mut CompanyResolver,
    uuid: &str,
    affiliation: &str,
) -> Result<Vec<AffiliationInterval>, IntervalError> {
    Ok(parse_spans(resolver, affiliation)?
        .iter()
        .map(|span| span.for_identity(uuid))
        .collect())
}

/// Try datetime, then date, then coarser date formats; first success wins
pub fn parse_date_any(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    // (format, suffix appended so chrono gets every field it requires)
    const DATETIME_FORMATS: [(&str, &str); 3] = [
        ("%Y-%m-%d %H:%M:%S", ""),
        ("%Y-%m-%d %H:%M", ""),
        ("%Y-%m-%d %H:%M", ":00"),
    ];
    const DATE_FORMATS: [(&str, &str); 3] = [
        ("%Y-%m-%d", ""),
        ("%Y-%m-%d", "-01"),
        ("%Y-%m-%d", "-01-01"),
    ];

    for (format, suffix) in DATETIME_FORMATS {
        let candidate = format!("{}{}", raw, suffix);
        if let Ok(dt) = NaiveDateTime::parse_from_str(&candidate, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    for (format, suffix) in DATE_FORMATS {
        let candidate = format!("{}{}", raw, suffix);
        if let Ok(date) = NaiveDate::parse_from_str(&candidate, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================
