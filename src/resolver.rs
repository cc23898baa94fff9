// 🏷️ Company Resolver - Alias rules as data
// Canonicalizes raw company names through ordered acquisition/alias rules

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// ============================================================================
// ALIAS RULE
// ============================================================================

/// One acquisition/alias rule: names matching `pattern` become `canonical`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRule {
    /// Regular expression tested against the raw company name (unanchored)
    pub pattern: String,

    /// Canonical company name produced on match
    pub canonical: String,
}

impl AliasRule {
    pub fn new(pattern: impl Into<String>, canonical: impl Into<String>) -> Self {
        AliasRule {
            pattern: pattern.into(),
            canonical: canonical.into(),
        }
    }
}

/// Rule set validation failures. Any of these aborts the run before mutation.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("alias rule #{index} pattern '{pattern}' is not a valid regex: {source}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("alias rule #{index} pattern '{pattern}' is already present and maps into '{existing}'")]
    DuplicatePattern {
        index: usize,
        pattern: String,
        existing: String,
    },

    #[error("alias rule #{index} '{pattern}': another rule already maps into '{canonical}', merge them")]
    DuplicateTarget {
        index: usize,
        pattern: String,
        canonical: String,
    },

    #[error(
        "alias rule #{index} result '{canonical}' matches rule #{other} pattern '{other_pattern}' \
         which maps to '{other_canonical}', simplify it"
    )]
    HiddenChain {
        index: usize,
        canonical: String,
        other: usize,
        other_pattern: String,
        other_canonical: String,
    },

    #[error(
        "alias rule #{index} pattern '{pattern}' is matched by rule #{other} pattern '{other_pattern}' \
         which maps to '{other_canonical}', but rule #{index} maps to '{canonical}'"
    )]
    ConflictingTarget {
        index: usize,
        pattern: String,
        canonical: String,
        other: usize,
        other_pattern: String,
        other_canonical: String,
    },
}

// ============================================================================
// RESOLUTION STATISTICS
// ============================================================================

/// Counters for one canonical target (or for the unmapped bucket)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchCounts {
    /// Resolutions that had to evaluate the rule list
    pub regex_hits: u64,

    /// Resolutions served from the cache
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverStats {
    /// Per canonical target, only for names mapped by a rule
    pub mapped: BTreeMap<String, MatchCounts>,

    /// Names no rule matched (resolved to themselves)
    pub unmapped: MatchCounts,
}

impl ResolverStats {
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Non-acquired companies: checked all regexp: {}, cache hit: {}",
            self.unmapped.regex_hits, self.unmapped.cache_hits
        )];
        for (company, counts) in &self.mapped {
            lines.push(format!(
                "Mapped to '{}': checked regexp: {}, cache hit: {}",
                company, counts.regex_hits, counts.cache_hits
            ));
        }
        lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Mapped,
    Unmapped,
}

#[derive(Debug, Clone)]
struct Resolution {
    canonical: String,
    origin: Origin,
}

// ============================================================================
// COMPANY RESOLVER
// ============================================================================

/// Memoizing resolver over a validated, ordered rule list.
///
/// Owns its cache and counters; callers pass it by `&mut`. Not shared across
/// threads.
pub struct CompanyResolver {
    rules: Vec<(Regex, AliasRule)>,
    cache: HashMap<String, Resolution>,
    stats: ResolverStats,
}

impl CompanyResolver {
    /// Resolver with no rules: every name resolves to itself
    pub fn empty() -> Self {
        CompanyResolver {
            rules: Vec::new(),
            cache: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    /// Compile and validate the rule list. Order is kept for first-match-wins.
    pub fn new(rules: Vec<AliasRule>) -> Result<Self, ResolverError> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut by_pattern: HashMap<&str, &str> = HashMap::new();
        let mut targets: HashMap<&str, usize> = HashMap::new();

        for (index, rule) in rules.iter().enumerate() {
            if let Some(existing) = by_pattern.get(rule.pattern.as_str()) {
                return Err(ResolverError::DuplicatePattern {
                    index,
                    pattern: rule.pattern.clone(),
                    existing: existing.to_string(),
                });
            }
            by_pattern.insert(&rule.pattern, &rule.canonical);

            if targets.contains_key(rule.canonical.as_str()) {
                return Err(ResolverError::DuplicateTarget {
                    index,
                    pattern: rule.pattern.clone(),
                    canonical: rule.canonical.clone(),
                });
            }
            targets.insert(&rule.canonical, index);

            let regex = Regex::new(&rule.pattern).map_err(|source| ResolverError::InvalidPattern {
                index,
                pattern: rule.pattern.clone(),
                source,
            })?;
            compiled.push(regex);
        }

        for (i, regex) in compiled.iter().enumerate() {
            let owner = &rules[i];
            for (other, rule) in rules.iter().enumerate() {
                if other != i && regex.is_match(&rule.canonical) {
                    return Err(ResolverError::HiddenChain {
                        index: other,
                        canonical: rule.canonical.clone(),
                        other: i,
                        other_pattern: owner.pattern.clone(),
                        other_canonical: owner.canonical.clone(),
                    });
                }
                if regex.is_match(&rule.pattern) && owner.canonical != rule.canonical {
                    return Err(ResolverError::ConflictingTarget {
                        index: other,
                        pattern: rule.pattern.clone(),
                        canonical: rule.canonical.clone(),
                        other: i,
                        other_pattern: owner.pattern.clone(),
                        other_canonical: owner.canonical.clone(),
                    });
                }
            }
        }

        Ok(CompanyResolver {
            rules: compiled.into_iter().zip(rules).collect(),
            cache: HashMap::new(),
            stats: ResolverStats::default(),
        })
    }

    /// Resolve a raw company name to its canonical form
    pub fn resolve(&mut self, company: &str) -> String {
        if let Some(hit) = self.cache.get(company) {
            let counts = match hit.origin {
                Origin::Mapped => self.stats.mapped.entry(hit.canonical.clone()).or_default(),
                Origin::Unmapped => &mut self.stats.unmapped,
            };
            counts.cache_hits += 1;
            return hit.canonical.clone();
        }

        let matched = self
            .rules
            .iter()
            .find(|(regex, _)| regex.is_match(company))
            .map(|(_, rule)| rule.canonical.clone());

        let resolution = match matched {
            Some(canonical) => {
                self.stats.mapped.entry(canonical.clone()).or_default().regex_hits += 1;
                Resolution {
                    canonical,
                    origin: Origin::Mapped,
                }
            }
            None => {
                self.stats.unmapped.regex_hits += 1;
                Resolution {
                    canonical: company.to_string(),
                    origin: Origin::Unmapped,
                }
            }
        };

        let canonical = resolution.canonical.clone();
        self.cache.insert(company.to_string(), resolution);
        canonical
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    /// Raw → canonical pairs that were rewritten by a rule, sorted by raw name
    pub fn used_mappings(&self) -> Vec<(String, String)> {
        let mut used: Vec<(String, String)> = self
            .cache
            .iter()
            .filter(|(_, r)| r.origin == Origin::Mapped)
            .map(|(raw, r)| (raw.clone(), r.canonical.clone()))
            .collect();
        used.sort();
        used
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for CompanyResolver {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
