// 📥 Feeds - local affiliation records, alias rules and the project registry

use crate::resolver::AliasRule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One contributor record of the affiliation feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffiliationRecord {
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country_id: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub sex_prob: Option<f64>,
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AliasDocument {
    #[serde(default)]
    acquisitions: Vec<(String, String)>,
}

pub fn load_affiliations(path: &Path) -> Result<Vec<AffiliationRecord>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read affiliation feed {}", path.display()))?;
    parse_affiliations(&data)
        .with_context(|| format!("Failed to parse affiliation feed {}", path.display()))
}

pub fn parse_affiliations(data: &str) -> Result<Vec<AffiliationRecord>> {
    Ok(serde_json::from_str(data)?)
}

/// Alias rules in file order
pub fn load_alias_rules(path: &Path) -> Result<Vec<AliasRule>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read alias rules {}", path.display()))?;
    parse_alias_rules(&data).with_context(|| format!("Failed to parse alias rules {}", path.display()))
}

pub fn parse_alias_rules(data: &str) -> Result<Vec<AliasRule>> {
    let doc: AliasDocument = serde_yaml::from_str(data)?;
    Ok(doc
        .acquisitions
        .into_iter()
        .map(|(pattern, canonical)| AliasRule::new(pattern, canonical))
        .collect())
}

/// Project identifiers, as a YAML sequence or one per line
pub fn load_projects(path: &Path) -> Result<Vec<String>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read project registry {}", path.display()))?;
    Ok(parse_projects(&data))
}

pub fn parse_projects(data: &str) -> Vec<String> {
    if let Ok(projects) = serde_yaml::from_str::<Vec<String>>(data) {
        return projects
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }

    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
