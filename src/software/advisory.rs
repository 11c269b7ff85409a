//! # Advisory Enrichment
//!
//! JSON backed [`Enricher`]: matches newly identified software against a
//! local list of vulnerability and exploit advisories.
//!
//! ```json
//! {
//!   "vulnerabilities": [
//!     {"id": "CVE-2019-0211", "product": "Apache", "versions": ["2.4.29"],
//!      "description": "privilege escalation", "severity": "HIGH"}
//!   ],
//!   "exploits": [
//!     {"id": "EDB-46676", "product": "Apache", "versions": ["2.4"],
//!      "description": "CARPE (DIEM)", "platform": "linux"}
//!   ]
//! }
//! ```
//!
//! Products compare case-insensitively. A listed version matches when it
//! is a prefix of the artifact version ending at a non-digit, so `2.4`
//! covers `2.4.29` but not `2.41`. An empty version list covers every
//! version.

use std::path::Path;

use serde::Deserialize;

use super::db::{read_db_file, with_path, DatabaseError};
use super::{Enricher, EnrichmentError};
use crate::records::{Exploit, Software, Vulnerability};

#[derive(Debug, Clone, Deserialize)]
pub struct VulnerabilityAdvisory {
    pub id: String,
    pub product: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExploitAdvisory {
    pub id: String,
    pub product: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdvisoryDatabase {
    #[serde(default)]
    vulnerabilities: Vec<VulnerabilityAdvisory>,
    #[serde(default)]
    exploits: Vec<ExploitAdvisory>,
}

impl AdvisoryDatabase {
    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        serde_json::from_str(json).map_err(|e| DatabaseError::ParseError(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        Self::from_json(&read_db_file(path)?).map_err(|e| with_path(path, e))
    }

    pub fn len(&self) -> usize {
        self.vulnerabilities.len() + self.exploits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn affects(product: &str, versions: &[String], software: &Software) -> bool {
    if software.product.is_empty() || !product.eq_ignore_ascii_case(&software.product) {
        return false;
    }
    versions.is_empty()
        || versions
            .iter()
            .any(|v| version_prefix_matches(v, &software.version))
}

fn version_prefix_matches(prefix: &str, version: &str) -> bool {
    match version.strip_prefix(prefix) {
        Some(rest) => !rest.starts_with(|c: char| c.is_ascii_digit()),
        None => false,
    }
}

impl Enricher for AdvisoryDatabase {
    fn vulnerabilities(&self, software: &Software) -> Result<Vec<Vulnerability>, EnrichmentError> {
        Ok(self
            .vulnerabilities
            .iter()
            .filter(|a| affects(&a.product, &a.versions, software))
            .map(|a| Vulnerability {
                timestamp: software.timestamp,
                id: a.id.clone(),
                description: a.description.clone(),
                severity: a.severity.clone(),
                software: software.dedup_key(),
                flows: software.flows.clone(),
            })
            .collect())
    }

    fn exploits(&self, software: &Software) -> Result<Vec<Exploit>, EnrichmentError> {
        Ok(self
            .exploits
            .iter()
            .filter(|a| affects(&a.product, &a.versions, software))
            .map(|a| Exploit {
                timestamp: software.timestamp,
                id: a.id.clone(),
                description: a.description.clone(),
                platform: a.platform.clone(),
                software: software.dedup_key(),
                flows: software.flows.clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
