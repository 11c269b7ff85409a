//! # Fingerprint Databases
//!
//! Read-only lookup tables loaded once at startup from a database
//! directory:
//!
//! | File              | Contents                                   | Required |
//! |-------------------|--------------------------------------------|----------|
//! | `hasshdb.json`    | HASSH digest to candidate SSH software     | yes      |
//! | `ja_3_3s.json`    | JA3/JA3S combinations per server/process   | yes      |
//! | `cmsdb.json`      | CMS header and cookie signatures           | yes      |
//! | `regexes.yaml`    | user-agent grammar                         | no       |
//! | `advisories.json` | vulnerability / exploit advisories         | no       |
//! | `nmap-service-probes` | banner match directives                | no       |
//!
//! A missing or malformed required file is fatal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::advisory::AdvisoryDatabase;
use super::cms::CmsDatabase;
use super::service::ServiceProbeDatabase;
use super::useragent::{UaParser, UserAgentIdentifier};

pub const HASSH_DB_FILE: &str = "hasshdb.json";
pub const JA3_DB_FILE: &str = "ja_3_3s.json";
pub const CMS_DB_FILE: &str = "cmsdb.json";
pub const UA_REGEXES_FILE: &str = "regexes.yaml";
pub const ADVISORY_DB_FILE: &str = "advisories.json";
pub const SERVICE_PROBES_FILE: &str = "nmap-service-probes";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading a database.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Regex error: {0}")]
    RegexError(String),
}

/// Read a whole file, mapping failures to [`DatabaseError::IoError`].
pub(crate) fn read_db_file(path: &Path) -> Result<String, DatabaseError> {
    std::fs::read_to_string(path)
        .map_err(|e| DatabaseError::IoError(format!("{}: {}", path.display(), e)))
}

/// Prefix a parse failure with the file it came from.
pub(crate) fn with_path(path: &Path, err: DatabaseError) -> DatabaseError {
    match err {
        DatabaseError::ParseError(msg) => {
            DatabaseError::ParseError(format!("{}: {}", path.display(), msg))
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// HASSH
// ---------------------------------------------------------------------------

/// One candidate entry of a HASSH digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HasshSoftware {
    /// Encoded as `<ssh ver> | <vendor> <version> ? <os>`.
    #[serde(rename = "name", default)]
    pub name: String,
    #[serde(rename = "likelyhood", default)]
    pub likelihood: String,
}

#[derive(Debug, Deserialize)]
struct HasshEntry {
    hash: String,
    #[serde(rename = "softwares", default)]
    software: Vec<HasshSoftware>,
}

/// HASSH digest to candidate software.
#[derive(Debug, Default)]
pub struct HasshDatabase {
    entries: HashMap<String, Vec<HasshSoftware>>,
}

impl HasshDatabase {
    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        let list: Vec<HasshEntry> =
            serde_json::from_str(json).map_err(|e| DatabaseError::ParseError(e.to_string()))?;
        let entries = list.into_iter().map(|e| (e.hash, e.software)).collect();
        Ok(Self { entries })
    }

    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        Self::from_json(&read_db_file(path)?).map_err(|e| with_path(path, e))
    }

    pub fn lookup(&self, hassh: &str) -> &[HasshSoftware] {
        self.entries.get(hassh).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fields decoded from a [`HasshSoftware::name`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HasshCandidate {
    pub ssh_version: String,
    pub product: String,
    pub version: String,
    pub os: String,
}

/// Decode `"SSH 2.0 | OpenSSH 7.4 ? Debian"`.
///
/// Without a ` | ` separator the whole head is read as `<vendor> <version>`.
pub fn parse_hassh_candidate(name: &str) -> HasshCandidate {
    let parts: Vec<&str> = name.split(" ? ").collect();
    let head = parts[0];
    let os = if parts.len() > 1 {
        parts[parts.len() - 1]
    } else {
        ""
    };

    let (ssh_version, vendor_version) = match head.split_once(" | ") {
        Some((ssh, rest)) => (ssh, rest),
        None => ("", head),
    };
    let mut words = vendor_version.split(' ');

    HasshCandidate {
        ssh_version: ssh_version.to_string(),
        product: words.next().unwrap_or_default().to_string(),
        version: words.next().unwrap_or_default().to_string(),
        os: os.to_string(),
    }
}

// ---------------------------------------------------------------------------
// JA3 combinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ja3Process {
    #[serde(default)]
    pub process: String,
    #[serde(rename = "JA3", default)]
    pub ja3: String,
    #[serde(rename = "JA3S", default)]
    pub ja3s: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ja3Client {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub processes: Vec<Ja3Process>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ja3Server {
    /// Server banner, e.g. `Apache/2.4.29 (Ubuntu)`.
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub clients: Vec<Ja3Client>,
}

/// One process observed with both fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct Ja3Match<'a> {
    pub server: &'a Ja3Server,
    pub client: &'a Ja3Client,
    pub process: &'a Ja3Process,
}

#[derive(Debug, Default)]
pub struct Ja3Database {
    servers: Vec<Ja3Server>,
}

impl Ja3Database {
    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        let servers =
            serde_json::from_str(json).map_err(|e| DatabaseError::ParseError(e.to_string()))?;
        Ok(Self { servers })
    }

    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        Self::from_json(&read_db_file(path)?).map_err(|e| with_path(path, e))
    }

    /// All processes whose JA3 and JA3S both equal the given digests.
    /// Empty unless both digests are present.
    pub fn lookup(&self, ja3: &str, ja3s: &str) -> Vec<Ja3Match<'_>> {
        if ja3.is_empty() || ja3s.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for server in &self.servers {
            for client in &server.clients {
                for process in &client.processes {
                    if process.ja3 == ja3 && process.ja3s == ja3s {
                        out.push(Ja3Match {
                            server,
                            client,
                            process,
                        });
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Databases
// ---------------------------------------------------------------------------

/// Every lookup table the decoders and producers consult.
#[derive(Default)]
pub struct Databases {
    pub hassh: HasshDatabase,
    pub ja3: Ja3Database,
    pub cms: CmsDatabase,
    pub user_agents: Option<UserAgentIdentifier>,
    pub advisories: Option<Arc<AdvisoryDatabase>>,
    pub service_probes: Option<ServiceProbeDatabase>,
}

impl Databases {
    /// No entries at all. Every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all databases from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let dir = dir.as_ref();

        let hassh = HasshDatabase::from_file(&dir.join(HASSH_DB_FILE))?;
        info!(total = hassh.len(), "loaded HASSH digests");

        let ja3 = Ja3Database::from_file(&dir.join(JA3_DB_FILE))?;
        info!(total = ja3.len(), "loaded JA3/JA3S database");

        let cms = CmsDatabase::from_file(&dir.join(CMS_DB_FILE))?;
        info!(total = cms.len(), "loaded CMS database");

        let ua_path = dir.join(UA_REGEXES_FILE);
        let user_agents = if ua_path.exists() {
            let parser = UaParser::from_file(&ua_path)?;
            info!(path = %ua_path.display(), "loaded user-agent grammar");
            Some(UserAgentIdentifier::new(Arc::new(parser)))
        } else {
            info!(path = %ua_path.display(), "no user-agent grammar, user-agent identification disabled");
            None
        };

        let advisory_path = dir.join(ADVISORY_DB_FILE);
        let advisories = if advisory_path.exists() {
            let db = AdvisoryDatabase::from_file(&advisory_path)?;
            info!(total = db.len(), "loaded advisory database");
            Some(Arc::new(db))
        } else {
            None
        };

        let probes_path = dir.join(SERVICE_PROBES_FILE);
        let service_probes = if probes_path.exists() {
            let db = ServiceProbeDatabase::from_file(&probes_path)?;
            info!(total = db.len(), skipped = db.skipped(), "loaded service probes");
            Some(db)
        } else {
            None
        };

        Ok(Self {
            hassh,
            ja3,
            cms,
            user_agents,
            advisories,
            service_probes,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
