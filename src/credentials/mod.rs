//! # Credential Harvesting
//!
//! Runs protocol specific [`harvesters`] against the banner of every
//! conversation and writes each distinct credential exactly once.
//!
//! ## Strategy
//!
//! ```text
//! banner bytes
//!     |
//!     v
//! [port hint] dst port, then src port --match + stop policy--> done
//!     |
//!     v
//! [registry sweep] ftp, http, smtp, telnet, imap, custom
//!     (skips hinted harvesters, stops on first match if configured)
//!     |
//!     v
//! [CredentialStore] dedup on service + user + password --> writer
//! ```

pub mod harvesters;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::config::{ConfigError, StreamConfig};
use crate::lock;
use crate::records::{AuditRecord, Credential};
use crate::writer::AuditRecordWriter;

use harvesters::HarvestFn;

// ---------------------------------------------------------------------------
// Port hints
// ---------------------------------------------------------------------------

/// Well-known ports mapped to the harvester tried first.
const PORT_HINTS: &[(u16, &str)] = &[
    (21, "ftp"),
    (80, "http"),
    (587, "smtp"),
    (465, "smtp"),
    (25, "smtp"),
    (23, "telnet"),
    (143, "imap"),
];

// ---------------------------------------------------------------------------
// Harvester
// ---------------------------------------------------------------------------

/// One entry of the harvester registry.
pub enum Harvester {
    Builtin { name: &'static str, run: HarvestFn },
    Custom(Regex),
}

impl Harvester {
    pub fn name(&self) -> &'static str {
        match self {
            Harvester::Builtin { name, .. } => name,
            Harvester::Custom(_) => "custom",
        }
    }

    pub fn harvest(&self, data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
        match self {
            Harvester::Builtin { run, .. } => run(data, flow, ts),
            Harvester::Custom(re) => harvesters::custom(re, data, flow, ts),
        }
    }
}

/// The built-in registry in sweep order.
pub fn builtin_harvesters() -> Vec<Harvester> {
    vec![
        Harvester::Builtin { name: "ftp", run: harvesters::ftp },
        Harvester::Builtin { name: "http", run: harvesters::http },
        Harvester::Builtin { name: "smtp", run: harvesters::smtp },
        Harvester::Builtin { name: "telnet", run: harvesters::telnet },
        Harvester::Builtin { name: "imap", run: harvesters::imap },
    ]
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Process wide set of written credentials.
pub struct CredentialStore {
    /// Dedup keys (`service + user + password`) already written.
    seen: Mutex<HashSet<String>>,
    writer: Arc<dyn AuditRecordWriter>,
    written: AtomicU64,
    duplicates: AtomicU64,
    write_errors: AtomicU64,
}

impl CredentialStore {
    pub fn new(writer: Arc<dyn AuditRecordWriter>) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            writer,
            written: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Write `cred` unless an identical triple was written before.
    ///
    /// Returns `true` if the credential was new.
    pub fn write(&self, cred: Credential) -> bool {
        let key = cred.dedup_key();
        if !lock(&self.seen).insert(key) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.written.fetch_add(1, Ordering::Relaxed);
        let (service, flow) = (cred.service.clone(), cred.flow.clone());
        if let Err(e) = self.writer.write(AuditRecord::Credential(cred)) {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(%service, %flow, error = %e, "failed to write credential record");
        }
        true
    }

    /// Number of distinct credentials seen.
    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// HarvesterEngine
// ---------------------------------------------------------------------------

/// Port hint map plus ordered registry sweep.
pub struct HarvesterEngine {
    harvesters: Vec<Harvester>,
    /// Port to index into `harvesters`.
    port_hints: HashMap<u16, usize>,
    stop_after_match: bool,
    enabled: bool,
}

impl HarvesterEngine {
    /// Build the registry from the config, appending the custom pattern
    /// harvester if one is configured.
    pub fn new(config: &StreamConfig) -> Result<Self, ConfigError> {
        let mut harvesters = builtin_harvesters();
        if let Some(pattern) = &config.custom_regex {
            let re = Regex::new(pattern)
                .map_err(|e| ConfigError::Regex(format!("custom_regex: {}", e)))?;
            harvesters.push(Harvester::Custom(re));
        }

        let port_hints = PORT_HINTS
            .iter()
            .filter_map(|(port, name)| {
                harvesters
                    .iter()
                    .position(|h| h.name() == *name)
                    .map(|idx| (*port, idx))
            })
            .collect();

        Ok(Self {
            harvesters,
            port_hints,
            stop_after_match: config.stop_after_harvester_match,
            enabled: config.credentials_enabled,
        })
    }

    /// Registered harvester names in sweep order.
    pub fn names(&self) -> Vec<&'static str> {
        self.harvesters.iter().map(|h| h.name()).collect()
    }

    /// Run the harvesters against `banner` and submit every hit to `store`.
    ///
    /// Returns all credentials produced, including ones the store already
    /// held.
    pub fn run_harvesters(
        &self,
        banner: &[u8],
        src_port: u16,
        dst_port: u16,
        flow: &str,
        ts: i64,
        store: &CredentialStore,
    ) -> Vec<Credential> {
        let mut found = Vec::new();
        if !self.enabled || banner.is_empty() {
            return found;
        }

        let mut tried: Vec<usize> = Vec::with_capacity(2);
        for port in [dst_port, src_port] {
            let Some(&idx) = self.port_hints.get(&port) else {
                continue;
            };
            if tried.contains(&idx) {
                continue;
            }
            tried.push(idx);

            if let Some(cred) = self.harvesters[idx].harvest(banner, flow, ts) {
                debug!(flow, harvester = self.harvesters[idx].name(), port, "port hint match");
                found.push(cred.clone());
                store.write(cred);
                if self.stop_after_match {
                    return found;
                }
            }
        }

        for (idx, harvester) in self.harvesters.iter().enumerate() {
            if tried.contains(&idx) {
                continue;
            }
            if let Some(cred) = harvester.harvest(banner, flow, ts) {
                debug!(flow, harvester = harvester.name(), "registry match");
                found.push(cred.clone());
                store.write(cred);
                if self.stop_after_match {
                    break;
                }
            }
        }

        found
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MemoryWriter;

    const FTP_BANNER: &[u8] =
        b"220 ready\r\nUSER ftpuser\r\n331 Password required\r\nPASS ftppass\r\n230 ok\r\n";

    fn store() -> (Arc<MemoryWriter>, CredentialStore) {
        let writer = Arc::new(MemoryWriter::new());
        let store = CredentialStore::new(writer.clone());
        (writer, store)
    }

    #[test]
    fn test_store_dedup() {
        let (writer, store) = store();
        let cred = Credential {
            service: "FTP".into(),
            user: "a".into(),
            password: "b".into(),
            ..Default::default()
        };
        assert!(store.write(cred.clone()));
        assert!(!store.write(Credential {
            flow: "other flow".into(),
            ..cred.clone()
        }));
        assert_eq!(writer.credentials().len(), 1);
        assert_eq!(store.written(), 1);
        assert_eq!(store.duplicates(), 1);
    }

    #[test]
    fn test_store_write_error_counted() {
        let (writer, store) = store();
        writer.close();
        assert!(store.write(Credential::default()));
        assert_eq!(store.write_errors(), 1);
    }

    #[test]
    fn test_registry_order() {
        let engine = HarvesterEngine::new(&StreamConfig::default()).unwrap();
        assert_eq!(engine.names(), vec!["ftp", "http", "smtp", "telnet", "imap"]);
    }

    #[test]
    fn test_custom_harvester_appended() {
        let config = StreamConfig {
            custom_regex: Some("secret=(\\w+)".into()),
            ..Default::default()
        };
        let engine = HarvesterEngine::new(&config).unwrap();
        assert_eq!(engine.names().last(), Some(&"custom"));
    }

    #[test]
    fn test_invalid_custom_harvester() {
        let config = StreamConfig {
            custom_regex: Some("(".into()),
            ..Default::default()
        };
        assert!(HarvesterEngine::new(&config).is_err());
    }

    #[test]
    fn test_port_hint_match() {
        let (writer, store) = store();
        let engine = HarvesterEngine::new(&StreamConfig::default()).unwrap();
        let found = engine.run_harvesters(FTP_BANNER, 40000, 21, "flow", 1, &store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user, "ftpuser");
        assert_eq!(writer.credentials().len(), 1);
    }

    #[test]
    fn test_sweep_on_unknown_port() {
        let (_, store) = store();
        let engine = HarvesterEngine::new(&StreamConfig::default()).unwrap();
        let found = engine.run_harvesters(FTP_BANNER, 40000, 2121, "flow", 1, &store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service, "FTP");
    }

    #[test]
    fn test_sweep_after_hint_miss() {
        // telnet hint misses, sweep still finds FTP
        let (_, store) = store();
        let engine = HarvesterEngine::new(&StreamConfig::default()).unwrap();
        let found = engine.run_harvesters(FTP_BANNER, 40000, 23, "flow", 1, &store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service, "FTP");
    }

    #[test]
    fn test_run_all_without_stop_policy() {
        let (writer, store) = store();
        let config = StreamConfig {
            stop_after_harvester_match: false,
            custom_regex: Some("USER (\\w+)".into()),
            ..Default::default()
        };
        let engine = HarvesterEngine::new(&config).unwrap();
        let found = engine.run_harvesters(FTP_BANNER, 40000, 21, "flow", 1, &store);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].service, "Custom Regex");
        assert_eq!(writer.credentials().len(), 2);
    }

    #[test]
    fn test_stop_policy_skips_custom() {
        let (_, store) = store();
        let config = StreamConfig {
            custom_regex: Some("USER (\\w+)".into()),
            ..Default::default()
        };
        let engine = HarvesterEngine::new(&config).unwrap();
        let found = engine.run_harvesters(FTP_BANNER, 40000, 21, "flow", 1, &store);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_disabled() {
        let (writer, store) = store();
        let config = StreamConfig {
            credentials_enabled: false,
            ..Default::default()
        };
        let engine = HarvesterEngine::new(&config).unwrap();
        assert!(engine
            .run_harvesters(FTP_BANNER, 40000, 21, "flow", 1, &store)
            .is_empty());
        assert!(writer.is_empty());
    }
}
