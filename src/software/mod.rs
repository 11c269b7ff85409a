//! # Software Identification Store
//!
//! Deduplicated, concurrently updated collection of fingerprinted software.
//! Producers (HTTP headers, user agents, CMS probes, SSH idents, HASSH and
//! JA3 lookups, service probe banners, the generic version harvester) hand
//! candidate batches to [`SoftwareStore::write_software`].
//!
//! ## Lifecycle
//!
//! ```text
//! candidates (Vec<Option<Software>>)
//!     |
//!     v
//! [store lock] skip empty --> truncate version --> key product/version
//!     |                                   |
//!     | existing: update callback         | new: insert Arc<Mutex<Software>>
//!     v                                   v
//! [release lock] ------------------> [enrichment queue]
//!                                         |
//!                                         v
//!                             N pool workers --> Enricher
//!                                                   |
//!                                                   v
//!                                  Vulnerability / Exploit records
//! shutdown:
//!   flush_pending_enrichment() closes the queue, joins the workers
//!   flush() writes every artifact once
//! ```
//!
//! The pool is started on the first fresh batch and holds a fixed number of
//! threads however many batches are queued. A write after
//! `flush_pending_enrichment` starts a new pool.
//!
//! Artifacts are never removed. Each one carries its own lock so the update
//! callback and the final flush never race with each other.

pub mod advisory;
pub mod cms;
pub mod db;
pub mod http;
pub mod service;
pub mod useragent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::config::{DEFAULT_ENRICHMENT_WORKERS, DEFAULT_VERSION_MAX_LEN};
use crate::lock;
use crate::records::{AuditRecord, Exploit, Software, Vulnerability};
use crate::writer::{AuditRecordWriter, WriteError};

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Looks up known issues for a newly stored artifact.
///
/// Called from an enrichment pool worker, once per artifact, after its
/// first sighting.
pub trait Enricher: Send + Sync {
    fn vulnerabilities(&self, software: &Software) -> Result<Vec<Vulnerability>, EnrichmentError>;

    fn exploits(&self, software: &Software) -> Result<Vec<Exploit>, EnrichmentError>;
}

/// Errors raised by an [`Enricher`]. They are logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("enrichment source unavailable")]
    Unavailable,
}

/// Fixed set of worker threads fed from one batch queue.
struct EnrichmentPool {
    queue: mpsc::Sender<Vec<Software>>,
    workers: Vec<JoinHandle<usize>>,
}

impl EnrichmentPool {
    fn start(size: usize, enricher: Arc<dyn Enricher>, writer: Arc<dyn AuditRecordWriter>) -> Self {
        let (queue, batches) = mpsc::channel::<Vec<Software>>();
        let batches = Arc::new(Mutex::new(batches));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let batches = batches.clone();
            let enricher = enricher.clone();
            let writer = writer.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("napse-enrich-{}", id))
                .spawn(move || {
                    let mut done = 0;
                    loop {
                        let next = lock(&batches).recv();
                        match next {
                            Ok(batch) => {
                                enrich_batch(enricher.as_ref(), writer.as_ref(), &batch);
                                done += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    done
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(worker = id, error = %e, "failed to spawn enrichment worker"),
            }
        }

        debug!(workers = workers.len(), "enrichment pool started");
        Self { queue, workers }
    }

    /// Close the queue and wait until the workers have drained it.
    /// Returns the number of batches enriched.
    fn shutdown(self) -> usize {
        drop(self.queue);
        self.workers
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(done) => done,
                Err(_) => {
                    warn!("enrichment worker panicked");
                    0
                }
            })
            .sum()
    }
}

/// Cut `version` to `max_len` characters and mark the cut with `...`.
pub fn truncate_version(version: &mut String, max_len: usize) {
    if version.chars().count() > max_len {
        let mut cut: String = version.chars().take(max_len).collect();
        cut.push_str("...");
        *version = cut;
    }
}

// ---------------------------------------------------------------------------
// SoftwareStore
// ---------------------------------------------------------------------------

/// Process wide software map keyed by `product/version`.
pub struct SoftwareStore {
    items: Mutex<HashMap<String, Arc<Mutex<Software>>>>,
    version_max_len: usize,
    writer: Arc<dyn AuditRecordWriter>,
    enricher: Option<Arc<dyn Enricher>>,
    enrichment_workers: usize,
    pool: Mutex<Option<EnrichmentPool>>,
    inserted: AtomicU64,
    updated: AtomicU64,
    flushed: AtomicU64,
    write_errors: AtomicU64,
    enrichment_batches: AtomicU64,
}

impl SoftwareStore {
    pub fn new(writer: Arc<dyn AuditRecordWriter>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            version_max_len: DEFAULT_VERSION_MAX_LEN,
            writer,
            enricher: None,
            enrichment_workers: DEFAULT_ENRICHMENT_WORKERS,
            pool: Mutex::new(None),
            inserted: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            enrichment_batches: AtomicU64::new(0),
        }
    }

    pub fn with_version_max_len(mut self, max_len: usize) -> Self {
        self.version_max_len = max_len;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Size of the enrichment pool. At least one worker is kept.
    pub fn with_enrichment_workers(mut self, workers: usize) -> Self {
        self.enrichment_workers = workers.max(1);
        self
    }

    /// Merge a batch of candidates into the store.
    ///
    /// `None` and empty candidates are skipped. Existing entries are passed
    /// to `update` under their own lock; new ones are inserted and handed
    /// to the enricher after the store lock is released.
    ///
    /// Returns the number of newly inserted artifacts.
    pub fn write_software<F>(&self, candidates: Vec<Option<Software>>, mut update: F) -> usize
    where
        F: FnMut(&mut Software),
    {
        let mut fresh = Vec::new();

        {
            let mut items = lock(&self.items);
            for mut software in candidates.into_iter().flatten() {
                if software.is_empty() {
                    continue;
                }
                truncate_version(&mut software.version, self.version_max_len);

                let key = software.dedup_key();
                match items.get(&key) {
                    Some(existing) => {
                        update(&mut *lock(existing));
                        self.updated.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        debug!(%key, source = %software.source_name, "new software");
                        fresh.push(software.clone());
                        items.insert(key, Arc::new(Mutex::new(software)));
                        self.inserted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let count = fresh.len();
        if count > 0 {
            self.schedule_enrichment(fresh);
        }
        count
    }

    /// Queue a batch for the enrichment pool, starting it if needed.
    fn schedule_enrichment(&self, batch: Vec<Software>) {
        let Some(enricher) = &self.enricher else {
            return;
        };

        let mut pool = lock(&self.pool);
        let pool = pool.get_or_insert_with(|| {
            EnrichmentPool::start(self.enrichment_workers, enricher.clone(), self.writer.clone())
        });
        match pool.queue.send(batch) {
            Ok(()) => {
                self.enrichment_batches.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::SendError(batch)) => {
                warn!(dropped = batch.len(), "enrichment pool has no workers");
            }
        }
    }

    /// Wait until every queued batch is enriched, then stop the pool.
    ///
    /// Returns the number of batches the pool enriched.
    pub fn flush_pending_enrichment(&self) -> usize {
        let pool = lock(&self.pool).take();
        pool.map_or(0, EnrichmentPool::shutdown)
    }

    /// Worker threads currently running.
    pub fn enrichment_workers(&self) -> usize {
        lock(&self.pool).as_ref().map_or(0, |p| p.workers.len())
    }

    /// Write every stored artifact to the writer.
    ///
    /// All artifacts are attempted; the first write error is returned after
    /// the pass. On success the number of written records is returned.
    pub fn flush(&self) -> Result<usize, WriteError> {
        let items = lock(&self.items);
        let mut keys: Vec<&String> = items.keys().collect();
        keys.sort();

        let mut written = 0;
        let mut first_error = None;
        for key in keys {
            let software = lock(&items[key]);
            match self.writer.write(AuditRecord::Software(software.clone())) {
                Ok(()) => {
                    written += 1;
                    self.flushed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%key, error = %e, "failed to flush software record");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(written, total = items.len(), "software store flushed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Copy of the artifact stored under `key` (`product/version`).
    pub fn get(&self, key: &str) -> Option<Software> {
        lock(&self.items).get(key).map(|s| lock(s).clone())
    }

    /// Copies of all stored artifacts, sorted by key.
    pub fn snapshot(&self) -> Vec<Software> {
        let items = lock(&self.items);
        let mut keys: Vec<&String> = items.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| lock(&items[k]).clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn enrichment_batches(&self) -> u64 {
        self.enrichment_batches.load(Ordering::Relaxed)
    }
}

/// Run both lookups for every artifact of a batch and write the hits.
fn enrich_batch(enricher: &dyn Enricher, writer: &dyn AuditRecordWriter, batch: &[Software]) {
    for software in batch {
        let key = software.dedup_key();

        match enricher.vulnerabilities(software) {
            Ok(vulns) => {
                for v in vulns {
                    if let Err(e) = writer.write(AuditRecord::Vulnerability(v)) {
                        warn!(%key, error = %e, "failed to write vulnerability record");
                    }
                }
            }
            Err(e) => debug!(%key, error = %e, "vulnerability lookup failed"),
        }

        match enricher.exploits(software) {
            Ok(exploits) => {
                for x in exploits {
                    if let Err(e) = writer.write(AuditRecord::Exploit(x)) {
                        warn!(%key, error = %e, "failed to write exploit record");
                    }
                }
            }
            Err(e) => debug!(%key, error = %e, "exploit lookup failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MemoryWriter;

    fn apache(version: &str) -> Software {
        Software {
            product: "Apache".into(),
            version: version.into(),
            source_name: "ServerName".into(),
            flows: vec!["f1".into()],
            ..Default::default()
        }
    }

    fn store() -> (Arc<MemoryWriter>, SoftwareStore) {
        let writer = Arc::new(MemoryWriter::new());
        (writer.clone(), SoftwareStore::new(writer))
    }

    struct CountingEnricher;

    impl Enricher for CountingEnricher {
        fn vulnerabilities(&self, s: &Software) -> Result<Vec<Vulnerability>, EnrichmentError> {
            Ok(vec![Vulnerability {
                id: "CVE-TEST".into(),
                software: s.dedup_key(),
                ..Default::default()
            }])
        }

        fn exploits(&self, _s: &Software) -> Result<Vec<Exploit>, EnrichmentError> {
            Err(EnrichmentError::Unavailable)
        }
    }

    #[test]
    fn test_truncate_version() {
        let mut v = "1.2.3.4.5.6.7.8.9.10".to_string();
        truncate_version(&mut v, 15);
        assert_eq!(v, "1.2.3.4.5.6.7.8...");

        let mut short = "2.4.29".to_string();
        truncate_version(&mut short, 15);
        assert_eq!(short, "2.4.29");

        let mut exact = "123456789012345".to_string();
        truncate_version(&mut exact, 15);
        assert_eq!(exact, "123456789012345");
    }

    #[test]
    fn test_idempotent_writes() {
        let (_, store) = store();
        let mut updates = 0;
        for _ in 0..5 {
            store.write_software(vec![Some(apache("2.4.29"))], |_| updates += 1);
        }
        assert_eq!(store.len(), 1);
        assert_eq!(updates, 4);
        assert_eq!(store.inserted(), 1);
        assert_eq!(store.updated(), 4);
    }

    #[test]
    fn test_skips_none_and_empty() {
        let (_, store) = store();
        let n = store.write_software(
            vec![None, Some(Software::default()), Some(apache("1.0"))],
            |_| {},
        );
        assert_eq!(n, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_key_uses_truncated_version() {
        let (_, store) = store();
        store.write_software(vec![Some(apache("2.4.29-ubuntu-build-12345"))], |_| {});
        let s = store.get("Apache/2.4.29-ubuntu-b...").unwrap();
        assert_eq!(s.version, "2.4.29-ubuntu-b...");

        // a different long tail collapses onto the same entry
        let mut updated = false;
        store.write_software(vec![Some(apache("2.4.29-ubuntu-build-99999"))], |_| updated = true);
        assert!(updated);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_callback_appends_flow() {
        let (_, store) = store();
        store.write_software(vec![Some(apache("2.4"))], |_| {});
        store.write_software(vec![Some(apache("2.4"))], |s| s.add_flow("f2"));
        store.write_software(vec![Some(apache("2.4"))], |s| s.add_flow("f2"));
        assert_eq!(store.get("Apache/2.4").unwrap().flows, vec!["f1", "f2"]);
    }

    #[test]
    fn test_flush_writes_each_artifact_once() {
        let (writer, store) = store();
        store.write_software(vec![Some(apache("1")), Some(apache("2")), Some(apache("1"))], |_| {});
        assert_eq!(store.flush().unwrap(), 2);
        assert_eq!(writer.software().len(), 2);
        assert_eq!(store.flushed(), 2);
    }

    #[test]
    fn test_flush_reports_write_error() {
        let (writer, store) = store();
        store.write_software(vec![Some(apache("1")), Some(apache("2"))], |_| {});
        writer.close();
        assert!(matches!(store.flush(), Err(WriteError::Closed)));
        assert_eq!(store.write_errors(), 2);
    }

    #[test]
    fn test_enrichment_runs_for_new_artifacts_only() {
        let writer = Arc::new(MemoryWriter::new());
        let store = SoftwareStore::new(writer.clone()).with_enricher(Arc::new(CountingEnricher));

        store.write_software(vec![Some(apache("1")), Some(apache("2"))], |_| {});
        store.write_software(vec![Some(apache("1"))], |_| {});
        assert_eq!(store.flush_pending_enrichment(), 1);

        assert_eq!(store.enrichment_batches(), 1);
        assert_eq!(writer.count_kind("vulnerability"), 2);
        assert_eq!(writer.count_kind("exploit"), 0);
    }

    #[test]
    fn test_concurrent_writers_single_entry() {
        let (_, store) = store();
        let store = Arc::new(store);

        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        store.write_software(vec![Some(apache("2.4"))], |s| {
                            s.add_flow(&format!("flow-{}", i))
                        });
                    }
                });
            }
        });

        assert_eq!(store.len(), 1);
        assert_eq!(store.inserted(), 1);
        assert_eq!(store.updated(), 8 * 50 - 1);
        // f1 plus at most one entry per thread
        assert!(store.get("Apache/2.4").unwrap().flows.len() <= 9);
    }

    struct SlowEnricher {
        delay: std::time::Duration,
        threads: Mutex<std::collections::HashSet<String>>,
    }

    impl Enricher for SlowEnricher {
        fn vulnerabilities(&self, s: &Software) -> Result<Vec<Vulnerability>, EnrichmentError> {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            lock(&self.threads).insert(name);
            std::thread::sleep(self.delay);
            Ok(vec![Vulnerability {
                id: "CVE-SLOW".into(),
                software: s.dedup_key(),
                ..Default::default()
            }])
        }

        fn exploits(&self, _s: &Software) -> Result<Vec<Exploit>, EnrichmentError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_enrichment_pool_is_bounded() {
        let writer = Arc::new(MemoryWriter::new());
        let enricher = Arc::new(SlowEnricher {
            delay: std::time::Duration::from_micros(200),
            threads: Mutex::new(Default::default()),
        });
        let store = SoftwareStore::new(writer.clone())
            .with_enricher(enricher.clone())
            .with_enrichment_workers(3);

        for i in 0..500 {
            store.write_software(vec![Some(apache(&i.to_string()))], |_| {});
        }
        assert_eq!(store.enrichment_workers(), 3);
        assert_eq!(store.enrichment_batches(), 500);

        assert_eq!(store.flush_pending_enrichment(), 500);
        assert_eq!(store.enrichment_workers(), 0);
        assert_eq!(writer.count_kind("vulnerability"), 500);

        let threads = lock(&enricher.threads);
        assert!(!threads.is_empty() && threads.len() <= 3);
        assert!(threads.iter().all(|t| t.starts_with("napse-enrich-")));
    }

    #[test]
    fn test_enrichment_pool_restarts_after_flush() {
        let writer = Arc::new(MemoryWriter::new());
        let store = SoftwareStore::new(writer.clone())
            .with_enricher(Arc::new(CountingEnricher))
            .with_enrichment_workers(0);

        store.write_software(vec![Some(apache("1"))], |_| {});
        assert_eq!(store.enrichment_workers(), 1);
        assert_eq!(store.flush_pending_enrichment(), 1);
        assert_eq!(store.flush_pending_enrichment(), 0);

        store.write_software(vec![Some(apache("2"))], |_| {});
        assert_eq!(store.flush_pending_enrichment(), 1);
        assert_eq!(writer.count_kind("vulnerability"), 2);
    }

    #[test]
    fn test_no_pool_without_enricher() {
        let (_, store) = store();
        store.write_software(vec![Some(apache("1"))], |_| {});
        assert_eq!(store.enrichment_workers(), 0);
        assert_eq!(store.enrichment_batches(), 0);
    }
}
