//! # napse-stream - Application-Layer Stream Analysis
//!
//! Turns reassembled TCP conversations into audit records: cleartext
//! credentials, identified software (with vulnerability and exploit
//! enrichment) and per-protocol transcripts for HTTP, SSH, TLS, SMTP and POP3.
//!
//! ## Architecture
//!
//! - **conversation**: The reassembled input, a flow plus directional chunks
//! - **protocols**: Decoder registry and the HTTP, SSH, TLS, SMTP and POP3 decoders
//! - **credentials**: Regex credential harvesters and the dedup store
//! - **software**: Software dedup store, lookup databases and enrichment
//! - **writer**: The audit record sink
//!
//! ## Processing
//!
//! [`StreamEngine::process`] selects a decoder for a conversation, runs it
//! to completion, matches the server's first bytes against the service
//! probes (when loaded) and then sweeps the credential harvesters over the
//! first bytes of the merged stream. Decoders write protocol records directly and
//! push credentials and software into the shared stores. Software is only
//! written out by [`StreamEngine::shutdown`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use napse_stream::{StreamEngine, config::StreamConfig, software::db::Databases};
//! use napse_stream::writer::MemoryWriter;
//!
//! let writer = Arc::new(MemoryWriter::new());
//! let engine = StreamEngine::new(StreamConfig::default(), Databases::empty(), writer)?;
//! // engine.process(conversation);
//! engine.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod conversation;
pub mod credentials;
pub mod protocols;
pub mod records;
pub mod software;
pub mod telemetry;
pub mod writer;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use config::{ConfigError, StreamConfig};
use conversation::Conversation;
use credentials::{CredentialStore, HarvesterEngine};
use protocols::{DecoderContext, DecoderRegistry};
use software::db::Databases;
use software::SoftwareStore;
use writer::{AuditRecordWriter, WriteError};

/// Lock a mutex, continuing with the inner value if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Engine statistics
// ---------------------------------------------------------------------------

/// Cumulative counters for the engine.
#[derive(Debug, Default)]
struct EngineStats {
    conversations: AtomicU64,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    harvested: AtomicU64,
    service_matches: AtomicU64,
}

// ---------------------------------------------------------------------------
// StreamEngine
// ---------------------------------------------------------------------------

/// Orchestrates decoder dispatch, credential harvesting and the stores.
///
/// `Send + Sync`; share it behind an `Arc` and call [`process`] from as many
/// threads as needed. Work for one conversation is sequential.
///
/// [`process`]: StreamEngine::process
pub struct StreamEngine {
    registry: DecoderRegistry,
    harvesters: HarvesterEngine,
    context: DecoderContext,
    stats: EngineStats,
}

impl StreamEngine {
    /// Validate the config and build the stores around `writer`.
    pub fn new(
        config: StreamConfig,
        databases: Databases,
        writer: Arc<dyn AuditRecordWriter>,
    ) -> Result<Self, ConfigError> {
        Self::with_registry(config, databases, writer, DecoderRegistry::default())
    }

    /// Like [`StreamEngine::new`] with a custom decoder list.
    pub fn with_registry(
        config: StreamConfig,
        databases: Databases,
        writer: Arc<dyn AuditRecordWriter>,
        registry: DecoderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let harvesters = HarvesterEngine::new(&config)?;
        info!(
            decoders = ?registry.names(),
            harvesters = harvesters.names().len(),
            "stream engine ready"
        );

        Ok(Self {
            registry,
            harvesters,
            context: DecoderContext::new(config, databases, writer),
            stats: EngineStats::default(),
        })
    }

    /// Decode one conversation and harvest credentials from its banner.
    ///
    /// Returns the name of the decoder that handled it, if any.
    pub fn process(&self, conv: Conversation) -> Option<&'static str> {
        self.stats.conversations.fetch_add(1, Ordering::Relaxed);

        let banner = conv.banner(self.context.config.harvester_banner_size);
        let service_banner = conv.stream_capped(
            protocols::Direction::Responder,
            self.context.config.service_banner_size,
        );
        let ident = conv.ident();
        let (src_port, dst_port) = (conv.flow.src_port, conv.flow.dst_port);
        let ts = if conv.client_first_seen != 0 {
            conv.client_first_seen
        } else {
            conv.chunks().first().map(|c| c.timestamp).unwrap_or_default()
        };

        let entry = self.registry.select(&conv).copied();
        match entry {
            Some(entry) => {
                debug!(flow = %ident, decoder = entry.name, "dispatching conversation");
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                (entry.factory)(conv, &self.context).decode();
            }
            None => {
                debug!(flow = %ident, dst_port, "no decoder matched");
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.match_service_banner(&service_banner, dst_port, &ident, ts);

        let found = self.harvesters.run_harvesters(
            &banner,
            src_port,
            dst_port,
            &ident,
            ts,
            &self.context.credentials,
        );
        self.stats
            .harvested
            .fetch_add(found.len() as u64, Ordering::Relaxed);

        entry.map(|e| e.name)
    }

    /// Identify the server from its first bytes with the service probes.
    fn match_service_banner(&self, banner: &[u8], dst_port: u16, ident: &str, ts: i64) {
        let Some(probes) = &self.context.databases.service_probes else {
            return;
        };
        if banner.is_empty() {
            return;
        }

        let matches = probes.match_banner(banner, dst_port, &self.context.config);
        if matches.is_empty() {
            return;
        }
        debug!(flow = %ident, matches = matches.len(), "service banner identified");
        self.stats
            .service_matches
            .fetch_add(matches.len() as u64, Ordering::Relaxed);
        self.context.software.write_software(
            software::service::service_software(&matches, ident, ts),
            |existing| existing.add_flow(ident),
        );
    }

    /// Process `convs` on `workers` threads (available parallelism when
    /// `None`). Returns the number of conversations processed.
    pub fn process_all(&self, convs: Vec<Conversation>, workers: Option<usize>) -> usize {
        let total = convs.len();
        let workers = workers
            .or_else(|| std::thread::available_parallelism().ok().map(NonZeroUsize::get))
            .unwrap_or(1)
            .clamp(1, total.max(1));
        let queue = Mutex::new(convs.into_iter());

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let next = lock(&queue).next();
                    match next {
                        Some(conv) => {
                            self.process(conv);
                        }
                        None => break,
                    }
                });
            }
        });

        debug!(total, workers, "batch processed");
        total
    }

    /// Wait for outstanding enrichment and write every stored software
    /// artifact. Returns the number written.
    pub fn shutdown(&self) -> Result<usize, WriteError> {
        let enriched = self.context.software.flush_pending_enrichment();
        let written = self.context.software.flush()?;
        info!(
            enrichment_batches = enriched,
            software = written,
            credentials = self.context.credentials.len(),
            "stream engine shut down"
        );
        Ok(written)
    }

    /// Every engine, decoder and store counter by name.
    pub fn stats(&self) -> HashMap<String, u64> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut map: HashMap<String, u64> = HashMap::new();
        map.insert("conversations".into(), load(&self.stats.conversations));
        map.insert("dispatched".into(), load(&self.stats.dispatched));
        map.insert("unmatched".into(), load(&self.stats.unmatched));
        map.insert("credentials_harvested".into(), load(&self.stats.harvested));
        map.insert("service_matches".into(), load(&self.stats.service_matches));

        for (name, value) in self.context.stats.snapshot() {
            map.insert(name.into(), value);
        }

        let creds = &self.context.credentials;
        map.insert("credentials_written".into(), creds.written());
        map.insert("credentials_duplicate".into(), creds.duplicates());
        map.insert("credentials_write_errors".into(), creds.write_errors());

        let sw = &self.context.software;
        map.insert("software_inserted".into(), sw.inserted());
        map.insert("software_updated".into(), sw.updated());
        map.insert("software_flushed".into(), sw.flushed());
        map.insert("software_write_errors".into(), sw.write_errors());
        map.insert("enrichment_batches".into(), sw.enrichment_batches());
        map
    }

    pub fn context(&self) -> &DecoderContext {
        &self.context
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.context.credentials
    }

    pub fn software(&self) -> &SoftwareStore {
        &self.context.software
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
