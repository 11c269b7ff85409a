//! # Stream Decoders
//!
//! Application-layer decoders for reassembled TCP conversations. Each
//! decoder module exposes a [`DecoderEntry`]: a cheap probe over the first
//! client and server chunks plus a factory that takes ownership of the
//! conversation.
//!
//! ## Supported Protocols
//!
//! | Module | Protocol | Port hint | Records                          |
//! |--------|----------|-----------|----------------------------------|
//! | `http` | HTTP/1.x | 80        | `Http`, `Credential`, `Software` |
//! | `ssh`  | SSH      | 22        | `Ssh`, `Software`                |
//! | `tls`  | TLS      | 443       | `Tls`, `Software`                |
//! | `smtp` | SMTP     | 25, 587   | `Smtp`, `Software`               |
//! | `pop3` | POP3     | 110       | `Pop3`, `Credential`             |
//!
//! ## Dispatch
//!
//! 1. A conversation without client bytes or without server bytes is never
//!    dispatched.
//! 2. The entry whose port hint contains the destination port is tried
//!    first, and only used if its probe accepts.
//! 3. Otherwise every entry is probed in registry order; first match wins.
//!
//! ## Adding a New Protocol
//!
//! 1. Create `src/protocols/<name>.rs` with a probe, a decoder struct
//!    implementing [`StreamDecoder`] and a `pub const ENTRY`
//! 2. Declare the module in this file
//! 3. Append the entry in [`DecoderRegistry::default`]

pub mod http;
pub mod pop3;
pub mod smtp;
pub mod ssh;
pub mod tls;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use tracing::warn;

use crate::config::StreamConfig;
use crate::conversation::Conversation;
use crate::credentials::CredentialStore;
use crate::records::AuditRecord;
use crate::software::db::Databases;
use crate::software::SoftwareStore;
use crate::writer::AuditRecordWriter;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Payload direction relative to the connection originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the connection originator (client).
    Originator,
    /// Sent by the connection responder (server).
    Responder,
}

// ---------------------------------------------------------------------------
// StreamDecoder trait
// ---------------------------------------------------------------------------

/// A decoder bound to one conversation.
///
/// `decode` consumes the decoder and runs to completion. Parse failures are
/// logged and swallowed; results leave only through the records and stores
/// of the [`DecoderContext`].
pub trait StreamDecoder: Send {
    fn decode(self: Box<Self>);

    /// Short protocol identifier, matching the registry entry name.
    fn protocol_id(&self) -> &'static str;
}

/// Inspects the first client chunk and the first server chunk.
pub type ProbeFn = fn(client: &[u8], server: &[u8]) -> bool;

/// Builds a decoder owning the conversation.
pub type FactoryFn = fn(Conversation, &DecoderContext) -> Box<dyn StreamDecoder>;

/// One registry slot.
#[derive(Clone, Copy)]
pub struct DecoderEntry {
    pub name: &'static str,
    /// Destination ports tried before the ordered sweep.
    pub ports: &'static [u16],
    pub probe: ProbeFn,
    pub factory: FactoryFn,
}

impl std::fmt::Debug for DecoderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderEntry")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decoder statistics
// ---------------------------------------------------------------------------

/// Advisory counters shared by all decoders.
#[derive(Debug, Default)]
pub struct DecoderStats {
    pub records_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub http_requests: AtomicU64,
    pub http_responses: AtomicU64,
    pub http_unmatched_responses: AtomicU64,
    pub http_unanswered_requests: AtomicU64,
    pub http_malformed: AtomicU64,
    pub ssh_kex_found: AtomicU64,
    pub ssh_insufficient_data: AtomicU64,
    pub tls_handshakes: AtomicU64,
    pub smtp_sessions: AtomicU64,
    pub pop3_sessions: AtomicU64,
}

impl DecoderStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Named snapshot of every counter.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("records_written", load(&self.records_written)),
            ("write_errors", load(&self.write_errors)),
            ("http_requests", load(&self.http_requests)),
            ("http_responses", load(&self.http_responses)),
            ("http_unmatched_responses", load(&self.http_unmatched_responses)),
            ("http_unanswered_requests", load(&self.http_unanswered_requests)),
            ("http_malformed", load(&self.http_malformed)),
            ("ssh_kex_found", load(&self.ssh_kex_found)),
            ("ssh_insufficient_data", load(&self.ssh_insufficient_data)),
            ("tls_handshakes", load(&self.tls_handshakes)),
            ("smtp_sessions", load(&self.smtp_sessions)),
            ("pop3_sessions", load(&self.pop3_sessions)),
        ]
    }
}

// ---------------------------------------------------------------------------
// DecoderContext
// ---------------------------------------------------------------------------

/// Everything a decoder may touch besides its own conversation.
#[derive(Clone)]
pub struct DecoderContext {
    pub config: Arc<StreamConfig>,
    pub credentials: Arc<CredentialStore>,
    pub software: Arc<SoftwareStore>,
    pub databases: Arc<Databases>,
    pub writer: Arc<dyn AuditRecordWriter>,
    pub stats: Arc<DecoderStats>,
}

impl DecoderContext {
    /// Build fresh stores around `writer`. Advisories found in `databases`
    /// become the software enricher.
    pub fn new(config: StreamConfig, databases: Databases, writer: Arc<dyn AuditRecordWriter>) -> Self {
        let mut software =
            SoftwareStore::new(writer.clone())
            .with_version_max_len(config.version_max_len)
            .with_enrichment_workers(config.enrichment_workers);
        if let Some(advisories) = &databases.advisories {
            software = software.with_enricher(advisories.clone());
        }

        Self {
            config: Arc::new(config),
            credentials: Arc::new(CredentialStore::new(writer.clone())),
            software: Arc::new(software),
            databases: Arc::new(databases),
            writer,
            stats: Arc::new(DecoderStats::default()),
        }
    }

    /// Write one protocol record. Failures are logged and counted.
    pub fn emit(&self, record: AuditRecord) -> bool {
        let kind = record.kind();
        match self.writer.write(record) {
            Ok(()) => {
                DecoderStats::incr(&self.stats.records_written);
                true
            }
            Err(e) => {
                DecoderStats::incr(&self.stats.write_errors);
                warn!(kind, error = %e, "failed to write record");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DecoderRegistry
// ---------------------------------------------------------------------------

/// Ordered list of decoders. The order is part of the contract.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    entries: Vec<DecoderEntry>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_entries(vec![http::ENTRY, ssh::ENTRY, tls::ENTRY, smtp::ENTRY, pop3::ENTRY])
    }
}

impl DecoderRegistry {
    pub fn with_entries(entries: Vec<DecoderEntry>) -> Self {
        Self { entries }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// The decoder for `conv`, if any.
    pub fn select(&self, conv: &Conversation) -> Option<&DecoderEntry> {
        let client = conv.first_chunk(Direction::Originator);
        let server = conv.first_chunk(Direction::Responder);
        if client.is_empty() || server.is_empty() {
            return None;
        }

        let hinted = self
            .entries
            .iter()
            .find(|e| e.ports.contains(&conv.flow.dst_port));
        if let Some(entry) = hinted {
            if (entry.probe)(client, server) {
                return Some(entry);
            }
        }

        self.entries.iter().find(|e| (e.probe)(client, server))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Bounds-checked big-endian cursor for binary handshakes.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Everything not consumed yet.
    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    /// At most `n` bytes, fewer when the buffer ends first.
    pub(crate) fn take_upto(&mut self, n: usize) -> &'a [u8] {
        let n = n.min(self.remaining());
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
