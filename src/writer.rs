//! # Audit Record Writers
//!
//! The persistence side of the pipeline is an external collaborator. The
//! core only needs the [`AuditRecordWriter`] contract; two implementations
//! ship with the crate:
//!
//! - [`MemoryWriter`]: collects records in memory (tests, embedding)
//! - [`JsonLinesWriter`]: one JSON document per line on any `io::Write`

use std::io::Write;
use std::sync::Mutex;

use crate::lock;
use crate::records::{
    AuditRecord, Credential, HttpRecord, Pop3Record, SmtpRecord, Software, SshRecord, TlsRecord,
};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Sink for finished audit records.
///
/// A failed write affects only that record: callers log and count it, then
/// keep processing.
pub trait AuditRecordWriter: Send + Sync {
    fn write(&self, record: AuditRecord) -> Result<(), WriteError>;
}

/// Errors returned by an [`AuditRecordWriter`].
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("writer closed")]
    Closed,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializeError(String),
}

// ---------------------------------------------------------------------------
// MemoryWriter
// ---------------------------------------------------------------------------

/// Collects every record in arrival order.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    records: Mutex<Vec<AuditRecord>>,
    closed: Mutex<bool>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject all further writes with [`WriteError::Closed`].
    pub fn close(&self) {
        *lock(&self.closed) = true;
    }

    /// Snapshot of all records written so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.filter(|r| match r {
            AuditRecord::Credential(c) => Some(c.clone()),
            _ => None,
        })
    }

    pub fn software(&self) -> Vec<Software> {
        self.filter(|r| match r {
            AuditRecord::Software(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn ssh(&self) -> Vec<SshRecord> {
        self.filter(|r| match r {
            AuditRecord::Ssh(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn http(&self) -> Vec<HttpRecord> {
        self.filter(|r| match r {
            AuditRecord::Http(h) => Some(h.clone()),
            _ => None,
        })
    }

    pub fn tls(&self) -> Vec<TlsRecord> {
        self.filter(|r| match r {
            AuditRecord::Tls(t) => Some(t.clone()),
            _ => None,
        })
    }

    pub fn smtp(&self) -> Vec<SmtpRecord> {
        self.filter(|r| match r {
            AuditRecord::Smtp(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn pop3(&self) -> Vec<Pop3Record> {
        self.filter(|r| match r {
            AuditRecord::Pop3(p) => Some(p.clone()),
            _ => None,
        })
    }

    /// Count of records with the given [`AuditRecord::kind`].
    pub fn count_kind(&self, kind: &str) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    fn filter<T>(&self, f: impl Fn(&AuditRecord) -> Option<T>) -> Vec<T> {
        lock(&self.records).iter().filter_map(f).collect()
    }
}

impl AuditRecordWriter for MemoryWriter {
    fn write(&self, record: AuditRecord) -> Result<(), WriteError> {
        if *lock(&self.closed) {
            return Err(WriteError::Closed);
        }
        lock(&self.records).push(record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonLinesWriter
// ---------------------------------------------------------------------------

/// Serializes each record as a single JSON line.
pub struct JsonLinesWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Flush and return the underlying sink.
    pub fn into_inner(self) -> Result<W, WriteError> {
        let mut out = self
            .out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        out.flush()
            .map_err(|e| WriteError::IoError(e.to_string()))?;
        Ok(out)
    }
}

impl<W: Write + Send> AuditRecordWriter for JsonLinesWriter<W> {
    fn write(&self, record: AuditRecord) -> Result<(), WriteError> {
        let line = serde_json::to_string(&record)
            .map_err(|e| WriteError::SerializeError(e.to_string()))?;
        let mut out = lock(&self.out);
        writeln!(out, "{}", line).map_err(|e| WriteError::IoError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
