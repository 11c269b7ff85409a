//! # Audit Records
//!
//! Structured output produced by the stream decoders, the credential
//! harvesters and the software store. Every record is serializable with
//! serde and is handed to an [`AuditRecordWriter`](crate::writer::AuditRecordWriter).
//!
//! Timestamps are Unix epoch nanoseconds.
//!
//! | Record          | Producer                              |
//! |-----------------|---------------------------------------|
//! | `Credential`    | harvesters, HTTP login/basic auth     |
//! | `Software`      | software store flush                  |
//! | `Ssh`           | SSH handshake decoder                 |
//! | `Http`          | HTTP request/response decoder         |
//! | `Tls`           | TLS handshake decoder                 |
//! | `Smtp`          | SMTP transcript decoder               |
//! | `Pop3`          | POP3 transcript decoder               |
//! | `Vulnerability` | background enrichment                 |
//! | `Exploit`       | background enrichment                 |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A leaked credential observed in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub timestamp: i64,
    /// Service the credential belongs to (e.g. "FTP", "SMTP Auth Login").
    pub service: String,
    /// Conversation identifier.
    pub flow: String,
    pub user: String,
    /// Empty for challenge/response schemes.
    pub password: String,
    pub notes: String,
}

impl Credential {
    /// Deduplication key: `service + user + password`.
    pub fn dedup_key(&self) -> String {
        format!("{}{}{}", self.service, self.user, self.password)
    }
}

// ---------------------------------------------------------------------------
// Software
// ---------------------------------------------------------------------------

/// A fingerprinted software product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Software {
    pub timestamp: i64,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub service: String,
    /// How the artifact was derived (e.g. "UserAgent", "HASSH Lookup").
    pub source_name: String,
    /// Raw input the artifact was derived from.
    pub source_data: String,
    /// Conversations the artifact was observed in.
    pub flows: Vec<String>,
    pub notes: String,
    pub os: String,
    pub website: String,
}

impl Software {
    /// True if the artifact carries nothing worth storing.
    pub fn is_empty(&self) -> bool {
        self.product.is_empty()
            && self.vendor.is_empty()
            && self.version.is_empty()
            && self.notes.is_empty()
    }

    /// Store key in the format `product/version`.
    pub fn dedup_key(&self) -> String {
        format!("{}/{}", self.product, self.version)
    }

    /// Append a flow identifier unless it is already recorded.
    pub fn add_flow(&mut self, flow: &str) {
        if !self.flows.iter().any(|f| f == flow) {
            self.flows.push(flow.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol records
// ---------------------------------------------------------------------------

/// One direction of an SSH handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshRecord {
    pub timestamp: i64,
    /// HASSH fingerprint (md5 hex).
    pub hassh: String,
    pub flow: String,
    /// Version identification line.
    pub ident: String,
    /// Canonical `kex;ciphers;macs;compression` string.
    pub algorithms: String,
    pub is_client: bool,
}

/// A paired HTTP request/response, or an unanswered request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRecord {
    pub timestamp: i64,
    pub proto: String,
    pub method: String,
    pub host: String,
    pub req_content_length: i64,
    pub req_content_type: String,
    pub user_agent: String,
    pub referer: String,
    pub url: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub req_cookies: Vec<HttpCookie>,
    /// Query and form parameters, multiple values joined with a space.
    pub parameters: BTreeMap<String, String>,
    pub request_headers: BTreeMap<String, String>,

    /// 0 when unanswered.
    pub status_code: u16,
    pub res_content_length: i64,
    pub res_content_type: String,
    /// Value of the `Server` response header.
    pub server_name: String,
    pub res_cookies: Vec<HttpCookie>,
    pub response_headers: BTreeMap<String, String>,
}

/// Name/value pair from a `Cookie` or `Set-Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCookie {
    pub name: String,
    pub value: String,
}

/// TLS handshake fingerprints for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsRecord {
    pub timestamp: i64,
    pub flow: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub version: String,
    pub cipher: String,
    pub server_name: String,
    pub ja3: String,
    pub ja3_raw: String,
    pub ja3s: String,
    pub ja3s_raw: String,
}

/// SMTP command transcript for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpRecord {
    pub timestamp: i64,
    pub flow: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Greeting line sent by the server.
    pub banner: String,
    /// Command verbs in the order they were sent.
    pub commands: Vec<String>,
    pub mail_from: Vec<String>,
    pub rcpt_to: Vec<String>,
}

/// POP3 command transcript for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pop3Record {
    pub timestamp: i64,
    pub flow: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Greeting text following `+OK`.
    pub greeting: String,
    pub commands: Vec<String>,
    pub user: String,
    pub password: String,
    /// APOP digest or the last SASL client response.
    pub auth_token: String,
    pub authenticated: bool,
    /// Message numbers fetched with `RETR` or `TOP`.
    pub retrieved: Vec<String>,
}

// ---------------------------------------------------------------------------
// Enrichment records
// ---------------------------------------------------------------------------

/// A known vulnerability matched against a stored software artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub timestamp: i64,
    pub id: String,
    pub description: String,
    pub severity: String,
    /// `product/version` of the affected artifact.
    pub software: String,
    pub flows: Vec<String>,
}

/// A public exploit matched against a stored software artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exploit {
    pub timestamp: i64,
    pub id: String,
    pub description: String,
    pub platform: String,
    pub software: String,
    pub flows: Vec<String>,
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// Any record emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    Credential(Credential),
    Software(Software),
    Ssh(SshRecord),
    Http(HttpRecord),
    Tls(TlsRecord),
    Smtp(SmtpRecord),
    Pop3(Pop3Record),
    Vulnerability(Vulnerability),
    Exploit(Exploit),
}

impl AuditRecord {
    /// Short type name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::Credential(_) => "credential",
            AuditRecord::Software(_) => "software",
            AuditRecord::Ssh(_) => "ssh",
            AuditRecord::Http(_) => "http",
            AuditRecord::Tls(_) => "tls",
            AuditRecord::Smtp(_) => "smtp",
            AuditRecord::Pop3(_) => "pop3",
            AuditRecord::Vulnerability(_) => "vulnerability",
            AuditRecord::Exploit(_) => "exploit",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_dedup_key() {
        let c = Credential {
            service: "FTP".into(),
            user: "root".into(),
            password: "toor".into(),
            ..Default::default()
        };
        assert_eq!(c.dedup_key(), "FTProottoor");
    }

    #[test]
    fn test_software_add_flow_is_idempotent() {
        let mut s = Software::default();
        s.add_flow("a");
        s.add_flow("b");
        s.add_flow("a");
        assert_eq!(s.flows, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_software_empty() {
        assert!(Software::default().is_empty());
        let s = Software {
            notes: "1.2.3".into(),
            ..Default::default()
        };
        assert!(!s.is_empty());
    }

    #[test]
    fn test_record_tag() {
        let rec = AuditRecord::Ssh(SshRecord {
            hassh: "abc".into(),
            ..Default::default()
        });
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"type\":\"ssh\""));
        assert_eq!(rec.kind(), "ssh");
    }
}
