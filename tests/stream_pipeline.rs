//! # Stream Pipeline Integration Tests
//!
//! Drives the public engine API with conversations built in code and the
//! lookup databases under `tests/fixtures/`.
//!
//! ```text
//! tests/fixtures/
//!   hasshdb.json
//!   ja_3_3s.json
//!   cmsdb.json
//!   advisories.json
//! ```
//!
//! ## Running
//!
//! ```bash
//! cargo test --test stream_pipeline
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use napse_stream::config::StreamConfig;
use napse_stream::conversation::{Conversation, FlowKey};
use napse_stream::protocols::Direction;
use napse_stream::records::AuditRecord;
use napse_stream::software::db::{Databases, DatabaseError};
use napse_stream::writer::{JsonLinesWriter, MemoryWriter};
use napse_stream::{telemetry, StreamEngine};
use serial_test::serial;

/// Path to test fixture directory.
fn fixtures_dir() -> PathBuf {
    let mut dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    dir.push("tests");
    dir.push("fixtures");
    dir
}

fn flow(src_port: u16, dst_port: u16) -> FlowKey {
    FlowKey::new("192.168.1.10".into(), "192.168.1.20".into(), src_port, dst_port)
}

fn ftp_login() -> Conversation {
    Conversation::new(flow(41021, 21))
        .with_chunk(Direction::Responder, 1_000, b"220 (vsFTPd 3.0.3)\r\n".to_vec())
        .with_chunk(Direction::Originator, 1_100, b"USER ftpuser\r\n".to_vec())
        .with_chunk(Direction::Responder, 1_200, b"331 Please specify the password.\r\n".to_vec())
        .with_chunk(Direction::Originator, 1_300, b"PASS ftppass\r\n".to_vec())
        .with_chunk(Direction::Responder, 1_400, b"230 Login successful.\r\n".to_vec())
}

fn http_basic_auth() -> Conversation {
    Conversation::new(flow(41080, 80))
        .with_chunk(
            Direction::Originator,
            2_000,
            b"GET /admin HTTP/1.1\r\nHost: intranet\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n"
                .to_vec(),
        )
        .with_chunk(
            Direction::Responder,
            2_100,
            b"HTTP/1.1 200 OK\r\nServer: Apache/2.4.29 (Ubuntu)\r\nX-Powered-By: Express\r\nContent-Length: 2\r\n\r\nok"
                .to_vec(),
        )
}

fn ssh_idents() -> Conversation {
    Conversation::new(flow(41022, 22))
        .with_chunk(Direction::Originator, 3_000, b"SSH-2.0-OpenSSH_7.4\r\n".to_vec())
        .with_chunk(
            Direction::Responder,
            3_100,
            b"SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5\r\n".to_vec(),
        )
}

fn smtp_session() -> Conversation {
    Conversation::new(flow(41025, 25))
        .with_chunk(
            Direction::Responder,
            4_000,
            b"220 mx.corp.example ESMTP Postfix 3.4.13\r\n".to_vec(),
        )
        .with_chunk(Direction::Originator, 4_100, b"EHLO client.corp.example\r\n".to_vec())
        .with_chunk(Direction::Responder, 4_200, b"250-mx.corp.example\r\n250 PIPELINING\r\n".to_vec())
        .with_chunk(Direction::Originator, 4_300, b"MAIL FROM:<ops@corp.example>\r\n".to_vec())
        .with_chunk(Direction::Responder, 4_400, b"250 2.1.0 Ok\r\n".to_vec())
        .with_chunk(Direction::Originator, 4_500, b"QUIT\r\n".to_vec())
        .with_chunk(Direction::Responder, 4_600, b"221 2.0.0 Bye\r\n".to_vec())
}

fn pop3_session() -> Conversation {
    Conversation::new(flow(41110, 110))
        .with_chunk(Direction::Responder, 5_000, b"+OK Dovecot ready.\r\n".to_vec())
        .with_chunk(Direction::Originator, 5_100, b"USER alice\r\n".to_vec())
        .with_chunk(Direction::Responder, 5_200, b"+OK\r\n".to_vec())
        .with_chunk(Direction::Originator, 5_300, b"PASS wonderland\r\n".to_vec())
        .with_chunk(Direction::Responder, 5_400, b"+OK Logged in.\r\n".to_vec())
        .with_chunk(Direction::Originator, 5_500, b"RETR 1\r\n".to_vec())
        .with_chunk(Direction::Responder, 5_600, b"+OK 12 octets\r\nSubject: hi\r\n.\r\n".to_vec())
        .with_chunk(Direction::Originator, 5_700, b"QUIT\r\n".to_vec())
        .with_chunk(Direction::Responder, 5_800, b"+OK Logging out.\r\n".to_vec())
}

fn fixture_engine(writer: Arc<MemoryWriter>) -> StreamEngine {
    let dbs = Databases::load(fixtures_dir()).expect("fixture databases");
    StreamEngine::new(StreamConfig::default(), dbs, writer).expect("engine")
}

#[test]
fn test_load_fixture_databases() {
    let dbs = Databases::load(fixtures_dir()).unwrap();
    assert_eq!(dbs.hassh.len(), 1);
    assert_eq!(dbs.ja3.len(), 1);
    assert_eq!(dbs.cms.len(), 2);
    assert!(dbs.user_agents.is_none());
    assert_eq!(dbs.advisories.as_ref().map(|a| a.len()), Some(3));
}

#[test]
fn test_missing_database_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    match Databases::load(dir.path()) {
        Err(DatabaseError::IoError(msg)) => assert!(msg.contains("hasshdb.json")),
        Err(other) => panic!("unexpected: {:?}", other),
        Ok(_) => panic!("expected a missing file error"),
    }
}

#[test]
fn test_malformed_database_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hasshdb.json"), "{not json").unwrap();
    match Databases::load(dir.path()) {
        Err(DatabaseError::ParseError(_)) => {}
        Err(other) => panic!("unexpected: {:?}", other),
        Ok(_) => panic!("expected a parse error"),
    }
}

#[test]
fn test_mixed_traffic_pipeline() {
    let writer = Arc::new(MemoryWriter::new());
    let engine = fixture_engine(writer.clone());

    let convs = vec![ftp_login(), http_basic_auth(), ssh_idents(), smtp_session()];
    assert_eq!(engine.process_all(convs, Some(2)), 4);

    // Decoders wrote their transcripts, software waits for shutdown.
    assert_eq!(writer.http().len(), 1);
    assert_eq!(writer.smtp().len(), 1);
    assert!(writer.software().is_empty());

    let mut creds = writer.credentials();
    creds.sort_by(|a, b| a.service.cmp(&b.service));
    assert_eq!(creds.len(), 2);
    assert_eq!(creds[0].service, "FTP");
    assert_eq!((creds[0].user.as_str(), creds[0].password.as_str()), ("ftpuser", "ftppass"));
    assert_eq!(creds[1].service, "HTTP Basic Auth");
    assert_eq!((creds[1].user.as_str(), creds[1].password.as_str()), ("admin", "secret"));

    let smtp = &writer.smtp()[0];
    assert_eq!(smtp.banner, "mx.corp.example ESMTP Postfix 3.4.13");
    assert_eq!(smtp.commands, vec!["EHLO", "MAIL FROM", "QUIT"]);
    assert_eq!(smtp.mail_from, vec!["ops@corp.example"]);

    let written = engine.shutdown().unwrap();
    let software = writer.software();
    assert_eq!(software.len(), written);
    let keys: Vec<String> = software.iter().map(|s| s.dedup_key()).collect();
    assert!(keys.contains(&"Apache/2.4.29".to_string()));
    assert!(keys.contains(&"OpenSSH/7.4".to_string()));
    assert!(keys.contains(&"OpenSSH/8.2p1".to_string()));
    assert!(keys.contains(&"mx.corp.example ESMTP Postfix/3.4.13".to_string()));
    assert!(software.iter().any(|s| s.product == "Express"));

    let vulns: Vec<String> = writer
        .records()
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::Vulnerability(v) => Some(v.id),
            _ => None,
        })
        .collect();
    assert_eq!(vulns.len(), 2);
    assert!(vulns.contains(&"CVE-2019-0211".to_string()));
    assert!(vulns.contains(&"CVE-2018-15473".to_string()));
    assert_eq!(writer.count_kind("exploit"), 1);

    let stats = engine.stats();
    assert_eq!(stats["conversations"], 4);
    assert_eq!(stats["dispatched"], 3);
    assert_eq!(stats["unmatched"], 1);
    assert_eq!(stats["smtp_sessions"], 1);
    assert_eq!(stats["http_requests"], 1);
}

#[test]
fn test_pop3_session_pipeline() {
    let writer = Arc::new(MemoryWriter::new());
    let engine = StreamEngine::new(StreamConfig::default(), Databases::empty(), writer.clone()).unwrap();
    assert_eq!(engine.process(pop3_session()), Some("pop3"));

    let sessions = writer.pop3();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].greeting, "Dovecot ready.");
    assert_eq!(sessions[0].commands, vec!["USER", "PASS", "RETR", "QUIT"]);
    assert_eq!(sessions[0].retrieved, vec!["1"]);
    assert!(sessions[0].authenticated);

    let pop3: Vec<_> = writer
        .credentials()
        .into_iter()
        .filter(|c| c.service == "POP3")
        .collect();
    assert_eq!(pop3.len(), 1);
    assert_eq!((pop3[0].user.as_str(), pop3[0].password.as_str()), ("alice", "wonderland"));
    assert_eq!(engine.stats()["pop3_sessions"], 1);
}

#[test]
fn test_replayed_traffic_is_deduplicated() {
    let writer = Arc::new(MemoryWriter::new());
    let engine = fixture_engine(writer.clone());

    let convs = (0..3).flat_map(|_| [ftp_login(), http_basic_auth()]).collect();
    engine.process_all(convs, None);
    engine.shutdown().unwrap();

    assert_eq!(writer.credentials().len(), 2);
    let apache: Vec<_> = writer
        .software()
        .into_iter()
        .filter(|s| s.product == "Apache")
        .collect();
    assert_eq!(apache.len(), 1);
    // Every replay shares the same flow identifier.
    assert_eq!(apache[0].flows, vec!["192.168.1.10:41080->192.168.1.20:80"]);
    assert_eq!(writer.count_kind("vulnerability"), 1);
}

#[test]
fn test_credentials_disabled() {
    let writer = Arc::new(MemoryWriter::new());
    let config = StreamConfig {
        credentials_enabled: false,
        ..Default::default()
    };
    let engine = StreamEngine::new(config, Databases::empty(), writer.clone()).unwrap();
    engine.process(ftp_login());
    engine.process(http_basic_auth());
    assert!(writer.credentials().is_empty());
    assert_eq!(writer.http().len(), 1);
}

#[test]
fn test_json_lines_output() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let writer = Arc::new(JsonLinesWriter::new(file.reopen().unwrap()));
    let engine = StreamEngine::new(StreamConfig::default(), Databases::empty(), writer).unwrap();

    engine.process(ssh_idents());
    engine.shutdown().unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|v| v["type"] == "software"));
    assert_eq!(lines[0]["product"], "OpenSSH");
}

#[test]
#[serial]
fn test_tracing_does_not_disturb_processing() {
    telemetry::init_tracing("napse_stream=debug");
    let writer = Arc::new(MemoryWriter::new());
    let engine = StreamEngine::new(StreamConfig::default(), Databases::empty(), writer.clone()).unwrap();
    assert_eq!(engine.process(smtp_session()), Some("smtp"));
    assert_eq!(writer.smtp().len(), 1);
}
