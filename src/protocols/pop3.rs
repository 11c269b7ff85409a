//! # POP3 Transcript Decoder
//!
//! Replays the command/reply dialogue of a POP3 session (RFC 1939) and
//! writes one [`Pop3Record`]. Credentials accepted by the server are stored
//! with service `POP3`.
//!
//! Replies are consumed in command order, starting after the greeting:
//!
//! | Command                      | Reply                                |
//! |------------------------------|--------------------------------------|
//! | `CAPA`, `RETR`, `TOP`        | status line, data up to `.` if `+OK` |
//! | `LIST`, `UIDL`, `AUTH` alone | status line, data up to `.` if `+OK` |
//! | `AUTH <mech>`                | `+` challenges until `+OK`/`-ERR`    |
//! | anything else                | one status line                      |
//!
//! `QUIT` and an accepted `STLS` end the transcript.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::conversation::Conversation;
use crate::protocols::{DecoderContext, DecoderEntry, DecoderStats, Direction, StreamDecoder};
use crate::records::{AuditRecord, Credential, Pop3Record};

pub const SERVICE_POP3: &str = "POP3";

pub const ENTRY: DecoderEntry = DecoderEntry {
    name: "pop3",
    ports: &[110],
    probe: can_decode,
    factory: Pop3Decoder::factory,
};

/// The server greets with `+OK`.
pub fn can_decode(_client: &[u8], server: &[u8]) -> bool {
    server.starts_with(b"+OK")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Uppercased keyword.
    pub verb: String,
    pub argument: String,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
    Command {
        verb: verb.to_ascii_uppercase(),
        argument: argument.trim().to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
    /// SASL continuation (`+ <challenge>`).
    Continue,
}

/// Status of a server line, and the text after the indicator.
pub fn parse_status(line: &str) -> Option<(Status, &str)> {
    if let Some(rest) = line.strip_prefix("+OK") {
        return Some((Status::Ok, rest.trim()));
    }
    if let Some(rest) = line.strip_prefix("-ERR") {
        return Some((Status::Err, rest.trim()));
    }
    line.strip_prefix('+').map(|rest| (Status::Continue, rest.trim()))
}

fn lines(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == b'\n')
        .map(|l| String::from_utf8_lossy(l).trim_end_matches('\r').to_string())
        .collect()
}

fn multiline(cmd: &Command) -> bool {
    match cmd.verb.as_str() {
        "CAPA" | "RETR" | "TOP" => true,
        "LIST" | "UIDL" | "AUTH" => cmd.argument.is_empty(),
        _ => false,
    }
}

/// Cursor over the server lines.
struct Replies {
    lines: Vec<String>,
    pos: usize,
}

impl Replies {
    /// Next status line. Lines without an indicator are skipped.
    fn status(&mut self) -> Option<Status> {
        while let Some(line) = self.lines.get(self.pos) {
            self.pos += 1;
            if let Some((status, _)) = parse_status(line) {
                return Some(status);
            }
            if !line.is_empty() {
                debug!(line = %line, "unexpected POP3 server line");
            }
        }
        None
    }

    /// Skip a multi-line body up to and including the terminating dot.
    fn skip_data(&mut self) {
        while let Some(line) = self.lines.get(self.pos) {
            self.pos += 1;
            if line == "." {
                return;
            }
        }
    }
}

/// `\0user\0password` from a SASL PLAIN response.
fn sasl_plain(response: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(response.trim()).ok()?;
    let mut parts = decoded.split(|&b| b == 0).skip(1);
    let user = String::from_utf8_lossy(parts.next()?).to_string();
    let pass = String::from_utf8_lossy(parts.next()?).to_string();
    Some((user, pass))
}

/// Replay a session into a record with empty flow fields. The second value
/// names the login method when the record carries a credential.
pub fn summarize(client: &[u8], server: &[u8]) -> (Pop3Record, Option<&'static str>) {
    let mut record = Pop3Record::default();
    let mut method = None;
    let mut replies = Replies {
        lines: lines(server),
        pos: 0,
    };

    match replies.lines.first().and_then(|l| parse_status(l)) {
        Some((Status::Ok, text)) => record.greeting = text.to_string(),
        _ => return (record, None),
    }
    replies.pos = 1;

    let mut pending_user = String::new();
    let mut client = lines(client).into_iter().filter(|l| !l.is_empty());

    while let Some(line) = client.next() {
        let cmd = parse_command(&line);
        record.commands.push(cmd.verb.clone());
        let status = replies.status();
        let accepted = status == Some(Status::Ok);
        if accepted && multiline(&cmd) {
            replies.skip_data();
        }

        match cmd.verb.as_str() {
            "USER" => pending_user = cmd.argument.clone(),
            "PASS" if accepted => {
                record.user = std::mem::take(&mut pending_user);
                record.password = cmd.argument.clone();
                record.authenticated = true;
                method = Some("USER/PASS");
            }
            "APOP" if accepted => {
                let (user, digest) = cmd.argument.split_once(' ').unwrap_or((cmd.argument.as_str(), ""));
                record.user = user.to_string();
                record.auth_token = digest.trim().to_string();
                record.authenticated = true;
                method = Some("APOP");
            }
            "AUTH" if !cmd.argument.is_empty() => {
                let mut parts = cmd.argument.splitn(2, ' ');
                let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
                let mut responses: Vec<String> = parts.map(str::to_string).collect();
                let mut status = status;
                while status == Some(Status::Continue) {
                    let Some(response) = client.next() else {
                        break;
                    };
                    responses.push(response);
                    status = replies.status();
                }
                record.auth_token = responses.last().cloned().unwrap_or_default();
                if status == Some(Status::Ok) {
                    record.authenticated = true;
                    if mechanism == "PLAIN" {
                        if let Some((user, pass)) = responses.first().and_then(|r| sasl_plain(r)) {
                            record.user = user;
                            record.password = pass;
                            method = Some("AUTH PLAIN");
                        }
                    }
                }
            }
            "RETR" | "TOP" if accepted => {
                let number = cmd.argument.split_whitespace().next().unwrap_or_default();
                record.retrieved.push(number.to_string());
            }
            "QUIT" => break,
            "STLS" if accepted => break,
            _ => {}
        }
    }
    (record, method)
}

// ---------------------------------------------------------------------------
// Pop3Decoder
// ---------------------------------------------------------------------------

pub struct Pop3Decoder {
    conv: Conversation,
    ctx: DecoderContext,
    ident: String,
}

impl Pop3Decoder {
    pub fn new(conv: Conversation, ctx: DecoderContext) -> Self {
        let ident = conv.ident();
        Self { conv, ctx, ident }
    }

    fn factory(conv: Conversation, ctx: &DecoderContext) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(conv, ctx.clone()))
    }
}

impl StreamDecoder for Pop3Decoder {
    fn decode(self: Box<Self>) {
        let (summary, method) = summarize(
            &self.conv.stream(Direction::Originator),
            &self.conv.stream(Direction::Responder),
        );
        debug!(
            flow = %self.ident,
            commands = summary.commands.len(),
            authenticated = summary.authenticated,
            "POP3 session"
        );
        DecoderStats::incr(&self.ctx.stats.pop3_sessions);

        let flow = &self.conv.flow;
        let record = Pop3Record {
            timestamp: self.conv.client_first_seen,
            flow: self.ident.clone(),
            src_ip: flow.src_ip.clone(),
            dst_ip: flow.dst_ip.clone(),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            ..summary
        };

        if let Some(method) = method {
            if self.ctx.config.credentials_enabled {
                self.ctx.credentials.write(Credential {
                    timestamp: self.conv.client_first_seen,
                    service: SERVICE_POP3.into(),
                    flow: self.ident.clone(),
                    user: record.user.clone(),
                    password: record.password.clone(),
                    notes: method.into(),
                });
            }
        }
        self.ctx.emit(AuditRecord::Pop3(record));
    }

    fn protocol_id(&self) -> &'static str {
        "pop3"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
