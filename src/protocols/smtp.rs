//! # SMTP Transcript Decoder
//!
//! Reconstructs the command/reply dialogue of an SMTP session and writes a
//! single [`SmtpRecord`] summarizing it: the server greeting, the ordered
//! command verbs and the envelope addresses the server accepted.
//!
//! Replies are read as RFC 5321 reply groups (`250-...` continuation lines
//! up to the final `250 ...` line). Commands are paired with replies in
//! order: the greeting comes first, every command then consumes one reply
//! except `DATA`, which consumes the `354` and the reply to the terminating
//! dot. Lines sent while an `AUTH` exchange is in progress consume one reply
//! each.
//!
//! When enabled, the greeting is scanned with the generic `x.y.z` version
//! harvester.

use tracing::debug;

use crate::conversation::Conversation;
use crate::protocols::{DecoderContext, DecoderEntry, DecoderStats, Direction, StreamDecoder};
use crate::records::{AuditRecord, SmtpRecord};
use crate::software::http::generic_versions;

pub const SERVICE_SMTP: &str = "SMTP";

const COMMANDS: [&str; 14] = [
    "HELO", "EHLO", "MAIL FROM", "RCPT TO", "DATA", "RSET", "VRFY", "NOOP", "QUIT", "AUTH",
    "STARTTLS", "SITE", "HELP", "EXPN",
];

pub const ENTRY: DecoderEntry = DecoderEntry {
    name: "smtp",
    ports: &[25, 587],
    probe: can_decode,
    factory: SmtpDecoder::factory,
};

/// Server greets with `220`, client introduces itself.
pub fn can_decode(client: &[u8], server: &[u8]) -> bool {
    let hello = client.len() >= 4
        && (client[..4].eq_ignore_ascii_case(b"EHLO") || client[..4].eq_ignore_ascii_case(b"HELO"));
    hello && server.starts_with(b"220")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One client line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// A command verb and its argument. `MAIL FROM`/`RCPT TO` arguments are
    /// stripped of angle brackets.
    Command { verb: String, argument: String },
    /// Anything that is not a command (AUTH responses, stray text).
    Other(String),
}

/// A complete reply group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text of every line, code and separator removed.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

fn lines(data: &[u8]) -> impl Iterator<Item = String> + '_ {
    data.split(|&b| b == b'\n')
        .map(|l| String::from_utf8_lossy(l).trim_end_matches('\r').to_string())
}

pub fn parse_command(line: &str) -> ClientLine {
    let trimmed = line.trim();
    let upper = trimmed.to_ascii_uppercase();

    for verb in COMMANDS {
        let Some(rest) = upper.strip_prefix(verb) else {
            continue;
        };
        if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with(':')) {
            continue;
        }
        let argument = trimmed[verb.len()..].trim_start_matches(':').trim();
        let argument = if verb == "MAIL FROM" || verb == "RCPT TO" {
            argument
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_matches(|c| c == '<' || c == '>')
        } else {
            argument
        };
        return ClientLine::Command {
            verb: verb.to_string(),
            argument: argument.to_string(),
        };
    }
    ClientLine::Other(trimmed.to_string())
}

/// Client lines, with message content between `DATA` and the terminating
/// dot left out.
pub fn read_client(data: &[u8]) -> Vec<ClientLine> {
    let mut out = Vec::new();
    let mut in_data = false;

    for line in lines(data) {
        if in_data {
            if line == "." {
                in_data = false;
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let parsed = parse_command(&line);
        if let ClientLine::Command { verb, .. } = &parsed {
            in_data = verb == "DATA";
        }
        out.push(parsed);
    }
    out
}

/// Reply groups in order. Lines without a numeric code are skipped.
pub fn read_replies(data: &[u8]) -> Vec<Reply> {
    let mut out = Vec::new();
    let mut current = Reply::default();

    for line in lines(data) {
        let Some(code) = line.get(..3).and_then(|c| c.parse::<u16>().ok()) else {
            if !line.is_empty() {
                debug!(line = %line, "invalid SMTP reply code");
            }
            continue;
        };
        let rest = line.get(4..).unwrap_or_default();
        let (more, text) = match line.as_bytes().get(3) {
            Some(b'-') => (true, rest),
            _ => (false, rest.trim_start()),
        };
        current.code = code;
        current.lines.push(text.to_string());
        if !more {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.lines.is_empty() {
        out.push(current);
    }
    out
}

/// Summarize a session into a record with empty flow fields.
pub fn summarize(commands: &[ClientLine], replies: &[Reply]) -> SmtpRecord {
    let mut record = SmtpRecord {
        banner: replies
            .first()
            .map(|r| r.lines.join("\n"))
            .unwrap_or_default(),
        ..Default::default()
    };

    let mut next_reply = 1;
    let mut take = |n: usize| {
        let reply = replies.get(next_reply + n - 1);
        next_reply += n;
        reply
    };

    for line in commands {
        let ClientLine::Command { verb, argument } = line else {
            take(1);
            continue;
        };
        record.commands.push(verb.clone());

        match verb.as_str() {
            "DATA" => {
                take(2);
            }
            "MAIL FROM" => {
                if take(1).is_some_and(Reply::is_positive) {
                    record.mail_from.push(argument.clone());
                }
            }
            "RCPT TO" => {
                if take(1).is_some_and(Reply::is_positive) {
                    record.rcpt_to.push(argument.clone());
                }
            }
            "QUIT" | "STARTTLS" => break,
            _ => {
                take(1);
            }
        }
    }
    record
}

// ---------------------------------------------------------------------------
// SmtpDecoder
// ---------------------------------------------------------------------------

pub struct SmtpDecoder {
    conv: Conversation,
    ctx: DecoderContext,
    ident: String,
}

impl SmtpDecoder {
    pub fn new(conv: Conversation, ctx: DecoderContext) -> Self {
        let ident = conv.ident();
        Self { conv, ctx, ident }
    }

    fn factory(conv: Conversation, ctx: &DecoderContext) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(conv, ctx.clone()))
    }
}

impl StreamDecoder for SmtpDecoder {
    fn decode(self: Box<Self>) {
        let commands = read_client(&self.conv.stream(Direction::Originator));
        let replies = read_replies(&self.conv.stream(Direction::Responder));
        debug!(flow = %self.ident, commands = commands.len(), replies = replies.len(), "SMTP session");
        DecoderStats::incr(&self.ctx.stats.smtp_sessions);

        let flow = &self.conv.flow;
        let record = SmtpRecord {
            timestamp: self.conv.client_first_seen,
            flow: self.ident.clone(),
            src_ip: flow.src_ip.clone(),
            dst_ip: flow.dst_ip.clone(),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            ..summarize(&commands, &replies)
        };

        let software = if self.ctx.config.enable_generic_version_harvester {
            generic_versions(
                record.banner.as_bytes(),
                &self.ident,
                self.conv.server_first_seen,
                SERVICE_SMTP,
            )
        } else {
            Vec::new()
        };

        self.ctx.emit(AuditRecord::Smtp(record));
        if !software.is_empty() {
            let ident = self.ident.as_str();
            self.ctx
                .software
                .write_software(software, |existing| existing.add_flow(ident));
        }
    }

    fn protocol_id(&self) -> &'static str {
        "smtp"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::StreamConfig;
    use crate::conversation::FlowKey;
    use crate::software::db::Databases;
    use crate::writer::MemoryWriter;

    const SERVER: &[u8] = b"220 mail.example.com ESMTP Postfix 3.4.13\r\n\
250-mail.example.com\r\n250-SIZE 10240000\r\n250 8BITMIME\r\n\
250 2.1.0 Ok\r\n\
250 2.1.5 Ok\r\n\
550 5.1.1 <nobody@example.com>: Recipient address rejected\r\n\
354 End data with <CR><LF>.<CR><LF>\r\n\
250 2.0.0 Ok: queued\r\n\
221 2.0.0 Bye\r\n";

    const CLIENT: &[u8] = b"EHLO client.example.org\r\n\
MAIL FROM:<alice@example.org> SIZE=120\r\n\
RCPT TO:<bob@example.com>\r\n\
RCPT TO:<nobody@example.com>\r\n\
DATA\r\n\
Subject: hi\r\n\
\r\n\
RCPT TO:<inside@body.com>\r\n\
.\r\n\
QUIT\r\n";

    fn conversation() -> Conversation {
        Conversation::new(FlowKey::new("10.0.0.3".into(), "10.0.0.25".into(), 41000, 25))
            .with_chunk(Direction::Responder, 5, SERVER.to_vec())
            .with_chunk(Direction::Originator, 7, CLIENT.to_vec())
    }

    #[test]
    fn test_probe() {
        assert!(can_decode(b"ehlo x\r\n", b"220 ready\r\n"));
        assert!(can_decode(b"HELO x\r\n", b"220 ready\r\n"));
        assert!(!can_decode(b"GET /", b"220 ready\r\n"));
        assert!(!can_decode(b"EHLO x\r\n", b"554 no\r\n"));
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("mail from: <a@b.c>"),
            ClientLine::Command {
                verb: "MAIL FROM".into(),
                argument: "a@b.c".into()
            }
        );
        assert_eq!(
            parse_command("EHLO host"),
            ClientLine::Command {
                verb: "EHLO".into(),
                argument: "host".into()
            }
        );
        assert_eq!(parse_command("dXNlcm5hbWU="), ClientLine::Other("dXNlcm5hbWU=".into()));
        // A verb prefix inside a longer word is not a command.
        assert!(matches!(parse_command("DATABASE"), ClientLine::Other(_)));
    }

    #[test]
    fn test_multiline_replies_merged() {
        let replies = read_replies(SERVER);
        assert_eq!(replies.len(), 8);
        assert_eq!(replies[1].code, 250);
        assert_eq!(replies[1].lines, vec!["mail.example.com", "SIZE 10240000", "8BITMIME"]);
    }

    #[test]
    fn test_data_content_skipped() {
        let lines = read_client(CLIENT);
        let verbs: Vec<&str> = lines
            .iter()
            .filter_map(|l| match l {
                ClientLine::Command { verb, .. } => Some(verb.as_str()),
                ClientLine::Other(_) => None,
            })
            .collect();
        assert_eq!(verbs, vec!["EHLO", "MAIL FROM", "RCPT TO", "RCPT TO", "DATA", "QUIT"]);
    }

    #[test]
    fn test_decode_record() {
        let writer = Arc::new(MemoryWriter::new());
        let ctx = DecoderContext::new(StreamConfig::default(), Databases::empty(), writer.clone());
        SmtpDecoder::factory(conversation(), &ctx).decode();

        let records = writer.smtp();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.banner, "mail.example.com ESMTP Postfix 3.4.13");
        assert_eq!(r.mail_from, vec!["alice@example.org"]);
        assert_eq!(r.rcpt_to, vec!["bob@example.com"]);
        assert_eq!(r.commands.len(), 6);
        assert_eq!(r.timestamp, 7);
        assert_eq!(r.dst_port, 25);

        let postfix = ctx.software.get("mail.example.com ESMTP Postfix/3.4.13").unwrap();
        assert_eq!(postfix.source_name, "Generic version harvester");
        assert_eq!(postfix.service, "SMTP");
    }

    #[test]
    fn test_generic_harvester_disabled() {
        let writer = Arc::new(MemoryWriter::new());
        let config = StreamConfig {
            enable_generic_version_harvester: false,
            ..Default::default()
        };
        let ctx = DecoderContext::new(config, Databases::empty(), writer.clone());
        SmtpDecoder::factory(conversation(), &ctx).decode();
        assert_eq!(writer.smtp().len(), 1);
        assert!(ctx.software.is_empty());
    }

    #[test]
    fn test_auth_exchange_consumes_replies() {
        let client = b"EHLO x\r\nAUTH LOGIN\r\ndXNlcg==\r\ncGFzcw==\r\nMAIL FROM:<a@b>\r\n";
        let server = b"220 hi\r\n250 ok\r\n334 VXNlcm5hbWU6\r\n334 UGFzc3dvcmQ6\r\n235 ok\r\n250 ok\r\n";
        let record = summarize(&read_client(client), &read_replies(server));
        assert_eq!(record.commands, vec!["EHLO", "AUTH", "MAIL FROM"]);
        assert_eq!(record.mail_from, vec!["a@b"]);
    }
}
