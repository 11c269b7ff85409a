//! # Credential Harvesters
//!
//! Pure functions that search the banner of a conversation (the first
//! bytes of both directions, merged in arrival order) for credentials.
//! Each harvester is one or more fixed byte patterns plus the decoding
//! the protocol needs (base64, SASL PLAIN NUL framing).
//!
//! | Harvester | Schemes                                            |
//! |-----------|----------------------------------------------------|
//! | `ftp`     | USER / PASS                                        |
//! | `http`    | Basic, Digest                                      |
//! | `smtp`    | AUTH PLAIN (inline and separate), LOGIN, CRAM-MD5  |
//! | `telnet`  | echoed login prompt                                |
//! | `imap`    | LOGIN, AUTHENTICATE LOGIN/PLAIN/CRAM-MD5           |
//!
//! A base64 field that fails to decode is logged and treated as empty.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::debug;

use crate::records::Credential;

/// Signature shared by all built-in harvesters.
pub type HarvestFn = fn(data: &[u8], flow: &str, ts: i64) -> Option<Credential>;

// ---------------------------------------------------------------------------
// Service names
// ---------------------------------------------------------------------------

const SERVICE_FTP: &str = "FTP";
const SERVICE_HTTP_BASIC: &str = "HTTP Basic Auth";
const SERVICE_SMTP_PLAIN: &str = "SMTP Auth Plain";
const SERVICE_SMTP_LOGIN: &str = "SMTP Auth Login";
const SERVICE_SMTP_CRAM_MD5: &str = "SMTP Auth CRAM-MD5";
const SERVICE_TELNET: &str = "Telnet";
const SERVICE_IMAP_PLAIN_SINGLE: &str = "IMAP Plain Single Line";
const SERVICE_IMAP_PLAIN_SEPARATE: &str = "IMAP Plain Separate Line";
const SERVICE_IMAP_LOGIN: &str = "IMAP Login";
const SERVICE_IMAP_CRAM_MD5: &str = "IMAP CRAM-MD5";

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Compile a static pattern in byte mode so `.` also matches non UTF-8.
fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?-u){}", pattern)).expect("static harvester pattern")
}

static RE_FTP: Lazy<Regex> = Lazy::new(|| {
    compile(r"220(?:.*?)\r\n(?:.*)\r?\n?(?:.*)\r?\n?USER\s(.*?)\r\n331(?:.*?)\r\nPASS\s(.*?)\r\n")
});
static RE_HTTP_BASIC: Lazy<Regex> =
    Lazy::new(|| compile(r"(?:.*?)HTTP(?:[\s\S]*)(?:Authorization: Basic )(.*?)\r\n"));
static RE_HTTP_DIGEST: Lazy<Regex> =
    Lazy::new(|| compile(r"(?:.*?)Authorization: Digest (.*?)\r\n"));
static RE_SMTP_PLAIN_SEPARATE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)AUTH PLAIN\r\n334\r\n(.*?)\r\n(?:.*?)Authentication successful(?:.*?)$")
});
static RE_SMTP_PLAIN_SINGLE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?:.*?)AUTH PLAIN (.*?)\s\*\r\n235(?:.*?)"));
static RE_SMTP_LOGIN: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)AUTH LOGIN\r\n334 VXNlcm5hbWU6\r\n(.*?)\r\n334 UGFzc3dvcmQ6\r\n(.*?)\r\n235(?:.*?)")
});
static RE_SMTP_CRAM_MD5: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)AUTH CRAM-MD5(?:\r\n)334\s(.*?)(?:\r\n)(.*?)(\r\n)235(?:.*?)")
});
static RE_TELNET: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)login:(?:.*?)(\w*?)\r\n(?:.*?)\r\nPassword:\s(.*?)\r\n(?:.*?)")
});
static RE_IMAP_PLAIN_SINGLE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?:.*?)(?:LOGIN|login)\s(.*?)\s(.*?)\r\n(?:.*?)"));
static RE_IMAP_PLAIN_SEPARATE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)(?:LOGIN|login)\r\n(?:.*?)\sVXNlcm5hbWU6\r\n(.*?)\r\n(?:.*?)\sUGFzc3dvcmQ6\r\n(.*?)\r\n(?:.*?)")
});
static RE_IMAP_PLAIN_AUTH: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)(?:AUTHENTICATE PLAIN|authenticate plain)\r\n(?:.*?)\r\n(.*?)\r\n(?:.*?)")
});
static RE_IMAP_CRAM_MD5: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?:.*?)AUTHENTICATE CRAM-MD5\r\n(?:.*?)\s(.*?)\r\n(.*?)\r\n(?:.*?)")
});

// ---------------------------------------------------------------------------
// Harvesters
// ---------------------------------------------------------------------------

/// FTP `USER` / `PASS` exchange following a `220` greeting.
pub fn ftp(data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    let caps = RE_FTP.captures(data)?;
    Some(credential(
        ts,
        SERVICE_FTP,
        flow,
        text(&caps[1]),
        text(&caps[2]),
    ))
}

/// HTTP `Authorization` header, Basic or Digest.
///
/// Digest yields the parameter string as the user and an empty password,
/// which is what an offline cracker needs.
pub fn http(data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    let mut user = String::new();
    let mut password = String::new();

    if let Some(caps) = RE_HTTP_BASIC.captures(data) {
        let decoded = text(&decode_base64(&caps[1], SERVICE_HTTP_BASIC).unwrap_or_default());
        match decoded.split_once(':') {
            Some((u, p)) => {
                user = u.to_string();
                password = p.to_string();
            }
            None => user = decoded,
        }
    }

    if let Some(caps) = RE_HTTP_DIGEST.captures(data) {
        user = text(&caps[1]);
        password = String::new();
    }

    if user.len() > 1 {
        return Some(credential(ts, SERVICE_HTTP_BASIC, flow, user, password));
    }
    None
}

/// SMTP AUTH exchanges. The first matching scheme wins.
pub fn smtp(data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    let (service, (user, password)) = if let Some(caps) = RE_SMTP_PLAIN_SEPARATE.captures(data) {
        (SERVICE_SMTP_PLAIN, decode_sasl_plain(&caps[1]))
    } else if let Some(caps) = RE_SMTP_PLAIN_SINGLE.captures(data) {
        (SERVICE_SMTP_PLAIN, decode_sasl_plain(&caps[1]))
    } else if let Some(caps) = RE_SMTP_LOGIN.captures(data) {
        (SERVICE_SMTP_LOGIN, decode_login(&caps[1], &caps[2], SERVICE_SMTP_LOGIN))
    } else if let Some(caps) = RE_SMTP_CRAM_MD5.captures(data) {
        (SERVICE_SMTP_CRAM_MD5, decode_login(&caps[1], &caps[2], SERVICE_SMTP_CRAM_MD5))
    } else {
        return None;
    };

    if user.is_empty() && password.is_empty() {
        return None;
    }
    Some(credential(ts, service, flow, user, password))
}

/// Telnet login. The server echoes every typed character, so the captured
/// login contains each letter twice.
pub fn telnet(data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    let caps = RE_TELNET.captures(data)?;
    let user: String = text(&caps[1]).chars().step_by(2).collect();
    Some(credential(ts, SERVICE_TELNET, flow, user, text(&caps[2])))
}

/// IMAP logins. All schemes are checked and a later match replaces an
/// earlier one.
pub fn imap(data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    let mut found: Option<(&str, String, String)> = None;

    if let Some(caps) = RE_IMAP_PLAIN_SINGLE.captures(data) {
        found = Some((SERVICE_IMAP_PLAIN_SINGLE, text(&caps[1]), text(&caps[2])));
    }

    if let Some(caps) = RE_IMAP_PLAIN_SEPARATE.captures(data) {
        let user = decode_base64(&caps[1], SERVICE_IMAP_PLAIN_SEPARATE).unwrap_or_default();
        let pass = decode_base64(&caps[2], SERVICE_IMAP_PLAIN_SEPARATE).unwrap_or_default();
        found = Some((SERVICE_IMAP_PLAIN_SEPARATE, text(&user), text(&pass)));
    }

    if let Some(caps) = RE_IMAP_PLAIN_AUTH.captures(data) {
        let decoded = decode_base64(&caps[1], SERVICE_IMAP_LOGIN).unwrap_or_default();
        let [first, second, password] = split_sasl_fields(&decoded);
        found = Some((
            SERVICE_IMAP_LOGIN,
            format!("{} | {}", first, second),
            password,
        ));
    }

    if let Some(caps) = RE_IMAP_CRAM_MD5.captures(data) {
        // challenge and digest response
        let challenge = decode_base64(&caps[1], SERVICE_IMAP_CRAM_MD5).unwrap_or_default();
        let response = decode_base64(&caps[2], SERVICE_IMAP_CRAM_MD5).unwrap_or_default();
        found = Some((SERVICE_IMAP_CRAM_MD5, text(&challenge), text(&response)));
    }

    let (service, user, password) = found?;
    if user.is_empty() {
        return None;
    }
    Some(credential(ts, service, flow, user, password))
}

/// Harvester backed by a user supplied pattern. Every capture (the whole
/// match included) is recorded in the notes.
pub fn custom(re: &Regex, data: &[u8], flow: &str, ts: i64) -> Option<Credential> {
    if re.captures_len() < 2 {
        return None;
    }
    let caps = re.captures(data)?;
    let notes: String = caps
        .iter()
        .map(|m| format!(" {} ", m.map(|m| text(m.as_bytes())).unwrap_or_default()))
        .collect();

    Some(Credential {
        timestamp: ts,
        service: "Custom Regex".into(),
        flow: flow.to_string(),
        notes,
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn credential(ts: i64, service: &str, flow: &str, user: String, password: String) -> Credential {
    Credential {
        timestamp: ts,
        service: service.to_string(),
        flow: flow.to_string(),
        user,
        password,
        notes: String::new(),
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode a base64 field, logging failures.
fn decode_base64(input: &[u8], service: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim_ascii();
    match STANDARD.decode(trimmed) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(
                service,
                input = %String::from_utf8_lossy(trimmed),
                error = %e,
                "captured credentials but could not decode them"
            );
            None
        }
    }
}

/// SASL PLAIN as sent by SMTP clients: bytes before the first NUL are the
/// user, every non-NUL byte after it belongs to the password.
fn decode_sasl_plain(input: &[u8]) -> (String, String) {
    let Some(data) = decode_base64(input, SERVICE_SMTP_PLAIN) else {
        return (String::new(), String::new());
    };

    let mut user = Vec::new();
    let mut password = Vec::new();
    let mut nulled = false;
    for &b in &data {
        if b == 0 {
            nulled = true;
        } else if nulled {
            password.push(b);
        } else {
            user.push(b);
        }
    }
    (text(&user), text(&password))
}

/// Split a decoded SASL PLAIN message into its three NUL separated fields.
fn split_sasl_fields(data: &[u8]) -> [String; 3] {
    let mut fields: [Vec<u8>; 3] = Default::default();
    let mut step = 0;
    for &b in data {
        if b == 0 {
            step += 1;
        } else if step < 3 {
            fields[step].push(b);
        }
    }
    fields.map(|f| text(&f))
}

/// Two base64 fields (LOGIN user/password or CRAM-MD5 challenge/response).
/// An undecodable user discards both.
fn decode_login(user: &[u8], password: &[u8], service: &str) -> (String, String) {
    let Some(user) = decode_base64(user, service) else {
        return (String::new(), String::new());
    };
    let password = decode_base64(password, service).unwrap_or_default();
    (text(&user), text(&password))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
