//! # HTTP/1.x Stream Decoder
//!
//! Walks the turns of a conversation in arrival order, parses the requests
//! of each client turn and the responses of each server turn, pairs them
//! FIFO and writes one [`HttpRecord`] per exchange.
//!
//! - Heads are parsed with `httparse`; bodies are framed by
//!   `Content-Length`, chunked transfer encoding, or (responses only) the
//!   end of the turn.
//! - A malformed fragment is counted and skipped. Parsing resumes at the
//!   next line that opens a message head, or with the next turn.
//! - A response without a pending request is counted and dropped.
//! - Requests left over once the server stream is exhausted are written as
//!   unanswered records (`status_code == 0`).
//! - Login form parameters and `Authorization: Basic` headers become
//!   credentials; every record is fed to the HTTP software producers.
//!
//! ## Limitations
//!
//! - HTTP/2 and HTTP/3 are not decoded.
//! - Bodies are framed but not decompressed.
//! - A truncated body is used as far as it goes.

use std::collections::{BTreeMap, VecDeque};

use aho_corasick::AhoCorasick;
use base64::Engine as _;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::conversation::Conversation;
use crate::protocols::{DecoderContext, DecoderEntry, DecoderStats, Direction, StreamDecoder};
use crate::records::{AuditRecord, Credential, HttpCookie, HttpRecord};
use crate::software::http::identify_http;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on parsed header lines per message.
const MAX_HEADERS: usize = 96;

const METHODS: [&str; 9] = [
    "CONNECT", "DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT", "TRACE",
];

static METHOD_MATCHER: Lazy<AhoCorasick> =
    Lazy::new(|| AhoCorasick::new(METHODS).expect("static patterns"));

pub const ENTRY: DecoderEntry = DecoderEntry {
    name: "http",
    ports: &[80],
    probe: can_decode,
    factory: HttpDecoder::factory,
};

/// The server speaks first-line `HTTP` and the client sent a method name.
pub fn can_decode(client: &[u8], server: &[u8]) -> bool {
    server.windows(4).any(|w| w == b"HTTP") && METHOD_MATCHER.is_match(client)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Header lines in arrival order, names in canonical form.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    fn from_parsed(raw: &[httparse::Header<'_>]) -> Self {
        Headers(
            raw.iter()
                .map(|h| {
                    (
                        canonical_header_key(h.name),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect(),
        )
    }

    /// First value of `name`, empty if absent.
    pub fn get(&self, name: &str) -> &str {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Repeated headers are joined with a space.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in &self.0 {
            map.entry(k.clone())
                .and_modify(|existing| {
                    existing.push(' ');
                    existing.push_str(v);
                })
                .or_insert_with(|| v.clone());
        }
        map
    }

    fn is_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Option<usize> {
        let v = self.get("Content-Length");
        if v.is_empty() {
            return None;
        }
        v.parse().ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Headers,
    /// Declared length, `-1` when chunked.
    pub content_length: i64,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub version: u8,
    pub status: u16,
    pub headers: Headers,
    /// Declared length, or the body size when undeclared.
    pub content_length: i64,
    pub body: Vec<u8>,
}

/// Result of parsing one message off the front of a buffer.
#[derive(Debug)]
pub enum ParseOutcome<T> {
    /// The message and the number of bytes it occupied.
    Complete(T, usize),
    /// The head is cut off by the end of the stream.
    Incomplete,
    Invalid(httparse::Error),
}

enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Parse one request from the front of `buf`.
pub fn parse_request(buf: &[u8]) -> ParseOutcome<HttpRequest> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Incomplete,
        Err(e) => return ParseOutcome::Invalid(e),
    };

    let headers = Headers::from_parsed(req.headers);
    let (framing, content_length) = if headers.is_chunked() {
        (BodyFraming::Chunked, -1)
    } else {
        match headers.content_length() {
            Some(n) => (BodyFraming::Length(n), clamp_len(n)),
            None => (BodyFraming::Empty, 0),
        }
    };
    let (body, body_len) = read_body(&buf[head_len..], framing);

    ParseOutcome::Complete(
        HttpRequest {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers,
            content_length,
            body,
        },
        head_len + body_len,
    )
}

/// Parse one response from the front of `buf`. Responses to `HEAD` never
/// carry a body.
pub fn parse_response(buf: &[u8], head_request: bool) -> ParseOutcome<HttpResponse> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut raw);
    let head_len = match res.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Incomplete,
        Err(e) => return ParseOutcome::Invalid(e),
    };

    let status = res.code.unwrap_or_default();
    let headers = Headers::from_parsed(res.headers);
    let bodiless = head_request || (100..200).contains(&status) || status == 204 || status == 304;
    let declared = headers.content_length();
    let framing = if bodiless {
        BodyFraming::Empty
    } else if headers.is_chunked() {
        BodyFraming::Chunked
    } else {
        match declared {
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilClose,
        }
    };
    let (body, body_len) = read_body(&buf[head_len..], framing);
    let content_length = match (bodiless, declared) {
        (false, Some(n)) if !headers.is_chunked() => clamp_len(n),
        _ => clamp_len(body.len()),
    };

    ParseOutcome::Complete(
        HttpResponse {
            version: res.version.unwrap_or(1),
            status,
            headers,
            content_length,
            body,
        },
        head_len + body_len,
    )
}

fn clamp_len(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Offset of the first line after `from` that opens a request head
/// (`request`) or a response head.
fn next_message_start(buf: &[u8], from: usize, request: bool) -> Option<usize> {
    let mut pos = from;
    while let Some(nl) = buf.get(pos..)?.iter().position(|&b| b == b'\n') {
        pos += nl + 1;
        let line = &buf[pos..];
        let opens = if request {
            METHODS
                .iter()
                .any(|m| line.starts_with(m.as_bytes()) && line.get(m.len()) == Some(&b' '))
        } else {
            line.starts_with(b"HTTP/")
        };
        if opens {
            return Some(pos);
        }
    }
    None
}

/// Body bytes and the number of bytes consumed from `buf`.
fn read_body(buf: &[u8], framing: BodyFraming) -> (Vec<u8>, usize) {
    match framing {
        BodyFraming::Empty => (Vec::new(), 0),
        BodyFraming::Length(n) => {
            let take = n.min(buf.len());
            if take < n {
                debug!(declared = n, available = buf.len(), "truncated HTTP body");
            }
            (buf[..take].to_vec(), take)
        }
        BodyFraming::UntilClose => (buf.to_vec(), buf.len()),
        BodyFraming::Chunked => read_chunked(buf),
    }
}

fn read_chunked(buf: &[u8]) -> (Vec<u8>, usize) {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(v)) => v,
            _ => {
                debug!(read = body.len(), "unterminated chunked HTTP body");
                return (body, buf.len());
            }
        };
        pos += size_len;

        if size == 0 {
            return (body, pos + trailer_len(&buf[pos..]));
        }

        let size = usize::try_from(size).unwrap_or(usize::MAX);
        let end = pos.saturating_add(size).min(buf.len());
        body.extend_from_slice(&buf[pos..end]);
        if end - pos < size {
            debug!(read = body.len(), "truncated HTTP chunk");
            return (body, buf.len());
        }
        pos = end;
        if buf[pos..].starts_with(b"\r\n") {
            pos += 2;
        }
    }
}

/// Length of the trailer section following the last chunk.
fn trailer_len(buf: &[u8]) -> usize {
    if buf.starts_with(b"\r\n") {
        return 2;
    }
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(buf.len())
}

/// `content-type` becomes `Content-Type`.
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

/// Query parameters plus urlencoded form body, values in arrival order.
fn form_values(req: &HttpRequest) -> BTreeMap<String, Vec<String>> {
    let mut form: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut add = |input: &[u8]| {
        for (k, v) in url::form_urlencoded::parse(input) {
            if k.trim().is_empty() {
                continue;
            }
            form.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    };

    if let Some((_, query)) = req.target.split_once('?') {
        add(query.as_bytes());
    }
    let has_form_body = matches!(req.method.as_str(), "POST" | "PUT" | "PATCH")
        && req
            .headers
            .get("Content-Type")
            .to_ascii_lowercase()
            .starts_with("application/x-www-form-urlencoded");
    if has_form_body {
        add(&req.body);
    }
    form
}

fn request_cookies(headers: &Headers) -> Vec<HttpCookie> {
    headers
        .get_all("Cookie")
        .flat_map(|line| line.split(';'))
        .filter_map(cookie_pair)
        .collect()
}

fn response_cookies(headers: &Headers) -> Vec<HttpCookie> {
    headers
        .get_all("Set-Cookie")
        .filter_map(|line| line.split(';').next())
        .filter_map(cookie_pair)
        .collect()
}

fn cookie_pair(raw: &str) -> Option<HttpCookie> {
    let (name, value) = raw.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(HttpCookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
    })
}

/// `(user, password)` from an `Authorization: Basic` header.
pub fn basic_auth(headers: &Headers) -> Option<(String, String)> {
    let value = headers.get("Authorization");
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "invalid basic auth encoding");
            return None;
        }
    };
    let decoded = String::from_utf8_lossy(&decoded);
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn build_record(conv: &Conversation, req: &HttpRequest, res: Option<&HttpResponse>) -> HttpRecord {
    let flow = &conv.flow;
    let mut record = HttpRecord {
        timestamp: if res.is_some() {
            conv.server_first_seen
        } else {
            conv.client_first_seen
        },
        proto: format!("HTTP/1.{}", req.version),
        method: req.method.clone(),
        host: req.headers.get("Host").to_string(),
        req_content_length: req.content_length,
        req_content_type: req.headers.get("Content-Type").to_string(),
        user_agent: req.headers.get("User-Agent").to_string(),
        referer: req.headers.get("Referer").to_string(),
        url: req.target.clone(),
        src_ip: flow.src_ip.clone(),
        dst_ip: flow.dst_ip.clone(),
        src_port: flow.src_port,
        dst_port: flow.dst_port,
        req_cookies: request_cookies(&req.headers),
        parameters: form_values(req)
            .into_iter()
            .map(|(k, v)| (k, v.join(" ")))
            .collect(),
        request_headers: req.headers.to_map(),
        ..Default::default()
    };

    if let Some(res) = res {
        record.status_code = res.status;
        record.res_content_length = res.content_length;
        record.res_content_type = res.headers.get("Content-Type").to_string();
        record.server_name = res.headers.get("Server").to_string();
        record.res_cookies = response_cookies(&res.headers);
        record.response_headers = res.headers.to_map();
    }
    record
}

// ---------------------------------------------------------------------------
// HttpDecoder
// ---------------------------------------------------------------------------

pub struct HttpDecoder {
    conv: Conversation,
    ctx: DecoderContext,
    ident: String,
}

impl HttpDecoder {
    pub fn new(conv: Conversation, ctx: DecoderContext) -> Self {
        let ident = conv.ident();
        Self { conv, ctx, ident }
    }

    fn factory(conv: Conversation, ctx: &DecoderContext) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(conv, ctx.clone()))
    }

    fn read_requests(&self, buf: &[u8], pending: &mut VecDeque<HttpRequest>) {
        let mut pos = 0;
        while pos < buf.len() {
            match parse_request(&buf[pos..]) {
                ParseOutcome::Complete(req, used) => {
                    debug!(flow = %self.ident, method = %req.method, url = %req.target, "HTTP request");
                    DecoderStats::incr(&self.ctx.stats.http_requests);
                    pending.push_back(req);
                    pos += used;
                }
                ParseOutcome::Incomplete => {
                    debug!(flow = %self.ident, left = buf.len() - pos, "truncated HTTP request");
                    break;
                }
                ParseOutcome::Invalid(e) => {
                    DecoderStats::incr(&self.ctx.stats.http_malformed);
                    debug!(flow = %self.ident, error = %e, "skipping malformed HTTP request");
                    match next_message_start(buf, pos, true) {
                        Some(next) => pos = next,
                        None => break,
                    }
                }
            }
        }
    }

    fn read_responses(&self, buf: &[u8], pending: &mut VecDeque<HttpRequest>) {
        let mut pos = 0;
        while pos < buf.len() {
            let head_request = pending.front().is_some_and(|r| r.method == "HEAD");
            match parse_response(&buf[pos..], head_request) {
                ParseOutcome::Complete(res, used) => {
                    pos += used;
                    DecoderStats::incr(&self.ctx.stats.http_responses);
                    debug!(flow = %self.ident, status = res.status, length = res.content_length, "HTTP response");

                    match pending.pop_front() {
                        Some(req) => self.write_exchange(&req, Some(&res)),
                        None => {
                            DecoderStats::incr(&self.ctx.stats.http_unmatched_responses);
                            debug!(flow = %self.ident, status = res.status, "response without request");
                        }
                    }
                }
                ParseOutcome::Incomplete => {
                    debug!(flow = %self.ident, left = buf.len() - pos, "truncated HTTP response");
                    break;
                }
                ParseOutcome::Invalid(e) => {
                    DecoderStats::incr(&self.ctx.stats.http_malformed);
                    debug!(flow = %self.ident, error = %e, "skipping malformed HTTP response");
                    match next_message_start(buf, pos, false) {
                        Some(next) => pos = next,
                        None => break,
                    }
                }
            }
        }
    }

    fn search_for_login_params(&self, req: &HttpRequest) {
        let form = form_values(req);
        let password = form
            .get("pass")
            .or_else(|| form.get("password"))
            .map(|v| v.join("; "))
            .unwrap_or_default();

        for (name, values) in &form {
            if name != "user" && name != "username" {
                continue;
            }
            self.ctx.credentials.write(Credential {
                timestamp: self.conv.client_first_seen,
                service: "HTTP".into(),
                flow: self.ident.clone(),
                user: values.join("; "),
                password: password.clone(),
                notes: "Login Parameters".into(),
            });
        }
    }

    fn search_for_basic_auth(&self, req: &HttpRequest) {
        let Some((user, password)) = basic_auth(&req.headers) else {
            return;
        };
        if user.is_empty() && password.is_empty() {
            return;
        }
        self.ctx.credentials.write(Credential {
            timestamp: self.conv.client_first_seen,
            service: "HTTP Basic Auth".into(),
            flow: self.ident.clone(),
            user,
            password,
            notes: req.target.clone(),
        });
    }

    fn write_exchange(&self, req: &HttpRequest, res: Option<&HttpResponse>) {
        if self.ctx.config.credentials_enabled {
            self.search_for_login_params(req);
            self.search_for_basic_auth(req);
        }

        let record = build_record(&self.conv, req, res);
        let software = identify_http(&record, &self.ident, &self.ctx.databases, &self.ctx.config);
        self.ctx.emit(AuditRecord::Http(record));

        if !software.is_empty() {
            let ident = self.ident.as_str();
            self.ctx
                .software
                .write_software(software, |existing| existing.add_flow(ident));
        }
    }
}

impl StreamDecoder for HttpDecoder {
    fn decode(self: Box<Self>) {
        let mut pending = VecDeque::new();
        for turn in self.conv.turns() {
            match turn.direction {
                Direction::Originator => self.read_requests(&turn.data, &mut pending),
                Direction::Responder => self.read_responses(&turn.data, &mut pending),
            }
        }

        for req in &pending {
            DecoderStats::incr(&self.ctx.stats.http_unanswered_requests);
            self.write_exchange(req, None);
        }
    }

    fn protocol_id(&self) -> &'static str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
