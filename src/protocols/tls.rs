//! # TLS Handshake Decoder
//!
//! Parses the ClientHello and ServerHello that open a TLS conversation and
//! computes their fingerprints.
//!
//! ## Output
//!
//! | Field    | Source                                                    |
//! |----------|-----------------------------------------------------------|
//! | `server_name` | SNI extension of the ClientHello                     |
//! | `ja3`    | MD5 of `version,ciphers,extensions,curves,point_formats`  |
//! | `ja3s`   | MD5 of `version,cipher,extensions` from the ServerHello   |
//! | software | JA3/JA3S combination database, both digests required     |
//!
//! GREASE values (RFC 8701) never enter a fingerprint.
//!
//! ## Wire Format Reference
//!
//! ```text
//! TLS Record:
//!   Content Type (1 byte): 22 = Handshake
//!   Version (2 bytes)
//!   Length (2 bytes)
//!
//! Handshake:
//!   Type (1 byte): 1 = ClientHello, 2 = ServerHello
//!   Length (3 bytes)
//!   ...
//! ```

use tracing::debug;

use crate::conversation::Conversation;
use crate::protocols::{
    md5_hex, ByteReader, DecoderContext, DecoderEntry, DecoderStats, Direction, StreamDecoder,
};
use crate::records::{AuditRecord, Software, TlsRecord};
use crate::software::http::parse_server_name;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// TLS content type for Handshake messages.
const TLS_HANDSHAKE: u8 = 22;

/// Handshake type: ClientHello.
const CLIENT_HELLO: u8 = 1;

/// Handshake type: ServerHello.
const SERVER_HELLO: u8 = 2;

const TLS_RECORD_HEADER_LEN: usize = 5;

const HELLO_RANDOM_LEN: usize = 32;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
const EXT_EC_POINT_FORMATS: u16 = 0x000B;

pub const SERVICE_TLS: &str = "TLS";

pub const ENTRY: DecoderEntry = DecoderEntry {
    name: "tls",
    ports: &[443],
    probe: can_decode,
    factory: TlsDecoder::factory,
};

/// The client opens with a ClientHello record and the server answers with
/// a handshake record.
pub fn can_decode(client: &[u8], server: &[u8]) -> bool {
    client.len() > TLS_RECORD_HEADER_LEN
        && client[0] == TLS_HANDSHAKE
        && client[TLS_RECORD_HEADER_LEN] == CLIENT_HELLO
        && server.first() == Some(&TLS_HANDSHAKE)
}

// ---------------------------------------------------------------------------
// GREASE values (RFC 8701)
// ---------------------------------------------------------------------------

/// Randomly injected by clients; excluded from fingerprints.
const GREASE_VALUES: [u16; 16] = [
    0x0A0A, 0x1A1A, 0x2A2A, 0x3A3A, 0x4A4A, 0x5A5A, 0x6A6A, 0x7A7A, 0x8A8A, 0x9A9A, 0xAAAA,
    0xBABA, 0xCACA, 0xDADA, 0xEAEA, 0xFAFA,
];

fn is_grease(val: u16) -> bool {
    GREASE_VALUES.contains(&val)
}

// ---------------------------------------------------------------------------
// Hello messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub server_name: String,
    pub ja3: String,
    pub ja3_raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub cipher: u16,
    pub ja3s: String,
    pub ja3s_raw: String,
}

/// Body of the first handshake message of type `kind` at the start of
/// `stream`, cut at the end of its record.
fn handshake_body(stream: &[u8], kind: u8) -> Option<&[u8]> {
    let mut r = ByteReader::new(stream);
    if r.u8()? != TLS_HANDSHAKE {
        return None;
    }
    r.skip(2)?; // record version
    let record_len = r.u16()?;
    let mut record = ByteReader::new(r.take_upto(usize::from(record_len)));
    if record.u8()? != kind {
        return None;
    }
    record.skip(3)?; // handshake length
    Some(record.rest())
}

/// Version, random and session id: the common prefix of both hellos.
fn hello_version(r: &mut ByteReader<'_>) -> Option<u16> {
    let version = r.u16()?;
    r.skip(HELLO_RANDOM_LEN)?;
    let session_id_len = r.u8()?;
    r.skip(usize::from(session_id_len))?;
    Some(version)
}

/// `(type, data)` of every extension. A truncated block yields the
/// extensions read so far.
fn extensions<'a>(r: &mut ByteReader<'a>) -> Vec<(u16, &'a [u8])> {
    let Some(total) = r.u16() else {
        return Vec::new();
    };
    let mut block = ByteReader::new(r.take_upto(usize::from(total)));

    let mut out = Vec::new();
    while let (Some(ext_type), Some(len)) = (block.u16(), block.u16()) {
        out.push((ext_type, block.take_upto(usize::from(len))));
    }
    out
}

/// Big-endian u16 values of `data`, GREASE removed. A trailing odd byte
/// is ignored.
fn u16_values(data: &[u8]) -> Vec<u16> {
    let mut r = ByteReader::new(data);
    std::iter::from_fn(|| r.u16()).filter(|v| !is_grease(*v)).collect()
}

/// Parse a ClientHello body and compute JA3.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHello> {
    let mut r = ByteReader::new(payload);
    let version = hello_version(&mut r)?;

    let suites_len = r.u16()?;
    let cipher_suites = u16_values(r.take(usize::from(suites_len))?);

    let compression_len = r.u8()?;
    r.take_upto(usize::from(compression_len));

    let mut ext_types = Vec::new();
    let mut elliptic_curves = Vec::new();
    let mut ec_point_formats = Vec::new();
    let mut server_name = String::new();

    for (ext_type, data) in extensions(&mut r) {
        if !is_grease(ext_type) {
            ext_types.push(ext_type);
        }
        match ext_type {
            EXT_SERVER_NAME => server_name = parse_sni(data),
            EXT_SUPPORTED_GROUPS => elliptic_curves = parse_u16_list(data),
            EXT_EC_POINT_FORMATS => ec_point_formats = parse_u8_list(data),
            _ => {}
        }
    }

    let ja3_raw = format!(
        "{},{},{},{},{}",
        version,
        join_u16(&cipher_suites),
        join_u16(&ext_types),
        join_u16(&elliptic_curves),
        join_u8(&ec_point_formats),
    );

    Some(ClientHello {
        version,
        server_name,
        ja3: md5_hex(&ja3_raw),
        ja3_raw,
    })
}

/// Parse a ServerHello body and compute JA3S.
pub fn parse_server_hello(payload: &[u8]) -> Option<ServerHello> {
    let mut r = ByteReader::new(payload);
    let version = hello_version(&mut r)?;
    let cipher = r.u16()?;
    r.skip(1)?; // compression method

    let ext_types: Vec<u16> = extensions(&mut r)
        .into_iter()
        .map(|(ext_type, _)| ext_type)
        .filter(|t| !is_grease(*t))
        .collect();

    let ja3s_raw = format!("{},{},{}", version, cipher, join_u16(&ext_types));

    Some(ServerHello {
        version,
        cipher,
        ja3s: md5_hex(&ja3s_raw),
        ja3s_raw,
    })
}

/// Host name from the SNI extension data: list length, name type
/// (0 = host_name), name length, name.
fn parse_sni(data: &[u8]) -> String {
    let mut r = ByteReader::new(data);
    let host = r
        .skip(2)
        .and_then(|_| r.u8())
        .filter(|&name_type| name_type == 0)
        .and_then(|_| r.u16())
        .and_then(|len| r.take(usize::from(len)));
    host.map(|h| String::from_utf8_lossy(h).into_owned())
        .unwrap_or_default()
}

/// u16 list with a 2-byte length prefix, GREASE removed.
fn parse_u16_list(data: &[u8]) -> Vec<u16> {
    let mut r = ByteReader::new(data);
    match r.u16() {
        Some(len) => u16_values(r.take_upto(usize::from(len))),
        None => Vec::new(),
    }
}

/// u8 list with a 1-byte length prefix.
fn parse_u8_list(data: &[u8]) -> Vec<u8> {
    let mut r = ByteReader::new(data);
    match r.u8() {
        Some(len) => r.take_upto(usize::from(len)).to_vec(),
        None => Vec::new(),
    }
}

fn version_to_string(version: u16) -> String {
    match version {
        0x0300 => "SSLv3".to_string(),
        0x0301 => "TLSv1.0".to_string(),
        0x0302 => "TLSv1.1".to_string(),
        0x0303 => "TLSv1.2".to_string(),
        0x0304 => "TLSv1.3".to_string(),
        v => format!("0x{:04X}", v),
    }
}

fn join_u16(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

fn join_u8(values: &[u8]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// TlsDecoder
// ---------------------------------------------------------------------------

pub struct TlsDecoder {
    conv: Conversation,
    ctx: DecoderContext,
    ident: String,
}

impl TlsDecoder {
    pub fn new(conv: Conversation, ctx: DecoderContext) -> Self {
        let ident = conv.ident();
        Self { conv, ctx, ident }
    }

    fn factory(conv: Conversation, ctx: &DecoderContext) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(conv, ctx.clone()))
    }

    /// Server and client software for every known JA3/JA3S combination.
    fn ja3_software(&self, ja3: &str, ja3s: &str) -> Vec<Option<Software>> {
        let base = Software {
            timestamp: self.conv.client_first_seen,
            service: SERVICE_TLS.into(),
            flows: vec![self.ident.clone()],
            ..Default::default()
        };

        let mut out = Vec::new();
        for hit in self.ctx.databases.ja3.lookup(ja3, ja3s) {
            let (product, version, os) = parse_server_name(&hit.server.server);
            out.push(Some(Software {
                product,
                version,
                vendor: os,
                source_name: "JA3s".into(),
                source_data: ja3s.to_string(),
                ..base.clone()
            }));
            out.push(Some(Software {
                product: hit.process.process.clone(),
                vendor: format!("{}({})", hit.client.os, hit.client.arch),
                source_name: "JA3".into(),
                source_data: ja3.to_string(),
                ..base.clone()
            }));
        }
        out
    }
}

impl StreamDecoder for TlsDecoder {
    fn decode(self: Box<Self>) {
        let client = self.conv.first_chunk(Direction::Originator);
        let server = self.conv.first_chunk(Direction::Responder);

        let Some(hello) = handshake_body(client, CLIENT_HELLO).and_then(parse_client_hello) else {
            debug!(flow = %self.ident, "no parsable ClientHello");
            return;
        };
        let server_hello = handshake_body(server, SERVER_HELLO).and_then(parse_server_hello);
        if server_hello.is_none() {
            debug!(flow = %self.ident, "no parsable ServerHello");
        }
        DecoderStats::incr(&self.ctx.stats.tls_handshakes);

        let server_hello = server_hello.unwrap_or_default();
        let version = if server_hello.version != 0 {
            server_hello.version
        } else {
            hello.version
        };
        let flow = &self.conv.flow;
        let record = TlsRecord {
            timestamp: self.conv.client_first_seen,
            flow: self.ident.clone(),
            src_ip: flow.src_ip.clone(),
            dst_ip: flow.dst_ip.clone(),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            version: version_to_string(version),
            cipher: if server_hello.ja3s.is_empty() {
                String::new()
            } else {
                format!("0x{:04X}", server_hello.cipher)
            },
            server_name: hello.server_name,
            ja3: hello.ja3,
            ja3_raw: hello.ja3_raw,
            ja3s: server_hello.ja3s,
            ja3s_raw: server_hello.ja3s_raw,
        };
        debug!(flow = %self.ident, ja3 = %record.ja3, ja3s = %record.ja3s, sni = %record.server_name, "TLS handshake");

        let software = self.ja3_software(&record.ja3, &record.ja3s);
        self.ctx.emit(AuditRecord::Tls(record));
        if !software.is_empty() {
            let ident = self.ident.as_str();
            self.ctx
                .software
                .write_software(software, |existing| existing.add_flow(ident));
        }
    }

    fn protocol_id(&self) -> &'static str {
        "tls"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
