//! # SSH Handshake Decoder
//!
//! Fingerprints both sides of an SSH handshake. For each direction the
//! decoder reads the identification line, locates the first binary packet,
//! parses it as `SSH_MSG_KEXINIT` and derives the HASSH digest.
//!
//! ## Wire Format
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! uint32    packet_length
//! byte      padding_length
//! byte      SSH_MSG_KEXINIT (20)
//! byte[16]  cookie
//! name-list kex_algorithms
//! name-list server_host_key_algorithms
//! name-list encryption_algorithms_client_to_server
//! name-list encryption_algorithms_server_to_client
//! name-list mac_algorithms_client_to_server
//! name-list mac_algorithms_server_to_client
//! name-list compression_algorithms_client_to_server
//! name-list compression_algorithms_server_to_client
//! name-list languages_client_to_server
//! name-list languages_server_to_client
//! boolean   first_kex_packet_follows
//! uint32    0 (reserved)
//! ```
//!
//! HASSH is `md5("kex;ciphers_c2s;macs_c2s;compression_c2s")` with every
//! list comma-joined. The same definition is used for the server side
//! (HASSHServer), so both records are comparable.
//!
//! At most `ssh_buffer_cap` bytes are buffered per direction.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::conversation::Conversation;
use crate::protocols::{
    md5_hex, ByteReader, DecoderContext, DecoderEntry, DecoderStats, Direction, StreamDecoder,
};
use crate::records::{AuditRecord, Software, SshRecord};
use crate::software::db::parse_hassh_candidate;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SSH_PREFIX: &[u8] = b"SSH-";

pub const SERVICE_SSH: &str = "SSH";

/// `SSH_MSG_KEXINIT`
const MSG_KEXINIT: u8 = 0x14;

const KEX_COOKIE_LEN: usize = 16;

static SSH_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(SSH-[0-9]\.?[0-9]?)-(.*[[:word:]]*)_([0-9]\.[0-9]?\.?[[:alnum:]]?[[:alnum:]]?)[[:space:]]?([[:alnum:]]*)",
    )
    .expect("static regex")
});

pub const ENTRY: DecoderEntry = DecoderEntry {
    name: "ssh",
    ports: &[22],
    probe: can_decode,
    factory: SshDecoder::factory,
};

/// Both sides open with an identification string.
pub fn can_decode(client: &[u8], server: &[u8]) -> bool {
    client.starts_with(SSH_PREFIX) && server.starts_with(SSH_PREFIX)
}

// ---------------------------------------------------------------------------
// Identification line
// ---------------------------------------------------------------------------

/// Fields of an identification line such as `SSH-2.0-OpenSSH_7.6p1 Ubuntu`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshIdent {
    pub ssh_version: String,
    pub product: String,
    pub version: String,
    pub os: String,
}

pub fn parse_ident(ident: &str) -> Option<SshIdent> {
    let c = SSH_IDENT.captures(ident)?;
    let group = |i: usize| c.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
    Some(SshIdent {
        ssh_version: group(1),
        product: group(2),
        version: group(3),
        os: group(4),
    })
}

/// The identification line and the offset of the first byte after its
/// CRLF. Without a CRLF the whole buffer is the line.
fn split_ident(data: &[u8]) -> (String, usize) {
    match data.windows(2).position(|w| w == b"\r\n") {
        Some(i) => (String::from_utf8_lossy(&data[..i]).trim().to_string(), i + 2),
        None => (String::from_utf8_lossy(data).trim().to_string(), data.len()),
    }
}

// ---------------------------------------------------------------------------
// KexInit location
// ---------------------------------------------------------------------------

/// Outcome of looking for the KexInit packet after the identification line.
#[derive(Debug, PartialEq, Eq)]
pub enum KexScan<'a> {
    /// Message payload, starting at the `SSH_MSG_KEXINIT` byte.
    Found(&'a [u8]),
    /// The packet header announces more bytes than were buffered.
    InsufficientData { needed: usize, available: usize },
    /// The first packet is not a KexInit.
    NotFound,
}

/// Bounds-checked view of the binary packet following the identification
/// line.
pub struct KexCursor<'a> {
    data: &'a [u8],
    start: usize,
}

impl<'a> KexCursor<'a> {
    pub fn new(data: &'a [u8], start: usize) -> Self {
        Self { data, start }
    }

    /// The marker must sit right after the 4-byte packet length and the
    /// 1-byte padding length.
    pub fn scan(&self) -> KexScan<'a> {
        let marker = self.start + 5;
        if self.data.len() <= marker {
            return KexScan::NotFound;
        }
        if self.data[marker] != MSG_KEXINIT {
            return KexScan::NotFound;
        }

        let header = &self.data[self.start..self.start + 4];
        let packet_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let padding = self.data[marker - 1] as usize;
        let Some(payload_len) = packet_len.checked_sub(padding + 1) else {
            return KexScan::NotFound;
        };

        let needed = marker + payload_len;
        if needed > self.data.len() {
            return KexScan::InsufficientData {
                needed,
                available: self.data.len(),
            };
        }
        KexScan::Found(&self.data[marker..needed])
    }
}

// ---------------------------------------------------------------------------
// KexInit message
// ---------------------------------------------------------------------------

/// Parsed `SSH_MSG_KEXINIT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KexInit {
    pub cookie: [u8; KEX_COOKIE_LEN],
    pub kex_algos: Vec<String>,
    pub server_host_key_algos: Vec<String>,
    pub ciphers_client_server: Vec<String>,
    pub ciphers_server_client: Vec<String>,
    pub macs_client_server: Vec<String>,
    pub macs_server_client: Vec<String>,
    pub compression_client_server: Vec<String>,
    pub compression_server_client: Vec<String>,
    pub languages_client_server: Vec<String>,
    pub languages_server_client: Vec<String>,
    pub first_kex_follows: bool,
}

fn name_list(r: &mut ByteReader<'_>) -> Option<Vec<String>> {
    let len = r.u32()?;
    let raw = r.take(usize::try_from(len).ok()?)?;
    if raw.is_empty() {
        return Some(Vec::new());
    }
    Some(
        String::from_utf8_lossy(raw)
            .split(',')
            .map(str::to_string)
            .collect(),
    )
}

impl KexInit {
    /// Parse a payload starting at the message type byte.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(payload);
        if r.u8()? != MSG_KEXINIT {
            return None;
        }
        let mut cookie = [0u8; KEX_COOKIE_LEN];
        cookie.copy_from_slice(r.take(KEX_COOKIE_LEN)?);

        Some(Self {
            cookie,
            kex_algos: name_list(&mut r)?,
            server_host_key_algos: name_list(&mut r)?,
            ciphers_client_server: name_list(&mut r)?,
            ciphers_server_client: name_list(&mut r)?,
            macs_client_server: name_list(&mut r)?,
            macs_server_client: name_list(&mut r)?,
            compression_client_server: name_list(&mut r)?,
            compression_server_client: name_list(&mut r)?,
            languages_client_server: name_list(&mut r)?,
            languages_server_client: name_list(&mut r)?,
            first_kex_follows: r.u8().is_some_and(|b| b != 0),
        })
    }

    /// `kex;ciphers;macs;compression`, client to server lists.
    pub fn hassh_algorithms(&self) -> String {
        [
            &self.kex_algos,
            &self.ciphers_client_server,
            &self.macs_client_server,
            &self.compression_client_server,
        ]
        .iter()
        .map(|list| list.join(","))
        .collect::<Vec<_>>()
        .join(";")
    }

    /// `(hassh, algorithms)`
    pub fn hassh(&self) -> (String, String) {
        let raw = self.hassh_algorithms();
        (md5_hex(&raw), raw)
    }
}

// ---------------------------------------------------------------------------
// SshDecoder
// ---------------------------------------------------------------------------

pub struct SshDecoder {
    conv: Conversation,
    ctx: DecoderContext,
    ident: String,
}

impl SshDecoder {
    pub fn new(conv: Conversation, ctx: DecoderContext) -> Self {
        let ident = conv.ident();
        Self { conv, ctx, ident }
    }

    fn factory(conv: Conversation, ctx: &DecoderContext) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(conv, ctx.clone()))
    }

    fn ident_software(&self, ident: &str, entity: &str) -> Option<Software> {
        let parsed = parse_ident(ident)?;
        Some(Software {
            timestamp: self.conv.client_first_seen,
            product: parsed.product,
            version: parsed.version,
            service: SERVICE_SSH.into(),
            source_name: format!("SSH {} Ident", entity),
            source_data: ident.to_string(),
            flows: vec![self.ident.clone()],
            notes: format!("SSH version: {} OS: {}", parsed.ssh_version, parsed.os),
            ..Default::default()
        })
    }

    fn hassh_software(&self, hassh: &str) -> Vec<Option<Software>> {
        self.ctx
            .databases
            .hassh
            .lookup(hassh)
            .iter()
            .map(|entry| {
                let c = parse_hassh_candidate(&entry.name);
                Some(Software {
                    timestamp: self.conv.client_first_seen,
                    product: c.product,
                    version: c.version,
                    service: SERVICE_SSH.into(),
                    source_name: "HASSH Lookup".into(),
                    source_data: hassh.to_string(),
                    flows: vec![self.ident.clone()],
                    notes: format!(
                        "Likelihood: {} Possible OS: {} SSH Version: {}",
                        entry.likelihood, c.os, c.ssh_version
                    ),
                    ..Default::default()
                })
            })
            .collect()
    }

    /// Fingerprint one direction, returning the software it revealed.
    fn process_direction(&self, direction: Direction) -> Vec<Option<Software>> {
        let data = self
            .conv
            .stream_capped(direction, self.ctx.config.ssh_buffer_cap);
        if data.is_empty() {
            return Vec::new();
        }

        let is_client = direction == Direction::Originator;
        let entity = if is_client { "client" } else { "server" };
        let (ident, offset) = split_ident(&data);
        let mut software = vec![self.ident_software(&ident, entity)];

        let payload = match KexCursor::new(&data, offset).scan() {
            KexScan::Found(payload) => payload,
            KexScan::InsufficientData { needed, available } => {
                DecoderStats::incr(&self.ctx.stats.ssh_insufficient_data);
                debug!(flow = %self.ident, entity, needed, available, "KexInit exceeds buffered data");
                return software;
            }
            KexScan::NotFound => {
                debug!(flow = %self.ident, entity, "no KexInit after ident");
                return software;
            }
        };
        let Some(init) = KexInit::parse(payload) else {
            debug!(flow = %self.ident, entity, "malformed KexInit");
            return software;
        };
        DecoderStats::incr(&self.ctx.stats.ssh_kex_found);

        let (hassh, algorithms) = init.hassh();
        debug!(flow = %self.ident, entity, hassh = %hassh, "found KexInit");

        let (timestamp, flow) = if is_client {
            (self.conv.client_first_seen, self.ident.clone())
        } else {
            (self.conv.server_first_seen, self.conv.flow.reversed().to_string())
        };
        self.ctx.emit(AuditRecord::Ssh(SshRecord {
            timestamp,
            hassh: hassh.clone(),
            flow,
            ident,
            algorithms,
            is_client,
        }));

        software.extend(self.hassh_software(&hassh));
        software
    }
}

impl StreamDecoder for SshDecoder {
    fn decode(self: Box<Self>) {
        let mut software = self.process_direction(Direction::Originator);
        software.extend(self.process_direction(Direction::Responder));
        self.ctx.software
            .write_software(software, |existing| existing.add_flow(&self.ident));
    }

    fn protocol_id(&self) -> &'static str {
        "ssh"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
