//! # Service Probe Matching
//!
//! Identifies server software from the first bytes a TCP service sends,
//! using `match` directives in the nmap `nmap-service-probes` format:
//!
//! ```text
//! match ftp m|^220 ProFTPD (\d\S+) Server| p/ProFTPD/ v/$1/ cpe:/a:proftpd:proftpd:$1/
//! match ssh m/^SSH-([\d.]+)-OpenSSH_([\w._-]+)\r?\n/i p/OpenSSH/ v/$2/ i/protocol $1/
//! ```
//!
//! | Field   | Meaning                                  |
//! |---------|------------------------------------------|
//! | `m`     | pattern, any delimiter, flags `i` / `s`  |
//! | `p`     | product                                  |
//! | `v`     | version                                  |
//! | `i`     | extra info                               |
//! | `h`     | hostname                                 |
//! | `o`     | operating system                         |
//! | `d`     | device type                              |
//! | `cpe:/` | CPE name, the vendor is taken from it    |
//!
//! Templates may reference capture groups as `$1` or `$P(1)` (printable
//! characters only). Patterns the `regex` crate cannot compile (back
//! references, lookaround) are skipped at load time. Other directives
//! (`Probe`, `softmatch`, `ports`, ...) are ignored.
//!
//! ## Search order
//!
//! 1. The category expected for the destination port, if any.
//! 2. Every other category, in name order, unless a match was already
//!    found and `stop_after_service_probe_match` is set.
//!
//! With `stop_after_service_category_miss`, a miss in the expected category
//! ends the search.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use tracing::debug;

use super::db::{read_db_file, with_path, DatabaseError};
use crate::config::StreamConfig;
use crate::records::Software;

pub const SOURCE_SERVICE_PROBE: &str = "Service Probe Match";

static GROUP_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$P\(([0-9])\)|\$([0-9])").expect("static regex"));

/// nmap probe category expected behind a well-known TCP port.
pub fn category_for_port(port: u16) -> Option<&'static str> {
    let category = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 587 => "smtp",
        80 | 8000 | 8080 => "http",
        110 => "pop3",
        119 => "nntp",
        143 => "imap",
        389 => "ldap",
        3306 => "mysql",
        5432 => "postgresql",
        6379 => "redis",
        _ => return None,
    };
    Some(category)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ServiceProbe {
    /// Category plus a running number, e.g. `ftp-3`.
    pub ident: String,
    pub regex: Regex,
    pub product: String,
    pub version: String,
    pub vendor: String,
    pub info: String,
    pub hostname: String,
    pub os: String,
    pub device_type: String,
}

/// A probe hit with its templates filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMatch {
    pub ident: String,
    pub category: String,
    pub product: String,
    pub version: String,
    pub vendor: String,
    pub info: String,
    pub hostname: String,
    pub os: String,
    pub device_type: String,
}

/// Match directives grouped by category.
#[derive(Debug, Default)]
pub struct ServiceProbeDatabase {
    categories: BTreeMap<String, Vec<ServiceProbe>>,
    skipped: usize,
}

impl ServiceProbeDatabase {
    pub fn parse(text: &str) -> Result<Self, DatabaseError> {
        let mut db = Self::default();

        for (n, line) in text.lines().enumerate() {
            let line = line.trim_end();
            let Some(rest) = line.strip_prefix("match ") else {
                continue;
            };
            let (category, rest) = rest
                .trim_start()
                .split_once(' ')
                .ok_or_else(|| DatabaseError::ParseError(format!("line {}: missing pattern", n + 1)))?;
            let directive = parse_directive(rest)
                .map_err(|msg| DatabaseError::ParseError(format!("line {}: {}", n + 1, msg)))?;

            let regex = match Regex::new(&directive.pattern) {
                Ok(re) => re,
                Err(e) => {
                    debug!(category, line = n + 1, error = %e, "skipping service probe");
                    db.skipped += 1;
                    continue;
                }
            };

            let probes = db.categories.entry(category.to_string()).or_default();
            probes.push(ServiceProbe {
                ident: format!("{}-{}", category, probes.len() + 1),
                regex,
                product: directive.product,
                version: directive.version,
                vendor: directive.vendor,
                info: directive.info,
                hostname: directive.hostname,
                os: directive.os,
                device_type: directive.device_type,
            });
        }
        Ok(db)
    }

    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        Self::parse(&read_db_file(path)?).map_err(|e| with_path(path, e))
    }

    pub fn category(&self, name: &str) -> &[ServiceProbe] {
        self.categories.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of compiled probes.
    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Directives dropped because their pattern did not compile.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Run the probes against a server banner in search order.
    pub fn match_banner(&self, banner: &[u8], dst_port: u16, config: &StreamConfig) -> Vec<ServiceMatch> {
        let stop = config.stop_after_service_probe_match;
        let mut out = Vec::new();

        let expected = category_for_port(dst_port);
        if let Some(category) = expected {
            match_category(category, self.category(category), banner, stop, &mut out);
            if out.is_empty() && config.stop_after_service_category_miss {
                debug!(category, "no match in expected category");
                return out;
            }
            if !out.is_empty() && stop {
                return out;
            }
        }

        for (category, probes) in &self.categories {
            if Some(category.as_str()) == expected {
                continue;
            }
            match_category(category, probes, banner, stop, &mut out);
            if !out.is_empty() && stop {
                break;
            }
        }
        out
    }
}

fn match_category(
    category: &str,
    probes: &[ServiceProbe],
    banner: &[u8],
    stop: bool,
    out: &mut Vec<ServiceMatch>,
) {
    for probe in probes {
        let Some(caps) = probe.regex.captures(banner) else {
            continue;
        };
        debug!(probe = %probe.ident, "service probe matched");
        out.push(ServiceMatch {
            ident: probe.ident.clone(),
            category: category.to_string(),
            product: expand(&probe.product, &caps),
            version: expand(&probe.version, &caps),
            vendor: expand(&probe.vendor, &caps),
            info: expand(&probe.info, &caps),
            hostname: expand(&probe.hostname, &caps),
            os: expand(&probe.os, &caps),
            device_type: expand(&probe.device_type, &caps),
        });
        if stop {
            return;
        }
    }
}

/// Replace `$N` and `$P(N)` with capture group `N`.
fn expand(template: &str, caps: &Captures<'_>) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    let out = GROUP_REF.replace_all(template.as_bytes(), |r: &Captures<'_>| {
        let (printable, digit) = match (r.get(1), r.get(2)) {
            (Some(d), _) => (true, d.as_bytes()),
            (None, Some(d)) => (false, d.as_bytes()),
            (None, None) => return Vec::new(),
        };
        let index = usize::from(digit[0] - b'0');
        let group = caps.get(index).map(|m| m.as_bytes()).unwrap_or_default();
        if printable {
            group.iter().copied().filter(|b| b.is_ascii_graphic() || *b == b' ').collect()
        } else {
            group.to_vec()
        }
    });
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Directive parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Directive {
    pattern: String,
    product: String,
    version: String,
    vendor: String,
    info: String,
    hostname: String,
    os: String,
    device_type: String,
}

/// Text up to the next `delim`, and what follows it.
fn delimited(s: &str, delim: char) -> Result<(&str, &str), String> {
    s.split_once(delim)
        .ok_or_else(|| format!("unterminated field, expected '{}'", delim))
}

/// Parse `m<d>pattern<d>[flags] [field<d>value<d>]...`.
fn parse_directive(s: &str) -> Result<Directive, String> {
    let mut chars = s.trim_start().strip_prefix('m').ok_or("pattern must start with 'm'")?.chars();
    let delim = chars.next().ok_or("missing pattern delimiter")?;
    let (pattern, mut rest) = delimited(chars.as_str(), delim)?;

    let flags: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    rest = &rest[flags.len()..];
    let mut prefix = String::from("(?m");
    if flags.contains('i') {
        prefix.push('i');
    }
    if flags.contains('s') {
        prefix.push('s');
    }
    prefix.push_str("-u)");

    let mut d = Directive {
        pattern: format!("{}{}", prefix, pattern),
        ..Default::default()
    };

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(cpe) = rest.strip_prefix("cpe:") {
            let mut chars = cpe.chars();
            let delim = chars.next().ok_or("missing cpe delimiter")?;
            let (name, tail) = delimited(chars.as_str(), delim)?;
            if d.vendor.is_empty() {
                d.vendor = name.split(':').nth(1).unwrap_or_default().to_string();
            }
            // optional trailing `a` flag
            rest = tail.trim_start_matches('a');
            continue;
        }

        let mut chars = rest.chars();
        let field = chars.next().ok_or("missing field")?;
        let delim = chars.next().ok_or("missing field delimiter")?;
        let (value, tail) = delimited(chars.as_str(), delim)?;
        let slot = match field {
            'p' => &mut d.product,
            'v' => &mut d.version,
            'i' => &mut d.info,
            'h' => &mut d.hostname,
            'o' => &mut d.os,
            'd' => &mut d.device_type,
            other => return Err(format!("unknown field '{}'", other)),
        };
        *slot = value.to_string();
        rest = tail;
    }
    Ok(d)
}

/// Software candidates for the matches of one banner.
pub fn service_software(matches: &[ServiceMatch], flow: &str, timestamp: i64) -> Vec<Option<Software>> {
    matches
        .iter()
        .map(|m| {
            let mut notes = vec!["Protocol: TCP".to_string()];
            for (label, value) in [("Info", &m.info), ("Hostname", &m.hostname), ("Device", &m.device_type)] {
                if !value.is_empty() {
                    notes.push(format!("{}: {}", label, value));
                }
            }
            Some(Software {
                timestamp,
                product: m.product.clone(),
                vendor: m.vendor.clone(),
                version: m.version.clone(),
                service: m.category.clone(),
                source_name: format!("{}: {}", SOURCE_SERVICE_PROBE, m.ident),
                flows: vec![flow.to_string()],
                notes: notes.join(" "),
                os: m.os.clone(),
                ..Default::default()
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PROBES: &str = r#"
# Exclude directive and probes are ignored
Exclude T:9100-9107
Probe TCP NULL q||
match ftp m|^220 ProFTPD (\d\S+) Server \((.*?)\)| p/ProFTPD/ v/$1/ h/$P(2)/ cpe:/a:proftpd:proftpd:$1/
match ftp m|^220 \(vsFTPd ([\d.]+)\)\r\n| p/vsftpd/ v/$1/ o/Unix/ cpe:/a:vsftpd:vsftpd:$1/a
match ftp m|^220 (\w+) FTP server ready| p/generic ftpd/ h/$1/
match smtp m|^220 ([-.\w]+) ESMTP Postfix| p/Postfix smtpd/ h/$1/ cpe:/a:postfix:postfix/
match echo m|^(\w)\1$| p/broken backreference/
match banner m=^220 .*ready=si p/catch-all/
"#;

    fn db() -> ServiceProbeDatabase {
        ServiceProbeDatabase::parse(PROBES).unwrap()
    }

    #[test]
    fn test_parse() {
        let db = db();
        assert_eq!(db.len(), 5);
        assert_eq!(db.skipped(), 1);
        let ftp = db.category("ftp");
        assert_eq!(ftp.len(), 3);
        assert_eq!(ftp[1].ident, "ftp-2");
        assert_eq!(ftp[1].vendor, "vsftpd");
        assert_eq!(ftp[1].os, "Unix");
        assert_eq!(db.category("smtp")[0].vendor, "postfix");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ServiceProbeDatabase::parse("match ftp x|^220|"),
            Err(DatabaseError::ParseError(_))
        ));
        assert!(matches!(
            ServiceProbeDatabase::parse("match ftp m|^220| p/unterminated"),
            Err(DatabaseError::ParseError(_))
        ));
    }

    #[test]
    fn test_expected_category_first() {
        let config = StreamConfig::default();
        let hits = db().match_banner(b"220 (vsFTPd 3.0.3)\r\n", 21, &config);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ident, "ftp-2");
        assert_eq!(hits[0].product, "vsftpd");
        assert_eq!(hits[0].version, "3.0.3");
    }

    #[test]
    fn test_group_expansion() {
        let banner = b"220 ProFTPD 1.3.5e Server (Debian\x01 box)\r\n";
        let hits = db().match_banner(banner, 21, &StreamConfig::default());
        assert_eq!(hits[0].version, "1.3.5e");
        assert_eq!(hits[0].hostname, "Debian box");
    }

    #[test]
    fn test_full_sweep_on_unknown_port() {
        let config = StreamConfig::default();
        // "banner" sorts before "ftp", its catch-all wins the sweep
        let hits = db().match_banner(b"220 (vsFTPd 3.0.3)\r\nREADY\r\n", 2121, &config);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ident, "banner-1");
        assert_eq!(hits[0].category, "banner");
    }

    #[test]
    fn test_collect_all_matches() {
        let config = StreamConfig {
            stop_after_service_probe_match: false,
            ..Default::default()
        };
        let hits = db().match_banner(b"220 (vsFTPd 3.0.3)\r\nREADY\r\n", 21, &config);
        let idents: Vec<&str> = hits.iter().map(|m| m.ident.as_str()).collect();
        assert_eq!(idents, vec!["ftp-2", "banner-1"]);
    }

    #[test]
    fn test_category_miss_stops_search() {
        let banner = b"220 mail.example.org ESMTP Postfix\r\n";
        let hits = db().match_banner(banner, 21, &StreamConfig::default());
        assert_eq!(hits[0].product, "Postfix smtpd");

        let config = StreamConfig {
            stop_after_service_category_miss: true,
            ..Default::default()
        };
        assert!(db().match_banner(banner, 21, &config).is_empty());
    }

    #[test]
    fn test_service_software() {
        let hits = db().match_banner(b"220 (vsFTPd 3.0.3)\r\n", 21, &StreamConfig::default());
        let software = service_software(&hits, "a->b", 7);
        let s = software[0].as_ref().unwrap();
        assert_eq!(s.dedup_key(), "vsftpd/3.0.3");
        assert_eq!(s.source_name, "Service Probe Match: ftp-2");
        assert_eq!(s.service, "ftp");
        assert_eq!(s.notes, "Protocol: TCP");
        assert_eq!(s.os, "Unix");
        assert_eq!(s.flows, vec!["a->b"]);
        assert_eq!(s.timestamp, 7);
    }
}
