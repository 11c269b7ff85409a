//! # HTTP Software Producers
//!
//! Turns a decoded [`HttpRecord`] into software candidates:
//!
//! | Source           | Input                  | Fields                      |
//! |------------------|------------------------|-----------------------------|
//! | `UserAgent`      | `User-Agent` header    | product, vendor, version, os |
//! | `ServerName`     | `Server` header        | product, version, os        |
//! | `X-Powered-By`   | `X-Powered-By` header  | product, version            |
//! | `HTTP Header`    | CMS header signatures  | product, website            |
//! | `HTTP Cookie`    | CMS cookie signatures  | product, website            |
//!
//! Also hosts the generic `x.y.z` version harvester used for plain text
//! banners.

use once_cell::sync::Lazy;
use regex::Regex;

use super::db::Databases;
use crate::config::StreamConfig;
use crate::records::{HttpRecord, Software};

pub const SERVICE_HTTP: &str = "HTTP";

static SERVER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(.*?)(?:/(.*?))?(?:\s*?)(?:\((.*?)\))?$").expect("static regex")
});

static X_POWERED_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(.*?)(?:(?:\s|/)(.*?))?$").expect("static regex"));

static GENERIC_VERSION: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r"(?m)(?:^)(.*?)(\d+)\.(\d+)\.(\d+)(.*?)(?:$)").expect("static regex")
});

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Split a `Server` banner into product, version and os.
///
/// `Apache/2.4.29 (Ubuntu)` gives `("Apache", "2.4.29", "Ubuntu")`.
pub fn parse_server_name(value: &str) -> (String, String, String) {
    match SERVER_NAME.captures(value) {
        Some(c) => (group(&c, 1), group(&c, 2), group(&c, 3)),
        None => (String::new(), String::new(), String::new()),
    }
}

/// Split an `X-Powered-By` value into product and version.
pub fn parse_powered_by(value: &str) -> (String, String) {
    match X_POWERED_BY.captures(value) {
        Some(c) => (group(&c, 1), group(&c, 2)),
        None => (String::new(), String::new()),
    }
}

fn group(c: &regex::Captures<'_>, idx: usize) -> String {
    c.get(idx).map(|m| m.as_str().to_string()).unwrap_or_default()
}

/// All software candidates derivable from one HTTP record.
pub fn identify_http(
    record: &HttpRecord,
    flow: &str,
    dbs: &Databases,
    config: &StreamConfig,
) -> Vec<Option<Software>> {
    let base = Software {
        timestamp: record.timestamp,
        service: SERVICE_HTTP.to_string(),
        flows: vec![flow.to_string()],
        ..Default::default()
    };
    let mut out = Vec::new();

    if !is_blank(&record.user_agent) {
        if let Some(ua) = &dbs.user_agents {
            out.push(ua.identify(&record.user_agent).filter(|i| i.is_identified()).map(|info| {
                Software {
                    product: info.product,
                    vendor: info.vendor,
                    version: info.version,
                    os: info.os,
                    notes: info.full,
                    source_name: "UserAgent".into(),
                    source_data: record.user_agent.clone(),
                    ..base.clone()
                }
            }));
        }
    }

    if !is_blank(&record.server_name) {
        let (product, version, os) = parse_server_name(&record.server_name);
        out.push(Some(Software {
            product,
            version,
            os,
            source_name: "ServerName".into(),
            source_data: record.server_name.clone(),
            ..base.clone()
        }));
    }

    let powered_by = record
        .response_headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("X-Powered-By"))
        .map(|(_, v)| v.as_str())
        .filter(|v| !is_blank(v));
    if let Some(value) = powered_by {
        let (product, version) = parse_powered_by(value);
        out.push(Some(Software {
            product,
            version,
            source_name: "X-Powered-By".into(),
            source_data: value.to_string(),
            ..base.clone()
        }));
    }

    let cms_hits = dbs.cms.identify(
        &record.response_headers,
        &record.res_cookies,
        config.stop_after_service_probe_match,
    );
    for hit in cms_hits {
        out.push(Some(Software {
            product: hit.product,
            website: hit.website,
            source_name: hit.source_name,
            source_data: hit.source_data,
            ..base.clone()
        }));
    }

    out
}

/// One candidate per line of `data` carrying an `x.y.z` version.
///
/// The version is `x.y.z`, the product is the text before it with trailing
/// separators removed, and the notes hold the whole line.
pub fn generic_versions(data: &[u8], flow: &str, ts: i64, service: &str) -> Vec<Option<Software>> {
    let source_data = String::from_utf8_lossy(data).to_string();

    GENERIC_VERSION
        .captures_iter(data)
        .map(|c| {
            let text = |i: usize| {
                c.get(i)
                    .map(|m| String::from_utf8_lossy(m.as_bytes()).to_string())
                    .unwrap_or_default()
            };
            let product = text(1)
                .trim_end_matches(|ch: char| !ch.is_alphanumeric())
                .to_string();

            Some(Software {
                timestamp: ts,
                product,
                version: format!("{}.{}.{}", text(2), text(3), text(4)),
                service: service.to_string(),
                source_name: "Generic version harvester".into(),
                source_data: source_data.clone(),
                flows: vec![flow.to_string()],
                notes: text(0).trim().to_string(),
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
    use crate::records::HttpCookie;
    use crate::software::cms::CmsDatabase;

    #[test]
    fn test_parse_server_name() {
        assert_eq!(
            parse_server_name("Apache/2.4.29 (Ubuntu)"),
            ("Apache".into(), "2.4.29".into(), "Ubuntu".into())
        );
        assert_eq!(
            parse_server_name("nginx/1.18.0"),
            ("nginx".into(), "1.18.0".into(), String::new())
        );
        assert_eq!(
            parse_server_name("cloudflare"),
            ("cloudflare".into(), String::new(), String::new())
        );
    }

    #[test]
    fn test_parse_powered_by() {
        assert_eq!(parse_powered_by("PHP/7.2.24"), ("PHP".into(), "7.2.24".into()));
        assert_eq!(parse_powered_by("ASP.NET"), ("ASP.NET".into(), String::new()));
        assert_eq!(parse_powered_by("Express"), ("Express".into(), String::new()));
    }

    #[test]
    fn test_identify_http_headers() {
        let mut record = HttpRecord {
            timestamp: 42,
            server_name: "Apache/2.4.29 (Ubuntu)".into(),
            ..Default::default()
        };
        record
            .response_headers
            .insert("X-Powered-By".into(), "PHP/7.2.24".into());

        let out = identify_http(&record, "flow", &Databases::empty(), &StreamConfig::default());
        let out: Vec<Software> = out.into_iter().flatten().collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_name, "ServerName");
        assert_eq!(out[0].os, "Ubuntu");
        assert_eq!(out[0].timestamp, 42);
        assert_eq!(out[0].flows, vec!["flow"]);
        assert_eq!(out[1].product, "PHP");
        assert_eq!(out[1].version, "7.2.24");
    }

    #[test]
    fn test_identify_http_blank_server_ignored() {
        let record = HttpRecord {
            server_name: " ".into(),
            ..Default::default()
        };
        assert!(identify_http(&record, "f", &Databases::empty(), &StreamConfig::default()).is_empty());
    }

    #[test]
    fn test_identify_http_cms() {
        let dbs = Databases {
            cms: CmsDatabase::from_json(r#"{"WordPress": {"website": "https://wordpress.org", "cookies": {"wp-settings-1": ""}}}"#)
                .unwrap(),
            ..Databases::empty()
        };
        let record = HttpRecord {
            res_cookies: vec![HttpCookie {
                name: "wp-settings-1".into(),
                value: "x".into(),
            }],
            ..Default::default()
        };
        let out: Vec<Software> = identify_http(&record, "f", &dbs, &StreamConfig::default())
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].product, "WordPress");
        assert_eq!(out[0].website, "https://wordpress.org");
        assert_eq!(out[0].source_name, "HTTP Cookie");
    }

    #[test]
    fn test_generic_versions() {
        let data = b"Hello,\nfor our hosting we will use Apache version 2.4.29.\nThere are other options,\nlike Lighttp 2.3.4";
        let out: Vec<Software> = generic_versions(data, "f", 1, "SMTP")
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].notes, "for our hosting we will use Apache version 2.4.29.");
        assert_eq!(out[0].version, "2.4.29");
        assert_eq!(out[0].product, "for our hosting we will use Apache version");
        assert_eq!(out[1].notes, "like Lighttp 2.3.4");
        assert_eq!(out[1].product, "like Lighttp");
        assert_eq!(out[1].source_name, "Generic version harvester");
    }

    #[test]
    fn test_generic_versions_windows_banner() {
        let data = b"Test123\nMicrosoft Windows [Version 10.0.10586]\n(c) 2015 Microsoft Corporation. All rights reserved. \nC:\\cygwin\\netcat>";
        let out: Vec<Software> = generic_versions(data, "f", 1, "test")
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].notes, "Microsoft Windows [Version 10.0.10586]");
        assert_eq!(out[0].version, "10.0.10586");
    }
}
