//! # User-Agent Identification
//!
//! Maps raw `User-Agent` header values to a product/vendor/version triple.
//! Parsing is delegated to a [`UserAgentParser`]; the default
//! implementation wraps the `uaparser` crate and the uap-core
//! `regexes.yaml` grammar.
//!
//! Results (including misses) are cached per raw string, so each distinct
//! user agent is parsed once per process.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uaparser::Parser;

use super::db::DatabaseError;

/// Placeholder the grammar returns for unknown families.
const OTHER: &str = "Other";

// ---------------------------------------------------------------------------
// Parser seam
// ---------------------------------------------------------------------------

/// Raw grammar output. Missing components are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub family: String,
    pub major: String,
    pub minor: String,
    pub patch: String,
    pub os_family: String,
    pub os_major: String,
    pub os_minor: String,
    pub os_patch: String,
    pub os_patch_minor: String,
    pub device_family: String,
}

impl ParsedUserAgent {
    /// `family [major[.minor[.patch[.patch_minor]]]]`
    pub fn os_string(&self) -> String {
        let mut out = self.os_family.clone();
        let mut version = self.os_major.clone();
        if !version.is_empty() {
            for part in [&self.os_minor, &self.os_patch, &self.os_patch_minor] {
                if part.is_empty() {
                    break;
                }
                version.push('.');
                version.push_str(part);
            }
            out.push(' ');
            out.push_str(&version);
        }
        out
    }
}

pub trait UserAgentParser: Send + Sync {
    fn parse(&self, user_agent: &str) -> ParsedUserAgent;
}

/// [`UserAgentParser`] backed by the uap-core grammar.
pub struct UaParser {
    inner: uaparser::UserAgentParser,
}

impl UaParser {
    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        let bytes = std::fs::read(path)
            .map_err(|e| DatabaseError::IoError(format!("{}: {}", path.display(), e)))?;
        let inner = uaparser::UserAgentParser::from_bytes(&bytes)
            .map_err(|e| DatabaseError::RegexError(format!("{}: {:?}", path.display(), e)))?;
        Ok(Self { inner })
    }
}

impl UserAgentParser for UaParser {
    fn parse(&self, user_agent: &str) -> ParsedUserAgent {
        let client = self.inner.parse(user_agent);
        let opt = |v: &Option<std::borrow::Cow<'_, str>>| v.as_deref().unwrap_or_default().to_string();

        ParsedUserAgent {
            family: client.user_agent.family.to_string(),
            major: opt(&client.user_agent.major),
            minor: opt(&client.user_agent.minor),
            patch: opt(&client.user_agent.patch),
            os_family: client.os.family.to_string(),
            os_major: opt(&client.os.major),
            os_minor: opt(&client.os.minor),
            os_patch: opt(&client.os.patch),
            os_patch_minor: opt(&client.os.patch_minor),
            device_family: client.device.family.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// Interpreted user agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    /// Device family.
    pub product: String,
    /// Browser or client family, or a vendor inferred from the product.
    pub vendor: String,
    /// `major[.minor][.patch]`
    pub version: String,
    pub os: String,
    /// All non-empty components, space separated.
    pub full: String,
}

impl UserAgentInfo {
    pub fn from_parsed(p: &ParsedUserAgent) -> Self {
        let mut version = p.major.clone();
        for part in [&p.minor, &p.patch] {
            if !part.is_empty() {
                version.push('.');
                version.push_str(part);
            }
        }

        let vendor = match p.family.as_str() {
            OTHER => String::new(),
            family => family.to_string(),
        };
        let product = match p.device_family.as_str() {
            OTHER => String::new(),
            family => family.to_string(),
        };
        let vendor = if vendor.is_empty() {
            determine_vendor(&product).to_string()
        } else {
            vendor
        };
        let os = match p.os_string() {
            s if s == OTHER => String::new(),
            s => s,
        };

        let full = [
            &p.family,
            &p.major,
            &p.minor,
            &p.patch,
            &p.os_family,
            &p.os_major,
            &p.os_minor,
            &p.os_patch,
            &p.os_patch_minor,
            &p.device_family,
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");

        Self {
            product,
            vendor,
            version,
            os,
            full,
        }
    }

    /// Worth emitting as a software artifact.
    pub fn is_identified(&self) -> bool {
        !self.product.is_empty() || !self.vendor.is_empty() || !self.version.is_empty()
    }
}

/// Vendor implied by a well known product name.
pub fn determine_vendor(product: &str) -> &'static str {
    match product {
        "Chrome" | "Android" => "Google",
        "Firefox" => "Mozilla",
        "Internet Explorer" | "IE" => "Microsoft",
        "Safari" | "iOS" | "macOS" => "Apple",
        _ => "",
    }
}

/// Caching front end over a [`UserAgentParser`].
pub struct UserAgentIdentifier {
    parser: Arc<dyn UserAgentParser>,
    cache: DashMap<String, UserAgentInfo>,
}

impl UserAgentIdentifier {
    pub fn new(parser: Arc<dyn UserAgentParser>) -> Self {
        Self {
            parser,
            cache: DashMap::new(),
        }
    }

    /// Blank values are ignored.
    pub fn identify(&self, user_agent: &str) -> Option<UserAgentInfo> {
        if user_agent.trim().is_empty() {
            return None;
        }
        if let Some(hit) = self.cache.get(user_agent) {
            return Some(hit.value().clone());
        }

        let info = UserAgentInfo::from_parsed(&self.parser.parse(user_agent));
        debug!(user_agent, full = %info.full, "parsed user agent");
        self.cache.insert(user_agent.to_string(), info.clone());
        Some(info)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Recognizes exactly one Firefox string and counts invocations.
    struct StubParser {
        calls: AtomicUsize,
    }

    impl UserAgentParser for StubParser {
        fn parse(&self, ua: &str) -> ParsedUserAgent {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ua.contains("Firefox/115.0") {
                ParsedUserAgent {
                    family: "Firefox".into(),
                    major: "115".into(),
                    minor: "0".into(),
                    os_family: "Ubuntu".into(),
                    device_family: "Other".into(),
                    ..Default::default()
                }
            } else {
                ParsedUserAgent {
                    family: "Other".into(),
                    os_family: "Other".into(),
                    device_family: "Other".into(),
                    ..Default::default()
                }
            }
        }
    }

    fn identifier() -> (Arc<StubParser>, UserAgentIdentifier) {
        let parser = Arc::new(StubParser {
            calls: AtomicUsize::new(0),
        });
        (parser.clone(), UserAgentIdentifier::new(parser))
    }

    #[test]
    fn test_determine_vendor() {
        assert_eq!(determine_vendor("Chrome"), "Google");
        assert_eq!(determine_vendor("Android"), "Google");
        assert_eq!(determine_vendor("IE"), "Microsoft");
        assert_eq!(determine_vendor("iOS"), "Apple");
        assert_eq!(determine_vendor("Nokia"), "");
    }

    #[test]
    fn test_identify_firefox() {
        let (_, ident) = identifier();
        let info = ident
            .identify("Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0")
            .unwrap();
        assert_eq!(info.vendor, "Firefox");
        assert_eq!(info.version, "115.0");
        assert_eq!(info.product, "");
        assert_eq!(info.os, "Ubuntu");
        assert_eq!(info.full, "Firefox 115 0 Ubuntu Other");
        assert!(info.is_identified());
    }

    #[test]
    fn test_other_maps_to_empty() {
        let (_, ident) = identifier();
        let info = ident.identify("curl/8.0").unwrap();
        assert_eq!(info.vendor, "");
        assert_eq!(info.product, "");
        assert_eq!(info.os, "");
        assert!(!info.is_identified());
    }

    #[test]
    fn test_vendor_inferred_from_product() {
        let info = UserAgentInfo::from_parsed(&ParsedUserAgent {
            family: "Other".into(),
            device_family: "iOS".into(),
            ..Default::default()
        });
        assert_eq!(info.vendor, "Apple");
    }

    #[test]
    fn test_cache_parses_once() {
        let (parser, ident) = identifier();
        for _ in 0..3 {
            ident.identify("curl/8.0");
        }
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ident.cached(), 1);
    }

    #[test]
    fn test_blank_ignored() {
        let (parser, ident) = identifier();
        assert!(ident.identify(" ").is_none());
        assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_os_string() {
        let p = ParsedUserAgent {
            os_family: "Mac OS X".into(),
            os_major: "10".into(),
            os_minor: "15".into(),
            ..Default::default()
        };
        assert_eq!(p.os_string(), "Mac OS X 10.15");
    }
}
