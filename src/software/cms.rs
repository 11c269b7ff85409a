//! # CMS Detection
//!
//! Identifies web frameworks from response headers and cookies using a
//! Wappalyzer style database (`cmsdb.json`):
//!
//! ```json
//! {
//!   "WordPress": {
//!     "cats": [1, 11],
//!     "website": "https://wordpress.org",
//!     "headers": { "X-Pingback": "/xmlrpc\\.php$" },
//!     "cookies": { "wp-settings-": "" }
//!   }
//! }
//! ```
//!
//! Field types vary between entries, so frameworks are read from a
//! [`serde_json::Value`] tree. An empty pattern means the name alone
//! identifies the framework. Version tags after `\;` are dropped before
//! compiling.
//!
//! Every header and cookie name in the database is also collected into a
//! lowercase name set, which rejects responses carrying none of them before
//! any regex runs.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::db::{read_db_file, with_path, DatabaseError};
use crate::records::HttpCookie;

pub const SOURCE_HEADER: &str = "HTTP Header";
pub const SOURCE_COOKIE: &str = "HTTP Cookie";

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Header or cookie signature.
#[derive(Debug)]
pub struct CmsPattern {
    pub name: String,
    /// `None` for a name-only match.
    pub regex: Option<Regex>,
}

#[derive(Debug)]
pub struct CmsFramework {
    pub name: String,
    pub website: String,
    pub cpe: String,
    pub cats: Vec<u64>,
    pub implies: Vec<String>,
    pub headers: Vec<CmsPattern>,
    pub cookies: Vec<CmsPattern>,
}

/// A framework identified from one header or cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmsMatch {
    pub product: String,
    pub website: String,
    /// [`SOURCE_HEADER`] or [`SOURCE_COOKIE`].
    pub source_name: String,
    pub source_data: String,
}

#[derive(Debug, Default)]
pub struct CmsDatabase {
    /// Sorted by name.
    frameworks: Vec<CmsFramework>,
    header_names: HashSet<String>,
    cookie_names: HashSet<String>,
}

impl CmsDatabase {
    pub fn from_file(path: &Path) -> Result<Self, DatabaseError> {
        Self::from_json(&read_db_file(path)?).map_err(|e| with_path(path, e))
    }

    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| DatabaseError::ParseError(e.to_string()))?;
        let Value::Object(map) = root else {
            return Err(DatabaseError::ParseError("expected an object of frameworks".into()));
        };

        let mut db = CmsDatabase::default();
        for (name, info) in &map {
            let headers = patterns(name, info.get("headers"), &mut db.header_names);
            let cookies = patterns(name, info.get("cookies"), &mut db.cookie_names);

            db.frameworks.push(CmsFramework {
                name: name.clone(),
                website: string_field(info, "website"),
                cpe: string_field(info, "cpe"),
                cats: info
                    .get("cats")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_u64).collect())
                    .unwrap_or_default(),
                implies: string_or_list(info.get("implies")),
                headers,
                cookies,
            });
        }
        db.frameworks.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.frameworks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frameworks.is_empty()
    }

    pub fn frameworks(&self) -> &[CmsFramework] {
        &self.frameworks
    }

    /// Match response headers and cookies against every framework.
    ///
    /// With `stop_after_match` only the first hit is returned.
    pub fn identify<'a, H>(&self, headers: H, cookies: &[HttpCookie], stop_after_match: bool) -> Vec<CmsMatch>
    where
        H: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let headers: Vec<(&str, &str)> = headers
            .into_iter()
            .filter(|(k, _)| self.header_names.contains(&k.to_ascii_lowercase()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let cookies: Vec<(&str, &str)> = cookies
            .iter()
            .filter(|c| self.cookie_names.contains(&c.name.to_ascii_lowercase()))
            .map(|c| (c.name.as_str(), c.value.as_str()))
            .collect();

        let mut out = Vec::new();
        if headers.is_empty() && cookies.is_empty() {
            return out;
        }

        for framework in &self.frameworks {
            let sources = [
                (&framework.headers, &headers, SOURCE_HEADER, "header name match"),
                (&framework.cookies, &cookies, SOURCE_COOKIE, "cookie name match"),
            ];
            for (patterns, observed, source_name, name_only) in sources {
                for pattern in patterns {
                    let Some(source_data) = match_pattern(pattern, observed, name_only) else {
                        continue;
                    };
                    out.push(CmsMatch {
                        product: framework.name.clone(),
                        website: framework.website.clone(),
                        source_name: source_name.to_string(),
                        source_data,
                    });
                    if stop_after_match {
                        return out;
                    }
                }
            }
        }
        out
    }
}

/// Source data of the first observed pair matching `pattern`.
fn match_pattern(pattern: &CmsPattern, observed: &[(&str, &str)], name_only: &str) -> Option<String> {
    for (name, value) in observed {
        if !name.eq_ignore_ascii_case(&pattern.name) {
            continue;
        }
        match &pattern.regex {
            None => return Some(name_only.to_string()),
            Some(re) if re.is_match(value) => {
                return Some(format!("regex match on value: {}", value))
            }
            Some(_) => {}
        }
    }
    None
}

fn patterns(framework: &str, section: Option<&Value>, names: &mut HashSet<String>) -> Vec<CmsPattern> {
    let Some(Value::Object(map)) = section else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(map.len());
    for (name, raw) in map {
        names.insert(name.to_ascii_lowercase());

        let source = match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let source = source.split("\\;").next().unwrap_or_default();
        if source.is_empty() {
            out.push(CmsPattern {
                name: name.clone(),
                regex: None,
            });
            continue;
        }

        match Regex::new(source) {
            Ok(re) => out.push(CmsPattern {
                name: name.clone(),
                regex: Some(re),
            }),
            Err(e) => debug!(framework, name = %name, error = %e, "skipping CMS pattern"),
        }
    }
    out
}

fn string_field(info: &Value, key: &str) -> String {
    info.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_or_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(a)) => a
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const CMS_JSON: &str = r#"{
        "WordPress": {
            "cats": [1, 11],
            "website": "https://wordpress.org",
            "implies": ["PHP", "MySQL"],
            "headers": {"X-Pingback": "/xmlrpc\\.php$"},
            "cookies": {"wp-settings-1": ""}
        },
        "Express": {
            "cats": [18],
            "website": "http://expressjs.com",
            "implies": "Node.js",
            "headers": {"X-Powered-By": "^Express$"}
        },
        "Drupal": {
            "headers": {"X-Generator": "Drupal(?:\\s([\\d.]+))?\\;version:\\1"},
            "icon": 5
        }
    }"#;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_lenient_fields() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        assert_eq!(db.len(), 3);
        let names: Vec<&str> = db.frameworks().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Drupal", "Express", "WordPress"]);
        assert_eq!(db.frameworks()[1].implies, vec!["Node.js"]);
        assert_eq!(db.frameworks()[2].cats, vec![1, 11]);
    }

    #[test]
    fn test_header_regex_match() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        let h = headers(&[("X-Powered-By", "Express"), ("Content-Type", "text/html")]);
        let hits = db.identify(&h, &[], true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].product, "Express");
        assert_eq!(hits[0].source_name, SOURCE_HEADER);
        assert_eq!(hits[0].source_data, "regex match on value: Express");
    }

    #[test]
    fn test_version_tag_stripped() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        let h = headers(&[("x-generator", "Drupal 8")]);
        let hits = db.identify(&h, &[], true);
        assert_eq!(hits[0].product, "Drupal");
    }

    #[test]
    fn test_cookie_name_only_match() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        let cookies = vec![HttpCookie {
            name: "wp-settings-1".into(),
            value: "anything".into(),
        }];
        let hits = db.identify(&BTreeMap::new(), &cookies, true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_name, SOURCE_COOKIE);
        assert_eq!(hits[0].source_data, "cookie name match");
        assert_eq!(hits[0].website, "https://wordpress.org");
    }

    #[test]
    fn test_collect_all_without_stop() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        let h = headers(&[("X-Powered-By", "Express"), ("X-Pingback", "http://x/xmlrpc.php")]);
        let cookies = vec![HttpCookie {
            name: "wp-settings-1".into(),
            value: String::new(),
        }];
        assert_eq!(db.identify(&h, &cookies, true).len(), 1);
        assert_eq!(db.identify(&h, &cookies, false).len(), 3);
    }

    #[test]
    fn test_prefilter_rejects_unknown_names() {
        let db = CmsDatabase::from_json(CMS_JSON).unwrap();
        let h = headers(&[("Server", "nginx")]);
        assert!(db.identify(&h, &[], false).is_empty());
    }

    #[test]
    fn test_not_an_object() {
        assert!(CmsDatabase::from_json("[]").is_err());
    }
}
