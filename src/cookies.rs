//! Cookie jar: stores `Set-Cookie` responses per host/path and serves
//! them back as `Cookie` request headers.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use reqwest::header::HeaderMap;

use crate::error::CookieError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn header_pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

#[derive(Default)]
pub struct CookieJar {
    // domain -> path-prefix -> cookies set at that domain+path.
    by_domain: RwLock<HashMap<String, BTreeMap<String, Vec<Cookie>>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every `Set-Cookie` header and store the cookies it
    /// describes under `host`. A malformed `Set-Cookie` value is
    /// reported (as a `CookieError`, for the caller to turn into a
    /// warning) and skipped; other cookies in the same response still
    /// get stored.
    pub fn store(&self, headers: &HeaderMap, host: &str) -> Vec<CookieError> {
        let mut errors = Vec::new();
        for raw in headers.get_all(reqwest::header::SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                errors.push(CookieError("non-UTF8 Set-Cookie header".to_string()));
                continue;
            };
            match parse_set_cookie(raw) {
                Ok((cookie, domain, path)) => {
                    let domain = domain.unwrap_or_else(|| host.to_string());
                    let mut map = self.by_domain.write();
                    let by_path = map.entry(domain).or_default();
                    let bucket = by_path.entry(path).or_default();
                    bucket.retain(|c| c.name != cookie.name);
                    bucket.push(cookie);
                }
                Err(err) => errors.push(err),
            }
        }
        errors
    }

    /// All cookies whose domain suffix-matches `host` and whose path is
    /// a prefix of `path`, in deterministic (domain, path, insertion)
    /// order.
    pub fn get(&self, host: &str, path: &str) -> Vec<Cookie> {
        let map = self.by_domain.read();
        let mut domains: Vec<&String> = map
            .keys()
            .filter(|domain| host.ends_with(domain.as_str()))
            .collect();
        domains.sort();
        let mut out = Vec::new();
        for domain in domains {
            let by_path = &map[domain];
            let mut paths: Vec<&String> = by_path
                .keys()
                .filter(|prefix| path.starts_with(prefix.as_str()))
                .collect();
            paths.sort();
            for prefix in paths {
                out.extend(by_path[prefix].iter().cloned());
            }
        }
        out
    }
}

/// Parse one `Set-Cookie` header value into (name=value cookie, domain
/// attribute if present, path attribute defaulting to `/`).
fn parse_set_cookie(raw: &str) -> Result<(Cookie, Option<String>, String), CookieError> {
    let mut parts = raw.split(';');
    let first = parts
        .next()
        .ok_or_else(|| CookieError("empty Set-Cookie header".to_string()))?
        .trim();
    let (name, value) = first
        .split_once('=')
        .ok_or_else(|| CookieError(format!("missing '=' in cookie pair {first:?}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CookieError("empty cookie name".to_string()));
    }

    let mut domain = None;
    let mut path = "/".to_string();
    for attr in parts {
        let attr = attr.trim();
        if let Some((key, val)) = attr.split_once('=') {
            match key.trim().to_lowercase().as_str() {
                "domain" => domain = Some(val.trim().trim_start_matches('.').to_lowercase()),
                "path" => path = val.trim().to_string(),
                _ => {}
            }
        }
    }

    Ok((
        Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
        },
        domain,
        path,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn stores_and_retrieves_by_host_and_path() {
        let jar = CookieJar::new();
        let mut headers = HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            HeaderValue::from_static("session=abc123; Path=/app"),
        );
        jar.store(&headers, "example.com");

        let found = jar.get("example.com", "/app/page");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].header_pair(), "session=abc123");

        assert!(jar.get("example.com", "/other").is_empty());
    }

    #[test]
    fn domain_attribute_matches_by_suffix() {
        let jar = CookieJar::new();
        let mut headers = HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            HeaderValue::from_static("id=1; Domain=.example.com"),
        );
        jar.store(&headers, "www.example.com");

        assert_eq!(jar.get("sub.example.com", "/").len(), 1);
        assert!(jar.get("other.com", "/").is_empty());
    }

    #[test]
    fn malformed_cookie_reported_and_skipped() {
        let jar = CookieJar::new();
        let mut headers = HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            HeaderValue::from_static("not-a-cookie-pair"),
        );
        let errors = jar.store(&headers, "example.com");
        assert_eq!(errors.len(), 1);
        assert!(jar.get("example.com", "/").is_empty());
    }

    #[test]
    fn later_value_overwrites_same_name() {
        let jar = CookieJar::new();
        let mut headers = HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            HeaderValue::from_static("a=1"),
        );
        headers.append(
            reqwest::header::SET_COOKIE,
            HeaderValue::from_static("a=2"),
        );
        jar.store(&headers, "example.com");
        let found = jar.get("example.com", "/");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "2");
    }
}
