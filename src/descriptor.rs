//! The URL descriptor: the unit of work the checker mutates in place.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use url::Url;

use crate::error::CheckError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
}

impl Method {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Head => reqwest::Method::HEAD,
            Method::Get => reqwest::Method::GET,
        }
    }
}

/// Final classification the checker hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Valid(String),
    ValidWithWarnings(String),
    Invalid(String),
    /// robots-denied or outside the domain filter: valid-by-default,
    /// the URL's form was checked but it was never fetched.
    SyntaxOnly(String),
    Aborted,
}

#[derive(Debug, Clone)]
pub struct UrlDescriptor {
    pub original_url: String,
    pub url: Url,
    pub depth: u32,
    pub parent_url: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub name: Option<String>,

    pub cache_key: String,
    pub aliases: Vec<String>,

    pub method: Method,
    pub has301: bool,
    pub no_anchor: bool,
    pub persistent: bool,
    pub has_content: bool,

    pub info: Vec<String>,
    pub warning: Vec<String>,
    pub result: Option<CheckOutcome>,

    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
}

impl UrlDescriptor {
    pub fn new(
        url: Url,
        depth: u32,
        parent_url: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
        name: Option<String>,
    ) -> Result<Self, CheckError> {
        let cache_key = canonicalize(&url);
        Ok(UrlDescriptor {
            original_url: url.to_string(),
            url,
            depth,
            parent_url,
            line,
            column,
            name,
            cache_key,
            aliases: Vec::new(),
            method: Method::Head,
            has301: false,
            no_anchor: false,
            persistent: false,
            has_content: false,
            info: Vec::new(),
            warning: Vec::new(),
            result: None,
            headers: None,
            body: None,
        })
    }

    pub fn add_info(&mut self, message: impl Into<String>) {
        self.info.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warning.push(message.into());
    }

    pub fn set_result(&mut self, outcome: CheckOutcome) {
        self.result = Some(outcome);
    }

    /// `all_seen` used for redirect cycle detection: the cache key plus
    /// every alias recorded so far.
    pub fn all_seen(&self) -> Vec<String> {
        let mut seen = vec![self.cache_key.clone()];
        seen.extend(self.aliases.iter().cloned());
        seen
    }

    pub fn is_html(&mut self) -> bool {
        let Some(headers) = self.headers.clone() else {
            return false;
        };
        if crate::headers::content_type(&headers).as_deref() != Some("text/html") {
            return false;
        }
        self.encoding_is_parseable(&headers)
    }

    pub fn is_css(&mut self) -> bool {
        let Some(headers) = self.headers.clone() else {
            return false;
        };
        if crate::headers::content_type(&headers).as_deref() != Some("text/css") {
            return false;
        }
        self.encoding_is_parseable(&headers)
    }

    pub fn is_parseable(&mut self) -> bool {
        self.is_html() || self.is_css()
    }

    fn encoding_is_parseable(&mut self, headers: &HeaderMap) -> bool {
        let encoding = crate::headers::content_encoding(headers);
        if encoding == "identity" || crate::headers::SUPPORTED_ENCODINGS.contains(&encoding.as_str()) {
            true
        } else {
            self.add_warning(format!("Unsupported content encoding {encoding:?}."));
            false
        }
    }
}

/// Canonicalize a URL for use as a cache key: lowercase host, strip the
/// default port, drop the fragment.
pub fn canonicalize(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    if let Some(host) = url.host_str() {
        let _ = normalized.set_host(Some(&host.to_lowercase()));
    }
    if let Some(port) = url.port() {
        let default = match url.scheme() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        if Some(port) == default {
            let _ = normalized.set_port(None);
        }
    }
    normalized.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with_headers(headers: HeaderMap) -> UrlDescriptor {
        let mut descriptor =
            UrlDescriptor::new(Url::parse("http://h/x").unwrap(), 0, None, None, None, None)
                .unwrap();
        descriptor.headers = Some(headers);
        descriptor
    }

    #[test]
    fn is_html_accepts_identity_and_supported_encodings() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_TYPE, "text/html".parse().unwrap());
        let mut descriptor = descriptor_with_headers(headers);
        assert!(descriptor.is_html());
        assert!(descriptor.warning.is_empty());
    }

    #[test]
    fn is_html_warns_and_returns_false_on_unsupported_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_TYPE, "text/html".parse().unwrap());
        headers.insert(reqwest::header::CONTENT_ENCODING, "br".parse().unwrap());
        let mut descriptor = descriptor_with_headers(headers);

        assert!(!descriptor.is_html());
        assert_eq!(descriptor.warning.len(), 1);
        assert!(descriptor.warning[0].contains("Unsupported content encoding"));
    }

    #[test]
    fn is_css_warns_and_returns_false_on_unsupported_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_TYPE, "text/css".parse().unwrap());
        headers.insert(reqwest::header::CONTENT_ENCODING, "compress".parse().unwrap());
        let mut descriptor = descriptor_with_headers(headers);

        assert!(!descriptor.is_css());
        assert_eq!(descriptor.warning.len(), 1);
        assert!(descriptor.warning[0].contains("Unsupported content encoding"));
    }
}
