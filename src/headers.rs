//! Pure functions over a response's header bag: content type/encoding,
//! persistence and keep-alive timeout, and body decompression.

use std::io::Read;

use reqwest::header::HeaderMap;

const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 300;

/// Lowercase MIME token without parameters, e.g. `"text/html"`.
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(reqwest::header::CONTENT_TYPE)?.to_str().ok()?;
    let token = raw.split(';').next().unwrap_or(raw).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_lowercase())
    }
}

/// Lowercase `Content-Encoding` token, defaulting to `"identity"`.
pub fn content_encoding(headers: &HeaderMap) -> String {
    headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "identity".to_string())
}

/// True iff the connection should be kept alive per the response's
/// declared HTTP version and `Connection` header.
pub fn persistent(headers: &HeaderMap, http11: bool) -> bool {
    let connection = headers
        .get(reqwest::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase());
    if http11 {
        connection.as_deref() != Some("close")
    } else {
        connection.as_deref() == Some("keep-alive")
    }
}

/// Keep-alive timeout in seconds, parsed from `Keep-Alive: timeout=N`,
/// else the default (300s).
pub fn timeout(headers: &HeaderMap) -> u64 {
    headers
        .get(reqwest::header::HeaderName::from_static("keep-alive"))
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(',').find_map(|part| {
                let part = part.trim();
                let (key, value) = part.split_once('=')?;
                if key.trim().eq_ignore_ascii_case("timeout") {
                    value.trim().parse::<u64>().ok()
                } else {
                    None
                }
            })
        })
        .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT_SECS)
}

/// Known-decodable content encodings.
pub const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "x-gzip", "deflate"];

pub struct DecodeOutcome {
    pub body: Vec<u8>,
    /// Set when the encoding was unrecognized or decompression failed;
    /// the caller should surface this as a warning, not an error.
    pub warning: Option<String>,
}

/// Decode `body` per `encoding`. `identity` is a pass-through; `gzip`,
/// `x-gzip` and `deflate` are decompressed; any other value is reported
/// as an unsupported-encoding warning and the body is returned opaque.
pub fn decode(body: &[u8], encoding: &str) -> DecodeOutcome {
    match encoding {
        "identity" => DecodeOutcome {
            body: body.to_vec(),
            warning: None,
        },
        "gzip" | "x-gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            match decoder.read_to_end(&mut out) {
                Ok(_) => DecodeOutcome {
                    body: out,
                    warning: None,
                },
                Err(err) => DecodeOutcome {
                    body: body.to_vec(),
                    warning: Some(format!("Decompress error {err}")),
                },
            }
        }
        "deflate" => {
            let mut decoder = flate2::read::DeflateDecoder::new(body);
            let mut out = Vec::new();
            match decoder.read_to_end(&mut out) {
                Ok(_) => DecodeOutcome {
                    body: out,
                    warning: None,
                },
                Err(err) => DecodeOutcome {
                    body: body.to_vec(),
                    warning: Some(format!("Decompress error {err}")),
                },
            }
        }
        other => DecodeOutcome {
            body: body.to_vec(),
            warning: Some(format!("Unsupported content encoding {other:?}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn content_type_strips_parameters_and_lowercases() {
        let h = headers(&[("content-type", "Text/HTML; charset=utf-8")]);
        assert_eq!(content_type(&h).as_deref(), Some("text/html"));
    }

    #[test]
    fn content_encoding_defaults_to_identity() {
        assert_eq!(content_encoding(&HeaderMap::new()), "identity");
    }

    #[test]
    fn persistent_http11_defaults_true() {
        assert!(persistent(&HeaderMap::new(), true));
        let h = headers(&[("connection", "close")]);
        assert!(!persistent(&h, true));
    }

    #[test]
    fn persistent_http10_requires_keep_alive_header() {
        assert!(!persistent(&HeaderMap::new(), false));
        let h = headers(&[("connection", "Keep-Alive")]);
        assert!(persistent(&h, false));
    }

    #[test]
    fn timeout_parses_keep_alive_header() {
        let h = headers(&[("keep-alive", "timeout=15, max=100")]);
        assert_eq!(timeout(&h), 15);
        assert_eq!(timeout(&HeaderMap::new()), DEFAULT_KEEPALIVE_TIMEOUT_SECS);
    }

    #[test]
    fn decode_identity_is_passthrough() {
        let out = decode(b"hello", "identity");
        assert_eq!(out.body, b"hello");
        assert!(out.warning.is_none());
    }

    #[test]
    fn decode_unknown_encoding_warns_and_keeps_body() {
        let out = decode(b"opaque", "br");
        assert_eq!(out.body, b"opaque");
        assert!(out.warning.unwrap().contains("br"));
    }

    #[test]
    fn decode_gzip_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"compressed payload").unwrap();
        let compressed = enc.finish().unwrap();

        let out = decode(&compressed, "gzip");
        assert_eq!(out.body, b"compressed payload");
        assert!(out.warning.is_none());
    }
}
