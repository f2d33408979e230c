//! Interfaces the checking core consumes but does not implement:
//! scheme dispatch, link extraction, and the domain filter all live in
//! the out-of-scope front-end/scheduler. The core only needs to call
//! them, so they are trait objects threaded through `check()`.

use url::Url;

use crate::descriptor::UrlDescriptor;

/// Accepts newly discovered `UrlDescriptor`s, e.g. ones produced by a
/// scheme-change redirect (http -> https/ftp/mailto).
pub trait Extractor: Send + Sync {
    fn enqueue(&self, descriptor: UrlDescriptor);
}

/// Builds a `UrlDescriptor` for an arbitrary scheme, used when a
/// redirect leaves http/https behind.
pub trait SchemeRegistry: Send + Sync {
    fn get_url_from(
        &self,
        url: &str,
        depth: u32,
        parent_url: Option<&str>,
        line: Option<u32>,
        column: Option<u32>,
        name: Option<&str>,
    ) -> anyhow::Result<UrlDescriptor>;
}

/// Whether a URL is in-scope for recursion. The checker consults this
/// on every redirect hop, not just the seed URL.
pub trait DomainFilter: Send + Sync {
    fn is_external(&self, url: &Url) -> bool;
}

/// A filter that never excludes anything, for callers that don't
/// restrict recursion by domain.
pub struct AllowAll;

impl DomainFilter for AllowAll {
    fn is_external(&self, _url: &Url) -> bool {
        false
    }
}
