//! The HTTP URL checker: the per-URL state machine that drives
//! HEAD/GET fallback, redirect following, auth challenge, anchor
//! retry and proxy enforcement to a terminal classification.
//!
//! `send_request` returns an explicit `SendOutcome` tag instead of
//! raising mid-loop (the source catches `BadStatusLine` inline); the
//! state machine below dispatches on the tag, per the re-architecture
//! recorded in DESIGN.md.

use std::sync::OnceLock;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::HeaderMap;
use url::Url;

use crate::cache::{CachedResult, Reservation};
use crate::collaborators::{DomainFilter, Extractor, SchemeRegistry};
use crate::descriptor::{canonicalize, CheckOutcome, Method, UrlDescriptor};
use crate::error::CheckError;
use crate::pool::{PoolKey, Scheme};
use crate::session::Session;

/// Amazon blocks all HEAD requests.
fn amazon_host() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^www\.amazon\.(com|de|ca|fr|co\.(uk|jp))").unwrap())
}

#[derive(Debug, Clone)]
pub struct StatusAndHeaders {
    pub status: reqwest::StatusCode,
    pub headers: HeaderMap,
}

enum SendOutcome {
    Response(StatusAndHeaders),
    /// Empty/malformed response from a server that can't be bothered
    /// with HEAD — the original's `BadStatusLine` path.
    RetryAsGet,
    Fatal(CheckError),
}

enum RedirectOutcome {
    /// The redirect handler already set a terminal result (external
    /// filter, robots denial, cycle resolved by cache, scheme change).
    Finalized,
    Continue(u32, StatusAndHeaders),
    RetryAsGet,
    Fatal(CheckError),
}

fn authority(url: &Url) -> String {
    match url.port() {
        Some(p) => format!("{}:{}", url.host_str().unwrap_or_default(), p),
        None => url.host_str().unwrap_or_default().to_string(),
    }
}

fn userinfo_header(url: &Url) -> Option<String> {
    let user = url.username();
    if user.is_empty() {
        return None;
    }
    let password = url.password().unwrap_or("");
    Some(format!(
        "Basic {}",
        BASE64.encode(format!("{user}:{password}"))
    ))
}

fn pool_key_for(
    url: &Url,
    credentials: &Option<(String, String)>,
) -> Result<PoolKey, CheckError> {
    Ok(PoolKey {
        scheme: Scheme::parse(url.scheme())?,
        authority: authority(url),
        user: credentials.as_ref().map(|(u, _)| u.clone()),
        password: credentials.as_ref().map(|(_, p)| p.clone()),
    })
}

fn build_client(session: &Session, proxy: Option<&str>) -> Result<reqwest::Client, CheckError> {
    match proxy {
        None => Ok(session.client.clone()),
        Some(authority) => {
            let proxy_url = format!("http://{authority}");
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|err| CheckError::Transport(err.to_string()))?;
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(session.config.timeout)
                .connect_timeout(Duration::from_secs(30))
                .proxy(proxy)
                .build()
                .map_err(|err| CheckError::Transport(err.to_string()))
        }
    }
}

/// Looks like the empty-body/malformed-status response the source
/// catches as `httplib.BadStatusLine`: the connection was cut before a
/// real response arrived.
fn looks_like_bad_status_line(err: &reqwest::Error) -> bool {
    err.is_request() || err.is_connect() || err.is_body()
}

async fn send_request(
    descriptor: &mut UrlDescriptor,
    session: &Session,
    proxy: Option<&str>,
    auth: Option<&str>,
) -> SendOutcome {
    let client = match build_client(session, proxy) {
        Ok(c) => c,
        Err(err) => return SendOutcome::Fatal(err),
    };

    let mut target = descriptor.url.clone();
    if descriptor.no_anchor {
        target.set_fragment(None);
    }

    // Touch the pool so an idle slot for this authority, if any, is
    // accounted for as reused; we don't hold a raw socket to hand back.
    let credentials = session
        .config
        .credentials_for(descriptor.url.host_str().unwrap_or_default());
    if let Ok(key) = pool_key_for(&descriptor.url, &credentials) {
        if session.cache.get_connection(&key).is_some() {
            tracing::debug!(url = %descriptor.url, "reusing pooled connection slot");
        }
    }

    let mut builder = client.request(descriptor.method.as_reqwest(), target);
    builder = builder.header(reqwest::header::HOST, authority(&descriptor.url));

    if let Some(userinfo) = userinfo_header(&descriptor.url) {
        builder = builder.header(reqwest::header::AUTHORIZATION, userinfo);
    } else if let Some(auth) = auth {
        builder = builder.header(reqwest::header::AUTHORIZATION, auth);
    }
    if let Some(parent) = &descriptor.parent_url {
        if parent.starts_with("http://") {
            builder = builder.header(reqwest::header::REFERER, parent.clone());
        }
    }
    builder = builder.header(reqwest::header::USER_AGENT, &session.config.user_agent);
    builder = builder.header(
        reqwest::header::ACCEPT_ENCODING,
        "gzip;q=1.0, deflate;q=0.9, identity;q=0.5",
    );

    if session.config.cookies {
        let host = descriptor.url.host_str().unwrap_or_default();
        for cookie in session.cache.get_cookies(host, descriptor.url.path()) {
            builder = builder.header(reqwest::header::COOKIE, cookie.header_pair());
        }
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status();
            let headers = response.headers().clone();
            descriptor.persistent = crate::headers::persistent(
                &headers,
                response.version() == reqwest::Version::HTTP_11,
            );
            descriptor.headers = Some(headers.clone());
            SendOutcome::Response(StatusAndHeaders { status, headers })
        }
        Err(err) => {
            if looks_like_bad_status_line(&err) && descriptor.method == Method::Head {
                SendOutcome::RetryAsGet
            } else {
                SendOutcome::Fatal(CheckError::Transport(err.to_string()))
            }
        }
    }
}

async fn follow_redirects(
    descriptor: &mut UrlDescriptor,
    session: &Session,
    domain_filter: &dyn DomainFilter,
    extractor: &dyn Extractor,
    scheme_registry: &dyn SchemeRegistry,
    mut response: StatusAndHeaders,
    proxy: Option<&str>,
    auth: Option<&str>,
) -> RedirectOutcome {
    let max_redirects = session.config.max_redirects;
    let mut tries = 0u32;

    loop {
        let status = response.status.as_u16();
        if !(status == 301 || status == 302) || tries >= max_redirects {
            break;
        }
        let Some(location) = response
            .headers
            .get(reqwest::header::LOCATION)
            .or_else(|| response.headers.get("uri"))
            .and_then(|v| v.to_str().ok())
        else {
            break;
        };
        let Ok(new_url) = descriptor.url.join(location) else {
            break;
        };
        descriptor.add_info(format!("Redirected to {new_url}."));

        if domain_filter.is_external(&new_url) {
            descriptor.add_info("Outside of domain filter, checked only syntax.");
            descriptor.set_result(CheckOutcome::SyntaxOnly(
                "outside of domain filter".to_string(),
            ));
            return RedirectOutcome::Finalized;
        }

        let host = new_url.host_str().unwrap_or_default().to_string();
        let robots_url = format!("{}://{}/robots.txt", new_url.scheme(), authority(&new_url));
        let credentials = session.config.credentials_for(&host);
        let decision = session
            .cache
            .robots_decision(
                &session.client,
                &robots_url,
                new_url.as_str(),
                &session.config.user_agent,
                credentials
                    .as_ref()
                    .map(|(u, p)| (u.as_str(), p.as_str())),
            )
            .await;
        if !decision.allowed {
            descriptor.add_warning("Access denied by robots.txt, checked only syntax.");
            descriptor.set_result(CheckOutcome::SyntaxOnly(
                "denied by robots.txt".to_string(),
            ));
            return RedirectOutcome::Finalized;
        }
        session
            .cache
            .respect_crawl_delay(&host, decision.crawl_delay)
            .await;

        let canonical = canonicalize(&new_url);
        let all_seen = descriptor.all_seen();
        if all_seen.contains(&canonical) {
            if descriptor.method == Method::Head {
                return RedirectOutcome::RetryAsGet;
            }
            let mut chain = all_seen;
            chain.push(canonical);
            return RedirectOutcome::Fatal(CheckError::Redirect(format!(
                "recursive redirection encountered: {}",
                chain.join(" => ")
            )));
        }
        descriptor.aliases.push(canonical.clone());
        descriptor.url = new_url.clone();

        if status == 301 && !descriptor.has301 {
            descriptor.add_warning(
                "HTTP 301 (moved permanent) encountered: you should update this link.",
            );
            if !(descriptor.original_url.ends_with('/') || descriptor.original_url.ends_with(".html"))
            {
                descriptor.add_warning(
                    "A HTTP 301 redirection occured and the URL has no trailing / at the \
                     end. All URLs which point to (home) directories should end with a / \
                     to avoid redirection.",
                );
            }
            descriptor.has301 = true;
        }

        if let Some(cached) = session.cache.checked_redirect(&canonical).await {
            adopt_cached(descriptor, cached);
            return RedirectOutcome::Finalized;
        }

        if new_url.scheme() != "http" {
            descriptor.add_warning(format!(
                "HTTP redirection to non-http url encountered; the original url was {:?}.",
                descriptor.original_url
            ));
            if let Ok(mut new_descriptor) = scheme_registry.get_url_from(
                new_url.as_str(),
                descriptor.depth,
                descriptor.parent_url.as_deref(),
                descriptor.line,
                descriptor.column,
                descriptor.name.as_deref(),
            ) {
                new_descriptor.warning = descriptor.warning.clone();
                new_descriptor.info = descriptor.info.clone();
                extractor.enqueue(new_descriptor);
            }
            descriptor.set_result(CheckOutcome::SyntaxOnly(
                "redirected to a non-http scheme".to_string(),
            ));
            return RedirectOutcome::Finalized;
        }

        response = match send_request(descriptor, session, proxy, auth).await {
            SendOutcome::Response(r) => r,
            SendOutcome::RetryAsGet => return RedirectOutcome::RetryAsGet,
            SendOutcome::Fatal(err) => return RedirectOutcome::Fatal(err),
        };
        tries += 1;
    }

    RedirectOutcome::Continue(tries, response)
}

fn adopt_cached(descriptor: &mut UrlDescriptor, cached: CachedResult) {
    descriptor.info.extend(cached.info);
    descriptor.warning.extend(cached.warning);
    descriptor.aliases.extend(cached.aliases);
    descriptor.result = Some(cached.outcome);
}

fn finalize(descriptor: &mut UrlDescriptor, session: &Session, response: &StatusAndHeaders, fallback_get: bool) {
    let status = response.status;
    if status.as_u16() >= 400 {
        descriptor.set_result(CheckOutcome::Invalid(
            CheckError::http_failure(status).to_string(),
        ));
        return;
    }

    let server = descriptor
        .headers
        .as_ref()
        .and_then(|h| h.get(reqwest::header::SERVER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    // any warning accumulated over the whole check — not just ones
    // raised in this function — downgrades the outcome.
    let mut warned = !descriptor.warning.is_empty();
    if fallback_get {
        descriptor.add_warning(format!(
            "Server {server:?} did not support HEAD request, used GET for checking."
        ));
        warned = true;
    }
    if descriptor.no_anchor {
        descriptor.add_warning(format!(
            "Server {server:?} had no anchor support, removed anchor from request."
        ));
        warned = true;
    }
    if status.as_u16() == 204 {
        descriptor.add_warning(status.canonical_reason().unwrap_or("No Content").to_string());
        warned = true;
    }

    if session.config.cookies {
        if let Some(headers) = &descriptor.headers {
            let host = descriptor.url.host_str().unwrap_or_default().to_string();
            for err in session.cache.store_cookies(headers, &host) {
                descriptor.add_warning(format!("Could not store cookies: {err}."));
                warned = true;
            }
        }
    }

    if let Some(headers) = &descriptor.headers {
        if let Some(modified) = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
        {
            descriptor.add_info(format!("Last modified {modified}."));
        }
    }

    let result_text = if status.as_u16() >= 200 {
        format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or(""))
    } else {
        "OK".to_string()
    };

    if warned {
        descriptor.set_result(CheckOutcome::ValidWithWarnings(result_text));
    } else {
        descriptor.set_result(CheckOutcome::Valid(result_text));
    }
}

/// Drive `descriptor` through the full HTTP state machine, mutating it
/// in place to a terminal `CheckOutcome`. Never panics on recognized
/// conditions; unrecognized transport failures become `Invalid`.
#[tracing::instrument(skip(session, domain_filter, extractor, scheme_registry), fields(url = %descriptor.url))]
pub async fn check(
    descriptor: &mut UrlDescriptor,
    session: &Session,
    domain_filter: &dyn DomainFilter,
    extractor: &dyn Extractor,
    scheme_registry: &dyn SchemeRegistry,
) {
    descriptor.headers = None;
    let mut auth: Option<String> = None;

    let host = descriptor.url.host_str().unwrap_or_default().to_string();
    let scheme = descriptor.url.scheme().to_string();
    let mut proxy = session.config.proxy_for(&scheme);
    let credentials = session.config.credentials_for(&host);

    let robots_url = format!("{scheme}://{}/robots.txt", authority(&descriptor.url));
    let decision = session
        .cache
        .robots_decision(
            &session.client,
            &robots_url,
            descriptor.url.as_str(),
            &session.config.user_agent,
            credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str())),
        )
        .await;
    if !decision.allowed {
        descriptor.add_warning("Access denied by robots.txt, checked only syntax.");
        descriptor.set_result(CheckOutcome::SyntaxOnly("denied by robots.txt".to_string()));
        return;
    }
    session
        .cache
        .respect_crawl_delay(&host, decision.crawl_delay)
        .await;

    if amazon_host().is_match(&host) {
        descriptor.add_warning("Amazon servers block HTTP HEAD requests, using GET instead.");
        descriptor.method = Method::Get;
    } else {
        descriptor.method = Method::Head;
    }

    let mut fallback_get = false;

    loop {
        let mut response = match send_request(descriptor, session, proxy.as_deref(), auth.as_deref()).await {
            SendOutcome::Response(r) => r,
            SendOutcome::RetryAsGet => {
                descriptor.method = Method::Get;
                descriptor.aliases.clear();
                fallback_get = true;
                continue;
            }
            SendOutcome::Fatal(err) => {
                descriptor.set_result(CheckOutcome::Invalid(err.to_string()));
                return;
            }
        };

        if response.status.as_u16() == 305 && descriptor.headers.is_some() {
            let new_proxy = response
                .headers
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            descriptor.add_info(format!("Enforced proxy {new_proxy:?}."));
            if new_proxy.as_deref().map(str::is_empty).unwrap_or(true) {
                descriptor.set_result(CheckOutcome::Invalid(
                    CheckError::EnforcedProxyEmpty(new_proxy).to_string(),
                ));
                return;
            }
            let old_proxy = proxy.clone();
            proxy = new_proxy;
            response = match send_request(descriptor, session, proxy.as_deref(), auth.as_deref()).await {
                SendOutcome::Response(r) => r,
                SendOutcome::RetryAsGet => {
                    proxy = old_proxy;
                    descriptor.method = Method::Get;
                    descriptor.aliases.clear();
                    fallback_get = true;
                    continue;
                }
                SendOutcome::Fatal(err) => {
                    descriptor.set_result(CheckOutcome::Invalid(err.to_string()));
                    return;
                }
            };
            // the enforced proxy applies only to this exchange.
            proxy = old_proxy;
        }

        let (tries, response) = match follow_redirects(
            descriptor,
            session,
            domain_filter,
            extractor,
            scheme_registry,
            response,
            proxy.as_deref(),
            auth.as_deref(),
        )
        .await
        {
            RedirectOutcome::Finalized => return,
            RedirectOutcome::Continue(tries, response) => (tries, response),
            RedirectOutcome::RetryAsGet => {
                descriptor.method = Method::Get;
                descriptor.aliases.clear();
                fallback_get = true;
                continue;
            }
            RedirectOutcome::Fatal(err) => {
                descriptor.set_result(CheckOutcome::Invalid(err.to_string()));
                return;
            }
        };

        if tries >= session.config.max_redirects {
            if descriptor.method == Method::Head {
                descriptor.method = Method::Get;
                descriptor.aliases.clear();
                fallback_get = true;
                continue;
            }
            descriptor.set_result(CheckOutcome::Invalid(format!(
                "more than {} redirections, aborting",
                session.config.max_redirects
            )));
            return;
        }

        let status = response.status.as_u16();
        if status == 401 && auth.is_none() {
            let (user, password) = credentials.clone().unwrap_or_default();
            auth = Some(format!("Basic {}", BASE64.encode(format!("{user}:{password}"))));
            continue;
        } else if status >= 400 {
            let has_fragment = descriptor.url.fragment().is_some();
            if descriptor.headers.is_some() && has_fragment && !descriptor.no_anchor {
                descriptor.no_anchor = true;
                continue;
            }
            if descriptor.method == Method::Head {
                descriptor.method = Method::Get;
                descriptor.aliases.clear();
                fallback_get = true;
                continue;
            }
        } else if descriptor.headers.is_some() && descriptor.method == Method::Head {
            if let Some(headers) = &descriptor.headers {
                let mime = crate::headers::content_type(headers);
                let powered_by = headers
                    .get("x-powered-by")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let server = headers
                    .get(reqwest::header::SERVER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if mime.as_deref() == Some("application/octet-stream")
                    && (powered_by.starts_with("Zope") || server.starts_with("Zope"))
                {
                    descriptor.method = Method::Get;
                    descriptor.aliases.clear();
                    fallback_get = true;
                    continue;
                }
            }
        }

        finalize(descriptor, session, &response, fallback_get);
        return;
    }
}

/// `check`, wrapped with the cache's at-most-once-per-canonical-URL
/// reservation so concurrent workers checking the same effective URL
/// (directly or via an alias) share one fetch.
pub async fn check_deduped(
    mut descriptor: UrlDescriptor,
    session: &Session,
    domain_filter: &dyn DomainFilter,
    extractor: &dyn Extractor,
    scheme_registry: &dyn SchemeRegistry,
) -> UrlDescriptor {
    match session.cache.reserve(&descriptor.cache_key).await {
        Reservation::Existing(cached) => {
            adopt_cached(&mut descriptor, cached);
            descriptor
        }
        Reservation::Owner(handle) => {
            check(&mut descriptor, session, domain_filter, extractor, scheme_registry).await;
            let result = CachedResult {
                outcome: descriptor.result.clone().unwrap_or(CheckOutcome::Aborted),
                info: descriptor.info.clone(),
                warning: descriptor.warning.clone(),
                aliases: descriptor.aliases.clone(),
            };
            session.cache.publish(&handle, result);
            descriptor
        }
    }
}

/// Force-fetch and decompress the body, for the (out-of-scope)
/// extractor to parse. Only this path ever sets `has_content`, so only
/// URLs actually read to completion are eligible for connection reuse.
pub async fn get_content(descriptor: &mut UrlDescriptor, session: &Session) -> Result<Bytes, CheckError> {
    if descriptor.has_content {
        return Ok(descriptor.body.clone().unwrap_or_default());
    }
    descriptor.method = Method::Get;

    let response = session
        .client
        .request(Method::Get.as_reqwest(), descriptor.url.clone())
        .header(reqwest::header::USER_AGENT, &session.config.user_agent)
        .header(
            reqwest::header::ACCEPT_ENCODING,
            "gzip;q=1.0, deflate;q=0.9, identity;q=0.5",
        )
        .send()
        .await
        .map_err(|err| CheckError::Transport(err.to_string()))?;

    let headers = response.headers().clone();
    let persistent =
        crate::headers::persistent(&headers, response.version() == reqwest::Version::HTTP_11);
    let timeout_secs = crate::headers::timeout(&headers);
    let raw = response
        .bytes()
        .await
        .map_err(|err| CheckError::Transport(err.to_string()))?;
    let encoding = crate::headers::content_encoding(&headers);
    let decoded = crate::headers::decode(&raw, &encoding);
    if let Some(warning) = decoded.warning {
        descriptor.add_warning(warning);
    }

    descriptor.headers = Some(headers);
    descriptor.persistent = persistent;
    descriptor.body = Some(Bytes::from(decoded.body));
    descriptor.has_content = true;

    if persistent {
        let credentials = session
            .config
            .credentials_for(descriptor.url.host_str().unwrap_or_default());
        if let Ok(key) = pool_key_for(&descriptor.url, &credentials) {
            session.cache.add_connection(key, timeout_secs);
        }
    }

    Ok(descriptor.body.clone().unwrap())
}
