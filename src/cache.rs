//! The check cache: dedups concurrent checks of the same effective URL,
//! tracks redirect aliases, and memoizes robots.txt decisions. Also the
//! single owner of the connection pool and cookie jar, since every
//! cache operation that touches them needs the same per-bucket
//! synchronization discipline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use reqwest::header::HeaderMap;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;

use crate::cookies::{Cookie, CookieJar};
use crate::descriptor::CheckOutcome;
use crate::error::CookieError;
use crate::pool::{Connection, ConnectionPool, PoolKey};
use crate::robots::{self, RobotsRecord};

/// Everything worth remembering about a finished check, so a waiter or
/// a later alias lookup can adopt it wholesale.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub outcome: CheckOutcome,
    pub info: Vec<String>,
    pub warning: Vec<String>,
    pub aliases: Vec<String>,
}

#[derive(Default)]
struct Slot {
    result: SyncMutex<Option<CachedResult>>,
    notify: Notify,
}

impl Slot {
    fn publish(&self, result: CachedResult) {
        *self.result.lock() = Some(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> CachedResult {
        loop {
            if let Some(result) = self.result.lock().clone() {
                return result;
            }
            self.notify.notified().await;
        }
    }
}

pub enum Reservation {
    /// Caller is first in: it owns the fetch and must call `publish`.
    Owner(Arc<ReservationHandle>),
    /// Someone else already finished (or is finishing) this URL.
    Existing(CachedResult),
}

/// Handle an owner uses to publish its result once the check finishes.
pub struct ReservationHandle {
    key: String,
    slot: Arc<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RobotsKey {
    robots_url: String,
    user: Option<String>,
    password: Option<String>,
}

/// What robots.txt says about one target: whether it's fetchable, and
/// how long to wait between requests to the same host.
#[derive(Debug, Clone, Copy)]
pub struct RobotsDecision {
    pub allowed: bool,
    pub crawl_delay: u64,
}

pub struct CheckCache {
    slots: DashMap<String, Arc<Slot>>,
    redirect_aliases: DashMap<String, String>,
    robots: DashMap<RobotsKey, Arc<OnceCell<Arc<RobotsRecord>>>>,
    pool: ConnectionPool,
    cookies: CookieJar,
    last_access: DashMap<String, Instant>,
}

impl CheckCache {
    pub fn new(max_connections_per_host: usize) -> Self {
        Self {
            slots: DashMap::new(),
            redirect_aliases: DashMap::new(),
            robots: DashMap::new(),
            pool: ConnectionPool::new(max_connections_per_host),
            cookies: CookieJar::new(),
            last_access: DashMap::new(),
        }
    }

    /// Claim `canonical_url`. The first caller becomes the owner and
    /// must eventually call `publish`; later callers block until the
    /// owner publishes, then get the same result.
    pub async fn reserve(&self, canonical_url: &str) -> Reservation {
        // Resolve the entry and drop the shard guard before awaiting
        // anything — holding it across an await would block every other
        // reserve()/publish() on the same shard for as long as we wait.
        let existing_slot = {
            let slot = Arc::new(Slot::default());
            match self.slots.entry(canonical_url.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => Some(existing.get().clone()),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                    None
                }
            }
        };

        match existing_slot {
            Some(slot) => Reservation::Existing(slot.wait().await),
            None => {
                let slot = self.slots.get(canonical_url).unwrap().clone();
                Reservation::Owner(Arc::new(ReservationHandle {
                    key: canonical_url.to_string(),
                    slot,
                }))
            }
        }
    }

    pub fn publish(&self, handle: &ReservationHandle, result: CachedResult) {
        for alias in &result.aliases {
            self.redirect_aliases
                .insert(alias.clone(), handle.key.clone());
        }
        handle.slot.publish(result);
    }

    /// If `alias` is already a known canonical URL (checked or being
    /// checked by someone else), return its result so the caller can
    /// adopt it instead of re-fetching.
    pub async fn checked_redirect(&self, alias: &str) -> Option<CachedResult> {
        let canonical = self
            .redirect_aliases
            .get(alias)
            .map(|v| v.clone())
            .unwrap_or_else(|| alias.to_string());
        let slot = self.slots.get(&canonical)?.clone();
        Some(slot.wait().await)
    }

    /// Memoized robots.txt lookup for `target_url`, fetching at most
    /// once per (robots_url, user, password) for the whole run. Reports
    /// both the fetch decision and the crawl-delay the record declares
    /// for `agent`.
    pub async fn robots_decision(
        &self,
        client: &reqwest::Client,
        robots_url: &str,
        target_url: &str,
        agent: &str,
        credentials: Option<(&str, &str)>,
    ) -> RobotsDecision {
        let key = RobotsKey {
            robots_url: robots_url.to_string(),
            user: credentials.map(|(u, _)| u.to_string()),
            password: credentials.map(|(_, p)| p.to_string()),
        };
        let once = self
            .robots
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let record = once
            .get_or_init(|| async {
                Arc::new(robots::fetch(client, robots_url, agent, credentials).await)
            })
            .await;
        RobotsDecision {
            allowed: record.can_fetch(agent, target_url),
            crawl_delay: record.get_crawldelay(agent),
        }
    }

    /// Memoized robots.txt decision for `target_url`. Convenience
    /// wrapper over [`Self::robots_decision`] for callers that don't
    /// need the crawl delay.
    pub async fn robots_allows(
        &self,
        client: &reqwest::Client,
        robots_url: &str,
        target_url: &str,
        agent: &str,
        credentials: Option<(&str, &str)>,
    ) -> bool {
        self.robots_decision(client, robots_url, target_url, agent, credentials)
            .await
            .allowed
    }

    /// Blocks the caller until at least `delay_secs` have passed since
    /// the last request this cache dispatched to `host`, then records
    /// the new access time. A no-op when `delay_secs` is zero.
    pub async fn respect_crawl_delay(&self, host: &str, delay_secs: u64) {
        if delay_secs == 0 {
            return;
        }
        let delay = Duration::from_secs(delay_secs);
        let wait = match self.last_access.get(host) {
            Some(last) => delay.checked_sub(last.elapsed()),
            None => None,
        };
        if let Some(remaining) = wait {
            tokio::time::sleep(remaining).await;
        }
        self.last_access.insert(host.to_string(), Instant::now());
    }

    pub fn get_connection(&self, key: &PoolKey) -> Option<Connection> {
        self.pool.get(key)
    }

    pub fn add_connection(&self, key: PoolKey, timeout_secs: u64) -> bool {
        self.pool.put(key, timeout_secs)
    }

    pub fn store_cookies(&self, headers: &HeaderMap, host: &str) -> Vec<CookieError> {
        self.cookies.store(headers, host)
    }

    pub fn get_cookies(&self, host: &str, path: &str) -> Vec<Cookie> {
        self.cookies.get(host, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result() -> CachedResult {
        CachedResult {
            outcome: CheckOutcome::Valid("200 OK".to_string()),
            info: vec![],
            warning: vec![],
            aliases: vec!["http://h/alias".to_string()],
        }
    }

    #[tokio::test]
    async fn second_reserve_waits_for_first_publish() {
        let cache = CheckCache::new(5);
        let owner = match cache.reserve("http://h/x").await {
            Reservation::Owner(handle) => handle,
            Reservation::Existing(_) => panic!("expected owner"),
        };

        let cache_ref = &cache;
        let waiter = async {
            match cache_ref.reserve("http://h/x").await {
                Reservation::Existing(result) => result,
                Reservation::Owner(_) => panic!("expected existing"),
            }
        };

        let publish = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cache.publish(&owner, ok_result());
        };

        let (result, _) = tokio::join!(waiter, publish);
        assert_eq!(result.outcome, CheckOutcome::Valid("200 OK".to_string()));
    }

    #[tokio::test]
    async fn checked_redirect_resolves_through_alias_map() {
        let cache = CheckCache::new(5);
        let owner = match cache.reserve("http://h/x").await {
            Reservation::Owner(handle) => handle,
            _ => unreachable!(),
        };
        cache.publish(&owner, ok_result());

        let via_alias = cache.checked_redirect("http://h/alias").await;
        assert!(via_alias.is_some());
        assert_eq!(
            via_alias.unwrap().outcome,
            CheckOutcome::Valid("200 OK".to_string())
        );

        assert!(cache.checked_redirect("http://h/never-seen").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn respect_crawl_delay_sleeps_out_the_remainder() {
        let cache = CheckCache::new(5);
        let start = tokio::time::Instant::now();

        cache.respect_crawl_delay("slow.example", 2).await;
        cache.respect_crawl_delay("slow.example", 2).await;

        assert!(start.elapsed() >= std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn respect_crawl_delay_is_a_noop_at_zero() {
        let cache = CheckCache::new(5);
        let start = std::time::Instant::now();
        cache.respect_crawl_delay("fast.example", 0).await;
        cache.respect_crawl_delay("fast.example", 0).await;
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn robots_fetched_once_per_key() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("User-agent: *\nDisallow: /private/\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = CheckCache::new(5);
        let client = reqwest::Client::new();
        let robots_url = format!("{}/robots.txt", server.uri());

        for _ in 0..5 {
            let allowed = cache
                .robots_allows(&client, &robots_url, "http://h/private/x", "bot", None)
                .await;
            assert!(!allowed);
        }
    }
}
