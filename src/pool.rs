//! Connection pool keyed by `(scheme, host[:port], user, password)`.
//!
//! `reqwest`/`hyper` already keep the real TCP/TLS connections warm
//! beneath a `Client`; what this pool tracks is the *logical* unit the
//! checker reasons about — "is there an idle, not-yet-expired slot for
//! this authority" — matching the source's `get`/`put`/eviction
//! contract so `persistent`/`timeout` bookkeeping behaves identically.
//! See DESIGN.md for why a marker token stands in for a raw socket.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::CheckError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(raw: &str) -> Result<Self, CheckError> {
        match raw {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(CheckError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub authority: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// An opaque idle-slot token. Holding one means "this authority has a
/// warm connection ready to reuse"; there is nothing to read or write
/// on it directly.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    expires_at: Instant,
}

struct Bucket {
    slots: VecDeque<(PoolKey, Connection)>,
}

pub struct ConnectionPool {
    // sharded by host so no single mutex serializes unrelated hosts.
    hosts: Mutex<HashMap<String, Bucket>>,
    capacity_per_host: usize,
}

impl ConnectionPool {
    pub fn new(capacity_per_host: usize) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            capacity_per_host,
        }
    }

    /// Returns an idle connection for `key` if one exists and has not
    /// expired, removing it from the pool for exclusive use.
    pub fn get(&self, key: &PoolKey) -> Option<Connection> {
        let mut hosts = self.hosts.lock();
        let bucket = hosts.get_mut(&key.authority)?;
        let now = Instant::now();
        let pos = bucket.slots.iter().position(|(k, conn)| {
            k == key && conn.expires_at > now
        })?;
        let (_, conn) = bucket.slots.remove(pos).unwrap();
        // drop anything else that expired while we were here
        bucket.slots.retain(|(_, c)| c.expires_at > now);
        Some(conn)
    }

    /// Stores a connection as idle, iff under per-host capacity and
    /// `timeout_secs > 0`. Returns whether it was actually stored.
    pub fn put(&self, key: PoolKey, timeout_secs: u64) -> bool {
        if timeout_secs == 0 {
            return false;
        }
        let mut hosts = self.hosts.lock();
        let bucket = hosts.entry(key.authority.clone()).or_insert_with(|| Bucket {
            slots: VecDeque::new(),
        });
        if bucket.slots.len() >= self.capacity_per_host {
            bucket.slots.pop_front();
        }
        bucket.slots.push_back((
            key,
            Connection {
                expires_at: Instant::now() + Duration::from_secs(timeout_secs),
            },
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> PoolKey {
        PoolKey {
            scheme: Scheme::Http,
            authority: host.to_string(),
            user: None,
            password: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let pool = ConnectionPool::new(5);
        assert!(pool.put(key("h"), 30));
        assert!(pool.get(&key("h")).is_some());
        // removed after get
        assert!(pool.get(&key("h")).is_none());
    }

    #[test]
    fn zero_timeout_is_not_stored() {
        let pool = ConnectionPool::new(5);
        assert!(!pool.put(key("h"), 0));
        assert!(pool.get(&key("h")).is_none());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let pool = ConnectionPool::new(1);
        let k1 = PoolKey {
            authority: "h".to_string(),
            user: Some("a".to_string()),
            ..key("h")
        };
        let k2 = PoolKey {
            authority: "h".to_string(),
            user: Some("b".to_string()),
            ..key("h")
        };
        pool.put(k1.clone(), 30);
        pool.put(k2.clone(), 30);
        assert!(pool.get(&k1).is_none());
        assert!(pool.get(&k2).is_some());
    }

    #[test]
    fn unsupported_scheme_rejected() {
        assert!(Scheme::parse("ftp").is_err());
        assert!(Scheme::parse("http").is_ok());
    }
}
