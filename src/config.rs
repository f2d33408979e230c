//! Session configuration.
//!
//! A plain value threaded through every check by reference. Nothing in
//! this crate reads it from disk or the environment — loading a
//! `Config` from a file is the front-end's job (out of scope here).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Per-realm (host) basic-auth credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `scheme -> "host:port"`, e.g. `"http" -> "proxy.example:3128"`.
    #[serde(default)]
    pub proxy: HashMap<String, String>,

    /// Whether to store and send cookies at all.
    #[serde(default = "Config::default_cookies")]
    pub cookies: bool,

    #[serde(default = "Config::default_user_agent")]
    pub user_agent: String,

    #[serde(default = "Config::default_max_redirects")]
    pub max_redirects: u32,

    #[serde(with = "humantime_secs", default = "Config::default_timeout")]
    pub timeout: Duration,

    /// Basic-auth credentials keyed by host.
    #[serde(default)]
    pub auth: HashMap<String, Credentials>,

    /// Max idle connections kept per (scheme, host, user, password) key.
    #[serde(default = "Config::default_max_per_host")]
    pub max_connections_per_host: usize,

    /// Global cap on checks running at once.
    #[serde(default = "Config::default_max_concurrent")]
    pub max_concurrent: usize,

    /// Cap on checks running at once against a single host.
    #[serde(default = "Config::default_max_concurrent_per_host")]
    pub max_concurrent_per_host: usize,
}

impl Config {
    fn default_cookies() -> bool {
        true
    }

    fn default_user_agent() -> String {
        "httpcheck-core/0.1".to_string()
    }

    fn default_max_redirects() -> u32 {
        5
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_max_per_host() -> usize {
        5
    }

    fn default_max_concurrent() -> usize {
        50
    }

    fn default_max_concurrent_per_host() -> usize {
        5
    }

    pub fn proxy_for(&self, scheme: &str) -> Option<String> {
        self.proxy.get(scheme).cloned()
    }

    pub fn credentials_for(&self, host: &str) -> Option<(String, String)> {
        self.auth
            .get(host)
            .map(|c| (c.user.clone(), c.password.clone()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: HashMap::new(),
            cookies: Self::default_cookies(),
            user_agent: Self::default_user_agent(),
            max_redirects: Self::default_max_redirects(),
            timeout: Self::default_timeout(),
            auth: HashMap::new(),
            max_connections_per_host: Self::default_max_per_host(),
            max_concurrent: Self::default_max_concurrent(),
            max_concurrent_per_host: Self::default_max_concurrent_per_host(),
        }
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
