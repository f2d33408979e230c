//! The value every check borrows instead of reaching into globals:
//! configuration, the shared `reqwest::Client`, and the caches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::CheckCache;
use crate::checker::check_deduped;
use crate::collaborators::{DomainFilter, Extractor, SchemeRegistry};
use crate::config::Config;
use crate::descriptor::UrlDescriptor;

pub struct Session {
    pub config: Config,
    pub client: reqwest::Client,
    pub cache: CheckCache,
}

impl Session {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let cache = CheckCache::new(config.max_connections_per_host);
        Ok(Session {
            config,
            client,
            cache,
        })
    }
}

/// Bounds how many checks run at once, globally and per host, and lets
/// a caller stop an in-flight run cleanly.
pub struct WorkerPool {
    global: Arc<Semaphore>,
    per_host: SyncMutex<HashMap<String, Arc<Semaphore>>>,
    per_host_limit: usize,
    cancellation: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, per_host_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent)),
            per_host: SyncMutex::new(HashMap::new()),
            per_host_limit,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_concurrent, config.max_concurrent_per_host)
    }

    /// Clone to hand to whatever triggers a shutdown; calling `cancel()`
    /// on it stops `run` from picking up further work.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.per_host
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// Pulls descriptors off `queue` until it closes or `cancellation()`
    /// fires, checking each one under the global and per-host
    /// concurrency ceilings, and returns every descriptor that finished.
    pub async fn run(
        &self,
        session: Arc<Session>,
        mut queue: mpsc::Receiver<UrlDescriptor>,
        domain_filter: Arc<dyn DomainFilter>,
        extractor: Arc<dyn Extractor>,
        scheme_registry: Arc<dyn SchemeRegistry>,
    ) -> Vec<UrlDescriptor> {
        let mut tasks = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                received = queue.recv() => {
                    let Some(descriptor) = received else { break };
                    let host = descriptor.url.host_str().unwrap_or_default().to_string();
                    let Ok(global_permit) = self.global.clone().acquire_owned().await else {
                        break;
                    };
                    let Ok(host_permit) = self.host_semaphore(&host).acquire_owned().await else {
                        continue;
                    };
                    let session = session.clone();
                    let domain_filter = domain_filter.clone();
                    let extractor = extractor.clone();
                    let scheme_registry = scheme_registry.clone();
                    tasks.spawn(async move {
                        let _global_permit = global_permit;
                        let _host_permit = host_permit;
                        check_deduped(
                            descriptor,
                            &session,
                            domain_filter.as_ref(),
                            extractor.as_ref(),
                            scheme_registry.as_ref(),
                        )
                        .await
                    });
                }
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(descriptor) = joined {
                results.push(descriptor);
            }
        }
        results
    }
}
