use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

/// Caps concurrent requests per host.
///
/// reqwest pools connections but never refuses to open more, so the cap is
/// enforced here: a fetch holds a permit for its host until its body is drained.
#[derive(Debug)]
pub struct HostLimiter {
    limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    /// `limit == 0` disables limiting.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, url: &str) -> Option<OwnedSemaphorePermit> {
        if self.limit == 0 {
            return None;
        }
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_default();
        let semaphore = {
            let mut hosts = self.hosts.lock();
            Arc::clone(
                hosts
                    .entry(host)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
            )
        };
        semaphore.acquire_owned().await.ok()
    }
}
