//! Versioned per-type resource cache with blocking-wait registration.
//!
//! Each resource family (CDS, RDS, LDS, SDS, EDS) has one cache. The
//! rebuild path replaces the full resource set and bumps a monotonic
//! version; stream workers register with the version they last sent and
//! either get the current contents immediately (the client is behind) or
//! park on a oneshot that fires on the next update.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::xds::BuiltResource;

/// An immutable view of one cache generation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub version: u64,
    pub resources: Arc<Vec<BuiltResource>>,
}

/// Outcome of registering interest in a cache.
pub enum Registration {
    /// The cache already holds something newer than the caller has seen.
    Ready(CacheEntry),
    /// The caller is up to date; the receiver fires on the next change.
    Wait(oneshot::Receiver<()>),
}

struct Inner {
    version: u64,
    resources: Arc<Vec<BuiltResource>>,
    waiters: Vec<oneshot::Sender<()>>,
}

pub struct ResourceCache {
    type_url: &'static str,
    inner: Mutex<Inner>,
}

impl ResourceCache {
    pub fn new(type_url: &'static str) -> Self {
        Self {
            type_url,
            inner: Mutex::new(Inner {
                version: 0,
                resources: Arc::new(Vec::new()),
                waiters: Vec::new(),
            }),
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    /// Replace the cache contents, advance the version and wake every
    /// parked waiter, even when the resource set is unchanged. Callers
    /// that want no-op suppression compare against [`entry`](Self::entry)
    /// first. Returns the version now held.
    pub fn update(&self, resources: Vec<BuiltResource>) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.version += 1;
        inner.resources = Arc::new(resources);
        let version = inner.version;
        debug!(
            type_url = %self.type_url,
            version,
            resource_count = inner.resources.len(),
            "Resource cache updated"
        );
        for waiter in inner.waiters.drain(..) {
            // A dropped receiver just means the stream went away first.
            let _ = waiter.send(());
        }
        version
    }

    /// Register interest relative to the version the caller last sent.
    /// Version 0 means a fresh stream: it still waits until the first
    /// compile has populated the cache rather than sending an empty set.
    pub fn register(&self, last_sent: u64) -> Registration {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.version > last_sent && inner.version > 0 {
            return Registration::Ready(CacheEntry {
                version: inner.version,
                resources: Arc::clone(&inner.resources),
            });
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);
        Registration::Wait(rx)
    }

    /// Current contents without registering a waiter.
    pub fn entry(&self) -> CacheEntry {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheEntry { version: inner.version, resources: Arc::clone(&inner.resources) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use crate::xds::CLUSTER_TYPE_URL;

    fn resource(name: &str) -> BuiltResource {
        BuiltResource::new(
            name,
            CLUSTER_TYPE_URL,
            &Cluster { name: name.to_string(), ..Default::default() },
        )
    }

    #[test]
    fn update_bumps_version_and_register_sees_it() {
        let cache = ResourceCache::new(CLUSTER_TYPE_URL);
        assert_eq!(cache.update(vec![resource("a")]), 1);

        match cache.register(0) {
            Registration::Ready(entry) => {
                assert_eq!(entry.version, 1);
                assert_eq!(entry.resources.len(), 1);
            }
            Registration::Wait(_) => panic!("cache has content, registration must be ready"),
        }
    }

    #[test]
    fn up_to_date_client_parks() {
        let cache = ResourceCache::new(CLUSTER_TYPE_URL);
        cache.update(vec![resource("a")]);
        assert!(matches!(cache.register(1), Registration::Wait(_)));
    }

    #[test]
    fn fresh_stream_blocks_on_empty_cache() {
        let cache = ResourceCache::new(CLUSTER_TYPE_URL);
        assert!(matches!(cache.register(0), Registration::Wait(_)));
    }

    #[test]
    fn identical_update_still_bumps_and_wakes() {
        let cache = ResourceCache::new(CLUSTER_TYPE_URL);
        assert_eq!(cache.update(vec![resource("a")]), 1);

        let Registration::Wait(rx) = cache.register(1) else {
            panic!("client at current version must park");
        };
        // Content-identical update: version still advances and the waiter
        // still fires; suppression is the rebuild path's job.
        assert_eq!(cache.update(vec![resource("a")]), 2);
        assert!(rx.blocking_recv().is_ok());
    }

    #[tokio::test]
    async fn parked_waiter_fires_on_change() {
        let cache = Arc::new(ResourceCache::new(CLUSTER_TYPE_URL));
        cache.update(vec![resource("a")]);

        let Registration::Wait(rx) = cache.register(1) else {
            panic!("client at current version must park");
        };

        let cache2 = Arc::clone(&cache);
        tokio::spawn(async move {
            cache2.update(vec![resource("b")]);
        });

        rx.await.expect("waiter must be woken by the update");
        let entry = cache.entry();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.resources[0].name, "b");
    }
}
