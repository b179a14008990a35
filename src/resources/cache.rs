//! At-most-once physical loading.
//!
//! A [`ResourceCache`] maps a key (a locator, or raw content) to the single
//! shared outcome of loading it. The first request for a key starts the load
//! on its own task; every later request, from any component, waits on the same
//! outcome. Entries are never evicted.
//!
//! [`ResourceCache::global`] is the process-wide instance used by default;
//! tests and embedders can inject their own with [`ResourceCache::new`].

use super::{LoadError, Resource};
use crate::utils::lock;
use log::debug;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Which family of loads a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheBucket {
    /// Stylesheets referenced by locator
    Stylesheet,
    /// Inline stylesheet text
    RawStylesheet,
    /// Compiled stylesheets, by locator or source
    CompiledStylesheet,
    /// Scripts, by locator or source
    Script,
}

/// Shared slot holding a load outcome once it settles.
pub(crate) type Outcome = Option<Result<Resource, LoadError>>;

static GLOBAL: Lazy<ResourceCache> = Lazy::new(ResourceCache::new);

/// Shared registry of in-flight and completed loads.
#[derive(Debug, Clone, Default)]
pub struct ResourceCache {
    entries: Arc<Mutex<HashMap<(CacheBucket, String), watch::Receiver<Outcome>>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Wait for the outcome stored under `key`, starting `load` only if no
    /// load for that key was ever started.
    ///
    /// The check and the registration happen under one lock, before the
    /// returned future is first polled, so concurrent callers can never start
    /// a second load for the same key.
    pub fn get_or_load<F, Fut>(
        &self,
        bucket: CacheBucket,
        key: &str,
        load: F,
    ) -> impl Future<Output = Result<Resource, LoadError>> + Send + 'static
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resource, LoadError>> + Send + 'static,
    {
        let receiver = {
            let mut entries = lock(&self.entries);
            match entries.get(&(bucket, key.to_string())) {
                Some(receiver) => {
                    debug!("Reusing {:?} load for {}", bucket, abbreviate(key));
                    receiver.clone()
                }
                None => {
                    debug!("Starting {:?} load for {}", bucket, abbreviate(key));
                    let (sender, receiver) = watch::channel(None);
                    entries.insert((bucket, key.to_string()), receiver.clone());
                    let future = load();
                    tokio::spawn(async move {
                        let outcome = future.await;
                        let _ = sender.send(Some(outcome));
                    });
                    receiver
                }
            }
        };

        let label = abbreviate(key);
        async move { settled(receiver, label).await }
    }

    /// Whether a load was ever started for `key`
    pub fn contains(&self, bucket: CacheBucket, key: &str) -> bool {
        lock(&self.entries).contains_key(&(bucket, key.to_string()))
    }

    /// The outcome for `key`, if its load already settled
    pub fn peek(&self, bucket: CacheBucket, key: &str) -> Option<Result<Resource, LoadError>> {
        lock(&self.entries)
            .get(&(bucket, key.to_string()))
            .and_then(|receiver| receiver.borrow().clone())
    }

    /// Number of distinct loads ever started
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) async fn settled(mut receiver: watch::Receiver<Outcome>, label: String) -> Result<Resource, LoadError> {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    outcome.unwrap_or(Err(LoadError::Aborted(label)))
}

/// Raw content can be large; keep log lines and error labels short.
pub(crate) fn abbreviate(key: &str) -> String {
    const LIMIT: usize = 48;
    if key.chars().count() <= LIMIT {
        key.to_string()
    } else {
        let head: String = key.chars().take(LIMIT).collect();
        format!("{}…", head)
    }
}
