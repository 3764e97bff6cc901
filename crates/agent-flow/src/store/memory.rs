//! In-memory object store.
//!
//! Keeps every object in a map guarded by one mutex, a bounded history of
//! changes for resumed watches, and a broadcast channel feeding live
//! watchers. Used by tests and single-process deployments.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{ObjectStore, RawObject, Selector, WatchEvent, WatchEventKind};
use crate::error::{AppError, AppResult};
use crate::model::{Kind, OwnerRef};

const DEFAULT_HISTORY: usize = 4096;
const FEED_CAPACITY: usize = 1024;
const WATCH_BUFFER: usize = 256;

type Key = (Kind, String, String);

struct Inner {
    version: u64,
    objects: BTreeMap<Key, RawObject>,
    history: VecDeque<WatchEvent>,
}

/// In-memory [`ObjectStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<WatchEvent>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Create a store that remembers at most `history_limit` changes.
    pub fn with_history(history_limit: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                version: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
            }),
            feed,
            history_limit: history_limit.max(1),
        }
    }

    /// Latest resource version handed out.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-test; the
        // map itself is never left half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, inner: &mut Inner, kind: WatchEventKind, object: RawObject) {
        let event = WatchEvent { kind, object };
        inner.history.push_back(event.clone());
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
        // No receivers is fine.
        let _ = self.feed.send(event);
    }

    fn stamp(inner: &mut Inner, object: &mut RawObject) {
        inner.version += 1;
        object.meta.resource_version = inner.version;
        if let Ok(meta) = serde_json::to_value(&object.meta) {
            if let Some(body) = object.body.as_object_mut() {
                body.insert("metadata".to_string(), meta);
            }
        }
    }

    fn delete_locked(&self, inner: &mut Inner, key: &Key) -> bool {
        let Some(mut removed) = inner.objects.remove(key) else {
            return false;
        };
        Self::stamp(inner, &mut removed);
        let owner = OwnerRef::new(removed.kind, removed.meta.name.clone());
        let namespace = removed.meta.namespace.clone();
        self.record(inner, WatchEventKind::Deleted, removed);

        let dependents: Vec<Key> = inner
            .objects
            .iter()
            .filter(|((_, ns, _), obj)| {
                ns == &namespace && obj.meta.owner.as_ref() == Some(&owner)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            debug!(kind = %dependent.0, name = %dependent.2, "Cascading delete");
            self.delete_locked(inner, &dependent);
        }
        true
    }
}

fn watch_matches(kind: Kind, namespace: &str, selector: &Selector, event: &WatchEvent) -> bool {
    event.object.kind == kind
        && event.object.meta.namespace == namespace
        && selector.matches(&event.object)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> AppResult<RawObject> {
        self.lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("{} {}/{}", kind, namespace, name)))
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Selector,
    ) -> AppResult<Vec<RawObject>> {
        let inner = self.lock();
        let mut objects: Vec<RawObject> = inner
            .objects
            .values()
            .filter(|o| o.kind == kind && o.meta.namespace == namespace && selector.matches(o))
            .cloned()
            .collect();
        objects.sort_by_key(|o| o.meta.resource_version);
        Ok(objects)
    }

    async fn create(&self, mut object: RawObject) -> AppResult<RawObject> {
        let mut inner = self.lock();
        let key = object.key();
        if inner.objects.contains_key(&key) {
            return Err(AppError::AlreadyExists(format!(
                "{} {}/{}",
                key.0, key.1, key.2
            )));
        }
        if object.meta.created_at.is_none() {
            object.meta.created_at = Some(Utc::now());
        }
        Self::stamp(&mut inner, &mut object);
        inner.objects.insert(key, object.clone());
        self.record(&mut inner, WatchEventKind::Added, object.clone());
        Ok(object)
    }

    async fn update(&self, mut object: RawObject) -> AppResult<RawObject> {
        let mut inner = self.lock();
        let key = object.key();
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| AppError::NotFound(format!("{} {}/{}", key.0, key.1, key.2)))?;
        if object.meta.resource_version != current.meta.resource_version {
            return Err(AppError::Conflict(format!(
                "{} {}/{}: version {} is stale (current {})",
                key.0, key.1, key.2, object.meta.resource_version, current.meta.resource_version
            )));
        }
        object.meta.created_at = current.meta.created_at;
        Self::stamp(&mut inner, &mut object);
        inner.objects.insert(key, object.clone());
        self.record(&mut inner, WatchEventKind::Modified, object.clone());
        Ok(object)
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> AppResult<()> {
        let mut inner = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        if self.delete_locked(&mut inner, &key) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("{} {}/{}", kind, namespace, name)))
        }
    }

    async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        selector: Selector,
        resume_from: Option<u64>,
    ) -> AppResult<mpsc::Receiver<WatchEvent>> {
        let namespace = namespace.to_string();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        // Subscribe under the lock so no change falls between the initial
        // snapshot and the live feed.
        let (initial, mut feed) = {
            let inner = self.lock();
            let feed = self.feed.subscribe();
            let initial: Vec<WatchEvent> = match resume_from {
                None => {
                    let mut current: Vec<&RawObject> = inner
                        .objects
                        .values()
                        .filter(|o| {
                            o.kind == kind && o.meta.namespace == namespace && selector.matches(o)
                        })
                        .collect();
                    current.sort_by_key(|o| o.meta.resource_version);
                    current
                        .into_iter()
                        .map(|o| WatchEvent {
                            kind: WatchEventKind::Added,
                            object: o.clone(),
                        })
                        .collect()
                }
                Some(since) => {
                    let oldest = inner.history.front().map(|e| e.version());
                    if let Some(oldest) = oldest {
                        if since + 1 < oldest {
                            return Err(AppError::Expired(format!(
                                "version {} is older than retained history ({})",
                                since, oldest
                            )));
                        }
                    }
                    inner
                        .history
                        .iter()
                        .filter(|e| e.version() > since)
                        .filter(|e| watch_matches(kind, &namespace, &selector, e))
                        .cloned()
                        .collect()
                }
            };
            (initial, feed)
        };

        let mut cursor = resume_from.unwrap_or(0);
        tokio::spawn(async move {
            for event in initial {
                cursor = cursor.max(event.version());
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if event.version() <= cursor
                            || !watch_matches(kind, &namespace, &selector, &event)
                        {
                            continue;
                        }
                        cursor = event.version();
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Watch lagged, closing feed");
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}
