//! Typed store access.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ObjectStore, RawObject, Selector, WatchEvent};
use crate::error::{AppError, AppResult};
use crate::model::{Kind, OwnerRef, Resource, StatusResource};
use crate::result_ext::NotFoundExt;

const DEFAULT_RETRIES: u32 = 5;

/// Typed client over an [`ObjectStore`] backend.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn ObjectStore>,
    retries: u32,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Number of attempts for conflict-retried writes.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    pub async fn get<T: Resource>(&self, namespace: &str, name: &str) -> AppResult<T> {
        self.backend
            .get(T::KIND, namespace, name)
            .await?
            .into_resource()
    }

    /// Like [`get`](Self::get) but `None` when the object does not exist.
    pub async fn find<T: Resource>(&self, namespace: &str, name: &str) -> AppResult<Option<T>> {
        self.get(namespace, name).await.not_found_as_none()
    }

    pub async fn list<T: Resource>(&self, namespace: &str, selector: &Selector) -> AppResult<Vec<T>> {
        self.backend
            .list(T::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(RawObject::into_resource)
            .collect()
    }

    pub async fn create<T: Resource>(&self, object: &T) -> AppResult<T> {
        self.backend
            .create(RawObject::from_resource(object)?)
            .await?
            .into_resource()
    }

    pub async fn update<T: Resource>(&self, object: &T) -> AppResult<T> {
        self.backend
            .update(RawObject::from_resource(object)?)
            .await?
            .into_resource()
    }

    /// Delete an object; deleting a missing object is not an error.
    pub async fn delete<T: Resource>(&self, namespace: &str, name: &str) -> AppResult<()> {
        match self.backend.delete(T::KIND, namespace, name).await {
            Ok(()) | Err(AppError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        selector: Selector,
        resume_from: Option<u64>,
    ) -> AppResult<mpsc::Receiver<WatchEvent>> {
        self.backend.watch(kind, namespace, selector, resume_from).await
    }

    /// Write `status` onto the latest version of `object`.
    ///
    /// Re-reads and retries on version conflicts. Returns the stored object.
    pub async fn update_status<T: StatusResource>(
        &self,
        object: &T,
        status: T::Status,
    ) -> AppResult<T> {
        self.mutate_status::<T, _>(object.namespace(), object.name(), |current| {
            *current = status.clone();
        })
        .await
    }

    /// Apply `mutate` to the latest stored status and write it back.
    ///
    /// No write happens when the mutation leaves the status unchanged.
    pub async fn mutate_status<T, F>(&self, namespace: &str, name: &str, mut mutate: F) -> AppResult<T>
    where
        T: StatusResource,
        F: FnMut(&mut T::Status) + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut current: T = self.get(namespace, name).await?;
            let before = current.status().clone();
            mutate(current.status_mut());
            if *current.status() == before {
                return Ok(current);
            }
            match self.update(&current).await {
                Ok(stored) => return Ok(stored),
                Err(AppError::Conflict(msg)) if attempt < self.retries => {
                    debug!(kind = %T::KIND, name, attempt, "Status update conflict, retrying: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make the desired children of `owner` exist.
    ///
    /// Missing children are created, children whose spec drifted are
    /// updated (their status is left alone). With `prune`, children of the
    /// same kind owned by `owner` that are no longer desired are deleted.
    /// Returns the stored children in the order given.
    pub async fn apply<T: StatusResource>(
        &self,
        owner: &OwnerRef,
        namespace: &str,
        desired: Vec<T>,
        prune: bool,
    ) -> AppResult<Vec<T>> {
        let mut stored = Vec::with_capacity(desired.len());
        let mut wanted = HashSet::with_capacity(desired.len());

        for mut child in desired {
            child.meta_mut().owner = Some(owner.clone());
            child.meta_mut().namespace = namespace.to_string();
            wanted.insert(child.name().to_string());
            stored.push(self.apply_one(child).await?);
        }

        if prune {
            let existing: Vec<T> = self
                .list(namespace, &Selector::owned_by(owner.clone()))
                .await?;
            for obj in existing {
                if !wanted.contains(obj.name()) {
                    debug!(kind = %T::KIND, name = obj.name(), owner = %owner.name, "Pruning child");
                    self.delete::<T>(namespace, obj.name()).await?;
                }
            }
        }

        Ok(stored)
    }

    async fn apply_one<T: StatusResource>(&self, child: T) -> AppResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.find::<T>(child.namespace(), child.name()).await? {
                None => match self.create(&child).await {
                    Ok(created) => return Ok(created),
                    Err(AppError::AlreadyExists(_)) if attempt < self.retries => continue,
                    Err(e) => return Err(e),
                },
                Some(mut existing) => {
                    if existing.spec() == child.spec() && existing.meta().owner == child.meta().owner {
                        return Ok(existing);
                    }
                    *existing.spec_mut() = child.spec().clone();
                    existing.meta_mut().owner = child.meta().owner.clone();
                    match self.update(&existing).await {
                        Ok(updated) => return Ok(updated),
                        Err(AppError::Conflict(_)) if attempt < self.retries => continue,
                        Err(e) => {
                            warn!(kind = %T::KIND, name = child.name(), error = %e, "Apply failed");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectMeta, Thread, ThreadSpec, ThreadStatus};
    use crate::store::MemoryStore;

    fn client() -> StoreClient {
        StoreClient::new(Arc::new(MemoryStore::new()))
    }

    fn thread(name: &str, description: &str) -> Thread {
        Thread {
            metadata: ObjectMeta::named("default", name),
            spec: ThreadSpec {
                description: Some(description.to_string()),
                ..Default::default()
            },
            status: ThreadStatus::default(),
        }
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = client();
        store.create(&thread("t1", "hello")).await.unwrap();
        let back: Thread = store.get("default", "t1").await.unwrap();
        assert_eq!(back.spec.description.as_deref(), Some("hello"));
        assert!(back.metadata.resource_version > 0);
        assert!(store.find::<Thread>("default", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_retries_stale_copy() {
        let store = client();
        let created = store.create(&thread("t1", "x")).await.unwrap();
        store
            .mutate_status::<Thread, _>("default", "t1", |s| s.workspace_id = Some("ws".into()))
            .await
            .unwrap();

        // `created` is stale now; update_status must re-read instead of failing.
        let status = ThreadStatus {
            last_run_name: Some("r1".into()),
            ..Default::default()
        };
        let stored = store.update_status(&created, status.clone()).await.unwrap();
        assert_eq!(stored.status, status);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_prunes() {
        let store = client();
        let owner = OwnerRef::new(Kind::WorkflowExecution, "we1");

        let first = store
            .apply(&owner, "default", vec![thread("a", "1"), thread("b", "1")], true)
            .await
            .unwrap();
        let versions: Vec<u64> = first.iter().map(|t| t.metadata.resource_version).collect();

        let again = store
            .apply(&owner, "default", vec![thread("a", "1"), thread("b", "1")], true)
            .await
            .unwrap();
        let again_versions: Vec<u64> = again.iter().map(|t| t.metadata.resource_version).collect();
        assert_eq!(versions, again_versions);

        store
            .apply(&owner, "default", vec![thread("a", "2")], true)
            .await
            .unwrap();
        let a: Thread = store.get("default", "a").await.unwrap();
        assert_eq!(a.spec.description.as_deref(), Some("2"));
        assert!(store.find::<Thread>("default", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_keeps_status() {
        let store = client();
        let owner = OwnerRef::new(Kind::WorkflowExecution, "we1");
        store
            .apply(&owner, "default", vec![thread("a", "1")], false)
            .await
            .unwrap();
        store
            .mutate_status::<Thread, _>("default", "a", |s| s.last_run_name = Some("r9".into()))
            .await
            .unwrap();
        store
            .apply(&owner, "default", vec![thread("a", "1")], false)
            .await
            .unwrap();
        let a: Thread = store.get("default", "a").await.unwrap();
        assert_eq!(a.status.last_run_name.as_deref(), Some("r9"));
    }
}
