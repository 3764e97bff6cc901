//! Object store contract.
//!
//! The engine persists every piece of state as a versioned, namespaced
//! record. Backends implement [`ObjectStore`] over raw JSON records;
//! [`StoreClient`] layers typed access, idempotent apply and
//! conflict-retrying status writes on top.

mod client;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::model::{Kind, ObjectMeta, OwnerRef, Resource};

pub use client::StoreClient;
pub use memory::MemoryStore;

/// A stored record in untyped form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub kind: Kind,
    pub meta: ObjectMeta,
    /// Values indexed for field selectors.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl RawObject {
    pub fn from_resource<T: Resource>(object: &T) -> AppResult<Self> {
        Ok(Self {
            kind: T::KIND,
            meta: object.meta().clone(),
            fields: object.fields(),
            body: serde_json::to_value(object)?,
        })
    }

    pub fn into_resource<T: Resource>(self) -> AppResult<T> {
        let mut object: T = serde_json::from_value(self.body)?;
        *object.meta_mut() = self.meta;
        Ok(object)
    }

    pub fn key(&self) -> (Kind, String, String) {
        (self.kind, self.meta.namespace.clone(), self.meta.name.clone())
    }
}

/// Equality-based field selector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    fields: Vec<(String, String)>,
    owner: Option<OwnerRef>,
}

impl Selector {
    /// Matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn field(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and_field(key, value)
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::field("metadata.name", name)
    }

    pub fn owned_by(owner: OwnerRef) -> Self {
        Self {
            fields: Vec::new(),
            owner: Some(owner),
        }
    }

    pub fn and_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, object: &RawObject) -> bool {
        if let Some(owner) = &self.owner {
            if object.meta.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        self.fields.iter().all(|(key, value)| {
            if key == "metadata.name" {
                &object.meta.name == value
            } else {
                object.fields.get(key) == Some(value)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// One change-feed entry. The object's resource version is the resume cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub object: RawObject,
}

impl WatchEvent {
    pub fn version(&self) -> u64 {
        self.object.meta.resource_version
    }
}

/// Versioned object store with a resumable change feed.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object; `AppError::NotFound` when absent.
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> AppResult<RawObject>;

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Selector,
    ) -> AppResult<Vec<RawObject>>;

    /// Store a new object; `AppError::AlreadyExists` when the name is taken.
    async fn create(&self, object: RawObject) -> AppResult<RawObject>;

    /// Replace an object; `AppError::Conflict` when `meta.resource_version`
    /// is not the stored version.
    async fn update(&self, object: RawObject) -> AppResult<RawObject>;

    /// Delete an object and, transitively, everything it owns.
    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> AppResult<()>;

    /// Open a change feed.
    ///
    /// Without `resume_from` the feed starts with every matching object as
    /// `Added`. With it, changes after that version are replayed first, or
    /// `AppError::Expired` is returned when history no longer reaches back.
    /// The receiver closes when the feed is interrupted; callers resume
    /// from the last version they saw.
    async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        selector: Selector,
        resume_from: Option<u64>,
    ) -> AppResult<mpsc::Receiver<WatchEvent>>;
}
