//! Object metadata shared by every stored record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Record kinds held by the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Workflow,
    WorkflowExecution,
    WorkflowStep,
    Thread,
    Run,
    RunState,
    Prompt,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Workflow => "Workflow",
            Kind::WorkflowExecution => "WorkflowExecution",
            Kind::WorkflowStep => "WorkflowStep",
            Kind::Thread => "Thread",
            Kind::Run => "Run",
            Kind::RunState => "RunState",
            Kind::Prompt => "Prompt",
        };
        write!(f, "{}", s)
    }
}

/// Reference to the object that owns (and cascades deletion to) another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: Kind,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Versioned, namespaced identity of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Assigned by the store on every write; `0` for objects never stored.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn owned_by(mut self, owner: OwnerRef) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// A typed record stored in the object store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Values indexed for field selectors, e.g. `spec.threadName`.
    fn fields(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    fn owner_ref(&self) -> OwnerRef {
        OwnerRef::new(Self::KIND, self.meta().name.clone())
    }
}

/// A record split into a desired `spec` (written by its creator) and an
/// observed `status` (written only by its own reconciliation).
pub trait StatusResource: Resource {
    type Spec: Clone + PartialEq + Send + Sync;
    type Status: Clone + PartialEq + Default + Send + Sync;

    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;
}

/// Implements [`Resource`] and [`StatusResource`] for a `{metadata, spec, status}` struct.
macro_rules! status_resource {
    ($ty:ty, $kind:expr, $spec:ty, $status:ty, |$this:ident| $fields:expr) => {
        impl $crate::model::meta::Resource for $ty {
            const KIND: $crate::model::meta::Kind = $kind;

            fn meta(&self) -> &$crate::model::meta::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::model::meta::ObjectMeta {
                &mut self.metadata
            }

            fn fields(&self) -> std::collections::BTreeMap<String, String> {
                let $this = self;
                $fields
            }
        }

        impl $crate::model::meta::StatusResource for $ty {
            type Spec = $spec;
            type Status = $status;

            fn spec(&self) -> &Self::Spec {
                &self.spec
            }

            fn spec_mut(&mut self) -> &mut Self::Spec {
                &mut self.spec
            }

            fn status(&self) -> &Self::Status {
                &self.status
            }

            fn status_mut(&mut self) -> &mut Self::Status {
                &mut self.status
            }
        }
    };
}

pub(crate) use status_resource;

/// Collects `(key, Some(value))` pairs into an index map.
pub(crate) fn index<'a>(
    pairs: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string())))
        .collect()
}
