//! Dataset and workspace collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One element of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetElement {
    pub name: String,
    #[serde(default)]
    pub contents: String,
}

/// Reads workspace-scoped datasets without involving the model.
#[async_trait]
pub trait DatasetReader: Send + Sync {
    /// Ordered elements of the dataset, or `None` when it does not exist.
    async fn read(
        &self,
        workspace_id: &str,
        dataset_id: &str,
    ) -> anyhow::Result<Option<Vec<DatasetElement>>>;
}

/// Creates and removes the workspaces backing threads.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create a workspace and return its id.
    async fn create(&self, provider_type: &str) -> anyhow::Result<String>;

    async fn remove(&self, workspace_id: &str) -> anyhow::Result<()>;
}
