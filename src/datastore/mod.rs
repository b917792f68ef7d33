pub mod file;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::api::{ApiConfig, RunResult};
use crate::models::integration::Integration;
use crate::models::workflow::Workflow;
use crate::utils::encryption::EncryptionError;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_entry_skipped: bool,
}

/// Persistence capability set shared by all backends. Every method is
/// scoped by `org_id`; missing entities come back as `None`, and
/// `get_many_integrations` silently skips ids it cannot find.
///
/// Integration credentials are encrypted at the edge of this trait:
/// ciphertext at rest, plaintext in every returned value.
#[async_trait]
pub trait DataStore: Send + Sync {
    // API configs
    async fn get_api(&self, org_id: &str, id: &str) -> Result<Option<ApiConfig>, DatastoreError>;
    async fn list_apis(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ApiConfig>, usize), DatastoreError>;
    async fn upsert_api(
        &self,
        org_id: &str,
        config: &ApiConfig,
    ) -> Result<ApiConfig, DatastoreError>;
    async fn delete_api(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError>;

    // Workflows
    async fn get_workflow(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Workflow>, DatastoreError>;
    async fn list_workflows(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize), DatastoreError>;
    async fn upsert_workflow(
        &self,
        org_id: &str,
        workflow: &Workflow,
    ) -> Result<Workflow, DatastoreError>;
    async fn delete_workflow(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError>;

    // Runs (append-only: created at start, finalized at completion)
    async fn upsert_run(&self, org_id: &str, run: &RunResult) -> Result<(), DatastoreError>;
    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunResult>, DatastoreError>;
    /// Newest-first by `started_at`; returns the page plus the total count
    /// of runs matching the filter.
    async fn list_runs(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
        config_id: Option<&str>,
    ) -> Result<(Vec<RunResult>, usize), DatastoreError>;
    async fn delete_all_runs(&self, org_id: &str) -> Result<(), DatastoreError>;

    // Integrations
    async fn get_integration(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Integration>, DatastoreError>;
    async fn get_many_integrations(
        &self,
        org_id: &str,
        ids: &[String],
    ) -> Result<Vec<Integration>, DatastoreError>;
    async fn list_integrations(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Integration>, usize), DatastoreError>;
    async fn upsert_integration(
        &self,
        org_id: &str,
        integration: &Integration,
    ) -> Result<Integration, DatastoreError>;
    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError>;

    // Tenant
    async fn get_tenant_info(&self) -> Result<TenantInfo, DatastoreError>;
    async fn set_tenant_info(
        &self,
        email: Option<&str>,
        email_entry_skipped: Option<bool>,
    ) -> Result<(), DatastoreError>;

    async fn ping(&self) -> Result<(), DatastoreError>;
    async fn disconnect(&self) -> Result<(), DatastoreError>;
}

/// Storage key within an entity family: `org:id`, or the bare id for the
/// default org.
pub(crate) fn scoped_key(org_id: &str, id: &str) -> String {
    if org_id.is_empty() {
        id.to_string()
    } else {
        format!("{org_id}:{id}")
    }
}

/// Orders runs newest-first; among equal timestamps the later insertion
/// wins, so an in-flight run finalized in place keeps its slot.
pub(crate) fn sort_runs_newest_first(runs: &mut [(u64, RunResult)]) {
    runs.sort_by(|(seq_a, a), (seq_b, b)| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| seq_b.cmp(seq_a))
    });
}

pub(crate) fn page<T: Clone>(items: &[T], limit: usize, offset: usize) -> Vec<T> {
    items.iter().skip(offset).take(limit).cloned().collect()
}
