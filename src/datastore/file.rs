use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::datastore::{
    page, scoped_key, sort_runs_newest_first, DataStore, DatastoreError, TenantInfo,
};
use crate::models::api::{ApiConfig, RunResult};
use crate::models::integration::Integration;
use crate::models::workflow::Workflow;
use crate::utils::encryption::{decrypt_credentials, encrypt_credentials};

const DOCUMENT_FILE: &str = "superglue_data.json";
const RUN_LOG_FILE: &str = "superglue_logs.jsonl";

/// Single-file document for configurations plus an append-only JSONL log
/// for runs. A run is appended once when it starts and once when it is
/// finalized; readers keep the last line per id.
pub struct FileStore {
    document_path: PathBuf,
    log_path: PathBuf,
    document: Mutex<Document>,
    runs: Mutex<RunLog>,
    encryption_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Document {
    #[serde(default)]
    apis: HashMap<String, ApiConfig>,
    #[serde(default)]
    extracts: HashMap<String, Value>,
    #[serde(default)]
    transforms: HashMap<String, Value>,
    #[serde(default)]
    workflows: HashMap<String, Workflow>,
    #[serde(default)]
    integrations: HashMap<String, Integration>,
    #[serde(default)]
    tenant_info: TenantInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    #[serde(rename = "orgId", default)]
    org_id: String,
    #[serde(flatten)]
    run: RunResult,
}

#[derive(Default)]
struct RunLog {
    entries: Vec<(u64, RunRecord)>,
    next_seq: u64,
}

impl FileStore {
    /// Loads (or initializes) the store under `storage_dir`.
    pub fn new(
        storage_dir: impl AsRef<Path>,
        encryption_key: Option<Vec<u8>>,
    ) -> Result<Self, DatastoreError> {
        let dir = storage_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let document_path = dir.join(DOCUMENT_FILE);
        let log_path = dir.join(RUN_LOG_FILE);

        let document = if document_path.exists() {
            let raw = std::fs::read_to_string(&document_path)?;
            serde_json::from_str(&raw)?
        } else {
            Document::default()
        };

        let runs = load_run_log(&log_path)?;

        Ok(Self {
            document_path,
            log_path,
            document: Mutex::new(document),
            runs: Mutex::new(runs),
            encryption_key,
        })
    }

    fn key(&self) -> Option<&[u8]> {
        self.encryption_key.as_deref()
    }

    async fn persist_document(&self, document: &Document) -> Result<(), DatastoreError> {
        let rendered = serde_json::to_string_pretty(document)?;
        tokio::fs::write(&self.document_path, rendered).await?;
        Ok(())
    }

    async fn append_run(&self, record: &RunRecord) -> Result<(), DatastoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn load_run_log(path: &Path) -> Result<RunLog, DatastoreError> {
    let mut log = RunLog::default();
    if !path.exists() {
        return Ok(log);
    }
    let raw = std::fs::read_to_string(path)?;
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunRecord>(line) {
            Ok(record) if record.run.id.is_empty() || record.run.config.id().is_empty() => {
                warn!(line = line_no + 1, "skipping run log entry with missing ids");
            }
            Ok(record) => {
                log.next_seq += 1;
                log.entries.push((log.next_seq, record));
            }
            Err(err) => {
                warn!(line = line_no + 1, %err, "skipping corrupted run log entry");
            }
        }
    }
    Ok(log)
}

/// Last appended line wins for each `(org, id)`.
fn dedupe_latest(entries: &[(u64, RunRecord)], org_id: &str) -> Vec<(u64, RunResult)> {
    let mut latest: HashMap<String, (u64, RunResult)> = HashMap::new();
    for (seq, record) in entries {
        if record.org_id != org_id {
            continue;
        }
        latest.insert(record.run.id.clone(), (*seq, record.run.clone()));
    }
    latest.into_values().collect()
}

#[async_trait]
impl DataStore for FileStore {
    async fn get_api(&self, org_id: &str, id: &str) -> Result<Option<ApiConfig>, DatastoreError> {
        let document = self.document.lock().await;
        Ok(document.apis.get(&scoped_key(org_id, id)).cloned())
    }

    async fn list_apis(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ApiConfig>, usize), DatastoreError> {
        let document = self.document.lock().await;
        let mut entries: Vec<(&String, &ApiConfig)> = document
            .apis
            .iter()
            .filter(|(key, _)| key_in_org(key, org_id))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let items: Vec<ApiConfig> = entries.into_iter().map(|(_, v)| v.clone()).collect();
        let total = items.len();
        Ok((page(&items, limit, offset), total))
    }

    async fn upsert_api(
        &self,
        org_id: &str,
        config: &ApiConfig,
    ) -> Result<ApiConfig, DatastoreError> {
        let mut document = self.document.lock().await;
        let key = scoped_key(org_id, &config.id);
        let mut stored = config.clone();
        let now = OffsetDateTime::now_utc();
        stored.created_at = document
            .apis
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        document.apis.insert(key, stored.clone());
        self.persist_document(&document).await?;
        Ok(stored)
    }

    async fn delete_api(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut document = self.document.lock().await;
        let removed = document.apis.remove(&scoped_key(org_id, id)).is_some();
        if removed {
            self.persist_document(&document).await?;
        }
        Ok(removed)
    }

    async fn get_workflow(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Workflow>, DatastoreError> {
        let document = self.document.lock().await;
        Ok(document.workflows.get(&scoped_key(org_id, id)).cloned())
    }

    async fn list_workflows(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize), DatastoreError> {
        let document = self.document.lock().await;
        let mut entries: Vec<(&String, &Workflow)> = document
            .workflows
            .iter()
            .filter(|(key, _)| key_in_org(key, org_id))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let items: Vec<Workflow> = entries.into_iter().map(|(_, v)| v.clone()).collect();
        let total = items.len();
        Ok((page(&items, limit, offset), total))
    }

    async fn upsert_workflow(
        &self,
        org_id: &str,
        workflow: &Workflow,
    ) -> Result<Workflow, DatastoreError> {
        let mut document = self.document.lock().await;
        let key = scoped_key(org_id, &workflow.id);
        let mut stored = workflow.clone();
        let now = OffsetDateTime::now_utc();
        stored.created_at = document
            .workflows
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        document.workflows.insert(key, stored.clone());
        self.persist_document(&document).await?;
        Ok(stored)
    }

    async fn delete_workflow(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut document = self.document.lock().await;
        let removed = document.workflows.remove(&scoped_key(org_id, id)).is_some();
        if removed {
            self.persist_document(&document).await?;
        }
        Ok(removed)
    }

    async fn upsert_run(&self, org_id: &str, run: &RunResult) -> Result<(), DatastoreError> {
        let record = RunRecord {
            org_id: org_id.to_string(),
            run: run.clone(),
        };
        self.append_run(&record).await?;
        let mut runs = self.runs.lock().await;
        runs.next_seq += 1;
        let seq = runs.next_seq;
        runs.entries.push((seq, record));
        Ok(())
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunResult>, DatastoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .entries
            .iter()
            .rev()
            .find(|(_, record)| record.org_id == org_id && record.run.id == id)
            .map(|(_, record)| record.run.clone()))
    }

    async fn list_runs(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
        config_id: Option<&str>,
    ) -> Result<(Vec<RunResult>, usize), DatastoreError> {
        let runs = self.runs.lock().await;
        let mut matching: Vec<(u64, RunResult)> = dedupe_latest(&runs.entries, org_id)
            .into_iter()
            .filter(|(_, run)| config_id.map(|c| run.config.id() == c).unwrap_or(true))
            .collect();
        sort_runs_newest_first(&mut matching);
        let total = matching.len();
        let items: Vec<RunResult> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, run)| run)
            .collect();
        Ok((items, total))
    }

    async fn delete_all_runs(&self, org_id: &str) -> Result<(), DatastoreError> {
        let mut runs = self.runs.lock().await;
        runs.entries.retain(|(_, record)| record.org_id != org_id);
        let mut rendered = String::new();
        for (_, record) in &runs.entries {
            rendered.push_str(&serde_json::to_string(record)?);
            rendered.push('\n');
        }
        tokio::fs::write(&self.log_path, rendered).await?;
        Ok(())
    }

    async fn get_integration(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Integration>, DatastoreError> {
        let document = self.document.lock().await;
        let Some(stored) = document.integrations.get(&scoped_key(org_id, id)) else {
            return Ok(None);
        };
        let mut integration = stored.clone();
        integration.credentials = decrypt_credentials(self.key(), &integration.credentials)?;
        Ok(Some(integration))
    }

    async fn get_many_integrations(
        &self,
        org_id: &str,
        ids: &[String],
    ) -> Result<Vec<Integration>, DatastoreError> {
        let mut found = Vec::new();
        for id in ids {
            if let Some(integration) = self.get_integration(org_id, id).await? {
                found.push(integration);
            }
        }
        Ok(found)
    }

    async fn list_integrations(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Integration>, usize), DatastoreError> {
        let document = self.document.lock().await;
        let mut entries: Vec<(&String, &Integration)> = document
            .integrations
            .iter()
            .filter(|(key, _)| key_in_org(key, org_id))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut items: Vec<Integration> = entries.into_iter().map(|(_, v)| v.clone()).collect();
        drop(document);
        for integration in &mut items {
            integration.credentials = decrypt_credentials(self.key(), &integration.credentials)?;
        }
        let total = items.len();
        Ok((page(&items, limit, offset), total))
    }

    async fn upsert_integration(
        &self,
        org_id: &str,
        integration: &Integration,
    ) -> Result<Integration, DatastoreError> {
        let mut stored = integration.clone();
        let now = OffsetDateTime::now_utc();
        stored.credentials = encrypt_credentials(self.key(), &integration.credentials)?;

        let mut document = self.document.lock().await;
        let key = scoped_key(org_id, &integration.id);
        stored.created_at = document
            .integrations
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        document.integrations.insert(key, stored.clone());
        self.persist_document(&document).await?;

        let mut returned = stored;
        returned.credentials = integration.credentials.clone();
        Ok(returned)
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut document = self.document.lock().await;
        let removed = document
            .integrations
            .remove(&scoped_key(org_id, id))
            .is_some();
        if removed {
            self.persist_document(&document).await?;
        }
        Ok(removed)
    }

    async fn get_tenant_info(&self) -> Result<TenantInfo, DatastoreError> {
        let document = self.document.lock().await;
        Ok(document.tenant_info.clone())
    }

    async fn set_tenant_info(
        &self,
        email: Option<&str>,
        email_entry_skipped: Option<bool>,
    ) -> Result<(), DatastoreError> {
        let mut document = self.document.lock().await;
        if let Some(email) = email {
            document.tenant_info.email = Some(email.to_string());
        }
        if let Some(skipped) = email_entry_skipped {
            document.tenant_info.email_entry_skipped = skipped;
        }
        self.persist_document(&document).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatastoreError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}

fn key_in_org(key: &str, org_id: &str) -> bool {
    if org_id.is_empty() {
        !key.contains(':')
    } else {
        key.starts_with(&format!("{org_id}:"))
    }
}
