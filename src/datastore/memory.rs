use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::datastore::{
    page, scoped_key, sort_runs_newest_first, DataStore, DatastoreError, TenantInfo,
};
use crate::models::api::{ApiConfig, RunResult};
use crate::models::integration::Integration;
use crate::models::workflow::Workflow;
use crate::utils::encryption::{decrypt_credentials, encrypt_credentials};
use time::OffsetDateTime;

/// Process-local backend, also the reference implementation the other
/// backends are tested against.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    encryption_key: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    apis: HashMap<String, ApiConfig>,
    workflows: HashMap<String, Workflow>,
    integrations: HashMap<String, Integration>,
    runs: HashMap<String, (u64, RunResult)>,
    run_seq: u64,
    tenant: TenantInfo,
}

impl MemoryStore {
    pub fn new(encryption_key: Option<Vec<u8>>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            encryption_key,
        }
    }

    fn key(&self) -> Option<&[u8]> {
        self.encryption_key.as_deref()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

fn sorted_by_key<T: Clone>(map: &HashMap<String, T>, org_id: &str) -> Vec<(String, T)> {
    let prefix = if org_id.is_empty() {
        String::new()
    } else {
        format!("{org_id}:")
    };
    let mut entries: Vec<(String, T)> = map
        .iter()
        .filter(|(key, _)| {
            if org_id.is_empty() {
                !key.contains(':')
            } else {
                key.starts_with(&prefix)
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    entries
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_api(&self, org_id: &str, id: &str) -> Result<Option<ApiConfig>, DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        Ok(inner.apis.get(&scoped_key(org_id, id)).cloned())
    }

    async fn list_apis(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ApiConfig>, usize), DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        let entries: Vec<ApiConfig> = sorted_by_key(&inner.apis, org_id)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let total = entries.len();
        Ok((page(&entries, limit, offset), total))
    }

    async fn upsert_api(
        &self,
        org_id: &str,
        config: &ApiConfig,
    ) -> Result<ApiConfig, DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        let key = scoped_key(org_id, &config.id);
        let mut stored = config.clone();
        let now = OffsetDateTime::now_utc();
        stored.created_at = inner
            .apis
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        inner.apis.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_api(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        Ok(inner.apis.remove(&scoped_key(org_id, id)).is_some())
    }

    async fn get_workflow(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Workflow>, DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        Ok(inner.workflows.get(&scoped_key(org_id, id)).cloned())
    }

    async fn list_workflows(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize), DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        let entries: Vec<Workflow> = sorted_by_key(&inner.workflows, org_id)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let total = entries.len();
        Ok((page(&entries, limit, offset), total))
    }

    async fn upsert_workflow(
        &self,
        org_id: &str,
        workflow: &Workflow,
    ) -> Result<Workflow, DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        let key = scoped_key(org_id, &workflow.id);
        let mut stored = workflow.clone();
        let now = OffsetDateTime::now_utc();
        stored.created_at = inner
            .workflows
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        inner.workflows.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_workflow(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        Ok(inner.workflows.remove(&scoped_key(org_id, id)).is_some())
    }

    async fn upsert_run(&self, org_id: &str, run: &RunResult) -> Result<(), DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        inner.run_seq += 1;
        let seq = inner.run_seq;
        inner
            .runs
            .insert(scoped_key(org_id, &run.id), (seq, run.clone()));
        Ok(())
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunResult>, DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        Ok(inner
            .runs
            .get(&scoped_key(org_id, id))
            .map(|(_, run)| run.clone()))
    }

    async fn list_runs(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
        config_id: Option<&str>,
    ) -> Result<(Vec<RunResult>, usize), DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        let mut matching: Vec<(u64, RunResult)> = sorted_by_key(&inner.runs, org_id)
            .into_iter()
            .map(|(_, v)| v)
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
        let mut inner = self.inner.write().expect("memory store lock");
        let keys: Vec<String> = sorted_by_key(&inner.runs, org_id)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            inner.runs.remove(&key);
        }
        Ok(())
    }

    async fn get_integration(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Integration>, DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        let Some(stored) = inner.integrations.get(&scoped_key(org_id, id)) else {
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
        let inner = self.inner.read().expect("memory store lock");
        let mut entries: Vec<Integration> = sorted_by_key(&inner.integrations, org_id)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        drop(inner);
        for integration in &mut entries {
            integration.credentials = decrypt_credentials(self.key(), &integration.credentials)?;
        }
        let total = entries.len();
        Ok((page(&entries, limit, offset), total))
    }

    async fn upsert_integration(
        &self,
        org_id: &str,
        integration: &Integration,
    ) -> Result<Integration, DatastoreError> {
        let mut stored = integration.clone();
        let now = OffsetDateTime::now_utc();
        stored.credentials = encrypt_credentials(self.key(), &integration.credentials)?;

        let mut inner = self.inner.write().expect("memory store lock");
        let key = scoped_key(org_id, &integration.id);
        stored.created_at = inner
            .integrations
            .get(&key)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        inner.integrations.insert(key, stored.clone());

        let mut returned = stored;
        returned.credentials = integration.credentials.clone();
        Ok(returned)
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        Ok(inner.integrations.remove(&scoped_key(org_id, id)).is_some())
    }

    async fn get_tenant_info(&self) -> Result<TenantInfo, DatastoreError> {
        let inner = self.inner.read().expect("memory store lock");
        Ok(inner.tenant.clone())
    }

    async fn set_tenant_info(
        &self,
        email: Option<&str>,
        email_entry_skipped: Option<bool>,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.inner.write().expect("memory store lock");
        if let Some(email) = email {
            inner.tenant.email = Some(email.to_string());
        }
        if let Some(skipped) = email_entry_skipped {
            inner.tenant.email_entry_skipped = skipped;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatastoreError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api::ConfigSnapshot;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use time::Duration;

    fn run_at(id: &str, config_id: &str, started_at: OffsetDateTime) -> RunResult {
        RunResult {
            id: id.into(),
            success: true,
            data: Some(json!({"ok": true})),
            error: None,
            started_at,
            completed_at: Some(started_at),
            config: ConfigSnapshot::Api(ApiConfig {
                id: config_id.into(),
                url_host: "https://api.test".into(),
                ..Default::default()
            }),
            status_code: Some(200),
            headers: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn upsert_get_round_trips_excluding_timestamps() {
        let store = MemoryStore::default();
        let config = ApiConfig {
            id: "cfg".into(),
            url_host: "https://api.test".into(),
            instruction: "fetch".into(),
            ..Default::default()
        };
        store.upsert_api("org1", &config).await.unwrap();
        let mut fetched = store.get_api("org1", "cfg").await.unwrap().unwrap();
        assert!(fetched.created_at.is_some());
        fetched.created_at = None;
        fetched.updated_at = None;
        assert_eq!(fetched, config);
    }

    #[tokio::test]
    async fn entities_are_org_scoped() {
        let store = MemoryStore::default();
        let config = ApiConfig {
            id: "cfg".into(),
            url_host: "https://api.test".into(),
            ..Default::default()
        };
        store.upsert_api("org1", &config).await.unwrap();
        assert!(store.get_api("org2", "cfg").await.unwrap().is_none());
        assert!(store.get_api("org1", "cfg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn runs_list_newest_first_with_filter_and_total() {
        let store = MemoryStore::default();
        let base = OffsetDateTime::now_utc();
        store
            .upsert_run("org", &run_at("r1", "a", base - Duration::minutes(2)))
            .await
            .unwrap();
        store
            .upsert_run("org", &run_at("r2", "b", base - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .upsert_run("org", &run_at("r3", "a", base))
            .await
            .unwrap();

        let (runs, total) = store.list_runs("org", 10, 0, None).await.unwrap();
        assert_eq!(total, 3);
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2", "r1"]);

        let (runs, total) = store.list_runs("org", 10, 0, Some("a")).await.unwrap();
        assert_eq!(total, 2);
        assert!(runs.iter().all(|r| r.config.id() == "a"));

        let (paged, total) = store.list_runs("org", 1, 1, None).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(paged[0].id, "r2");
    }

    #[tokio::test]
    async fn get_many_integrations_skips_missing() {
        let store = MemoryStore::default();
        let integration = Integration {
            id: "github".into(),
            ..Default::default()
        };
        store.upsert_integration("org", &integration).await.unwrap();
        let found = store
            .get_many_integrations("org", &["github".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "github");
    }

    #[tokio::test]
    async fn integration_credentials_round_trip_through_encryption() {
        let store = MemoryStore::new(Some(vec![9u8; 32]));
        let integration = Integration {
            id: "stripe".into(),
            credentials: StdHashMap::from([(
                "api_key".to_string(),
                "sk_live_secret".to_string(),
            )]),
            ..Default::default()
        };
        let returned = store.upsert_integration("org", &integration).await.unwrap();
        assert_eq!(returned.credentials["api_key"], "sk_live_secret");

        // at rest the value is ciphertext
        {
            let inner = store.inner.read().unwrap();
            let stored = &inner.integrations["org:stripe"];
            assert_ne!(stored.credentials["api_key"], "sk_live_secret");
        }

        let fetched = store.get_integration("org", "stripe").await.unwrap().unwrap();
        assert_eq!(fetched.credentials["api_key"], "sk_live_secret");
    }

    #[tokio::test]
    async fn tenant_info_is_partial_update() {
        let store = MemoryStore::default();
        store
            .set_tenant_info(Some("ops@example.com"), None)
            .await
            .unwrap();
        store.set_tenant_info(None, Some(true)).await.unwrap();
        let tenant = store.get_tenant_info().await.unwrap();
        assert_eq!(tenant.email.as_deref(), Some("ops@example.com"));
        assert!(tenant.email_entry_skipped);
    }
}
