use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;

use crate::config::PostgresSettings;
use crate::datastore::{DataStore, DatastoreError, TenantInfo};
use crate::models::api::{ApiConfig, RunResult};
use crate::models::integration::Integration;
use crate::models::workflow::Workflow;
use crate::utils::encryption::{decrypt_credentials, encrypt_credentials};

const TYPE_API: &str = "api";
const TYPE_WORKFLOW: &str = "workflow";

/// Relational backend: one `configurations` table keyed by
/// `(id, type, org_id)` plus `runs`, `integrations`, and `tenant_info`.
pub struct PostgresStore {
    pool: PgPool,
    encryption_key: Option<Vec<u8>>,
}

impl PostgresStore {
    pub fn new(pool: PgPool, encryption_key: Option<Vec<u8>>) -> Self {
        Self {
            pool,
            encryption_key,
        }
    }

    pub async fn connect(
        settings: &PostgresSettings,
        encryption_key: Option<Vec<u8>>,
    ) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.connection_string())
            .await?;
        let store = Self::new(pool, encryption_key);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS configurations (
                id TEXT NOT NULL,
                type TEXT NOT NULL,
                org_id TEXT NOT NULL DEFAULT '',
                data JSONB NOT NULL,
                integration_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, type, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_configurations_integration_ids
            ON configurations USING GIN (integration_ids)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT NOT NULL,
                org_id TEXT NOT NULL DEFAULT '',
                config_id TEXT NOT NULL,
                data JSONB NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                inserted_seq BIGSERIAL,
                PRIMARY KEY (id, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id TEXT NOT NULL,
                org_id TEXT NOT NULL DEFAULT '',
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_info (
                singleton BOOLEAN PRIMARY KEY DEFAULT TRUE,
                email TEXT,
                email_entry_skipped BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn key(&self) -> Option<&[u8]> {
        self.encryption_key.as_deref()
    }

    async fn get_configuration<T: serde::de::DeserializeOwned>(
        &self,
        org_id: &str,
        config_type: &str,
        id: &str,
    ) -> Result<Option<T>, DatastoreError> {
        let row = sqlx::query(
            "SELECT data FROM configurations WHERE id = $1 AND type = $2 AND org_id = $3",
        )
        .bind(id)
        .bind(config_type)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn list_configurations<T: serde::de::DeserializeOwned>(
        &self,
        org_id: &str,
        config_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<T>, usize), DatastoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM configurations WHERE type = $1 AND org_id = $2",
        )
        .bind(config_type)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT data FROM configurations
            WHERE type = $1 AND org_id = $2
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(config_type)
        .bind(org_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row.try_get("data")?;
            items.push(serde_json::from_value(data)?);
        }
        Ok((items, total as usize))
    }

    async fn upsert_configuration(
        &self,
        org_id: &str,
        config_type: &str,
        id: &str,
        data: &Value,
        integration_ids: &[String],
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO configurations (id, type, org_id, data, integration_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, now(), now())
            ON CONFLICT (id, type, org_id)
            DO UPDATE SET data = EXCLUDED.data,
                          integration_ids = EXCLUDED.integration_ids,
                          updated_at = now()
            "#,
        )
        .bind(id)
        .bind(config_type)
        .bind(org_id)
        .bind(data)
        .bind(serde_json::to_value(integration_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_configuration(
        &self,
        org_id: &str,
        config_type: &str,
        id: &str,
    ) -> Result<bool, DatastoreError> {
        let result = sqlx::query(
            "DELETE FROM configurations WHERE id = $1 AND type = $2 AND org_id = $3",
        )
        .bind(id)
        .bind(config_type)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    async fn get_api(&self, org_id: &str, id: &str) -> Result<Option<ApiConfig>, DatastoreError> {
        self.get_configuration(org_id, TYPE_API, id).await
    }

    async fn list_apis(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ApiConfig>, usize), DatastoreError> {
        self.list_configurations(org_id, TYPE_API, limit, offset)
            .await
    }

    async fn upsert_api(
        &self,
        org_id: &str,
        config: &ApiConfig,
    ) -> Result<ApiConfig, DatastoreError> {
        let mut stored = config.clone();
        let existing: Option<ApiConfig> =
            self.get_configuration(org_id, TYPE_API, &config.id).await?;
        let now = OffsetDateTime::now_utc();
        stored.created_at = existing.and_then(|e| e.created_at).or(Some(now));
        stored.updated_at = Some(now);
        let data = serde_json::to_value(&stored)?;
        self.upsert_configuration(org_id, TYPE_API, &config.id, &data, &[])
            .await?;
        Ok(stored)
    }

    async fn delete_api(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        self.delete_configuration(org_id, TYPE_API, id).await
    }

    async fn get_workflow(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Workflow>, DatastoreError> {
        self.get_configuration(org_id, TYPE_WORKFLOW, id).await
    }

    async fn list_workflows(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize), DatastoreError> {
        self.list_configurations(org_id, TYPE_WORKFLOW, limit, offset)
            .await
    }

    async fn upsert_workflow(
        &self,
        org_id: &str,
        workflow: &Workflow,
    ) -> Result<Workflow, DatastoreError> {
        let mut stored = workflow.clone();
        let existing: Option<Workflow> = self
            .get_configuration(org_id, TYPE_WORKFLOW, &workflow.id)
            .await?;
        let now = OffsetDateTime::now_utc();
        stored.created_at = existing.and_then(|e| e.created_at).or(Some(now));
        stored.updated_at = Some(now);
        let data = serde_json::to_value(&stored)?;
        self.upsert_configuration(
            org_id,
            TYPE_WORKFLOW,
            &workflow.id,
            &data,
            &workflow.integration_ids,
        )
        .await?;
        Ok(stored)
    }

    async fn delete_workflow(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        self.delete_configuration(org_id, TYPE_WORKFLOW, id).await
    }

    async fn upsert_run(&self, org_id: &str, run: &RunResult) -> Result<(), DatastoreError> {
        let data = serde_json::to_value(run)?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, org_id, config_id, data, started_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id, org_id)
            DO UPDATE SET data = EXCLUDED.data,
                          config_id = EXCLUDED.config_id,
                          started_at = EXCLUDED.started_at
            "#,
        )
        .bind(&run.id)
        .bind(org_id)
        .bind(run.config.id())
        .bind(data)
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunResult>, DatastoreError> {
        let row = sqlx::query("SELECT data FROM runs WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        org_id: &str,
        limit: usize,
        offset: usize,
        config_id: Option<&str>,
    ) -> Result<(Vec<RunResult>, usize), DatastoreError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM runs
            WHERE org_id = $1 AND ($2::text IS NULL OR config_id = $2)
            "#,
        )
        .bind(org_id)
        .bind(config_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT data FROM runs
            WHERE org_id = $1 AND ($2::text IS NULL OR config_id = $2)
            ORDER BY started_at DESC, inserted_seq DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(org_id)
        .bind(config_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row.try_get("data")?;
            items.push(serde_json::from_value(data)?);
        }
        Ok((items, total as usize))
    }

    async fn delete_all_runs(&self, org_id: &str) -> Result<(), DatastoreError> {
        sqlx::query("DELETE FROM runs WHERE org_id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_integration(
        &self,
        org_id: &str,
        id: &str,
    ) -> Result<Option<Integration>, DatastoreError> {
        let row = sqlx::query("SELECT data FROM integrations WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                let mut integration: Integration = serde_json::from_value(data)?;
                integration.credentials =
                    decrypt_credentials(self.key(), &integration.credentials)?;
                Ok(Some(integration))
            }
            None => Ok(None),
        }
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
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM integrations WHERE org_id = $1")
                .bind(org_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT data FROM integrations WHERE org_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(org_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row.try_get("data")?;
            let mut integration: Integration = serde_json::from_value(data)?;
            integration.credentials = decrypt_credentials(self.key(), &integration.credentials)?;
            items.push(integration);
        }
        Ok((items, total as usize))
    }

    async fn upsert_integration(
        &self,
        org_id: &str,
        integration: &Integration,
    ) -> Result<Integration, DatastoreError> {
        let mut stored = integration.clone();
        stored.credentials = encrypt_credentials(self.key(), &integration.credentials)?;
        let now = OffsetDateTime::now_utc();
        if stored.created_at.is_none() {
            stored.created_at = Some(now);
        }
        stored.updated_at = Some(now);
        let data = serde_json::to_value(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO integrations (id, org_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (id, org_id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = now()
            "#,
        )
        .bind(&integration.id)
        .bind(org_id)
        .bind(data)
        .execute(&self.pool)
        .await?;

        let mut returned = stored;
        returned.credentials = integration.credentials.clone();
        Ok(returned)
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool, DatastoreError> {
        let result = sqlx::query("DELETE FROM integrations WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_tenant_info(&self) -> Result<TenantInfo, DatastoreError> {
        let row = sqlx::query("SELECT email, email_entry_skipped FROM tenant_info LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(TenantInfo {
                email: row.try_get("email")?,
                email_entry_skipped: row.try_get("email_entry_skipped")?,
            }),
            None => Ok(TenantInfo::default()),
        }
    }

    async fn set_tenant_info(
        &self,
        email: Option<&str>,
        email_entry_skipped: Option<bool>,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_info (singleton, email, email_entry_skipped)
            VALUES (TRUE, $1, COALESCE($2, FALSE))
            ON CONFLICT (singleton)
            DO UPDATE SET email = COALESCE($1, tenant_info.email),
                          email_entry_skipped = COALESCE($2, tenant_info.email_entry_skipped)
            "#,
        )
        .bind(email)
        .bind(email_entry_skipped)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatastoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DatastoreError> {
        self.pool.close().await;
        Ok(())
    }
}
