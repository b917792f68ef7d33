//! The same persistence scenarios driven against every embeddable backend.
//! The Postgres backend implements the identical trait but needs a live
//! server, so it is exercised against a real database, not here.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use time::{Duration, OffsetDateTime};

use superglue::datastore::{DataStore, FileStore, MemoryStore};
use superglue::models::api::{ApiConfig, ConfigSnapshot, RunResult};
use superglue::models::integration::Integration;
use superglue::models::workflow::Workflow;

fn encryption_key() -> Vec<u8> {
    vec![42u8; 32]
}

/// One store of each backend. The file store's temp directory rides along
/// so it stays alive for the duration of the scenario.
fn backends() -> Vec<(&'static str, Arc<dyn DataStore>, Option<tempfile::TempDir>)> {
    let file_dir = tempfile::tempdir().unwrap();
    vec![
        (
            "memory",
            Arc::new(MemoryStore::new(Some(encryption_key()))) as Arc<dyn DataStore>,
            None,
        ),
        (
            "file",
            Arc::new(FileStore::new(file_dir.path(), Some(encryption_key())).unwrap())
                as Arc<dyn DataStore>,
            Some(file_dir),
        ),
    ]
}

fn sample_config(id: &str) -> ApiConfig {
    ApiConfig {
        id: id.into(),
        url_host: "https://api.example.com".into(),
        url_path: "/v1/items".into(),
        instruction: "list the items".into(),
        ..Default::default()
    }
}

fn sample_run(id: &str, config_id: &str, started_at: OffsetDateTime) -> RunResult {
    RunResult {
        id: id.into(),
        success: true,
        data: Some(json!({"count": 2})),
        error: None,
        started_at,
        completed_at: Some(started_at),
        config: ConfigSnapshot::Api(sample_config(config_id)),
        status_code: Some(200),
        headers: HashMap::new(),
    }
}

#[tokio::test]
async fn config_upsert_get_round_trips_excluding_timestamps() {
    for (name, store, _dir) in backends() {
        let config = sample_config("round-trip");
        store.upsert_api("org", &config).await.unwrap();

        let mut fetched = store
            .get_api("org", "round-trip")
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{name}: config missing after upsert"));
        assert!(fetched.created_at.is_some(), "{name}: created_at unset");
        assert!(fetched.updated_at.is_some(), "{name}: updated_at unset");
        fetched.created_at = None;
        fetched.updated_at = None;
        assert_eq!(fetched, config, "{name}: round trip altered the config");
    }
}

#[tokio::test]
async fn entities_are_scoped_by_org() {
    for (name, store, _dir) in backends() {
        store
            .upsert_api("org-a", &sample_config("cfg"))
            .await
            .unwrap();
        assert!(
            store.get_api("org-b", "cfg").await.unwrap().is_none(),
            "{name}: config leaked across orgs"
        );
        assert!(
            !store.delete_api("org-b", "cfg").await.unwrap(),
            "{name}: delete crossed org boundary"
        );
        assert!(store.get_api("org-a", "cfg").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn runs_list_newest_first_with_filter_and_total() {
    for (name, store, _dir) in backends() {
        let base = OffsetDateTime::now_utc();
        store
            .upsert_run("org", &sample_run("r1", "a", base - Duration::minutes(2)))
            .await
            .unwrap();
        store
            .upsert_run("org", &sample_run("r2", "b", base - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .upsert_run("org", &sample_run("r3", "a", base))
            .await
            .unwrap();

        let (runs, total) = store.list_runs("org", 10, 0, None).await.unwrap();
        assert_eq!(total, 3, "{name}: wrong total");
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2", "r1"], "{name}: wrong order");

        let (filtered, total) = store.list_runs("org", 10, 0, Some("a")).await.unwrap();
        assert_eq!(total, 2, "{name}: wrong filtered total");
        assert!(
            filtered.iter().all(|r| r.config.id() == "a"),
            "{name}: filter leaked other configs"
        );

        let (paged, _) = store.list_runs("org", 1, 1, None).await.unwrap();
        assert_eq!(paged[0].id, "r2", "{name}: wrong page slice");
    }
}

#[tokio::test]
async fn integration_credentials_come_back_plaintext() {
    for (name, store, _dir) in backends() {
        let integration = Integration {
            id: "stripe".into(),
            url_host: "https://api.stripe.com".into(),
            credentials: HashMap::from([("api_key".to_string(), "sk_live_xyz".to_string())]),
            ..Default::default()
        };
        let returned = store.upsert_integration("org", &integration).await.unwrap();
        assert_eq!(
            returned.credentials["api_key"], "sk_live_xyz",
            "{name}: upsert returned ciphertext"
        );

        let fetched = store
            .get_integration("org", "stripe")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fetched.credentials["api_key"], "sk_live_xyz",
            "{name}: get returned ciphertext"
        );
    }
}

#[tokio::test]
async fn get_many_integrations_skips_missing_ids() {
    for (name, store, _dir) in backends() {
        store
            .upsert_integration(
                "org",
                &Integration {
                    id: "github".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let found = store
            .get_many_integrations("org", &["github".into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "{name}: missing ids were not skipped");
        assert_eq!(found[0].id, "github");
    }
}

#[tokio::test]
async fn workflows_round_trip_and_delete() {
    for (name, store, _dir) in backends() {
        let workflow = Workflow {
            id: "flow".into(),
            instruction: "sync the things".into(),
            integration_ids: vec!["github".into()],
            ..Default::default()
        };
        store.upsert_workflow("org", &workflow).await.unwrap();

        let mut fetched = store.get_workflow("org", "flow").await.unwrap().unwrap();
        fetched.created_at = None;
        fetched.updated_at = None;
        assert_eq!(fetched, workflow, "{name}: workflow round trip changed");

        assert!(store.delete_workflow("org", "flow").await.unwrap());
        assert!(
            store.get_workflow("org", "flow").await.unwrap().is_none(),
            "{name}: workflow survived delete"
        );
    }
}

#[tokio::test]
async fn file_store_reopens_with_runs_and_configs_intact() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::new(dir.path(), Some(encryption_key())).unwrap();
        store
            .upsert_api("org", &sample_config("persisted"))
            .await
            .unwrap();
        store
            .upsert_run("org", &sample_run("r1", "persisted", OffsetDateTime::now_utc()))
            .await
            .unwrap();
    }

    let reopened = FileStore::new(dir.path(), Some(encryption_key())).unwrap();
    assert!(reopened.get_api("org", "persisted").await.unwrap().is_some());
    let run = reopened.get_run("org", "r1").await.unwrap().unwrap();
    assert_eq!(run.config.id(), "persisted");
    let (_, total) = reopened.list_runs("org", 10, 0, None).await.unwrap();
    assert_eq!(total, 1);
}
