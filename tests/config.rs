use relaygate::app::RuntimeConfig;
use std::time::Duration;
use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> RuntimeConfig {
    RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn,
        ..Default::default()
    }
}

#[test]
fn runtime_defaults() {
    let runtime = RuntimeConfig::default();
    assert_eq!(runtime.listen, "0.0.0.0:3000");
    assert_eq!(runtime.metrics_path, "/metrics");
    assert_eq!(runtime.sync_frequency, Duration::from_secs(600));
    assert_eq!(runtime.channel_test_frequency, None);
    assert!(!runtime.batch_update_enabled);
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("relaygate.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    let settings = state.settings.load_full();
    assert_eq!(settings.pre_consumed_quota, 500);
    assert_eq!(settings.quota_per_unit, 500_000.0);
}

#[tokio::test]
async fn settings_changes_are_picked_up_by_sync() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    state
        .settings_store
        .set("retry_times", "3")
        .await
        .expect("set retry_times");
    assert_eq!(state.settings.load().retry_times, 0);
    assert_eq!(
        state.settings_store.get("retry_times").await.expect("get"),
        Some("3".to_string())
    );

    relaygate::app::sync_state(&state).await;
    assert_eq!(state.settings.load().retry_times, 3);
}
