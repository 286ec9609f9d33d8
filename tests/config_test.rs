use std::time::Duration;

use offline_queue::QueueConfig;

// Env-var cases share one test: the process environment is global and tests
// run in parallel.
#[test]
fn config_from_env() {
    let vars = [
        "OFFQ_MAX_SIZE",
        "OFFQ_DEFAULT_MAX_RETRIES",
        "OFFQ_RETRY_INTERVAL_MS",
        "OFFQ_PERSIST",
        "OFFQ_STORAGE_KEY",
        "OFFQ_OPERATION_TTL_SECS",
    ];
    unsafe {
        for var in vars {
            std::env::remove_var(var);
        }
    }

    let config = QueueConfig::from_env().unwrap();
    assert_eq!(config, QueueConfig::default());

    unsafe {
        std::env::set_var("OFFQ_MAX_SIZE", "50");
        std::env::set_var("OFFQ_RETRY_INTERVAL_MS", "250");
        std::env::set_var("OFFQ_PERSIST", "false");
        std::env::set_var("OFFQ_OPERATION_TTL_SECS", "3600");
    }
    let config = QueueConfig::from_env().unwrap();
    assert_eq!(config.max_size, 50);
    assert_eq!(config.retry_interval(), Duration::from_millis(250));
    assert!(!config.persist_to_storage);
    assert_eq!(config.operation_ttl(), Some(Duration::from_secs(3600)));

    unsafe {
        std::env::set_var("OFFQ_MAX_SIZE", "lots");
    }
    assert!(QueueConfig::from_env().is_err());

    unsafe {
        std::env::set_var("OFFQ_MAX_SIZE", "0");
    }
    assert!(QueueConfig::from_env().is_err());

    unsafe {
        for var in vars {
            std::env::remove_var(var);
        }
    }
}

#[test]
fn config_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.toml");
    std::fs::write(
        &path,
        r#"
max_size = 20
default_max_retries = 5
storage_key = "app:outbox"
"#,
    )
    .unwrap();

    let config = QueueConfig::from_toml_file(&path).unwrap();
    assert_eq!(config.max_size, 20);
    assert_eq!(config.default_max_retries, 5);
    assert_eq!(config.storage_key, "app:outbox");
    assert!(config.persist_to_storage);
}

#[test]
fn config_from_missing_file_fails() {
    let result = QueueConfig::from_toml_file(std::path::Path::new("/nonexistent/queue.toml"));
    assert!(result.is_err());
}
