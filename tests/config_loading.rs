use cadence_core::config::AppConfig;
use cadence_core::CadenceError;
use cadence_test_utils::fixtures::temp_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[store]
path = "/tmp/cadence-test/cadence.db"

[scheduler]
tick_interval_secs = 15
page_size = 50
max_concurrency = 4
utc_offset_hours = 9
default_send_time = "09:30"

[delivery]
webhook_url = "https://hooks.example.com/cadence"
token = "test-token"
timeout_secs = 3
"#;

    let tmp = temp_config(toml_content);
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.store_path().to_str(), Some("/tmp/cadence-test/cadence.db"));
    assert_eq!(config.scheduler.tick_interval_secs, 15);
    assert_eq!(config.scheduler.page_size, 50);
    assert_eq!(config.scheduler.max_concurrency, 4);
    assert_eq!(config.scheduler.timezone().unwrap().local_minus_utc(), 9 * 3600);
    assert_eq!(
        config.scheduler.anchor_time().unwrap(),
        chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap()
    );
    assert_eq!(
        config.delivery.webhook_url.as_deref(),
        Some("https://hooks.example.com/cadence")
    );
    assert_eq!(config.delivery.token.as_deref(), Some("test-token"));
    assert_eq!(config.delivery.timeout_secs, 3);
}

#[test]
fn test_partial_config_uses_defaults() {
    let tmp = temp_config("[scheduler]\npage_size = 10\n");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.page_size, 10);
    assert_eq!(config.scheduler.tick_interval_secs, 60);
    assert_eq!(config.scheduler.max_concurrency, 8);
    assert_eq!(config.scheduler.default_send_time, "10:00");
    assert!(config.delivery.webhook_url.is_none());
    assert_eq!(config.delivery.timeout_secs, 10);
    assert!(config.store_path().ends_with(".cadence/cadence.db"));
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("CADENCE_TEST_WEBHOOK_TOKEN", "from-env");
    let tmp = temp_config("[delivery]\ntoken = \"${CADENCE_TEST_WEBHOOK_TOKEN}\"\n");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.delivery.token.as_deref(), Some("from-env"));
    std::env::remove_var("CADENCE_TEST_WEBHOOK_TOKEN");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/cadence.toml")).unwrap_err();
    assert!(matches!(err, CadenceError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_rejected() {
    let tmp = temp_config("[scheduler\npage_size = ");
    assert!(matches!(
        AppConfig::load(tmp.path()).unwrap_err(),
        CadenceError::Config(_)
    ));
}
