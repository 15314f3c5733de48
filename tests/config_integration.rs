use context_relay::config::AppConfig;
use serial_test::serial;
use std::env;
use std::fs;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("RELAY_SERVER__PORT");
        env::remove_var("RELAY_SERVER__CORS_ORIGINS");
        env::remove_var("RELAY_RELAY__CHUNK_SIZE");
        env::remove_var("CONFIG_FILE");
        env::remove_var("PORT");
        env::remove_var("HOST");
    }
}

fn load() -> AppConfig {
    AppConfig::load_from_args(["context-relay"]).expect("Failed to load config")
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = load();
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.host, "0.0.0.0");
    assert!(config.server.cors_origins.is_empty());
    assert_eq!(config.relay.history_capacity, 1000);
    assert_eq!(config.relay.replay_limit, 50);
    assert_eq!(config.relay.chunk_size, 20);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("RELAY_SERVER__PORT", "9090");
        env::set_var("RELAY_RELAY__CHUNK_SIZE", "8");
    }

    let config = load();
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.relay.chunk_size, 8);

    clear_env_vars();
}

#[test]
#[serial]
fn test_cors_origins_from_env_list() {
    clear_env_vars();
    unsafe {
        env::set_var(
            "RELAY_SERVER__CORS_ORIGINS",
            "http://localhost:5173,https://app.example.com",
        );
    }

    let config = load();
    assert_eq!(
        config.server.cors_origins,
        vec!["http://localhost:5173", "https://app.example.com"]
    );

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load_via_flag() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("relay.yaml");
    fs::write(
        &file_path,
        r"
server:
  port: 7070
relay:
  replay_limit: 10
  chunk_interval_ms: 0
",
    )
    .expect("Failed to write temp config");

    let path = file_path.to_string_lossy().into_owned();
    let config = AppConfig::load_from_args(["context-relay", "--config", path.as_str()])
        .expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.relay.replay_limit, 10);
    assert_eq!(config.relay.chunk_interval_ms, 0);
    // Unset keys keep their defaults.
    assert_eq!(config.relay.history_capacity, 1000);
}

#[test]
#[serial]
fn test_file_load_via_env() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("relay.yaml");
    fs::write(&file_path, "server:\n  port: 7171\n").expect("Failed to write temp config");

    unsafe {
        env::set_var("CONFIG_FILE", &file_path);
    }

    let config = load();
    assert_eq!(config.server.port, 7171);

    clear_env_vars();
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    clear_env_vars();

    let result = AppConfig::load_from_args(["context-relay", "--config", "/nonexistent/relay.yaml"]);
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_precedence_cli_over_env_over_file() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("relay.yaml");
    fs::write(&file_path, "server:\n  port: 7000\n  host: 10.0.0.1\n")
        .expect("Failed to write temp config");
    unsafe {
        env::set_var("RELAY_SERVER__PORT", "8000");
    }

    let path = file_path.to_string_lossy().into_owned();
    let from_env = AppConfig::load_from_args(["context-relay", "--config", path.as_str()])
        .expect("env layer");
    assert_eq!(from_env.server.port, 8000);
    assert_eq!(from_env.server.host, "10.0.0.1");

    let from_cli = AppConfig::load_from_args([
        "context-relay",
        "--config",
        path.as_str(),
        "--port",
        "9000",
    ])
    .expect("cli layer");
    assert_eq!(from_cli.server.port, 9000);

    clear_env_vars();
}
