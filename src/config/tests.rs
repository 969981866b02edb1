//! Config module tests

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MESHMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MESHMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MESHMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("MESHMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MESHMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("MESHMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MESHMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MESHMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MESHMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MESHMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("meshmq.toml");

    std::env::set_var("MESHMQ_TEST_ROUTE_HOST", "10.0.0.7");

    let config_content = r#"
[server]
bind = "127.0.0.1:4333"

[cluster]
enabled = true
listen = "127.0.0.1:${MESHMQ_TEST_CLUSTER_PORT:-6333}"
routes = ["nats-route://${MESHMQ_TEST_ROUTE_HOST}:6222"]
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:4333");
    assert_eq!(config.cluster.listen.to_string(), "127.0.0.1:6333");
    assert_eq!(config.cluster.routes.len(), 1);
    assert_eq!(config.cluster.routes[0].to_string(), "10.0.0.7:6222");
    // Defaults applied for everything not in the file
    assert_eq!(config.cluster.ping_interval, Duration::from_secs(30));

    std::env::remove_var("MESHMQ_TEST_ROUTE_HOST");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 4222);
}

#[test]
fn test_load_existing_requires_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load_existing(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 4222);
    assert!(config.server.id.is_none());
    assert_eq!(config.limits.max_payload, 1024 * 1024);
    assert_eq!(config.limits.max_connections, 65_536);
    assert!(!config.cluster.enabled);
    assert!(!config.monitor.enabled);
}

#[test]
fn test_parse_minimal_config() {
    let toml = r#"
[server]
bind = "127.0.0.1:4222"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:4222");
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[server]
id = "NODE-A"
name = "node-a"
bind = "127.0.0.1:4222"
verbose = true

[limits]
max_payload = 65536
max_connections = 100
max_pending_bytes = 1048576

[cluster]
enabled = true
name = "c1"
listen = "127.0.0.1:6222"
routes = ["nats-route://127.0.0.1:6223", "127.0.0.1:6224"]
connect_timeout = "500ms"
handshake_timeout = "1s"
connect_retry_initial = "50ms"
connect_retry_max = "2s"
ping_interval = "10s"
max_pings_out = 3

[monitor]
enabled = true
bind = "127.0.0.1:8222"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.id.as_deref(), Some("NODE-A"));
    assert_eq!(config.server.name.as_deref(), Some("node-a"));
    assert!(config.server.verbose);
    assert_eq!(config.limits.max_payload, 65536);
    assert_eq!(config.limits.max_connections, 100);
    assert!(config.cluster.enabled);
    assert_eq!(config.cluster.name.as_deref(), Some("c1"));
    assert_eq!(
        config
            .cluster
            .routes
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>(),
        vec!["127.0.0.1:6223".to_string(), "127.0.0.1:6224".to_string()]
    );
    assert_eq!(config.cluster.connect_timeout, Duration::from_millis(500));
    assert_eq!(config.cluster.handshake_timeout, Duration::from_secs(1));
    assert_eq!(config.cluster.connect_retry_initial, Duration::from_millis(50));
    assert_eq!(config.cluster.connect_retry_max, Duration::from_secs(2));
    assert_eq!(config.cluster.ping_interval, Duration::from_secs(10));
    assert_eq!(config.cluster.max_pings_out, 3);
    assert!(config.monitor.enabled);
}

#[test]
fn test_invalid_route_url() {
    let toml = r#"
[cluster]
routes = ["nats-route://127.0.0.1"]
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_max_payload() {
    let toml = r#"
[limits]
max_payload = 0
"#;

    assert!(matches!(
        Config::parse(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_invalid_server_id() {
    let toml = r#"
[server]
id = "has space"
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_retry_bounds() {
    let toml = r#"
[cluster]
enabled = true
connect_retry_initial = "10s"
connect_retry_max = "1s"
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_reload_allows_route_changes() {
    let old = Config::parse(
        r#"
[cluster]
enabled = true
listen = "127.0.0.1:6222"
routes = ["127.0.0.1:6223"]
"#,
    )
    .unwrap();
    let new = Config::parse(
        r#"
[cluster]
enabled = true
listen = "127.0.0.1:6222"
routes = ["127.0.0.1:6223", "127.0.0.1:6224"]
ping_interval = "5s"

[limits]
max_payload = 4096
"#,
    )
    .unwrap();

    assert!(old.check_reloadable(&new).is_ok());
}

#[test]
fn test_reload_rejects_listener_changes() {
    let old = Config::parse(
        r#"
[cluster]
enabled = true
listen = "127.0.0.1:6222"
"#,
    )
    .unwrap();

    let moved = Config::parse(
        r#"
[cluster]
enabled = true
listen = "127.0.0.1:7222"
"#,
    )
    .unwrap();
    assert!(matches!(
        old.check_reloadable(&moved),
        Err(ReloadError::NotReloadable("cluster.listen"))
    ));

    let disabled = Config::parse(
        r#"
[cluster]
enabled = false
listen = "127.0.0.1:6222"
"#,
    )
    .unwrap();
    assert!(matches!(
        old.check_reloadable(&disabled),
        Err(ReloadError::NotReloadable("cluster.enabled"))
    ));

    let renamed = Config::parse(
        r#"
[server]
name = "other"

[cluster]
enabled = true
listen = "127.0.0.1:6222"
"#,
    )
    .unwrap();
    assert!(matches!(
        old.check_reloadable(&renamed),
        Err(ReloadError::NotReloadable("server.name"))
    ));
}
