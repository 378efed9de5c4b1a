//! Configuration parsing and override tests.

use super::*;

#[test]
fn test_default_config_is_valid_with_trust() {
    let mut config = Config::default();
    config.general.auth_method = AuthMethodName::Trust;
    config.validate().unwrap();
}

#[test]
fn test_scram_requires_users() {
    let config = Config::default();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.users.push(User {
        username: "edgedb".into(),
        password: "secret".into(),
    });
    config.validate().unwrap();
}

#[test]
fn test_parse_toml() {
    let config: Config = toml::from_str(
        r#"
        [general]
        host = "0.0.0.0"
        port = 5757
        max_server_connections = 32
        pool_hold_floor = "2s"
        query_wait_timeout = 10000
        max_message_size = "64MB"
        auth_method = "trust"

        [[users]]
        username = "edgedb"
        password = "secret"

        branches = ["main", "staging"]
        "#,
    )
    .unwrap();

    assert_eq!(config.general.host, "0.0.0.0");
    assert_eq!(config.general.port, 5757);
    assert_eq!(config.general.max_server_connections, 32);
    assert_eq!(config.general.pool_hold_floor, Duration::from_secs(2));
    assert_eq!(config.general.query_wait_timeout, Duration::from_secs(10));
    assert_eq!(config.general.max_message_size, ByteSize::from_mib(64));
    assert_eq!(config.general.auth_method, AuthMethodName::Trust);
    assert_eq!(config.users.len(), 1);
    assert!(config.branch_allowed("staging"));
    assert!(!config.branch_allowed("scratch"));
}

#[test]
fn test_empty_branches_allow_everything() {
    let config = Config::default();
    assert!(config.branch_allowed("anything"));
}

#[test]
fn test_env_overrides() {
    let mut config = Config::default();
    let env = |name: &str| -> Option<String> {
        match name {
            "GEL_HOST" => Some("10.0.0.1".into()),
            "GEL_PORT" => Some("7000".into()),
            "GEL_USER" => Some("admin".into()),
            "GEL_BRANCH" => Some("dev".into()),
            "GEL_INSTANCE" => Some("prod-1".into()),
            "GEL_SECRET_KEY" => Some("sekrit".into()),
            "GEL_SERVER_ADMIN_UI" => Some("enabled".into()),
            _ => None,
        }
    };
    apply_env_overrides(&mut config, env);

    assert_eq!(config.general.host, "10.0.0.1");
    assert_eq!(config.general.port, 7000);
    assert!(config.user("admin").is_some());
    assert_eq!(config.general.default_branch, "dev");
    assert_eq!(config.general.instance_name, "prod-1");
    assert_eq!(config.general.secret_key.as_deref(), Some("sekrit"));
    assert!(config.general.admin_ui);
}

#[test]
fn test_unknown_env_vars_are_ignored() {
    let mut config = Config::default();
    let before = config.clone();
    apply_env_overrides(&mut config, |name| {
        (name == "GEL_FROBNICATE").then(|| "yes".to_string())
    });
    assert_eq!(config, before);
}

#[test]
fn test_parse_dsn() {
    let mut config = Config::default();
    apply_env_overrides(&mut config, |name| {
        (name == "GEL_DSN").then(|| "gel://alice:pw@db.example.com:5757/staging".to_string())
    });
    assert_eq!(config.general.host, "db.example.com");
    assert_eq!(config.general.port, 5757);
    assert!(config.user("alice").is_some());
    assert_eq!(config.general.default_branch, "staging");
}

#[test]
fn test_dsn_partial_fields() {
    let mut config = Config::default();
    apply_env_overrides(&mut config, |name| {
        (name == "GEL_DSN").then(|| "gel://db.example.com".to_string())
    });
    assert_eq!(config.general.host, "db.example.com");
    assert_eq!(config.general.port, 5656);
    assert_eq!(config.general.default_branch, "main");
}
