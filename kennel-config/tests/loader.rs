use std::io::Write;

use kennel_config::{ConfigLoadError, ConfigLoader, RulesSource};

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = ConfigLoader::new()
        .with_config_path(&missing)
        .with_env_file(dir.path().join(".env"))
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { path } if path == missing));
}

#[test]
fn loads_explicit_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kennel.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[engine]
default_tenant = "acme-loader-test"
auto_parse = false

[cascade]
rules_source = "file"
rules_path = "/etc/kennel/rules.json"

[dispatcher]
ttl_after_finished = "10m"
"#
    )
    .unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join(".env"))
        .load()
        .unwrap();

    assert_eq!(load.config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert!(!load.config.metadata.env_file_loaded);
    assert_eq!(load.config.engine.default_tenant, "acme-loader-test");
    assert!(!load.config.engine.auto_parse);
    assert_eq!(load.config.cascade.rules_source, RulesSource::File);
    assert_eq!(
        load.config.dispatcher.ttl_after_finished,
        std::time::Duration::from_secs(600)
    );
}

#[test]
fn malformed_toml_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kennel.toml");
    std::fs::write(&path, "[server\nport = 1").unwrap();
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join(".env"))
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}
