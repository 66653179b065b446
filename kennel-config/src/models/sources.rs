use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{non_empty_var, parse_bool_var};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub engine: FileEngineConfig,
    #[serde(default)]
    pub cascade: FileCascadeConfig,
    #[serde(default)]
    pub dispatcher: FileDispatcherConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_http: Option<bool>,
    /// humantime string, e.g. `"60s"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_ttl: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileEngineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_parse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_tenant: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCascadeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDispatcherConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lurcher_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_after_finished: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_region: Option<String>,
    pub storage_access_key_id: Option<String>,
    pub storage_secret_access_key: Option<String>,
    pub storage_allow_http: Option<bool>,
    pub storage_url_ttl: Option<String>,
    pub engine_auto_parse: Option<bool>,
    pub default_tenant: Option<String>,
    pub cascade_rules_source: Option<String>,
    pub cascade_rules_path: Option<PathBuf>,
    pub cascade_namespace: Option<String>,
    pub engine_address: Option<String>,
    pub dispatcher_tenant: Option<String>,
    pub dispatcher_claimant: Option<String>,
    pub dispatcher_namespace: Option<String>,
    pub dispatcher_poll_interval: Option<String>,
    pub lurcher_image: Option<String>,
    pub lurcher_service_account: Option<String>,
    pub results_dir: Option<PathBuf>,
    pub ttl_after_finished: Option<String>,
    pub hostname: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("KENNEL_CONFIG").map(PathBuf::from),
            server_host: non_empty_var("SERVER_HOST"),
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            database_url: non_empty_var("DATABASE_URL"),
            storage_bucket: non_empty_var("S3_BUCKET"),
            storage_endpoint: non_empty_var("S3_ENDPOINT"),
            storage_region: non_empty_var("S3_REGION"),
            storage_access_key_id: non_empty_var("S3_ACCESS_KEY_ID"),
            storage_secret_access_key: non_empty_var("S3_SECRET_ACCESS_KEY"),
            storage_allow_http: parse_bool_var("S3_ALLOW_HTTP"),
            storage_url_ttl: non_empty_var("S3_URL_TTL"),
            engine_auto_parse: parse_bool_var("ENGINE_AUTO_PARSE"),
            default_tenant: non_empty_var("DEFAULT_TENANT"),
            cascade_rules_source: non_empty_var("CASCADE_RULES_SOURCE"),
            cascade_rules_path: non_empty_var("CASCADE_RULES_PATH")
                .map(PathBuf::from),
            cascade_namespace: non_empty_var("CASCADE_NAMESPACE"),
            engine_address: non_empty_var("ENGINE_ADDRESS"),
            dispatcher_tenant: non_empty_var("DISPATCHER_TENANT"),
            dispatcher_claimant: non_empty_var("DISPATCHER_ENVIRONMENT_NAME"),
            dispatcher_namespace: non_empty_var("NAMESPACE"),
            dispatcher_poll_interval: non_empty_var(
                "DISPATCHER_POLL_INTERVAL",
            ),
            lurcher_image: non_empty_var("LURCHER_IMAGE"),
            lurcher_service_account: non_empty_var("LURCHER_SERVICE_ACCOUNT"),
            results_dir: non_empty_var("RESULTS_DIR").map(PathBuf::from),
            ttl_after_finished: non_empty_var("WORKLOAD_TTL_AFTER_FINISHED"),
            hostname: non_empty_var("HOSTNAME"),
        }
    }
}
