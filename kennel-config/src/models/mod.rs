pub mod sources;

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use url::Url;

pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_RESULTS_DIR: &str = "/home/kennel";
pub const DEFAULT_LURCHER_IMAGE: &str = "kennel/lurcher:latest";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "lurcher";

/// Fully resolved configuration shared by the kennel processes.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub cascade: CascadeConfig,
    pub dispatcher: DispatcherConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// When unset the engine keeps its queue in memory.
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    /// Lifetime of presigned upload and download URLs.
    pub url_ttl: Duration,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("allow_http", &self.allow_http)
            .field("url_ttl", &self.url_ttl)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Enqueue `parse:<resultType>` jobs when a scan reports its files.
    pub auto_parse: bool,
    pub default_tenant: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RulesSource {
    #[default]
    Kubernetes,
    File,
    None,
}

impl FromStr for RulesSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" | "cluster" => Ok(RulesSource::Kubernetes),
            "file" => Ok(RulesSource::File),
            "none" | "off" | "disabled" => Ok(RulesSource::None),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for RulesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RulesSource::Kubernetes => "kubernetes",
            RulesSource::File => "file",
            RulesSource::None => "none",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub rules_source: RulesSource,
    pub rules_path: Option<PathBuf>,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub engine_address: Url,
    pub tenant: String,
    /// Recorded on every job this dispatcher claims.
    pub claimant: String,
    pub namespace: String,
    pub poll_interval: Duration,
    pub lurcher_image: String,
    pub service_account: String,
    /// Shared volume mount path inside scan workloads.
    pub results_dir: PathBuf,
    pub ttl_after_finished: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
