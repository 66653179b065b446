use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use crate::{
    models::{
        CascadeConfig, Config, ConfigMetadata, DEFAULT_LURCHER_IMAGE,
        DEFAULT_RESULTS_DIR, DEFAULT_SERVICE_ACCOUNT, DEFAULT_TENANT,
        DatabaseConfig, DispatcherConfig, EngineConfig, RulesSource,
        ServerConfig, StorageConfig,
        sources::{EnvConfig, FileConfig},
    },
    util::parse_duration,
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["kennel.toml", "config/kennel.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, then the TOML file, then overlays process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let mut load = compose_config(file_config, env_config, config_path)?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) =
            if let Some(explicit) = &self.options.config_path {
                (Some(explicit.clone()), true)
            } else if let Some(from_env) = &env_config.config_path {
                (Some(from_env.clone()), true)
            } else {
                let found = DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .map(PathBuf::from)
                    .find(|candidate| candidate.exists());
                (found, false)
            };

        let Some(path) = path else {
            return Ok((None, None));
        };
        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merges file and environment sources into a [`Config`]. Environment
/// values win over file values; defaults fill the rest.
pub fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No kennel.toml detected; falling back to environment variables",
            "Set KENNEL_CONFIG or place kennel.toml in the working directory",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        storage: file_storage,
        engine: file_engine,
        cascade: file_cascade,
        dispatcher: file_dispatcher,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(3000),
    };

    let database = DatabaseConfig {
        url: env
            .database_url
            .or(file_database.url)
            .filter(|url| !url.trim().is_empty()),
    };

    let storage = StorageConfig {
        bucket: env.storage_bucket.or(file_storage.bucket),
        endpoint: env.storage_endpoint.or(file_storage.endpoint),
        region: env
            .storage_region
            .or(file_storage.region)
            .unwrap_or_else(|| "us-east-1".to_string()),
        access_key_id: env.storage_access_key_id.or(file_storage.access_key_id),
        secret_access_key: env
            .storage_secret_access_key
            .or(file_storage.secret_access_key),
        allow_http: env
            .storage_allow_http
            .or(file_storage.allow_http)
            .unwrap_or(false),
        url_ttl: duration_field(
            "storage.url_ttl",
            env.storage_url_ttl.or(file_storage.url_ttl),
            Duration::from_secs(60),
        )?,
    };

    let default_tenant = env
        .default_tenant
        .or(file_engine.default_tenant)
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());

    let engine = EngineConfig {
        auto_parse: env
            .engine_auto_parse
            .or(file_engine.auto_parse)
            .unwrap_or(true),
        default_tenant: default_tenant.clone(),
    };

    let rules_source = match env.cascade_rules_source.or(file_cascade.rules_source)
    {
        Some(raw) => raw
            .parse::<RulesSource>()
            .map_err(ConfigLoadError::InvalidRulesSource)?,
        None => RulesSource::default(),
    };
    let namespace = env
        .dispatcher_namespace
        .clone()
        .or(file_dispatcher.namespace)
        .unwrap_or_else(|| "default".to_string());

    let cascade = CascadeConfig {
        rules_source,
        rules_path: env.cascade_rules_path.or(file_cascade.rules_path),
        namespace: env
            .cascade_namespace
            .or(file_cascade.namespace)
            .unwrap_or_else(|| namespace.clone()),
    };

    let raw_engine_address = env
        .engine_address
        .or(file_dispatcher.engine_address)
        .unwrap_or_else(|| "http://localhost:3000".to_string());
    let engine_address = Url::parse(&raw_engine_address).map_err(|source| {
        ConfigLoadError::InvalidUrl {
            field: "dispatcher.engine_address",
            value: raw_engine_address.clone(),
            source,
        }
    })?;

    let dispatcher = DispatcherConfig {
        engine_address,
        tenant: env
            .dispatcher_tenant
            .or(file_dispatcher.tenant)
            .unwrap_or(default_tenant),
        claimant: env
            .dispatcher_claimant
            .or(file_dispatcher.claimant)
            .or(env.hostname)
            .unwrap_or_else(|| "kennel-dispatcher".to_string()),
        namespace,
        poll_interval: duration_field(
            "dispatcher.poll_interval",
            env.dispatcher_poll_interval.or(file_dispatcher.poll_interval),
            Duration::from_secs(1),
        )?,
        lurcher_image: env
            .lurcher_image
            .or(file_dispatcher.lurcher_image)
            .unwrap_or_else(|| DEFAULT_LURCHER_IMAGE.to_string()),
        service_account: env
            .lurcher_service_account
            .or(file_dispatcher.service_account)
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string()),
        results_dir: env
            .results_dir
            .or(file_dispatcher.results_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_DIR)),
        ttl_after_finished: duration_field(
            "dispatcher.ttl_after_finished",
            env.ttl_after_finished.or(file_dispatcher.ttl_after_finished),
            Duration::from_secs(300),
        )?,
    };

    let config = Config {
        server,
        database,
        storage,
        engine,
        cascade,
        dispatcher,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    };

    warnings.extend(validation::apply_guard_rails(&config)?);

    Ok(ConfigLoad { config, warnings })
}

fn duration_field(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        Some(value) => parse_duration(&value).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                field,
                value,
                source,
            }
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid URL '{value}' for {field}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error(
        "unknown cascade rules source '{0}' (expected kubernetes, file or none)"
    )]
    InvalidRulesSource(String),
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
