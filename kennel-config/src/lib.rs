//! Configuration loading for kennel processes.
//!
//! Values are resolved from, in increasing priority: built-in defaults, a
//! TOML file (explicit path, `KENNEL_CONFIG`, or `kennel.toml` /
//! `config/kennel.toml`), and process environment (after `.env` is loaded).

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions,
    compose_config,
};
pub use models::{
    CascadeConfig, Config, ConfigMetadata, DatabaseConfig, DispatcherConfig,
    EngineConfig, RulesSource, ServerConfig, StorageConfig,
    sources::{EnvConfig, FileConfig},
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
