use thiserror::Error;

use crate::models::{Config, RulesSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn log(&self) {
        for warning in &self.items {
            match &warning.hint {
                Some(hint) => {
                    tracing::warn!(hint = %hint, "{}", warning.message)
                }
                None => tracing::warn!("{}", warning.message),
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("cascade.rules_source = \"file\" requires cascade.rules_path")]
    MissingRulesPath,
    #[error("storage.url_ttl must be greater than zero")]
    ZeroUrlTtl,
    #[error("dispatcher.poll_interval must be greater than zero")]
    ZeroPollInterval,
    #[error("dispatcher.results_dir must be an absolute path")]
    RelativeResultsDir,
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.cascade.rules_source == RulesSource::File
        && config.cascade.rules_path.is_none()
    {
        return Err(ConfigGuardRailError::MissingRulesPath);
    }
    if config.storage.url_ttl.is_zero() {
        return Err(ConfigGuardRailError::ZeroUrlTtl);
    }
    if config.dispatcher.poll_interval.is_zero() {
        return Err(ConfigGuardRailError::ZeroPollInterval);
    }
    if !config.dispatcher.results_dir.is_absolute() {
        return Err(ConfigGuardRailError::RelativeResultsDir);
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database configured; the job queue lives in memory and is lost on restart",
            "Set DATABASE_URL or [database].url to use Postgres",
        );
    }

    if config.storage.bucket.is_none() {
        warnings.push_with_hint(
            "No storage bucket configured; presigned upload URLs cannot be issued",
            "Set S3_BUCKET or [storage].bucket",
        );
    }

    if config.storage.access_key_id.is_some()
        != config.storage.secret_access_key.is_some()
    {
        warnings.push(
            "Only one of the storage access key id / secret access key is \
             set; falling back to ambient credentials",
        );
    }

    Ok(warnings)
}
