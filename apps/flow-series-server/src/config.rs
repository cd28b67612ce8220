use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::series::formulas::is_valid_field_name;
use crate::services::series::QueryLimits;

pub(crate) fn setup_config_path() -> Option<PathBuf> {
    env_optional_path("FLOW_SETUP_CONFIG_PATH")
}

/// Values from the optional setup file; environment variables take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    formulas_path: Option<String>,
    #[serde(default)]
    raw_fields: Option<Vec<String>>,
    #[serde(default)]
    max_limit: Option<u64>,
    #[serde(default)]
    max_variables: Option<u64>,
    #[serde(default)]
    max_window_hours: Option<u64>,
    #[serde(default)]
    request_timeout_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub formulas_path: Option<PathBuf>,
    pub raw_fields: Option<HashSet<String>>,
    pub max_limit: usize,
    pub max_variables: usize,
    pub max_window_hours: i64,
    pub request_timeout_ms: u64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let overrides = load_setup_config_overrides().unwrap_or_default();

        let database_url = env_optional_string("FLOW_DATABASE_URL")
            .or_else(|| trimmed(overrides.database_url.as_deref()))
            .context("FLOW_DATABASE_URL must be set (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let formulas_path = env_optional_path("FLOW_FORMULAS_PATH")
            .or_else(|| trimmed(overrides.formulas_path.as_deref()).map(PathBuf::from));

        let raw_fields = match env_optional_string("FLOW_RAW_FIELDS") {
            Some(raw) => Some(parse_raw_fields(raw.split(','))?),
            None => overrides
                .raw_fields
                .as_ref()
                .map(|fields| parse_raw_fields(fields.iter().map(String::as_str)))
                .transpose()?,
        };

        let max_limit = env_or_override_u64("FLOW_MAX_LIMIT", overrides.max_limit, 100_000);
        let max_variables =
            env_or_override_u64("FLOW_MAX_VARIABLES", overrides.max_variables, 32);
        let max_window_hours = env_or_override_u64(
            "FLOW_MAX_WINDOW_HOURS",
            overrides.max_window_hours,
            24 * 365,
        );
        let request_timeout_ms = env_optional_u64("FLOW_REQUEST_TIMEOUT_MS")
            .or(overrides.request_timeout_ms)
            .unwrap_or(30_000)
            .clamp(100, 600_000);

        let config = Self {
            database_url,
            formulas_path,
            raw_fields,
            max_limit: usize::try_from(max_limit).unwrap_or(usize::MAX),
            max_variables: usize::try_from(max_variables).unwrap_or(usize::MAX),
            max_window_hours: i64::try_from(max_window_hours).unwrap_or(i64::MAX),
            request_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("FLOW_DATABASE_URL resolved to an empty value");
        }
        if self.max_limit == 0 {
            anyhow::bail!("FLOW_MAX_LIMIT must be positive");
        }
        if self.max_variables == 0 {
            anyhow::bail!("FLOW_MAX_VARIABLES must be positive");
        }
        if self.max_window_hours <= 0 || self.max_window_hours > 24 * 365 * 20 {
            anyhow::bail!("FLOW_MAX_WINDOW_HOURS must be between 1 and {}", 24 * 365 * 20);
        }
        Ok(())
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            max_limit: self.max_limit,
            max_variables: self.max_variables,
            max_window: chrono::Duration::hours(self.max_window_hours),
            timeout: Duration::from_millis(self.request_timeout_ms),
            raw_fields: self.raw_fields.clone(),
        }
    }
}

fn parse_raw_fields<'a>(names: impl Iterator<Item = &'a str>) -> Result<HashSet<String>> {
    let mut out = HashSet::new();
    for name in names.map(str::trim).filter(|name| !name.is_empty()) {
        if !is_valid_field_name(name) {
            anyhow::bail!("raw field allowlist contains invalid field name \"{name}\"");
        }
        out.insert(name.to_string());
    }
    if out.is_empty() {
        anyhow::bail!("raw field allowlist is set but empty");
    }
    Ok(out)
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn env_optional_string(key: &str) -> Option<String> {
    trimmed(std::env::var(key).ok().as_deref())
}

fn env_optional_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn env_or_override_u64(key: &str, override_value: Option<u64>, default: u64) -> u64 {
    env_optional_u64(key).or(override_value).unwrap_or(default)
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
