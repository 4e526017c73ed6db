//! Configuration errors and value helpers.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Failed to parse the JSON user configuration.
    #[error("failed to parse JSON user config: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),

    /// The types database could not be read.
    #[error("failed to read types database '{}': {source}", .path.display())]
    TypesDbError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

/// Render a scalar YAML option as the string handed to a module.
///
/// Strings get environment expansion; booleans and numbers are formatted.
/// Sequences, mappings and nulls are rejected.
pub fn option_to_string(key: &str, value: &serde_yaml::Value) -> Result<String, ConfigError> {
    use serde_yaml::Value;

    match value {
        Value::String(s) => Ok(expand_env_vars(s)),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Tagged(tagged) => option_to_string(key, &tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => Err(ConfigError::ValidationError(
            format!("option '{key}' must be a string, number or boolean"),
        )),
    }
}

/// Flatten an options mapping into ordered `(key, value)` string pairs.
pub fn option_pairs(options: &serde_yaml::Mapping) -> Result<Vec<(String, String)>, ConfigError> {
    options
        .iter()
        .map(|(k, v)| {
            let key = k.as_str().ok_or_else(|| {
                ConfigError::ValidationError(format!("option key {k:?} is not a string"))
            })?;
            Ok((key.to_string(), option_to_string(key, v)?))
        })
        .collect()
}
