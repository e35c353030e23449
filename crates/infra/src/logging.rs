//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the configured level is used.

use serde::{Deserialize, Serialize};
use stack_common::error::{CommonError, CommonResult};
use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

stack_common::impl_label_conversions!(LogFormat {
    Pretty => "pretty",
    Json => "json",
});

/// Logging section of the service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive, e.g. `info` or `stack_infra=debug,info`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Install the global subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed, so calling
/// this twice is harmless.
pub fn init(settings: &LogSettings) -> CommonResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            CommonError::config_field("log.level", format!("Invalid log filter: {e}"))
        })?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match settings.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.try_init().is_ok(),
    };

    if installed {
        tracing::debug!(level = %settings.level, format = %settings.format, "Logging initialised");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let settings = LogSettings::default();
        let first = init(&settings).expect("valid settings");
        let second = init(&settings).expect("valid settings");
        assert!(!second || !first);
    }

    #[test]
    fn log_format_parses_labels() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        let settings: LogSettings =
            serde_json::from_str(r#"{"format":"json"}"#).expect("partial settings");
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Json);
    }
}
