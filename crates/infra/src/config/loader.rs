//! Configuration loader
//!
//! Loads service configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. Reads a `.env` file into the environment when one exists
//! 2. Attempts to load from environment variables
//! 3. If `STACK_QUEUE_BACKEND` is missing, falls back to loading from file
//! 4. Probes multiple paths for config files
//! 5. Supports JSON and TOML formats
//!
//! ## Environment Variables
//! - `STACK_QUEUE_BACKEND` (required): `memory` or `redis`
//! - `STACK_REDIS_URL`: Redis connection URL
//! - `STACK_QUEUE_MAX_RETRIES`: default job retry budget
//! - `STACK_RETRY_PRESET`: named retry policy (`standard`, `external_api`, ...)
//! - `STACK_RETRY_MAX_ATTEMPTS`: attempts per guarded call
//! - `STACK_RATE_PER_MINUTE`, `STACK_RATE_BURST`: token bucket
//! - `STACK_BREAKER_TIMEOUT_SECS`: Open-state timeout
//! - `STACK_BREAKER_CONSECUTIVE_FAILURES`: trip threshold
//! - `STACK_WORKERS`: worker pool size
//! - `STACK_POLL_INTERVAL_MS`: worker poll interval
//! - `STACK_SWEEP_INTERVAL_SECS`: scheduled-set sweep interval
//! - `STACK_JOB_TIMEOUT_SECS`: per-job timeout
//! - `STACK_LOG_LEVEL`: log filter directive
//! - `STACK_LOG_JSON`: JSON log output (true/false)
//!
//! ## File Locations
//! The loader searches the following paths (in order):
//! 1. `./stack.toml`, `./stack.json`, `./config.toml`, `./config.json`
//! 2. The same names in `../` and `../../`
//! 3. The same names relative to the executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use stack_common::error::{CommonError, CommonResult};
use stack_common::resilience::RetryPolicy;

use super::types::{BackendKind, StackConfig};
use crate::logging::LogFormat;

const CONFIG_FILE_NAMES: [&str; 4] = ["stack.toml", "stack.json", "config.toml", "config.json"];

/// Load configuration with automatic fallback strategy
///
/// First attempts to load from environment variables. If the required
/// variable is missing or invalid, falls back to loading from a config file.
///
/// # Errors
/// Returns `CommonError::Config` if:
/// - Configuration cannot be loaded from either source
/// - File format is invalid
/// - A section fails validation
pub fn load() -> CommonResult<StackConfig> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }

    match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            Ok(config)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to load from environment, trying file");
            load_from_file(None)
        }
    }
}

/// Load configuration from environment variables
///
/// Only `STACK_QUEUE_BACKEND` is required; every other variable overrides
/// the matching default.
///
/// # Errors
/// Returns `CommonError::Config` if the required variable is missing or any
/// variable has an invalid value.
pub fn load_from_env() -> CommonResult<StackConfig> {
    let mut config = StackConfig::default();

    config.queue.backend = env_var("STACK_QUEUE_BACKEND")?
        .parse::<BackendKind>()
        .map_err(|e| CommonError::config_field("STACK_QUEUE_BACKEND", e))?;
    config.queue.redis_url = std::env::var("STACK_REDIS_URL").ok();
    if let Some(retries) = env_parse::<u32>("STACK_QUEUE_MAX_RETRIES")? {
        config.queue.default_max_retries = retries;
    }

    if let Ok(preset) = std::env::var("STACK_RETRY_PRESET") {
        config.retry = RetryPolicy::preset(&preset).ok_or_else(|| {
            CommonError::config_field("STACK_RETRY_PRESET", format!("Unknown preset: {preset}"))
        })?;
    }
    if let Some(attempts) = env_parse::<u32>("STACK_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = attempts;
    }

    if let Some(rate) = env_parse::<u32>("STACK_RATE_PER_MINUTE")? {
        config.rate_limit.rate_per_minute = rate;
    }
    if let Some(burst) = env_parse::<u32>("STACK_RATE_BURST")? {
        config.rate_limit.burst = burst;
    }

    if let Some(secs) = env_parse::<u64>("STACK_BREAKER_TIMEOUT_SECS")? {
        config.breaker.timeout = Duration::from_secs(secs);
    }
    if let Some(threshold) = env_parse::<u32>("STACK_BREAKER_CONSECUTIVE_FAILURES")? {
        config.breaker.consecutive_failures = Some(threshold);
    }

    if let Some(workers) = env_parse::<usize>("STACK_WORKERS")? {
        config.worker.workers = workers;
    }
    if let Some(millis) = env_parse::<u64>("STACK_POLL_INTERVAL_MS")? {
        config.worker.poll_interval = Duration::from_millis(millis);
    }
    if let Some(secs) = env_parse::<u64>("STACK_SWEEP_INTERVAL_SECS")? {
        config.worker.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_parse::<u64>("STACK_JOB_TIMEOUT_SECS")? {
        config.worker.job_timeout = Duration::from_secs(secs);
    }

    if let Ok(level) = std::env::var("STACK_LOG_LEVEL") {
        config.log.level = level;
    }
    if env_bool("STACK_LOG_JSON", false) {
        config.log.format = LogFormat::Json;
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, searches multiple locations for config files.
/// Supports both JSON and TOML formats (detected by file extension).
///
/// # Errors
/// Returns `CommonError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
/// - A section fails validation
pub fn load_from_file(path: Option<PathBuf>) -> CommonResult<StackConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(CommonError::config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => candidate_config_paths().ok_or_else(|| {
            CommonError::config("No config file found in any of the standard locations")
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| CommonError::config(format!("Failed to read config file: {e}")))?;

    let config = parse_config(&contents, &config_path)?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
fn parse_config(contents: &str, path: &Path) -> CommonResult<StackConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| CommonError::config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| CommonError::config(format!("Invalid JSON format: {e}"))),
        _ => Err(CommonError::config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe multiple paths for configuration files
///
/// Searches the current working directory, its two parents, then the same
/// three levels relative to the executable.
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn candidate_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            roots.push(exe_dir.to_path_buf());
        }
    }

    roots
        .iter()
        .flat_map(|root| [root.clone(), root.join(".."), root.join("../..")])
        .flat_map(|dir| CONFIG_FILE_NAMES.map(|name| dir.join(name)))
        .find(|path| path.exists())
}

/// Get required environment variable
fn env_var(key: &str) -> CommonResult<String> {
    std::env::var(key).map_err(|_| {
        CommonError::config(format!("Missing required environment variable: {key}"))
    })
}

/// Parse an optional environment variable
///
/// # Errors
/// Returns `CommonError::Config` when the variable is set but unparsable.
fn env_parse<T>(key: &str) -> CommonResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CommonError::config_field(key, format!("Invalid value '{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use once_cell::sync::Lazy;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::jobs::JobBackoff;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const STACK_VARS: [&str; 15] = [
        "STACK_QUEUE_BACKEND",
        "STACK_REDIS_URL",
        "STACK_QUEUE_MAX_RETRIES",
        "STACK_RETRY_PRESET",
        "STACK_RETRY_MAX_ATTEMPTS",
        "STACK_RATE_PER_MINUTE",
        "STACK_RATE_BURST",
        "STACK_BREAKER_TIMEOUT_SECS",
        "STACK_BREAKER_CONSECUTIVE_FAILURES",
        "STACK_WORKERS",
        "STACK_POLL_INTERVAL_MS",
        "STACK_SWEEP_INTERVAL_SECS",
        "STACK_JOB_TIMEOUT_SECS",
        "STACK_LOG_LEVEL",
        "STACK_LOG_JSON",
    ];

    fn clear_stack_vars() {
        for key in STACK_VARS {
            std::env::remove_var(key);
        }
    }

    fn write_temp(contents: &str, extension: &str) -> PathBuf {
        let mut temp_file = NamedTempFile::new().expect("create temp file");
        temp_file.write_all(contents.as_bytes()).expect("write temp file");
        let path = temp_file.path().with_extension(extension);
        std::fs::copy(temp_file.path(), &path).expect("copy temp file");
        path
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        for (key, value) in [
            ("TEST_STACK_BOOL_1", "1"),
            ("TEST_STACK_BOOL_TRUE", "true"),
            ("TEST_STACK_BOOL_YES", "yes"),
            ("TEST_STACK_BOOL_ON", "on"),
            ("TEST_STACK_BOOL_UPPER", "TRUE"),
        ] {
            std::env::set_var(key, value);
            assert!(env_bool(key, false), "{key}={value}");
            std::env::remove_var(key);
        }

        for (key, value) in [
            ("TEST_STACK_BOOL_0", "0"),
            ("TEST_STACK_BOOL_FALSE", "false"),
            ("TEST_STACK_BOOL_NO", "no"),
            ("TEST_STACK_BOOL_OFF", "off"),
        ] {
            std::env::set_var(key, value);
            assert!(!env_bool(key, true), "{key}={value}");
            std::env::remove_var(key);
        }

        std::env::remove_var("TEST_STACK_BOOL_MISSING");
        assert!(env_bool("TEST_STACK_BOOL_MISSING", true));
        assert!(!env_bool("TEST_STACK_BOOL_MISSING", false));
    }

    #[test]
    fn test_load_from_env_overrides_defaults() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_stack_vars();

        std::env::set_var("STACK_QUEUE_BACKEND", "redis");
        std::env::set_var("STACK_REDIS_URL", "redis://localhost:6379/2");
        std::env::set_var("STACK_QUEUE_MAX_RETRIES", "5");
        std::env::set_var("STACK_RETRY_PRESET", "external_api");
        std::env::set_var("STACK_RATE_PER_MINUTE", "120");
        std::env::set_var("STACK_RATE_BURST", "20");
        std::env::set_var("STACK_BREAKER_CONSECUTIVE_FAILURES", "3");
        std::env::set_var("STACK_WORKERS", "8");
        std::env::set_var("STACK_JOB_TIMEOUT_SECS", "60");
        std::env::set_var("STACK_LOG_JSON", "yes");

        let result = load_from_env();
        clear_stack_vars();

        let config = result.expect("config from env");
        assert_eq!(config.queue.backend, BackendKind::Redis);
        assert_eq!(config.queue.redis_url.as_deref(), Some("redis://localhost:6379/2"));
        assert_eq!(config.queue.default_max_retries, 5);
        assert_eq!(Some(config.retry.clone()), RetryPolicy::preset("external_api"));
        assert_eq!(config.rate_limit.rate_per_minute, 120);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.breaker.consecutive_failures, Some(3));
        assert_eq!(config.worker.workers, 8);
        assert_eq!(config.worker.job_timeout, Duration::from_secs(60));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_env_missing_backend() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_stack_vars();

        let err = load_from_env().expect_err("backend is required");
        assert!(matches!(err, CommonError::Config { .. }));
        assert!(err.to_string().contains("STACK_QUEUE_BACKEND"));
    }

    #[test]
    fn test_load_from_env_invalid_number() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_stack_vars();

        std::env::set_var("STACK_QUEUE_BACKEND", "memory");
        std::env::set_var("STACK_WORKERS", "many");
        let result = load_from_env();
        clear_stack_vars();

        let err = result.expect_err("invalid worker count");
        assert!(err.to_string().contains("STACK_WORKERS"));
    }

    #[test]
    fn test_load_from_env_rejects_redis_without_url() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_stack_vars();

        std::env::set_var("STACK_QUEUE_BACKEND", "redis");
        let result = load_from_env();
        clear_stack_vars();

        assert!(result.is_err(), "redis backend needs a URL");
    }

    #[test]
    fn test_load_from_file_json() {
        let path = write_temp(
            r#"{
                "queue": { "backend": "memory", "default_max_retries": 4 },
                "worker": { "workers": 2, "poll_interval": 250 },
                "rate_limit": { "rate_per_minute": 30, "burst": 3 }
            }"#,
            "json",
        );

        let config = load_from_file(Some(path.clone())).expect("config from JSON file");
        assert_eq!(config.queue.default_max_retries, 4);
        assert_eq!(config.worker.workers, 2);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.job_timeout, Duration::from_secs(300));
        assert_eq!(config.rate_limit.burst, 3);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_from_file_toml() {
        let path = write_temp(
            r#"
[queue]
backend = "memory"

[queue.backoff]
kind = "fixed"
delay = 30000

[breaker]
timeout = 15000
consecutive_failures = 5

[log]
level = "debug"
format = "json"
"#,
            "toml",
        );

        let config = load_from_file(Some(path.clone())).expect("config from TOML file");
        assert_eq!(config.queue.backoff, JobBackoff::Fixed { delay: Duration::from_secs(30) });
        assert_eq!(config.breaker.timeout, Duration::from_secs(15));
        assert_eq!(config.breaker.consecutive_failures, Some(5));
        assert_eq!(config.breaker.max_trial_requests, 3);
        assert_eq!(config.log.level, "debug");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_from_file_not_found() {
        let result = load_from_file(Some(PathBuf::from("/nonexistent/stack.toml")));
        assert!(matches!(result, Err(CommonError::Config { .. })));
    }

    #[test]
    fn test_load_from_file_invalid_json() {
        let path = write_temp(r#"{ "this is": "not valid json" "#, "json");
        let result = load_from_file(Some(path.clone()));
        assert!(result.is_err(), "Should fail with invalid JSON");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_from_file_runs_validation() {
        let path = write_temp(r#"{ "worker": { "workers": 0 } }"#, "json");
        let result = load_from_file(Some(path.clone()));
        assert!(result.is_err(), "zero workers must be rejected");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_parse_config_unsupported_format() {
        let result = parse_config("some content", &PathBuf::from("stack.yaml"));
        let err = result.expect_err("yaml is not supported");
        assert!(err.to_string().contains("Unsupported config format"));
    }

    #[test]
    fn test_parse_config_empty_documents_use_defaults() {
        let config = parse_config("{}", &PathBuf::from("stack.json")).expect("empty json");
        assert_eq!(config, StackConfig::default());
        let config = parse_config("", &PathBuf::from("stack.toml")).expect("empty toml");
        assert_eq!(config, StackConfig::default());
    }
}
