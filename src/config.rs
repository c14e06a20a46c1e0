use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

const ENV_FILE_ENV: &str = "EVERGREEN_ENV_FILE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub jenkins_home: PathBuf,
    pub jenkins_url: String,
    pub endpoint: String,
    pub instance_id: Option<String>,
    pub directory_token: Option<String>,
    pub supervisor_url: String,
    pub process_name: String,
    pub snapshotting_enabled: bool,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub download: RetryPolicy,
    pub health_identity: RetryPolicy,
    pub health_metrics: RetryPolicy,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let data_dir = read_non_empty_env("EVERGREEN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let jenkins_home = read_non_empty_env("EVERGREEN_JENKINS_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./jenkins_home"));

        Ok(Self {
            data_dir,
            jenkins_home,
            jenkins_url: read_non_empty_env("EVERGREEN_JENKINS_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            endpoint: read_non_empty_env("EVERGREEN_ENDPOINT")
                .unwrap_or_else(|| "http://127.0.0.1:3030".to_string()),
            instance_id: read_non_empty_env("EVERGREEN_INSTANCE_ID"),
            directory_token: read_non_empty_env("EVERGREEN_DIRECTORY_TOKEN"),
            supervisor_url: read_non_empty_env("EVERGREEN_SUPERVISOR_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9001/RPC2".to_string()),
            process_name: read_non_empty_env("EVERGREEN_PROCESS_NAME")
                .unwrap_or_else(|| "jenkins".to_string()),
            snapshotting_enabled: !read_bool_env("EVERGREEN_DISABLE_SNAPSHOTTING", false),
            poll_interval_secs: read_u64_env("EVERGREEN_POLL_INTERVAL_SECS", 300),
            request_timeout_secs: read_u64_env("EVERGREEN_REQUEST_TIMEOUT_SECS", 30),
            download: read_retry_policy("EVERGREEN_DOWNLOAD", RetryPolicy::download()),
            health_identity: read_retry_policy(
                "EVERGREEN_HEALTH_IDENTITY",
                RetryPolicy::identity_probe(),
            ),
            health_metrics: read_retry_policy(
                "EVERGREEN_HEALTH_METRICS",
                RetryPolicy::metrics_probe(),
            ),
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        if self.poll_interval_secs == 0 {
            warnings.push("EVERGREEN_POLL_INTERVAL_SECS should be > 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            warnings.push("EVERGREEN_REQUEST_TIMEOUT_SECS should be > 0".to_string());
        }
        for (prefix, policy) in [
            ("EVERGREEN_DOWNLOAD", self.download),
            ("EVERGREEN_HEALTH_IDENTITY", self.health_identity),
            ("EVERGREEN_HEALTH_METRICS", self.health_metrics),
        ] {
            if policy.backoff_factor < 1.0 {
                warnings.push(format!(
                    "{prefix}_BACKOFF_FACTOR is below 1.0; retry delays will shrink"
                ));
            }
        }
        if !self.snapshotting_enabled {
            warnings.push(
                "EVERGREEN_DISABLE_SNAPSHOTTING=true; failed updates cannot revert JENKINS_HOME"
                    .to_string(),
            );
        }
        for (key, url) in [
            ("EVERGREEN_JENKINS_URL", &self.jenkins_url),
            ("EVERGREEN_ENDPOINT", &self.endpoint),
            ("EVERGREEN_SUPERVISOR_URL", &self.supervisor_url),
        ] {
            if !is_http_url(url) {
                warnings.push(format!("{key} is not an http(s) url: {url}"));
            }
        }

        DoctorReport {
            data_dir: self.data_dir.clone(),
            jenkins_home: self.jenkins_home.clone(),
            jenkins_url: self.jenkins_url.clone(),
            endpoint: self.endpoint.clone(),
            instance_id: self.instance_id.clone(),
            directory_token_loaded: self.directory_token.is_some(),
            supervisor_url: self.supervisor_url.clone(),
            process_name: self.process_name.clone(),
            snapshotting_enabled: self.snapshotting_enabled,
            poll_interval_secs: self.poll_interval_secs,
            request_timeout_secs: self.request_timeout_secs,
            download: self.download,
            health_identity: self.health_identity,
            health_metrics: self.health_metrics,
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub data_dir: PathBuf,
    pub jenkins_home: PathBuf,
    pub jenkins_url: String,
    pub endpoint: String,
    pub instance_id: Option<String>,
    pub directory_token_loaded: bool,
    pub supervisor_url: String,
    pub process_name: String,
    pub snapshotting_enabled: bool,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub download: RetryPolicy,
    pub health_identity: RetryPolicy,
    pub health_metrics: RetryPolicy,
    pub warnings: Vec<String>,
}

fn is_http_url(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn read_retry_policy(prefix: &str, defaults: RetryPolicy) -> RetryPolicy {
    RetryPolicy::new(
        read_u32_env(&format!("{prefix}_RETRIES"), defaults.retry),
        read_u64_env(&format!("{prefix}_DELAY_MS"), defaults.delay_ms),
        read_f64_env(&format!("{prefix}_BACKOFF_FACTOR"), defaults.backoff_factor),
    )
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_f64_env(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
