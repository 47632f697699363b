use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `tideflow.yaml`.
/// All fields are optional — missing fields fall back to env/defaults.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TideflowConfig {
    /// Cap on flows executing concurrently. Defaults to the CPU count.
    pub max_concurrent_flows: Option<usize>,
    /// Cap on concurrent sub-steps inside a dynamic-parallel branch.
    pub branch_fan_out: Option<usize>,
    /// Minutes a Running flow may go without updates before the recovery
    /// service re-adopts it.
    pub recovery_threshold_minutes: Option<u64>,
    /// Minutes between periodic recovery sweeps.
    pub recovery_interval_minutes: Option<u64>,
    /// Seconds between resume-condition polls.
    pub resume_poll_interval_seconds: Option<u64>,
    /// Minutes of history counted as "recent" by the health check.
    pub recent_failure_window_minutes: Option<u64>,
    /// Recent failures tolerated before health flips to unhealthy.
    pub max_recent_failures: Option<u64>,
    /// Document-store URL; `TIDEFLOW_DATABASE_URL` overrides.
    pub database_url: Option<String>,
}

impl TideflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `tideflow.yaml` in cwd; return
    ///   defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("tideflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: TideflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    pub fn max_concurrent_flows(&self) -> usize {
        self.max_concurrent_flows
            .or_else(|| {
                std::env::var("TIDEFLOW_MAX_CONCURRENT_FLOWS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or_else(num_cpus::get)
    }

    pub fn branch_fan_out(&self) -> usize {
        self.branch_fan_out.unwrap_or(8).max(1)
    }

    pub fn recovery_threshold(&self) -> Duration {
        Duration::from_secs(60 * self.recovery_threshold_minutes.unwrap_or(30))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(60 * self.recovery_interval_minutes.unwrap_or(10))
    }

    pub fn resume_poll_interval(&self) -> Duration {
        Duration::from_secs(self.resume_poll_interval_seconds.unwrap_or(5))
    }

    pub fn recent_failure_window(&self) -> Duration {
        Duration::from_secs(60 * self.recent_failure_window_minutes.unwrap_or(60))
    }

    pub fn max_recent_failures(&self) -> u64 {
        self.max_recent_failures.unwrap_or(10)
    }
}
