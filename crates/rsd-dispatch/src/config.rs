use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timings and radii for proximity search and the auto-finish guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub radius_ladder_km: Vec<f64>,
    pub expansion_interval_ms: u64,
    pub decline_expansion_ms: u64,
    pub cooldown_ms: u64,
    pub heartbeat_freshness_secs: i64,
    pub countdown_tick_ms: u64,
    pub auto_finish_window_secs: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            radius_ladder_km: vec![3.0, 5.0, 10.0, 20.0, 50.0, 100.0],
            expansion_interval_ms: 6_000,
            decline_expansion_ms: 2_000,
            cooldown_ms: 10_000,
            heartbeat_freshness_secs: 120,
            countdown_tick_ms: 1_000,
            auto_finish_window_secs: 15 * 60,
        }
    }
}

impl SearchConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("parsing search config yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading search config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.radius_ladder_km.is_empty() {
            anyhow::bail!("radius ladder must not be empty");
        }
        let ascending = self
            .radius_ladder_km
            .windows(2)
            .all(|pair| pair[0] < pair[1]);
        let positive = self
            .radius_ladder_km
            .iter()
            .all(|r| r.is_finite() && *r > 0.0);
        if !ascending || !positive {
            anyhow::bail!("radius ladder must be positive and strictly ascending");
        }
        if self.countdown_tick_ms == 0 {
            anyhow::bail!("countdown tick must be non-zero");
        }
        Ok(())
    }

    pub fn expansion_interval(&self) -> Duration {
        Duration::from_millis(self.expansion_interval_ms)
    }

    pub fn decline_expansion(&self) -> Duration {
        Duration::from_millis(self.decline_expansion_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn heartbeat_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_freshness_secs)
    }

    pub fn auto_finish_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_finish_window_secs)
    }

    pub fn max_radius_index(&self) -> usize {
        self.radius_ladder_km.len().saturating_sub(1)
    }

    pub fn radius_at(&self, index: usize) -> f64 {
        self.radius_ladder_km
            .get(index)
            .or_else(|| self.radius_ladder_km.last())
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub auto_finish_cron: String,
    pub notify_webhook_url: Option<String>,
    pub http_timeout_secs: u64,
    pub global_fee_percent: f64,
    pub web_port: u16,
    pub search_config_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scheduler_enabled: false,
            auto_finish_cron: "0 * * * * *".to_string(),
            notify_webhook_url: None,
            http_timeout_secs: 10,
            global_fee_percent: 15.0,
            web_port: 8080,
            search_config_path: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            scheduler_enabled: std::env::var("RSD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            auto_finish_cron: std::env::var("RSD_AUTO_FINISH_CRON")
                .unwrap_or(defaults.auto_finish_cron),
            notify_webhook_url: non_empty_var("RSD_NOTIFY_WEBHOOK_URL"),
            http_timeout_secs: std::env::var("RSD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            global_fee_percent: std::env::var("RSD_GLOBAL_FEE_PERCENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|p: &f64| (0.0..=100.0).contains(p))
                .unwrap_or(defaults.global_fee_percent),
            web_port: std::env::var("RSD_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            search_config_path: non_empty_var("RSD_SEARCH_CONFIG").map(PathBuf::from),
        }
    }

    pub fn search_config(&self) -> Result<SearchConfig> {
        match &self.search_config_path {
            Some(path) => SearchConfig::from_yaml_file(path),
            None => Ok(SearchConfig::default()),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_ladder_matches_dispatch_radii() {
        let config = SearchConfig::default();
        assert_eq!(config.radius_ladder_km, vec![3.0, 5.0, 10.0, 20.0, 50.0, 100.0]);
        assert_eq!(config.expansion_interval(), Duration::from_secs(6));
        assert_eq!(config.cooldown(), Duration::from_secs(10));
        assert_eq!(config.auto_finish_window(), chrono::Duration::minutes(15));
        assert_eq!(config.radius_at(99), 100.0);
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let config = SearchConfig::from_yaml_str("cooldown_ms: 4000\nradius_ladder_km: [1, 2]\n")
            .unwrap();
        assert_eq!(config.cooldown(), Duration::from_secs(4));
        assert_eq!(config.radius_ladder_km, vec![1.0, 2.0]);
        assert_eq!(config.expansion_interval_ms, 6_000);
    }

    #[test]
    fn rejects_unordered_ladder() {
        assert!(SearchConfig::from_yaml_str("radius_ladder_km: [5, 3]\n").is_err());
        assert!(SearchConfig::from_yaml_str("radius_ladder_km: []\n").is_err());
    }

    #[test]
    fn loads_search_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "decline_expansion_ms: 500").unwrap();
        let config = DispatchConfig {
            search_config_path: Some(file.path().to_path_buf()),
            ..DispatchConfig::default()
        };
        assert_eq!(config.search_config().unwrap().decline_expansion_ms, 500);
    }
}
