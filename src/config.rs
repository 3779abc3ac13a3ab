use anyhow::{anyhow, Result};
use config::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default archive location; `{period}` is replaced with `YYYY-MM`
pub const DEFAULT_ARCHIVE_URL_TEMPLATE: &str = "https://data.police.uk/data/archive/{period}.zip";

/// Bounds applied to the configured batch size
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Serialize)]
pub struct HexstatConfig {
    /// Path to the directory to hold hexstat's data
    pub data_dir: String,

    /// Archive URL template, `{period}` is substituted per month
    pub archive_url_template: String,

    /// Number of records buffered before each batch insert
    pub batch_size: usize,

    /// Timeout for the HEAD metadata probe (default: 30 seconds)
    pub probe_timeout_secs: u64,

    /// Timeout for the archive transfer (default: 120 seconds)
    pub transfer_timeout_secs: u64,

    /// Transfer attempts before giving up on transient failures (default: 3)
    pub download_attempts: u32,

    /// Backoff base in milliseconds, doubled on every retry (default: 1500)
    pub retry_base_ms: u64,

    /// Confidence level used when a query asks for intervals without one
    pub confidence_level: f64,
}

const EMPTY_CONFIG: &str = r#"### hexstat configuration file

### directory for the database and downloaded archives
# data_dir = "~/.hexstat"

### monthly archive source, {period} is replaced with YYYY-MM
# archive_url_template = "https://data.police.uk/data/archive/{period}.zip"

### ingestion settings
# batch_size = 500

### download settings
# probe_timeout_secs = 30
# transfer_timeout_secs = 120
# download_attempts = 3
# retry_base_ms = 1500

### aggregation settings
# confidence_level = 0.95
"#;

impl Default for HexstatConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.hexstat", home_dir),
            archive_url_template: DEFAULT_ARCHIVE_URL_TEMPLATE.to_string(),
            batch_size: 500,
            probe_timeout_secs: 30,
            transfer_timeout_secs: 120,
            download_attempts: 3,
            retry_base_ms: 1500,
            confidence_level: 0.95,
        }
    }
}

impl HexstatConfig {
    /// Function to create and initialize a new configuration
    pub fn new(path: &Option<String>) -> Result<HexstatConfig> {
        let mut builder = Config::builder();

        // By default use $HOME/.hexstat/hexstat.toml as the configuration file path
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();

        let hexstat_dir = format!("{}/.hexstat", home_dir.as_str());

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                std::fs::create_dir_all(hexstat_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create hexstat directory: {}", e))?;
                let p = format!("{}/hexstat.toml", hexstat_dir.as_str());
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // Settings from the environment, e.g. `HEXSTAT_BATCH_SIZE=1000 hexstat ingest 2024-01`
        builder = builder.add_source(config::Environment::with_prefix("HEXSTAT"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        let config = Self::from_values(&values, &hexstat_dir);
        std::fs::create_dir_all(config.data_dir.as_str())
            .map_err(|e| anyhow!("Unable to create data directory: {}", e))?;
        Ok(config)
    }

    /// Build a configuration from flat key/value settings, falling back to defaults
    pub fn from_values(values: &HashMap<String, String>, default_data_dir: &str) -> HexstatConfig {
        let defaults = HexstatConfig::default();

        let data_dir = values
            .get("data_dir")
            .map(|p| expand_home(p))
            .unwrap_or_else(|| default_data_dir.to_string());

        let archive_url_template = values
            .get("archive_url_template")
            .filter(|t| t.contains("{period}"))
            .cloned()
            .unwrap_or(defaults.archive_url_template);

        let batch_size = values
            .get("batch_size")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.batch_size)
            .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);

        let confidence_level = values
            .get("confidence_level")
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|l| *l > 0.0 && *l < 1.0)
            .unwrap_or(defaults.confidence_level);

        HexstatConfig {
            data_dir,
            archive_url_template,
            batch_size,
            probe_timeout_secs: parse_or(values, "probe_timeout_secs", defaults.probe_timeout_secs),
            transfer_timeout_secs: parse_or(
                values,
                "transfer_timeout_secs",
                defaults.transfer_timeout_secs,
            ),
            download_attempts: parse_or(values, "download_attempts", defaults.download_attempts)
                .max(1),
            retry_base_ms: parse_or(values, "retry_base_ms", defaults.retry_base_ms),
            confidence_level,
        }
    }

    /// Get the path to the SQLite database file
    pub fn sqlite_path(&self) -> String {
        let data_dir = self.data_dir.trim_end_matches('/');
        format!("{}/hexstat-data.sqlite3", data_dir)
    }

    /// Get the directory holding in-flight and validated archives
    pub fn archive_dir(&self) -> String {
        format!("{}/archives", self.data_dir.trim_end_matches('/'))
    }

    /// Archive URL for one period
    pub fn archive_url(&self, period: &str) -> String {
        self.archive_url_template.replace("{period}", period)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        [
            format!("Data Directory:     {}", self.data_dir),
            format!("SQLite Path:        {}", self.sqlite_path()),
            format!("Archive Directory:  {}", self.archive_dir()),
            format!("Archive URL:        {}", self.archive_url_template),
            format!("Batch Size:         {}", self.batch_size),
            format!(
                "Download:           {} attempts, {}ms backoff, {}s probe / {}s transfer timeout",
                self.download_attempts,
                self.retry_base_ms,
                self.probe_timeout_secs,
                self.transfer_timeout_secs
            ),
            format!("Confidence Level:   {}", self.confidence_level),
        ]
        .join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.hexstat/hexstat.toml", home_dir)
    }
}

fn parse_or<T: std::str::FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> T {
    values
        .get(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => path.to_string(),
    }
}

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = HexstatConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.probe_timeout_secs, 30);
        assert_eq!(config.transfer_timeout_secs, 120);
        assert_eq!(config.download_attempts, 3);
        assert_eq!(config.retry_base_ms, 1500);
    }

    #[test]
    fn test_paths() {
        let config = HexstatConfig {
            data_dir: "/test/dir/".to_string(),
            ..Default::default()
        };

        assert_eq!(config.sqlite_path(), "/test/dir/hexstat-data.sqlite3");
        assert_eq!(config.archive_dir(), "/test/dir/archives");
    }

    #[test]
    fn test_archive_url() {
        let config = HexstatConfig::default();
        assert_eq!(
            config.archive_url("2024-01"),
            "https://data.police.uk/data/archive/2024-01.zip"
        );
    }

    #[test]
    fn test_from_values_overrides() {
        let config = HexstatConfig::from_values(
            &values(&[
                ("data_dir", "/srv/hexstat"),
                ("archive_url_template", "http://mirror.local/{period}.zip"),
                ("batch_size", "1000"),
                ("download_attempts", "5"),
                ("retry_base_ms", "10"),
                ("confidence_level", "0.9"),
            ]),
            "/default",
        );

        assert_eq!(config.data_dir, "/srv/hexstat");
        assert_eq!(config.archive_url("2023-12"), "http://mirror.local/2023-12.zip");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.download_attempts, 5);
        assert_eq!(config.retry_base(), Duration::from_millis(10));
        assert_eq!(config.confidence_level, 0.9);
    }

    #[test]
    fn test_from_values_rejects_bad_settings() {
        let config = HexstatConfig::from_values(
            &values(&[
                ("archive_url_template", "http://mirror.local/latest.zip"),
                ("batch_size", "0"),
                ("download_attempts", "0"),
                ("confidence_level", "1.5"),
                ("probe_timeout_secs", "soon"),
            ]),
            "/default",
        );

        assert_eq!(config.data_dir, "/default");
        assert_eq!(config.archive_url_template, DEFAULT_ARCHIVE_URL_TEMPLATE);
        assert_eq!(config.batch_size, MIN_BATCH_SIZE);
        assert_eq!(config.download_attempts, 1);
        assert_eq!(config.confidence_level, 0.95);
        assert_eq!(config.probe_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
        assert_eq!(format_size(1073741824), "1.00 GB");
    }
}
