use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for releasewatch
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub authentication and endpoint settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Polling jobs and fetch behavior
    #[serde(default)]
    pub polling: PollingConfig,

    /// Repository store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Notification delivery settings
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Explicit token; takes precedence over auth_method when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// API root, GraphQL requests go to `{api_url}/graphql`
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Polling configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PollingConfig {
    /// Interval of the job over all tracked repositories
    #[serde(default = "default_interval")]
    pub interval: String, // "5m"

    /// Interval of the per-recipient private job
    #[serde(default = "default_interval")]
    pub private_interval: String,

    /// Releases and tags fetched per repository
    #[serde(default = "default_depth")]
    pub depth: u32,

    /// Repositories per GraphQL request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum batches in flight
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for each batch request in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Run both jobs once right after startup
    #[serde(default)]
    pub run_on_start: bool,
}

/// Store configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// SQLite database location
    #[serde(default = "default_store_path")]
    pub path: String,

    /// How long a writer waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: u64,
}

/// Notification configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotifyConfig {
    /// Longest single message the chat service accepts, in characters
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Telegram bot token; messages only go to the log when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,

    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,

    /// Timeout for each send in seconds
    #[serde(default = "default_send_timeout")]
    pub timeout: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_true() -> bool {
    true
}
fn default_interval() -> String {
    "5m".to_string()
}
fn default_depth() -> u32 {
    1
}
fn default_batch_size() -> usize {
    50
}
fn default_max_parallel() -> usize {
    2
}
fn default_timeout() -> u64 {
    30
}
fn default_store_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/releasewatch/state.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/releasewatch/state.db", home)
    } else {
        "/tmp/releasewatch/state.db".to_string()
    }
}
fn default_busy_timeout() -> u64 {
    5
}
fn default_max_message_length() -> usize {
    4096
}
fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_send_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            token: None,
            api_url: default_api_url(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            private_interval: default_interval(),
            depth: default_depth(),
            batch_size: default_batch_size(),
            max_parallel: default_max_parallel(),
            timeout: default_timeout(),
            run_on_start: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            telegram_token: None,
            telegram_api_url: default_telegram_api_url(),
            timeout: default_send_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create(&config_path)
    }

    /// Load configuration from `path`, writing defaults there first if missing
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            let mut config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("releasewatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.store.path = shellexpand::full(&self.store.path)
            .context("Failed to expand store path")?
            .into_owned();

        Ok(())
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.public_interval()?;
        self.private_interval()?;

        if self.polling.depth == 0 {
            return Err(anyhow!("polling.depth must be at least 1"));
        }
        if self.polling.batch_size == 0 {
            return Err(anyhow!("polling.batch_size must be at least 1"));
        }
        if self.polling.max_parallel == 0 {
            return Err(anyhow!("polling.max_parallel must be at least 1"));
        }
        if self.notify.max_message_length == 0 {
            return Err(anyhow!("notify.max_message_length must be at least 1"));
        }

        Ok(())
    }

    pub fn public_interval(&self) -> Result<Duration> {
        parse_duration(&self.polling.interval)
            .map(Duration::from_secs)
            .context("Failed to parse polling.interval")
    }

    pub fn private_interval(&self) -> Result<Duration> {
        parse_duration(&self.polling.private_interval)
            .map(Duration::from_secs)
            .context("Failed to parse polling.private_interval")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.timeout)
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store.path)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.store.busy_timeout)
    }
}

/// Longest accepted interval, one year
const MAX_DURATION_SECS: u64 = 366 * 86_400;

/// Parse duration strings like "30s", "5m", "1h", "2d" into seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, label) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1, "seconds")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60, "minutes")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3600, "hours")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, 86_400, "days")
    } else {
        // Try to parse as raw seconds
        (duration_str.as_str(), 1, "seconds")
    };

    let count = value.parse::<u64>().with_context(|| {
        format!(
            "Invalid {} value in '{}'. Use format like '30s', '5m', '1h', '2d'",
            label, duration_str
        )
    })?;

    let seconds = count
        .checked_mul(unit)
        .filter(|s| *s <= MAX_DURATION_SECS)
        .ok_or_else(|| anyhow!("Duration '{}' is longer than one year", duration_str))?;

    if seconds == 0 {
        return Err(anyhow!("Duration must be greater than zero"));
    }

    Ok(seconds)
}
