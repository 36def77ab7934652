use crate::clock::Timezone;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Permission bits for the socket file. Written as an octal string
    /// ("0666"); a bare integer is taken as the numeric mode value.
    #[serde(default = "default_socket_mode", with = "octal_mode")]
    pub socket_mode: u32,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// "local", "UTC" or a fixed offset such as "+03:00". Prefer a fixed
    /// offset where the local zone observes daylight saving time.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Limits applied to tenants without a package.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_hourly")]
    pub default_hourly: i64,
    #[serde(default = "default_daily")]
    pub default_daily: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_defer_seconds")]
    pub defer_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Long-lived read-only handles shared by concurrent decisions.
    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: usize,
    /// Idle read-write handles kept around. 0 closes every handle after use.
    #[serde(default = "default_writer_pool_size")]
    pub writer_pool_size: usize,
    #[serde(default = "default_writer_max_age_seconds")]
    pub writer_max_age_seconds: u64,
}

fn default_socket_path() -> String {
    "/var/spool/postfix/private/policy".to_string()
}

fn default_socket_mode() -> u32 {
    0o666
}

fn default_database_path() -> String {
    "/var/lib/quota-policyd/panel.db".to_string()
}

fn default_pid_file() -> String {
    "/var/run/quota-policyd.pid".to_string()
}

fn default_timezone() -> String {
    "local".to_string()
}

fn default_hourly() -> i64 {
    100
}

fn default_daily() -> i64 {
    500
}

fn default_defer_seconds() -> i64 {
    3600
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_reader_pool_size() -> usize {
    4
}

fn default_writer_pool_size() -> usize {
    4
}

fn default_writer_max_age_seconds() -> u64 {
    30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            default_hourly: default_hourly(),
            default_daily: default_daily(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            defer_seconds: default_defer_seconds(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            busy_timeout_ms: default_busy_timeout_ms(),
            reader_pool_size: default_reader_pool_size(),
            writer_pool_size: default_writer_pool_size(),
            writer_max_age_seconds: default_writer_max_age_seconds(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            database_path: default_database_path(),
            log_file: None,
            pid_file: default_pid_file(),
            timezone: default_timezone(),
            limits: LimitsConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> &'static str {
        "/etc/quota-policyd.yaml"
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let is_toml = Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config: Config = if is_toml {
            toml::from_str(&content).with_context(|| format!("Invalid TOML in {path}"))?
        } else {
            serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {path}"))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.socket_path.is_empty() {
            bail!("socket_path must not be empty");
        }
        if self.database_path.is_empty() {
            bail!("database_path must not be empty");
        }
        if self.limits.default_hourly <= 0 || self.limits.default_daily <= 0 {
            bail!(
                "default limits must be positive (hourly={}, daily={})",
                self.limits.default_hourly,
                self.limits.default_daily
            );
        }
        if self.queue.defer_seconds <= 0 {
            bail!("queue.defer_seconds must be positive");
        }
        if self.store.reader_pool_size == 0 {
            bail!("store.reader_pool_size must be at least 1");
        }
        if self.socket_mode > 0o7777 {
            bail!("socket_mode {:o} is not a valid permission mode", self.socket_mode);
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Timezone> {
        self.timezone
            .parse::<Timezone>()
            .with_context(|| format!("Invalid timezone setting: {:?}", self.timezone))
    }
}

/// Socket permission bits as octal text. Reads `"0666"`, `"666"` and
/// `"0o666"` as octal; an integer (YAML `0o666`, TOML `0o666`, or a plain
/// `438`) is used as the mode value itself.
mod octal_mode {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{mode:04o}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(mode) => Ok(mode),
            Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    fn parse(text: &str) -> Result<u32, String> {
        let text = text.trim();
        let digits = text.strip_prefix("0o").unwrap_or(text);
        u32::from_str_radix(digits, 8)
            .map_err(|_| format!("socket_mode {text:?} is not an octal mode such as \"0666\""))
    }
}
