use std::path::Path;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub trakt: TraktSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub influx: Option<InfluxSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraktSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Seed refresh token, only consulted when the state store holds none.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// One-shot authorization code for the first bootstrap.
    #[serde(default)]
    pub auth_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_overlap_hours")]
    pub overlap_hours: i64,
    #[serde(default = "default_reconcile_days")]
    pub reconcile_days: i64,
    #[serde(default = "default_sync_cron")]
    pub sync_cron: String,
    #[serde(default = "default_reconcile_cron")]
    pub reconcile_cron: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_after_margin")]
    pub retry_after_margin: f64,
    #[serde(default)]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            overlap_hours: default_overlap_hours(),
            reconcile_days: default_reconcile_days(),
            sync_cron: default_sync_cron(),
            reconcile_cron: default_reconcile_cron(),
            max_retries: default_max_retries(),
            retry_after_margin: default_retry_after_margin(),
            min_request_interval_ms: 0,
            per_page: default_per_page(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    #[serde(default = "default_bucket_raw")]
    pub bucket_raw: String,
    #[serde(default = "default_bucket_agg")]
    pub bucket_agg: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_overlap_hours() -> i64 {
    24
}

fn default_reconcile_days() -> i64 {
    7
}

fn default_sync_cron() -> String {
    "0 6,18 * * *".to_string()
}

fn default_reconcile_cron() -> String {
    "30 3 * * *".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_after_margin() -> f64 {
    0.9
}

fn default_per_page() -> u32 {
    100
}

fn default_bucket_raw() -> String {
    "watch_events".to_string()
}

fn default_bucket_agg() -> String {
    "watch_daily".to_string()
}

impl Settings {
    /// Loads the TOML file (missing file means all defaults), applies
    /// environment overrides, then validates. Environment always wins over
    /// the file.
    pub fn load(path: &Path, require_influx: bool) -> Result<Self, ConfigError> {
        let mut settings: Settings = if path.exists() {
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            Settings {
                trakt: TraktSettings::default(),
                sync: SyncSettings::default(),
                influx: None,
            }
        };
        settings.apply_env_overrides();
        settings.validate(require_influx)?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_var("TRAKT_CLIENT_ID") {
            self.trakt.client_id = value;
        }
        if let Some(value) = env_var("TRAKT_CLIENT_SECRET") {
            self.trakt.client_secret = value;
        }
        if let Some(value) = env_var("TRAKT_REFRESH_TOKEN") {
            self.trakt.refresh_token = Some(value);
        }
        if let Some(value) = env_var("TRAKT_AUTH_CODE") {
            self.trakt.auth_code = Some(value);
        }
        if let Some(value) = env_var("WATCHTALLY_TIMEZONE") {
            self.sync.timezone = value;
        }

        let influx_env = [
            env_var("INFLUX_URL"),
            env_var("INFLUX_TOKEN"),
            env_var("INFLUX_ORG"),
        ];
        if influx_env.iter().any(Option::is_some) || self.influx.is_some() {
            let mut influx = self.influx.clone().unwrap_or(InfluxSettings {
                url: String::new(),
                token: String::new(),
                org: String::new(),
                bucket_raw: default_bucket_raw(),
                bucket_agg: default_bucket_agg(),
            });
            let [url, token, org] = influx_env;
            if let Some(url) = url {
                influx.url = url;
            }
            if let Some(token) = token {
                influx.token = token;
            }
            if let Some(org) = org {
                influx.org = org;
            }
            if let Some(bucket) = env_var("INFLUX_BUCKET_RAW") {
                influx.bucket_raw = bucket;
            }
            if let Some(bucket) = env_var("INFLUX_BUCKET_AGG") {
                influx.bucket_agg = bucket;
            }
            self.influx = Some(influx);
        }
    }

    fn validate(&self, require_influx: bool) -> Result<(), ConfigError> {
        if self.trakt.client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "trakt.client_id is required (config file or TRAKT_CLIENT_ID)".to_string(),
            ));
        }
        if self.trakt.client_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "trakt.client_secret is required (config file or TRAKT_CLIENT_SECRET)".to_string(),
            ));
        }
        self.timezone()?;
        if self.sync.overlap_hours < 0 {
            return Err(ConfigError::Invalid(
                "sync.overlap_hours must be non-negative".to_string(),
            ));
        }
        if self.sync.reconcile_days <= 0 {
            return Err(ConfigError::Invalid(
                "sync.reconcile_days must be positive".to_string(),
            ));
        }
        if require_influx {
            let influx = self.influx.as_ref().ok_or_else(|| {
                ConfigError::Invalid(
                    "influx settings are required (config file or INFLUX_URL/INFLUX_TOKEN/INFLUX_ORG)"
                        .to_string(),
                )
            })?;
            if influx.url.is_empty() || influx.token.is_empty() || influx.org.is_empty() {
                return Err(ConfigError::Invalid(
                    "influx.url, influx.token and influx.org must all be set".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.sync
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {}", self.sync.timezone)))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
