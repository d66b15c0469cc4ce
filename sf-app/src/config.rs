//! SparrowFlix configuration loader.
//!
//! TOML file, then `.env` / process environment overrides, then `validate`.

use serde::Deserialize;
use sf_metadata::TMDB_DEFAULT_BASE_URL;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparrowConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub miniapp: MiniAppConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Echoed by Telegram in `X-Telegram-Bot-Api-Secret-Token`.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Archival channel, e.g. `-1001234567890` or `@my_vault`.
    #[serde(default)]
    pub channel_id: String,
}

/// Streaming web app opened by `/app`, `/stream` and `/watch`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiniAppConfig {
    /// Telegram only opens web apps over https, e.g. `https://t.me/<bot>/app`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.sparrowflix/catalog.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_metadata_base_url")]
    pub base_url: String,
    #[serde(default = "default_metadata_language")]
    pub language: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_metadata_base_url(),
            language: default_metadata_language(),
            max_results: default_max_results(),
        }
    }
}

fn default_metadata_base_url() -> String {
    TMDB_DEFAULT_BASE_URL.to_string()
}

fn default_metadata_language() -> String {
    "en-US".to_string()
}

fn default_max_results() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_staleness_seconds")]
    pub staleness_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Flush groups still waiting for their quiet period when the process stops.
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            staleness_seconds: default_staleness_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            flush_on_shutdown: default_flush_on_shutdown(),
        }
    }
}

fn default_quiet_period_ms() -> u64 {
    1000
}

fn default_staleness_seconds() -> u64 {
    120
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

fn default_flush_on_shutdown() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl SparrowConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            // Running purely from the environment is fine when no path was given.
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("BOT_TOKEN").or_else(|| non_empty("TELEGRAM_BOT_TOKEN")) {
            self.telegram.bot_token = v;
        }
        if let Some(v) = non_empty("TMDB_API_KEY") {
            self.metadata.api_key = v;
        }
        if let Some(v) = non_empty("STORAGE_CHANNEL_ID") {
            self.storage.channel_id = v;
        }
        if let Some(v) = non_empty("SPARROWFLIX_DB_PATH") {
            self.catalog.db_path = v;
        }
        if let Some(v) = non_empty("SPARROWFLIX_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = non_empty("TELEGRAM_WEBHOOK_URL") {
            self.telegram.webhook_url = Some(v);
            self.telegram.mode = TransportMode::Webhook;
        }
        if let Some(v) = non_empty("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
        if let Some(v) = non_empty("SPARROWFLIX_MINIAPP_URL") {
            self.miniapp.url = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set BOT_TOKEN)"
            ));
        }
        if self.metadata.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "metadata.api_key is required (or set TMDB_API_KEY)"
            ));
        }
        if self.storage.channel_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "storage.channel_id is required (or set STORAGE_CHANNEL_ID)"
            ));
        }
        if self.telegram.mode == TransportMode::Webhook
            && self
                .telegram
                .webhook_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "telegram.webhook_url is required when telegram.mode = \"webhook\""
            ));
        }
        if let Some(url) = self.miniapp.url.as_deref() {
            if !url.trim().starts_with("https://") {
                return Err(anyhow::anyhow!("miniapp.url must be an https:// URL"));
            }
        }
        if !(1..=5).contains(&self.metadata.max_results) {
            return Err(anyhow::anyhow!("metadata.max_results must be between 1 and 5"));
        }
        if self.batch.quiet_period_ms == 0 {
            return Err(anyhow::anyhow!("batch.quiet_period_ms must be > 0"));
        }
        if self.batch.staleness_seconds == 0 || self.batch.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "batch.staleness_seconds and batch.sweep_interval_seconds must be > 0"
            ));
        }
        if self.batch.staleness_seconds.saturating_mul(1000) < self.batch.quiet_period_ms {
            return Err(anyhow::anyhow!(
                "batch.staleness_seconds must cover at least one quiet period"
            ));
        }
        if self.server.http_timeout_seconds == 0 || self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!(
                "server.http_timeout_seconds and server.http_max_in_flight must be > 0"
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.catalog.db_path)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".sparrowflix").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}
