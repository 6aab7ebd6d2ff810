use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "CAMPUS_HUB";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub ui: UIConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    #[serde(default = "default_media_bucket")]
    pub media_bucket: String,
    #[serde(default = "default_avatar_bucket")]
    pub avatar_bucket: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            media_bucket: default_media_bucket(),
            avatar_bucket: default_avatar_bucket(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_media_bucket() -> String {
    "post-media".into()
}

fn default_avatar_bucket() -> String {
    "avatars".into()
}

fn default_user_agent() -> String {
    format!("campus-hub/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            jpeg_quality: default_jpeg_quality(),
            aspect_ratio: default_aspect_ratio(),
        }
    }
}

fn default_max_files() -> usize {
    10
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_aspect_ratio() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_notice_ttl", with = "humantime_serde")]
    pub notice_ttl: Duration,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            notice_ttl: default_notice_ttl(),
        }
    }
}

fn default_notice_ttl() -> Duration {
    Duration::from_secs(4)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "campus_hub=info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.backend.url.is_empty() {
        base.backend.url = other.backend.url;
    }
    if !other.backend.anon_key.is_empty() {
        base.backend.anon_key = other.backend.anon_key;
    }
    if !other.backend.media_bucket.is_empty() {
        base.backend.media_bucket = other.backend.media_bucket;
    }
    if !other.backend.avatar_bucket.is_empty() {
        base.backend.avatar_bucket = other.backend.avatar_bucket;
    }
    if !other.backend.user_agent.is_empty() {
        base.backend.user_agent = other.backend.user_agent;
    }
    if !other.backend.timeout.is_zero() {
        base.backend.timeout = other.backend.timeout;
    }

    if other.uploads.max_files != 0 {
        base.uploads.max_files = other.uploads.max_files;
    }
    if other.uploads.max_file_bytes != 0 {
        base.uploads.max_file_bytes = other.uploads.max_file_bytes;
    }
    if other.uploads.jpeg_quality != 0 {
        base.uploads.jpeg_quality = other.uploads.jpeg_quality.min(100);
    }
    if other.uploads.aspect_ratio > 0.0 {
        base.uploads.aspect_ratio = other.uploads.aspect_ratio;
    }

    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }

    base.ui.notice_ttl = other.ui.notice_ttl;

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "backend.url" => cfg.backend.url = value,
        "backend.anon_key" => cfg.backend.anon_key = value,
        "backend.media_bucket" => cfg.backend.media_bucket = value,
        "backend.avatar_bucket" => cfg.backend.avatar_bucket = value,
        "backend.user_agent" => cfg.backend.user_agent = value,
        "backend.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.backend.timeout = duration;
            }
        }
        "uploads.max_files" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.uploads.max_files = parsed;
            }
        }
        "uploads.max_file_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                cfg.uploads.max_file_bytes = parsed;
            }
        }
        "uploads.jpeg_quality" => {
            if let Ok(parsed) = value.parse::<u8>() {
                cfg.uploads.jpeg_quality = parsed.clamp(1, 100);
            }
        }
        "uploads.aspect_ratio" => {
            if let Ok(parsed) = value.parse::<f32>() {
                if parsed > 0.0 {
                    cfg.uploads.aspect_ratio = parsed;
                }
            }
        }
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    cfg.feed.page_size = parsed;
                }
            }
        }
        "ui.notice_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.ui.notice_ttl = duration;
            }
        }
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("campus-hub").join("config.yaml"))
}

/// Stores the backend project settings, keeping the rest of an existing
/// config file intact.
pub fn save_backend_settings(path: Option<PathBuf>, url: &str, anon_key: &str) -> Result<PathBuf> {
    let url = url.trim();
    let anon_key = anon_key.trim();

    anyhow::ensure!(!url.is_empty(), "config: backend.url is required");
    anyhow::ensure!(!anon_key.is_empty(), "config: backend.anon_key is required");

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };

    cfg.backend.url = url.to_string();
    cfg.backend.anon_key = anon_key.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}
