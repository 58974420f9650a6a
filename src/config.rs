use std::path::Path;

use anyhow::bail;
use serde::Deserialize;

use crate::constants::UPLOAD_CHUNK_ALIGN;

pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_TOKEN";
pub const GOOGLE_CREDENTIALS_ENV: &str = "GOOGLE_CREDENTIALS_PATH";

pub trait Param<T> {
    fn param(&self) -> T;
}

impl<T: Clone> Param<T> for T {
    fn param(&self) -> T {
        self.clone()
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config_context = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&config_context)?;
        Ok(config)
    }

    /// Load the config file if it exists, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            tracing::warn!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| get(key).filter(|s| !s.is_empty());
        if let Some(token) = non_empty(TELEGRAM_TOKEN_ENV) {
            self.telegram.token = token;
        }
        if let Some(path) = non_empty(GOOGLE_CREDENTIALS_ENV) {
            self.drive.credentials_path = path;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.token.is_empty() {
            bail!("telegram token is missing, set [telegram].token or {TELEGRAM_TOKEN_ENV}");
        }
        if let Some(chunk_size) = self.drive.chunk_size {
            if chunk_size == 0 || chunk_size % UPLOAD_CHUNK_ALIGN != 0 {
                bail!("drive chunk_size {chunk_size} must be a positive multiple of {UPLOAD_CHUNK_ALIGN}");
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DriveConfig {
    /// Google oauth client secrets json.
    pub credentials_path: String,
    /// Where the authorized token is cached between runs.
    pub token_cache: String,
    /// Upload into this folder instead of the drive root.
    pub folder_id: Option<String>,
    pub chunk_size: Option<usize>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            credentials_path: "credentials.json".to_string(),
            token_cache: "token.json".to_string(),
            folder_id: None,
            chunk_size: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:3333".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory holding videos between download and upload.
    pub temp_dir: String,
    /// Upload every received video right away.
    pub auto_upload: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            temp_dir: ".".to_string(),
            auto_upload: true,
        }
    }
}

impl Param<DriveConfig> for Config {
    fn param(&self) -> DriveConfig {
        self.drive.clone()
    }
}

impl Param<ApiConfig> for Config {
    fn param(&self) -> ApiConfig {
        self.api.clone()
    }
}

impl Param<TransferConfig> for Config {
    fn param(&self) -> TransferConfig {
        self.transfer.clone()
    }
}
