//! TOML configuration with per-field defaults.
//!
//! Resolution order is flag > environment > file > default. This module
//! handles the file and the environment; the CLI applies its flags last.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use remem_core::{
    DEFAULT_EMBED_DIM, DEFAULT_LEARNING_RATE, DEFAULT_MAX_EPOCHS, DEFAULT_TARGET_LOSS, FitConfig,
};

/// Overrides `[store] root`.
pub const CELLS_DIR_ENV: &str = "REM_CELLS_DIR";
/// Path of the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "REM_CONFIG";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: Option<PathBuf>, source: toml::de::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {source}", path.display())
            }
            ConfigError::Parse {
                path: Some(path),
                source,
            } => write!(f, "invalid config {}: {source}", path.display()),
            ConfigError::Parse { path: None, source } => write!(f, "invalid config: {source}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub fit: FitSection,
    pub embedding: EmbeddingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub root: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("memory_cells"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSection {
    pub max_epochs: usize,
    pub target_loss: f64,
    pub learning_rate: f32,
    pub log_every: usize,
    pub seed: Option<u64>,
}

impl Default for FitSection {
    fn default() -> Self {
        Self {
            max_epochs: DEFAULT_MAX_EPOCHS,
            target_loss: DEFAULT_TARGET_LOSS,
            learning_rate: DEFAULT_LEARNING_RATE,
            log_every: 100,
            seed: None,
        }
    }
}

impl FitSection {
    pub fn to_fit_config(&self) -> FitConfig {
        FitConfig {
            max_epochs: self.max_epochs,
            target_loss: self.target_loss,
            learning_rate: self.learning_rate,
            seed: self.seed,
            log_every: self.log_every,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Hash,
    Api,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub provider: ProviderKind,
    pub dimensions: usize,
    pub endpoint: String,
    pub model: String,
    /// Name of the variable holding the API key, never the key itself.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hash,
            dimensions: DEFAULT_EMBED_DIM,
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "REM_EMBED_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load from `path`, or from `$REM_CONFIG`, or fall back to defaults.
    /// Environment overrides are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`, so callers and tests
    /// can supply their own environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(CELLS_DIR_ENV).filter(|r| !r.trim().is_empty()) {
            self.store.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fit
            .to_fit_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be > 0".into(),
            ));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "embedding.timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
