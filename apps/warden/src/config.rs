//! # CLI Configuration
//!
//! `warden.toml`, read once per invocation. Every key is optional; a
//! missing file yields the defaults. Command-line flags override file values.
//!
//! ```toml
//! database = "register.redb"
//! actor = "alice"
//! log_format = "json"
//!
//! [session]
//! max_page_size = 200
//! track_queries = true
//! auto_detect_changes = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use warden_core::{SessionOptions, WardenError};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Default database file name.
pub const DEFAULT_DATABASE: &str = "warden.redb";

/// Principal recorded when neither the file nor `--actor` names one.
pub const DEFAULT_ACTOR: &str = "operator";

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse `WARDEN_LOG_FORMAT`-style values; anything but `json` is text.
    #[must_use]
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Settings of one CLI invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// redb database file.
    pub database: PathBuf,
    /// Principal stamped on every write.
    pub actor: String,
    /// Log output style.
    pub log_format: LogFormat,
    /// Options handed to the session.
    pub session: SessionOptions,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            actor: DEFAULT_ACTOR.to_string(),
            log_format: LogFormat::Text,
            session: SessionOptions::default(),
        }
    }
}

impl WardenConfig {
    /// Read `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, WardenError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, WardenError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| WardenError::DeserializationError(format!("warden.toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no session could run with.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.actor.trim().is_empty() {
            return Err(WardenError::InvalidArgument(
                "actor must not be empty".to_string(),
            ));
        }
        self.session.validate()
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, database: Option<PathBuf>, actor: Option<String>) -> Self {
        if let Some(database) = database {
            self.database = database;
        }
        if let Some(actor) = actor {
            self.actor = actor;
        }
        self
    }
}
