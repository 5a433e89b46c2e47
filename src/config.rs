// ABOUTME: TOML configuration for the replicator with environment overrides
// ABOUTME: Source API, destination database and relationship classifier settings

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::incremental::relationship::DEFAULT_RELATIONSHIP_KEYWORDS;
use crate::incremental::{RelationshipClassifier, SyncOptions};
use crate::utils::{validate_column_name, validate_postgres_identifier};

/// Environment variable overriding `[source].api_key`.
pub const SOURCE_API_KEY_ENV: &str = "SOURCE_API_KEY";
/// Environment variable overriding `[target].url`.
pub const TARGET_URL_ENV: &str = "TARGET_DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Field holding each record's external id
    pub id_field: String,
    /// Largest page the source API serves
    pub max_batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            id_field: "id".to_string(),
            max_batch_size: 100,
            inter_batch_delay_ms: 250,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub url: String,
    /// Column holding the external id in every replicated table
    pub id_column: String,
    pub cursor_table: String,
    pub patch_table: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            id_column: "id".to_string(),
            cursor_table: "sync_cursors".to_string(),
            patch_table: "pending_schema_patches".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub id_separator: char,
    pub relationship_keywords: Vec<String>,
    pub long_string_threshold: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            id_separator: '_',
            relationship_keywords: DEFAULT_RELATIONSHIP_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            long_string_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub classifier: ClassifierConfig,
}

impl ReplicatorConfig {
    /// `~/.api-replicator/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home_dir =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home_dir.join(".api-replicator").join("config.toml"))
    }

    /// Parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from `path`, or the default path when `None`, then apply
    /// environment overrides.
    ///
    /// A missing default file yields the defaults; an explicitly named file
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_path()?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    tracing::debug!(
                        "No config file at {}, using defaults",
                        default_path.display()
                    );
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(SOURCE_API_KEY_ENV) {
            if !key.is_empty() {
                self.source.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var(TARGET_URL_ENV) {
            if !url.is_empty() {
                self.target.url = url;
            }
        }
    }

    /// Check the settings a sync needs.
    pub fn validate(&self) -> Result<()> {
        if self.source.base_url.trim().is_empty() {
            bail!("[source].base_url is not set");
        }
        self.validate_target()?;
        if self.source.max_batch_size == 0 {
            bail!("[source].max_batch_size must be greater than 0");
        }
        if self.source.id_field.trim().is_empty() {
            bail!("[source].id_field must not be empty");
        }
        if self.classifier.id_separator.is_ascii_digit() {
            bail!("[classifier].id_separator must not be a digit");
        }
        Ok(())
    }

    /// Check the destination settings only; used by commands that never call the source.
    pub fn validate_target(&self) -> Result<()> {
        if self.target.url.trim().is_empty() {
            bail!("[target].url is not set (or set {})", TARGET_URL_ENV);
        }
        validate_postgres_identifier(&self.target.cursor_table)
            .context("[target].cursor_table is not a valid table name")?;
        validate_postgres_identifier(&self.target.patch_table)
            .context("[target].patch_table is not a valid table name")?;
        validate_column_name(&self.target.id_column)
            .context("[target].id_column is not a valid column name")?;
        Ok(())
    }

    pub fn classifier(&self) -> RelationshipClassifier {
        RelationshipClassifier::new(
            self.classifier.id_separator,
            self.classifier.relationship_keywords.clone(),
            self.classifier.long_string_threshold,
        )
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            id_field: self.source.id_field.clone(),
            id_column: self.target.id_column.clone(),
            max_batch: self.source.max_batch_size,
            inter_batch_delay: Duration::from_millis(self.source.inter_batch_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }
}
