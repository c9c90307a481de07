//! Table creation and schema-change configuration.

use super::{ConfigError, ConfigReader, ConfigSection};
use crate::pack::Format;

/// Expected access pattern, used as a read-ahead hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPattern {
    /// No hint.
    #[default]
    None,
    /// Mostly random point reads.
    Random,
    /// Mostly sequential scans.
    Sequential,
}

/// Options for `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateConfig {
    /// Key format string; `r` makes a column store.
    pub key_format: String,
    /// Value format string; `8t` on a column store makes it fixed-length.
    pub value_format: String,
    /// Column names: key columns first, then value columns.
    pub columns: Vec<String>,
    /// Column group names.
    pub colgroups: Vec<String>,
    /// Whether updates to this table are written to the log.
    pub log_enabled: bool,
    /// Maximum leaf page image size.
    pub leaf_page_max: u64,
    /// Maximum in-memory page footprint before a forced split.
    pub memory_page_max: u64,
    /// File allocation unit.
    pub allocation_size: u64,
    /// Opaque application string stored in the metadata.
    pub app_metadata: String,
    /// Fail if the object already exists.
    pub exclusive: bool,
    /// Read-ahead hint.
    pub access_pattern_hint: AccessPattern,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            key_format: "u".to_string(),
            value_format: "u".to_string(),
            columns: Vec::new(),
            colgroups: Vec::new(),
            log_enabled: true,
            leaf_page_max: 32 * 1024,
            memory_page_max: 5 * 1024 * 1024,
            allocation_size: 4096,
            app_metadata: String::new(),
            exclusive: false,
            access_pattern_hint: AccessPattern::None,
        }
    }
}

impl CreateConfig {
    /// Parsed key format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unparseable format.
    pub fn key(&self) -> Result<Format, ConfigError> {
        parse_format("key_format", &self.key_format)
    }

    /// Parsed value format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unparseable format.
    pub fn value(&self) -> Result<Format, ConfigError> {
        parse_format("value_format", &self.value_format)
    }
}

fn parse_format(key: &str, raw: &str) -> Result<Format, ConfigError> {
    Format::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        message: e.to_string(),
    })
}

impl ConfigSection for CreateConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(format) = r.string("key_format")? {
            self.key_format = format;
        }
        if let Some(format) = r.string("value_format")? {
            self.value_format = format;
        }
        if let Some(columns) = r.list("columns")? {
            self.columns = columns;
        }
        if let Some(colgroups) = r.list("colgroups")? {
            self.colgroups = colgroups;
        }
        if let Some(mut log) = r.nested("log")? {
            self.log_enabled = log.bool("enabled", self.log_enabled)?;
            log.finish()?;
        }
        self.leaf_page_max = r.size("leaf_page_max", self.leaf_page_max, 512, 512 * 1024 * 1024)?;
        self.memory_page_max = r.size("memory_page_max", self.memory_page_max, 512, 10 * 1024 * 1024 * 1024)?;
        self.allocation_size = r.size("allocation_size", self.allocation_size, 512, 128 * 1024 * 1024)?;
        if let Some(meta) = r.string("app_metadata")? {
            self.app_metadata = meta;
        }
        self.exclusive = r.bool("exclusive", self.exclusive)?;
        let current = match self.access_pattern_hint {
            AccessPattern::None => "none",
            AccessPattern::Random => "random",
            AccessPattern::Sequential => "sequential",
        };
        self.access_pattern_hint =
            match r.choice("access_pattern_hint", current, &["none", "random", "sequential"])? {
                "random" => AccessPattern::Random,
                "sequential" => AccessPattern::Sequential,
                _ => AccessPattern::None,
            };
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let key = self.key()?;
        let value = self.value()?;
        if key.is_recno() && key.fields().len() != 1 {
            return Err(ConfigError::Validation {
                message: format!("record-number key format must be exactly 'r', got '{}'", self.key_format),
            });
        }
        if value.is_fixed_bits() && !key.is_recno() {
            return Err(ConfigError::Validation {
                message: "fixed-length bit-field values require a record-number key".to_string(),
            });
        }
        if !self.columns.is_empty() && self.columns.len() != key.fields().len() + value.fields().len() {
            return Err(ConfigError::Validation {
                message: format!(
                    "{} columns named but formats describe {}",
                    self.columns.len(),
                    key.fields().len() + value.fields().len()
                ),
            });
        }
        if !self.allocation_size.is_power_of_two() {
            return Err(ConfigError::Validation {
                message: format!("allocation_size must be a power of two, got {}", self.allocation_size),
            });
        }
        if self.leaf_page_max % self.allocation_size != 0 {
            return Err(ConfigError::Validation {
                message: format!(
                    "leaf_page_max {} must be a multiple of allocation_size {}",
                    self.leaf_page_max, self.allocation_size
                ),
            });
        }
        if self.memory_page_max < self.leaf_page_max {
            return Err(ConfigError::Validation {
                message: "memory_page_max must be at least leaf_page_max".to_string(),
            });
        }
        Ok(())
    }
}

/// Options for `alter`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlterConfig {
    /// New logging setting.
    pub log_enabled: Option<bool>,
    /// New application metadata.
    pub app_metadata: Option<String>,
    /// New access pattern hint.
    pub access_pattern_hint: Option<AccessPattern>,
}

impl ConfigSection for AlterConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(mut log) = r.nested("log")? {
            self.log_enabled = Some(log.bool("enabled", self.log_enabled.unwrap_or(true))?);
            log.finish()?;
        }
        if let Some(meta) = r.string("app_metadata")? {
            self.app_metadata = Some(meta);
        }
        if r.contains("access_pattern_hint") {
            self.access_pattern_hint =
                Some(match r.choice("access_pattern_hint", "none", &["none", "random", "sequential"])? {
                    "random" => AccessPattern::Random,
                    "sequential" => AccessPattern::Sequential,
                    _ => AccessPattern::None,
                });
        }
        Ok(())
    }
}

/// Options for `drop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropConfig {
    /// Succeed if the object does not exist.
    pub force: bool,
    /// Delete the underlying file.
    pub remove_files: bool,
    /// Wait for a running checkpoint instead of failing with busy.
    pub checkpoint_wait: bool,
}

impl Default for DropConfig {
    fn default() -> Self {
        Self { force: false, remove_files: true, checkpoint_wait: true }
    }
}

impl ConfigSection for DropConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.force = r.bool("force", self.force)?;
        self.remove_files = r.bool("remove_files", self.remove_files)?;
        self.checkpoint_wait = r.bool("checkpoint_wait", self.checkpoint_wait)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults() {
        let config = CreateConfig::parse("").unwrap();
        assert_eq!(config.key_format, "u");
        assert!(config.log_enabled);
    }

    #[test]
    fn test_create_column_store() {
        let config = CreateConfig::parse("key_format=r,value_format=8t").unwrap();
        assert!(config.key().unwrap().is_recno());
        assert!(config.value().unwrap().is_fixed_bits());
        assert!(CreateConfig::parse("key_format=S,value_format=8t").is_err());
    }

    #[test]
    fn test_create_columns_must_match_formats() {
        assert!(CreateConfig::parse("key_format=S,value_format=Si,columns=(k,a,b)").is_ok());
        assert!(CreateConfig::parse("key_format=S,value_format=Si,columns=(k,a)").is_err());
    }

    #[test]
    fn test_create_page_sizes() {
        let config = CreateConfig::parse("leaf_page_max=16KB,log=(enabled=false)").unwrap();
        assert_eq!(config.leaf_page_max, 16 * 1024);
        assert!(!config.log_enabled);
        assert!(CreateConfig::parse("allocation_size=3000").is_err());
        assert!(CreateConfig::parse("page_size=4K").is_err());
    }

    #[test]
    fn test_drop_and_alter() {
        let drop = DropConfig::parse("force=true,remove_files=false").unwrap();
        assert!(drop.force);
        assert!(!drop.remove_files);
        let alter = AlterConfig::parse("log=(enabled=false),access_pattern_hint=random").unwrap();
        assert_eq!(alter.log_enabled, Some(false));
        assert_eq!(alter.access_pattern_hint, Some(AccessPattern::Random));
    }
}
