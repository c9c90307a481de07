//! Connection configuration strings for tests.
//!
//! Centralizes the cache sizes and logging settings tests would otherwise
//! spell out by hand.

use bon::Builder;

/// Builds a connection configuration string.
///
/// Defaults are small and quiet: a 20MB cache, logging off and fast
/// statistics so tests can read counters.
#[derive(Debug, Clone, Builder)]
pub struct TestConnConfig {
    /// Cache size, with a size suffix.
    #[builder(default = "20MB".to_string(), into)]
    pub cache_size: String,
    /// Enables the write-ahead log.
    #[builder(default)]
    pub log: bool,
    /// Maximum log file size when logging.
    #[builder(into)]
    pub log_file_max: Option<String>,
    /// Statistics level: `none`, `fast` or `all`.
    #[builder(default = "fast".to_string(), into)]
    pub statistics: String,
    /// Appended verbatim.
    #[builder(into)]
    pub extra: Option<String>,
}

impl TestConnConfig {
    /// Renders the configuration string, always including `create`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts = vec![
            "create".to_string(),
            format!("cache_size={}", self.cache_size),
            format!("statistics=({})", self.statistics),
        ];
        if self.log {
            match &self.log_file_max {
                Some(max) => parts.push(format!("log=(enabled=true,file_max={max})")),
                None => parts.push("log=(enabled=true)".to_string()),
            }
        }
        if let Some(extra) = &self.extra {
            parts.push(extra.clone());
        }
        parts.join(",")
    }
}

/// Default test connection configuration string.
#[must_use]
pub fn test_conn_config() -> String {
    TestConnConfig::builder().build().render()
}

/// Test connection configuration with the write-ahead log enabled.
#[must_use]
pub fn test_logged_conn_config() -> String {
    TestConnConfig::builder().log(true).build().render()
}
