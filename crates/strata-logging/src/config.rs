//! Logging configuration
//!
//! Loaded from the `[logging]` section of a relay config or built from one
//! of the presets. `RUST_LOG`, when set, replaces [`LogConfig::directives`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Logging configuration for a relay process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for every target without an override
    pub default_level: String,

    pub console: ConsoleConfig,

    /// Rolling JSON files; disabled when absent
    pub file: Option<FileConfig>,

    /// Per-target overrides, e.g. `strata_storage::gc = "debug"`
    pub targets: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            targets: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Pretty console at debug, with the access tracker held at info
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Pretty,
                ansi: true,
                ..ConsoleConfig::default()
            },
            targets: BTreeMap::from([("strata_storage::access".to_string(), "info".to_string())]),
            ..Self::default()
        }
    }

    /// JSON lines to daily files under `log_dir`, console off
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            console: ConsoleConfig {
                enabled: false,
                ..ConsoleConfig::default()
            },
            file: Some(FileConfig {
                directory: log_dir,
                ..FileConfig::default()
            }),
            ..Self::default()
        }
    }

    /// Compact warnings only, written through the test harness capture
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Compact,
                test_writer: true,
                ..ConsoleConfig::default()
            },
            ..Self::default()
        }
    }

    /// Add or replace the level for one target
    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.targets.insert(target.into(), level.into());
        self
    }

    /// Filter directives: `level[,target=level...]`
    pub fn directives(&self) -> String {
        directives(&self.default_level, &self.targets)
    }

    /// Directives for the console layer, which may run at its own level
    pub fn console_directives(&self) -> String {
        let level = self.console.level.as_deref().unwrap_or(&self.default_level);
        directives(level, &self.targets)
    }
}

fn directives(level: &str, targets: &BTreeMap<String, String>) -> String {
    targets
        .iter()
        .fold(level.to_string(), |mut acc, (target, level)| {
            acc.push(',');
            acc.push_str(target);
            acc.push('=');
            acc.push_str(level);
            acc
        })
}

/// Console output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: ConsoleFormat,
    /// ANSI colors; only honored by the text formats
    pub ansi: bool,
    /// Console level, when it should differ from `default_level`
    pub level: Option<String>,
    /// Write through `libtest` capture instead of raw stdout
    #[serde(skip)]
    pub test_writer: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: ConsoleFormat::Json,
            ansi: false,
            level: None,
            test_writer: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

/// Rolling file output, always JSON lines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix; the rotation date is appended
    pub prefix: String,
    pub rotation: RotationStrategy,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "strata".to_string(),
            rotation: RotationStrategy::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file named `<prefix>.log`
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.directives(), "info");
        assert!(config.console.enabled);
        assert_eq!(config.console.format, ConsoleFormat::Json);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_production_writes_files_only() {
        let config = LogConfig::production(PathBuf::from("/var/log/strata"));
        assert!(!config.console.enabled);
        let file = config.file.expect("production config has file output");
        assert_eq!(file.directory, PathBuf::from("/var/log/strata"));
        assert_eq!(file.rotation, RotationStrategy::Daily);
    }

    #[test]
    fn test_target_directives() {
        let config = LogConfig::default()
            .with_target("strata_storage::query", "trace")
            .with_target("strata_storage::gc", "debug");
        assert_eq!(
            config.directives(),
            "info,strata_storage::gc=debug,strata_storage::query=trace"
        );

        let mut config = LogConfig::development();
        config.console.level = Some("warn".to_string());
        assert_eq!(config.console_directives(), "warn,strata_storage::access=info");
    }

    #[test]
    fn test_partial_toml() {
        let config: LogConfig = toml::from_str(
            r#"
            default_level = "debug"

            [console]
            format = "compact"

            [file]
            directory = "/tmp/strata-logs"
            rotation = "hourly"

            [targets]
            "strata_storage::tiered" = "trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.console.format, ConsoleFormat::Compact);
        assert!(config.console.enabled);
        let file = config.file.as_ref().unwrap();
        assert_eq!(file.rotation, RotationStrategy::Hourly);
        assert_eq!(file.prefix, "strata");
        assert_eq!(config.directives(), "debug,strata_storage::tiered=trace");
    }
}
