//! Configuration for stagehand, read from `.stagehand/stagehand.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags. Every
//! section is optional and falls back to defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [storage]
//! db_path = ".stagehand/stagehand.db"
//! workspace_root = ".stagehand/workspaces"
//!
//! [events]
//! recent_limit = 10
//!
//! [logging]
//! level = "info"
//! json = false
//! log_dir = ".stagehand/logs"
//!
//! [stages.spec]
//! command = "./generators/spec.sh"
//! args = ["--format", "json"]
//! timeout_secs = 120
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::orchestrator::Stage;

pub const CONFIG_DIR: &str = ".stagehand";
pub const CONFIG_FILE: &str = "stagehand.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for local frontend development
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

/// Where runs, events and artifacts live. Relative paths resolve against
/// the project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("stagehand.db")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("workspaces")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workspace_root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    /// How many of the latest events are embedded in run details
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

fn default_recent_limit() -> usize {
    10
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            recent_limit: default_recent_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also written to a daily rolling file here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

/// External program backing one stage capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// The complete stagehand.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagehandToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Keyed by stage name (`spec`, `plan`, `app_code`, ...)
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommandConfig>,
}

impl StagehandToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Load `stagehand.toml` from the given directory, or defaults if absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn stage_command(&self, stage: Stage) -> Option<&StageCommandConfig> {
        self.stages.get(stage.name())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.events.recent_limit == 0 {
            warnings.push("events.recent_limit is 0; run details will embed no events".to_string());
        }

        for (name, stage) in &self.stages {
            if Stage::from_name(name).is_none() {
                let known: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
                warnings.push(format!(
                    "Unknown stage '{}' in [stages]. Valid stages: {}",
                    name,
                    known.join(", ")
                ));
            }
            if stage.command.trim().is_empty() {
                warnings.push(format!("stages.{}.command is empty", name));
            }
            if stage.timeout_secs == 0 {
                warnings.push(format!("stages.{}.timeout_secs is 0; every run would time out", name));
            }
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
///
/// Merges, in order:
/// 1. stagehand.toml
/// 2. Environment variables (`STAGEHAND_DB_PATH`, `STAGEHAND_WORKSPACE_ROOT`, `STAGEHAND_PORT`)
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: StagehandToml,
}

impl StagehandConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = StagehandToml::load_or_default(&config_dir)?;

        let mut config = Self {
            project_dir,
            config_dir,
            toml,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` so tests need not touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup("STAGEHAND_DB_PATH") {
            self.toml.storage.db_path = PathBuf::from(db_path);
        }
        if let Some(root) = lookup("STAGEHAND_WORKSPACE_ROOT") {
            self.toml.storage.workspace_root = PathBuf::from(root);
        }
        if let Some(port) = lookup("STAGEHAND_PORT") {
            self.toml.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid STAGEHAND_PORT '{}'", port))?;
        }
        Ok(())
    }

    /// Apply `serve` flags on top of file and environment settings.
    pub fn with_server_overrides(mut self, host: Option<String>, port: Option<u16>, dev: bool) -> Self {
        if let Some(host) = host {
            self.toml.server.host = host;
        }
        if let Some(port) = port {
            self.toml.server.port = port;
        }
        if dev {
            self.toml.server.dev_mode = true;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.storage.db_path)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(&self.toml.storage.workspace_root)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.log_dir.as_deref().map(|p| self.resolve(p))
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stagehand_toml_parse_empty() {
        let toml = StagehandToml::parse("").unwrap();
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.server.port, 3141);
        assert!(!toml.server.dev_mode);
        assert_eq!(toml.events.recent_limit, 10);
        assert_eq!(toml.logging.level, "info");
        assert!(toml.stages.is_empty());
    }

    #[test]
    fn test_stagehand_toml_parse_sections() {
        let content = r#"
[server]
port = 8080
dev_mode = true

[storage]
db_path = "/var/lib/stagehand/runs.db"

[events]
recent_limit = 25

[stages.spec]
command = "spec-gen"
args = ["--json"]

[stages.deploy]
command = "deploy.sh"
timeout_secs = 900
"#;
        let toml = StagehandToml::parse(content).unwrap();
        assert_eq!(toml.server.port, 8080);
        assert!(toml.server.dev_mode);
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.storage.db_path, PathBuf::from("/var/lib/stagehand/runs.db"));
        assert_eq!(toml.storage.workspace_root, default_workspace_root());
        assert_eq!(toml.events.recent_limit, 25);

        let spec = toml.stage_command(Stage::Spec).unwrap();
        assert_eq!(spec.command, "spec-gen");
        assert_eq!(spec.args, vec!["--json"]);
        assert_eq!(spec.timeout_secs, 300);
        assert_eq!(toml.stage_command(Stage::Deploy).unwrap().timeout_secs, 900);
        assert!(toml.stage_command(Stage::Plan).is_none());
    }

    #[test]
    fn test_stagehand_toml_parse_invalid() {
        assert!(StagehandToml::parse("[server]\nport = \"not a number\"").is_err());
    }

    #[test]
    fn test_validate_valid() {
        let toml = StagehandToml::parse("[stages.app_code]\ncommand = \"gen\"").unwrap();
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"
[server]
port = 0

[stages.linting]
command = "lint"

[stages.test]
command = ""
timeout_secs = 0
"#;
        let warnings = StagehandToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("server.port")));
        assert!(warnings.iter().any(|w| w.contains("Unknown stage 'linting'")));
        assert!(warnings.iter().any(|w| w.contains("stages.test.command")));
        assert!(warnings.iter().any(|w| w.contains("stages.test.timeout_secs")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = StagehandToml::default();
        toml.server.port = 9000;
        toml.stages.insert(
            "infra".to_string(),
            StageCommandConfig {
                command: "terraform-gen".to_string(),
                args: vec![],
                timeout_secs: 60,
            },
        );
        toml.save(&path).unwrap();

        let loaded = StagehandToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9000);
        assert_eq!(loaded.stage_command(Stage::Infra).unwrap().command, "terraform-gen");
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let toml = StagehandToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.server.port, 3141);
    }

    #[test]
    fn test_config_resolves_relative_paths_against_project() {
        let dir = tempdir().unwrap();
        let config = StagehandConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.db_path().starts_with(&config.project_dir));
        assert!(config.db_path().ends_with(".stagehand/stagehand.db"));
        assert!(config.workspace_root().ends_with(".stagehand/workspaces"));
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let mut config = StagehandConfig::new(dir.path().to_path_buf()).unwrap();
        config
            .apply_env(|key| match key {
                "STAGEHAND_DB_PATH" => Some("/tmp/other.db".to_string()),
                "STAGEHAND_PORT" => Some("4000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/other.db"));
        assert_eq!(config.toml.server.port, 4000);
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let dir = tempdir().unwrap();
        let mut config = StagehandConfig::new(dir.path().to_path_buf()).unwrap();
        let result = config.apply_env(|key| (key == "STAGEHAND_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = tempdir().unwrap();
        let config = StagehandConfig::new(dir.path().to_path_buf())
            .unwrap()
            .with_server_overrides(Some("0.0.0.0".to_string()), Some(5000), true);
        assert_eq!(config.toml.server.host, "0.0.0.0");
        assert_eq!(config.toml.server.port, 5000);
        assert!(config.toml.server.dev_mode);
    }
}
