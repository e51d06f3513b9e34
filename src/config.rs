use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::{BackupConfig, CloneOptions, RunMode};
use crate::error::BackupError;

/// Main configuration structure for reposnap
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Output directory (or `.json` file in fetch mode)
    #[serde(default = "default_output")]
    pub output: String,

    /// GitHub authentication and discovery settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Backup run behavior
    #[serde(default)]
    pub backup: BackupSettings,

    /// Rolling backup schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Completion notifications
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Access token; takes precedence over `auth_method` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Users to back up; empty means the authenticated user
    #[serde(default)]
    pub usernames: Vec<String>,

    /// Organizations whose members are backed up
    #[serde(default)]
    pub organizations: Vec<String>,

    /// Include repositories starred by each user
    #[serde(default)]
    pub include_starred: bool,

    /// API base URL for GitHub Enterprise or compatible forges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

/// Backup run configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupSettings {
    /// Run type
    #[serde(default = "default_run_type")]
    pub run_type: String, // "clone", "fetch", "dry-run"

    /// Clone submodules recursively
    #[serde(default)]
    pub recurse_submodules: bool,

    /// Maximum concurrent clones, 0 for no limit
    #[serde(default)]
    pub max_parallel: usize,

    /// Timeout for a single clone in seconds, 0 for none
    #[serde(default)]
    pub timeout: u64,
}

/// Rolling backup schedule
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// Interval between backups
    #[serde(default = "default_interval")]
    pub interval: String, // "24h"

    /// Number of snapshot directories to keep
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

/// Notification configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotifyConfig {
    /// ntfy topic URL to POST to after each backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Report the backup as failed when the notification can't be sent
    #[serde(default = "default_true")]
    pub fail_on_error: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

// Default value functions
fn default_output() -> String {
    "backup".to_string()
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_true() -> bool {
    true
}
fn default_run_type() -> String {
    "clone".to_string()
}
fn default_interval() -> String {
    "24h".to_string()
}
fn default_max_backups() -> usize {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            token: None,
            usernames: Vec::new(),
            organizations: Vec::new(),
            include_starred: false,
            api_url: None,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            run_type: default_run_type(),
            recurse_submodules: false,
            max_parallel: 0,
            timeout: 0,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_backups: default_max_backups(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            fail_on_error: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("reposnap").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.output = shellexpand::full(&self.output)
            .context("Failed to expand output path")?
            .into_owned();

        Ok(())
    }

    /// Override file settings from `REPOSNAP_*` environment variables
    ///
    /// List variables are comma-separated. Unset or blank variables leave the
    /// file value alone.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(output) = env_value("REPOSNAP_OUTPUT") {
            self.output = output;
            self.expand_paths()?;
        }

        if let Some(token) = env_value("REPOSNAP_GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(method) = env_value("REPOSNAP_GITHUB_AUTH_METHOD") {
            self.github.auth_method = method;
        }
        if let Some(usernames) = env_value("REPOSNAP_GITHUB_USERNAMES") {
            self.github.usernames = split_list(&usernames);
        }
        if let Some(organizations) = env_value("REPOSNAP_GITHUB_ORGANIZATIONS") {
            self.github.organizations = split_list(&organizations);
        }
        if let Some(starred) = env_value("REPOSNAP_GITHUB_INCLUDE_STARRED") {
            self.github.include_starred = parse_env("REPOSNAP_GITHUB_INCLUDE_STARRED", &starred)?;
        }
        if let Some(api_url) = env_value("REPOSNAP_GITHUB_API_URL") {
            self.github.api_url = Some(api_url);
        }

        if let Some(run_type) = env_value("REPOSNAP_BACKUP_RUN_TYPE") {
            self.backup.run_type = run_type;
        }
        if let Some(interval) = env_value("REPOSNAP_SCHEDULE_INTERVAL") {
            self.schedule.interval = interval;
        }
        if let Some(max_backups) = env_value("REPOSNAP_SCHEDULE_MAX_BACKUPS") {
            self.schedule.max_backups = parse_env("REPOSNAP_SCHEDULE_MAX_BACKUPS", &max_backups)?;
        }
        if let Some(url) = env_value("REPOSNAP_NOTIFY_URL") {
            self.notify.url = Some(url);
        }
        if let Some(level) = env_value("REPOSNAP_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Build the per-run backup configuration
    ///
    /// Fails with [`BackupError::InvalidRunType`] before any network access
    /// when `backup.run_type` names an unknown mode.
    pub fn backup_config(&self, token: String) -> std::result::Result<BackupConfig, BackupError> {
        let run_mode: RunMode = self.backup.run_type.parse()?;

        Ok(BackupConfig {
            usernames: self.github.usernames.clone(),
            organizations: self.github.organizations.clone(),
            include_starred: self.github.include_starred,
            token,
            output: PathBuf::from(&self.output),
            run_mode,
            notify_url: self.notify.url.clone().filter(|url| !url.trim().is_empty()),
            fail_on_notify_error: self.notify.fail_on_error,
            clone: CloneOptions {
                recurse_submodules: self.backup.recurse_submodules,
                max_parallel: (self.backup.max_parallel > 0).then_some(self.backup.max_parallel),
                timeout: (self.backup.timeout > 0).then(|| Duration::from_secs(self.backup.timeout)),
            },
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: default_output(),
            github: GitHubConfig::default(),
            backup: BackupSettings::default(),
            schedule: ScheduleConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.output, "backup");
        assert_eq!(config.github.auth_method, "auto");
        assert!(config.github.usernames.is_empty());
        assert!(!config.github.include_starred);
        assert_eq!(config.backup.run_type, "clone");
        assert_eq!(config.backup.max_parallel, 0);
        assert_eq!(config.schedule.interval, "24h");
        assert_eq!(config.schedule.max_backups, 1);
        assert!(config.notify.url.is_none());
        assert!(config.notify.fail_on_error);
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOSNAP_HOME", "/test/home");

        let mut config = Config::default();
        config.output = "${TEST_REPOSNAP_HOME}/backups".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.output, "/test/home/backups");

        env::remove_var("TEST_REPOSNAP_HOME");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file_values() {
        env::set_var("REPOSNAP_GITHUB_TOKEN", "ghp_from_env");
        env::set_var("REPOSNAP_GITHUB_USERNAMES", "alice, bob,,");
        env::set_var("REPOSNAP_GITHUB_INCLUDE_STARRED", "true");
        env::set_var("REPOSNAP_BACKUP_RUN_TYPE", "fetch");
        env::set_var("REPOSNAP_SCHEDULE_MAX_BACKUPS", "4");
        env::set_var("REPOSNAP_NOTIFY_URL", "https://ntfy.sh/backups");
        env::set_var("REPOSNAP_GITHUB_ORGANIZATIONS", "  ");

        let mut config = Config::default();
        config.github.organizations = vec!["acme".to_string()];
        let result = config.apply_env_overrides();

        for key in [
            "REPOSNAP_GITHUB_TOKEN",
            "REPOSNAP_GITHUB_USERNAMES",
            "REPOSNAP_GITHUB_INCLUDE_STARRED",
            "REPOSNAP_BACKUP_RUN_TYPE",
            "REPOSNAP_SCHEDULE_MAX_BACKUPS",
            "REPOSNAP_NOTIFY_URL",
            "REPOSNAP_GITHUB_ORGANIZATIONS",
        ] {
            env::remove_var(key);
        }

        result.expect("overrides should apply");
        assert_eq!(config.github.token.as_deref(), Some("ghp_from_env"));
        assert_eq!(config.github.usernames, vec!["alice", "bob"]);
        assert!(config.github.include_starred);
        assert_eq!(config.backup.run_type, "fetch");
        assert_eq!(config.schedule.max_backups, 4);
        assert_eq!(config.notify.url.as_deref(), Some("https://ntfy.sh/backups"));
        // Blank variables keep the file value
        assert_eq!(config.github.organizations, vec!["acme"]);
    }

    #[test]
    #[serial]
    fn test_env_output_is_expanded() {
        env::set_var("TEST_REPOSNAP_HOME", "/test/home");
        env::set_var("REPOSNAP_OUTPUT", "$TEST_REPOSNAP_HOME/github");

        let mut config = Config::default();
        let result = config.apply_env_overrides();

        env::remove_var("REPOSNAP_OUTPUT");
        env::remove_var("TEST_REPOSNAP_HOME");

        result.unwrap();
        assert_eq!(config.output, "/test/home/github");
    }

    #[test]
    #[serial]
    fn test_env_invalid_number_is_rejected() {
        env::set_var("REPOSNAP_SCHEDULE_MAX_BACKUPS", "many");

        let result = Config::default().apply_env_overrides();

        env::remove_var("REPOSNAP_SCHEDULE_MAX_BACKUPS");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("REPOSNAP_SCHEDULE_MAX_BACKUPS"));
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.output = "/srv/backups".to_string();
        config.github.usernames = vec!["alice".to_string()];
        config.github.organizations = vec!["acme".to_string()];
        config.schedule.max_backups = 7;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.output, "/srv/backups");
        assert_eq!(loaded.github.usernames, vec!["alice".to_string()]);
        assert_eq!(loaded.github.organizations, vec!["acme".to_string()]);
        assert_eq!(loaded.schedule.max_backups, 7);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("reposnap"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
output: "/data/github"
github:
  auth_method: "token"
  usernames: ["alice", "bob"]
  organizations: ["acme"]
  include_starred: true
  api_url: "https://ghe.example.com/api/v3"
backup:
  run_type: "fetch"
  recurse_submodules: true
  max_parallel: 8
  timeout: 600
schedule:
  interval: "12h"
  max_backups: 3
notify:
  url: "https://ntfy.sh/backups"
  fail_on_error: false
logging:
  level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.output, "/data/github");
        assert_eq!(config.github.auth_method, "token");
        assert_eq!(config.github.usernames, vec!["alice", "bob"]);
        assert_eq!(config.github.organizations, vec!["acme"]);
        assert!(config.github.include_starred);
        assert_eq!(
            config.github.api_url.as_deref(),
            Some("https://ghe.example.com/api/v3")
        );
        assert_eq!(config.backup.run_type, "fetch");
        assert!(config.backup.recurse_submodules);
        assert_eq!(config.backup.max_parallel, 8);
        assert_eq!(config.backup.timeout, 600);
        assert_eq!(config.schedule.interval, "12h");
        assert_eq!(config.schedule.max_backups, 3);
        assert_eq!(config.notify.url.as_deref(), Some("https://ntfy.sh/backups"));
        assert!(!config.notify.fail_on_error);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_backup_config_conversion() {
        let mut config = Config::default();
        config.github.usernames = vec!["alice".to_string()];
        config.backup.run_type = "dry-run".to_string();
        config.backup.max_parallel = 4;
        config.backup.timeout = 30;
        config.notify.url = Some(" ".to_string());

        let backup = config.backup_config("ghp_secret".to_string()).unwrap();

        assert_eq!(backup.run_mode, RunMode::DryRun);
        assert_eq!(backup.usernames, vec!["alice".to_string()]);
        assert_eq!(backup.output, PathBuf::from("backup"));
        assert_eq!(backup.clone.max_parallel, Some(4));
        assert_eq!(backup.clone.timeout, Some(Duration::from_secs(30)));
        assert!(backup.notify_url.is_none());
        assert!(!format!("{:?}", backup).contains("ghp_secret"));
    }

    #[test]
    fn test_backup_config_unlimited_parallelism() {
        let backup = Config::default()
            .backup_config("token".to_string())
            .unwrap();

        assert_eq!(backup.run_mode, RunMode::Clone);
        assert_eq!(backup.clone.max_parallel, None);
        assert_eq!(backup.clone.timeout, None);
    }

    #[test]
    fn test_backup_config_invalid_run_type() {
        let mut config = Config::default();
        config.backup.run_type = "mirror".to_string();

        let err = config.backup_config("token".to_string()).unwrap_err();
        assert_matches!(err, BackupError::InvalidRunType(ref value) if value == "mirror");
    }
}
