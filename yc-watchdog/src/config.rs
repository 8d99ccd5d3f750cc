//! Configuration for the watchdog.
//!
//! Loaded once at startup from a YAML file and/or environment variables
//! using figment, then never mutated.
//!
//! # Configuration Sources (in order of priority, lowest to highest)
//!
//! 1. Default values (from `#[serde(default)]` attributes)
//! 2. YAML config file (if present)
//! 3. Environment variables (prefix: `YC_WATCHDOG_`, nested with `__`)
//!
//! # Example
//!
//! ```yaml
//! vms:
//!   - vm-a
//!   - vm-b
//! loggpath: /var/log/yc.log
//! logglevel: debug
//! yc:
//!   profile: prod
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use yc_control::{Version, YcCli};

use crate::error::{Error, Result};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "YC_WATCHDOG_";

/// Default URL of the official `yc` installer script.
pub const DEFAULT_INSTALLER_URL: &str = "https://storage.yandexcloud.net/yandexcloud-yc/install.sh";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// VMs to keep running, checked in this order
    #[serde(default)]
    pub vms: Vec<String>,
    /// Log file, appended to
    #[serde(rename = "loggpath", default = "default_log_path")]
    pub log_path: PathBuf,
    /// Log verbosity
    #[serde(rename = "logglevel", default)]
    pub log_level: LogLevel,
    /// Pause between the end of one poll cycle and the start of the next (seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound for each non-interactive `yc` call (seconds)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// VMs checked at once within a cycle (1 = strictly sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Return from `yc compute instance start` without waiting for the operation
    #[serde(default = "default_true")]
    pub start_async: bool,
    /// Bootstrap attempts before a setup failure becomes fatal
    #[serde(default = "default_setup_attempts")]
    pub setup_attempts: u32,
    /// Delay between bootstrap attempts (seconds)
    #[serde(default = "default_setup_retry_delay_secs")]
    pub setup_retry_delay_secs: u64,
    /// Control-plane CLI settings
    #[serde(default)]
    pub yc: YcConfig,
    /// Host requirements
    #[serde(default)]
    pub requirements: RequirementsConfig,
}

/// Log verbosity accepted in `logglevel`, case-insensitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(Error::Config(format!(
                "logglevel: unsupported level '{other}' (expected DEBUG, INFO or ERROR)"
            ))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        })
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Control-plane CLI configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct YcConfig {
    /// Binary name (looked up on PATH) or absolute path
    #[serde(default = "default_yc_binary")]
    pub binary: PathBuf,
    /// Oldest supported CLI version, `major.minor.patch`
    #[serde(default = "default_min_version")]
    pub min_version: String,
    /// Installer script fetched when the binary is missing
    #[serde(default = "default_installer_url")]
    pub installer_url: String,
    /// Install prefix for the CLI (default: `~/yandex-cloud`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
    /// CLI profile passed as `--profile`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Folder passed as `--folder-id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

fn default_yc_binary() -> PathBuf {
    PathBuf::from("yc")
}

fn default_min_version() -> String {
    "0.100.0".to_string()
}

fn default_installer_url() -> String {
    DEFAULT_INSTALLER_URL.to_string()
}

impl Default for YcConfig {
    fn default() -> Self {
        Self {
            binary: default_yc_binary(),
            min_version: default_min_version(),
            installer_url: default_installer_url(),
            install_dir: None,
            profile: None,
            folder_id: None,
        }
    }
}

impl YcConfig {
    /// Minimum CLI version as a parsed triple.
    pub fn min_version(&self) -> Result<Version> {
        self.min_version
            .parse()
            .map_err(|e| Error::Config(format!("yc.min_version: {e}")))
    }

    /// Install prefix used by the installer script.
    pub fn install_dir(&self) -> PathBuf {
        self.install_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/root"))
                .join("yandex-cloud")
        })
    }
}

/// Host commands the bootstrap relies on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequirementsConfig {
    /// Executables that must be on PATH
    #[serde(default = "default_required_commands")]
    pub commands: Vec<String>,
    /// Packages to install when a command is missing (default: the command names)
    #[serde(default)]
    pub packages: Vec<String>,
    /// Package manager invocation; packages are appended
    #[serde(default = "default_package_installer")]
    pub installer: Vec<String>,
}

fn default_required_commands() -> Vec<String> {
    vec!["bash".to_string()]
}

fn default_package_installer() -> Vec<String> {
    ["apt-get", "install", "-y"].map(String::from).to_vec()
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            commands: default_required_commands(),
            packages: Vec::new(),
            installer: default_package_installer(),
        }
    }
}

impl RequirementsConfig {
    /// Packages to hand to the package manager.
    pub fn packages(&self) -> &[String] {
        if self.packages.is_empty() {
            &self.commands
        } else {
            &self.packages
        }
    }
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/yc.log")
}

fn default_interval_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_setup_attempts() -> u32 {
    3
}

fn default_setup_retry_delay_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from a YAML file merged with environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::new();

        // Add YAML file if it exists
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        }

        // Add environment variables (always, to allow overrides)
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(figment).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{msg} (loaded from {})", path.display())),
            other => other,
        })
    }

    /// Extract and validate configuration from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Expand ~ in paths
        config.log_path = expand_tilde(&config.log_path);
        config.yc.binary = expand_tilde(&config.yc.binary);
        config.yc.install_dir = config.yc.install_dir.map(|p| expand_tilde(&p));

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.vms.is_empty() {
            errors.push("vms: no VMs defined".to_string());
        }
        if self.vms.iter().any(|vm| vm.trim().is_empty()) {
            errors.push("vms: VM identifiers must not be empty".to_string());
        }
        if self.interval_secs == 0 {
            errors.push("interval_secs: must be greater than zero".to_string());
        }
        if self.command_timeout_secs == 0 {
            errors.push("command_timeout_secs: must be greater than zero".to_string());
        }
        if self.concurrency == 0 {
            errors.push("concurrency: must be at least 1".to_string());
        }
        if self.setup_attempts == 0 {
            errors.push("setup_attempts: must be at least 1".to_string());
        }
        if let Err(e) = self.yc.min_version() {
            errors.push(e.to_string());
        }
        if self.requirements.installer.is_empty() && !self.requirements.commands.is_empty() {
            errors.push("requirements.installer: package manager command is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }

    /// Default configuration file, relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".config.yml")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn setup_retry_delay(&self) -> Duration {
        Duration::from_secs(self.setup_retry_delay_secs)
    }

    /// Build a CLI handle for the resolved `yc` binary.
    pub fn control_plane(&self, binary: impl Into<PathBuf>) -> YcCli {
        let mut cli = YcCli::new(binary)
            .with_timeout(self.command_timeout())
            .with_async_start(self.start_async);
        if let Some(ref profile) = self.yc.profile {
            cli = cli.with_profile(profile);
        }
        if let Some(ref folder_id) = self.yc.folder_id {
            cli = cli.with_folder_id(folder_id);
        }
        cli
    }
}

/// Expand ~ to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str()
        && let Some(rest) = path_str.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
