//! Configuration management for the sniffjoke engine
//!
//! Loads the run configuration from a YAML file: the scramble classes the
//! location allows, the plugin list with per-plugin options, the option
//! injectors to use and where to cache hop-count estimates.

use crate::hack;
use crate::options::{default_injectors, OptionComposer, OptionProto};
use crate::scramble::Scramble;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// Per-plugin settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name, matched case-insensitively
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form option string handed to the plugin at load time
    #[serde(default)]
    pub option: Option<String>,
}

/// Option injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Allow IP option injection
    #[serde(default = "default_enabled")]
    pub ip_enabled: bool,
    /// Allow TCP option injection
    #[serde(default = "default_enabled")]
    pub tcp_enabled: bool,
    /// Injectors switched off by name (e.g. "IP SSRR")
    #[serde(default)]
    pub disabled_injectors: Vec<String>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            ip_enabled: default_enabled(),
            tcp_enabled: default_enabled(),
            disabled_injectors: Vec::new(),
        }
    }
}

/// Hop-count estimation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// YAML file where KNOWN estimates are kept between runs
    #[serde(default)]
    pub cache_path: Option<String>,
    /// Destinations idle for longer than this are forgotten (seconds)
    #[serde(default = "default_ttl_idle_expiry")]
    pub idle_expiry_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            idle_expiry_secs: default_ttl_idle_expiry(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    /// Whether to log to file
    #[serde(default)]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default)]
    pub log_file_path: Option<String>,
    /// Trace every option injection on the `sniffjoke::packet` target
    #[serde(default)]
    pub packet_log: bool,
    /// Name of the network location profile
    #[serde(default = "default_location")]
    pub location: String,
    /// Scramble classes usable at this location
    #[serde(default = "default_scrambles")]
    pub scrambles: Vec<String>,
    /// Plugin list; plugins not named here load with no option
    #[serde(default = "default_plugins")]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: false,
            log_file_path: None,
            packet_log: false,
            location: default_location(),
            scrambles: default_scrambles(),
            plugins: default_plugins(),
            options: OptionsConfig::default(),
            ttl: TtlConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_ttl_idle_expiry() -> u64 {
    3600
}

fn default_location() -> String {
    "generic".to_string()
}

fn default_scrambles() -> Vec<String> {
    ["ttl", "checksum", "malformed", "innocent"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_plugins() -> Vec<PluginConfig> {
    hack::registry()
        .iter()
        .map(|h| PluginConfig {
            name: h.name().to_string(),
            enabled: true,
            option: None,
        })
        .collect()
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file not found at '{}', using default configuration",
                    path.as_ref().display()
                );
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read configuration file '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow::anyhow!("Log file path cannot be empty when log_to_file is true"));
                }
            }
        }

        self.configured_scrambles()?;

        let known_plugins: Vec<&'static str> = hack::registry().iter().map(|h| h.name()).collect();
        for plugin in &self.plugins {
            if !known_plugins.iter().any(|k| k.eq_ignore_ascii_case(&plugin.name)) {
                return Err(anyhow::anyhow!(
                    "Unknown plugin: {}. Available plugins: {:?}",
                    plugin.name,
                    known_plugins
                ));
            }
        }

        let injectors = default_injectors();
        for name in &self.options.disabled_injectors {
            if !injectors.iter().any(|i| i.descriptor().name.eq_ignore_ascii_case(name)) {
                return Err(anyhow::anyhow!("Unknown option injector: {}", name));
            }
        }

        if let Some(ref path) = self.ttl.cache_path {
            if path.trim().is_empty() {
                return Err(anyhow::anyhow!("TTL cache path cannot be empty"));
            }
        }
        if self.ttl.idle_expiry_secs == 0 {
            return Err(anyhow::anyhow!("TTL idle expiry must be greater than 0"));
        }

        Ok(())
    }

    /// Union of the configured scramble classes
    pub fn configured_scrambles(&self) -> anyhow::Result<Scramble> {
        let mut mask = Scramble::NONE;
        for name in &self.scrambles {
            mask = mask | name.parse::<Scramble>()?;
        }
        if mask.is_empty() {
            return Err(anyhow::anyhow!("At least one scramble class must be enabled"));
        }
        Ok(mask)
    }

    /// Option composer with the configured injectors switched on
    pub fn option_composer(&self) -> anyhow::Result<OptionComposer> {
        let mut composer = OptionComposer::new();
        composer.set_proto_enabled(OptionProto::Ip, self.options.ip_enabled);
        composer.set_proto_enabled(OptionProto::Tcp, self.options.tcp_enabled);
        for name in &self.options.disabled_injectors {
            if !composer.set_enabled(name, false) {
                return Err(anyhow::anyhow!("Unknown option injector: {}", name));
            }
        }
        info!(
            "Option injection: IP {}, TCP {}, {} injectors disabled by name",
            if composer.proto_enabled(OptionProto::Ip) { "on" } else { "off" },
            if composer.proto_enabled(OptionProto::Tcp) { "on" } else { "off" },
            self.options.disabled_injectors.len()
        );
        Ok(composer)
    }
}
