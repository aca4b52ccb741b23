//! Panel configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/panel.toml` by default)
//! 2. environment variables prefixed with `DAQ_PANEL_`, using `__` between nested keys
//!    (e.g. `DAQ_PANEL_POLLING__INTERVAL=500ms`)
//!
//! # Example
//! ```no_run
//! use daq_panel::config::PanelConfig;
//!
//! let config = PanelConfig::load()?;
//! config.validate().map_err(daq_panel::error::PanelError::Configuration)?;
//! println!("Dashboard: {}", config.application.name);
//! # Ok::<(), daq_panel::error::PanelError>(())
//! ```

use crate::automation::script::parse_hms;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level panel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Poll cycle settings
    #[serde(default)]
    pub polling: PollingConfig,
    /// Automation scheduler settings
    #[serde(default)]
    pub automation: AutomationConfig,
    /// Error reporting settings
    #[serde(default)]
    pub errors: ErrorConfig,
    /// CSV data logging settings
    #[serde(default)]
    pub data_logging: DataLoggingConfig,
    /// Remote command server settings
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Replace every serial link with the device's emulator
    #[serde(default)]
    pub use_emulators: bool,
    /// Widget definitions, in display order
    #[serde(default)]
    pub widgets: Vec<WidgetDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Dashboard name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Console log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Poll cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Time between poll cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Capacity of each link group's command queue
    pub queue_capacity: usize,
    /// Period of the foreground loop
    #[serde(with = "humantime_serde")]
    pub ui_tick: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            queue_capacity: 64,
            ui_tick: Duration::from_millis(50),
        }
    }
}

/// Automation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Time between scheduler ticks while a script runs
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Record the current step index with every data log row
    pub step_logging: bool,
    /// Operation limit for a single script call
    pub max_operations: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            step_logging: false,
            max_operations: 100_000,
        }
    }
}

/// Error reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// Print full error chains with backtraces when available
    pub print_stacktraces: bool,
    /// Show reported errors on the console
    pub console: bool,
    /// Append every log line to this file as well
    pub log_file: Option<PathBuf>,
    /// Number of recent reports kept in memory
    pub history: usize,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            print_stacktraces: false,
            console: true,
            log_file: None,
            history: 200,
        }
    }
}

/// CSV data logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoggingConfig {
    /// Output file; logging starts at launch when set
    pub path: Option<PathBuf>,
    /// Interval between rows, as `h:mm:ss`
    pub interval: String,
}

impl Default for DataLoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval: "0:00:10".to_string(),
        }
    }
}

/// Remote command server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Start the server at launch
    pub enabled: bool,
    /// Address to bind
    pub bind: String,
    /// One listener per port
    pub ports: Vec<u16>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            ports: vec![12345],
        }
    }
}

/// Widget definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetDefinition {
    /// Unique nickname used by scripts and remote commands
    pub nickname: String,
    /// Device type (e.g. "omega_usb_utc", "iot_relay", "mks_mfc", "mock")
    pub r#type: String,
    /// Display name; defaults to the device model name
    #[serde(default)]
    pub name: Option<String>,
    /// Whether this widget is built at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Serial port path
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate; defaults to the device's own rate
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Read timeout on the serial link
    #[serde(default = "default_link_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Nickname of an earlier widget whose link this widget shares
    #[serde(default)]
    pub share_link_with: Option<String>,
    /// Poll this widget once every N cycles
    #[serde(default = "default_update_stride")]
    pub update_stride: u32,
    /// Device-specific configuration (dynamic)
    #[serde(default = "default_device_config")]
    pub config: toml::Value,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_link_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_update_stride() -> u32 {
    1
}

fn default_device_config() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl PanelConfig {
    /// Load configuration from `config/panel.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/panel.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_PANEL_").split("__"))
            .extract()
    }

    /// Load configuration from a TOML string, without environment overrides
    pub fn from_toml_str(source: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(source)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.polling.interval.is_zero() {
            return Err("polling.interval must be greater than zero".to_string());
        }
        if self.polling.ui_tick.is_zero() {
            return Err("polling.ui_tick must be greater than zero".to_string());
        }
        if self.polling.queue_capacity == 0 {
            return Err("polling.queue_capacity must be at least 1".to_string());
        }
        if self.automation.tick.is_zero() {
            return Err("automation.tick must be greater than zero".to_string());
        }

        match parse_hms(&self.data_logging.interval) {
            Ok(interval) if !interval.is_zero() => {}
            Ok(_) => return Err("data_logging.interval must be greater than zero".to_string()),
            Err(e) => return Err(format!("Invalid data_logging.interval: {}", e)),
        }

        if self.rpc.enabled && self.rpc.ports.is_empty() {
            return Err("rpc.ports must list at least one port when rpc is enabled".to_string());
        }

        // Link sharing must point at an earlier, enabled widget.
        let mut seen = HashSet::new();
        for widget in self.enabled_widgets() {
            if widget.update_stride == 0 {
                return Err(format!(
                    "Widget '{}' has update_stride 0; it must be at least 1",
                    widget.nickname
                ));
            }
            if let Some(primary) = &widget.share_link_with {
                if !seen.contains(primary.as_str()) {
                    return Err(format!(
                        "Widget '{}' shares the link of '{}', which is not defined before it",
                        widget.nickname, primary
                    ));
                }
            }
            seen.insert(widget.nickname.as_str());
        }

        Ok(())
    }

    /// Get all enabled widgets
    pub fn enabled_widgets(&self) -> impl Iterator<Item = &WidgetDefinition> {
        self.widgets.iter().filter(|w| w.enabled)
    }
}
