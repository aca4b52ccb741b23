//! Log output for the panel.
//!
//! Everything goes through `tracing`. [`init_from_config`] installs one console layer in the
//! configured format and, when `errors.log_file` is set, a plain-text file layer that receives
//! every event. Reports from the [`ErrorReporter`](crate::reporter::ErrorReporter) are emitted
//! under [`ERROR_TARGET`]; with `errors.console = false` they reach the file only.
//!
//! `RUST_LOG` overrides the configured level on the console.
//!
//! ```no_run
//! use daq_panel::{config::PanelConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PanelConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Dashboard started");
//! # Ok(())
//! # }
//! ```

use crate::config::PanelConfig;
use crate::error::{AppResult, PanelError};
use crate::reporter::ERROR_TARGET;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    filter::{self, FilterExt},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Console line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line, no color
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for ConsoleFormat {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(ConsoleFormat::Pretty),
            "compact" => Ok(ConsoleFormat::Compact),
            "json" => Ok(ConsoleFormat::Json),
            other => Err(PanelError::Configuration(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Where log events go.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Most verbose level shown
    pub level: Level,
    /// Console line format
    pub console_format: ConsoleFormat,
    /// Print error reports on the console too
    pub errors_on_console: bool,
    /// Plain-text copy of every event
    pub log_file: Option<PathBuf>,
}

impl LogSettings {
    /// Read `application.log_level`, `application.log_format` and the `errors` section.
    pub fn from_config(config: &PanelConfig) -> AppResult<Self> {
        let level = Level::from_str(&config.application.log_level).map_err(|_| {
            PanelError::Configuration(format!(
                "unknown log level '{}'",
                config.application.log_level
            ))
        })?;
        Ok(Self {
            level,
            console_format: config.application.log_format.parse()?,
            errors_on_console: config.errors.console,
            log_file: config.errors.log_file.clone(),
        })
    }

    fn level_directive(&self) -> String {
        self.level.as_str().to_ascii_lowercase()
    }
}

/// [`init`] with settings read from `config`.
pub fn init_from_config(config: &PanelConfig) -> AppResult<()> {
    init(&LogSettings::from_config(config)?)
}

/// Install the global subscriber. Does nothing if one is already installed.
pub fn init(settings: &LogSettings) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let directive = settings.level_directive();
    let errors_on_console = settings.errors_on_console;
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&directive))
        .and(filter::filter_fn(move |meta| {
            errors_on_console || meta.target() != ERROR_TARGET
        }));

    // Worker threads are named after their link group
    let console: Box<dyn Layer<Registry> + Send + Sync> = match settings.console_format {
        ConsoleFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_filter(console_filter)
            .boxed(),
        ConsoleFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(console_filter)
            .boxed(),
        ConsoleFormat::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_filter(console_filter)
            .boxed(),
    };

    let file = settings
        .log_file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    PanelError::Configuration(format!(
                        "cannot open log file {}: {}",
                        path.display(),
                        e
                    ))
                })
        })
        .transpose()?
        .map(|file| {
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(EnvFilter::new(&directive))
        });

    // Lost a race with another initializer; theirs stays in place
    let _ = tracing_subscriber::registry().with(console).with(file).try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str, format: &str) -> PanelConfig {
        PanelConfig::from_toml_str(&format!(
            r#"
            [application]
            name = "Test"
            log_level = "{}"
            log_format = "{}"

            [errors]
            console = false
            log_file = "panel.log"
            "#,
            level, format
        ))
        .unwrap()
    }

    #[test]
    fn settings_follow_config() {
        let settings = LogSettings::from_config(&config("DEBUG", "json")).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.console_format, ConsoleFormat::Json);
        assert!(!settings.errors_on_console);
        assert_eq!(settings.log_file, Some(PathBuf::from("panel.log")));
        assert_eq!(settings.level_directive(), "debug");
    }

    #[test]
    fn bad_level_or_format_is_a_config_error() {
        assert!(matches!(
            LogSettings::from_config(&config("loud", "pretty")),
            Err(PanelError::Configuration(_))
        ));
        assert!(matches!(
            LogSettings::from_config(&config("info", "xml")),
            Err(PanelError::Configuration(_))
        ));
    }

    #[test]
    fn init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings {
            level: Level::INFO,
            console_format: ConsoleFormat::Compact,
            errors_on_console: true,
            log_file: Some(dir.path().join("a.log")),
        };
        assert!(init(&settings).is_ok());
        assert!(init(&settings).is_ok());
    }
}
