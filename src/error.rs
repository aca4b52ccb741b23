//! Custom error types for the panel.
//!
//! This module defines the primary error type, `PanelError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle the
//! different kinds of failures a dashboard can run into, from configuration problems to
//! device callbacks and remote commands.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading and extracting configuration.
//! - **`Configuration`**: Semantic errors found by [`crate::config::PanelConfig::validate`]
//!   or while building a dashboard from configuration.
//! - **`HandshakeFailure` / `UpdateFailure` / `ConfirmFailure`**: Context attached by the
//!   widget worker to errors returned from device callbacks before they are reported.
//! - **`Script` / `Await`**: Automation script loading and await-condition evaluation.
//! - **`Rpc`**: Remote command failures; the wire response carries the message.
//! - **`UnknownWidget` / `UnknownField`**: Lookups through the dashboard API.
//! - **`FeatureNotEnabled`**: Functionality compiled out through feature flags.
//!
//! Device strategies return `anyhow::Result` so drivers can attach whatever context they
//! like; the worker wraps those errors with the variants above and hands them to the
//! [`crate::reporter::ErrorReporter`].

use thiserror::Error;

/// Convenience alias for results using the panel error type.
pub type AppResult<T> = std::result::Result<T, PanelError>;

/// Errors returned by the panel's own operations.
///
/// Device callbacks return `anyhow::Error` and are wrapped in one of the failure variants by
/// the worker that ran them.
#[derive(Error, Debug)]
pub enum PanelError {
    /// Configuration could not be loaded or merged
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is not usable
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Context on a failed handshake; carries the widget nickname
    #[error("Handshake failed on '{0}'")]
    HandshakeFailure(String),

    /// Context on a failed poll
    #[error("Update failed on '{0}'")]
    UpdateFailure(String),

    /// Context on a failed confirm
    #[error("Confirm failed on '{0}'")]
    ConfirmFailure(String),

    /// Automation or Rhai script failure
    #[error("Script error: {0}")]
    Script(String),

    /// An await predicate failed
    #[error("Await condition error: {0}")]
    Await(String),

    /// Remote command failure, local or reported by the server
    #[error("RPC error: {0}")]
    Rpc(String),

    /// No widget has this nickname
    #[error("No widget with nickname '{0}'")]
    UnknownWidget(String),

    /// The widget exists but has no such field
    #[error("Widget '{widget}' has no field '{field}'")]
    UnknownField {
        /// Widget nickname
        widget: String,
        /// Requested field name
        field: String,
    },

    /// The operation needs an open connection
    #[error("Connection is not open")]
    NotConnected,

    /// Widgets can only be added, and workers started, before launch
    #[error("Dashboard has already been launched")]
    AlreadyLaunched,

    /// No workers are running
    #[error("Dashboard has not been launched")]
    NotLaunched,

    /// A link group's queue has no room; carries the group label
    #[error("Command queue for '{0}' is full")]
    QueueFull(String),

    /// A link group's worker has stopped
    #[error("Command queue for '{0}' is closed")]
    QueueClosed(String),

    /// Needs a cargo feature this build lacks
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// CSV logger failure
    #[error("Data logging error: {0}")]
    Logging(String),

    /// RPC JSON encoding or decoding
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The panel actor is gone
    #[error("Panel runtime has shut down")]
    PanelClosed,
}

impl From<figment::Error> for PanelError {
    fn from(err: figment::Error) -> Self {
        PanelError::Config(Box::new(err))
    }
}

impl PanelError {
    /// Whether the error is a lookup failure caused by the caller (bad nickname or field).
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            PanelError::UnknownWidget(_) | PanelError::UnknownField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_message_names_widget_and_field() {
        let err = PanelError::UnknownField {
            widget: "MFC 1".into(),
            field: "Setpoint".into(),
        };
        assert_eq!(err.to_string(), "Widget 'MFC 1' has no field 'Setpoint'");
        assert!(err.is_lookup());
        assert!(!PanelError::NotConnected.is_lookup());
    }

    #[test]
    fn worker_context_wraps_cause() {
        let err = anyhow::anyhow!("timed out").context(PanelError::UpdateFailure("TC".into()));
        assert_eq!(format!("{:#}", err), "Update failed on 'TC': timed out");
    }
}
