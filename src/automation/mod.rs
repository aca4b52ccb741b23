//! Timed automation scripts.
//!
//! [`script`] holds the script data model and builder; [`scheduler`] runs a loaded script
//! against the dashboard on the foreground loop.

pub mod scheduler;
pub mod script;

pub use scheduler::{AutomationScheduler, AutomationState, AutomationStatus};
pub use script::{format_hms, parse_hms, Action, Script, ScriptBuilder, Step};
