//! Embedded Rhai scripting.
//!
//! ```text
//! ScriptHost
//!     ├── load_automation()  Rhai file → automation Script
//!     └── eval() / exec()    one-off code from remote clients
//!
//! Bindings
//!     └── DashboardView (type "Dashboard" in scripts)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let host = ScriptHost::new(config.automation.max_operations);
//! let script = host.load_automation(&std::fs::read_to_string("run.rhai")?, "run", &dashboard)?;
//! scheduler.load(script, &dashboard)?;
//!
//! assert_eq!(host.eval("1 + 1", &mut dashboard)?, "2");
//! ```

pub mod bindings;
pub mod engine;

pub use bindings::{register_dashboard, DashboardView, ViewOp};
pub use engine::{ScriptHost, DEFAULT_MAX_OPERATIONS, SCRIPT_TARGET};
