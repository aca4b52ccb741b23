//! # DAQ Panel Core Library
//!
//! Headless control panels for laboratory instruments. A panel is a [`dashboard::Dashboard`]
//! of widgets, each wrapping one device behind a [`device::DeviceStrategy`]. Blocking device
//! I/O runs on one worker thread per serial link while a single foreground actor owns all
//! field values, polls the widgets, runs automation scripts, logs data to CSV and serves
//! remote commands.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based TOML/environment configuration and its validation.
//! - **`error`**: The `PanelError` enum and `AppResult` alias.
//! - **`logging`**: `tracing-subscriber` setup (console formats, log file, error routing).
//! - **`reporter`**: The `ErrorReporter` that every non-fatal failure is routed through.
//! - **`field`**, **`device`**, **`transport`**, **`widget`**: Field storage, the strategy
//!   trait, serial links and widget state.
//! - **`worker`**: Per-link command queues and worker threads.
//! - **`dashboard`**: Widget registry and the field API used by scripts and remote clients.
//! - **`connection`**, **`poll`**: Connection lifecycle and the poll cycle.
//! - **`automation`**: Timed scripts of delays, field writes, functions and awaits.
//! - **`scripting`**: The embedded Rhai interpreter.
//! - **`devices`**: Concrete drivers, their emulators, and the configuration registry.
//! - **`data_logger`**: Periodic CSV logging.
//! - **`rpc`**: Line-oriented JSON command server and client.
//! - **`panel`**: The foreground actor tying everything together.

pub mod automation;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod data_logger;
pub mod device;
pub mod devices;
pub mod error;
pub mod field;
pub mod logging;
pub mod panel;
pub mod poll;
pub mod reporter;
pub mod rpc;
pub mod scripting;
pub mod transport;
pub mod widget;
pub mod worker;
