//! CLI Entry Point for daq_panel
//!
//! Provides command-line interface for:
//! - Running a panel from a configuration file, optionally with an automation script
//! - Checking an automation script against a configuration without touching hardware
//! - Sending one command to a running panel's remote command server
//!
//! # Usage
//!
//! Run a panel, connect, and start a script:
//! ```bash
//! daq_panel run --config config/panel.toml --script scripts/demo.rhai --connect --start
//! ```
//!
//! Query a running panel:
//! ```bash
//! daq_panel client get "TC" "Temperature"
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_panel::automation::format_hms;
use daq_panel::config::PanelConfig;
use daq_panel::devices;
use daq_panel::logging;
use daq_panel::panel::Panel;
use daq_panel::reporter::ErrorReporter;
use daq_panel::rpc::{ErrorHandling, RpcClient, RpcServer};
use daq_panel::scripting::ScriptHost;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq_panel")]
#[command(about = "Headless instrument control panel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the dashboard from a config file and run it until Ctrl-C
    Run {
        /// Panel configuration file
        #[arg(long, default_value = "config/panel.toml")]
        config: PathBuf,

        /// Automation script (.rhai) to load
        #[arg(long)]
        script: Option<PathBuf>,

        /// Open the connection at startup
        #[arg(long)]
        connect: bool,

        /// Start the loaded script (needs --connect)
        #[arg(long, requires_all = ["script", "connect"])]
        start: bool,

        /// Log data to this CSV file
        #[arg(long)]
        log_to: Option<PathBuf>,
    },

    /// Load an automation script against a config without connecting to anything
    CheckScript {
        /// Path to .rhai script file
        script: PathBuf,

        /// Panel configuration file
        #[arg(long, default_value = "config/panel.toml")]
        config: PathBuf,
    },

    /// Send one command to a running panel
    Client {
        /// Address of the remote command server
        #[arg(long, default_value = "127.0.0.1:12345")]
        addr: String,

        #[command(subcommand)]
        request: ClientRequest,
    },
}

#[derive(Subcommand)]
enum ClientRequest {
    /// Read a field
    Get { widget: String, field: String },
    /// Write a field without confirming it
    Set {
        widget: String,
        field: String,
        value: String,
    },
    /// Push a widget's inputs to its device
    Confirm { widget: String },
    /// Evaluate a Rhai expression and print its value
    Eval { code: String },
    /// Run Rhai statements
    Exec { code: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            script,
            connect,
            start,
            log_to,
        } => run_panel(&config, script, connect, start, log_to).await,
        Commands::CheckScript { script, config } => check_script(&script, &config).await,
        Commands::Client { addr, request } => send_request(&addr, request).await,
    }
}

fn load_config(path: &Path) -> Result<PanelConfig> {
    let config = PanelConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
    Ok(config)
}

fn script_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string())
}

async fn run_panel(
    config_path: &Path,
    script: Option<PathBuf>,
    connect: bool,
    start: bool,
    log_to: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config)?;

    let reporter = Arc::new(ErrorReporter::new(
        config.errors.print_stacktraces,
        config.errors.history,
    ));
    let dashboard = devices::build_dashboard(&config, reporter.clone())?;
    let (panel, handle) = Panel::new(dashboard, &config);
    let mut runtime = tokio::spawn(panel.run());

    let server = if config.rpc.enabled {
        Some(RpcServer::start(handle.clone(), reporter, &config.rpc.bind, &config.rpc.ports).await?)
    } else {
        None
    };

    if let Some(path) = log_to {
        handle.start_logging(path).await?;
    }
    if connect {
        handle.open_connection().await?;
    }
    if let Some(path) = script {
        let source = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let steps = handle.load_script(&source, &script_name(&path)).await?;
        info!("Loaded {} steps from {}", steps, path.display());
        if start {
            handle.start_automation().await?;
        }
    }

    info!("Panel running; press Ctrl-C to stop");
    let exited_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            false
        }
        result = &mut runtime => {
            result??;
            true
        }
    };
    if exited_early {
        warn!("Panel stopped on its own");
    }

    if let Some(server) = server {
        server.shutdown().await;
    }
    if !exited_early {
        if let Ok(status) = handle.status().await {
            for line in status.lines {
                info!("{}", line);
            }
        }
        handle.shutdown().await;
        runtime.await??;
    }
    Ok(())
}

async fn check_script(script: &Path, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config)?;

    let source = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read {}", script.display()))?;
    let mut dashboard =
        devices::build_dashboard(&config, Arc::new(ErrorReporter::default()))?;
    let host = ScriptHost::new(config.automation.max_operations);
    let loaded = host.load_automation(&source, &script_name(script), &dashboard)?;
    dashboard.shutdown();

    println!("{}: {} steps", script.display(), loaded.len());
    match loaded.last_await_index() {
        Some(_) => println!(
            "Runs for at least {} (waits on conditions)",
            format_hms(loaded.total_duration())
        ),
        None => println!("Runs for {}", format_hms(loaded.total_duration())),
    }
    Ok(())
}

async fn send_request(addr: &str, request: ClientRequest) -> Result<()> {
    let mut client = RpcClient::connect(addr)
        .await?
        .with_error_handling(ErrorHandling::Raise);
    let response = match request {
        ClientRequest::Get { widget, field } => client.get_field(&widget, &field).await,
        ClientRequest::Set {
            widget,
            field,
            value,
        } => client.set_field(&widget, &field, &value).await,
        ClientRequest::Confirm { widget } => client.confirm(&widget).await,
        ClientRequest::Eval { code } => client.eval(&code).await,
        ClientRequest::Exec { code } => client.exec(&code).await,
    };
    let closed = client.close().await;
    println!("{}", response?);
    closed?;
    Ok(())
}
