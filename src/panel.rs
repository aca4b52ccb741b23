//! Panel runtime.
//!
//! [`Panel`] is the foreground actor. It owns the dashboard and everything that touches field
//! storage: the connection controller, the poll dispatcher, the automation scheduler, the
//! script host and the data logger. A ui tick drives the schedulers; everything else arrives
//! as a `PanelCommand` through a [`PanelHandle`].
//!
//! ## Message Flow
//!
//! ```text
//! PanelHandle ──PanelCommand──▶ Panel::run ──WidgetCommand──▶ worker threads
//!      ▲                           │   ▲                            │
//!      └────── oneshot reply ──────┘   └──────── FieldUpdate ───────┘
//! ```
//!
//! # Example
//! ```no_run
//! use daq_panel::{config::PanelConfig, devices, panel::Panel, reporter::ErrorReporter};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PanelConfig::load()?;
//! let dashboard = devices::build_dashboard(&config, Arc::new(ErrorReporter::default()))?;
//! let (panel, handle) = Panel::new(dashboard, &config);
//! let runtime = tokio::spawn(panel.run());
//!
//! handle.open_connection().await?;
//! println!("{}", handle.get_field("TC", "Temperature").await?);
//! handle.shutdown().await;
//! runtime.await??;
//! # Ok(())
//! # }
//! ```

use crate::automation::{AutomationScheduler, AutomationStatus};
use crate::automation::script::parse_hms;
use crate::config::PanelConfig;
use crate::connection::{ConnectionController, ConnectionPhase};
use crate::dashboard::Dashboard;
use crate::data_logger::CsvLogger;
use crate::error::{AppResult, PanelError};
use crate::poll::PollDispatcher;
use crate::reporter::ErrorSource;
use crate::scripting::ScriptHost;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Requests served by the panel actor. Each carries its reply channel.
#[derive(Debug)]
pub(crate) enum PanelCommand {
    OpenConnection {
        response: oneshot::Sender<AppResult<()>>,
    },
    CloseConnection {
        response: oneshot::Sender<()>,
    },
    GetField {
        widget: String,
        field: String,
        response: oneshot::Sender<AppResult<String>>,
    },
    SetField {
        widget: String,
        field: String,
        value: String,
        confirm: bool,
        response: oneshot::Sender<AppResult<()>>,
    },
    Confirm {
        widget: String,
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Evaluate an expression and reply with its string form.
    Eval {
        code: String,
        response: oneshot::Sender<AppResult<String>>,
    },
    /// Run statements and reply `Success`.
    Exec {
        code: String,
        response: oneshot::Sender<AppResult<String>>,
    },
    /// Load an automation file; replies with the number of steps.
    LoadScript {
        source: String,
        name: String,
        response: oneshot::Sender<AppResult<usize>>,
    },
    StartAutomation {
        response: oneshot::Sender<AppResult<()>>,
    },
    PauseAutomation {
        response: oneshot::Sender<()>,
    },
    StopAutomation {
        response: oneshot::Sender<()>,
    },
    SkipAwait {
        response: oneshot::Sender<()>,
    },
    StartLogging {
        path: PathBuf,
        response: oneshot::Sender<AppResult<()>>,
    },
    StopLogging {
        response: oneshot::Sender<()>,
    },
    Status {
        response: oneshot::Sender<PanelStatus>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Snapshot of the whole panel.
#[derive(Debug, Clone)]
pub struct PanelStatus {
    /// Connection lifecycle phase
    pub connection: ConnectionPhase,
    /// Automation progress
    pub automation: AutomationStatus,
    /// File being logged to, if any
    pub logging: Option<PathBuf>,
    /// Poll cycles run since the panel started
    pub poll_cycles: u64,
    /// Errors reported so far, including ones no longer kept
    pub errors_reported: u64,
    /// Dashboard rendered as text
    pub lines: Vec<String>,
}

/// Cloneable sender side of the panel actor.
#[derive(Debug, Clone)]
pub struct PanelHandle {
    commands: mpsc::Sender<PanelCommand>,
}

impl PanelHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PanelCommand,
    ) -> AppResult<T> {
        let (response, reply) = oneshot::channel();
        self.commands
            .send(command(response))
            .await
            .map_err(|_| PanelError::PanelClosed)?;
        reply.await.map_err(|_| PanelError::PanelClosed)
    }

    /// Open every widget's connection. Fails when the dashboard is not launched.
    pub async fn open_connection(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::OpenConnection { response })
            .await?
    }

    /// Close every widget's connection.
    pub async fn close_connection(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::CloseConnection { response })
            .await
    }

    /// Read a field's current value.
    pub async fn get_field(&self, widget: &str, field: &str) -> AppResult<String> {
        self.request(|response| PanelCommand::GetField {
            widget: widget.to_string(),
            field: field.to_string(),
            response,
        })
        .await?
    }

    /// Write a field, queueing a CONFIRM afterwards when `confirm` is set.
    pub async fn set_field(
        &self,
        widget: &str,
        field: &str,
        value: &str,
        confirm: bool,
    ) -> AppResult<()> {
        self.request(|response| PanelCommand::SetField {
            widget: widget.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            confirm,
            response,
        })
        .await?
    }

    /// Push a widget's input fields to its device.
    pub async fn confirm(&self, widget: &str) -> AppResult<()> {
        self.request(|response| PanelCommand::Confirm {
            widget: widget.to_string(),
            response,
        })
        .await?
    }

    /// Evaluate a Rhai expression against the dashboard and return its string form.
    pub async fn eval(&self, code: &str) -> AppResult<String> {
        self.request(|response| PanelCommand::Eval {
            code: code.to_string(),
            response,
        })
        .await?
    }

    /// Run Rhai statements. Replies `Success`.
    pub async fn exec(&self, code: &str) -> AppResult<String> {
        self.request(|response| PanelCommand::Exec {
            code: code.to_string(),
            response,
        })
        .await?
    }

    /// Load an automation script, replacing any loaded one. Returns the number of steps.
    pub async fn load_script(&self, source: &str, name: &str) -> AppResult<usize> {
        self.request(|response| PanelCommand::LoadScript {
            source: source.to_string(),
            name: name.to_string(),
            response,
        })
        .await?
    }

    /// Start or resume automation.
    pub async fn start_automation(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::StartAutomation { response })
            .await?
    }

    /// Pause automation. Remaining delays are kept.
    pub async fn pause_automation(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::PauseAutomation { response })
            .await
    }

    /// Stop automation and rewind to the first step.
    pub async fn stop_automation(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::StopAutomation { response })
            .await
    }

    /// Skip the await in progress, or fire the next step now.
    pub async fn skip(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::SkipAwait { response })
            .await
    }

    /// Start logging to `path`, replacing any active logger.
    pub async fn start_logging(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        let path = path.into();
        self.request(|response| PanelCommand::StartLogging { path, response })
            .await?
    }

    /// Stop logging. A no-op when not logging.
    pub async fn stop_logging(&self) -> AppResult<()> {
        self.request(|response| PanelCommand::StopLogging { response })
            .await
    }

    /// Snapshot of the panel and a text rendering of the dashboard.
    pub async fn status(&self) -> AppResult<PanelStatus> {
        self.request(|response| PanelCommand::Status { response })
            .await
    }

    /// Stop the panel. Returns once it has shut down, or at once if it already has.
    pub async fn shutdown(&self) {
        if self
            .request(|response| PanelCommand::Shutdown { response })
            .await
            .is_err()
        {
            debug!("Panel already shut down");
        }
    }

    /// Whether the panel actor has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The foreground actor.
pub struct Panel {
    dashboard: Dashboard,
    connection: ConnectionController,
    poller: PollDispatcher,
    automation: AutomationScheduler,
    scripts: ScriptHost,
    logger: Option<CsvLogger>,
    log_on_launch: Option<PathBuf>,
    log_interval: Duration,
    ui_tick: Duration,
    commands: mpsc::Receiver<PanelCommand>,
}

impl Panel {
    /// Build the actor and the handle that talks to it. Nothing runs until [`Panel::run`].
    pub fn new(dashboard: Dashboard, config: &PanelConfig) -> (Self, PanelHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let log_interval = match parse_hms(&config.data_logging.interval) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => {
                warn!(
                    "Invalid data_logging.interval '{}'; logging every 10 seconds",
                    config.data_logging.interval
                );
                Duration::from_secs(10)
            }
        };
        let panel = Self {
            dashboard,
            connection: ConnectionController::new(config.polling.interval),
            poller: PollDispatcher::new(config.polling.interval),
            automation: AutomationScheduler::new(config.automation.tick)
                .with_step_logging(config.automation.step_logging),
            scripts: ScriptHost::new(config.automation.max_operations),
            logger: None,
            log_on_launch: config.data_logging.path.clone(),
            log_interval,
            ui_tick: config.polling.ui_tick,
            commands: rx,
        };
        (panel, PanelHandle { commands: tx })
    }

    /// The dashboard this panel drives.
    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    /// Launch the dashboard if needed and serve commands until shutdown.
    pub async fn run(mut self) -> AppResult<()> {
        if !self.dashboard.is_launched() {
            self.dashboard.launch()?;
        }
        if let Some(path) = self.log_on_launch.take() {
            self.start_logging(path, Instant::now())?;
        }
        info!("Panel '{}' running", self.dashboard.name());

        let mut ticker = tokio::time::interval(self.ui_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(Instant::now()),
                command = self.commands.recv() => match command {
                    Some(PanelCommand::Shutdown { response }) => {
                        self.shutdown();
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle(command, Instant::now()),
                    None => {
                        debug!("Every panel handle dropped");
                        self.shutdown();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_tick(&mut self, now: Instant) {
        self.dashboard.apply_pending_updates();

        if self.connection.settle(now) {
            self.poller.start(now);
        }
        if self.poller.due(now) {
            self.poller.tick(now, &mut self.dashboard);
        }
        if self.automation.due(now) {
            self.automation.tick(now, &mut self.dashboard);
        }

        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        if logger.due(now) {
            if let Err(e) = logger.record(now, &self.dashboard, self.automation.log_data()) {
                self.dashboard.reporter().report(
                    ErrorSource::DataLogging,
                    None,
                    &anyhow::Error::new(e).context("Data logging stopped"),
                );
                self.logger = None;
            }
        }
    }

    fn handle(&mut self, command: PanelCommand, now: Instant) {
        match command {
            PanelCommand::OpenConnection { response } => {
                let result = self.connection.open(&mut self.dashboard, now).map(|_| ());
                let _ = response.send(result);
            }
            PanelCommand::CloseConnection { response } => {
                self.close_connection(now);
                let _ = response.send(());
            }
            PanelCommand::GetField {
                widget,
                field,
                response,
            } => {
                self.dashboard.apply_pending_updates();
                let _ = response.send(self.dashboard.get_field(&widget, &field));
            }
            PanelCommand::SetField {
                widget,
                field,
                value,
                confirm,
                response,
            } => {
                let result = self.dashboard.set_field(&widget, &field, value, confirm);
                let _ = response.send(result);
            }
            PanelCommand::Confirm { widget, response } => {
                let _ = response.send(self.dashboard.confirm(&widget));
            }
            PanelCommand::Eval { code, response } => {
                self.dashboard.apply_pending_updates();
                let _ = response.send(self.scripts.eval(&code, &mut self.dashboard));
            }
            PanelCommand::Exec { code, response } => {
                self.dashboard.apply_pending_updates();
                let _ = response.send(self.scripts.exec(&code, &mut self.dashboard));
            }
            PanelCommand::LoadScript {
                source,
                name,
                response,
            } => {
                let result = self
                    .scripts
                    .load_automation(&source, &name, &self.dashboard)
                    .and_then(|script| {
                        let steps = script.len();
                        self.automation.load(script, &self.dashboard)?;
                        Ok(steps)
                    });
                let _ = response.send(result);
            }
            PanelCommand::StartAutomation { response } => {
                let connected = self.dashboard.is_connected();
                let _ = response.send(self.automation.start(now, connected));
            }
            PanelCommand::PauseAutomation { response } => {
                self.automation.pause(now);
                let _ = response.send(());
            }
            PanelCommand::StopAutomation { response } => {
                self.automation.stop();
                let _ = response.send(());
            }
            PanelCommand::SkipAwait { response } => {
                self.automation.skip();
                let _ = response.send(());
            }
            PanelCommand::StartLogging { path, response } => {
                let _ = response.send(self.start_logging(path, now));
            }
            PanelCommand::StopLogging { response } => {
                self.stop_logging();
                let _ = response.send(());
            }
            PanelCommand::Status { response } => {
                self.dashboard.apply_pending_updates();
                let _ = response.send(self.status());
            }
            PanelCommand::Shutdown { response } => {
                self.shutdown();
                let _ = response.send(());
            }
        }
    }

    fn close_connection(&mut self, now: Instant) {
        // Steps must not fire at closed devices; resuming picks up where this left off
        self.automation.pause(now);
        self.poller.stop();
        self.connection.close(&mut self.dashboard);
    }

    fn start_logging(&mut self, path: PathBuf, now: Instant) -> AppResult<()> {
        if let Some(current) = &self.logger {
            warn!(
                "Already logging to '{}'; switching to '{}'",
                current.path().display(),
                path.display()
            );
        }
        self.logger = Some(CsvLogger::create(path, self.log_interval, now)?);
        Ok(())
    }

    fn stop_logging(&mut self) {
        if let Some(logger) = self.logger.take() {
            info!(
                "Stopped logging to '{}' after {} rows",
                logger.path().display(),
                logger.rows_written()
            );
        }
    }

    fn status(&self) -> PanelStatus {
        PanelStatus {
            connection: self.connection.phase(),
            automation: self.automation.status(),
            logging: self.logger.as_ref().map(|l| l.path().to_path_buf()),
            poll_cycles: self.poller.cycles(),
            errors_reported: self.dashboard.reporter().total(),
            lines: self.dashboard.status_lines(),
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down panel '{}'", self.dashboard.name());
        self.automation.stop();
        self.close_connection(Instant::now());
        self.stop_logging();
        self.dashboard.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockDevice;
    use crate::widget::WidgetSpec;

    fn config() -> PanelConfig {
        let mut config = PanelConfig::from_toml_str(
            r#"
            [application]
            name = "Panel Test"
            log_level = "info"

            [polling]
            interval = "20ms"
            ui_tick = "5ms"
            "#,
        )
        .unwrap();
        config.automation.tick = Duration::from_millis(10);
        config
    }

    fn panel() -> (Panel, PanelHandle) {
        let mut dash = Dashboard::new("Panel Test");
        dash.add_widget(WidgetSpec::new("M", Box::new(MockDevice::new())))
            .unwrap();
        Panel::new(dash, &config())
    }

    #[tokio::test]
    async fn commands_round_trip_through_the_actor() {
        let (panel, handle) = panel();
        let runtime = tokio::spawn(panel.run());

        handle.set_field("M", "Setpoint", "4.2", false).await.unwrap();
        assert_eq!(handle.get_field("M", "Setpoint").await.unwrap(), "4.2");
        assert!(handle.get_field("M", "Nope").await.unwrap_err().is_lookup());
        assert_eq!(handle.eval("40 + 2").await.unwrap(), "42");

        handle.open_connection().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.status().await.unwrap().poll_cycles < 2 {
            assert!(Instant::now() < deadline, "polling never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            handle.status().await.unwrap().connection,
            ConnectionPhase::Open
        );

        handle.shutdown().await;
        runtime.await.unwrap().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.get_field("M", "Setpoint").await,
            Err(PanelError::PanelClosed)
        ));
    }

    #[tokio::test]
    async fn automation_requires_connection() {
        let (panel, handle) = panel();
        let runtime = tokio::spawn(panel.run());

        let steps = handle
            .load_script(
                r#"schedule_delay("0:00:01"); schedule_action("M", "Setpoint", "1");"#,
                "one step",
            )
            .await
            .unwrap();
        assert_eq!(steps, 1);
        assert!(matches!(
            handle.start_automation().await,
            Err(PanelError::NotConnected)
        ));

        handle.shutdown().await;
        runtime.await.unwrap().unwrap();
    }
}
