//! The dashboard: root of a control panel.
//!
//! The dashboard owns every widget's field store on the foreground loop, the widget workers,
//! the connection signal, the interlocks and the error reporter. Automation steps, scripts and
//! remote commands all read and write widgets through [`Dashboard::get_field`],
//! [`Dashboard::set_field`] and [`Dashboard::confirm`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut dashboard = Dashboard::new("Reactor");
//! dashboard.add_widget(
//!     WidgetSpec::new("TC", Box::new(OmegaThermocouple::default()))
//!         .with_link(LinkSettings::serial("/dev/ttyUSB0", 38400)),
//! )?;
//! dashboard.add_interlock("overtemp", |dash| {
//!     let t: f64 = dash.get_field("TC", "Temperature")?.parse().unwrap_or(0.0);
//!     if t > 300.0 {
//!         dash.set_field("Heater", "Status Selection", "Off", true)?;
//!     }
//!     Ok(())
//! });
//! dashboard.launch()?;
//! ```

use crate::device::{DeviceContext, Displayable, WidgetIdentity};
use crate::error::{AppResult, PanelError};
use crate::field::FieldStore;
use crate::reporter::{ErrorReporter, ErrorSource};
use crate::transport::LinkSlot;
use crate::widget::{LinkBinding, Widget, WidgetId, WidgetSpec, WidgetState, WidgetStatus};
use crate::worker::{
    CloseRejected, CloseRequest, CommandQueue, ConnectionSignal, Envelope, FieldUpdate,
    WidgetCommand, Worker, WorkerShared, WorkerSlot,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// How long shutdown waits for a full queue to take its close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Interlock check run once per poll cycle.
pub type InterlockFn = Box<dyn FnMut(&mut Dashboard) -> anyhow::Result<()> + Send>;

struct Interlock {
    name: String,
    check: InterlockFn,
}

/// A worker's queue and the widgets it serves.
struct LinkGroup {
    queue: CommandQueue,
    members: Vec<WidgetId>,
}

/// Root of a control panel.
pub struct Dashboard {
    name: String,
    widgets: Vec<Widget>,
    by_nickname: HashMap<String, WidgetId>,
    names: HashSet<String>,
    displays: Vec<Box<dyn Displayable>>,
    interlocks: Vec<Interlock>,
    reporter: Arc<ErrorReporter>,
    signal: watch::Sender<ConnectionSignal>,
    updates_tx: mpsc::UnboundedSender<FieldUpdate>,
    updates_rx: mpsc::UnboundedReceiver<FieldUpdate>,
    queue_capacity: usize,
    launched: bool,
    shutdown_flag: Arc<AtomicBool>,
    groups: Vec<LinkGroup>,
    /// Closes waiting for room in a full queue
    pending_closes: Vec<(CommandQueue, CloseRequest)>,
    workers: Vec<JoinHandle<()>>,
}

impl Dashboard {
    /// Empty dashboard with the default error reporter and queue capacity.
    pub fn new(name: impl Into<String>) -> Self {
        let (signal, _) = watch::channel(ConnectionSignal::default());
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            widgets: Vec::new(),
            by_nickname: HashMap::new(),
            names: HashSet::new(),
            displays: Vec::new(),
            interlocks: Vec::new(),
            reporter: Arc::new(ErrorReporter::default()),
            signal,
            updates_tx,
            updates_rx,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            launched: false,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            groups: Vec::new(),
            pending_closes: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Route errors through a shared reporter.
    pub fn with_reporter(mut self, reporter: Arc<ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Capacity of each link group's command queue. At least 1.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Dashboard title.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reporter every non-fatal failure goes through.
    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    // =========================================================================
    // Building
    // =========================================================================

    /// Add a widget. Must happen before [`Dashboard::launch`].
    pub fn add_widget(&mut self, spec: WidgetSpec) -> AppResult<WidgetId> {
        if self.launched {
            return Err(PanelError::AlreadyLaunched);
        }

        let WidgetSpec {
            nickname,
            name,
            strategy,
            link,
            share_link_with,
            update_stride,
        } = spec;

        let id = WidgetId(self.widgets.len());
        let name = name.unwrap_or_else(|| strategy.kind().to_string());

        if !self.names.insert(name.clone()) {
            warn!("Duplicate widget name '{}'", name);
        }
        if self.by_nickname.contains_key(&nickname) {
            warn!(
                "Duplicate widget nickname '{}'; lookups will find the newest widget",
                nickname
            );
        }

        let link = match share_link_with {
            Some(owner) => {
                let owner_id = self.lookup(&owner).map_err(|_| {
                    PanelError::Configuration(format!(
                        "'{}' shares the link of '{}', which has not been added",
                        nickname, owner
                    ))
                })?;
                let owner_link = &self.widgets[owner_id.0].link;
                LinkBinding {
                    settings: owner_link.settings.clone(),
                    primary: owner_link.primary,
                    primary_nickname: owner_link.primary_nickname.clone(),
                    is_primary: false,
                    slot: owner_link.slot.clone(),
                }
            }
            None => LinkBinding {
                settings: link,
                primary: id,
                primary_nickname: nickname.clone(),
                is_primary: true,
                slot: Arc::new(LinkSlot::default()),
            },
        };

        let fields = FieldStore::from_specs(nickname.clone(), strategy.fields());
        self.widgets.push(Widget {
            id,
            identity: Arc::new(WidgetIdentity {
                name,
                nickname: nickname.clone(),
            }),
            fields,
            status: Arc::new(WidgetStatus::default()),
            strategy: Arc::new(Mutex::new(strategy)),
            link,
            update_stride: update_stride.max(1),
            queue: None,
        });
        self.by_nickname.insert(nickname, id);
        Ok(id)
    }

    /// Add a cosmetic item shown in the status view.
    pub fn add_display(&mut self, display: impl Displayable + 'static) {
        self.displays.push(Box::new(display));
    }

    /// Add a check evaluated on every poll cycle.
    pub fn add_interlock<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: FnMut(&mut Dashboard) -> anyhow::Result<()> + Send + 'static,
    {
        self.interlocks.push(Interlock {
            name: name.into(),
            check: Box::new(check),
        });
    }

    /// Start one worker per link group.
    pub fn launch(&mut self) -> AppResult<()> {
        if self.launched {
            return Err(PanelError::AlreadyLaunched);
        }

        let mut groups: BTreeMap<WidgetId, Vec<WidgetId>> = BTreeMap::new();
        for widget in &self.widgets {
            groups.entry(widget.link.primary).or_default().push(widget.id);
        }

        for (primary, members) in groups {
            let label = self.widgets[primary.0].nickname().to_string();
            let (queue, rx) = CommandQueue::channel(&label, self.queue_capacity);
            let slots = members
                .iter()
                .map(|id| WorkerSlot::for_widget(&self.widgets[id.0]))
                .collect();
            for id in &members {
                self.widgets[id.0].queue = Some(queue.clone());
            }

            let shared = WorkerShared {
                updates: self.updates_tx.clone(),
                reporter: self.reporter.clone(),
            };
            let worker = Worker::new(
                label,
                slots,
                shared,
                rx,
                self.signal.subscribe(),
                self.shutdown_flag.clone(),
            );
            self.workers.push(worker.spawn()?);
            self.groups.push(LinkGroup { queue, members });
        }

        self.launched = true;
        info!(
            "Launched dashboard '{}' with {} widgets on {} workers",
            self.name,
            self.widgets.len(),
            self.workers.len()
        );
        Ok(())
    }

    /// Whether worker threads are running.
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    // =========================================================================
    // Lookup and field access
    // =========================================================================

    fn lookup(&self, nickname: &str) -> AppResult<WidgetId> {
        self.by_nickname
            .get(nickname)
            .copied()
            .ok_or_else(|| PanelError::UnknownWidget(nickname.to_string()))
    }

    /// Widget by nickname. The newest wins when nicknames repeat.
    pub fn widget(&self, nickname: &str) -> Option<&Widget> {
        self.by_nickname.get(nickname).map(|id| &self.widgets[id.0])
    }

    /// All widgets in insertion order.
    pub fn widgets(&self) -> &[Widget] {
        &self.widgets
    }

    /// Nicknames in insertion order.
    pub fn nicknames(&self) -> Vec<String> {
        self.widgets.iter().map(|w| w.nickname().to_string()).collect()
    }

    /// Whether `nickname` names a widget with a field called `field`.
    pub fn has_field(&self, nickname: &str, field: &str) -> bool {
        self.widget(nickname)
            .map(|w| w.fields.contains(field))
            .unwrap_or(false)
    }

    /// Current value of a widget field.
    pub fn get_field(&self, nickname: &str, field: &str) -> AppResult<String> {
        let widget = &self.widgets[self.lookup(nickname)?.0];
        widget
            .fields
            .get(field)
            .map(str::to_string)
            .ok_or_else(|| PanelError::UnknownField {
                widget: nickname.to_string(),
                field: field.to_string(),
            })
    }

    /// Write a field, then optionally push the widget's inputs to the device.
    pub fn set_field(
        &mut self,
        nickname: &str,
        field: &str,
        value: impl Into<String>,
        confirm: bool,
    ) -> AppResult<()> {
        let id = self.lookup(nickname)?;
        self.widgets[id.0].fields.set(field, value)?;
        if confirm {
            self.confirm(nickname)?;
        }
        Ok(())
    }

    /// Queue a CONFIRM carrying the widget's current fields.
    pub fn confirm(&mut self, nickname: &str) -> AppResult<()> {
        let id = self.lookup(nickname)?;
        match self.widgets[id.0].state() {
            WidgetState::Connected => {}
            WidgetState::Handshaking => warn!(
                "\"Confirm\" pressed for '{}' while it is handshaking; it runs once the handshake finishes",
                nickname
            ),
            WidgetState::Disconnected | WidgetState::Failed => {
                warn!("\"Confirm\" pressed for '{}' with no connection", nickname);
                return Ok(());
            }
        }
        self.enqueue(id, WidgetCommand::Confirm)
    }

    /// Loggable fields of every widget, in widget and declaration order.
    pub fn log_data(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.widgets
            .iter()
            .map(|w| (w.nickname().to_string(), w.fields.log_data()))
            .filter(|(_, fields)| !fields.is_empty())
            .collect()
    }

    // =========================================================================
    // Connection signal and commands
    // =========================================================================

    /// The connection signal as last published.
    pub fn connection(&self) -> ConnectionSignal {
        *self.signal.borrow()
    }

    /// Whether the connection is open or opening.
    pub fn is_connected(&self) -> bool {
        self.connection().connected
    }

    /// Watch connection changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionSignal> {
        self.signal.subscribe()
    }

    /// Publish a new connection state; returns the new epoch.
    pub(crate) fn publish_connection(&mut self, connected: bool) -> u64 {
        let mut epoch = 0;
        self.signal.send_modify(|signal| {
            signal.connected = connected;
            signal.epoch += 1;
            epoch = signal.epoch;
        });
        debug!(connected, epoch, "Published connection signal");
        epoch
    }

    pub(crate) fn enqueue(&self, id: WidgetId, command: WidgetCommand) -> AppResult<()> {
        let widget = &self.widgets[id.0];
        let queue = widget.queue.as_ref().ok_or(PanelError::NotLaunched)?;
        queue.send(Envelope {
            widget: id,
            command,
            fields: widget.fields.snapshot(),
            epoch: self.connection().epoch,
        })
    }

    /// Queue `command` for every widget; returns how many were queued.
    pub(crate) fn enqueue_all(&self, command: WidgetCommand) -> usize {
        let mut sent = 0;
        for widget in &self.widgets {
            match self.enqueue(widget.id, command) {
                Ok(()) => sent += 1,
                Err(PanelError::QueueFull(label)) => {
                    debug!("Queue '{}' is full; skipping {} for '{}'", label, command, widget.nickname())
                }
                Err(e) => warn!("Could not queue {} for '{}': {}", command, widget.nickname(), e),
            }
        }
        sent
    }

    /// Mark every widget as handshaking and queue its HANDSHAKE.
    pub(crate) fn begin_handshakes(&mut self) -> usize {
        // A close still waiting for room must reach the worker first
        self.flush_pending_closes();
        let mut sent = 0;
        for i in 0..self.widgets.len() {
            self.widgets[i].status.set_state(WidgetState::Handshaking);
            if let Err(e) = self.enqueue(WidgetId(i), WidgetCommand::Handshake) {
                let widget = &self.widgets[i];
                widget.status.set_state(WidgetState::Failed);
                self.reporter.report(
                    ErrorSource::Handshake,
                    Some(widget.nickname()),
                    &anyhow::Error::from(e),
                );
            } else {
                sent += 1;
            }
        }
        sent
    }

    /// Apply field writes sent by the workers. Writes from an earlier connection are dropped.
    pub fn apply_pending_updates(&mut self) -> usize {
        self.flush_pending_closes();
        let epoch = self.connection().epoch;
        let mut applied = 0;
        while let Ok(update) = self.updates_rx.try_recv() {
            if update.epoch != epoch {
                trace!("Dropping stale write to {}.{}", update.widget, update.field);
                continue;
            }
            let Some(widget) = self.widgets.get_mut(update.widget.0) else {
                continue;
            };
            match widget.fields.set(&update.field, update.value) {
                Ok(()) => applied += 1,
                Err(e) => warn!("Device strategy wrote an undeclared field: {}", e),
            }
        }
        applied
    }

    /// Run every interlock once. A failing interlock does not stop the others.
    pub fn run_interlocks(&mut self) {
        let mut interlocks = std::mem::take(&mut self.interlocks);
        for interlock in interlocks.iter_mut() {
            if let Err(e) = (interlock.check)(self) {
                self.reporter
                    .report(ErrorSource::Interlock, Some(&interlock.name), &e);
            }
        }
        // Keep interlocks added while running
        interlocks.append(&mut self.interlocks);
        self.interlocks = interlocks;
    }

    /// Number of registered interlocks.
    pub fn interlock_count(&self) -> usize {
        self.interlocks.len()
    }

    /// Largest update stride of any widget; 1 for an empty dashboard.
    pub fn max_update_stride(&self) -> u32 {
        self.widgets
            .iter()
            .map(|w| w.update_stride)
            .max()
            .unwrap_or(1)
    }

    // =========================================================================
    // Closing
    // =========================================================================

    /// Close one widget: reset its outputs and run the strategy's close callback.
    ///
    /// The reset happens here; the callback runs on the widget's worker once the command in
    /// progress finishes. Closing a widget that is already closed is harmless.
    pub fn close_widget(&mut self, nickname: &str) -> AppResult<()> {
        let id = self.lookup(nickname)?;
        let epoch = self.connection().epoch;
        let widget = &mut self.widgets[id.0];
        widget.status.mark_disconnected();
        widget.fields.reset_to_defaults();

        let request = CloseRequest {
            epoch,
            targets: vec![(id, widget.fields.snapshot())],
        };
        match widget.queue.clone() {
            Some(queue) => self.dispatch_close(queue, request),
            None => self.close_inline(request),
        }
        Ok(())
    }

    /// Close every widget, then every link.
    pub(crate) fn close_all(&mut self) {
        for widget in &mut self.widgets {
            widget.status.mark_disconnected();
            widget.fields.reset_to_defaults();
        }

        let epoch = self.connection().epoch;
        if self.groups.is_empty() {
            let targets = self
                .widgets
                .iter()
                .map(|w| (w.id, w.fields.snapshot()))
                .collect();
            self.close_inline(CloseRequest { epoch, targets });
            return;
        }

        let requests: Vec<_> = self
            .groups
            .iter()
            .map(|group| {
                let targets = group
                    .members
                    .iter()
                    .map(|id| (*id, self.widgets[id.0].fields.snapshot()))
                    .collect();
                (group.queue.clone(), CloseRequest { epoch, targets })
            })
            .collect();
        for (queue, request) in requests {
            self.dispatch_close(queue, request);
        }
    }

    fn dispatch_close(&mut self, queue: CommandQueue, request: CloseRequest) {
        match queue.send_close(request) {
            Ok(()) => trace!("Queued close on '{}'", queue.label()),
            Err(CloseRejected::Full(request)) => {
                debug!("Queue '{}' is full; close deferred", queue.label());
                self.pending_closes.push((queue, request));
            }
            Err(CloseRejected::Closed(request)) => self.close_inline(request),
        }
    }

    /// Retry deferred closes in order. A queue still full keeps the rest of its closes waiting.
    fn flush_pending_closes(&mut self) {
        if self.pending_closes.is_empty() {
            return;
        }
        let mut blocked: HashSet<String> = HashSet::new();
        for (queue, request) in std::mem::take(&mut self.pending_closes) {
            if blocked.contains(queue.label()) {
                self.pending_closes.push((queue, request));
                continue;
            }
            self.dispatch_close(queue.clone(), request);
            if self
                .pending_closes
                .last()
                .is_some_and(|(q, _)| q.label() == queue.label())
            {
                blocked.insert(queue.label().to_string());
            }
        }
    }

    /// Run close callbacks on this thread. Only used when no worker serves the targets.
    fn close_inline(&mut self, request: CloseRequest) {
        for (id, _) in &request.targets {
            let widget = &mut self.widgets[id.0];
            let mut ctx = DeviceContext::new(
                widget.identity.clone(),
                widget.fields.snapshot(),
                widget.link.slot.current(),
            );
            let result = widget.strategy.lock().close(&mut ctx);
            for (field, value) in ctx.take_writes() {
                if let Err(e) = widget.fields.set(&field, value) {
                    warn!("Close callback wrote an undeclared field: {}", e);
                }
            }
            if let Err(e) = result {
                self.reporter
                    .report(ErrorSource::Close, Some(widget.identity.nickname.as_str()), &e);
            }
        }
        for (id, _) in &request.targets {
            let link = &self.widgets[id.0].link;
            if link.is_primary {
                link.slot.release();
            }
        }
    }

    /// Stop and join every worker. Safe to call more than once.
    ///
    /// Queued closes still run; other queued commands are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown_flag.store(true, Ordering::Relaxed);

        // Workers skip commands once the flag is set, so full queues drain quickly
        let deadline = Instant::now() + CLOSE_FLUSH_TIMEOUT;
        self.flush_pending_closes();
        while !self.pending_closes.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            self.flush_pending_closes();
        }
        let leftover = std::mem::take(&mut self.pending_closes);

        for group in self.groups.drain(..) {
            group.queue.request_shutdown();
        }
        // Dropping the last sender also ends a worker whose queue had no room for Shutdown
        for widget in &mut self.widgets {
            widget.queue = None;
        }
        let leftover: Vec<CloseRequest> = leftover.into_iter().map(|(_, r)| r).collect();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("A widget worker panicked before shutdown");
            }
        }
        for request in leftover {
            self.close_inline(request);
        }
        for widget in &self.widgets {
            if widget.link.is_primary {
                widget.link.slot.release();
            }
        }
        info!("Dashboard '{}' shut down", self.name);
    }

    // =========================================================================
    // Status view
    // =========================================================================

    /// Plain-text rendering of every display and widget.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "== {} ({}) ==",
            self.name,
            if self.is_connected() {
                "connected"
            } else {
                "disconnected"
            }
        )];
        for display in &self.displays {
            lines.push(format!("# {}", display.title()));
            lines.extend(display.lines().into_iter().map(|l| format!("  {}", l)));
        }
        for widget in &self.widgets {
            lines.push(format!(
                "{} ({}): {}",
                widget.nickname(),
                widget.name(),
                widget.state().status_text()
            ));
            for field in widget.fields.iter() {
                lines.push(format!("    {}: {}", field.name, field.value));
            }
        }
        lines
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("name", &self.name)
            .field("widgets", &self.widgets)
            .field("launched", &self.launched)
            .field("connection", &self.connection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockDevice;

    fn dashboard() -> Dashboard {
        let mut dash = Dashboard::new("Test");
        dash.add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())))
            .unwrap();
        dash.add_widget(WidgetSpec::new("B", Box::new(MockDevice::new())).with_update_stride(3))
            .unwrap();
        dash
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut dash = dashboard();
        dash.set_field("A", "Setpoint", "12.5", false).unwrap();
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "12.5");
    }

    #[test]
    fn unknown_lookups_fail() {
        let mut dash = dashboard();
        assert!(matches!(
            dash.get_field("Z", "Setpoint"),
            Err(PanelError::UnknownWidget(_))
        ));
        assert!(matches!(
            dash.set_field("A", "Voltage", "1", false),
            Err(PanelError::UnknownField { .. })
        ));
    }

    #[test]
    fn confirm_without_connection_is_a_warning() {
        let mut dash = dashboard();
        assert!(dash.confirm("A").is_ok());
        assert!(dash.set_field("A", "Setpoint", "3", true).is_ok());
    }

    #[test]
    fn close_of_disconnected_widget_keeps_defaults() {
        let mut dash = dashboard();
        dash.close_widget("A").unwrap();
        dash.close_widget("A").unwrap();
        assert_eq!(dash.get_field("A", "Reading").unwrap(), "No Reading");
        assert_eq!(dash.widget("A").unwrap().state(), WidgetState::Disconnected);
    }

    #[test]
    fn duplicate_nickname_points_to_newest() {
        let mut dash = dashboard();
        let id = dash
            .add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())).with_name("Second"))
            .unwrap();
        assert_eq!(dash.widget("A").unwrap().id(), id);
        assert_eq!(dash.widgets().len(), 3);
    }

    #[test]
    fn share_with_unknown_widget_is_rejected() {
        let mut dash = dashboard();
        let err = dash
            .add_widget(WidgetSpec::new("C", Box::new(MockDevice::new())).sharing_link_with("Q"))
            .unwrap_err();
        assert!(matches!(err, PanelError::Configuration(_)));
    }

    #[test]
    fn interlocks_are_isolated() {
        let mut dash = dashboard();
        dash.add_interlock("broken", |_| Err(anyhow::anyhow!("sensor unplugged")));
        dash.add_interlock("writer", |d| {
            d.set_field("A", "Setpoint", "0", false)?;
            Ok(())
        });
        dash.set_field("A", "Setpoint", "9", false).unwrap();
        dash.run_interlocks();
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "0");
        assert_eq!(dash.reporter().recent_from(ErrorSource::Interlock).len(), 1);
        assert_eq!(dash.interlock_count(), 2);
    }

    #[test]
    fn log_data_and_status_view() {
        let dash = dashboard();
        let data = dash.log_data();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].0, "A");
        assert!(dash
            .status_lines()
            .iter()
            .any(|l| l.starts_with("B (Mock Device): Not connected.")));
        assert_eq!(dash.max_update_stride(), 3);
    }

    #[test]
    fn displays_come_before_widgets_in_status() {
        let mut dash = dashboard();
        dash.add_display(crate::device::TitleDisplay::new("Gas Line").with_subtitle("Bay 3"));
        let lines = dash.status_lines();
        assert_eq!(lines[1], "# Gas Line");
        assert_eq!(lines[2], "  Bay 3");
        assert!(lines[3].starts_with("A (Mock Device)"));
    }

    #[test]
    fn launch_twice_fails_and_shutdown_is_idempotent() {
        let mut dash = dashboard();
        dash.launch().unwrap();
        assert!(matches!(dash.launch(), Err(PanelError::AlreadyLaunched)));
        dash.shutdown();
        dash.shutdown();
    }
}
