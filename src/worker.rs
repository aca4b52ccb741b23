//! Widget workers.
//!
//! Each link group (a primary widget plus every widget sharing its link) gets one bounded
//! command queue and one long-lived OS thread draining it in FIFO order. The thread blocks on
//! the channel, so an idle dashboard costs nothing. Device I/O happens only here; results reach
//! the foreground loop as [`FieldUpdate`] messages.
//!
//! Every command carries the connection epoch it was issued in. Commands from an earlier
//! connection cycle, or arriving after the connection closed, are dropped unexecuted, and a
//! command that was already running when the connection closed publishes nothing.
//!
//! Closing also runs here: the foreground resets its fields and queues a [`CloseRequest`],
//! which the worker executes after whatever device call is in progress. The foreground never
//! waits on a strategy or link lock held by a worker.

use crate::device::{DeviceContext, DeviceStrategy, WidgetIdentity};
use crate::error::{AppResult, PanelError};
use crate::field::FieldSnapshot;
use crate::reporter::{ErrorReporter, ErrorSource};
use crate::widget::{LinkBinding, SharedStrategy, Widget, WidgetId, WidgetState, WidgetStatus};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Work a widget worker can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetCommand {
    /// Open the link if this widget owns it, then handshake
    Handshake,
    /// Poll, subject to the update stride
    Update,
    /// Push input fields to the device
    Confirm,
}

impl fmt::Display for WidgetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WidgetCommand::Handshake => "HANDSHAKE",
            WidgetCommand::Update => "UPDATE",
            WidgetCommand::Confirm => "CONFIRM",
        };
        f.write_str(s)
    }
}

/// Connection flag and cycle counter published by the connection controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSignal {
    /// Whether widgets may talk to their devices
    pub connected: bool,
    /// Incremented on every open and every close
    pub epoch: u64,
}

/// A queued command with the widget's fields as they were when it was issued.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub widget: WidgetId,
    pub command: WidgetCommand,
    pub fields: FieldSnapshot,
    pub epoch: u64,
}

/// Widgets to close, with their fields after the reset, in the epoch that closed them.
#[derive(Debug)]
pub(crate) struct CloseRequest {
    pub epoch: u64,
    pub targets: Vec<(WidgetId, FieldSnapshot)>,
}

#[derive(Debug)]
pub(crate) enum QueueMessage {
    Command(Envelope),
    Close(CloseRequest),
    Shutdown,
}

/// A close that could not be queued.
#[derive(Debug)]
pub(crate) enum CloseRejected {
    /// Retry once the worker has drained some commands
    Full(CloseRequest),
    /// The worker is gone
    Closed(CloseRequest),
}

fn is_current(connection: &watch::Receiver<ConnectionSignal>, epoch: u64) -> bool {
    let signal = *connection.borrow();
    signal.connected && signal.epoch == epoch
}

/// A field write made by a strategy, applied on the foreground loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    /// Widget that made the write
    pub widget: WidgetId,
    /// Connection epoch the write belongs to
    pub epoch: u64,
    /// Field name
    pub field: String,
    /// New value
    pub value: String,
}

/// Sending side of a link group's queue.
#[derive(Clone, Debug)]
pub struct CommandQueue {
    tx: mpsc::Sender<QueueMessage>,
    label: Arc<str>,
}

impl CommandQueue {
    pub(crate) fn channel(label: &str, capacity: usize) -> (Self, mpsc::Receiver<QueueMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                label: Arc::from(label),
            },
            rx,
        )
    }

    pub(crate) fn send(&self, envelope: Envelope) -> AppResult<()> {
        self.tx
            .try_send(QueueMessage::Command(envelope))
            .map_err(|e| match e {
                TrySendError::Full(_) => PanelError::QueueFull(self.label.to_string()),
                TrySendError::Closed(_) => PanelError::QueueClosed(self.label.to_string()),
            })
    }

    /// Queue a close. A rejected request comes back to the caller.
    pub(crate) fn send_close(&self, request: CloseRequest) -> Result<(), CloseRejected> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(QueueMessage::Close(request));
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(CloseRejected::Full(request)),
            Err(TrySendError::Closed(())) => Err(CloseRejected::Closed(request)),
        }
    }

    /// Ask the worker to stop after the command it is running.
    pub(crate) fn request_shutdown(&self) {
        // A full queue still stops: the worker checks the shutdown flag between commands.
        let _ = self.tx.try_send(QueueMessage::Shutdown);
    }

    /// Label of the link group, the primary widget's nickname.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// The worker-side view of one widget.
pub(crate) struct WorkerSlot {
    id: WidgetId,
    identity: Arc<WidgetIdentity>,
    strategy: SharedStrategy,
    status: Arc<WidgetStatus>,
    link: LinkBinding,
    stride: u32,
}

impl WorkerSlot {
    pub(crate) fn for_widget(widget: &Widget) -> Self {
        Self {
            id: widget.id,
            identity: widget.identity.clone(),
            strategy: widget.strategy.clone(),
            status: widget.status.clone(),
            link: widget.link.clone(),
            stride: widget.update_stride,
        }
    }

    fn nickname(&self) -> &str {
        &self.identity.nickname
    }

    fn handshake(
        &self,
        shared: &WorkerShared,
        connection: &watch::Receiver<ConnectionSignal>,
        envelope: Envelope,
    ) {
        let nickname = self.nickname().to_string();
        // The foreground marks the widget Handshaking before queueing; anything else means a
        // close got there first
        if self.status.state() != WidgetState::Handshaking {
            trace!("'{}' was closed before its handshake ran", nickname);
            return;
        }
        self.status.set_doing_handshake(true);
        self.status.set_handshake_ok(false);

        let mut strategy = self.strategy.lock();
        let mut ctx = DeviceContext::new(self.identity.clone(), envelope.fields, None);

        let success = match self.open_and_handshake(&mut **strategy, &mut ctx) {
            Ok(true) => true,
            Ok(false) => {
                let err = anyhow!("device did not answer the handshake as expected")
                    .context(PanelError::HandshakeFailure(nickname.clone()));
                shared.reporter.report(ErrorSource::Handshake, Some(&nickname), &err);
                false
            }
            Err(e) => {
                let err = e.context(PanelError::HandshakeFailure(nickname.clone()));
                shared.reporter.report(ErrorSource::Handshake, Some(&nickname), &err);
                false
            }
        };

        // The foreground owns the state once the connection moved on, and the close queued
        // behind this handshake cleans up the device and the link.
        let finished = if !is_current(connection, envelope.epoch) {
            false
        } else if success {
            self.status.prime_cycle(self.stride);
            self.status.set_handshake_ok(true);
            let connected = self.status.finish_handshake(WidgetState::Connected);
            if !connected {
                self.status.set_handshake_ok(false);
            }
            connected
        } else {
            self.status.finish_handshake(WidgetState::Failed)
        };
        if !finished {
            debug!("'{}' was closed during its handshake; discarding the result", nickname);
            drop(strategy);
            self.status.set_doing_handshake(false);
            return;
        }

        if success {
            info!("Handshake successful on '{}'", nickname);
        } else if self.link.is_primary {
            self.link.slot.release();
        }

        if let Err(e) = strategy.on_open(&mut ctx, success) {
            shared.reporter.report(ErrorSource::Handshake, Some(&nickname), &e);
        }
        drop(strategy);

        self.status.set_doing_handshake(false);
        shared.publish(self.id, envelope.epoch, ctx.take_writes());
    }

    fn open_and_handshake(
        &self,
        strategy: &mut dyn DeviceStrategy,
        ctx: &mut DeviceContext,
    ) -> anyhow::Result<bool> {
        let link = if self.link.is_primary {
            self.link.slot.release();
            match strategy.connect(&self.link.settings)? {
                Some(transport) => {
                    debug!("Opened link {} for '{}'", transport.describe(), self.nickname());
                    Some(self.link.slot.install(transport))
                }
                None => None,
            }
        } else {
            self.link.slot.current()
        };

        if link.is_none() && strategy.needs_link() {
            if self.link.is_primary {
                bail!(
                    "no link could be opened (port: {})",
                    self.link.settings.port.as_deref().unwrap_or("none")
                );
            }
            bail!(
                "the link shared with '{}' is not open",
                self.link.primary_nickname
            );
        }

        ctx.set_link(link);
        strategy.handshake(ctx)
    }

    fn update(
        &self,
        shared: &WorkerShared,
        connection: &watch::Receiver<ConnectionSignal>,
        envelope: Envelope,
    ) {
        if !self.status.handshake_ok() || self.status.doing_handshake() {
            trace!("Skipping update of '{}' (not connected)", self.nickname());
            return;
        }
        if !self.status.advance_cycle(self.stride) {
            return;
        }

        self.status.set_doing_update(true);
        let mut ctx = DeviceContext::new(
            self.identity.clone(),
            envelope.fields,
            self.link.slot.current(),
        );
        let result = self.strategy.lock().update(&mut ctx);
        self.status.record_update();
        if let Err(e) = result {
            let err = e.context(PanelError::UpdateFailure(self.nickname().to_string()));
            shared
                .reporter
                .report(ErrorSource::Update, Some(self.nickname()), &err);
        }
        self.status.set_doing_update(false);
        self.publish_if_open(shared, connection, envelope.epoch, ctx);
    }

    /// Publish a command's writes unless the widget was closed while it ran.
    fn publish_if_open(
        &self,
        shared: &WorkerShared,
        connection: &watch::Receiver<ConnectionSignal>,
        epoch: u64,
        mut ctx: DeviceContext,
    ) {
        if is_current(connection, epoch) && self.status.handshake_ok() {
            shared.publish(self.id, epoch, ctx.take_writes());
        } else {
            trace!("'{}' was closed; dropping its writes", self.nickname());
        }
    }

    fn confirm(
        &self,
        shared: &WorkerShared,
        connection: &watch::Receiver<ConnectionSignal>,
        envelope: Envelope,
    ) {
        if !self.status.handshake_ok() {
            warn!(
                "\"Confirm\" was requested for '{}', which has no open connection",
                self.nickname()
            );
            return;
        }

        let mut ctx = DeviceContext::new(
            self.identity.clone(),
            envelope.fields,
            self.link.slot.current(),
        );
        if let Err(e) = self.strategy.lock().confirm(&mut ctx) {
            let err = e.context(PanelError::ConfirmFailure(self.nickname().to_string()));
            shared
                .reporter
                .report(ErrorSource::Confirm, Some(self.nickname()), &err);
        }
        self.publish_if_open(shared, connection, envelope.epoch, ctx);
    }

    fn close(
        &self,
        shared: &WorkerShared,
        connection: &watch::Receiver<ConnectionSignal>,
        fields: FieldSnapshot,
        epoch: u64,
    ) {
        let mut ctx = DeviceContext::new(self.identity.clone(), fields, self.link.slot.current());
        let result = self.strategy.lock().close(&mut ctx);
        // A reopen may already be handshaking; its state is not this close's to touch
        if connection.borrow().epoch == epoch {
            self.status.mark_disconnected();
        }
        if let Err(e) = result {
            shared
                .reporter
                .report(ErrorSource::Close, Some(self.nickname()), &e);
        }
        shared.publish(self.id, epoch, ctx.take_writes());
    }
}

pub(crate) struct WorkerShared {
    pub updates: mpsc::UnboundedSender<FieldUpdate>,
    pub reporter: Arc<ErrorReporter>,
}

impl WorkerShared {
    fn publish(&self, widget: WidgetId, epoch: u64, writes: Vec<(String, String)>) {
        for (field, value) in writes {
            // The dashboard is gone when this fails; nothing is left to update.
            let _ = self.updates.send(FieldUpdate {
                widget,
                epoch,
                field,
                value,
            });
        }
    }
}

/// One thread draining one link group's queue.
pub(crate) struct Worker {
    label: String,
    slots: HashMap<WidgetId, WorkerSlot>,
    shared: WorkerShared,
    rx: mpsc::Receiver<QueueMessage>,
    connection: watch::Receiver<ConnectionSignal>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn new(
        label: impl Into<String>,
        slots: Vec<WorkerSlot>,
        shared: WorkerShared,
        rx: mpsc::Receiver<QueueMessage>,
        connection: watch::Receiver<ConnectionSignal>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            label: label.into(),
            slots: slots.into_iter().map(|slot| (slot.id, slot)).collect(),
            shared,
            rx,
            connection,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("widget-{}", self.label))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!(link = %self.label, widgets = self.slots.len(), "Widget worker started");
        while let Some(message) = self.rx.blocking_recv() {
            match message {
                QueueMessage::Shutdown => break,
                QueueMessage::Close(request) => self.close(request),
                QueueMessage::Command(envelope) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        trace!("Shutting down; dropping {}", envelope.command);
                        continue;
                    }
                    self.dispatch(envelope);
                }
            }
        }
        debug!(link = %self.label, "Widget worker stopped");
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(slot) = self.slots.get(&envelope.widget) else {
            warn!(
                "Worker '{}' received {} for unknown widget {}",
                self.label, envelope.command, envelope.widget
            );
            return;
        };

        let signal = *self.connection.borrow();
        if !signal.connected || signal.epoch != envelope.epoch {
            trace!(
                "Dropping stale {} for '{}' (epoch {} != {})",
                envelope.command,
                slot.nickname(),
                envelope.epoch,
                signal.epoch
            );
            return;
        }

        match envelope.command {
            WidgetCommand::Handshake => slot.handshake(&self.shared, &self.connection, envelope),
            WidgetCommand::Update => slot.update(&self.shared, &self.connection, envelope),
            WidgetCommand::Confirm => slot.confirm(&self.shared, &self.connection, envelope),
        }
    }

    /// Close every target, then release the links the closed primaries own.
    fn close(&self, request: CloseRequest) {
        let mut primaries = Vec::new();
        for (id, fields) in request.targets {
            let Some(slot) = self.slots.get(&id) else {
                warn!("Worker '{}' asked to close unknown widget {}", self.label, id);
                continue;
            };
            slot.close(&self.shared, &self.connection, fields, request.epoch);
            if slot.link.is_primary {
                primaries.push(slot);
            }
        }
        for slot in primaries {
            slot.link.slot.release();
        }
        debug!(link = %self.label, epoch = request.epoch, "Closed");
    }
}
