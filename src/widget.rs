//! Widgets and their shared status.
//!
//! A [`Widget`] is owned by the dashboard on the foreground loop. The parts the worker thread
//! needs (identity, strategy, status flags, link binding) are shared through `Arc`s; the field
//! store itself stays on the foreground and only ever changes there.

use crate::device::{DeviceStrategy, WidgetIdentity};
use crate::field::FieldStore;
use crate::transport::{LinkSettings, LinkSlot};
use crate::worker::CommandQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Index of a widget within its dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(pub(crate) usize);

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Strategy shared with the worker. The foreground only locks it when no worker is running.
pub type SharedStrategy = Arc<Mutex<Box<dyn DeviceStrategy>>>;

/// Connection state of one widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WidgetState {
    /// Not connected, or closed
    Disconnected = 0,
    /// Handshake queued or running
    Handshaking = 1,
    /// Handshake succeeded; polled
    Connected = 2,
    /// Handshake failed; not polled
    Failed = 3,
}

impl WidgetState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WidgetState::Handshaking,
            2 => WidgetState::Connected,
            3 => WidgetState::Failed,
            _ => WidgetState::Disconnected,
        }
    }

    /// Status line shown next to the widget.
    pub fn status_text(&self) -> &'static str {
        match self {
            WidgetState::Disconnected => "Not connected.",
            WidgetState::Handshaking => "Connecting...",
            WidgetState::Connected => "Connected.",
            WidgetState::Failed => "Connection Failed",
        }
    }
}

impl fmt::Display for WidgetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WidgetState::Disconnected => "Disconnected",
            WidgetState::Handshaking => "Handshaking",
            WidgetState::Connected => "Connected",
            WidgetState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Flags written by the worker and read anywhere.
#[derive(Debug)]
pub struct WidgetStatus {
    state: AtomicU8,
    handshake_ok: AtomicBool,
    doing_handshake: AtomicBool,
    doing_update: AtomicBool,
    cycle_counter: AtomicU32,
    updates_run: AtomicU64,
}

impl Default for WidgetStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(WidgetState::Disconnected as u8),
            handshake_ok: AtomicBool::new(false),
            doing_handshake: AtomicBool::new(false),
            doing_update: AtomicBool::new(false),
            cycle_counter: AtomicU32::new(0),
            updates_run: AtomicU64::new(0),
        }
    }
}

impl WidgetStatus {
    /// Current lifecycle state.
    pub fn state(&self) -> WidgetState {
        WidgetState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: WidgetState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move from Handshaking to `next`. False when the state changed while the handshake ran.
    pub(crate) fn finish_handshake(&self, next: WidgetState) -> bool {
        self.state
            .compare_exchange(
                WidgetState::Handshaking as u8,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Whether the last handshake succeeded and the connection has not closed since.
    pub fn handshake_ok(&self) -> bool {
        self.handshake_ok.load(Ordering::SeqCst)
    }

    pub(crate) fn set_handshake_ok(&self, ok: bool) {
        self.handshake_ok.store(ok, Ordering::SeqCst);
    }

    /// Whether a handshake is running on the worker.
    pub fn doing_handshake(&self) -> bool {
        self.doing_handshake.load(Ordering::Relaxed)
    }

    pub(crate) fn set_doing_handshake(&self, busy: bool) {
        self.doing_handshake.store(busy, Ordering::Relaxed);
    }

    /// Whether an update is running on the worker.
    pub fn doing_update(&self) -> bool {
        self.doing_update.load(Ordering::Relaxed)
    }

    pub(crate) fn set_doing_update(&self, busy: bool) {
        self.doing_update.store(busy, Ordering::Relaxed);
    }

    /// Advance the stride counter; true when this cycle should poll the device.
    pub(crate) fn advance_cycle(&self, stride: u32) -> bool {
        let stride = stride.max(1);
        let next = (self.cycle_counter.load(Ordering::Relaxed) + 1) % stride;
        self.cycle_counter.store(next, Ordering::Relaxed);
        next == 0
    }

    /// Make the next UPDATE poll immediately.
    pub(crate) fn prime_cycle(&self, stride: u32) {
        self.cycle_counter
            .store(stride.max(1) - 1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of UPDATE commands that reached the strategy.
    pub fn updates_run(&self) -> u64 {
        self.updates_run.load(Ordering::Relaxed)
    }

    /// State first: a handshake finishing concurrently then fails its transition and clears
    /// `handshake_ok` itself, or succeeded before this and gets `handshake_ok` cleared here.
    pub(crate) fn mark_disconnected(&self) {
        self.set_state(WidgetState::Disconnected);
        self.set_handshake_ok(false);
    }
}

/// Which link a widget uses.
#[derive(Clone, Debug)]
pub(crate) struct LinkBinding {
    pub settings: LinkSettings,
    /// The widget that owns the link
    pub primary: WidgetId,
    pub primary_nickname: String,
    pub is_primary: bool,
    pub slot: Arc<LinkSlot>,
}

/// Everything needed to add a widget to a dashboard.
pub struct WidgetSpec {
    pub(crate) nickname: String,
    pub(crate) name: Option<String>,
    pub(crate) strategy: Box<dyn DeviceStrategy>,
    pub(crate) link: LinkSettings,
    pub(crate) share_link_with: Option<String>,
    pub(crate) update_stride: u32,
}

impl WidgetSpec {
    /// Widget `nickname` driven by `strategy`, with default link settings and a stride of 1.
    pub fn new(nickname: impl Into<String>, strategy: Box<dyn DeviceStrategy>) -> Self {
        Self {
            nickname: nickname.into(),
            name: None,
            strategy,
            link: LinkSettings::default(),
            share_link_with: None,
            update_stride: 1,
        }
    }

    /// Display name. Defaults to the strategy kind.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Link settings used when this widget opens the link.
    pub fn with_link(mut self, link: LinkSettings) -> Self {
        self.link = link;
        self
    }

    /// Share the link (and command queue) of an earlier widget.
    pub fn sharing_link_with(mut self, nickname: impl Into<String>) -> Self {
        self.share_link_with = Some(nickname.into());
        self
    }

    /// Poll only every `stride`th cycle. 0 is treated as 1.
    pub fn with_update_stride(mut self, stride: u32) -> Self {
        self.update_stride = stride.max(1);
        self
    }
}

/// A widget on the dashboard.
pub struct Widget {
    pub(crate) id: WidgetId,
    pub(crate) identity: Arc<WidgetIdentity>,
    pub(crate) fields: FieldStore,
    pub(crate) status: Arc<WidgetStatus>,
    pub(crate) strategy: SharedStrategy,
    pub(crate) link: LinkBinding,
    pub(crate) update_stride: u32,
    pub(crate) queue: Option<CommandQueue>,
}

impl Widget {
    /// Position in the dashboard.
    pub fn id(&self) -> WidgetId {
        self.id
    }

    /// Unique name used by scripts and remote commands.
    pub fn nickname(&self) -> &str {
        &self.identity.nickname
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Field values as the foreground sees them.
    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    /// Flags shared with the worker.
    pub fn status(&self) -> &WidgetStatus {
        &self.status
    }

    /// Shorthand for `status().state()`.
    pub fn state(&self) -> WidgetState {
        self.status.state()
    }

    /// Poll stride.
    pub fn update_stride(&self) -> u32 {
        self.update_stride
    }

    /// Whether this widget owns its link.
    pub fn is_link_primary(&self) -> bool {
        self.link.is_primary
    }

    /// Nickname of the widget owning the link this widget uses.
    pub fn link_owner(&self) -> &str {
        &self.link.primary_nickname
    }
}

impl fmt::Debug for Widget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Widget")
            .field("id", &self.id)
            .field("nickname", &self.identity.nickname)
            .field("state", &self.state())
            .field("fields", &self.fields.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_counter_polls_once_every_n() {
        let status = WidgetStatus::default();
        status.prime_cycle(3);
        let polled: Vec<bool> = (0..7).map(|_| status.advance_cycle(3)).collect();
        assert_eq!(
            polled,
            vec![true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn stride_of_one_always_polls() {
        let status = WidgetStatus::default();
        status.prime_cycle(1);
        assert!((0..5).all(|_| status.advance_cycle(1)));
    }

    #[test]
    fn state_round_trips_through_atomic() {
        let status = WidgetStatus::default();
        assert_eq!(status.state(), WidgetState::Disconnected);
        status.set_state(WidgetState::Failed);
        assert_eq!(status.state(), WidgetState::Failed);
        assert_eq!(status.state().status_text(), "Connection Failed");
        status.mark_disconnected();
        assert_eq!(status.state(), WidgetState::Disconnected);
    }

    #[test]
    fn handshake_result_loses_to_a_close() {
        let status = WidgetStatus::default();
        status.set_state(WidgetState::Handshaking);
        status.mark_disconnected();
        assert!(!status.finish_handshake(WidgetState::Connected));
        assert_eq!(status.state(), WidgetState::Disconnected);

        status.set_state(WidgetState::Handshaking);
        assert!(status.finish_handshake(WidgetState::Connected));
        assert_eq!(status.state(), WidgetState::Connected);
    }
}
