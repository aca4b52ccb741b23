//! Mock devices for tests and demos.
//!
//! [`MockDevice`] is a computed widget that needs no hardware. Every callback is recorded in
//! a shared [`MockRecorder`], so tests can check exactly what the worker ran and in which order.
//! [`LoopbackTransport`] echoes whatever is written to it.

use crate::device::{DeviceContext, DeviceStrategy};
use crate::field::FieldSpec;
use crate::transport::{self, LinkSettings, Transport};
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A strategy callback as seen by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// `connect`
    Connect,
    /// `handshake`, recorded before any delay
    Handshake,
    /// `on_open` with its success flag
    Open(bool),
    /// `update`, recorded before any delay
    Update,
    /// Confirm carrying the setpoint that was pushed
    Confirm(String),
    /// `close`
    Close,
}

/// Shared record of a mock device's callbacks.
#[derive(Debug, Clone, Default)]
pub struct MockRecorder {
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockRecorder {
    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    /// All events in order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    /// How often `event` was recorded.
    pub fn count(&self, event: &MockEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Number of updates run.
    pub fn updates(&self) -> usize {
        self.count(&MockEvent::Update)
    }

    /// Setpoints pushed by confirm, in order.
    pub fn confirmed_setpoints(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Confirm(setpoint) => Some(setpoint.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index of the first matching event.
    pub fn position(&self, event: &MockEvent) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeOutcome {
    Accept,
    Reject,
    Fail,
}

/// A device whose `Reading` counts the updates it has run.
pub struct MockDevice {
    recorder: MockRecorder,
    handshake: HandshakeOutcome,
    handshake_delay: Duration,
    update_delay: Duration,
    failing_updates: bool,
    loopback: bool,
    updates: u64,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Device that accepts the handshake at once.
    pub fn new() -> Self {
        Self {
            recorder: MockRecorder::default(),
            handshake: HandshakeOutcome::Accept,
            handshake_delay: Duration::ZERO,
            update_delay: Duration::ZERO,
            failing_updates: false,
            loopback: false,
            updates: 0,
        }
    }

    /// Handle on this device's call log. Clones share it.
    pub fn recorder(&self) -> MockRecorder {
        self.recorder.clone()
    }

    /// Answer the handshake with `Ok(false)`.
    pub fn rejecting_handshake(mut self) -> Self {
        self.handshake = HandshakeOutcome::Reject;
        self
    }

    /// Fail the handshake with an error.
    pub fn failing_handshake(mut self) -> Self {
        self.handshake = HandshakeOutcome::Fail;
        self
    }

    /// Sleep in every handshake.
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Sleep in every update.
    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = delay;
        self
    }

    /// Fail every update with `Read Error`.
    pub fn failing_updates(mut self) -> Self {
        self.failing_updates = true;
        self
    }

    /// Require a link, opened as a [`LoopbackTransport`].
    pub fn with_loopback_link(mut self) -> Self {
        self.loopback = true;
        self
    }
}

impl DeviceStrategy for MockDevice {
    fn kind(&self) -> &str {
        "Mock Device"
    }

    fn fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::output("Reading", "No Reading"),
            FieldSpec::input("Setpoint", "0"),
        ]
    }

    fn needs_link(&self) -> bool {
        self.loopback
    }

    fn emulator(&self) -> Option<Box<dyn Transport>> {
        self.loopback
            .then(|| Box::new(LoopbackTransport::new("mock")) as Box<dyn Transport>)
    }

    fn connect(&mut self, _settings: &LinkSettings) -> Result<Option<Box<dyn Transport>>> {
        self.recorder.record(MockEvent::Connect);
        Ok(self.emulator())
    }

    fn handshake(&mut self, ctx: &mut DeviceContext) -> Result<bool> {
        self.recorder.record(MockEvent::Handshake);
        if !self.handshake_delay.is_zero() {
            std::thread::sleep(self.handshake_delay);
        }
        if self.loopback {
            let link = ctx.link()?;
            let reply = transport::query(&mut **link.lock(), ctx.nickname(), b"ID?\n", b'\n')?;
            if reply != "ID?\n" {
                bail!("loopback returned '{}'", reply.escape_default());
            }
        }
        match self.handshake {
            HandshakeOutcome::Accept => {
                self.updates = 0;
                ctx.set_field("Reading", "0");
                Ok(true)
            }
            HandshakeOutcome::Reject => Ok(false),
            HandshakeOutcome::Fail => Err(anyhow!("mock device refused to connect")),
        }
    }

    fn on_open(&mut self, ctx: &mut DeviceContext, success: bool) -> Result<()> {
        self.recorder.record(MockEvent::Open(success));
        if !success {
            ctx.set_field("Reading", "Connection Failed");
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        self.recorder.record(MockEvent::Update);
        if !self.update_delay.is_zero() {
            std::thread::sleep(self.update_delay);
        }
        if self.failing_updates {
            ctx.set_field("Reading", "Read Error");
            bail!("mock device returned garbage");
        }
        self.updates += 1;
        ctx.set_field("Reading", self.updates.to_string());
        Ok(())
    }

    fn confirm(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        let setpoint = ctx.require_field("Setpoint")?.to_string();
        self.recorder.record(MockEvent::Confirm(setpoint));
        Ok(())
    }

    fn close(&mut self, _ctx: &mut DeviceContext) -> Result<()> {
        self.recorder.record(MockEvent::Close);
        Ok(())
    }
}

/// A transport that reads back what was written to it.
pub struct LoopbackTransport {
    name: String,
    buffer: VecDeque<u8>,
    closed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Open loopback called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: VecDeque::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the transport is closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Transport for LoopbackTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "loopback closed"));
        }
        self.buffer.extend(bytes);
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        let mut reply = Vec::new();
        while let Some(byte) = self.buffer.pop_front() {
            reply.push(byte);
            if byte == terminator {
                break;
            }
        }
        Ok(reply)
    }

    fn reset_input_buffer(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("loopback {}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::WidgetIdentity;
    use crate::field::FieldSnapshot;

    fn ctx() -> DeviceContext {
        let identity = Arc::new(WidgetIdentity {
            name: "Mock Device".into(),
            nickname: "M".into(),
        });
        let mut fields = FieldSnapshot::new();
        fields.insert("Setpoint".into(), "2.5".into());
        DeviceContext::new(identity, fields, None)
    }

    #[test]
    fn callbacks_are_recorded() {
        let mut device = MockDevice::new();
        let calls = device.recorder();
        let mut ctx = ctx();

        assert!(device.handshake(&mut ctx).unwrap());
        device.on_open(&mut ctx, true).unwrap();
        device.update(&mut ctx).unwrap();
        device.update(&mut ctx).unwrap();
        device.confirm(&mut ctx).unwrap();

        assert_eq!(ctx.field("Reading"), Some("2"));
        assert_eq!(calls.updates(), 2);
        assert_eq!(calls.confirmed_setpoints(), vec!["2.5".to_string()]);
        assert_eq!(calls.position(&MockEvent::Handshake), Some(0));
    }

    #[test]
    fn handshake_outcomes() {
        let mut ctx = ctx();
        assert!(!MockDevice::new().rejecting_handshake().handshake(&mut ctx).unwrap());
        assert!(MockDevice::new().failing_handshake().handshake(&mut ctx).is_err());
        // A loopback device without an open link cannot verify itself
        assert!(MockDevice::new().with_loopback_link().handshake(&mut ctx).is_err());
    }

    #[test]
    fn loopback_device_checks_its_link() {
        let mut device = MockDevice::new().with_loopback_link();
        assert!(device.needs_link());
        let transport = device
            .connect(&LinkSettings::default())
            .unwrap()
            .expect("loopback link");
        let mut ctx = ctx();
        ctx.set_link(Some(Arc::new(Mutex::new(transport))));
        assert!(device.handshake(&mut ctx).unwrap());
        assert_eq!(device.recorder().count(&MockEvent::Connect), 1);
    }

    #[test]
    fn closed_loopback_rejects_writes() {
        let mut link = LoopbackTransport::new("loop");
        link.close().unwrap();
        assert!(link.write_all(b"x").is_err());
        assert!(link.closed_flag().load(Ordering::SeqCst));
    }
}
