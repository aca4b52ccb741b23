//! Device strategies.
//!
//! A [`DeviceStrategy`] is the per-model part of a widget: it declares the widget's fields,
//! opens (or emulates) the link, verifies the device in `handshake`, refreshes readouts in
//! `update` and pushes operator edits in `confirm`. Strategies run on the widget's worker
//! thread and may block on I/O. They never touch the dashboard directly; reads and writes go
//! through a [`DeviceContext`] whose writes are forwarded to the foreground loop.
//!
//! Cosmetic items (titles, separators, labels) implement the much smaller
//! [`Displayable`] capability and never get a worker.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Lamp;
//!
//! impl DeviceStrategy for Lamp {
//!     fn kind(&self) -> &str { "Lamp" }
//!     fn fields(&self) -> Vec<FieldSpec> {
//!         vec![FieldSpec::output("Brightness", "No Reading")]
//!     }
//!     fn handshake(&mut self, ctx: &mut DeviceContext) -> anyhow::Result<bool> {
//!         let link = ctx.link()?;
//!         let reply = transport::query(&mut **link.lock(), ctx.nickname(), b"ID?\n", b'\n')?;
//!         Ok(reply.starts_with("LAMP"))
//!     }
//!     fn update(&mut self, ctx: &mut DeviceContext) -> anyhow::Result<()> {
//!         let link = ctx.link()?;
//!         let reply = transport::query(&mut **link.lock(), ctx.nickname(), b"B?\n", b'\n')?;
//!         ctx.set_field("Brightness", reply.trim());
//!         Ok(())
//!     }
//! }
//! ```

use crate::field::{FieldSnapshot, FieldSpec};
use crate::transport::{self, LinkHandle, LinkSettings, Transport};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::warn;

/// Name and nickname of a widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetIdentity {
    /// Display name (usually the device model)
    pub name: String,
    /// Unique handle used by scripts and remote commands
    pub nickname: String,
}

/// Per-model behavior of a polled widget.
pub trait DeviceStrategy: Send {
    /// Device model name, used as the default widget name.
    fn kind(&self) -> &str;

    /// Fields this widget exposes, in display order.
    fn fields(&self) -> Vec<FieldSpec>;

    /// Whether the widget can only work with an open link.
    fn needs_link(&self) -> bool {
        true
    }

    /// Emulated link used when the dashboard runs offline.
    fn emulator(&self) -> Option<Box<dyn Transport>> {
        None
    }

    /// Open the link for this widget. Only called on the primary widget of a link group.
    fn connect(&mut self, settings: &LinkSettings) -> Result<Option<Box<dyn Transport>>> {
        if settings.emulated {
            return Ok(self.emulator());
        }
        if settings.port.is_none() {
            return Ok(None);
        }
        transport::open_serial(settings).map(Some)
    }

    /// Verify the device answers as expected. `Ok(false)` marks the connection failed.
    fn handshake(&mut self, ctx: &mut DeviceContext) -> Result<bool>;

    /// Called after every handshake attempt, successful or not.
    fn on_open(&mut self, _ctx: &mut DeviceContext, _success: bool) -> Result<()> {
        Ok(())
    }

    /// Refresh readouts. Called once every `update_stride` poll cycles.
    fn update(&mut self, ctx: &mut DeviceContext) -> Result<()>;

    /// Push edited inputs to the device.
    fn confirm(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        warn!(
            "'{}' has no confirm action; nothing was sent",
            ctx.nickname()
        );
        Ok(())
    }

    /// Called on the foreground loop after output fields were reset on close.
    fn close(&mut self, _ctx: &mut DeviceContext) -> Result<()> {
        Ok(())
    }
}

/// A cosmetic dashboard item with no device behind it.
pub trait Displayable: Send {
    /// Heading shown in the status view.
    fn title(&self) -> &str;

    /// Lines shown under the heading.
    fn lines(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A plain heading.
#[derive(Debug, Clone)]
pub struct TitleDisplay {
    title: String,
    subtitle: Option<String>,
}

impl TitleDisplay {
    /// Heading with no subtitle.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: None,
        }
    }

    /// Second line under the title.
    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }
}

impl Displayable for TitleDisplay {
    fn title(&self) -> &str {
        &self.title
    }

    fn lines(&self) -> Vec<String> {
        self.subtitle.iter().cloned().collect()
    }
}

/// What a strategy callback sees of its widget.
///
/// Reads come from the field snapshot taken when the command was queued, overlaid with the
/// callback's own writes. Writes are collected and applied on the foreground loop.
pub struct DeviceContext {
    identity: Arc<WidgetIdentity>,
    fields: FieldSnapshot,
    link: Option<LinkHandle>,
    writes: Vec<(String, String)>,
}

impl DeviceContext {
    /// Context for one callback. `fields` is the widget's snapshot; `link` the open link, if any.
    pub fn new(identity: Arc<WidgetIdentity>, fields: FieldSnapshot, link: Option<LinkHandle>) -> Self {
        Self {
            identity,
            fields,
            link,
            writes: Vec::new(),
        }
    }

    /// Nickname of the widget being served.
    pub fn nickname(&self) -> &str {
        &self.identity.nickname
    }

    /// Widget name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Field value, including writes this callback already made.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Read a field the strategy declared itself.
    pub fn require_field(&self, name: &str) -> Result<&str> {
        self.field(name)
            .ok_or_else(|| anyhow!("'{}' has no field '{}'", self.nickname(), name))
    }

    /// Write a field. The write is applied on the foreground after the callback returns.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.fields.insert(name.to_string(), value.clone());
        self.writes.push((name.to_string(), value));
    }

    /// The open link, or an error when the widget has none.
    pub fn link(&self) -> Result<LinkHandle> {
        self.link
            .clone()
            .ok_or_else(|| anyhow!("'{}' has no open link", self.nickname()))
    }

    /// Whether a link is open for this widget.
    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub(crate) fn set_link(&mut self, link: Option<LinkHandle>) {
        self.link = link;
    }

    pub(crate) fn take_writes(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DeviceContext {
        let identity = Arc::new(WidgetIdentity {
            name: "Thermocouple".into(),
            nickname: "TC".into(),
        });
        let mut fields = FieldSnapshot::new();
        fields.insert("Temperature".into(), "No Reading".into());
        DeviceContext::new(identity, fields, None)
    }

    #[test]
    fn writes_overlay_snapshot_and_are_collected() {
        let mut ctx = ctx();
        ctx.set_field("Temperature", "25");
        assert_eq!(ctx.field("Temperature"), Some("25"));
        assert_eq!(
            ctx.take_writes(),
            vec![("Temperature".to_string(), "25".to_string())]
        );
        assert!(ctx.take_writes().is_empty());
    }

    #[test]
    fn missing_link_is_an_error() {
        let ctx = ctx();
        assert!(!ctx.has_link());
        let Err(err) = ctx.link() else {
            panic!("a context without a link handed one out");
        };
        assert!(err.to_string().contains("TC"));
    }

    #[test]
    fn title_display_lines() {
        let title = TitleDisplay::new("Reactor").with_subtitle("bench 3");
        assert_eq!(title.title(), "Reactor");
        assert_eq!(title.lines(), vec!["bench 3".to_string()]);
    }
}
