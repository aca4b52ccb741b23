//! Arduino-driven IoT relay.
//!
//! Protocol Overview:
//! - Baud: 115200
//! - Commands: `1\n` (on), `0\n` (off); no reply
//! - Query: `Q\n`, reply `1` or `0` followed by a line ending
//!
//! The first reply after the board resets is often empty, so an empty reply is retried once.

use crate::device::{DeviceContext, DeviceStrategy};
use crate::devices::emulator::EmulatedLink;
use crate::field::FieldSpec;
use crate::transport::{self, Transport};
use anyhow::{bail, Context, Result};
use tracing::info;

/// Baud rate of the relay's USB serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const SELECTION: &str = "Status Selection";
const ACTUAL: &str = "Actual Status";

/// IoT power relay switched over serial.
#[derive(Debug, Default)]
pub struct IotRelay;

impl IotRelay {
    fn read_status(&self, ctx: &mut DeviceContext) -> Result<()> {
        let link = ctx.link()?;
        let mut reply = transport::query(&mut **link.lock(), ctx.nickname(), b"Q\n", b'\n')?;
        if reply.trim().is_empty() {
            reply = transport::query(&mut **link.lock(), ctx.nickname(), b"Q\n", b'\n')?;
        }

        let status = match reply.trim() {
            "1" => "On",
            "0" => "Off",
            other => {
                ctx.set_field(ACTUAL, "Read Error");
                bail!(
                    "Unexpected response received from IoT relay: '{}'",
                    other.escape_default()
                );
            }
        };
        ctx.set_field(ACTUAL, status);
        Ok(())
    }
}

impl DeviceStrategy for IotRelay {
    fn kind(&self) -> &str {
        "IoT Relay"
    }

    fn fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::dropdown(SELECTION, "Off", ["Off", "On"]),
            FieldSpec::output(ACTUAL, "No Reading"),
        ]
    }

    fn emulator(&self) -> Option<Box<dyn Transport>> {
        let mut on = false;
        Some(Box::new(EmulatedLink::new("relay", move |command| {
            match command {
                b"Q\n" => Some(if on { b"1\r\n".to_vec() } else { b"0\r\n".to_vec() }),
                b"1\n" => {
                    on = true;
                    None
                }
                b"0\n" => {
                    on = false;
                    None
                }
                _ => None,
            }
        })))
    }

    fn handshake(&mut self, ctx: &mut DeviceContext) -> Result<bool> {
        self.read_status(ctx)?;
        Ok(true)
    }

    fn on_open(&mut self, ctx: &mut DeviceContext, success: bool) -> Result<()> {
        if !success {
            ctx.set_field(ACTUAL, "No Reading");
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        self.read_status(ctx)
    }

    fn confirm(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        let command: &[u8] = match ctx.require_field(SELECTION)? {
            "On" => b"1\n",
            "Off" => b"0\n",
            other => bail!("\"Confirm\" pressed with invalid status '{}'", other),
        };
        let link = ctx.link()?;
        link.lock()
            .write_all(command)
            .with_context(|| format!("Failed to switch IoT relay '{}'", ctx.nickname()))?;
        info!(
            "Turning {} IoT relay '{}'",
            if command == b"1\n" { "on" } else { "off" },
            ctx.nickname()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::WidgetIdentity;
    use crate::field::FieldSnapshot;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn ctx(link: Box<dyn Transport>, selection: &str) -> DeviceContext {
        let identity = Arc::new(WidgetIdentity {
            name: "IoT Relay".into(),
            nickname: "Pump".into(),
        });
        let mut fields = FieldSnapshot::new();
        fields.insert(SELECTION.into(), selection.into());
        DeviceContext::new(identity, fields, Some(Arc::new(Mutex::new(link))))
    }

    #[test]
    fn confirm_switches_emulated_relay() {
        let mut relay = IotRelay;
        let link: Arc<Mutex<Box<dyn Transport>>> = Arc::new(Mutex::new(relay.emulator().unwrap()));

        let mut on = DeviceContext::new(
            Arc::new(WidgetIdentity {
                name: "IoT Relay".into(),
                nickname: "Pump".into(),
            }),
            [(SELECTION.to_string(), "On".to_string())].into_iter().collect(),
            Some(link.clone()),
        );
        assert!(relay.handshake(&mut on).unwrap());
        assert_eq!(on.field(ACTUAL), Some("Off"));

        relay.confirm(&mut on).unwrap();
        relay.update(&mut on).unwrap();
        assert_eq!(on.field(ACTUAL), Some("On"));
    }

    #[test]
    fn empty_reply_is_retried() {
        let mut calls = 0;
        let link = EmulatedLink::new("flaky", move |_| {
            calls += 1;
            Some(if calls == 1 { b"\n".to_vec() } else { b"1\r\n".to_vec() })
        });
        let mut ctx = ctx(Box::new(link), "Off");
        IotRelay.update(&mut ctx).unwrap();
        assert_eq!(ctx.field(ACTUAL), Some("On"));
    }

    #[test]
    fn bad_reply_and_bad_selection_fail() {
        let link = EmulatedLink::new("noise", |_| Some(b"x\n".to_vec()));
        let mut ctx = ctx(Box::new(link), "Maybe");
        assert!(IotRelay.update(&mut ctx).is_err());
        assert_eq!(ctx.field(ACTUAL), Some("Read Error"));
        assert!(IotRelay.confirm(&mut ctx).is_err());
    }
}
