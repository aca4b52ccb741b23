//! Omega USB-UTC thermocouple reader.
//!
//! Protocol Overview:
//! - Baud: 38400, 8N1
//! - Query: `C\r`
//! - Reply: `>25\r\n` (temperature in the unit configured on the reader)

use crate::device::{DeviceContext, DeviceStrategy};
use crate::devices::emulator::EmulatedLink;
use crate::field::FieldSpec;
use crate::transport::{self, Transport};
use anyhow::{anyhow, Result};
use rand::Rng;

/// Factory baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 38400;

const TEMPERATURE: &str = "Temperature";

/// Omega thermocouple reader.
#[derive(Debug, Default)]
pub struct OmegaThermocouple;

impl OmegaThermocouple {
    fn read_temperature(&self, ctx: &mut DeviceContext) -> Result<()> {
        let link = ctx.link()?;
        let reply = transport::query(&mut **link.lock(), ctx.nickname(), b"C\r", b'\n')?;
        match parse_temperature(&reply) {
            Some(temperature) => {
                ctx.set_field(TEMPERATURE, temperature);
                Ok(())
            }
            None => {
                ctx.set_field(TEMPERATURE, "Read Error");
                Err(anyhow!(
                    "Unexpected response received from thermocouple reader: '{}'",
                    reply.escape_default()
                ))
            }
        }
    }
}

/// Extract the number from a reply like `>25\r\n`.
fn parse_temperature(reply: &str) -> Option<String> {
    let value = reply.trim().strip_prefix('>')?.trim();
    value.parse::<f64>().ok()?;
    Some(value.to_string())
}

impl DeviceStrategy for OmegaThermocouple {
    fn kind(&self) -> &str {
        "Omega USB-UTC"
    }

    fn fields(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::output(TEMPERATURE, "No Reading")]
    }

    fn emulator(&self) -> Option<Box<dyn Transport>> {
        Some(Box::new(EmulatedLink::new("thermocouple", |command| {
            (command == b"C\r").then(|| {
                let reading = 30 + rand::thread_rng().gen_range(0..5);
                format!(">{}\r\n", reading).into_bytes()
            })
        })))
    }

    fn handshake(&mut self, ctx: &mut DeviceContext) -> Result<bool> {
        self.read_temperature(ctx)?;
        Ok(true)
    }

    fn on_open(&mut self, ctx: &mut DeviceContext, success: bool) -> Result<()> {
        if !success {
            ctx.set_field(TEMPERATURE, "No Reading");
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        self.read_temperature(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::WidgetIdentity;
    use crate::field::FieldSnapshot;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn ctx_with(link: Box<dyn Transport>) -> DeviceContext {
        let identity = Arc::new(WidgetIdentity {
            name: "Omega USB-UTC".into(),
            nickname: "TC".into(),
        });
        DeviceContext::new(
            identity,
            FieldSnapshot::new(),
            Some(Arc::new(Mutex::new(link))),
        )
    }

    #[test]
    fn parses_replies() {
        assert_eq!(parse_temperature(">25\r\n").as_deref(), Some("25"));
        assert_eq!(parse_temperature(">-3.5\r\n").as_deref(), Some("-3.5"));
        assert_eq!(parse_temperature("25\r\n"), None);
        assert_eq!(parse_temperature(">\r\n"), None);
        assert_eq!(parse_temperature(">OPEN\r\n"), None);
    }

    #[test]
    fn emulator_reports_plausible_temperature() {
        let mut tc = OmegaThermocouple;
        let mut ctx = ctx_with(tc.emulator().unwrap());
        assert!(tc.handshake(&mut ctx).unwrap());
        let temperature: u32 = ctx.field(TEMPERATURE).unwrap().parse().unwrap();
        assert!((30..35).contains(&temperature));
    }

    #[test]
    fn garbage_reply_is_a_read_error() {
        let mut tc = OmegaThermocouple;
        let link = EmulatedLink::new("broken", |_| Some(b"??\r\n".to_vec()));
        let mut ctx = ctx_with(Box::new(link));
        assert!(tc.update(&mut ctx).is_err());
        assert_eq!(ctx.field(TEMPERATURE), Some("Read Error"));
    }
}
