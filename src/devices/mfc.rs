//! MKS mass-flow controllers behind a 946 vacuum system controller.
//!
//! One controller box drives up to six MFCs over a single serial link. Each MFC is its own
//! widget; the first widget of a box owns the link and the others share it.
//!
//! Protocol Overview:
//! - Baud: 9600
//! - Channels: A1, A2, B1, B2, C1, C2, addressed as 1..=6
//! - Query: `@<id><CMD><ch>?;FF\r`, e.g. `@001QMD1?;FF\r`
//! - Command: `@<id><CMD><ch>!<value>;FF\r`
//! - Reply: `@<id>ACK<value>;FF`
//!
//! `QSF` is the gas scale factor, `QMD` the valve mode, `QSP` the setpoint and `FR` the
//! measured flow.

use crate::device::{DeviceContext, DeviceStrategy};
use crate::devices::emulator::EmulatedLink;
use crate::field::FieldSpec;
use crate::transport::{self, Transport};
use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

/// Baud rate of the controller box.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

const CHANNELS: [&str; 6] = ["A1", "A2", "B1", "B2", "C1", "C2"];
const MODES: [(&str, &str); 3] = [("Closed", "CLOSE"), ("Setpoint", "SETPOINT"), ("Open", "OPEN")];

const SCALE_ENTRY: &str = "Scale Factor Entry";
const MODE_SELECTION: &str = "Mode Selection";
const SETPOINT_ENTRY: &str = "Setpoint Entry";
const DEVICE_SCALE: &str = "Device Scale Factor";
const DEVICE_MODE: &str = "Device Mode";
const DEVICE_SETPOINT: &str = "Device Setpoint";
const ACTUAL_FLOW: &str = "Actual Flow";
const READOUTS: [&str; 4] = [DEVICE_SCALE, DEVICE_MODE, DEVICE_SETPOINT, ACTUAL_FLOW];

/// Device configuration from the widget's `config` table.
#[derive(Debug, Clone, Deserialize)]
pub struct MfcSettings {
    /// Three-digit controller box ID, e.g. "001"
    pub device_id: String,
    /// One of A1, A2, B1, B2, C1, C2
    pub channel: String,
    /// Fixed gas scale factor; the entry field is ignored when set
    #[serde(default)]
    pub force_scale_factor: Option<f64>,
    /// Corrects commanded flows to what the meter measured
    #[serde(default)]
    pub calibration: Option<Calibration>,
}

/// Commanded flows and the flows an external meter measured for them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Calibration {
    /// Flows sent to the controller
    pub commanded: Vec<f64>,
    /// Flows measured at those commands
    pub measured: Vec<f64>,
}

impl Calibration {
    /// Both lists equally long, at least two points, strictly increasing.
    pub fn validate(&self) -> Result<()> {
        if self.commanded.len() != self.measured.len() || self.commanded.len() < 2 {
            bail!("calibration needs two equally long lists with at least two points");
        }
        if !is_increasing(&self.commanded) || !is_increasing(&self.measured) {
            bail!("calibration points must be strictly increasing");
        }
        Ok(())
    }

    /// Flow the meter sees when the MFC reports `reported`.
    pub fn to_actual(&self, reported: f64) -> f64 {
        interpolate(reported, &self.commanded, &self.measured)
    }

    /// Value to command so the meter sees `actual`.
    pub fn to_commanded(&self, actual: f64) -> f64 {
        interpolate(actual, &self.measured, &self.commanded)
    }
}

fn is_increasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

/// Piecewise-linear interpolation, clamped to the end points.
fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return x;
    };
    if x <= first {
        return ys[0];
    }
    if x >= last {
        return ys[ys.len() - 1];
    }
    let i = xs.partition_point(|&v| v <= x);
    let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Format like `1.30e+02`, the notation the controller accepts.
fn format_scientific(value: f64) -> String {
    let formatted = format!("{:.2e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            format!("{}e{:+03}", mantissa, exponent)
        }
        None => formatted,
    }
}

/// Value after `ACK` in a reply like `FF@001ACK2.10;`.
fn parse_ack(reply: &str) -> Option<&str> {
    let start = reply.find("ACK")? + 3;
    Some(reply[start..].trim_end_matches(|c: char| c == ';' || c.is_whitespace()))
}

/// One channel of an MKS multi-channel mass flow controller.
pub struct MksMfc {
    settings: MfcSettings,
    channel: usize,
}

impl MksMfc {
    /// Fails on an unknown channel or an invalid calibration.
    pub fn new(settings: MfcSettings) -> Result<Self> {
        let channel = CHANNELS
            .iter()
            .position(|c| *c == settings.channel)
            .map(|i| i + 1)
            .ok_or_else(|| {
                anyhow!(
                    "MFC channel '{}' must be one of {}",
                    settings.channel,
                    CHANNELS.join(", ")
                )
            })?;
        if let Some(calibration) = &settings.calibration {
            calibration.validate()?;
        }
        Ok(Self { settings, channel })
    }

    fn query_value(&self, ctx: &DeviceContext, command: &str) -> Result<String> {
        let link = ctx.link()?;
        let request = format!("@{}{}{}?;FF\r", self.settings.device_id, command, self.channel);
        let reply = transport::query(&mut **link.lock(), ctx.nickname(), request.as_bytes(), b';')?;
        parse_ack(&reply)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Bad {} response from MKS MFC: '{}'", command, reply.escape_default()))
    }

    fn send_value(&self, ctx: &DeviceContext, command: &str, value: &str) -> Result<()> {
        let link = ctx.link()?;
        let request = format!(
            "@{}{}{}!{};FF\r",
            self.settings.device_id, command, self.channel, value
        );
        let reply = transport::query(&mut **link.lock(), ctx.nickname(), request.as_bytes(), b';')?;
        if parse_ack(&reply).is_none() {
            bail!(
                "MKS MFC '{}' did not acknowledge {}: '{}'",
                ctx.nickname(),
                command,
                reply.escape_default()
            );
        }
        Ok(())
    }

    fn read_all(&self, ctx: &mut DeviceContext) -> Result<()> {
        let reader: &DeviceContext = ctx;
        let values = (|| -> Result<[String; 4]> {
            let scale: f64 = self.query_value(reader, "QSF")?.parse()?;
            let mode = self.query_value(reader, "QMD")?;
            let setpoint: f64 = self.query_value(reader, "QSP")?.parse()?;
            let flow: f64 = self.query_value(reader, "FR")?.trim_start_matches('>').parse()?;

            let mode = MODES
                .iter()
                .find(|(_, wire)| *wire == mode)
                .map(|(label, _)| label.to_string())
                .unwrap_or(mode);
            let (setpoint, flow) = match &self.settings.calibration {
                Some(cal) => (cal.to_actual(setpoint), cal.to_actual(flow)),
                None => (setpoint, flow),
            };
            Ok([
                format!("{:.1}", scale.max(0.0)),
                mode,
                format!("{:.1}", setpoint.max(0.0)),
                format!("{:.1}", flow.max(0.0)),
            ])
        })();

        match values {
            Ok(values) => {
                for (field, value) in READOUTS.iter().zip(values) {
                    ctx.set_field(field, value);
                }
                Ok(())
            }
            Err(e) => {
                for field in READOUTS {
                    ctx.set_field(field, "Read Error");
                }
                Err(e.context(format!(
                    "Failed to read MKS MFC '{}'; a widget sharing its link may have failed to connect",
                    ctx.nickname()
                )))
            }
        }
    }
}

impl DeviceStrategy for MksMfc {
    fn kind(&self) -> &str {
        "MKS Mass Flow Controller"
    }

    fn fields(&self) -> Vec<FieldSpec> {
        let forced = self
            .settings
            .force_scale_factor
            .map(|f| f.to_string())
            .unwrap_or_default();
        vec![
            FieldSpec::input(SCALE_ENTRY, forced),
            FieldSpec::dropdown(MODE_SELECTION, "Closed", MODES.iter().map(|(label, _)| *label)),
            FieldSpec::input(SETPOINT_ENTRY, "0.0"),
            FieldSpec::output(DEVICE_SCALE, "None"),
            FieldSpec::output(DEVICE_MODE, "None"),
            FieldSpec::output(DEVICE_SETPOINT, "None"),
            FieldSpec::output(ACTUAL_FLOW, "None"),
        ]
    }

    fn emulator(&self) -> Option<Box<dyn Transport>> {
        let id = self.settings.device_id.clone();
        let mut controller = EmulatedController::default();
        Some(Box::new(EmulatedLink::new("MKS 946", move |command| {
            let reply = controller.respond(&String::from_utf8_lossy(command));
            Some(format!("@{}ACK{};FF", id, reply).into_bytes())
        })))
    }

    fn handshake(&mut self, ctx: &mut DeviceContext) -> Result<bool> {
        self.read_all(ctx)?;
        Ok(true)
    }

    fn on_open(&mut self, ctx: &mut DeviceContext, success: bool) -> Result<()> {
        if !success {
            for field in READOUTS {
                ctx.set_field(field, "No Reading");
            }
            return Ok(());
        }
        // Start the entries from what the device is doing now
        if self.settings.force_scale_factor.is_none() {
            let scale = ctx.require_field(DEVICE_SCALE)?.to_string();
            ctx.set_field(SCALE_ENTRY, scale);
        }
        let setpoint = ctx.require_field(DEVICE_SETPOINT)?.to_string();
        ctx.set_field(SETPOINT_ENTRY, setpoint);
        let mode = ctx.require_field(DEVICE_MODE)?.to_string();
        ctx.set_field(MODE_SELECTION, mode);
        Ok(())
    }

    fn update(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        self.read_all(ctx)
    }

    fn confirm(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        let scale = match self.settings.force_scale_factor {
            Some(forced) => forced,
            None => ctx
                .require_field(SCALE_ENTRY)?
                .trim()
                .parse::<f64>()
                .context("Enter the scale factor as a number")?,
        };

        let selected = ctx.require_field(MODE_SELECTION)?.to_string();
        let wire_mode = MODES
            .iter()
            .find(|(label, _)| *label == selected)
            .map(|(_, wire)| *wire)
            .ok_or_else(|| anyhow!("\"Confirm\" pressed with invalid mode '{}'", selected))?;

        let entered = ctx.require_field(SETPOINT_ENTRY)?.to_string();
        let setpoint: f64 = entered
            .trim()
            .parse()
            .context("Enter the setpoint as a number")?;
        let commanded = match &self.settings.calibration {
            Some(cal) => cal.to_commanded(setpoint),
            None => setpoint,
        };

        self.send_value(ctx, "QSF", &format!("{:.2}", scale))?;
        self.send_value(ctx, "QMD", wire_mode)?;
        self.send_value(ctx, "QSP", &format_scientific(commanded))?;
        info!(
            "MFC '{}' set to scale factor {:.2}, mode {}, setpoint {} sccm",
            ctx.nickname(),
            scale,
            selected,
            entered
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    scale: f64,
    mode: &'static str,
    setpoint: f64,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            scale: 2.1,
            mode: "SETPOINT",
            setpoint: 130.0,
        }
    }
}

/// In-memory controller box answering for every channel.
#[derive(Debug, Default)]
struct EmulatedController {
    channels: HashMap<char, ChannelState>,
}

impl EmulatedController {
    fn respond(&mut self, command: &str) -> String {
        // "@001QSP1?;FF\r" or "@001QSP1!1.30e+02;FF\r"
        let body = command.get(4..).unwrap_or("").trim_end();
        let body = body.strip_suffix(";FF").unwrap_or(body);
        let name_len = body.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let (name, rest) = body.split_at(name_len);
        let mut rest = rest.chars();
        let Some(channel) = rest.next() else {
            return "ERROR".to_string();
        };
        let state = self.channels.entry(channel).or_default();

        match (name, rest.next(), rest.as_str()) {
            ("QSF", Some('?'), _) => format!("{:.2}", state.scale),
            ("QMD", Some('?'), _) => state.mode.to_string(),
            ("QSP", Some('?'), _) => format_scientific(state.setpoint),
            ("FR", Some('?'), _) => {
                let flow = match state.mode {
                    "CLOSE" => 0.0,
                    "OPEN" => 500.0,
                    _ => state.setpoint * (0.98 + 0.04 * rand::thread_rng().gen::<f64>()),
                };
                format_scientific(flow)
            }
            ("QSF", Some('!'), value) => {
                state.scale = value.parse().unwrap_or(state.scale);
                value.to_string()
            }
            ("QMD", Some('!'), value) => {
                if let Some((_, wire)) = MODES.iter().find(|(_, wire)| *wire == value) {
                    state.mode = *wire;
                }
                value.to_string()
            }
            ("QSP", Some('!'), value) => {
                state.setpoint = value.parse().unwrap_or(state.setpoint);
                value.to_string()
            }
            _ => "ERROR".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::WidgetIdentity;
    use crate::field::FieldSnapshot;
    use crate::transport::LinkHandle;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn settings(channel: &str) -> MfcSettings {
        MfcSettings {
            device_id: "001".into(),
            channel: channel.into(),
            force_scale_factor: None,
            calibration: None,
        }
    }

    fn ctx(link: &LinkHandle, nickname: &str) -> DeviceContext {
        let identity = Arc::new(WidgetIdentity {
            name: "MKS Mass Flow Controller".into(),
            nickname: nickname.into(),
        });
        DeviceContext::new(identity, FieldSnapshot::new(), Some(link.clone()))
    }

    #[test]
    fn rejects_unknown_channel_and_bad_calibration() {
        assert!(MksMfc::new(settings("D1")).is_err());
        let mut bad = settings("A1");
        bad.calibration = Some(Calibration {
            commanded: vec![0.0, 10.0],
            measured: vec![0.0],
        });
        assert!(MksMfc::new(bad).is_err());
    }

    #[test]
    fn parses_ack_replies() {
        assert_eq!(parse_ack("@001ACK2.10;"), Some("2.10"));
        assert_eq!(parse_ack("FF@001ACKSETPOINT;"), Some("SETPOINT"));
        assert_eq!(parse_ack("@001NAK91;"), None);
    }

    #[test]
    fn scientific_format_matches_controller() {
        assert_eq!(format_scientific(130.0), "1.30e+02");
        assert_eq!(format_scientific(0.05), "5.00e-02");
        assert_eq!(format_scientific(0.0), "0.00e+00");
    }

    #[test]
    fn calibration_interpolates_both_ways() {
        let cal = Calibration {
            commanded: vec![0.0, 10.0, 20.0],
            measured: vec![0.0, 12.0, 22.0],
        };
        assert!((cal.to_actual(5.0) - 6.0).abs() < 1e-9);
        assert!((cal.to_commanded(17.0) - 15.0).abs() < 1e-9);
        assert_eq!(cal.to_actual(50.0), 22.0);
    }

    #[test]
    fn channels_share_one_emulated_box() {
        let mut first = MksMfc::new(settings("A1")).unwrap();
        let mut second = MksMfc::new(settings("A2")).unwrap();
        let link: LinkHandle = Arc::new(Mutex::new(first.emulator().unwrap()));

        let mut a = ctx(&link, "MFC A");
        assert!(first.handshake(&mut a).unwrap());
        first.on_open(&mut a, true).unwrap();
        assert_eq!(a.field(DEVICE_MODE), Some("Setpoint"));
        assert_eq!(a.field(DEVICE_SETPOINT), Some("130.0"));
        assert_eq!(a.field(SETPOINT_ENTRY), Some("130.0"));

        let mut b = ctx(&link, "MFC B");
        b.set_field(SCALE_ENTRY, "1.0");
        b.set_field(MODE_SELECTION, "Closed");
        b.set_field(SETPOINT_ENTRY, "40");
        second.confirm(&mut b).unwrap();
        second.update(&mut b).unwrap();
        assert_eq!(b.field(DEVICE_MODE), Some("Closed"));
        assert_eq!(b.field(DEVICE_SETPOINT), Some("40.0"));
        assert_eq!(b.field(ACTUAL_FLOW), Some("0.0"));

        // Channel A1 is untouched
        first.update(&mut a).unwrap();
        assert_eq!(a.field(DEVICE_MODE), Some("Setpoint"));
    }

    #[test]
    fn confirm_rejects_bad_entries() {
        let mut mfc = MksMfc::new(settings("B1")).unwrap();
        let link: LinkHandle = Arc::new(Mutex::new(mfc.emulator().unwrap()));
        let mut c = ctx(&link, "MFC");
        c.set_field(SCALE_ENTRY, "1");
        c.set_field(MODE_SELECTION, "Sideways");
        c.set_field(SETPOINT_ENTRY, "1");
        assert!(mfc.confirm(&mut c).is_err());
        c.set_field(MODE_SELECTION, "Open");
        c.set_field(SETPOINT_ENTRY, "lots");
        assert!(mfc.confirm(&mut c).is_err());
    }
}
