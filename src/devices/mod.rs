//! Device drivers and the registry that builds dashboards from configuration.
//!
//! Each driver implements [`DeviceStrategy`]. The `type` key of a widget definition selects
//! the driver and its `config` table is deserialized into the driver's settings.

pub mod emulator;
pub mod mfc;
pub mod mock;
pub mod relay;
pub mod thermocouple;

use crate::config::{PanelConfig, WidgetDefinition};
use crate::dashboard::Dashboard;
use crate::device::DeviceStrategy;
use crate::error::{AppResult, PanelError};
use crate::reporter::ErrorReporter;
use crate::transport::LinkSettings;
use crate::widget::WidgetSpec;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info};

/// Device types accepted in the `type` key of a widget definition.
pub const DEVICE_TYPES: [&str; 4] = ["omega_usb_utc", "iot_relay", "mks_mfc", "mock"];

fn device_config<T: DeserializeOwned>(def: &WidgetDefinition) -> AppResult<T> {
    def.config.clone().try_into::<T>().map_err(|e| {
        PanelError::Configuration(format!(
            "Invalid config for widget '{}' ({}): {}",
            def.nickname, def.r#type, e
        ))
    })
}

/// Create the driver named by a widget definition.
pub fn build_strategy(def: &WidgetDefinition) -> AppResult<Box<dyn DeviceStrategy>> {
    let strategy: Box<dyn DeviceStrategy> = match def.r#type.as_str() {
        "omega_usb_utc" => Box::new(thermocouple::OmegaThermocouple),
        "iot_relay" => Box::new(relay::IotRelay),
        "mks_mfc" => {
            let settings: mfc::MfcSettings = device_config(def)?;
            let device = mfc::MksMfc::new(settings).map_err(|e| {
                PanelError::Configuration(format!("Widget '{}': {:#}", def.nickname, e))
            })?;
            Box::new(device)
        }
        "mock" => Box::new(mock::MockDevice::new()),
        other => {
            return Err(PanelError::Configuration(format!(
                "Unknown device type '{}' for widget '{}'. Known types: {}",
                other,
                def.nickname,
                DEVICE_TYPES.join(", ")
            )))
        }
    };
    Ok(strategy)
}

fn default_baud_rate(device_type: &str) -> u32 {
    match device_type {
        "omega_usb_utc" => thermocouple::DEFAULT_BAUD_RATE,
        "iot_relay" => relay::DEFAULT_BAUD_RATE,
        "mks_mfc" => mfc::DEFAULT_BAUD_RATE,
        _ => LinkSettings::default().baud_rate,
    }
}

fn link_settings(def: &WidgetDefinition, use_emulators: bool) -> LinkSettings {
    if use_emulators {
        return LinkSettings {
            timeout: def.timeout,
            ..LinkSettings::emulated()
        };
    }
    LinkSettings {
        port: def.port.clone(),
        baud_rate: def.baud_rate.unwrap_or_else(|| default_baud_rate(&def.r#type)),
        timeout: def.timeout,
        emulated: false,
    }
}

/// Build the widget spec for one definition.
pub fn widget_spec(def: &WidgetDefinition, use_emulators: bool) -> AppResult<WidgetSpec> {
    let mut spec = WidgetSpec::new(&def.nickname, build_strategy(def)?)
        .with_link(link_settings(def, use_emulators))
        .with_update_stride(def.update_stride);
    if let Some(name) = &def.name {
        spec = spec.with_name(name);
    }
    if let Some(primary) = &def.share_link_with {
        spec = spec.sharing_link_with(primary);
    }
    Ok(spec)
}

/// Build an unlaunched dashboard with every enabled widget of the configuration.
pub fn build_dashboard(config: &PanelConfig, reporter: Arc<ErrorReporter>) -> AppResult<Dashboard> {
    config.validate().map_err(PanelError::Configuration)?;

    let mut dashboard = Dashboard::new(&config.application.name)
        .with_reporter(reporter)
        .with_queue_capacity(config.polling.queue_capacity);
    for def in config.enabled_widgets() {
        let id = dashboard.add_widget(widget_spec(def, config.use_emulators)?)?;
        debug!("Added widget '{}' ({}) as {:?}", def.nickname, def.r#type, id);
    }
    info!(
        "Built dashboard '{}' with {} widgets{}",
        config.application.name,
        dashboard.widgets().len(),
        if config.use_emulators { " (emulated)" } else { "" }
    );
    Ok(dashboard)
}
