//! Helpers shared by the integration tests.
#![allow(dead_code)]

use daq_panel::connection::ConnectionController;
use daq_panel::dashboard::Dashboard;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Apply worker results until `condition` holds or `timeout` passes.
pub fn wait_until(
    dashboard: &mut Dashboard,
    timeout: Duration,
    mut condition: impl FnMut(&Dashboard) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        dashboard.apply_pending_updates();
        if condition(dashboard) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Launch `dashboard` and open its connection with a short polling interval.
pub fn launch_and_open(dashboard: &mut Dashboard) -> ConnectionController {
    dashboard.launch().expect("launch");
    let mut controller = ConnectionController::new(Duration::from_millis(10));
    controller
        .open(dashboard, Instant::now())
        .expect("open connection");
    controller
}
