//! CSV data logging driven by the panel loop.
#![cfg(feature = "storage_csv")]

use daq_panel::config::PanelConfig;
use daq_panel::dashboard::Dashboard;
use daq_panel::devices::mock::MockDevice;
use daq_panel::panel::{Panel, PanelHandle};
use daq_panel::widget::WidgetSpec;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn start_panel() -> (PanelHandle, JoinHandle<daq_panel::error::AppResult<()>>) {
    let config = PanelConfig::from_toml_str(
        r#"
        [application]
        name = "Logging Test"
        log_level = "info"

        [polling]
        interval = "20ms"
        ui_tick = "5ms"

        [data_logging]
        interval = "0:00:01"
        "#,
    )
    .unwrap();
    let mut dash = Dashboard::new("Logging Test");
    dash.add_widget(WidgetSpec::new("M", Box::new(MockDevice::new())))
        .unwrap();
    let (panel, handle) = Panel::new(dash, &config);
    (handle, tokio::spawn(panel.run()))
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = read_lines(path);
        if lines.len() >= count {
            return lines;
        }
        assert!(Instant::now() < deadline, "only {} lines in log", lines.len());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_rows_follow_the_interval() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs").join("log.csv");
    let (handle, runtime) = start_panel();

    handle.set_field("M", "Setpoint", "2.5", false).await.unwrap();
    handle.start_logging(&path).await.unwrap();
    assert_eq!(handle.status().await.unwrap().logging.as_deref(), Some(path.as_path()));

    let lines = wait_for_lines(&path, 3).await;
    assert_eq!(lines[0], "Date,Timestamp,M: Reading,M: Setpoint");
    assert!(lines[1].ends_with(",No Reading,2.5"), "row was {}", lines[1]);

    handle.stop_logging().await.unwrap();
    assert!(handle.status().await.unwrap().logging.is_none());

    handle.shutdown().await;
    runtime.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restarting_appends_without_second_header() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.csv");
    let (handle, runtime) = start_panel();

    handle.start_logging(&path).await.unwrap();
    wait_for_lines(&path, 2).await;
    handle.stop_logging().await.unwrap();

    handle.start_logging(&path).await.unwrap();
    let lines = wait_for_lines(&path, 3).await;
    handle.shutdown().await;
    runtime.await.unwrap().unwrap();

    let headers = lines.iter().filter(|l| l.starts_with("Date,")).count();
    assert_eq!(headers, 1);
}
