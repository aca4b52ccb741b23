//! Integration tests for automation scripts running against live widget workers.

mod common;

use common::{launch_and_open, wait_until, WAIT};
use daq_panel::automation::{AutomationScheduler, AutomationState, ScriptBuilder};
use daq_panel::dashboard::Dashboard;
use daq_panel::devices::mock::{MockDevice, MockEvent, MockRecorder};
use daq_panel::poll::PollDispatcher;
use daq_panel::reporter::ErrorSource;
use daq_panel::scripting::ScriptHost;
use daq_panel::widget::WidgetSpec;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);

fn dashboard() -> (Dashboard, MockRecorder) {
    let device = MockDevice::new();
    let calls = device.recorder();
    let mut dash = Dashboard::new("Automation");
    dash.add_widget(WidgetSpec::new("M", Box::new(device))).unwrap();
    (dash, calls)
}

#[test]
fn test_rhai_script_sets_fields_on_schedule() {
    let (mut dash, calls) = dashboard();
    let _controller = launch_and_open(&mut dash);

    let script = ScriptHost::default()
        .load_automation(
            r#"
            schedule_delay("0:00:05");
            schedule_action("M", "Setpoint", 1);
            schedule_delay(3);
            schedule_action("M", "Setpoint", "2", false);
            "#,
            "timing",
            &dash,
        )
        .unwrap();
    assert_eq!(script.len(), 2);

    let mut scheduler = AutomationScheduler::new(TICK);
    scheduler.load(script, &dash).unwrap();
    let t0 = Instant::now();
    scheduler.start(t0, dash.is_connected()).unwrap();

    scheduler.tick(t0 + Duration::from_secs(4), &mut dash);
    assert_eq!(dash.get_field("M", "Setpoint").unwrap(), "0");
    scheduler.tick(t0 + Duration::from_secs(5), &mut dash);
    assert_eq!(dash.get_field("M", "Setpoint").unwrap(), "1");
    assert_eq!(scheduler.status().steps_readout(), "1/2 steps done.");

    // The first action confirms through the worker
    let confirm = MockEvent::Confirm("1".to_string());
    assert!(wait_until(&mut dash, WAIT, |_| calls.count(&confirm) == 1));

    scheduler.tick(t0 + Duration::from_secs(8), &mut dash);
    assert_eq!(dash.get_field("M", "Setpoint").unwrap(), "2");
    assert_eq!(scheduler.state(), AutomationState::Finished);
    assert_eq!(calls.confirmed_setpoints(), vec!["1".to_string()]);
}

#[test]
fn test_await_follows_polled_readings() {
    let (mut dash, _calls) = dashboard();
    let _controller = launch_and_open(&mut dash);
    assert!(wait_until(&mut dash, WAIT, |d| d.get_field("M", "Reading").unwrap() == "0"));

    let script = ScriptHost::default()
        .load_automation(
            r#"
            schedule_await_condition(|dash| dash.get_field("M", "Reading") == "3", "three polls");
            schedule_function(|dash| dash.set_field("M", "Setpoint", "done", false));
            "#,
            "await",
            &dash,
        )
        .unwrap();
    let mut scheduler = AutomationScheduler::new(TICK);
    scheduler.load(script, &dash).unwrap();

    let mut poller = PollDispatcher::new(TICK);
    let t0 = Instant::now();
    poller.start(t0);
    scheduler.start(t0, true).unwrap();

    for cycle in 1..=3u64 {
        let now = t0 + TICK * (cycle as u32 - 1);
        scheduler.tick(now, &mut dash);
        assert!(scheduler.is_awaiting());
        assert_eq!(scheduler.index(), 0);

        poller.tick(now, &mut dash);
        let expected = cycle.to_string();
        assert!(wait_until(&mut dash, WAIT, |d| d.get_field("M", "Reading").unwrap() == expected));
    }

    scheduler.tick(t0 + TICK * 3, &mut dash);
    assert_eq!(dash.get_field("M", "Setpoint").unwrap(), "done");
    assert_eq!(scheduler.state(), AutomationState::Finished);
}

#[test]
fn test_failing_steps_do_not_stop_the_script() {
    let (mut dash, _calls) = dashboard();
    let _controller = launch_and_open(&mut dash);

    let script = ScriptBuilder::new()
        .named("mixed")
        .function(|_| Err(anyhow::anyhow!("valve stuck")))
        .delay(Duration::from_secs(2))
        .set_field("M", "Setpoint", "7", false)
        .build();
    let mut scheduler = AutomationScheduler::new(TICK).with_step_logging(true);
    scheduler.load(script, &dash).unwrap();
    let t0 = Instant::now();
    scheduler.start(t0, true).unwrap();

    scheduler.tick(t0, &mut dash);
    assert_eq!(scheduler.log_data(), vec![("Step".to_string(), "1".to_string())]);
    scheduler.tick(t0 + Duration::from_secs(2), &mut dash);

    assert_eq!(dash.get_field("M", "Setpoint").unwrap(), "7");
    let reports = dash.reporter().recent_from(ErrorSource::Automation);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].message.contains("valve stuck"));
}

#[test]
fn test_script_with_unknown_target_is_rejected() {
    let (dash, _calls) = dashboard();
    let host = ScriptHost::default();
    let err = host
        .load_automation(r#"schedule_action("Nope", "Setpoint", 1);"#, "bad", &dash)
        .unwrap_err();
    assert!(err.to_string().contains("Nope"));
}
