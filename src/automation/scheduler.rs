//! Automation scheduler.
//!
//! Runs a loaded [`Script`] against the dashboard on the foreground loop. Every step has an
//! absolute deadline computed when the run starts; a tick executes every step whose deadline
//! has passed. An await step that is not yet satisfied pushes its own deadline and every later
//! one forward by one tick, so the rest of the script keeps its relative timing.

use crate::automation::script::{format_hms, Action, Script, Step};
use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use crate::reporter::ErrorSource;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of the automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationState {
    /// Nothing loaded, or rewound
    Stopped,
    /// Running steps
    Running,
    /// Paused mid-script; remaining delays are kept
    Paused,
    /// Every step has run
    Finished,
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutomationState::Stopped => "Stopped",
            AutomationState::Running => "Running",
            AutomationState::Paused => "Paused",
            AutomationState::Finished => "(finished!)",
        };
        f.write_str(s)
    }
}

/// Snapshot of the scheduler for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationStatus {
    /// Run state
    pub state: AutomationState,
    /// An await is unresolved
    pub awaiting: bool,
    /// Steps that have fired
    pub steps_done: usize,
    /// Steps in the loaded script
    pub total_steps: usize,
    /// Time until the next step fires
    pub time_to_next: Duration,
    /// Time until the last step fires
    pub time_remaining: Duration,
    /// An unresolved await lies ahead, so the remaining time can only grow
    pub remaining_is_lower_bound: bool,
    /// Name of the loaded script
    pub script_name: Option<String>,
}

impl AutomationStatus {
    /// `n/m steps done.`
    pub fn steps_readout(&self) -> String {
        format!("{}/{} steps done.", self.steps_done, self.total_steps)
    }

    /// Countdown to the next step, or `(awaiting condition)`.
    pub fn next_action_readout(&self) -> String {
        if self.awaiting {
            "(awaiting condition)".to_string()
        } else {
            format_hms(self.time_to_next)
        }
    }

    /// Countdown to the end, prefixed with `≥` when an await lies ahead.
    pub fn remaining_readout(&self) -> String {
        let remaining = format_hms(self.time_remaining);
        if self.remaining_is_lower_bound {
            format!("≥{}", remaining)
        } else {
            remaining
        }
    }
}

/// Runs a [`Script`] against the dashboard, one due step per tick.
pub struct AutomationScheduler {
    tick_interval: Duration,
    step_logging: bool,
    name: Option<String>,
    steps: Vec<Step>,
    index: usize,
    deadlines: Vec<Instant>,
    end_time: Option<Instant>,
    state: AutomationState,
    awaiting: bool,
    skip_requested: bool,
    await_announced: bool,
    await_error_reported: bool,
    time_to_next: Duration,
    time_remaining: Duration,
    last_await_index: Option<usize>,
    next_tick: Option<Instant>,
}

impl AutomationScheduler {
    /// Empty scheduler that wakes every `tick_interval` while awaiting.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            step_logging: false,
            name: None,
            steps: Vec::new(),
            index: 0,
            deadlines: Vec::new(),
            end_time: None,
            state: AutomationState::Stopped,
            awaiting: false,
            skip_requested: false,
            await_announced: false,
            await_error_reported: false,
            time_to_next: Duration::ZERO,
            time_remaining: Duration::ZERO,
            last_await_index: None,
            next_tick: None,
        }
    }

    /// Record the step index with every data log row.
    pub fn with_step_logging(mut self, enabled: bool) -> Self {
        self.step_logging = enabled;
        self
    }

    /// Current run state.
    pub fn state(&self) -> AutomationState {
        self.state
    }

    /// Index of the next step to fire.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether an await is unresolved.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    /// Whether a script with at least one step is loaded.
    pub fn is_loaded(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Replace the loaded script. Rejected while a run is in progress.
    ///
    /// On error the previously loaded script is kept untouched.
    pub fn load(&mut self, script: Script, dashboard: &Dashboard) -> AppResult<()> {
        if matches!(
            self.state,
            AutomationState::Running | AutomationState::Paused
        ) {
            return Err(PanelError::Script(
                "stop the current script before loading another".to_string(),
            ));
        }
        script.validate(dashboard)?;

        self.last_await_index = script.last_await_index();
        let (name, steps) = script.into_steps();
        info!(
            "Loaded automation script '{}' with {} steps",
            name.as_deref().unwrap_or("unnamed"),
            steps.len()
        );
        self.name = name;
        self.steps = steps;
        self.state = AutomationState::Stopped;
        self.rewind();
        Ok(())
    }

    /// Start, or resume after a pause.
    pub fn start(&mut self, now: Instant, connected: bool) -> AppResult<()> {
        if self.steps.is_empty() {
            return Err(PanelError::Script("no script is loaded".to_string()));
        }
        if !connected {
            return Err(PanelError::NotConnected);
        }
        if self.state == AutomationState::Running {
            return Ok(());
        }

        self.deadlines.clear();
        let mut at = now;
        for (i, step) in self.steps.iter().enumerate() {
            if i == self.index {
                at = now + self.time_to_next;
            } else if i > self.index {
                at += step.delay;
            }
            self.deadlines.push(if i < self.index { now } else { at });
        }
        self.end_time = self.deadlines.last().copied();

        self.state = AutomationState::Running;
        self.skip_requested = false;
        self.await_announced = false;
        self.await_error_reported = false;
        self.next_tick = Some(now);
        info!("Automation running from step {}", self.index + 1);
        Ok(())
    }

    /// Pause. Delays resume from where they were.
    pub fn pause(&mut self, now: Instant) {
        if self.state != AutomationState::Running {
            return;
        }
        if let Some(deadline) = self.deadlines.get(self.index) {
            self.time_to_next = deadline.saturating_duration_since(now);
        }
        if let Some(end) = self.end_time {
            self.time_remaining = end.saturating_duration_since(now);
        }
        self.state = AutomationState::Paused;
        self.next_tick = None;
        info!("Automation paused at step {}", self.index + 1);
    }

    /// Stop and rewind to the first step.
    pub fn stop(&mut self) {
        if self.state != AutomationState::Stopped {
            info!("Automation stopped");
        }
        self.state = AutomationState::Stopped;
        self.rewind();
    }

    /// Move past the current wait: ends an await, or fires the next step now.
    pub fn skip(&mut self) {
        if self.state == AutomationState::Running {
            self.skip_requested = true;
            info!("Skip requested");
        } else {
            debug!("Skip ignored; automation is {}", self.state);
        }
    }

    /// Whether a tick is due at `now`.
    pub fn due(&self, now: Instant) -> bool {
        self.state == AutomationState::Running && matches!(self.next_tick, Some(at) if now >= at)
    }

    /// Execute every due step.
    pub fn tick(&mut self, now: Instant, dashboard: &mut Dashboard) {
        if self.state != AutomationState::Running {
            return;
        }

        if self.skip_requested && !self.awaiting {
            self.skip_requested = false;
            if let Some(&deadline) = self.deadlines.get(self.index) {
                let shift = deadline.saturating_duration_since(now);
                for d in &mut self.deadlines[self.index..] {
                    *d -= shift;
                }
                if let Some(end) = self.end_time.as_mut() {
                    *end -= shift;
                }
                info!("Skipped ahead to step {}", self.index + 1);
            }
        }

        let reporter = dashboard.reporter().clone();
        while self.index < self.steps.len() && now >= self.deadlines[self.index] {
            let index = self.index;
            let advanced = match &mut self.steps[index].action {
                Action::AwaitCondition {
                    predicate,
                    description,
                } => {
                    let satisfied = match predicate(&*dashboard) {
                        Ok(value) => {
                            self.await_error_reported = false;
                            value
                        }
                        Err(e) => {
                            if !self.await_error_reported {
                                let err = e.context(PanelError::Await(description.clone()));
                                reporter.report(ErrorSource::AwaitCondition, None, &err);
                            }
                            self.await_error_reported = true;
                            false
                        }
                    };
                    if satisfied {
                        info!("Condition met, proceeding: {}", description);
                        true
                    } else if self.skip_requested {
                        info!("Proceeding past await with skip: {}", description);
                        true
                    } else {
                        if !self.await_announced {
                            info!("Awaiting condition: {}", description);
                            self.await_announced = true;
                        }
                        false
                    }
                }
                Action::SetField {
                    widget,
                    field,
                    value,
                    confirm,
                } => {
                    if let Err(e) = apply_set_field(dashboard, widget, field, value, *confirm) {
                        reporter.report(
                            ErrorSource::Automation,
                            Some(widget.as_str()),
                            &anyhow::Error::from(e),
                        );
                    }
                    true
                }
                Action::RunFunction(f) => {
                    if let Err(e) = f(&mut *dashboard) {
                        reporter.report(ErrorSource::Automation, None, &e);
                    }
                    true
                }
            };

            if advanced {
                self.awaiting = false;
                self.skip_requested = false;
                self.await_announced = false;
                self.await_error_reported = false;
                self.index += 1;
            } else {
                self.awaiting = true;
                for d in &mut self.deadlines[index..] {
                    *d += self.tick_interval;
                }
                if let Some(end) = self.end_time.as_mut() {
                    *end += self.tick_interval;
                }
                break;
            }
        }

        if self.index >= self.steps.len() {
            info!("Automation script finished");
            self.state = AutomationState::Finished;
            self.rewind();
            return;
        }

        let deadline = self.deadlines[self.index];
        self.time_to_next = deadline.saturating_duration_since(now);
        self.time_remaining = self
            .end_time
            .map(|end| end.saturating_duration_since(now))
            .unwrap_or_default();
        let next = now + self.tick_interval;
        self.next_tick = Some(if self.awaiting { next } else { next.min(deadline) });
    }

    /// Snapshot for display.
    pub fn status(&self) -> AutomationStatus {
        AutomationStatus {
            state: self.state,
            awaiting: self.awaiting,
            steps_done: self.index,
            total_steps: self.steps.len(),
            time_to_next: self.time_to_next,
            time_remaining: self.time_remaining,
            remaining_is_lower_bound: matches!(self.last_await_index, Some(i) if self.index <= i),
            script_name: self.name.clone(),
        }
    }

    /// Columns contributed to the data log.
    pub fn log_data(&self) -> Vec<(String, String)> {
        if self.step_logging {
            vec![("Step".to_string(), self.index.to_string())]
        } else {
            Vec::new()
        }
    }

    fn rewind(&mut self) {
        self.index = 0;
        self.deadlines.clear();
        self.end_time = None;
        self.awaiting = false;
        self.skip_requested = false;
        self.await_announced = false;
        self.await_error_reported = false;
        self.time_to_next = self.steps.first().map(|s| s.delay).unwrap_or_default();
        self.time_remaining = self.steps.iter().map(|s| s.delay).sum();
        self.next_tick = None;
    }
}

fn apply_set_field(
    dashboard: &mut Dashboard,
    widget: &str,
    field: &str,
    value: &str,
    confirm: bool,
) -> AppResult<()> {
    let previous = dashboard.get_field(widget, field)?;
    dashboard.set_field(widget, field, value, confirm)?;
    info!(
        "Automation changed {}.{} from \"{}\" to \"{}\"",
        widget, field, previous, value
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::script::ScriptBuilder;
    use crate::devices::mock::MockDevice;
    use crate::widget::WidgetSpec;

    const TICK: Duration = Duration::from_secs(1);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn connected_dashboard() -> Dashboard {
        let mut dash = Dashboard::new("Test");
        dash.add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())))
            .unwrap();
        dash.publish_connection(true);
        dash
    }

    fn setpoint(dash: &Dashboard) -> String {
        dash.get_field("A", "Setpoint").unwrap()
    }

    #[test]
    fn steps_fire_at_their_deadlines() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .delay(secs(5))
            .set_field("A", "Setpoint", "1", false)
            .delay(secs(3))
            .set_field("A", "Setpoint", "2", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        let mut last_remaining = Duration::MAX;
        for k in 0..=10 {
            scheduler.tick(t0 + secs(k), &mut dash);
            match k {
                0..=4 => assert_eq!(setpoint(&dash), "0", "t={k}"),
                5..=7 => assert_eq!(setpoint(&dash), "1", "t={k}"),
                _ => assert_eq!(setpoint(&dash), "2", "t={k}"),
            }
            if k < 8 {
                let remaining = scheduler.status().time_remaining;
                assert!(remaining < last_remaining, "remaining time must shrink");
                last_remaining = remaining;
            }
        }
        assert_eq!(scheduler.state(), AutomationState::Finished);
        assert_eq!(scheduler.index(), 0);
    }

    #[test]
    fn await_holds_until_skipped() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .await_condition("never", |_| Ok(false))
            .delay(secs(5))
            .set_field("A", "Setpoint", "x", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        for k in 0..3 {
            scheduler.tick(t0 + secs(k), &mut dash);
            assert_eq!(scheduler.index(), 0);
            assert!(scheduler.is_awaiting());
            assert!(scheduler.status().remaining_is_lower_bound);
            assert_eq!(scheduler.status().next_action_readout(), "(awaiting condition)");
        }

        scheduler.skip();
        scheduler.tick(t0 + secs(3), &mut dash);
        assert_eq!(scheduler.index(), 1);
        assert!(!scheduler.is_awaiting());
        scheduler.tick(t0 + secs(4), &mut dash);
        assert_eq!(scheduler.index(), 1);
        assert_eq!(setpoint(&dash), "0");

        scheduler.tick(t0 + secs(8), &mut dash);
        assert_eq!(setpoint(&dash), "x");
        assert_eq!(scheduler.state(), AutomationState::Finished);
    }

    #[test]
    fn await_proceeds_when_condition_holds() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .await_condition("setpoint raised", |d| Ok(d.get_field("A", "Setpoint")? == "7"))
            .set_field("A", "Reading", "done", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        scheduler.tick(t0, &mut dash);
        assert!(scheduler.is_awaiting());

        dash.set_field("A", "Setpoint", "7", false).unwrap();
        scheduler.tick(t0 + secs(1), &mut dash);
        assert_eq!(dash.get_field("A", "Reading").unwrap(), "done");
        assert_eq!(scheduler.state(), AutomationState::Finished);
    }

    #[test]
    fn pause_keeps_remaining_delay() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .delay(secs(5))
            .set_field("A", "Setpoint", "1", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        scheduler.tick(t0 + secs(1), &mut dash);
        scheduler.pause(t0 + secs(2));
        assert_eq!(scheduler.status().time_to_next, secs(3));
        assert!(!scheduler.due(t0 + secs(10)));

        scheduler.start(t0 + secs(10), true).unwrap();
        scheduler.tick(t0 + secs(12), &mut dash);
        assert_eq!(setpoint(&dash), "0");
        scheduler.tick(t0 + secs(13), &mut dash);
        assert_eq!(setpoint(&dash), "1");
    }

    #[test]
    fn skip_fires_next_step_now() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .delay(secs(60))
            .set_field("A", "Setpoint", "1", false)
            .delay(secs(10))
            .set_field("A", "Setpoint", "2", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        scheduler.tick(t0 + secs(1), &mut dash);
        scheduler.skip();
        scheduler.tick(t0 + secs(2), &mut dash);
        assert_eq!(setpoint(&dash), "1");
        // Later steps keep their spacing
        scheduler.tick(t0 + secs(11), &mut dash);
        assert_eq!(setpoint(&dash), "1");
        scheduler.tick(t0 + secs(12), &mut dash);
        assert_eq!(setpoint(&dash), "2");
    }

    #[test]
    fn failing_steps_are_reported_and_skipped() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .function(|_| Err(anyhow::anyhow!("valve stuck")))
            .set_field("A", "Setpoint", "after", false)
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        scheduler.start(Instant::now(), true).unwrap();
        scheduler.tick(Instant::now(), &mut dash);
        assert_eq!(setpoint(&dash), "after");
        let reports = dash.reporter().recent_from(ErrorSource::Automation);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("valve stuck"));
    }

    #[test]
    fn await_errors_are_reported_once() {
        let mut dash = connected_dashboard();
        let script = ScriptBuilder::new()
            .await_condition("broken", |_| Err(anyhow::anyhow!("no such sensor")))
            .build();
        let mut scheduler = AutomationScheduler::new(TICK);
        scheduler.load(script, &dash).unwrap();

        let t0 = Instant::now();
        scheduler.start(t0, true).unwrap();
        for k in 0..4 {
            scheduler.tick(t0 + secs(k), &mut dash);
        }
        assert!(scheduler.is_awaiting());
        assert_eq!(
            dash.reporter().recent_from(ErrorSource::AwaitCondition).len(),
            1
        );
    }

    #[test]
    fn start_requires_script_and_connection() {
        let dash = connected_dashboard();
        let mut scheduler = AutomationScheduler::new(TICK);
        assert!(matches!(
            scheduler.start(Instant::now(), true),
            Err(PanelError::Script(_))
        ));

        let script = ScriptBuilder::new().function(|_| Ok(())).build();
        scheduler.load(script, &dash).unwrap();
        assert!(matches!(
            scheduler.start(Instant::now(), false),
            Err(PanelError::NotConnected)
        ));
        assert_eq!(scheduler.state(), AutomationState::Stopped);
    }

    #[test]
    fn bad_load_keeps_previous_script() {
        let dash = connected_dashboard();
        let mut scheduler = AutomationScheduler::new(TICK);
        let good = ScriptBuilder::new()
            .delay(secs(2))
            .set_field("A", "Setpoint", "1", true)
            .build();
        scheduler.load(good, &dash).unwrap();

        let bad = ScriptBuilder::new().set_field("A", "Missing", "1", true).build();
        assert!(scheduler.load(bad, &dash).is_err());
        assert_eq!(scheduler.status().total_steps, 1);
        assert_eq!(scheduler.status().time_to_next, secs(2));
    }

    #[test]
    fn load_rejected_while_running() {
        let dash = connected_dashboard();
        let mut scheduler = AutomationScheduler::new(TICK);
        let script = ScriptBuilder::new().delay(secs(9)).function(|_| Ok(())).build();
        scheduler.load(script, &dash).unwrap();
        scheduler.start(Instant::now(), true).unwrap();

        let other = ScriptBuilder::new().function(|_| Ok(())).build();
        assert!(scheduler.load(other, &dash).is_err());

        scheduler.stop();
        assert_eq!(scheduler.state(), AutomationState::Stopped);
        assert_eq!(scheduler.status().time_remaining, secs(9));
    }

    #[test]
    fn readouts_and_step_logging() {
        let dash = connected_dashboard();
        let mut scheduler = AutomationScheduler::new(TICK).with_step_logging(true);
        let script = ScriptBuilder::new()
            .delay(secs(65))
            .function(|_| Ok(()))
            .build();
        scheduler.load(script, &dash).unwrap();

        let status = scheduler.status();
        assert_eq!(status.steps_readout(), "0/1 steps done.");
        assert_eq!(status.next_action_readout(), "0:01:05");
        assert_eq!(status.remaining_readout(), "0:01:05");
        assert_eq!(
            scheduler.log_data(),
            vec![("Step".to_string(), "0".to_string())]
        );
    }
}
