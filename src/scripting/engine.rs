//! Rhai script host.
//!
//! Two jobs: turning an automation file into a [`Script`], and evaluating one-off code sent by
//! remote clients (`eval`/`exec`). Both run on the foreground loop against a
//! [`DashboardView`]; recorded writes are applied to the live dashboard when the call returns.
//!
//! # Automation files
//!
//! Running the file records steps; it does not perform them:
//!
//! ```rhai
//! schedule_delay("0:00:05");
//! schedule_action("MFC 1", "Setpoint Entry", 20);
//! schedule_await_condition(|dash| dash.get_field("TC", "Temperature").parse_float() > 300.0,
//!                          "reactor above 300 C");
//! schedule_function(|| print("holding"));
//! schedule_delay(600);
//! schedule_action("MFC 1", "Setpoint Entry", 0);
//! ```
//!
//! Closures declared with no parameters are called with none; otherwise they receive the
//! dashboard view.
//!
//! # Safety Limits
//!
//! Every evaluation is capped at a configurable number of operations.

use crate::automation::script::{parse_hms, Script, ScriptBuilder};
use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use crate::scripting::bindings::{register_dashboard, runtime_error, DashboardView};
use anyhow::anyhow;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Scope, AST};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Target of `print` output from scripts.
pub const SCRIPT_TARGET: &str = "daq_panel::script";

/// Operation cap used when none is configured.
pub const DEFAULT_MAX_OPERATIONS: u64 = 100_000;

type ViewSlot = Arc<Mutex<Option<DashboardView>>>;

enum Recorded {
    Delay(Duration),
    Action {
        widget: String,
        field: String,
        value: String,
        confirm: bool,
    },
    Function(FnPtr),
    Await(FnPtr, String),
}

#[derive(Default)]
struct Recording {
    steps: Vec<Recorded>,
    closed: bool,
}

type SharedRecording = Arc<Mutex<Recording>>;

/// Embedded Rhai interpreter bound to the dashboard.
pub struct ScriptHost {
    max_operations: u64,
    engine: Engine,
    current: ViewSlot,
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPERATIONS)
    }
}

impl ScriptHost {
    /// Host whose scripts stop after `max_operations` Rhai operations.
    pub fn new(max_operations: u64) -> Self {
        let current = ViewSlot::default();
        let engine = base_engine(max_operations, current.clone());
        Self {
            max_operations,
            engine,
            current,
        }
    }

    /// Check a script compiles, without running it.
    pub fn validate_script(&self, source: &str) -> AppResult<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| PanelError::Script(e.to_string()))
    }

    /// Evaluate `code` and return its value as text (empty for unit).
    pub fn eval(&self, code: &str, dashboard: &mut Dashboard) -> AppResult<String> {
        let value = self.run_console(code, dashboard)?;
        Ok(if value.is_unit() {
            String::new()
        } else {
            value.to_string()
        })
    }

    /// Run `code` for its effects.
    pub fn exec(&self, code: &str, dashboard: &mut Dashboard) -> AppResult<String> {
        self.run_console(code, dashboard)?;
        Ok("Success".to_string())
    }

    fn run_console(&self, code: &str, dashboard: &mut Dashboard) -> AppResult<Dynamic> {
        let view = DashboardView::capture(dashboard);
        *self.current.lock() = Some(view.clone());

        let mut scope = Scope::new();
        scope.push("dashboard", view.clone());
        let result = self.engine.eval_with_scope::<Dynamic>(&mut scope, code);

        *self.current.lock() = None;
        view.apply(dashboard)?;
        result.map_err(|e| PanelError::Script(describe(*e)))
    }

    /// Run an automation file and return the steps it scheduled.
    ///
    /// `schedule_action` targets are checked against `dashboard` as they are recorded; any
    /// parse error, runtime error or bad target rejects the whole file.
    pub fn load_automation(
        &self,
        source: &str,
        name: &str,
        dashboard: &Dashboard,
    ) -> AppResult<Script> {
        let current = ViewSlot::default();
        let recording = SharedRecording::default();
        let targets = DashboardView::capture(dashboard).read_only();

        let mut engine = base_engine(self.max_operations, current.clone());
        register_recorder(&mut engine, recording.clone(), targets.clone());

        let ast = engine
            .compile(source)
            .map_err(|e| PanelError::Script(format!("{}: {}", name, e)))?;

        *current.lock() = Some(targets);
        let run = engine.run_ast(&ast);
        *current.lock() = None;
        run.map_err(|e| PanelError::Script(format!("{}: {}", name, describe(*e))))?;

        let recorded = {
            let mut recording = recording.lock();
            recording.closed = true;
            std::mem::take(&mut recording.steps)
        };

        let compiled = Arc::new(CompiledScript {
            engine,
            ast,
            current,
        });
        let mut builder = ScriptBuilder::new().named(name);
        for step in recorded {
            builder = match step {
                Recorded::Delay(delay) => builder.delay(delay),
                Recorded::Action {
                    widget,
                    field,
                    value,
                    confirm,
                } => builder.set_field(widget, field, value, confirm),
                Recorded::Function(f) => {
                    let script = compiled.clone();
                    let takes_view = compiled.takes_view(&f);
                    builder.function(move |dash| script.run_step(&f, takes_view, dash))
                }
                Recorded::Await(f, description) => {
                    let script = compiled.clone();
                    let takes_view = compiled.takes_view(&f);
                    builder.await_condition(description, move |dash| {
                        script.check_condition(&f, takes_view, dash)
                    })
                }
            };
        }

        let script = builder.build();
        script.validate(dashboard)?;
        info!(
            "Loaded script '{}': {} steps, {}",
            name,
            script.len(),
            crate::automation::format_hms(script.total_duration())
        );
        Ok(script)
    }
}

/// A loaded automation file whose closures are still callable.
struct CompiledScript {
    engine: Engine,
    ast: AST,
    current: ViewSlot,
}

impl CompiledScript {
    /// Whether `f` declares a parameter for the dashboard view.
    fn takes_view(&self, f: &FnPtr) -> bool {
        self.ast
            .iter_functions()
            .find(|meta| meta.name == f.fn_name())
            .map(|meta| meta.params.len().saturating_sub(f.curry().len()) > 0)
            .unwrap_or(true)
    }

    fn call(&self, f: &FnPtr, takes_view: bool, view: &DashboardView) -> anyhow::Result<Dynamic> {
        *self.current.lock() = Some(view.clone());
        let result = if takes_view {
            f.call::<Dynamic>(&self.engine, &self.ast, (view.clone(),))
        } else {
            f.call::<Dynamic>(&self.engine, &self.ast, ())
        };
        *self.current.lock() = None;
        result.map_err(|e| anyhow!("{}", describe(*e)))
    }

    fn run_step(&self, f: &FnPtr, takes_view: bool, dashboard: &mut Dashboard) -> anyhow::Result<()> {
        let view = DashboardView::capture(dashboard);
        let result = self.call(f, takes_view, &view);
        view.apply(dashboard)?;
        result.map(|_| ())
    }

    fn check_condition(
        &self,
        f: &FnPtr,
        takes_view: bool,
        dashboard: &Dashboard,
    ) -> anyhow::Result<bool> {
        let view = DashboardView::capture(dashboard).read_only();
        let value = self.call(f, takes_view, &view)?;
        value
            .as_bool()
            .map_err(|type_name| anyhow!("await condition returned {}, not a bool", type_name))
    }
}

/// Error text, keeping the reason a script was terminated.
fn describe(err: EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorTerminated(reason, pos) => format!("{} ({})", reason, pos),
        other => other.to_string(),
    }
}

fn base_engine(max_operations: u64, current: ViewSlot) -> Engine {
    let mut engine = Engine::new();

    engine.on_progress(move |count| {
        if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
        } else {
            None
        }
    });
    engine.on_print(|text| info!(target: SCRIPT_TARGET, "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(target: SCRIPT_TARGET, "{} @ {:?} {}", text, source, pos)
    });

    register_dashboard(&mut engine);
    engine.register_fn(
        "get_dashboard",
        move || -> Result<DashboardView, Box<EvalAltResult>> {
            current
                .lock()
                .clone()
                .ok_or_else(|| runtime_error("no dashboard is available here"))
        },
    );
    engine
}

fn register_recorder(engine: &mut Engine, recording: SharedRecording, targets: DashboardView) {
    fn push(recording: &SharedRecording, step: Recorded) -> Result<(), Box<EvalAltResult>> {
        let mut recording = recording.lock();
        if recording.closed {
            return Err(runtime_error(
                "steps can only be scheduled while the script is loading",
            ));
        }
        recording.steps.push(step);
        Ok(())
    }

    let rec = recording.clone();
    engine.register_fn(
        "schedule_delay",
        move |delay: &str| -> Result<(), Box<EvalAltResult>> {
            let delay = parse_hms(delay).map_err(runtime_error)?;
            push(&rec, Recorded::Delay(delay))
        },
    );

    let rec = recording.clone();
    engine.register_fn(
        "schedule_delay",
        move |seconds: i64| -> Result<(), Box<EvalAltResult>> {
            let seconds = u64::try_from(seconds)
                .map_err(|_| runtime_error(format!("delay must not be negative: {}", seconds)))?;
            push(&rec, Recorded::Delay(Duration::from_secs(seconds)))
        },
    );

    let schedule_action = {
        let rec = recording.clone();
        move |widget: &str, field: &str, value: Dynamic, confirm: bool| {
            if !targets.has_field(widget, field) {
                return Err(runtime_error(format!(
                    "cannot schedule action on unknown field '{}' of '{}'",
                    field, widget
                )));
            }
            push(
                &rec,
                Recorded::Action {
                    widget: widget.to_string(),
                    field: field.to_string(),
                    value: value.to_string(),
                    confirm,
                },
            )
        }
    };
    let action = schedule_action.clone();
    engine.register_fn(
        "schedule_action",
        move |widget: &str, field: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            action(widget, field, value, true)
        },
    );
    engine.register_fn(
        "schedule_action",
        move |widget: &str,
              field: &str,
              value: Dynamic,
              confirm: bool|
              -> Result<(), Box<EvalAltResult>> {
            schedule_action(widget, field, value, confirm)
        },
    );

    let rec = recording.clone();
    engine.register_fn(
        "schedule_function",
        move |f: FnPtr| -> Result<(), Box<EvalAltResult>> { push(&rec, Recorded::Function(f)) },
    );

    let rec = recording.clone();
    engine.register_fn(
        "schedule_await_condition",
        move |f: FnPtr| -> Result<(), Box<EvalAltResult>> {
            let description = if f.is_anonymous() {
                "unnamed condition".to_string()
            } else {
                format!("{}()", f.fn_name())
            };
            push(&rec, Recorded::Await(f, description))
        },
    );

    let rec = recording;
    engine.register_fn(
        "schedule_await_condition",
        move |f: FnPtr, description: &str| -> Result<(), Box<EvalAltResult>> {
            push(&rec, Recorded::Await(f, description.to_string()))
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::script::Action;
    use crate::devices::mock::MockDevice;
    use crate::widget::WidgetSpec;

    fn dashboard() -> Dashboard {
        let mut dash = Dashboard::new("Test");
        dash.add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())))
            .unwrap();
        dash
    }

    #[test]
    fn eval_returns_value_and_applies_writes() {
        let mut dash = dashboard();
        let host = ScriptHost::default();
        assert_eq!(host.eval("40 + 2", &mut dash).unwrap(), "42");
        assert_eq!(
            host.eval(r#"get_dashboard().get_field("A", "Reading")"#, &mut dash)
                .unwrap(),
            "No Reading"
        );
        assert_eq!(
            host.exec(
                r#"dashboard.set_field("A", "Setpoint", "5", false);"#,
                &mut dash
            )
            .unwrap(),
            "Success"
        );
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "5");
        assert_eq!(host.eval("let x = 1;", &mut dash).unwrap(), "");
    }

    #[test]
    fn eval_errors_and_runaway_loops_are_script_errors() {
        let mut dash = dashboard();
        let host = ScriptHost::new(1_000);
        assert!(matches!(
            host.eval("undefined_function()", &mut dash),
            Err(PanelError::Script(_))
        ));
        let err = host.exec("loop { }", &mut dash).unwrap_err();
        assert!(err.to_string().contains("Safety limit"));
        assert!(host.validate_script("let x = ;").is_err());
    }

    #[test]
    fn automation_file_records_steps() {
        let dash = dashboard();
        let host = ScriptHost::default();
        let script = host
            .load_automation(
                r#"
                    schedule_delay("0:00:05");
                    schedule_action("A", "Setpoint", 1);
                    schedule_delay(3);
                    schedule_action("A", "Setpoint", "2", false);
                    schedule_await_condition(|| true, "always");
                    schedule_function(|dash| dash.set_field("A", "Setpoint", "3"));
                "#,
                "demo",
                &dash,
            )
            .unwrap();

        assert_eq!(script.name(), Some("demo"));
        assert_eq!(script.len(), 4);
        assert_eq!(script.total_duration(), Duration::from_secs(8));
        match &script.steps()[0].action {
            Action::SetField { value, confirm, .. } => {
                assert_eq!(value, "1");
                assert!(*confirm);
            }
            other => panic!("unexpected first step {:?}", other),
        }
        assert_eq!(script.last_await_index(), Some(2));
    }

    #[test]
    fn bad_targets_and_parse_errors_reject_the_file() {
        let dash = dashboard();
        let host = ScriptHost::default();
        let err = host
            .load_automation(r#"schedule_action("A", "Voltage", 1);"#, "bad", &dash)
            .unwrap_err();
        assert!(err.to_string().contains("Voltage"));
        assert!(host
            .load_automation("schedule_delay(", "broken", &dash)
            .is_err());
        assert!(host
            .load_automation(r#"schedule_delay("five");"#, "broken", &dash)
            .is_err());
    }

    #[test]
    fn recorded_closures_run_against_live_dashboard() {
        let mut dash = dashboard();
        let host = ScriptHost::default();
        let script = host
            .load_automation(
                r#"
                    let target = "7";
                    schedule_function(|dash| dash.set_field("A", "Setpoint", target, false));
                    schedule_await_condition(|dash| dash.get_field("A", "Setpoint") == "7");
                    schedule_await_condition(|| 5, "not a bool");
                "#,
                "closures",
                &dash,
            )
            .unwrap();

        let (_, mut steps) = script.into_steps();
        let Action::RunFunction(f) = &mut steps[0].action else {
            panic!("expected a function step");
        };
        f(&mut dash).unwrap();
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "7");

        let Action::AwaitCondition { predicate, .. } = &mut steps[1].action else {
            panic!("expected an await step");
        };
        assert!(predicate(&dash).unwrap());

        let Action::AwaitCondition { predicate, .. } = &mut steps[2].action else {
            panic!("expected an await step");
        };
        assert!(predicate(&dash).is_err());
    }
}
