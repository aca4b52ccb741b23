//! Dashboard bindings for Rhai scripts.
//!
//! Rhai code never holds the live [`Dashboard`]. Each call into a script gets a
//! [`DashboardView`]: a copy of every widget's fields plus a log of the writes and confirms the
//! script asked for. The log is replayed onto the live dashboard once the call returns, on the
//! foreground loop.
//!
//! # Script Example
//!
//! ```rhai
//! let dash = get_dashboard();
//! if dash.get_field("TC", "Temperature") == "Read Error" {
//!     dash.set_field("Heater", "Status Selection", "Off");
//! }
//! print(dash.nicknames());
//! ```

use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position};
use std::sync::Arc;

/// Write requested by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOp {
    /// `set_field(widget, field, value, confirm)`
    Set {
        /// Widget nickname
        widget: String,
        /// Field name
        field: String,
        /// New value
        value: String,
        /// Queue a CONFIRM after the write
        confirm: bool,
    },
    /// `confirm(widget)`
    Confirm {
        /// Widget nickname
        widget: String,
    },
}

#[derive(Debug, Default)]
struct ViewState {
    connected: bool,
    widgets: Vec<(String, Vec<(String, String)>)>,
    ops: Vec<ViewOp>,
    read_only: bool,
}

impl ViewState {
    // Newest widget wins, as on the dashboard
    fn widget(&self, nickname: &str) -> Option<&Vec<(String, String)>> {
        self.widgets
            .iter()
            .rev()
            .find(|(n, _)| n == nickname)
            .map(|(_, fields)| fields)
    }

    fn widget_mut(&mut self, nickname: &str) -> Option<&mut Vec<(String, String)>> {
        self.widgets
            .iter_mut()
            .rev()
            .find(|(n, _)| n == nickname)
            .map(|(_, fields)| fields)
    }
}

/// The dashboard as seen from a Rhai script.
#[derive(Debug, Clone, Default)]
pub struct DashboardView {
    state: Arc<Mutex<ViewState>>,
}

impl DashboardView {
    /// Copy the current fields of every widget.
    pub fn capture(dashboard: &Dashboard) -> Self {
        let widgets = dashboard
            .widgets()
            .iter()
            .map(|w| {
                let fields = w
                    .fields()
                    .iter()
                    .map(|f| (f.name.clone(), f.value.clone()))
                    .collect();
                (w.nickname().to_string(), fields)
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(ViewState {
                connected: dashboard.is_connected(),
                widgets,
                ops: Vec::new(),
                read_only: false,
            })),
        }
    }

    /// A view that rejects writes.
    pub fn read_only(self) -> Self {
        self.state.lock().read_only = true;
        self
    }

    /// Connection state when the view was taken.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Widget nicknames in dashboard order.
    pub fn nicknames(&self) -> Vec<String> {
        self.state
            .lock()
            .widgets
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Field names of a widget, in declaration order.
    pub fn fields(&self, nickname: &str) -> AppResult<Vec<String>> {
        let state = self.state.lock();
        let fields = state
            .widget(nickname)
            .ok_or_else(|| PanelError::UnknownWidget(nickname.to_string()))?;
        Ok(fields.iter().map(|(name, _)| name.clone()).collect())
    }

    /// Whether the widget exists and has the field.
    pub fn has_field(&self, nickname: &str, field: &str) -> bool {
        let state = self.state.lock();
        state
            .widget(nickname)
            .map(|fields| fields.iter().any(|(name, _)| name == field))
            .unwrap_or(false)
    }

    /// Field value, including writes this script already made.
    pub fn get_field(&self, nickname: &str, field: &str) -> AppResult<String> {
        let state = self.state.lock();
        let fields = state
            .widget(nickname)
            .ok_or_else(|| PanelError::UnknownWidget(nickname.to_string()))?;
        fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| PanelError::UnknownField {
                widget: nickname.to_string(),
                field: field.to_string(),
            })
    }

    /// Record a write. Later reads through this view see the new value.
    pub fn set_field(
        &self,
        nickname: &str,
        field: &str,
        value: impl Into<String>,
        confirm: bool,
    ) -> AppResult<()> {
        let value = value.into();
        let mut state = self.state.lock();
        if state.read_only {
            return Err(read_only_error());
        }
        let fields = state
            .widget_mut(nickname)
            .ok_or_else(|| PanelError::UnknownWidget(nickname.to_string()))?;
        let slot = fields
            .iter_mut()
            .find(|(name, _)| name == field)
            .ok_or_else(|| PanelError::UnknownField {
                widget: nickname.to_string(),
                field: field.to_string(),
            })?;
        slot.1 = value.clone();
        state.ops.push(ViewOp::Set {
            widget: nickname.to_string(),
            field: field.to_string(),
            value,
            confirm,
        });
        Ok(())
    }

    /// Record a confirm for the widget.
    pub fn confirm(&self, nickname: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(read_only_error());
        }
        if state.widget(nickname).is_none() {
            return Err(PanelError::UnknownWidget(nickname.to_string()));
        }
        state.ops.push(ViewOp::Confirm {
            widget: nickname.to_string(),
        });
        Ok(())
    }

    /// Writes recorded so far, in order.
    pub fn pending_ops(&self) -> Vec<ViewOp> {
        self.state.lock().ops.clone()
    }

    /// Replay the recorded writes onto the live dashboard.
    ///
    /// Every write is attempted; the first failure is returned.
    pub fn apply(&self, dashboard: &mut Dashboard) -> AppResult<()> {
        let ops = std::mem::take(&mut self.state.lock().ops);
        let mut first_error = None;
        for op in ops {
            let result = match op {
                ViewOp::Set {
                    widget,
                    field,
                    value,
                    confirm,
                } => dashboard.set_field(&widget, &field, value, confirm),
                ViewOp::Confirm { widget } => dashboard.confirm(&widget),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn read_only_error() -> PanelError {
    PanelError::Script("the dashboard cannot be changed while a script is loading".to_string())
}

pub(crate) fn runtime_error(message: impl std::fmt::Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        message.to_string().into(),
        Position::NONE,
    ))
}

/// Register the `Dashboard` type and its methods.
///
/// - `dash.get_field(nickname, field)`
/// - `dash.set_field(nickname, field, value[, confirm])` (confirm defaults to true)
/// - `dash.confirm(nickname)`
/// - `dash.nicknames()`, `dash.fields(nickname)`, `dash.is_connected()`
pub fn register_dashboard(engine: &mut Engine) {
    engine.register_type_with_name::<DashboardView>("Dashboard");

    engine.register_fn(
        "get_field",
        |view: &mut DashboardView, nickname: &str, field: &str| -> Result<String, Box<EvalAltResult>> {
            view.get_field(nickname, field).map_err(runtime_error)
        },
    );

    engine.register_fn(
        "set_field",
        |view: &mut DashboardView,
         nickname: &str,
         field: &str,
         value: Dynamic|
         -> Result<(), Box<EvalAltResult>> {
            view.set_field(nickname, field, value.to_string(), true)
                .map_err(runtime_error)
        },
    );

    engine.register_fn(
        "set_field",
        |view: &mut DashboardView,
         nickname: &str,
         field: &str,
         value: Dynamic,
         confirm: bool|
         -> Result<(), Box<EvalAltResult>> {
            view.set_field(nickname, field, value.to_string(), confirm)
                .map_err(runtime_error)
        },
    );

    engine.register_fn(
        "confirm",
        |view: &mut DashboardView, nickname: &str| -> Result<(), Box<EvalAltResult>> {
            view.confirm(nickname).map_err(runtime_error)
        },
    );

    engine.register_fn("nicknames", |view: &mut DashboardView| -> Array {
        view.nicknames().into_iter().map(Dynamic::from).collect()
    });

    engine.register_fn(
        "fields",
        |view: &mut DashboardView, nickname: &str| -> Result<Array, Box<EvalAltResult>> {
            let fields = view.fields(nickname).map_err(runtime_error)?;
            Ok(fields.into_iter().map(Dynamic::from).collect())
        },
    );

    engine.register_fn("is_connected", |view: &mut DashboardView| view.is_connected());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockDevice;
    use crate::widget::WidgetSpec;
    use rhai::Scope;

    fn dashboard() -> Dashboard {
        let mut dash = Dashboard::new("Test");
        dash.add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())))
            .unwrap();
        dash
    }

    #[test]
    fn writes_are_visible_then_applied() {
        let mut dash = dashboard();
        let view = DashboardView::capture(&dash);
        view.set_field("A", "Setpoint", "4", false).unwrap();
        assert_eq!(view.get_field("A", "Setpoint").unwrap(), "4");
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "0");

        view.apply(&mut dash).unwrap();
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "4");
        assert!(view.pending_ops().is_empty());
    }

    #[test]
    fn read_only_view_rejects_writes() {
        let dash = dashboard();
        let view = DashboardView::capture(&dash).read_only();
        assert!(view.set_field("A", "Setpoint", "1", true).is_err());
        assert!(view.confirm("A").is_err());
        assert_eq!(view.get_field("A", "Reading").unwrap(), "No Reading");
    }

    #[test]
    fn script_methods_are_registered() {
        let mut dash = dashboard();
        let mut engine = Engine::new();
        register_dashboard(&mut engine);

        let view = DashboardView::capture(&dash);
        let mut scope = Scope::new();
        scope.push("dash", view.clone());
        let count = engine
            .eval_with_scope::<i64>(
                &mut scope,
                r#"
                    dash.set_field("A", "Setpoint", 2.5, false);
                    dash.confirm("A");
                    if dash.is_connected() { 99 } else { dash.fields("A").len() }
                "#,
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(view.pending_ops().len(), 2);

        view.apply(&mut dash).unwrap();
        assert_eq!(dash.get_field("A", "Setpoint").unwrap(), "2.5");
    }

    #[test]
    fn unknown_field_is_a_script_error() {
        let dash = dashboard();
        let mut engine = Engine::new();
        register_dashboard(&mut engine);
        let mut scope = Scope::new();
        scope.push("dash", DashboardView::capture(&dash));
        let err = engine
            .eval_with_scope::<Dynamic>(&mut scope, r#"dash.get_field("A", "Nope")"#)
            .unwrap_err();
        assert!(err.to_string().contains("Nope"));
    }
}
