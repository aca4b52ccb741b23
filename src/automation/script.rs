//! Automation scripts as data.
//!
//! A [`Script`] is an ordered list of [`Step`]s, each waiting for a delay after the previous
//! step and then performing one [`Action`]. Scripts are built with [`ScriptBuilder`] in Rust
//! or loaded from Rhai files by [`crate::scripting::ScriptHost`].
//!
//! # Example
//!
//! ```rust,ignore
//! let script = ScriptBuilder::new()
//!     .delay_hms("0:00:05")?
//!     .set_field("MFC 1", "Setpoint Entry", "20", true)
//!     .await_condition("reactor above 300 C", |dash| {
//!         Ok(dash.get_field("TC", "Temperature")?.parse::<f64>().unwrap_or(0.0) > 300.0)
//!     })
//!     .delay(Duration::from_secs(600))
//!     .set_field("MFC 1", "Setpoint Entry", "0", true)
//!     .build();
//! ```

use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use std::fmt;
use std::time::Duration;

/// Step closure, run on the foreground loop with the live dashboard.
pub type StepFn = Box<dyn FnMut(&mut Dashboard) -> anyhow::Result<()> + Send>;

/// Await predicate over the live dashboard.
pub type Predicate = Box<dyn FnMut(&Dashboard) -> anyhow::Result<bool> + Send>;

/// What a step does once its delay has passed.
pub enum Action {
    /// Call a function with the dashboard
    RunFunction(StepFn),
    /// Write one field
    SetField {
        /// Widget nickname
        widget: String,
        /// Field name
        field: String,
        /// New value
        value: String,
        /// Queue a CONFIRM after the write
        confirm: bool,
    },
    /// Hold the script until `predicate` holds (or the operator skips)
    AwaitCondition {
        /// Checked once per tick
        predicate: Predicate,
        /// Shown while waiting
        description: String,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::RunFunction(_) => f.write_str("RunFunction(..)"),
            Action::SetField {
                widget,
                field,
                value,
                confirm,
            } => f
                .debug_struct("SetField")
                .field("widget", widget)
                .field("field", field)
                .field("value", value)
                .field("confirm", confirm)
                .finish(),
            Action::AwaitCondition { description, .. } => f
                .debug_struct("AwaitCondition")
                .field("description", description)
                .finish(),
        }
    }
}

impl Action {
    /// Whether this is an await.
    pub fn is_await(&self) -> bool {
        matches!(self, Action::AwaitCondition { .. })
    }
}

/// One scheduled action.
#[derive(Debug)]
pub struct Step {
    /// Wait after the previous step
    pub delay: Duration,
    /// What fires after the delay
    pub action: Action,
}

/// A loaded automation script.
#[derive(Debug, Default)]
pub struct Script {
    name: Option<String>,
    steps: Vec<Step>,
}

impl Script {
    /// Script name, shown in the status view.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the script name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Steps in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the script has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn into_steps(self) -> (Option<String>, Vec<Step>) {
        (self.name, self.steps)
    }

    /// Sum of every step delay.
    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.delay).sum()
    }

    /// Index of the last await step, if any.
    pub fn last_await_index(&self) -> Option<usize> {
        self.steps.iter().rposition(|s| s.action.is_await())
    }

    /// Check every SetField target exists on `dashboard`.
    pub fn validate(&self, dashboard: &Dashboard) -> AppResult<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if let Action::SetField { widget, field, .. } = &step.action {
                if dashboard.widget(widget).is_none() {
                    return Err(PanelError::Script(format!(
                        "step {}: no widget with nickname '{}'",
                        i + 1,
                        widget
                    )));
                }
                if !dashboard.has_field(widget, field) {
                    return Err(PanelError::Script(format!(
                        "step {}: widget '{}' has no field '{}'",
                        i + 1,
                        widget,
                        field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds a [`Script`]. Delays accumulate until the next action consumes them.
#[derive(Default)]
pub struct ScriptBuilder {
    name: Option<String>,
    pending_delay: Duration,
    steps: Vec<Step>,
}

impl ScriptBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the script being built.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a delay before the next action. Consecutive delays add up.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.push_delay(delay);
        self
    }

    /// Add a delay written as `h:mm:ss`.
    pub fn delay_hms(mut self, delay: &str) -> AppResult<Self> {
        self.push_delay(parse_hms(delay)?);
        Ok(self)
    }

    /// Add a field write.
    pub fn set_field(
        mut self,
        widget: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
        confirm: bool,
    ) -> Self {
        self.push_action(Action::SetField {
            widget: widget.into(),
            field: field.into(),
            value: value.into(),
            confirm,
        });
        self
    }

    /// Add a function call.
    pub fn function<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Dashboard) -> anyhow::Result<()> + Send + 'static,
    {
        self.push_action(Action::RunFunction(Box::new(f)));
        self
    }

    /// Add an await that holds the script until `predicate` returns true.
    pub fn await_condition<F>(mut self, description: impl Into<String>, predicate: F) -> Self
    where
        F: FnMut(&Dashboard) -> anyhow::Result<bool> + Send + 'static,
    {
        self.push_action(Action::AwaitCondition {
            predicate: Box::new(predicate),
            description: description.into(),
        });
        self
    }

    pub(crate) fn push_delay(&mut self, delay: Duration) {
        self.pending_delay += delay;
    }

    pub(crate) fn push_action(&mut self, action: Action) {
        let delay = std::mem::take(&mut self.pending_delay);
        self.steps.push(Step { delay, action });
    }

    /// Finish the script. A trailing delay with no action after it is dropped.
    pub fn build(self) -> Script {
        Script {
            name: self.name,
            steps: self.steps,
        }
    }
}

/// Parse `h:mm:ss` (hours may exceed 24; minutes and seconds must be below 60).
pub fn parse_hms(text: &str) -> AppResult<Duration> {
    let invalid = || {
        PanelError::Script(format!(
            "invalid duration '{}'; expected h:mm:ss",
            text
        ))
    };

    let parts: Vec<&str> = text.trim().split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(invalid());
    };
    let hours: u64 = h.parse().map_err(|_| invalid())?;
    let minutes: u64 = m.parse().map_err(|_| invalid())?;
    let seconds: u64 = s.parse().map_err(|_| invalid())?;
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

/// Format as `H:MM:SS`, rounding partial seconds up.
pub fn format_hms(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs += 1;
    }
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
