//! Widget fields.
//!
//! Every value a widget shows or accepts is a named string field. Output fields are written by
//! the device strategy and fall back to their default when the connection closes; input and
//! dropdown fields are edited by the operator, scripts or remote commands and pushed to the
//! device on confirm.

use crate::error::{AppResult, PanelError};
use std::collections::HashMap;
use tracing::warn;

/// Copy of a widget's field values, handed to the worker with each command.
pub type FieldSnapshot = HashMap<String, String>;

/// What kind of control a field represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Read-only readout written by the device strategy
    Output,
    /// Free text entry
    Input,
    /// Selection from a fixed list
    Dropdown(Vec<String>),
}

/// Declaration of a field, returned by [`crate::device::DeviceStrategy::fields`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Unique within the widget
    pub name: String,
    /// Output, input or dropdown
    pub kind: FieldKind,
    /// Starting value; the reset value too for outputs
    pub initial: String,
    /// Included in CSV rows
    pub loggable: bool,
}

impl FieldSpec {
    /// A readout that resets to `default` when the connection closes.
    pub fn output(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Output,
            initial: default.into(),
            loggable: true,
        }
    }

    /// A free text entry.
    pub fn input(name: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Input,
            initial: initial.into(),
            loggable: true,
        }
    }

    /// A selection from `options`.
    pub fn dropdown<I, S>(name: impl Into<String>, initial: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: FieldKind::Dropdown(options.into_iter().map(Into::into).collect()),
            initial: initial.into(),
            loggable: true,
        }
    }

    /// Exclude this field from data logging.
    pub fn unlogged(mut self) -> Self {
        self.loggable = false;
        self
    }
}

/// A field with its current value.
#[derive(Debug, Clone)]
pub struct Field {
    /// Name as declared
    pub name: String,
    /// Kind as declared
    pub kind: FieldKind,
    /// Current value
    pub value: String,
    /// Included in CSV rows
    pub loggable: bool,
    /// Value restored on close; only output fields have one
    pub default: Option<String>,
}

impl From<FieldSpec> for Field {
    fn from(spec: FieldSpec) -> Self {
        let default = match spec.kind {
            FieldKind::Output => Some(spec.initial.clone()),
            _ => None,
        };
        Self {
            name: spec.name,
            kind: spec.kind,
            value: spec.initial,
            loggable: spec.loggable,
            default,
        }
    }
}

/// Ordered collection of a widget's fields.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    owner: String,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl FieldStore {
    /// Empty store. `owner` names the widget in errors and logs.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Store holding `specs` in order.
    pub fn from_specs(owner: impl Into<String>, specs: Vec<FieldSpec>) -> Self {
        let mut store = Self::new(owner);
        for spec in specs {
            store.add(spec);
        }
        store
    }

    /// Add a field. A duplicate name replaces the earlier declaration in place.
    pub fn add(&mut self, spec: FieldSpec) {
        let field = Field::from(spec);
        match self.index.get(&field.name) {
            Some(&pos) => {
                warn!(
                    widget = %self.owner,
                    "Duplicate field '{}'; the later declaration replaces the earlier one",
                    field.name
                );
                self.fields[pos] = field;
            }
            None => {
                self.index.insert(field.name.clone(), self.fields.len());
                self.fields.push(field);
            }
        }
    }

    /// Current value of a field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index.get(name).map(|&pos| self.fields[pos].value.as_str())
    }

    /// Field with its metadata.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|&pos| &self.fields[pos])
    }

    /// Whether a field with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Overwrite a field's value. Unknown names are an error; fields are never created here.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> AppResult<()> {
        let pos = *self
            .index
            .get(name)
            .ok_or_else(|| PanelError::UnknownField {
                widget: self.owner.clone(),
                field: name.to_string(),
            })?;
        self.fields[pos].value = value.into();
        Ok(())
    }

    /// Restore every output field to its default.
    pub fn reset_to_defaults(&mut self) {
        for field in &mut self.fields {
            if let Some(default) = &field.default {
                field.value.clone_from(default);
            }
        }
    }

    /// Loggable `(name, value)` pairs in declaration order.
    pub fn log_data(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter(|f| f.loggable)
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect()
    }

    /// Name to value map handed to device callbacks.
    pub fn snapshot(&self) -> FieldSnapshot {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect()
    }

    /// Field names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the store has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FieldStore {
        FieldStore::from_specs(
            "Relay",
            vec![
                FieldSpec::dropdown("Status Selection", "Off", ["Off", "On"]),
                FieldSpec::output("Actual Status", "No Reading"),
                FieldSpec::input("Note", "").unlogged(),
            ],
        )
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut fields = store();
        fields.set("Status Selection", "On").unwrap();
        assert_eq!(fields.get("Status Selection"), Some("On"));
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut fields = store();
        let err = fields.set("Voltage", "1").unwrap_err();
        assert!(matches!(err, PanelError::UnknownField { ref widget, .. } if widget == "Relay"));
        assert_eq!(fields.get("Voltage"), None);
    }

    #[test]
    fn reset_restores_outputs_only() {
        let mut fields = store();
        fields.set("Actual Status", "On").unwrap();
        fields.set("Status Selection", "On").unwrap();
        fields.reset_to_defaults();
        assert_eq!(fields.get("Actual Status"), Some("No Reading"));
        assert_eq!(fields.get("Status Selection"), Some("On"));
    }

    #[test]
    fn log_data_skips_unlogged_and_keeps_order() {
        let fields = store();
        let names: Vec<_> = fields.log_data().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Status Selection", "Actual Status"]);
    }

    #[test]
    fn duplicate_replaces_in_place() {
        let mut fields = store();
        fields.add(FieldSpec::output("Status Selection", "?"));
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.names().next(), Some("Status Selection"));
        assert_eq!(fields.field("Status Selection").unwrap().kind, FieldKind::Output);
    }
}
