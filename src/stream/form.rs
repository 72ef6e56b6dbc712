//! Structured form requests and their textual replies.
//!
//! A form is a convention on top of the chat channel: the server sends a
//! `form` event, and the user's answer goes back as an ordinary message
//! whose text encodes the chosen button and field values.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// One button of a form. `value` is what the agent receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormButton {
    /// Display text.
    pub label: String,
    /// Value reported back when chosen.
    pub value: String,
}

/// One free-text input of a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    /// Key reported back to the agent.
    pub name: String,
    /// Prompt shown to the user.
    #[serde(default)]
    pub label: String,
}

/// The user's answer to a form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormResponse {
    /// Id of the form being answered.
    pub form_id: String,
    /// Value of the chosen button.
    pub choice: String,
    /// Field values keyed by field name; empty values are dropped.
    pub values: BTreeMap<String, String>,
}

impl FormResponse {
    /// Answer `form_id` with `choice` and no field values.
    #[must_use]
    pub fn new(form_id: impl Into<String>, choice: impl Into<String>) -> Self {
        Self {
            form_id: form_id.into(),
            choice: choice.into(),
            values: BTreeMap::new(),
        }
    }

    /// Add a field value.
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Text sent to the server as the next user message.
    ///
    /// ```text
    /// [Form response form_id=3f2a9c1d]
    /// choice: success
    /// ip: 10.0.0.7
    /// ```
    #[must_use]
    pub fn to_message(&self) -> String {
        let mut out = format!("[Form response form_id={}]\nchoice: {}", self.form_id, self.choice);
        for (name, value) in &self.values {
            let value = value.trim();
            if !value.is_empty() {
                let _ = write!(out, "\n{name}: {value}");
            }
        }
        out
    }
}

/// Find the button `selector` refers to: its value, its label, or its
/// 1-based position.
#[must_use]
pub fn pick_button<'a>(buttons: &'a [FormButton], selector: &str) -> Option<&'a FormButton> {
    buttons
        .iter()
        .find(|b| b.value == selector)
        .or_else(|| buttons.iter().find(|b| b.label == selector))
        .or_else(|| {
            selector
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| buttons.get(i))
        })
}
