use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form service data; its shape is owned by the template.
pub type Data = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Ok,
    Error,
    Warning,
    Skipped,
}

impl StateValue {
    pub fn as_str(self) -> &'static str {
        match self {
            StateValue::Ok => "ok",
            StateValue::Error => "error",
            StateValue::Warning => "warning",
            StateValue::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nested `category -> tag -> value` map describing what a service has achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceState {
    categories: BTreeMap<String, BTreeMap<String, StateValue>>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, category: &str, tag: &str, value: StateValue) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(tag.to_string(), value);
    }

    pub fn get(&self, category: &str, tag: &str) -> Option<StateValue> {
        self.categories.get(category)?.get(tag).copied()
    }

    /// All tags of one category.
    pub fn category(&self, category: &str) -> Option<&BTreeMap<String, StateValue>> {
        self.categories.get(category)
    }

    /// Remove a tag, or the whole category when `tag` is `None`.
    pub fn delete(&mut self, category: &str, tag: Option<&str>) {
        match tag {
            None => {
                self.categories.remove(category);
            }
            Some(tag) => {
                if let Some(tags) = self.categories.get_mut(category) {
                    tags.remove(tag);
                    if tags.is_empty() {
                        self.categories.remove(category);
                    }
                }
            }
        }
    }

    /// Fail unless `category/tag` currently holds `expected`.
    pub fn check(&self, category: &str, tag: &str, expected: StateValue) -> Result<()> {
        match self.get(category, tag) {
            Some(v) if v == expected => Ok(()),
            Some(v) => Err(WardenError::StateCheck(format!(
                "{category}/{tag} is {v}, expected {expected}"
            ))),
            None => Err(WardenError::StateCheck(format!(
                "{category}/{tag} is not set, expected {expected}"
            ))),
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}
