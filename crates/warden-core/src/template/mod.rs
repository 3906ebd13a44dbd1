//! Templates: versioned definitions of service behaviour.
//!
//! A [`Template`] pairs a [`TemplateUid`] with its action table, default data,
//! recurring actions and lifecycle hooks. Templates are built either from a
//! `template.yaml` manifest on disk (see [`manifest`]) or in code with
//! [`TemplateBuilder`], and are held by the [`TemplateRegistry`].

pub mod action;
pub mod manifest;
pub mod registry;
pub mod uid;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::service::state::Data;

pub use action::{
    handler_fn, ActionContext, ActionFailure, ActionHandler, ActionResult, ActionSpec, Args,
    CommandHandler, HandlerCatalog,
};
pub use registry::TemplateRegistry;
pub use uid::{TemplateUid, UidFilter};

/// Action names the runtime handles itself.
pub const RESERVED_ACTIONS: &[&str] = &[SAVE_ACTION];

/// Persists the service through the snapshot store.
pub const SAVE_ACTION: &str = "save";

/// An action the runtime re-schedules on a minimum interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringSpec {
    pub action: String,
    pub period: Duration,
}

pub struct Template {
    uid: TemplateUid,
    path: Option<PathBuf>,
    actions: BTreeMap<String, ActionSpec>,
    default_data: Data,
    recurring: Vec<RecurringSpec>,
    validate: Option<Arc<dyn ActionHandler>>,
    on_delete: Vec<String>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("uid", &self.uid)
            .field("path", &self.path)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("recurring", &self.recurring)
            .field("on_delete", &self.on_delete)
            .finish_non_exhaustive()
    }
}

impl Template {
    pub fn builder(uid: TemplateUid) -> TemplateBuilder {
        TemplateBuilder {
            template: Template {
                uid,
                path: None,
                actions: BTreeMap::new(),
                default_data: Data::new(),
                recurring: Vec::new(),
                validate: None,
                on_delete: Vec::new(),
            },
        }
    }

    pub fn uid(&self) -> &TemplateUid {
        &self.uid
    }

    /// Directory the template was loaded from, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values()
    }

    /// Whether `name` can be scheduled on services of this template.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name) || RESERVED_ACTIONS.contains(&name)
    }

    /// Check an action exists and accepts `args`.
    pub fn check_call(&self, name: &str, args: &Args) -> Result<()> {
        if RESERVED_ACTIONS.contains(&name) {
            if !args.is_empty() {
                return Err(WardenError::BadArguments {
                    action: name.to_string(),
                    reason: "takes no arguments".into(),
                });
            }
            return Ok(());
        }
        let spec = self
            .actions
            .get(name)
            .ok_or_else(|| WardenError::ActionNotFound {
                action: name.to_string(),
                template: self.uid.to_string(),
            })?;
        spec.validate_args(args)
    }

    pub fn default_data(&self) -> &Data {
        &self.default_data
    }

    pub fn recurring(&self) -> &[RecurringSpec] {
        &self.recurring
    }

    pub fn validate_hook(&self) -> Option<&Arc<dyn ActionHandler>> {
        self.validate.as_ref()
    }

    /// Actions run best-effort when a service of this template is deleted.
    pub fn on_delete(&self) -> &[String] {
        &self.on_delete
    }
}

pub struct TemplateBuilder {
    template: Template,
}

impl TemplateBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.template.path = Some(path.into());
        self
    }

    pub fn action(mut self, spec: ActionSpec) -> Self {
        self.template.actions.insert(spec.name.clone(), spec);
        self
    }

    pub fn default_data(mut self, data: Data) -> Self {
        self.template.default_data = data;
        self
    }

    pub fn recurring(mut self, action: impl Into<String>, period: Duration) -> Self {
        self.template.recurring.push(RecurringSpec {
            action: action.into(),
            period,
        });
        self
    }

    pub fn validate(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.template.validate = Some(handler);
        self
    }

    pub fn on_delete(mut self, action: impl Into<String>) -> Self {
        self.template.on_delete.push(action.into());
        self
    }

    /// Check internal consistency and finish the template.
    pub fn build(self) -> Result<Template> {
        let t = self.template;
        let location = t
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| t.uid.to_string());
        let fail = |reason: String| WardenError::TemplateLoad {
            path: location.clone(),
            reason,
        };

        if t.uid.version.is_none() {
            return Err(fail("template version is required".into()));
        }
        for name in t.actions.keys() {
            if RESERVED_ACTIONS.contains(&name.as_str()) {
                return Err(fail(format!("action name '{name}' is reserved")));
            }
        }
        for r in &t.recurring {
            if !t.actions.contains_key(&r.action) {
                return Err(fail(format!("recurring action '{}' is not defined", r.action)));
            }
            if r.period.is_zero() {
                return Err(fail(format!(
                    "recurring action '{}' needs a non-zero period",
                    r.action
                )));
            }
        }
        for name in &t.on_delete {
            if !t.actions.contains_key(name) {
                return Err(fail(format!("delete callback '{name}' is not defined")));
            }
        }
        Ok(t)
    }
}
