//! `template.yaml`: the on-disk entry point of a template directory.
//!
//! ```yaml
//! version: 0.0.1
//! data:
//!   port: 80
//! actions:
//!   install:
//!     command: ["./install.sh"]
//!     required: [version]
//!   start:
//!     handler: node.start
//!   monitor:
//!     handler: node.monitor
//! recurring:
//!   - action: monitor
//!     period: 10
//! validate:
//!   handler: node.validate
//! on_delete: [uninstall]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::service::state::Data;
use crate::template::action::{ActionHandler, ActionSpec, CommandHandler, HandlerCatalog};
use crate::template::uid::TemplateUid;
use crate::template::Template;

pub const MANIFEST_FILE: &str = "template.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEntry {
    #[serde(flatten)]
    pub run: HandlerRef,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringEntry {
    pub action: String,
    /// Seconds.
    pub period: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionEntry>,
    #[serde(default)]
    pub recurring: Vec<RecurringEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<HandlerRef>,
    #[serde(default)]
    pub on_delete: Vec<String>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(WardenError::TemplateLoad {
                path: dir.display().to_string(),
                reason: format!("{MANIFEST_FILE} not found"),
            });
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&raw).map_err(|e| WardenError::TemplateLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Load the template in `dir`, published from repository `source_url`.
///
/// The template name is the directory name; a `name` declared in the
/// manifest must agree with it.
pub fn load_template(source_url: &str, dir: &Path, catalog: &HandlerCatalog) -> Result<Template> {
    let fail = |reason: String| WardenError::TemplateLoad {
        path: dir.display().to_string(),
        reason,
    };

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| fail("template directory has no name".into()))?;
    let manifest = Manifest::load(dir)?;
    if let Some(declared) = &manifest.name {
        if declared != &dir_name {
            return Err(fail(format!(
                "declared name '{declared}' does not match directory '{dir_name}'"
            )));
        }
    }

    let uid = TemplateUid::from_source(source_url, &dir_name, Some(manifest.version.clone()))
        .map_err(|e| fail(e.to_string()))?;

    let mut builder = Template::builder(uid)
        .path(dir)
        .default_data(manifest.data.clone());

    for (name, entry) in &manifest.actions {
        let handler = resolve_handler(name, &entry.run, dir, catalog).map_err(fail)?;
        builder = builder.action(
            ActionSpec::new(name.clone(), handler)
                .required(entry.required.iter().cloned())
                .optional(entry.optional.iter().cloned()),
        );
    }
    for r in &manifest.recurring {
        builder = builder.recurring(r.action.clone(), Duration::from_secs(r.period));
    }
    if let Some(hook) = &manifest.validate {
        builder = builder.validate(resolve_handler("validate", hook, dir, catalog).map_err(fail)?);
    }
    for name in &manifest.on_delete {
        builder = builder.on_delete(name.clone());
    }
    builder.build()
}

fn resolve_handler(
    action: &str,
    run: &HandlerRef,
    dir: &Path,
    catalog: &HandlerCatalog,
) -> std::result::Result<Arc<dyn ActionHandler>, String> {
    match (&run.command, &run.handler) {
        (Some(argv), None) => {
            let argv = absolutize_program(argv, dir);
            let handler = CommandHandler::new(argv, Some(dir.to_path_buf()))
                .map_err(|e| format!("action '{action}': {e}"))?;
            Ok(Arc::new(handler))
        }
        (None, Some(id)) => catalog
            .get(id)
            .ok_or_else(|| format!("action '{action}': no handler registered as '{id}'")),
        (Some(_), Some(_)) => Err(format!(
            "action '{action}' declares both a command and a handler"
        )),
        (None, None) => Err(format!(
            "action '{action}' declares neither a command nor a handler"
        )),
    }
}

/// Programs given as a relative path (`./run.sh`, `bin/run`) live inside the template directory.
fn absolutize_program(argv: &[String], dir: &Path) -> Vec<String> {
    let mut out = argv.to_vec();
    if let Some(first) = out.first_mut() {
        let p = PathBuf::from(first.as_str());
        if p.is_relative() && p.components().count() > 1 {
            *first = dir.join(p).display().to_string();
        }
    }
    out
}
