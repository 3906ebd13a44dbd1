use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::{Result, WardenError};
use crate::template::action::HandlerCatalog;
use crate::template::manifest::{self, MANIFEST_FILE};
use crate::template::uid::{TemplateUid, UidFilter};
use crate::template::Template;

/// Every loaded template, indexed by uid.
#[derive(Default)]
pub struct TemplateRegistry {
    catalog: HandlerCatalog,
    templates: RwLock<BTreeMap<String, Arc<Template>>>,
}

impl TemplateRegistry {
    pub fn new(catalog: HandlerCatalog) -> Self {
        Self {
            catalog,
            templates: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load every template directory under `directory`.
    ///
    /// Subdirectories without a manifest, or that fail to load, abort the
    /// whole load; templates registered before the failure stay registered.
    pub fn load(&self, source_url: &str, directory: &Path) -> Result<Vec<Arc<Template>>> {
        if !directory.is_dir() {
            return Err(WardenError::TemplateLoad {
                path: directory.display().to_string(),
                reason: "not a directory".into(),
            });
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            dirs.push(entry.path());
        }
        dirs.sort();

        let mut loaded = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let template = manifest::load_template(source_url, &dir, &self.catalog)?;
            let template = self.register(template)?;
            tracing::info!(template = %template.uid(), path = %dir.display(), "template loaded");
            loaded.push(template);
        }
        if loaded.is_empty() {
            tracing::warn!(
                path = %directory.display(),
                "no template directories found (expected subdirectories with {MANIFEST_FILE})"
            );
        }
        Ok(loaded)
    }

    /// Add a template built in code. Registering a uid twice is a conflict.
    pub fn register(&self, template: Template) -> Result<Arc<Template>> {
        let key = template.uid().to_string();
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        if templates.contains_key(&key) {
            return Err(WardenError::TemplateConflict(key));
        }
        let template = Arc::new(template);
        templates.insert(key, template.clone());
        Ok(template)
    }

    /// Exact lookup by full uid.
    pub fn get(&self, uid: &TemplateUid) -> Result<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&uid.to_string())
            .cloned()
            .ok_or_else(|| WardenError::TemplateNotFound(uid.to_string()))
    }

    /// Exact lookup from the string form `host/account/repo/name/version`.
    pub fn get_str(&self, uid: &str) -> Result<Arc<Template>> {
        self.get(&uid.parse()?)
    }

    /// All templates whose uid matches every field set in `filter`, ordered by uid.
    pub fn find(&self, filter: &UidFilter) -> Vec<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| filter.matches(t.uid()))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<Template>> {
        self.find(&UidFilter::default())
    }

    /// Resolve a possibly partial reference to exactly one template.
    ///
    /// Accepted forms: a full uid, a uid without version, or a bare template
    /// name. Partial references must match exactly one loaded template.
    pub fn resolve(&self, reference: &str) -> Result<Arc<Template>> {
        let filter = if reference.contains('/') {
            let uid: TemplateUid = reference.parse()?;
            if uid.version.is_some() {
                return self.get(&uid);
            }
            UidFilter::any_version(&uid)
        } else {
            crate::template::uid::validate_name(reference)?;
            UidFilter::by_name(reference)
        };
        pick_one(reference, self.find(&filter))
    }

    /// Resolve the template a persisted service declared.
    ///
    /// Falls back to any loaded version of the same template when the exact
    /// version is gone.
    pub fn resolve_declared(&self, declared: &TemplateUid) -> Result<Arc<Template>> {
        if declared.version.is_some() {
            if let Ok(t) = self.get(declared) {
                return Ok(t);
            }
        }
        let template = pick_one(
            &declared.to_string(),
            self.find(&UidFilter::any_version(declared)),
        )?;
        tracing::warn!(
            declared = %declared,
            resolved = %template.uid(),
            "declared template version not loaded, using the only available version"
        );
        Ok(template)
    }

    pub fn len(&self) -> usize {
        self.templates.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pick_one(reference: &str, mut matches: Vec<Arc<Template>>) -> Result<Arc<Template>> {
    match matches.len() {
        0 => Err(WardenError::TemplateNotFound(reference.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(WardenError::AmbiguousTemplate {
            reference: reference.to_string(),
            candidates: matches.iter().map(|t| t.uid().to_string()).collect(),
        }),
    }
}
