use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template already loaded: {0}")]
    TemplateConflict(String),

    #[error("failed to load template at {path}: {reason}")]
    TemplateLoad { path: String, reason: String },

    #[error("template reference '{reference}' is ambiguous, candidates: {}", candidates.join(", "))]
    AmbiguousTemplate {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("template mismatch: {declared} is stored under {location}")]
    TemplateMismatch { declared: String, location: String },

    #[error("invalid template uid '{0}'")]
    InvalidTemplateUid(String),

    #[error("cannot compare template uids {0} and {1}")]
    IncomparableTemplates(String, String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already exists: {0}")]
    ServiceConflict(String),

    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    #[error("too many results for {0}")]
    TooManyResults(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already archived: {0}")]
    TaskConflict(String),

    #[error("action '{action}' not found in template {template}")]
    ActionNotFound { action: String, template: String },

    #[error("bad arguments for action '{action}': {reason}")]
    BadArguments { action: String, reason: String },

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("validation failed for service {service}: {reason}")]
    ValidationFailed { service: String, reason: String },

    #[error("state check failed: {0}")]
    StateCheck(String),

    #[error("task archive error: {0}")]
    Archive(String),

    #[error("snapshot store error: {0}")]
    Snapshot(String),

    #[error("service index error: {0}")]
    Index(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification callers use to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    BadInput,
    TransientInfra,
    TemplateAmbiguity,
}

impl WardenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::TemplateConflict(_)
            | WardenError::ServiceConflict(_)
            | WardenError::TaskConflict(_) => ErrorKind::Conflict,
            WardenError::TemplateNotFound(_)
            | WardenError::ServiceNotFound(_)
            | WardenError::TaskNotFound(_)
            | WardenError::ActionNotFound { .. } => ErrorKind::NotFound,
            WardenError::AmbiguousTemplate { .. } | WardenError::TooManyResults(_) => {
                ErrorKind::TemplateAmbiguity
            }
            WardenError::TemplateLoad { .. }
            | WardenError::TemplateMismatch { .. }
            | WardenError::InvalidTemplateUid(_)
            | WardenError::InvalidServiceName(_)
            | WardenError::IncomparableTemplates(..)
            | WardenError::BadArguments { .. }
            | WardenError::InvalidTransition { .. }
            | WardenError::ValidationFailed { .. }
            | WardenError::StateCheck(_)
            | WardenError::Config(_) => ErrorKind::BadInput,
            WardenError::Archive(_)
            | WardenError::Snapshot(_)
            | WardenError::Index(_)
            | WardenError::Io(_)
            | WardenError::Yaml(_)
            | WardenError::Json(_) => ErrorKind::TransientInfra,
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
