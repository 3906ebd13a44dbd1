pub mod config;
pub mod error;
pub mod gate;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod service;
pub mod snapshot;
pub mod task;
pub mod template;

pub use config::Config;
pub use error::{ErrorKind, Result, WardenError};
pub use orchestrator::{Orchestrator, StartReport};
pub use service::{Service, ServiceFilter};
pub use task::{Task, TaskState};
pub use template::{HandlerCatalog, Template, TemplateUid};
