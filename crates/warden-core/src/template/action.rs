//! Action table entries and the handlers behind them.
//!
//! Every template carries an explicit table of actions built at load time.
//! Each entry declares its required and optional parameter names so scheduling
//! can reject a bad argument set with a lookup, before any task exists.
//!
//! Handlers come in two flavours:
//! - in-process handlers registered in a [`HandlerCatalog`] (usually closures
//!   wrapped with [`handler_fn`])
//! - [`CommandHandler`], which runs an external program speaking a JSON
//!   stdin/stdout protocol

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, WardenError};
use crate::service::state::{Data, ServiceState, StateValue};
use crate::template::uid::TemplateUid;

/// Arguments passed to an action.
pub type Args = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// ActionFailure
// ---------------------------------------------------------------------------

/// What an action reports when it fails. Captured into the task's error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
}

impl ActionFailure {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = trace.into();
        self
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl From<WardenError> for ActionFailure {
    fn from(err: WardenError) -> Self {
        let category = match &err {
            WardenError::StateCheck(_) => "state_check",
            WardenError::BadArguments { .. } => "bad_arguments",
            _ => "runtime",
        };
        Self::new(category, err.to_string())
    }
}

pub type ActionResult = std::result::Result<Value, ActionFailure>;

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// The slice of a service an action may read and mutate.
///
/// Cheap to clone; data and state are shared with the owning service.
#[derive(Clone)]
pub struct ActionContext {
    pub guid: String,
    pub name: String,
    pub template: TemplateUid,
    data: Arc<RwLock<Data>>,
    state: Arc<RwLock<ServiceState>>,
}

impl ActionContext {
    pub(crate) fn new(
        guid: String,
        name: String,
        template: TemplateUid,
        data: Arc<RwLock<Data>>,
        state: Arc<RwLock<ServiceState>>,
    ) -> Self {
        Self {
            guid,
            name,
            template,
            data,
            state,
        }
    }

    pub fn data(&self) -> Data {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_data<R>(&self, f: impl FnOnce(&mut Data) -> R) -> R {
        let mut guard = self.data.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn state(&self) -> ServiceState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_state(&self, category: &str, tag: &str, value: StateValue) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(category, tag, value);
    }

    pub fn update_state<R>(&self, f: impl FnOnce(&mut ServiceState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, ctx: ActionContext, args: Args) -> ActionResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext, Args) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn call(&self, ctx: ActionContext, args: Args) -> ActionResult {
        (self.0)(ctx, args).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// let start = handler_fn(|ctx, _args| async move {
///     ctx.set_state("actions", "start", StateValue::Ok);
///     Ok(serde_json::Value::Null)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(ActionContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// In-process handlers that template manifests refer to by id.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(id.into(), handler);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

/// Request written to a command handler's stdin.
#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    service: CommandService<'a>,
    args: &'a Args,
    data: Data,
    state: ServiceState,
}

#[derive(Debug, Serialize)]
struct CommandService<'a> {
    guid: &'a str,
    name: &'a str,
    template: String,
}

/// Runs an external program for an action.
///
/// # Protocol
/// - stdin:  JSON `{service, args, data, state}`
/// - stdout: JSON result (empty = `null`; non-JSON text is returned as a string)
/// - exit code other than 0 fails the action with stderr as the message
#[derive(Debug, Clone)]
pub struct CommandHandler {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new(argv: Vec<String>, cwd: Option<PathBuf>) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(WardenError::Config("command must not be empty".into()));
        }
        Ok(Self { argv, cwd })
    }
}

#[async_trait]
impl ActionHandler for CommandHandler {
    async fn call(&self, ctx: ActionContext, args: Args) -> ActionResult {
        let request = CommandRequest {
            service: CommandService {
                guid: &ctx.guid,
                name: &ctx.name,
                template: ctx.template.to_string(),
            },
            args: &args,
            data: ctx.data(),
            state: ctx.state(),
        };
        let stdin_json = serde_json::to_vec(&request).map_err(WardenError::from)?;

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .env("WARDEN_SERVICE_GUID", &ctx.guid)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ActionFailure::new("spawn", format!("failed to spawn '{}': {e}", self.argv[0]))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A program that never reads stdin closes the pipe early; that is not a failure.
            let _ = stdin.write_all(&stdin_json).await;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ActionFailure::new("spawn", format!("wait failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            let message = if stderr.is_empty() {
                format!("exit code {code}")
            } else {
                stderr.chars().take(2000).collect()
            };
            return Err(ActionFailure::new("command", message).with_trace(stdout));
        }
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

/// One entry of a template's action table.
#[derive(Clone)]
pub struct ActionSpec {
    pub name: String,
    pub required: BTreeSet<String>,
    pub optional: BTreeSet<String>,
    pub handler: Arc<dyn ActionHandler>,
}

impl std::fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            required: BTreeSet::new(),
            optional: BTreeSet::new(),
            handler,
        }
    }

    pub fn required<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn optional<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(params.into_iter().map(Into::into));
        self
    }

    /// Reject argument sets that miss a required parameter or carry an undeclared one.
    pub fn validate_args(&self, args: &Args) -> Result<()> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|p| !args.contains_key(p.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(WardenError::BadArguments {
                action: self.name.clone(),
                reason: format!("missing required: {}", missing.join(", ")),
            });
        }
        let unknown: Vec<&str> = args
            .keys()
            .filter(|k| !self.required.contains(*k) && !self.optional.contains(*k))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(WardenError::BadArguments {
                action: self.name.clone(),
                reason: format!("unexpected: {}", unknown.join(", ")),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::new(
            "guid-1".into(),
            "svc".into(),
            "h/a/r/node/0.0.1".parse().unwrap(),
            Arc::new(RwLock::new(Data::new())),
            Arc::new(RwLock::new(ServiceState::new())),
        )
    }

    fn args(v: Value) -> Args {
        v.as_object().cloned().unwrap()
    }

    fn noop() -> Arc<dyn ActionHandler> {
        handler_fn(|_ctx, _args| async { Ok(Value::Null) })
    }

    #[test]
    fn validate_args_accepts_declared_sets() {
        let spec = ActionSpec::new("install", noop())
            .required(["version"])
            .optional(["force"]);
        spec.validate_args(&args(json!({"version": "1"}))).unwrap();
        spec.validate_args(&args(json!({"version": "1", "force": true})))
            .unwrap();
    }

    #[test]
    fn validate_args_rejects_missing_and_unknown() {
        let spec = ActionSpec::new("install", noop()).required(["version"]);
        let err = spec.validate_args(&Args::new()).unwrap_err();
        assert!(err.to_string().contains("missing required: version"));

        let err = spec
            .validate_args(&args(json!({"version": "1", "bogus": 1})))
            .unwrap_err();
        assert!(matches!(err, WardenError::BadArguments { .. }));
        assert!(err.to_string().contains("unexpected: bogus"));
    }

    #[tokio::test]
    async fn fn_handler_mutates_shared_state() {
        let handler = handler_fn(|ctx: ActionContext, args: Args| async move {
            ctx.set_state("actions", "start", StateValue::Ok);
            ctx.update_data(|d| d.insert("port".into(), args["port"].clone()));
            Ok(json!("started"))
        });
        let c = ctx();
        let out = handler
            .call(c.clone(), args(json!({"port": 8080})))
            .await
            .unwrap();
        assert_eq!(out, json!("started"));
        assert_eq!(c.state().get("actions", "start"), Some(StateValue::Ok));
        assert_eq!(c.data()["port"], json!(8080));
    }

    #[tokio::test]
    async fn command_handler_parses_json_stdout() {
        let handler = CommandHandler::new(
            vec!["sh".into(), "-c".into(), r#"cat >/dev/null; echo '{"ok":true}'"#.into()],
            None,
        )
        .unwrap();
        let out = handler.call(ctx(), Args::new()).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[tokio::test]
    async fn command_handler_reports_stderr_on_failure() {
        let handler = CommandHandler::new(
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            None,
        )
        .unwrap();
        let err = handler.call(ctx(), Args::new()).await.unwrap_err();
        assert_eq!(err.category, "command");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandHandler::new(vec![], None).is_err());
    }
}
