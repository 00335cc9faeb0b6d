use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use switchyard_protocol::HealthStatus;
use thiserror::Error;
use tracing::{Instrument, debug, info, warn};

use super::{ExecutionContext, FunctionDefinition};

tokio::task_local! {
    static IN_HANDLER: ();
}

/// True while the caller is running inside a handler started by
/// [`FunctionRegistry::invoke`]. A panic there becomes
/// [`RegistryError::Execution`] instead of unwinding further.
pub fn in_handler() -> bool {
    IN_HANDLER.try_with(|_| ()).is_ok()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("a function named `{0}` is already registered")]
    DuplicateName(String),
    #[error("invalid definition for `{name}`: {reason}")]
    InvalidDefinition { name: String, reason: String },
    #[error("function `{0}` is not registered")]
    NotFound(String),
    #[error("invalid parameters for `{function}`: {reason}")]
    ValidationError { function: String, reason: String },
    #[error("function `{function}` timed out after {timeout_ms} ms")]
    Timeout { function: String, timeout_ms: u64 },
    #[error("function `{function}` failed: {reason}")]
    Execution { function: String, reason: String },
}

impl RegistryError {
    /// Failures that a later attempt cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RegistryError::NotFound(_) | RegistryError::ValidationError { .. }
        )
    }
}

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, params: Map<String, Value>, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`FunctionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> FunctionHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Map<String, Value>, ctx: ExecutionContext) -> anyhow::Result<Value> {
        (self.0)(params, ctx).await
    }
}

/// Boxes an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FunctionHandler>
where
    F: Fn(Map<String, Value>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct CallableFunction {
    pub definition: Arc<FunctionDefinition>,
    pub handler: Arc<dyn FunctionHandler>,
}

impl std::fmt::Debug for CallableFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableFunction")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Owns every registered function. Reads are shared; a reload swaps the
/// whole set under one write lock.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, CallableFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[tracing::instrument(name = "registry_register", skip(self, definition, handler), fields(function = %definition.name))]
    pub fn register(
        &self,
        definition: FunctionDefinition,
        handler: Arc<dyn FunctionHandler>,
    ) -> Result<(), RegistryError> {
        definition
            .validate()
            .map_err(|reason| RegistryError::InvalidDefinition {
                name: definition.name.clone(),
                reason,
            })?;

        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        if functions.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateName(definition.name));
        }
        info!(kind = ?definition.kind, "registered function");
        functions.insert(
            definition.name.clone(),
            CallableFunction {
                definition: Arc::new(definition),
                handler,
            },
        );
        Ok(())
    }

    /// Replaces the whole set. Malformed or duplicate entries are logged and
    /// skipped; returns how many were registered.
    pub fn reload(&self, entries: Vec<(FunctionDefinition, Arc<dyn FunctionHandler>)>) -> usize {
        let mut fresh: HashMap<String, CallableFunction> = HashMap::new();
        for (definition, handler) in entries {
            if let Err(reason) = definition.validate() {
                warn!(function = %definition.name, %reason, "skipping malformed function");
                continue;
            }
            if fresh.contains_key(&definition.name) {
                warn!(function = %definition.name, "skipping duplicate function");
                continue;
            }
            fresh.insert(
                definition.name.clone(),
                CallableFunction {
                    definition: Arc::new(definition),
                    handler,
                },
            );
        }
        let count = fresh.len();
        *self.functions.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!(count, "function registry reloaded");
        count
    }

    pub fn lookup(&self, name: &str) -> Option<CallableFunction> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definitions sorted by name.
    pub fn export(&self) -> Vec<FunctionDefinition> {
        let mut defs: Vec<FunctionDefinition> = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|f| f.definition.as_ref().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validates `params` and runs the handler on its own task, raced
    /// against the declared timeout. A handler that outlives its timeout is
    /// left running and its result dropped.
    #[tracing::instrument(name = "registry_invoke", skip(self, params, ctx), fields(job_id = ?ctx.job_id))]
    pub async fn invoke(
        &self,
        name: &str,
        params: &Value,
        ctx: ExecutionContext,
    ) -> Result<Value, RegistryError> {
        let function = self
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let definition = function.definition.clone();

        let params = definition
            .prepare_params(params)
            .map_err(|reason| RegistryError::ValidationError {
                function: name.to_string(),
                reason,
            })?;

        let timeout = definition.timeout();
        let span = ctx.span().clone();
        let handler = function.handler.clone();
        let task = tokio::spawn(
            IN_HANDLER
                .scope((), async move { handler.call(params, ctx).await })
                .instrument(span),
        );

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(value))) => {
                debug!("function returned");
                Ok(value)
            }
            Ok(Ok(Err(err))) => Err(RegistryError::Execution {
                function: name.to_string(),
                reason: format!("{err:#}"),
            }),
            Ok(Err(join_err)) => Err(RegistryError::Execution {
                function: name.to_string(),
                reason: if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_err.to_string()
                },
            }),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "function timed out; result will be discarded");
                Err(RegistryError::Timeout {
                    function: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn health(&self) -> HealthStatus {
        let count = self.len();
        if count == 0 {
            HealthStatus::unhealthy("function_registry", "no functions registered")
        } else {
            HealthStatus::healthy("function_registry", format!("{count} functions registered"))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::function::{FunctionKind, ParamSpec, ParamType};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    pub fn echo_handler() -> Arc<dyn FunctionHandler> {
        handler_fn(|params, _ctx| async move { Ok::<_, anyhow::Error>(Value::Object(params)) })
    }

    fn echo_def(name: &str) -> FunctionDefinition {
        FunctionDefinition::new(name, "echo parameters back", FunctionKind::Helper)
            .param(ParamSpec::required("text", ParamType::String, "what to echo"))
    }

    #[test]
    fn duplicate_and_invalid_registration() {
        let registry = FunctionRegistry::new();
        registry.register(echo_def("echo"), echo_handler()).unwrap();

        let dup = registry.register(echo_def("echo"), echo_handler()).unwrap_err();
        assert_eq!(dup, RegistryError::DuplicateName("echo".into()));

        let bad = FunctionDefinition::new("", "x", FunctionKind::Helper);
        assert!(matches!(
            registry.register(bad, echo_handler()),
            Err(RegistryError::InvalidDefinition { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn invoke_validates_and_runs() {
        let registry = FunctionRegistry::new();
        registry.register(echo_def("echo"), echo_handler()).unwrap();

        let out = registry
            .invoke("echo", &json!({"text": "hi"}), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hi"}));

        let missing = registry
            .invoke("echo", &json!({}), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, RegistryError::ValidationError { .. }));
        assert!(missing.is_permanent());

        let unknown = registry
            .invoke("nope", &json!({}), ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(unknown, RegistryError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_execution_errors() {
        let registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("fails", "always fails", FunctionKind::Worker),
                handler_fn(|_p, _c| async { Err::<Value, _>(anyhow::anyhow!("disk full")) }),
            )
            .unwrap();
        registry
            .register(
                FunctionDefinition::new("panics", "always panics", FunctionKind::Worker),
                handler_fn(|_p, _c| async {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, anyhow::Error>(Value::Null)
                }),
            )
            .unwrap();

        let err = registry.invoke("fails", &Value::Null, ExecutionContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(!err.is_permanent());

        let err = registry.invoke("panics", &Value::Null, ExecutionContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_declared_deadline_and_handler_keeps_running() {
        let registry = FunctionRegistry::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        registry
            .register(
                FunctionDefinition::new("sleepy", "sleeps past its timeout", FunctionKind::Worker)
                    .with_timeout_ms(5000),
                handler_fn(move |_p, _c| {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(8)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(json!("late"))
                    }
                }),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = registry.invoke("sleepy", &Value::Null, ExecutionContext::new()).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::Timeout {
                function: "sleepy".into(),
                timeout_ms: 5000
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5000) && elapsed < Duration::from_millis(5100));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn reload_skips_bad_entries_and_replaces_set() {
        let registry = FunctionRegistry::new();
        registry.register(echo_def("old"), echo_handler()).unwrap();

        let count = registry.reload(vec![
            (echo_def("a"), echo_handler()),
            (echo_def("a"), echo_handler()),
            (FunctionDefinition::new("b", "", FunctionKind::Helper), echo_handler()),
            (echo_def("c"), echo_handler()),
        ]);
        assert_eq!(count, 2);
        assert!(registry.lookup("old").is_none());
        let names: Vec<String> = registry.export().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn health_reflects_catalog() {
        let registry = FunctionRegistry::new();
        assert!(registry.health().is_unhealthy());
        registry.register(echo_def("echo"), echo_handler()).unwrap();
        assert!(!registry.health().is_unhealthy());
    }
}
