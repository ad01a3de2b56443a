//! Type-tag → handler registry for activities and orchestrators.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::context::OrchestrationContext;
use crate::error::{ActivityError, WorkflowError, WorkflowResult};

/// Type-erased activity handler: JSON in, JSON out.
pub type ActivityHandler =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue, ActivityError>> + Send + Sync>;

/// Type-erased orchestrator function.
pub type OrchestratorFn = Arc<
    dyn Fn(OrchestrationContext, JsonValue) -> BoxFuture<'static, WorkflowResult<JsonValue>>
        + Send
        + Sync,
>;

/// Handlers known to a dispatcher, keyed by type tag.
///
/// Registering a tag twice replaces the earlier handler.
#[derive(Clone, Default)]
pub struct Registry {
    activities: HashMap<String, ActivityHandler>,
    orchestrators: HashMap<String, OrchestratorFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity handler with typed input and output.
    ///
    /// Input that fails to deserialize is a permanent step failure.
    pub fn register_activity<I, O, F, Fut>(&mut self, type_tag: impl Into<String>, handler: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ActivityHandler = Arc::new(
            move |input: JsonValue| -> BoxFuture<'static, Result<JsonValue, ActivityError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let input: I = serde_json::from_value(input)?;
                    let output = handler(input).await?;
                    Ok::<_, ActivityError>(serde_json::to_value(output)?)
                })
            },
        );
        self.activities.insert(type_tag.into(), erased);
        self
    }

    /// Register an orchestrator with typed input and output.
    pub fn register_orchestrator<I, O, F, Fut>(&mut self, type_tag: impl Into<String>, orchestrator: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkflowResult<O>> + Send + 'static,
    {
        let orchestrator = Arc::new(orchestrator);
        let erased: OrchestratorFn = Arc::new(
            move |ctx: OrchestrationContext, input: JsonValue| -> BoxFuture<'static, WorkflowResult<JsonValue>> {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    let input: I = serde_json::from_value(input)?;
                    let output = orchestrator(ctx, input).await?;
                    Ok::<_, WorkflowError>(serde_json::to_value(output)?)
                })
            },
        );
        self.orchestrators.insert(type_tag.into(), erased);
        self
    }

    pub fn activity(&self, type_tag: &str) -> Option<ActivityHandler> {
        self.activities.get(type_tag).cloned()
    }

    pub fn orchestrator(&self, type_tag: &str) -> Option<OrchestratorFn> {
        self.orchestrators.get(type_tag).cloned()
    }

    pub fn has_orchestrator(&self, type_tag: &str) -> bool {
        self.orchestrators.contains_key(type_tag)
    }

    /// Registered activity tags, sorted (for startup logging).
    pub fn activity_tags(&self) -> Vec<&str> {
        let mut tags: Vec<_> = self.activities.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Registered orchestrator tags, sorted.
    pub fn orchestrator_tags(&self) -> Vec<&str> {
        let mut tags: Vec<_> = self.orchestrators.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("activities", &self.activity_tags())
            .field("orchestrators", &self.orchestrator_tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn typed_activity_round_trips_json() {
        let mut registry = Registry::new();
        registry.register_activity("double", |n: u32| async move { Ok::<_, ActivityError>(n * 2) });

        let handler = registry.activity("double").unwrap();
        assert_eq!(handler(json!(21)).await, Ok(json!(42)));
    }

    #[tokio::test]
    async fn malformed_activity_input_is_permanent() {
        let mut registry = Registry::new();
        registry.register_activity("double", |n: u32| async move { Ok::<_, ActivityError>(n * 2) });

        let handler = registry.activity("double").unwrap();
        let err = handler(json!("not a number")).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn lookups_by_tag() {
        let mut registry = Registry::new();
        registry
            .register_activity("b", |_: ()| async { Ok::<_, ActivityError>(()) })
            .register_activity("a", |_: ()| async { Ok::<_, ActivityError>(()) });

        assert!(registry.activity("a").is_some());
        assert!(registry.activity("missing").is_none());
        assert!(!registry.has_orchestrator("a"));
        assert_eq!(registry.activity_tags(), vec!["a", "b"]);
    }
}
