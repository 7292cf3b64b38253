//! Built-in step handlers.
//!
//! Small, dependency-free handlers that are useful for smoke-testing
//! workflows from the CLI and as building blocks in tests.

use serde_json::{json, Value};
use weaver_types::workflow::FailureKind;

use super::handler::{StepFailure, StepHandler, StepInput, StepOutcome};
use super::registry::HandlerRegistry;

/// Returns its configuration merged with the resolved variables.
///
/// Variables win over configuration keys of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
        let mut output = match input.config {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        output.extend(input.variables);
        Ok(StepOutcome::Completed(Value::Object(output)))
    }
}

/// Returns `config.value` when present, otherwise a fixed value.
#[derive(Debug, Clone, Default)]
pub struct ConstantHandler {
    value: Value,
}

impl ConstantHandler {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl StepHandler for ConstantHandler {
    async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
        let value = input
            .config
            .get("value")
            .cloned()
            .unwrap_or_else(|| self.value.clone());
        Ok(StepOutcome::Completed(value))
    }
}

/// Fails with `config.message` and `config.kind`.
///
/// With `config.succeed_after: n` the handler fails the first `n` attempts
/// and then succeeds, which makes retry behaviour observable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailHandler;

impl StepHandler for FailHandler {
    async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
        let config = &input.config;
        if let Some(n) = config.get("succeed_after").and_then(Value::as_u64)
            && u64::from(input.attempt) > n
        {
            return Ok(StepOutcome::Completed(json!({ "attempts": input.attempt })));
        }

        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed")
            .to_string();
        let kind = config
            .get("kind")
            .cloned()
            .and_then(|k| serde_json::from_value::<FailureKind>(k).ok())
            .unwrap_or(FailureKind::Execution);
        Err(StepFailure::new(kind, message))
    }
}

/// Register `echo`, `constant` and `fail` functions plus an `echo` agent.
pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register_function("echo", EchoHandler);
    registry.register_function("constant", ConstantHandler::default());
    registry.register_function("fail", FailHandler);
    registry.register_agent("echo", EchoHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use uuid::Uuid;

    fn input(config: Value, attempt: u32) -> StepInput {
        let mut variables = Map::new();
        variables.insert("name".to_string(), json!("ada"));
        StepInput {
            workflow_id: "wf".to_string(),
            run_id: Uuid::now_v7(),
            step_id: "s".to_string(),
            attempt,
            variables,
            config,
        }
    }

    #[tokio::test]
    async fn test_echo_merges_config_and_variables() {
        let out = EchoHandler
            .execute(input(json!({"greeting": "hi", "name": "x"}), 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            StepOutcome::Completed(json!({"greeting": "hi", "name": "ada"}))
        );
    }

    #[tokio::test]
    async fn test_constant_prefers_config_value() {
        let handler = ConstantHandler::new(json!(1));
        assert_eq!(
            handler.execute(input(Value::Null, 1)).await.unwrap(),
            StepOutcome::Completed(json!(1))
        );
        assert_eq!(
            handler.execute(input(json!({"value": [2]}), 1)).await.unwrap(),
            StepOutcome::Completed(json!([2]))
        );
    }

    #[tokio::test]
    async fn test_fail_kind_and_succeed_after() {
        let config = json!({"message": "flaky", "kind": "transient", "succeed_after": 2});
        let err = FailHandler.execute(input(config.clone(), 2)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.message, "flaky");
        assert!(FailHandler.execute(input(config, 3)).await.is_ok());
    }

    #[test]
    fn test_register_builtins() {
        let registry = HandlerRegistry::new();
        register_builtins(&registry);
        assert_eq!(registry.function_names(), vec!["constant", "echo", "fail"]);
        assert_eq!(registry.agent_names(), vec!["echo"]);
    }
}
