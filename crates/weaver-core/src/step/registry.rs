//! Name-indexed registry of step handlers.
//!
//! Function and agent handlers live in separate namespaces: a function step
//! names its `handler`, an agent step names its `agent`.

use std::sync::Arc;

use dashmap::DashMap;

use super::box_handler::BoxStepHandler;
use super::handler::StepHandler;

/// Shared handler registry. Clones see the same handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    functions: Arc<DashMap<String, BoxStepHandler>>,
    agents: Arc<DashMap<String, BoxStepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function handler. Replaces any handler with the same name.
    pub fn register_function<H: StepHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.functions
            .insert(name.into(), BoxStepHandler::new(handler));
    }

    /// Register an agent. Replaces any agent with the same name.
    pub fn register_agent<H: StepHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.agents.insert(name.into(), BoxStepHandler::new(handler));
    }

    pub fn function(&self, name: &str) -> Option<BoxStepHandler> {
        self.functions.get(name).map(|h| h.value().clone())
    }

    pub fn agent(&self, name: &str) -> Option<BoxStepHandler> {
        self.agents.get(name).map(|h| h.value().clone())
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Registered agent names, sorted.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("functions", &self.function_names())
            .field("agents", &self.agent_names())
            .finish()
    }
}
