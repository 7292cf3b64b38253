//! Application state wiring the engine to the configured store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use weaver_core::step::builtin::register_builtins;
use weaver_core::step::HandlerRegistry;
use weaver_core::workflow::{discover_workflows, Engine};
use weaver_infra::config::{load_engine_config, open_repository, resolve_data_dir};
use weaver_types::workflow::WorkflowDefinition;

/// Shared state for one CLI invocation.
pub struct AppState {
    pub engine: Engine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data dir, load `config.toml` and open the state store.
    pub async fn init(data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir(data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let repository = open_repository(&data_dir, &config.storage)
            .await
            .context("Failed to open workflow state store")?;

        let handlers = HandlerRegistry::new();
        register_builtins(&handlers);

        let engine = Engine::builder()
            .boxed_repository(repository)
            .handlers(handlers)
            .config(config)
            .build();

        Ok(Self { engine, data_dir })
    }

    /// Default directory for workflow definitions.
    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    /// Register every workflow found under `dir` (default: `workflows_dir`).
    ///
    /// Definitions that fail to register are skipped with a warning.
    pub fn load_workflows(&self, dir: Option<&Path>) -> anyhow::Result<usize> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| self.workflows_dir());
        let found = discover_workflows(&dir)
            .with_context(|| format!("Failed to scan workflows in {}", dir.display()))?;

        let mut registered = 0;
        for (path, def) in found {
            let id = workflow_id_for(&path, &def);
            match self.engine.register_workflow(&id, def) {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping workflow");
                }
            }
        }
        tracing::debug!(registered, dir = %dir.display(), "workflows loaded");
        Ok(registered)
    }
}

/// The registry key for a definition: its `id`, or the file stem when empty.
pub fn workflow_id_for(path: &Path, def: &WorkflowDefinition) -> String {
    if !def.id.is_empty() {
        return def.id.clone();
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow")
        .to_string()
}
