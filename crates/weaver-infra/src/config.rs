//! Engine configuration loader and storage selection for Weaver.
//!
//! Reads `config.toml` from the data directory (`~/.weaver/` unless
//! `WEAVER_DATA_DIR` is set) into [`EngineConfig`], and opens the
//! repository backend it names.

use std::path::{Path, PathBuf};

use weaver_core::repository::{BoxWorkflowRepository, InMemoryWorkflowRepository};
use weaver_types::config::{EngineConfig, StorageBackend, StorageConfig};
use weaver_types::error::RepositoryError;

use crate::filesystem::store::FileWorkflowRepository;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WEAVER_DATA_DIR";

/// Resolve the data directory.
///
/// Priority: explicit override, then `WEAVER_DATA_DIR`, then `~/.weaver`,
/// then `./.weaver` when no home directory is known.
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".weaver")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and
///   returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Where the configured backend keeps its state.
///
/// Relative `path` values are joined onto the data dir. Defaults are
/// `weaver.db` for SQLite and `state/` for the file store.
pub fn storage_path(data_dir: &Path, storage: &StorageConfig) -> PathBuf {
    let default = match storage.backend {
        StorageBackend::Sqlite => "weaver.db",
        StorageBackend::File | StorageBackend::Memory => "state",
    };
    let path = Path::new(storage.path.as_deref().unwrap_or(default));
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

/// Open the repository backend named by `storage`.
pub async fn open_repository(
    data_dir: &Path,
    storage: &StorageConfig,
) -> Result<BoxWorkflowRepository, RepositoryError> {
    let path = storage_path(data_dir, storage);
    match storage.backend {
        StorageBackend::Sqlite => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            }
            let pool = DatabasePool::open(&path).await.map_err(|e| {
                tracing::warn!("Failed to open database {}: {e}", path.display());
                RepositoryError::Connection
            })?;
            tracing::debug!("Using SQLite state store at {}", path.display());
            Ok(BoxWorkflowRepository::new(SqliteWorkflowRepository::new(
                pool,
            )))
        }
        StorageBackend::File => {
            let repo = FileWorkflowRepository::open(&path).await?;
            tracing::debug!("Using file state store at {}", path.display());
            Ok(BoxWorkflowRepository::new(repo))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory state store; suspensions will not survive exit");
            Ok(BoxWorkflowRepository::new(InMemoryWorkflowRepository::new()))
        }
    }
}
