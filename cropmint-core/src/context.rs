use crate::config::WorkerConfig;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Process-wide state built once at startup and handed to every component.
///
/// Holds the validated configuration and the runtime that drives the async
/// I/O behind the sync store and ledger interfaces.
#[derive(Clone)]
pub struct WorkerContext {
    config: Arc<WorkerConfig>,
    runtime: Arc<Runtime>,
}

impl WorkerContext {
    /// Create a context with its own runtime
    pub fn new(config: WorkerConfig) -> Result<Self, std::io::Error> {
        // Two workers leave room for the shutdown listener next to a firing thread
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cropmint-io")
            .enable_all()
            .build()?;

        Ok(Self::with_runtime(config, Arc::new(runtime)))
    }

    /// Create a context around an existing runtime
    pub fn with_runtime(config: WorkerConfig, runtime: Arc<Runtime>) -> Self {
        Self {
            config: Arc::new(config),
            runtime,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.runtime)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
