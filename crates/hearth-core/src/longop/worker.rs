//! The extension point for long operations.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use super::progress::Progress;
use crate::ipc::stream::{StreamReader, StreamWriter};
use crate::Result;

/// A long operation executed on behalf of the peer process.
///
/// The manager calls `initialize_execution` on the thread that received the
/// request, then `execute` once on a long-task worker thread. Implementations
/// poll [`Progress::has_been_canceled`] and return early when it is set.
pub trait LongOpWorker: Send {
    /// Read the configuration sent with the request. An error finishes the
    /// operation with a failure result without scheduling it.
    fn initialize_execution(&mut self, config: &mut StreamReader, document_guid: Uuid)
        -> Result<()>;

    /// Do the work, reporting completion through `progress` and writing the
    /// result payload to `result`.
    fn execute(&mut self, progress: &Progress, result: &mut StreamWriter) -> Result<()>;
}

type WorkerFactory = Arc<dyn Fn() -> Box<dyn LongOpWorker> + Send + Sync>;

/// Maps operation type names to worker factories.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `type_name`, replacing an earlier registration.
    pub fn register<F, W>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: LongOpWorker + 'static,
    {
        self.factories.insert(
            type_name.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn LongOpWorker>),
        );
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F, W>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: LongOpWorker + 'static,
    {
        self.register(type_name, factory);
        self
    }

    pub fn create(&self, type_name: &str) -> Option<Box<dyn LongOpWorker>> {
        self.factories.get(type_name).map(|factory| factory())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
