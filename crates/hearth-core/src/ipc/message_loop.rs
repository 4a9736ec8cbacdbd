//! Dedicated I/O thread that drives channel connections.

use std::future::Future;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::IpcConfig;
use crate::Result;

/// Owns a single-threaded tokio runtime on its own named thread.
///
/// Channels spawn their connection tasks here, so every receive callback runs
/// on this thread. Dropping the loop stops it without waiting for tasks.
pub struct MessageLoop {
    runtime: Option<Runtime>,
}

impl MessageLoop {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(IpcConfig::MESSAGE_LOOP_THREAD_NAME)
            .enable_io()
            .enable_time()
            .build()?;
        debug!("Message loop started");
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Handle for spawning work onto the loop.
    pub fn handle(&self) -> Handle {
        match &self.runtime {
            Some(runtime) => runtime.handle().clone(),
            None => unreachable!("runtime only taken in drop"),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn(future)
    }

    /// `true` when called from the loop's own thread.
    pub fn is_loop_thread() -> bool {
        std::thread::current().name() == Some(IpcConfig::MESSAGE_LOOP_THREAD_NAME)
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("Message loop stopped");
        }
    }
}

impl std::fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLoop").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_work_runs_on_loop_thread() {
        let message_loop = MessageLoop::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        message_loop.spawn(async move {
            tx.send(MessageLoop::is_loop_thread()).unwrap();
        });

        assert!(rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap());
        assert!(!MessageLoop::is_loop_thread());
    }
}
