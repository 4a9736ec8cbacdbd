//! Centralized configuration for Hearth.
//!
//! Wire constants and timing live on const-holder structs; the task scheduler
//! and the long operation manager additionally take runtime config structs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire and connection constants shared by both ends of a channel.
pub struct IpcConfig;

impl IpcConfig {
    /// Frame magic, the ASCII bytes `USED` read as a little-endian u32.
    pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"USED");
    /// Size of the frame header: magic + payload length.
    pub const FRAME_HEADER_SIZE: usize = 8;
    /// Maximum payload size of a single frame (16 MiB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    /// Delay between client connection attempts while the server is not up yet.
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
    /// How long a disconnect keeps writing frames that were queued before it.
    pub const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
    /// Initial capacity of the inbound accumulator.
    pub const READ_BUFFER_CAPACITY: usize = 64 * 1024;
    /// Name of the dedicated I/O thread.
    pub const MESSAGE_LOOP_THREAD_NAME: &'static str = "hearth-ipc";
    /// Prefix used for pipe names that are not already filesystem paths.
    pub const PIPE_NAME_PREFIX: &'static str = "hearth-";
    /// Version announced in the process handshake.
    pub const PROTOCOL_VERSION: u32 = 1;
}

/// Task scheduler constants.
pub struct TaskConfig;

impl TaskConfig {
    /// How long a thread blocked in `wait_for_group` sleeps before looking for
    /// helpable work again.
    pub const GROUP_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);
    /// Reserve threads spawned per worker type on top of the steady-state pool.
    pub const DEFAULT_RESERVE_WORKERS: usize = 2;
}

/// Pool sizing for one worker thread type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Threads that keep pulling work while the queue is non-empty.
    pub max_workers_to_use: usize,
    /// Additional threads that absorb bursts one task at a time.
    pub reserve_workers: usize,
}

impl WorkerPoolConfig {
    pub fn new(max_workers_to_use: usize, reserve_workers: usize) -> Self {
        Self {
            max_workers_to_use,
            reserve_workers,
        }
    }

    /// Total number of threads spawned for this pool.
    pub fn total(&self) -> usize {
        self.max_workers_to_use + self.reserve_workers
    }
}

/// Runtime configuration for the task system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSystemConfig {
    pub short_tasks: WorkerPoolConfig,
    pub long_tasks: WorkerPoolConfig,
    pub file_access: WorkerPoolConfig,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        // One core is left to the thread that drives the application.
        let short = cores.saturating_sub(1).max(2);
        let long = (cores / 2).max(2);

        Self {
            short_tasks: WorkerPoolConfig::new(short, TaskConfig::DEFAULT_RESERVE_WORKERS),
            long_tasks: WorkerPoolConfig::new(long, TaskConfig::DEFAULT_RESERVE_WORKERS),
            file_access: WorkerPoolConfig::new(2, 1),
        }
    }
}

/// Runtime configuration for the long operation manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LongOpConfig {
    /// Progress updates closer than this to the last forwarded value are not
    /// sent. `0.0` forwards every update. 0% and 100% are always forwarded.
    pub progress_min_delta: f32,
}

impl Default for LongOpConfig {
    fn default() -> Self {
        Self {
            progress_min_delta: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_magic_is_used_ascii() {
        assert_eq!(IpcConfig::FRAME_MAGIC.to_le_bytes(), *b"USED");
        assert_eq!(IpcConfig::MAX_MESSAGE_SIZE, 16_777_216);
    }

    #[test]
    fn test_default_pools_are_usable() {
        let config = TaskSystemConfig::default();
        assert!(config.short_tasks.max_workers_to_use >= 2);
        assert!(config.long_tasks.max_workers_to_use >= 2);
        assert_eq!(
            config.long_tasks.total(),
            config.long_tasks.max_workers_to_use + TaskConfig::DEFAULT_RESERVE_WORKERS
        );
    }

    #[test]
    fn test_longop_default_forwards_every_update() {
        assert_eq!(LongOpConfig::default().progress_min_delta, 0.0);
    }
}
