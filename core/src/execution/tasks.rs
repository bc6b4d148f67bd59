//! Worker pool for long-running labeling operations
//!
//! Graph construction, mapper fitting and label spreading are CPU-bound and
//! run here, off the interactive thread. Every submission returns a
//! [`TaskHandle`] that the caller polls or waits on; handles started for a
//! block carry that block's identity so that results arriving after the
//! active block changed can be recognised and discarded.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::data::BlockId;

/// Error types for task execution
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("Task {0} timed out")]
    Timeout(u64),

    #[error("Channel closed for task {0}")]
    ChannelClosed(u64),

    #[error("Worker thread panicked: {0}")]
    WorkerPanic(String),

    #[error("Failed to build worker pool: {0}")]
    PoolCreation(String),
}

/// Task execution result envelope
#[derive(Debug)]
enum TaskResult<T> {
    Success(T),
    Error(TaskExecutionError),
}

/// Future-like handle for a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: u64,
    label: String,
    block: Option<BlockId>,
    receiver: Receiver<TaskResult<T>>,
    submitted_at: Instant,
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block this task was started for, if any
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// True once a result (or failure) is ready to collect
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Blocks until the task completes
    pub fn wait(self) -> Result<T, TaskExecutionError> {
        match self.receiver.recv() {
            Ok(TaskResult::Success(result)) => Ok(result),
            Ok(TaskResult::Error(error)) => Err(error),
            Err(_) => Err(TaskExecutionError::ChannelClosed(self.task_id)),
        }
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, TaskExecutionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(TaskResult::Success(result)) => Ok(result),
            Ok(TaskResult::Error(error)) => Err(error),
            Err(RecvTimeoutError::Timeout) => Err(TaskExecutionError::Timeout(self.task_id)),
            Err(RecvTimeoutError::Disconnected) => Err(TaskExecutionError::ChannelClosed(self.task_id)),
        }
    }

    /// Non-blocking poll: `Ok(None)` while the task is still running
    pub fn try_result(&self) -> Result<Option<T>, TaskExecutionError> {
        match self.receiver.try_recv() {
            Ok(TaskResult::Success(result)) => Ok(Some(result)),
            Ok(TaskResult::Error(error)) => Err(error),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TaskExecutionError::ChannelClosed(self.task_id)),
        }
    }
}

/// Unordered worker pool backed by rayon
pub struct TaskRunner {
    pool: Arc<ThreadPool>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("threads", &self.pool.current_num_threads())
            .field("submitted", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskRunner {
    /// Creates a pool; `threads == 0` lets rayon pick one per core
    pub fn new(threads: usize) -> Result<Self, TaskExecutionError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("hyperclass-worker-{index}"))
            .panic_handler(|payload| {
                error!("Background task panicked: {}", panic_message(payload.as_ref()));
            })
            .build()
            .map_err(|e| TaskExecutionError::PoolCreation(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Submits a task and returns its handle
    pub fn start<T, F>(&self, label: impl Into<String>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(label.into(), None, task)
    }

    /// Submits a task tagged with the block it operates on
    pub fn start_for_block<T, F>(&self, block: BlockId, label: impl Into<String>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(label.into(), Some(block), task)
    }

    /// Fire-and-forget submission; a panic is logged by the pool handler
    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = label.into();
        self.pool.spawn(move || {
            let started = Instant::now();
            task();
            debug!("Task {label} completed in {:?}", started.elapsed());
        });
    }

    fn submit<T, F>(&self, label: String, block: Option<BlockId>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let task_label = label.clone();
        self.pool.spawn(move || {
            let started = Instant::now();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => TaskResult::Success(result),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Task {task_label} [{task_id}] panicked: {message}");
                    TaskResult::Error(TaskExecutionError::WorkerPanic(message))
                }
            };
            debug!("Task {task_label} [{task_id}] finished in {:?}", started.elapsed());
            // The handle may have been dropped; the result is then unwanted.
            let _ = sender.send(outcome);
        });
        TaskHandle {
            task_id,
            label,
            block,
            receiver,
            submitted_at: Instant::now(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
