//! Named worker pools with explicit task submission and cancellation.

use crate::config::PoolConfig;
use crate::errors::{CacheError, Result};
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A dedicated multi-thread runtime. Work submitted here cannot starve, or be
/// starved by, another pool.
pub struct WorkerPool {
    name: String,
    runtime: Option<Runtime>,
    handle: Handle,
    root: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(format!("{}-worker", name))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        log::debug!("Started worker pool '{}' with {} thread(s)", name, threads.max(1));
        Ok(Self {
            name: name.to_string(),
            runtime: Some(runtime),
            handle,
            root: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the future built by `task` on this pool. The task receives its own
    /// cancellation token, a child of the pool's token.
    pub fn submit<T, F, Fut>(&self, task_name: &str, task: F) -> TaskHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.root.child_token();
        let join = self.handle.spawn(task(cancel.clone()));
        log::debug!("Submitted '{}' to pool '{}'", task_name, self.name);
        TaskHandle {
            name: format!("{}/{}", self.name, task_name),
            join,
            cancel,
        }
    }

    /// Cancels every task submitted to this pool.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.root.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub struct TaskHandle<T> {
    name: String,
    join: JoinHandle<T>,
    cancel: CancellationToken,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative shutdown; the task decides when to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<T> {
        self.join
            .await
            .map_err(|err| CacheError::TaskFailed(format!("{}: {}", self.name, err)))
    }
}

/// The three pools the engine runs on.
pub struct WorkerPools {
    pub producer: WorkerPool,
    pub consumer: WorkerPool,
    pub events: WorkerPool,
}

impl WorkerPools {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        Ok(Self {
            producer: WorkerPool::new("rebuild-producer", config.producer_threads)?,
            consumer: WorkerPool::new("rebuild-consumer", config.consumer_threads)?,
            events: WorkerPool::new("event-processor", config.event_threads)?,
        })
    }

    pub fn cancel_all(&self) {
        self.producer.cancel_all();
        self.consumer.cancel_all();
        self.events.cancel_all();
    }
}
