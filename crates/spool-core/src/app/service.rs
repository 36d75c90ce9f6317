//! Service - name / handler / dispatch 設定を束ねる実行単位
//!
//! # ライフサイクル
//! - `new()`: 設定を検証してキューを作る（ワーカーはまだ動かない）
//! - `start()`: `consume_worker` 本のワーカーを起動
//! - `submit()`: task を作ってキューに入れ、終端状態になるまで待つ
//! - `stop()`: ワーカーを止めて join し、キューに残った task を failed にする

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::ServiceConfig;
use super::consume::{STOPPED_REASON, WorkerContext};
use super::status::{ServiceInfo, ServiceStats, ServiceStatus};
use super::worker::WorkerGroup;
use crate::domain::{Payload, Task, TaskSnapshot};
use crate::error::ServiceError;
use crate::ports::{Clock, Handler, IdGenerator, SystemClock, UlidGenerator};
use crate::queue::{BoundedQueue, QueueError};

enum Lifecycle {
    Idle,
    Running(WorkerGroup),
    Stopped,
}

pub struct Service {
    config: ServiceConfig,
    name: Arc<str>,
    handler: Arc<dyn Handler>,
    queue: Arc<BoundedQueue>,
    stats: Arc<ServiceStats>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Service {
    /// Validate `config` and build the queue. Workers start with `start()`.
    pub fn new(config: ServiceConfig, handler: Arc<dyn Handler>) -> Result<Self, ServiceError> {
        config.validate()?;
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity()));
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            config,
            handler,
            queue,
            stats: Arc::new(ServiceStats::default()),
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    /// Token cancelled by `stop()`; handlers receive it on every call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Workers currently spawned (0 unless running).
    pub fn worker_count(&self) -> usize {
        match &*self.lifecycle() {
            Lifecycle::Running(group) => group.len(),
            Lifecycle::Idle | Lifecycle::Stopped => 0,
        }
    }

    /// Launch the worker pool. Must be called from inside a tokio runtime.
    ///
    /// Calling it again while running does nothing.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running(_) => {
                tracing::warn!(service = %self.name, "start() called twice; workers already running");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(ServiceError::Stopped(self.name.to_string())),
            Lifecycle::Idle => {}
        }

        let contexts = (0..self.config.consume_worker)
            .map(|worker_id| WorkerContext {
                worker_id,
                service: Arc::clone(&self.name),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                latency: self.config.latency(),
                max_batch_size: self.config.max_batch_size,
                max_batch_wait: self.config.max_batch_wait,
                cancel: self.cancel.clone(),
                stats: Arc::clone(&self.stats),
            })
            .collect();

        let label = format!("{}_{}", self.name, self.handler.name());
        let group = WorkerGroup::spawn(
            label,
            self.config.consume_type,
            self.cancel.clone(),
            contexts,
        );
        tracing::info!(
            service = %self.name,
            workers = group.len(),
            consume_type = %self.config.consume_type,
            queue_capacity = self.queue.capacity(),
            "service started"
        );
        *lifecycle = Lifecycle::Running(group);
        Ok(())
    }

    /// Stop accepting work, join every worker, and fail whatever is still queued.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);

        self.cancel.cancel();
        self.queue.close();

        if let Lifecycle::Running(group) = previous {
            group.shutdown_and_join().await;
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            tracing::info!(
                service = %self.name,
                count = leftover.len(),
                "failing tasks still queued at shutdown"
            );
            for task in &leftover {
                if let Err(err) = task.set_failed(STOPPED_REASON) {
                    tracing::warn!(service = %self.name, error = %err, "task state not updated");
                }
            }
            self.stats.record_failed(leftover.len() as u64);
        }
        tracing::info!(service = %self.name, "service stopped");
    }

    /// Create a task and admit it to the queue without waiting for the result.
    pub async fn enqueue(&self, payload: Payload) -> Result<Arc<Task>, ServiceError> {
        let task = Arc::new(Task::new(
            self.ids.generate_task_id(),
            payload,
            self.clock.now(),
        ));

        self.queue
            .push_with(self.config.admission, Arc::clone(&task))
            .await
            .map_err(|e| match e {
                QueueError::Full { capacity } => {
                    self.stats.record_rejected();
                    tracing::warn!(service = %self.name, capacity, "queue full; rejecting task");
                    ServiceError::Overloaded {
                        name: self.name.to_string(),
                        capacity,
                    }
                }
                QueueError::Closed => ServiceError::Stopped(self.name.to_string()),
            })?;

        self.stats.record_submitted();
        tracing::debug!(service = %self.name, task = %task, "put task");
        Ok(task)
    }

    /// Submit `payload` and wait until its task is finished or failed.
    pub async fn submit(&self, payload: Payload) -> Result<TaskSnapshot, ServiceError> {
        let started = Instant::now();
        let task = self.enqueue(payload).await?;
        let snapshot = task.wait_terminal().await;

        tracing::info!(
            service = %self.name,
            task_id = %snapshot.task_id,
            status = %snapshot.task_status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task done"
        );
        Ok(snapshot)
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name.to_string(),
            interface: self.config.interface.clone(),
            handler: self.handler.name().to_string(),
            consume_type: self.config.consume_type,
            consume_worker: self.config.consume_worker,
            qps: self.config.qps,
            max_batch_size: self.config.max_batch_size,
            queue_capacity: self.queue.capacity(),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.to_string(),
            running: self.is_running(),
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
            submitted: self.stats.submitted(),
            rejected: self.stats.rejected(),
            finished: self.stats.finished(),
            failed: self.stats.failed(),
            batches: self.stats.batches(),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("handler", &self.handler.name())
            .field("consume_type", &self.config.consume_type)
            .field("running", &self.is_running())
            .field("queued", &self.queue.len())
            .finish()
    }
}
