//! Consume strategies - ワーカーがキューから取り出して handler を呼ぶループ
//!
//! # フロー（single）
//! 1. `pop(latency)` で 1 件取り出す（タイムアウトなら何もしない）
//! 2. running にして handler 実行
//! 3. 成功なら result + finished、失敗なら failed
//!
//! # フロー（batch）
//! 1. `pop` した task をローカルバッチに積む
//! 2. 件数が `max_batch_size` に達するか、最初の 1 件から `max_batch_wait`
//!    経過したら flush
//! 3. flush は handler を 1 回呼び、結果を index 順に割り当てる。
//!    エラーまたは件数不一致ならバッチ全体を failed にする
//!
//! handler は別タスクで実行するので、panic してもワーカーは止まらない。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::ConsumeType;
use super::status::ServiceStats;
use crate::domain::{Payload, Task, TaskError};
use crate::ports::{Handler, HandlerError};
use crate::queue::BoundedQueue;

pub(crate) const STOPPED_REASON: &str = "service stopped";

/// Everything one worker needs; each worker owns its own copy.
pub(crate) struct WorkerContext {
    pub worker_id: usize,
    pub service: Arc<str>,
    pub queue: Arc<BoundedQueue>,
    pub handler: Arc<dyn Handler>,
    pub latency: Duration,
    pub max_batch_size: usize,
    pub max_batch_wait: Duration,
    pub cancel: CancellationToken,
    pub stats: Arc<ServiceStats>,
}

impl WorkerContext {
    pub(crate) async fn run(self, consume_type: ConsumeType) {
        tracing::debug!(
            service = %self.service,
            worker_id = self.worker_id,
            %consume_type,
            "worker started"
        );
        match consume_type {
            ConsumeType::Single => self.run_single().await,
            ConsumeType::Batch => self.run_batch().await,
        }
        tracing::debug!(service = %self.service, worker_id = self.worker_id, "worker stopped");
    }

    /// Pop with `timeout`, giving up early on shutdown.
    async fn next_task(&self, timeout: Duration) -> Option<Arc<Task>> {
        // pop は acquire 完了後に await しないので、ここで drop されても task は失われない
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            task = self.queue.pop(timeout) => task,
        }
    }

    async fn run_single(&self) {
        while !self.cancel.is_cancelled() {
            let Some(task) = self.next_task(self.latency).await else {
                continue;
            };
            self.process_one(task).await;
        }
    }

    async fn process_one(&self, task: Arc<Task>) {
        self.settle(&task, task.set_running());

        match self.call_single(&task).await {
            Ok(value) => {
                self.settle(&task, task.finish(value));
                self.stats.record_finished(1);
            }
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    worker_id = self.worker_id,
                    task = %task,
                    error = %err,
                    "consume failed"
                );
                self.settle(&task, task.set_failed(err.to_string()));
                self.stats.record_failed(1);
            }
        }
    }

    async fn call_single(&self, task: &Arc<Task>) -> Result<Value, HandlerError> {
        let handler = Arc::clone(&self.handler);
        let task = Arc::clone(task);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { handler.handle(task.payload(), &cancel).await })
            .await
            .unwrap_or_else(|e| Err(join_error(e)))
    }

    async fn run_batch(&self) {
        let mut batch: Vec<Arc<Task>> = Vec::with_capacity(self.max_batch_size);
        let mut window_start = Instant::now();

        while !self.cancel.is_cancelled() {
            // バッチに残りがあるときは窓の残り時間までしか待たない
            let timeout = if batch.is_empty() {
                self.latency
            } else {
                self.latency
                    .min(self.max_batch_wait.saturating_sub(window_start.elapsed()))
            };

            if let Some(task) = self.next_task(timeout).await {
                if batch.is_empty() {
                    window_start = Instant::now();
                }
                batch.push(task);
            }

            let full = batch.len() >= self.max_batch_size;
            let expired = !batch.is_empty() && window_start.elapsed() >= self.max_batch_wait;
            if full || expired {
                let ready = std::mem::replace(&mut batch, Vec::with_capacity(self.max_batch_size));
                self.flush(ready).await;
            }
        }

        // 停止時にバッチに残っていた分は待っている submit を返すため failed にする
        if !batch.is_empty() {
            tracing::info!(
                service = %self.service,
                worker_id = self.worker_id,
                batch_size = batch.len(),
                "dropping unflushed batch on shutdown"
            );
            for task in &batch {
                self.settle(task, task.set_failed(STOPPED_REASON));
            }
            self.stats.record_failed(batch.len() as u64);
        }
    }

    async fn flush(&self, batch: Vec<Arc<Task>>) {
        let size = batch.len();
        for task in &batch {
            self.settle(task, task.set_running());
        }
        self.stats.record_batch();

        let started = Instant::now();
        let result = self.call_batch(&batch).await.and_then(|results| {
            if results.len() == size {
                Ok(results)
            } else {
                Err(HandlerError::ResultCount {
                    expected: size,
                    actual: results.len(),
                })
            }
        });

        match result {
            Ok(results) => {
                for (task, value) in batch.iter().zip(results) {
                    self.settle(task, task.finish(value));
                }
                self.stats.record_finished(size as u64);
                tracing::debug!(
                    service = %self.service,
                    worker_id = self.worker_id,
                    batch_size = size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch flushed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    worker_id = self.worker_id,
                    batch_size = size,
                    error = %err,
                    "batch consume failed"
                );
                let reason = err.to_string();
                for task in &batch {
                    self.settle(task, task.set_failed(reason.clone()));
                }
                self.stats.record_failed(size as u64);
            }
        }
    }

    async fn call_batch(&self, batch: &[Arc<Task>]) -> Result<Vec<Value>, HandlerError> {
        let handler = Arc::clone(&self.handler);
        let payloads: Vec<Payload> = batch.iter().map(|t| t.payload().clone()).collect();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { handler.handle_batch(&payloads, &cancel).await })
            .await
            .unwrap_or_else(|e| Err(join_error(e)))
    }

    /// Transition errors mean a task was touched out of order; log and move on.
    fn settle(&self, task: &Task, res: Result<(), TaskError>) {
        if let Err(err) = res {
            tracing::warn!(
                service = %self.service,
                worker_id = self.worker_id,
                task = %task,
                error = %err,
                "task state not updated"
            );
        }
    }
}

fn join_error(err: JoinError) -> HandlerError {
    if !err.is_panic() {
        return HandlerError::Cancelled;
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Panicked(message)
}
