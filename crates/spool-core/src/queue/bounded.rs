//! BoundedQueue - 容量固定の FIFO
//!
//! # 実装詳細
//! - `slots` セマフォ: 空き容量。push で 1 つ消費し、pop で返す
//! - `ready` セマフォ: 取り出せる件数。push で 1 つ増やし、pop で消費する
//! - `VecDeque` 本体は std Mutex で守る（ロック中に await しない）
//!
//! tokio のセマフォは FIFO 公平なので、待っている push / pop は到着順に進む。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};

use super::{AdmissionPolicy, QueueError};
use crate::domain::Task;

struct Inner {
    items: VecDeque<Arc<Task>>,
    closed: bool,
}

pub struct BoundedQueue {
    inner: Mutex<Inner>,
    slots: Semaphore,
    ready: Semaphore,
    capacity: usize,
}

impl BoundedQueue {
    /// Queue holding at most `capacity` tasks, clamped to
    /// `1..=Semaphore::MAX_PERMITS`. Storage grows on demand.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait for a free slot, then enqueue.
    pub async fn push(&self, task: Arc<Task>) -> Result<(), QueueError> {
        let permit = self.slots.acquire().await.map_err(|_| QueueError::Closed)?;
        self.admit(permit, task)
    }

    /// Enqueue only if a slot is free right now.
    pub fn try_push(&self, task: Arc<Task>) -> Result<(), QueueError> {
        let permit = self.slots.try_acquire().map_err(|e| match e {
            TryAcquireError::Closed => QueueError::Closed,
            TryAcquireError::NoPermits => QueueError::Full {
                capacity: self.capacity,
            },
        })?;
        self.admit(permit, task)
    }

    /// Wait at most `wait` for a free slot.
    pub async fn push_timeout(&self, task: Arc<Task>, wait: Duration) -> Result<(), QueueError> {
        let permit = tokio::time::timeout(wait, self.slots.acquire())
            .await
            .map_err(|_| QueueError::Full {
                capacity: self.capacity,
            })?
            .map_err(|_| QueueError::Closed)?;
        self.admit(permit, task)
    }

    /// Enqueue according to `policy`.
    pub async fn push_with(
        &self,
        policy: AdmissionPolicy,
        task: Arc<Task>,
    ) -> Result<(), QueueError> {
        match policy {
            AdmissionPolicy::Block => self.push(task).await,
            AdmissionPolicy::Reject => self.try_push(task),
            AdmissionPolicy::Wait(wait) => self.push_timeout(task, wait).await,
        }
    }

    fn admit(&self, permit: SemaphorePermit<'_>, task: Arc<Task>) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            // permit は drop で返却される
            return Err(QueueError::Closed);
        }
        permit.forget();
        inner.items.push_back(task);
        drop(inner);

        self.ready.add_permits(1);
        Ok(())
    }

    /// Take the oldest task, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or once the queue is closed; never an error.
    pub async fn pop(&self, timeout: Duration) -> Option<Arc<Task>> {
        let permit = match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return None,
        };
        permit.forget();

        let task = self.lock().items.pop_front();
        self.slots.add_permits(1);
        task
    }

    /// Refuse further pushes and wake everyone waiting on the queue.
    ///
    /// Tasks already queued stay until `drain()`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slots.close();
        self.ready.close();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<Arc<Task>> {
        self.lock().items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::ServiceConfig;
    use crate::domain::Payload;
    use serde_json::json;
    use tokio::time::Instant;

    fn task(n: i64) -> Arc<Task> {
        let mut p = Payload::new();
        p.insert("n".into(), json!(n));
        Arc::new(Task::create(p))
    }

    fn n_of(task: &Task) -> i64 {
        task.payload()["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let q = BoundedQueue::new(4);
        for n in 0..3 {
            q.push(task(n)).await.unwrap();
        }
        assert_eq!(q.len(), 3);

        for n in 0..3 {
            let t = q.pop(Duration::from_millis(100)).await.unwrap();
            assert_eq!(n_of(&t), n);
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pop_times_out_with_none() {
        let q = BoundedQueue::new(1);
        let start = Instant::now();
        let popped = q.pop(Duration::from_millis(100)).await;
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn push_wakes_pop() {
        let q = Arc::new(BoundedQueue::new(1));
        let popper = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.pop(Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        q.push(task(7)).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(n_of(&popped), 7);
    }

    #[tokio::test]
    async fn push_blocks_at_capacity_until_a_pop() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(task(0)).await.unwrap();
        q.push(task(1)).await.unwrap();

        let pusher = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.push(task(2)).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pusher.is_finished(), "third push should wait for space");
        assert_eq!(q.len(), 2);

        let first = q.pop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(n_of(&first), 0);

        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn try_push_rejects_when_full() {
        let q = BoundedQueue::new(1);
        q.try_push(task(0)).unwrap();
        assert_eq!(q.try_push(task(1)), Err(QueueError::Full { capacity: 1 }));
    }

    #[tokio::test]
    async fn push_timeout_gives_up() {
        let q = BoundedQueue::new(1);
        q.push(task(0)).await.unwrap();

        let start = Instant::now();
        let err = q
            .push_timeout(task(1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 1 });
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn close_wakes_blocked_pusher_and_keeps_items_for_drain() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(task(0)).await.unwrap();

        let pusher = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.push(task(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        q.close();
        let res = tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(QueueError::Closed));

        assert!(q.pop(Duration::from_millis(10)).await.is_none());
        let left = q.drain();
        assert_eq!(left.len(), 1);
        assert_eq!(n_of(&left[0]), 0);
        assert_eq!(q.try_push(task(2)), Err(QueueError::Closed));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(BoundedQueue::new(0).capacity(), 1);
    }

    #[test]
    fn capacity_is_clamped_to_semaphore_limit() {
        assert_eq!(
            BoundedQueue::new(usize::MAX).capacity(),
            Semaphore::MAX_PERMITS
        );
    }

    #[tokio::test]
    async fn max_qps_queue_is_built_without_reserving_storage() {
        let config = ServiceConfig::new("big").qps(u32::MAX);
        config.validate().unwrap();

        let q = BoundedQueue::new(config.queue_capacity());
        assert_eq!(q.capacity(), config.queue_capacity());
        assert!(q.is_empty());

        q.try_push(task(7)).unwrap();
        let popped = q.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(n_of(&popped), 7);
    }
}
