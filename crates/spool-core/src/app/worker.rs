//! WorkerGroup - 同じキューを共有するワーカー群

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::ConsumeType;
use super::consume::WorkerContext;

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーに停止を伝える
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    label: String,
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn one worker per context, all running `consume_type`.
    pub(crate) fn spawn(
        label: impl Into<String>,
        consume_type: ConsumeType,
        cancel: CancellationToken,
        contexts: Vec<WorkerContext>,
    ) -> Self {
        let joins = contexts
            .into_iter()
            .map(|ctx| tokio::spawn(ctx.run(consume_type)))
            .collect();

        Self {
            label: label.into(),
            cancel,
            joins,
        }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers.
    /// In-flight handler calls see the cancelled token but are not aborted.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let total = self.joins.len();
        for (idx, join) in self.joins.into_iter().enumerate() {
            tracing::info!(group = %self.label, "begin to join {idx}/{total}");
            if let Err(e) = join.await {
                tracing::error!(group = %self.label, error = %e, "worker {idx} ended abnormally");
            }
            tracing::info!(group = %self.label, "finish join {idx}/{total}");
        }
    }
}
