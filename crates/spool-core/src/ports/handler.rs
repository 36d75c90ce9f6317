//! Handler trait - ワーカーが呼び出す処理本体
//!
//! # 学習ポイント
//! - async_trait の default method（handle_batch の既定実装）
//! - Object-safe trait として `Arc<dyn Handler>` で共有
//! - クロージャを Handler に変換する FnHandler

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::Payload;

/// Why a handler call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler cancelled")]
    Cancelled,

    #[error("result count mismatch: expected {expected}, got {actual}")]
    ResultCount { expected: usize, actual: usize },

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler は payload を受け取り結果を返す
///
/// # 使用例
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Handler for Echo {
///     async fn handle(&self, payload: &Payload, _cancel: &CancellationToken) -> Result<Value, HandlerError> {
///         Ok(Value::Object(payload.clone()))
///     }
/// }
/// ```
///
/// `cancel` はサービス停止時に cancel される。長い処理は途中で見て
/// `HandlerError::Cancelled` を返してよい。
#[async_trait]
pub trait Handler: Send + Sync {
    /// Label used in logs and service info.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Single mode: one payload in, one result out.
    async fn handle(&self, payload: &Payload, cancel: &CancellationToken)
    -> Result<Value, HandlerError>;

    /// Batch mode: `results[i]` belongs to `payloads[i]`.
    ///
    /// 既定実装は `handle` を順番に呼び、最初のエラーでバッチ全体を失敗にする。
    async fn handle_batch(
        &self,
        payloads: &[Payload],
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, HandlerError> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            results.push(self.handle(payload, cancel).await?);
        }
        Ok(results)
    }
}

/// Adapts an async closure into a single-mode [`Handler`].
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        payload: &Payload,
        _cancel: &CancellationToken,
    ) -> Result<Value, HandlerError> {
        (self.f)(payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Handler for Upper {
        async fn handle(
            &self,
            payload: &Payload,
            _cancel: &CancellationToken,
        ) -> Result<Value, HandlerError> {
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::failed("missing text"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    fn text(s: &str) -> Payload {
        let mut p = Payload::new();
        p.insert("text".into(), json!(s));
        p
    }

    #[tokio::test]
    async fn default_batch_maps_handle_in_order() {
        let cancel = CancellationToken::new();
        let results = Upper
            .handle_batch(&[text("a"), text("b"), text("c")], &cancel)
            .await
            .unwrap();
        assert_eq!(results, vec![json!("A"), json!("B"), json!("C")]);
    }

    #[tokio::test]
    async fn default_batch_fails_whole_batch_on_first_error() {
        let cancel = CancellationToken::new();
        let err = Upper
            .handle_batch(&[text("a"), Payload::new(), text("c")], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::failed("missing text"));
    }

    #[tokio::test]
    async fn default_batch_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Upper.handle_batch(&[text("a")], &cancel).await.unwrap_err();
        assert_eq!(err, HandlerError::Cancelled);
    }

    #[tokio::test]
    async fn fn_handler_uses_given_name() {
        let handler = FnHandler::new("echo", |p: Payload| async move {
            Ok::<_, HandlerError>(Value::Object(p))
        });
        assert_eq!(handler.name(), "echo");

        let out = handler
            .handle(&text("x"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "x"}));
    }

    #[test]
    fn default_name_is_type_name() {
        assert!(Upper.name().ends_with("Upper"));
    }
}
