//! spool-core
//!
//! Bounded task dispatch core: submit から handler 実行、完了通知まで。
//!
//! # モジュール構成
//! - **domain**: TaskId, Task, TaskStatus, TaskSnapshot
//! - **ports**: 差し込み口（Handler, Clock, IdGenerator）
//! - **queue**: 容量固定の FIFO と受付ポリシー
//! - **app**: Service, ワーカー, consume 戦略, ServiceRegistry
//! - **error**: サービス呼び出し側に返すエラー

pub mod app;
pub mod domain;
pub mod error;
pub mod ports;
pub mod queue;

pub use app::{ConsumeType, Service, ServiceConfig, ServiceRegistry};
pub use domain::{Payload, Task, TaskId, TaskSnapshot, TaskStatus};
pub use error::ServiceError;
pub use ports::{Handler, HandlerError};
pub use queue::{AdmissionPolicy, BoundedQueue};
