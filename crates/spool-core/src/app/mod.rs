//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **ServiceConfig**: qps / batch / worker 数 / 受付ポリシー
//! - **Service**: submit → queue → worker → 完了通知
//! - **WorkerGroup**: 同じキューを共有するワーカー群
//! - **consume**: single / batch の取り出し戦略
//! - **ServiceRegistry**: ホストプロセスが持つサービス一覧
//! - **status**: 観測用のカウンタとサービス情報

pub mod config;
mod consume;
pub mod registry;
pub mod service;
pub mod status;
pub mod worker;

// 主要な型を再エクスポート
pub use self::config::{ConfigError, ConsumeType, ServiceConfig};
pub use self::registry::{RegistryError, ServiceRegistry};
pub use self::service::Service;
pub use self::status::{ServiceInfo, ServiceStats, ServiceStatus};
pub use self::worker::WorkerGroup;
