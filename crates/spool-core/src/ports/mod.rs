//! Ports - 外部から差し込む抽象
//!
//! Handler は HTTP 層やモデル呼び出しなど、コアの外にある処理そのもの。
//! Clock / IdGenerator はテストで時刻と ID を固定するために trait にしている。

pub mod clock;
pub mod handler;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::handler::{FnHandler, Handler, HandlerError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
