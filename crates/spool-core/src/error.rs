use thiserror::Error;

use crate::app::config::ConfigError;

/// Errors surfaced to whoever calls into a service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service {name} is overloaded (queue capacity {capacity})")]
    Overloaded { name: String, capacity: usize },

    #[error("service {0} is stopped")]
    Stopped(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
