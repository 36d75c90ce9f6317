//! Queue module: bounded FIFO between submitters and workers.

mod bounded;

pub use bounded::BoundedQueue;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full (capacity={capacity})")]
    Full { capacity: usize },

    #[error("queue is closed")]
    Closed,
}

/// What `push` does when the queue is at capacity.
///
/// - `Block`: wait for a free slot (the only backpressure is the caller stalling)
/// - `Reject`: fail immediately with `QueueError::Full`
/// - `Wait(d)`: wait at most `d`, then fail with `QueueError::Full`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    #[default]
    Block,
    Reject,
    Wait(Duration),
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Block => f.write_str("block"),
            AdmissionPolicy::Reject => f.write_str("reject"),
            AdmissionPolicy::Wait(d) => write!(f, "wait:{}", d.as_millis()),
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    /// `block` | `reject` | `wait:<millis>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "block" => Ok(AdmissionPolicy::Block),
            "reject" => Ok(AdmissionPolicy::Reject),
            other => {
                let millis = other
                    .strip_prefix("wait:")
                    .and_then(|ms| ms.parse::<u64>().ok())
                    .ok_or_else(|| format!("unknown admission policy '{other}'"))?;
                Ok(AdmissionPolicy::Wait(Duration::from_millis(millis)))
            }
        }
    }
}
