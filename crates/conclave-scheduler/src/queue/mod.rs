//! Priority admission of model requests against the resource ledger.

pub mod manager;
pub mod ordered;
pub mod request;
pub mod stats;
pub mod tuning;

pub use manager::QueueManager;
pub use ordered::{OrderedQueue, QueueKey};
pub use request::{ModelRequest, Priority, QueueEvent, RequestRunner, RequestSpec, RequestStatus};
pub use stats::{QueueStats, QueueStatus};
pub use tuning::{TuningPolicy, WAIT_EMA_ALPHA};
