// Shared helpers: logging setup and retry

pub mod logger;
pub mod retry;

pub use logger::init_logger;
pub use retry::{with_retry, RetryPolicy};
