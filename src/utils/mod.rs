mod retry;

pub use retry::{delay_schedule, retry_with_backoff, RetryConfig, RetryResult};
