use std::time::Duration;

/// Parameters for one long-poll read of a queue.
///
/// The store leases at most `batch_size` items for `visibility_timeout`,
/// waiting up to `max_poll` and re-checking every `poll_interval` while the
/// queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollParams {
    pub batch_size: u32,
    pub visibility_timeout: Duration,
    pub max_poll: Duration,
    pub poll_interval: Duration,
}
