use std::time::Duration;

use futures::future::BoxFuture;

/// "Run this after that delay" collaborator used by the health monitor.
///
/// The delay belongs to the scheduler, so callers never hold locks across it.
pub trait Scheduler: Send + Sync {
    fn run_after(&self, delay: Duration, task: BoxFuture<'static, ()>);
}
