//! Clock collaborator interface.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use time::OffsetDateTime;

/// Time source the runtime reads instead of the ambient clock.
///
/// `now` feeds the transition context (the pure function never reads a clock
/// itself); `timer` backs sleeps and flow timeouts. The default
/// [`SystemClock`] uses tokio's timer wheel, so tests running under a paused
/// tokio runtime get deterministic, auto-advancing time.
pub trait Clock: Send + Sync + 'static {
    /// The current wall-clock instant.
    fn now(&self) -> OffsetDateTime;

    /// A one-shot timer completing after `duration`.
    fn timer(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Wall-clock time and tokio timers.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn timer(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
