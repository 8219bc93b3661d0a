use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    pub(crate) fn new(handle: tokio::task::AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `tick` every `period` until the returned guard is dropped. Returns
/// `None` when called outside a Tokio runtime.
pub(crate) fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> Option<AbortOnDrop>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let period = period.max(Duration::from_millis(1));
    let task = runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            tick().await;
        }
    });
    Some(AbortOnDrop::new(task.abort_handle()))
}
