//! Trailing-edge debounce with a single in-flight job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cloneable trigger for a [`Debouncer`].
#[derive(Clone)]
pub struct DebounceHandle {
    notify: Arc<Notify>,
}

impl DebounceHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Runs `job` once `delay` has passed without a new trigger.
///
/// Triggers inside the window restart the timer. At most one job runs at a
/// time; triggers that arrive while it runs collapse into a single follow-up
/// run that sees the latest state.
pub struct Debouncer {
    handle: DebounceHandle,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(delay: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let waiter = notify.clone();
        let task = tokio::spawn(async move {
            loop {
                waiter.notified().await;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => break,
                        _ = waiter.notified() => continue,
                    }
                }
                job().await;
            }
        });
        Self {
            handle: DebounceHandle { notify },
            task,
        }
    }

    pub fn trigger(&self) {
        self.handle.trigger();
    }

    pub fn handle(&self) -> DebounceHandle {
        self.handle.clone()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
