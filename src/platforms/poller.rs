use log::{debug, info};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Shortest period a timer accepts; `interval` panics on zero
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Cancellable repeating timer used where a platform offers no push API.
///
/// Fires once immediately, then every `period`. Each tick runs as its own task, so a
/// slow or failing tick never delays or stops the next one. Cancelling stops future
/// ticks; a tick already in flight is left to finish.
pub struct RepeatingTask {
    name: String,
    period: Duration,
    timer: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let timer_name = name.clone();
        let period = period.max(MIN_PERIOD);

        let timer = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Poller '{}' armed, every {:?}", timer_name, period);

            loop {
                ticker.tick().await;
                debug!("Poller '{}' tick", timer_name);
                tokio::spawn(tick());
            }
        });

        Self {
            name,
            period,
            timer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the timer will still fire
    pub fn is_armed(&self) -> bool {
        !self.timer.is_finished()
    }

    /// Stop the timer. Idempotent.
    pub fn cancel(&self) {
        if !self.timer.is_finished() {
            self.timer.abort();
            info!("Poller '{}' cancelled", self.name);
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
