//! Shared periodic ticks.
//!
//! Feedback timers are subscriber-based: one 20 ms, one 100 ms and one
//! 1 s interval per worker, fanned out over broadcast channels. Sessions
//! subscribe instead of spawning a timer task per connection; a handler
//! must finish well within its tick.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Monotonic microseconds stamped on each tick.
pub type TickInstant = i64;

pub struct Tickers {
    pub tick_20ms: broadcast::Sender<TickInstant>,
    pub tick_100ms: broadcast::Sender<TickInstant>,
    pub tick_1s: broadcast::Sender<TickInstant>,
    tasks: Vec<JoinHandle<()>>,
}

impl Tickers {
    /// Spawns the three driver tasks on the current runtime.
    pub fn start(clock: std::sync::Arc<dyn shared::time::Clock>) -> Self {
        let (tick_20ms, _) = broadcast::channel(4);
        let (tick_100ms, _) = broadcast::channel(4);
        let (tick_1s, _) = broadcast::channel(4);

        let mut tasks = Vec::new();
        for (sender, period) in [
            (tick_20ms.clone(), Duration::from_millis(20)),
            (tick_100ms.clone(), Duration::from_millis(100)),
            (tick_1s.clone(), Duration::from_secs(1)),
        ] {
            let clock = clock.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    // Nobody subscribed yet is fine; send only errs then.
                    let _ = sender.send(clock.now_us());
                }
            }));
        }

        Self {
            tick_20ms,
            tick_100ms,
            tick_1s,
            tasks,
        }
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Tickers {
    fn drop(&mut self) {
        self.stop();
    }
}
