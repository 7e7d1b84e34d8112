//! Debounced trigger
//!
//! Batches bursts of signals into a single action: every signal restarts a
//! quiet-period timer and the action runs once the timer fires with no newer
//! signal. After firing, the timer is parked far in the future until the
//! next signal. An action that fails re-signals the trigger, so it is retried
//! after another quiet period.
//!
//! Used by the engine for observer fan-out and by the bundle publisher for
//! uploads.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Maximum queued signals; beyond this a fire is already pending
pub const SIGNAL_CAPACITY: usize = 1000;

/// How far out the timer is parked between bursts (about one year)
pub const PARKED: Duration = Duration::from_secs(365 * 24 * 3600);

/// Cloneable, non-blocking handle for signalling a [`DebouncedTrigger`]
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
}

impl TriggerHandle {
    /// Request the action; never blocks
    pub fn signal(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            // A full queue means the loop has plenty of wakeups pending
            Err(TrySendError::Full(())) => debug!("Signal queue full, dropping signal"),
            Err(TrySendError::Closed(())) => debug!("Trigger stopped, dropping signal"),
        }
    }
}

/// A reset-on-signal timer driving one action
#[derive(Debug)]
pub struct DebouncedTrigger {
    name: &'static str,
    quiet: Duration,
    initial_delay: Option<Duration>,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

impl DebouncedTrigger {
    /// Create a trigger that acts `quiet` after the last signal
    pub fn new(name: &'static str, quiet: Duration) -> Self {
        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
        Self {
            name,
            quiet,
            initial_delay: None,
            tx,
            rx,
        }
    }

    /// Also act once, `delay` after the loop starts, without any signal
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run the trigger loop, calling `on_fire` each time the timer fires
    ///
    /// Runs until the task is dropped.
    pub async fn run<F, Fut, E>(self, mut on_fire: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let Self {
            name,
            quiet,
            initial_delay,
            tx,
            mut rx,
        } = self;
        let retry = TriggerHandle { tx };

        let timer = sleep(initial_delay.unwrap_or(PARKED));
        tokio::pin!(timer);

        info!(trigger = name, quiet_secs = quiet.as_secs(), "Starting debounced trigger");

        loop {
            tokio::select! {
                biased;

                Some(()) = rx.recv() => {
                    debug!(trigger = name, "Got update request, waiting for quiet period");
                    timer.as_mut().reset(Instant::now() + quiet);
                }

                () = &mut timer => {
                    timer.as_mut().reset(Instant::now() + PARKED);

                    debug!(trigger = name, "Quiet period elapsed, firing");
                    match on_fire().await {
                        Ok(()) => debug!(trigger = name, "Fired successfully"),
                        Err(e) => {
                            warn!(trigger = name, error = %e, "Action failed, will try again soon");
                            retry.signal();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_trigger(
        trigger: DebouncedTrigger,
        failures: usize,
    ) -> (TriggerHandle, Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<Instant>>>) {
        let handle = trigger.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let fired_at = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let c = count.clone();
        let f = fired_at.clone();
        tokio::spawn(trigger.run(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            f.lock().push(Instant::now());
            async move {
                if n < failures {
                    Err("sink down")
                } else {
                    Ok(())
                }
            }
        }));

        (handle, count, fired_at)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_once_after_last_signal() {
        let (handle, count, fired_at) =
            counting_trigger(DebouncedTrigger::new("test", Duration::from_secs(30)), 0);

        let start = Instant::now();
        handle.signal();
        sleep(Duration::from_secs(10)).await;
        handle.signal();
        let last_signal = Instant::now();

        sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let fired = fired_at.lock()[0];
        assert!(fired >= last_signal + Duration::from_secs(30));
        assert!(fired > start + Duration::from_secs(30));

        // Parked afterwards
        sleep(Duration::from_secs(3600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resignals() {
        let (handle, count, fired_at) =
            counting_trigger(DebouncedTrigger::new("test", Duration::from_secs(30)), 1);

        handle.signal();
        sleep(Duration::from_secs(31)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let fired = fired_at.lock().clone();
        assert!(fired[1] - fired[0] >= Duration::from_secs(30));

        // Second attempt succeeded, nothing further
        sleep(Duration::from_secs(3600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let trigger = DebouncedTrigger::new("test", Duration::from_secs(30))
            .with_initial_delay(Duration::from_secs(5));
        let (_handle, count, _) = counting_trigger(trigger, 0);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_signal_never_fires() {
        let (_handle, count, _) =
            counting_trigger(DebouncedTrigger::new("test", Duration::from_secs(30)), 0);

        sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signal_never_blocks() {
        let trigger = DebouncedTrigger::new("test", Duration::from_secs(30));
        let handle = trigger.handle();

        for _ in 0..(SIGNAL_CAPACITY * 2) {
            handle.signal();
        }
        drop(trigger);
        handle.signal();
    }
}
