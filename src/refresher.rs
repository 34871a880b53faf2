//! A background thread that periodically triggers a datafile refresh.

use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`RefresherThread`].
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// Interval to wait between refreshes.
    pub interval: Duration,
    /// Jitter applies a randomized duration subtracted from the interval.
    /// This helps to avoid a fleet of clients synchronizing and producing
    /// spiky load on the datafile endpoint.
    ///
    /// Defaults to [`RefresherConfig::DEFAULT_JITTER`].
    pub jitter: Duration,
}

impl RefresherConfig {
    /// Default value for [`RefresherConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);

    pub fn new(interval: Duration) -> RefresherConfig {
        RefresherConfig {
            interval,
            jitter: RefresherConfig::DEFAULT_JITTER.min(interval / 10),
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> RefresherConfig {
        self.jitter = jitter;
        self
    }
}

/// A periodic refresh thread.
///
/// The thread sleeps for (jittered) `interval`, invokes the tick callback,
/// and repeats until stopped. The callback runs on the refresher thread,
/// never on the caller's.
pub(crate) struct RefresherThread {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the refresher thread.
    stop_sender: SyncSender<()>,
}

impl RefresherThread {
    /// Spawn the refresher thread.
    pub(crate) fn start(
        config: RefresherConfig,
        tick: impl Fn() + Send + 'static,
    ) -> std::io::Result<RefresherThread> {
        // `sync_channel` with a buffer of 1 makes `stop_sender` shareable
        // between threads; `try_send` on a full buffer just means another
        // thread already requested a stop.
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("featurekit-refresher".to_owned())
            .spawn(move || loop {
                let timeout = jitter(config.interval, config.jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                    }
                    Ok(()) => {
                        log::debug!(target: "featurekit", "refresher thread received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        // The sending side is gone; there is nobody left to
                        // stop us, so stop ourselves.
                        log::debug!(target: "featurekit", "refresher thread disconnected");
                        return;
                    }
                }
            })?;

        Ok(RefresherThread {
            join_handle,
            stop_sender,
        })
    }

    /// Ask the thread to stop. Does not wait for it to exit.
    pub(crate) fn stop(&self) {
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and block waiting for it to exit.
    pub(crate) fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::RefresherThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn jitter_never_exceeds_interval() {
        let interval = Duration::from_secs(30);
        for _ in 0..100 {
            assert!(jitter(interval, Duration::from_secs(30)) <= interval);
        }
    }

    #[test]
    fn jitter_saturates_at_zero() {
        assert_eq!(
            jitter(Duration::ZERO, Duration::from_secs(30)),
            Duration::ZERO
        );
    }

    #[test]
    fn zero_jitter_keeps_the_interval() {
        let interval = Duration::from_secs(30);
        assert_eq!(jitter(interval, Duration::ZERO), interval);
    }

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let thread = {
            let ticks = ticks.clone();
            RefresherThread::start(
                RefresherConfig::new(Duration::from_millis(10)).with_jitter(Duration::ZERO),
                move || {
                    ticks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };

        std::thread::sleep(Duration::from_millis(200));
        thread.shutdown().unwrap();

        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown >= 1);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }
}
