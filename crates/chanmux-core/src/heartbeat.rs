//! Idle heartbeat timer.
//!
//! One recurring timer per multiplexer. Every inbound transport message calls
//! [`Heartbeat::arm`], which aborts the running timer task before spawning a
//! new one, so heartbeats only go out after a full idle interval and there is
//! never more than one timer alive.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Action run on every timer expiry.
pub type BeatFn = Arc<dyn Fn() + Send + Sync>;

/// Owned, cancelable heartbeat timer.
pub struct Heartbeat {
    interval: Duration,
    beat: BeatFn,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(interval: Duration, beat: BeatFn) -> Self {
        Self {
            interval,
            beat,
            timer: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancel any running timer and start a fresh one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let interval = self.interval;
        let beat = self.beat.clone();
        *timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                trace!("Heartbeat interval elapsed");
                beat();
            }
        }));
    }

    /// Cancel the running timer, if any.
    pub fn disarm(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.disarm();
    }
}
