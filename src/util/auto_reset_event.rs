use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use crate::util::cancel::CancelToken;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Canceled,
}

/// An async auto-reset event: `set()` wakes all tasks currently waiting, or - if nobody is
///  waiting - leaves the event signaled so that the next `wait()` returns immediately. Every
///  successful wait resets the event.
///
/// NB: Being woken is a hint, not a guarantee: callers re-check whatever predicate they are
///      waiting for after every wake-up
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    signaled: AtomicBool,
    notify: Notify,
}

impl AutoResetEvent {
    pub fn new() -> AutoResetEvent {
        AutoResetEvent::default()
    }

    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Wait for whichever comes first: the event, the timeout, or cancellation
    pub async fn wait(&self, timeout: Duration, cancel: Option<&CancelToken>) -> WaitOutcome {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.signaled.swap(false, Ordering::AcqRel) {
            return WaitOutcome::Signaled;
        }
        if cancel.map(|c| c.is_canceled()).unwrap_or(false) {
            return WaitOutcome::Canceled;
        }

        let canceled = async {
            match cancel {
                Some(c) => c.canceled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = notified => {
                self.signaled.store(false, Ordering::Release);
                WaitOutcome::Signaled
            }
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = canceled => WaitOutcome::Canceled,
        }
    }
}
