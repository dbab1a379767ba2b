use tokio::sync::Notify;
use crate::util::once_flag::OnceFlag;

/// A one-way async event: once opened, it stays open, and every current or future `wait()`
///  returns.
#[derive(Debug, Default)]
pub struct Latch {
    open: OnceFlag,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Latch {
        Latch::default()
    }

    /// Returns `true` for the call that actually opened the latch
    pub fn open(&self) -> bool {
        let first = self.open.set();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.open.is_set()
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use super::*;

    #[tokio::test]
    async fn test_open_wakes_all_waiters() {
        let latch = Arc::new(Latch::new());
        let waiters = (0..3)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.wait().await })
            })
            .collect::<Vec<_>>();

        tokio::task::yield_now().await;
        assert!(latch.open());
        assert!(!latch.open());

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        }
        // late waiters return right away
        tokio::time::timeout(Duration::from_secs(1), latch.wait()).await.unwrap();
    }
}
