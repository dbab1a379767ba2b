use std::future::{poll_fn, Future};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::Notify;
use crate::util::once_flag::OnceFlag;

/// Cooperative cancellation. Clones share state, and a child token is canceled when its parent
///  is, but not vice versa.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    canceled: OnceFlag,
    notify: Notify,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: Arc::new(CancelInner {
                canceled: OnceFlag::new(),
                notify: Notify::new(),
                parent: Some(self.clone()),
            })
        }
    }

    pub fn cancel(&self) {
        if self.inner.canceled.set() {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_canceled(&self) -> bool {
        if self.inner.canceled.is_set() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_canceled(),
            None => false,
        }
    }

    /// Resolves once this token (or one of its ancestors) is canceled
    pub async fn canceled(&self) {
        let mut chain = vec![self];
        let mut cur = self;
        while let Some(parent) = &cur.inner.parent {
            chain.push(parent);
            cur = parent;
        }

        loop {
            let mut notified = chain.iter()
                .map(|t| Box::pin(t.inner.notify.notified()))
                .collect::<Vec<_>>();
            // register before checking the flags to avoid losing a concurrent cancel()
            for n in notified.iter_mut() {
                n.as_mut().enable();
            }
            if self.is_canceled() {
                return;
            }

            poll_fn(|cx| {
                for n in notified.iter_mut() {
                    if n.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(());
                    }
                }
                Poll::Pending
            }).await;
        }
    }
}
