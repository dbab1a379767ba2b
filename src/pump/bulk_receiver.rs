use std::future::Future;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use crate::error::WireResult;

type InFlight<T> = Arc<OnceCell<WireResult<Option<T>>>>;

/// Coalesces reads from an external object: there is at most one read in flight at any time,
///  and every caller that arrives while it is pending gets its result instead of issuing a read
///  of its own.
///
/// `Ok(None)` is the object's way of saying that it was closed.
pub struct BulkReceiver<T> {
    in_flight: Mutex<Option<InFlight<T>>>,
}

impl<T> Default for BulkReceiver<T> {
    fn default() -> Self {
        BulkReceiver {
            in_flight: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send + Sync> BulkReceiver<T> {
    pub fn new() -> BulkReceiver<T> {
        BulkReceiver::default()
    }

    /// Join the pending read, or start a new one by calling `read`
    pub async fn receive<F, Fut>(&self, read: F) -> WireResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WireResult<Option<T>>>,
    {
        let cell = self.in_flight.lock()
            .get_or_insert_with(Default::default)
            .clone();

        let result = cell.get_or_init(read).await.clone();

        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            *in_flight = None;
        }
        result
    }

    pub fn is_reading(&self) -> bool {
        self.in_flight.lock().is_some()
    }
}
