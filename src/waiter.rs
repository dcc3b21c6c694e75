//! Correlates outgoing requests with incoming replies (§4.C).
//!
//! The typical pattern is: a caller registers a [`WaiterRegistry::wait`]
//! for a key, then sends the request; a message handler looks up the key
//! and calls [`WaiterRegistry::complete`]. There is no causal order between
//! the two: a `complete` that arrives before the matching `wait` is
//! registered is silently discarded, so callers must enroll the wait
//! first.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::WaiterError;

/// A composite key identifying a pending awaiter: a message code plus zero
/// or more discriminators (username, filename, token, ...). Equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    code: u32,
    qualifiers: Vec<String>,
}

impl WaitKey {
    /// A key with no qualifiers, e.g. a reply keyed only by message code.
    pub fn code(code: u32) -> Self {
        Self {
            code,
            qualifiers: Vec::new(),
        }
    }

    /// A key qualified by one or more discriminators, applied in order.
    pub fn qualified(code: u32, qualifiers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            code,
            qualifiers: qualifiers.into_iter().map(Into::into).collect(),
        }
    }
}

type Tx<T> = oneshot::Sender<std::result::Result<T, WaiterError>>;

/// A registry of pending single-shot awaiters keyed by [`WaitKey`]. Each
/// key holds a FIFO queue of waiters: `complete` satisfies the head,
/// `throw_all` fails every waiter enrolled under that key.
pub struct WaiterRegistry<T> {
    waiters: Mutex<HashMap<WaitKey, VecDeque<Tx<T>>>>,
}

impl<T: Send + 'static> WaiterRegistry<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Enrolls a wait for `key`, optionally bounded by `timeout`, resolving
    /// when [`complete`](Self::complete) or [`throw`](Self::throw) targets
    /// this key, the timeout elapses, or `cancel` fires.
    pub async fn wait(&self, key: WaitKey, timeout: Option<Duration>) -> std::result::Result<T, WaiterError> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push_back(tx);

        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(v)) => v,
                Ok(Err(_)) => Err(WaiterError::Shutdown),
                Err(_) => {
                    self.remove_waiter(&key);
                    Err(WaiterError::Timeout)
                }
            },
            None => match rx.await {
                Ok(v) => v,
                Err(_) => Err(WaiterError::Shutdown),
            },
        };
        result
    }

    /// Like [`wait`](Self::wait), but also resolves with
    /// [`WaiterError::Cancelled`] if `cancelled` completes first.
    pub async fn wait_cancellable(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancelled: impl std::future::Future<Output = ()>,
    ) -> std::result::Result<T, WaiterError> {
        tokio::select! {
            result = self.wait(key.clone(), timeout) => result,
            _ = cancelled => {
                self.remove_waiter(&key);
                Err(WaiterError::Cancelled)
            }
        }
    }

    /// Removes (at most) one enrolled waiter for `key` without resolving
    /// it; used to clean up after a timeout or cancellation fired via a
    /// mechanism other than dropping the receiver.
    fn remove_waiter(&self, key: &WaitKey) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(queue) = waiters.get_mut(key) {
            if queue.is_empty() {
                waiters.remove(key);
            }
        }
    }

    /// Satisfies the oldest waiter enrolled for `key`, if any. A no-op if
    /// there is none.
    pub fn complete(&self, key: &WaitKey, value: T)
    where
        T: Clone,
    {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(queue) = waiters.get_mut(key) {
            while let Some(tx) = queue.pop_front() {
                if tx.send(Ok(value.clone())).is_ok() {
                    break;
                }
                // the waiter already gave up (timed out/cancelled); try the
                // next one in the FIFO queue
            }
            if queue.is_empty() {
                waiters.remove(key);
            }
        }
    }

    /// Fails the oldest waiter enrolled for `key` with `err`. A no-op if
    /// there is none.
    pub fn throw(&self, key: &WaitKey, err: WaiterError) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(queue) = waiters.get_mut(key) {
            if let Some(tx) = queue.pop_front() {
                let _ = tx.send(Err(err));
            }
            if queue.is_empty() {
                waiters.remove(key);
            }
        }
    }

    /// Fails every waiter enrolled for `key` with `err` (used when a
    /// connection the key was tied to is torn down).
    pub fn throw_all(&self, key: &WaitKey, err: WaiterError)
    where
        WaiterError: Clone,
    {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(queue) = waiters.remove(key) {
            for tx in queue {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Fails every waiter registered under any key. Invoked on teardown
    /// (e.g. server disconnection, per §7: "Connection-level errors
    /// propagate to every pending waiter on that connection").
    pub fn cancel_all(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for (_, queue) in waiters.drain() {
            for tx in queue {
                let _ = tx.send(Err(WaiterError::Shutdown));
            }
        }
    }
}

impl<T: Send + 'static> Default for WaiterRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn complete_before_wait_is_discarded() {
        let registry: Arc<WaiterRegistry<u32>> = Arc::new(WaiterRegistry::new());
        let key = WaitKey::code(1);
        // completing with no waiter enrolled is a no-op
        registry.complete(&key, 7);

        let result = tokio::time::timeout(Duration::from_millis(50), registry.wait(key, None)).await;
        assert!(result.is_err(), "wait should still be pending");
    }

    #[tokio::test]
    async fn wait_resolves_on_complete() {
        let registry: Arc<WaiterRegistry<u32>> = Arc::new(WaiterRegistry::new());
        let key = WaitKey::code(1);

        let registry2 = Arc::clone(&registry);
        let key2 = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry2.complete(&key2, 42);
        });

        let value = registry.wait(key, None).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let registry: WaiterRegistry<u32> = WaiterRegistry::new();
        let key = WaitKey::code(1);
        let result = registry.wait(key, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(WaiterError::Timeout)));
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_per_key() {
        let registry: Arc<WaiterRegistry<u32>> = Arc::new(WaiterRegistry::new());
        let key = WaitKey::code(1);

        let registry2 = Arc::clone(&registry);
        let wait1 = tokio::spawn({
            let registry = Arc::clone(&registry);
            let key = key.clone();
            async move { registry.wait(key, None).await }
        });
        // give the first wait time to enroll before the second
        tokio::time::sleep(Duration::from_millis(5)).await;
        let wait2 = tokio::spawn({
            let registry = Arc::clone(&registry2);
            let key = key.clone();
            async move { registry.wait(key, None).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        registry.complete(&key, 1);
        registry.complete(&key, 2);

        assert_eq!(wait1.await.unwrap().unwrap(), 1);
        assert_eq!(wait2.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn throw_all_fails_every_waiter_for_a_key() {
        let registry: Arc<WaiterRegistry<u32>> = Arc::new(WaiterRegistry::new());
        let key = WaitKey::code(1);
        let a = tokio::spawn({
            let registry = Arc::clone(&registry);
            let key = key.clone();
            async move { registry.wait(key, None).await }
        });
        let b = tokio::spawn({
            let registry = Arc::clone(&registry);
            let key = key.clone();
            async move { registry.wait(key, None).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.throw_all(&key, WaiterError::Shutdown);
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
    }
}
