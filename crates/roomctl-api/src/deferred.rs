//! C1: a one-shot awaitable that can be resolved from outside the task
//! that awaits it.
//!
//! Built on [`tokio::sync::watch`] rather than [`tokio::sync::oneshot`]
//! because several callers may race to await the same handshake step (a
//! connect attempt racing a second concurrent `connect` call) — `watch`
//! lets every clone observe the settled value, where `oneshot` only
//! delivers to a single receiver.

use tokio::sync::watch;

/// An awaitable that settles at most once. `resolve` is a no-op once the
/// deferred has already settled, matching "may be completed at most once;
/// subsequent awaits return the settled outcome immediately".
#[derive(Debug, Clone)]
pub struct Deferred<T: Clone + Send + Sync + 'static> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Settle the deferred. Subsequent calls are ignored — first write wins.
    pub fn resolve(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(value);
                true
            }
        });
    }

    /// True once `resolve` has been called.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the settled value. Returns immediately if already settled.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            // `changed` only errors if every sender was dropped, which
            // cannot happen while `self` (holding `tx`) is alive.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_pending_waiter() {
        let deferred = Deferred::new();
        let waiter = deferred.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        deferred.resolve(42);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn already_settled_returns_immediately() {
        let deferred = Deferred::new();
        deferred.resolve("first");
        assert_eq!(deferred.wait().await, "first");
    }

    #[tokio::test]
    async fn second_resolve_is_ignored() {
        let deferred = Deferred::new();
        deferred.resolve(1);
        deferred.resolve(2);
        assert_eq!(deferred.wait().await, 1);
    }

    #[tokio::test]
    async fn multiple_waiters_all_observe_same_value() {
        let deferred: Deferred<u32> = Deferred::new();
        let a = deferred.clone();
        let b = deferred.clone();
        let ha = tokio::spawn(async move { a.wait().await });
        let hb = tokio::spawn(async move { b.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        deferred.resolve(7);
        assert_eq!(ha.await.unwrap(), 7);
        assert_eq!(hb.await.unwrap(), 7);
    }
}
