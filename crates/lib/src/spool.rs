//! Conversation spool: keyed, one-shot handoff of inbound messages to the
//! conversation that is waiting for them.
//!
//! A consumer registers with [`Spool::wait`] before the message arrives; the
//! adapter calls [`Spool::dispatch`] for every inbound message. A dispatch
//! resolves at most one waiter (the oldest one registered for that key) or, when
//! nobody is waiting, hands the message back so the adapter can start a new
//! conversation with it.
//!
//! Registration and removal are synchronous and never span an await point, so
//! the registry stays consistent even when a resolved consumer immediately
//! registers again.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// How the spool treats a second `wait` on a key that already has a live waiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Waiters on the same key queue up; each dispatch resolves the oldest one.
    #[default]
    Queue,
    /// Only one live waiter per key; another `wait` fails with `DuplicateWaiter`.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpoolError {
    #[error("a waiter is already registered for this conversation")]
    DuplicateWaiter,
    /// The waiter was cancelled or the spool was cleared before a message arrived.
    #[error("waiter closed before a message arrived")]
    Closed,
}

/// Identity of one registered waiter, used for explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Outcome of [`Spool::dispatch`].
#[derive(Debug)]
pub enum Dispatch<M> {
    /// A waiter took the message and was removed from the registry.
    Consumed,
    /// Nobody was waiting on the key; the message is handed back unchanged.
    Unconsumed(M),
}

impl<M> Dispatch<M> {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Dispatch::Consumed)
    }
}

struct Pending<K, M> {
    id: WaiterId,
    key: K,
    tx: oneshot::Sender<M>,
}

struct Registry<K, M> {
    waiters: Vec<Pending<K, M>>,
    next_id: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of conversations waiting on messages `M` for keys `K`.
pub struct Spool<K, M> {
    inner: Arc<Mutex<Registry<K, M>>>,
    policy: WaitPolicy,
}

impl<K, M> Clone for Spool<K, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy,
        }
    }
}

impl<K: PartialEq, M> Default for Spool<K, M> {
    fn default() -> Self {
        Self::new(WaitPolicy::default())
    }
}

impl<K: PartialEq, M> Spool<K, M> {
    pub fn new(policy: WaitPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                waiters: Vec::new(),
                next_id: 0,
            })),
            policy,
        }
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    /// Register interest in the next message on `key`. The registration is in
    /// place when this returns; awaiting the returned [`Waiter`] yields the message.
    pub fn wait(&self, key: K) -> Result<Waiter<K, M>, SpoolError> {
        let mut reg = lock(&self.inner);
        reg.waiters.retain(|p| !p.tx.is_closed());
        if self.policy == WaitPolicy::Exclusive && reg.waiters.iter().any(|p| p.key == key) {
            return Err(SpoolError::DuplicateWaiter);
        }
        let id = WaiterId(reg.next_id);
        reg.next_id += 1;
        let (tx, rx) = oneshot::channel();
        reg.waiters.push(Pending { id, key, tx });
        Ok(Waiter {
            id,
            rx,
            spool: Arc::downgrade(&self.inner),
            done: false,
        })
    }

    /// Deliver `message` to the oldest waiter registered for `key`.
    ///
    /// The waiter is removed before it is resolved. Returns the message in
    /// `Dispatch::Unconsumed` when no live waiter exists; the registry is then unchanged.
    pub fn dispatch(&self, key: &K, mut message: M) -> Dispatch<M> {
        loop {
            let pending = {
                let mut reg = lock(&self.inner);
                let Some(pos) = reg
                    .waiters
                    .iter()
                    .position(|p| p.key == *key && !p.tx.is_closed())
                else {
                    return Dispatch::Unconsumed(message);
                };
                reg.waiters.remove(pos)
            };
            match pending.tx.send(message) {
                Ok(()) => return Dispatch::Consumed,
                // Receiver went away between the scan and the send; try the next one.
                Err(returned) => message = returned,
            }
        }
    }

    /// Remove a specific pending waiter. Returns false if it was already resolved or gone.
    pub fn cancel(&self, id: WaiterId) -> bool {
        let mut reg = lock(&self.inner);
        let before = reg.waiters.len();
        reg.waiters.retain(|p| p.id != id);
        reg.waiters.len() != before
    }

    /// Drop every pending waiter; each resolves to `SpoolError::Closed`. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<Pending<K, M>> = std::mem::take(&mut lock(&self.inner).waiters);
        drained.len()
    }

    pub fn is_waiting(&self, key: &K) -> bool {
        lock(&self.inner)
            .waiters
            .iter()
            .any(|p| p.key == *key && !p.tx.is_closed())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner)
            .waiters
            .iter()
            .filter(|p| !p.tx.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered wait. Resolves to the dispatched message.
///
/// Dropping an unresolved waiter deregisters it, so a wait abandoned by a
/// timeout cannot swallow a later message on the same key.
pub struct Waiter<K, M> {
    id: WaiterId,
    rx: oneshot::Receiver<M>,
    spool: Weak<Mutex<Registry<K, M>>>,
    done: bool,
}

impl<K, M> Unpin for Waiter<K, M> {}

impl<K, M> Waiter<K, M> {
    pub fn id(&self) -> WaiterId {
        self.id
    }
}

impl<K, M> Future for Waiter<K, M> {
    type Output = Result<M, SpoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(res) => {
                this.done = true;
                Poll::Ready(res.map_err(|_| SpoolError::Closed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<K, M> Drop for Waiter<K, M> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        // A dispatch may have resolved this waiter just before it was dropped.
        if self.rx.try_recv().is_ok() {
            log::warn!("spool: waiter {:?} dropped unpolled; its message is lost", self.id);
        }
        if let Some(inner) = self.spool.upgrade() {
            let id = self.id;
            lock(&inner).waiters.retain(|p| p.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_resolves_waiter_once() {
        let spool: Spool<&str, String> = Spool::default();
        let w = spool.wait("chan1").unwrap();
        assert!(spool.dispatch(&"chan1", "hello".to_string()).is_consumed());
        assert_eq!(w.await.unwrap(), "hello");
        assert!(spool.is_empty());

        match spool.dispatch(&"chan1", "again".to_string()) {
            Dispatch::Unconsumed(m) => assert_eq!(m, "again"),
            Dispatch::Consumed => panic!("no waiter should remain"),
        }
    }

    #[tokio::test]
    async fn dispatch_never_crosses_keys() {
        let spool: Spool<&str, &str> = Spool::default();
        let a = spool.wait("a").unwrap();
        let b = spool.wait("b").unwrap();
        assert!(spool.dispatch(&"b", "for b").is_consumed());
        assert!(spool.is_waiting(&"a"));
        assert!(!spool.is_waiting(&"b"));
        assert!(spool.dispatch(&"a", "for a").is_consumed());
        assert_eq!(a.await.unwrap(), "for a");
        assert_eq!(b.await.unwrap(), "for b");
    }

    #[tokio::test]
    async fn queued_waiters_resolve_in_registration_order() {
        let spool: Spool<&str, &str> = Spool::new(WaitPolicy::Queue);
        let w1 = spool.wait("k").unwrap();
        let w2 = spool.wait("k").unwrap();
        assert_eq!(spool.len(), 2);
        assert!(spool.dispatch(&"k", "m1").is_consumed());
        assert_eq!(spool.len(), 1);
        assert!(spool.dispatch(&"k", "m2").is_consumed());
        assert_eq!(w1.await.unwrap(), "m1");
        assert_eq!(w2.await.unwrap(), "m2");
    }

    #[test]
    fn exclusive_policy_rejects_second_waiter() {
        let spool: Spool<&str, &str> = Spool::new(WaitPolicy::Exclusive);
        let _first = spool.wait("k").unwrap();
        assert_eq!(spool.wait("k").err(), Some(SpoolError::DuplicateWaiter));
        assert!(spool.wait("other").is_ok());
    }

    #[test]
    fn exclusive_policy_allows_wait_after_drop() {
        let spool: Spool<&str, &str> = Spool::new(WaitPolicy::Exclusive);
        let first = spool.wait("k").unwrap();
        drop(first);
        assert!(spool.wait("k").is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_resolved() {
        let spool: Spool<&str, &str> = Spool::default();
        let w = spool.wait("k").unwrap();
        assert!(spool.cancel(w.id()));
        assert!(!spool.cancel(w.id()));
        assert!(!spool.dispatch(&"k", "late").is_consumed());
        assert_eq!(w.await, Err(SpoolError::Closed));
    }

    #[tokio::test]
    async fn timed_out_wait_deregisters_itself() {
        let spool: Spool<&str, &str> = Spool::default();
        let w = spool.wait("k").unwrap();
        let res = tokio::time::timeout(Duration::from_millis(10), w).await;
        assert!(res.is_err());
        assert!(spool.is_empty());
        assert!(!spool.dispatch(&"k", "unrelated").is_consumed());
    }

    #[tokio::test]
    async fn clear_closes_pending_waiters() {
        let spool: Spool<&str, &str> = Spool::default();
        let a = spool.wait("a").unwrap();
        let b = spool.wait("b").unwrap();
        assert_eq!(spool.clear(), 2);
        assert_eq!(a.await, Err(SpoolError::Closed));
        assert_eq!(b.await, Err(SpoolError::Closed));
        assert!(!spool.dispatch(&"a", "x").is_consumed());
    }

    #[tokio::test]
    async fn resolved_consumer_can_wait_again_on_same_key() {
        let spool: Spool<&str, &str> = Spool::default();
        let reader = {
            let spool = spool.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..2 {
                    got.push(spool.wait("k").unwrap().await.unwrap());
                }
                got
            })
        };
        for msg in ["one", "two"] {
            while !spool.is_waiting(&"k") {
                tokio::task::yield_now().await;
            }
            assert!(spool.dispatch(&"k", msg).is_consumed());
        }
        assert_eq!(reader.await.unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn message_handed_to_unpolled_waiter_counts_as_consumed() {
        let spool: Spool<&str, String> = Spool::default();
        let w = spool.wait("k").unwrap();
        assert!(spool.dispatch(&"k", "in flight".to_string()).is_consumed());
        drop(w);
        assert!(spool.is_empty());
        assert!(!spool.dispatch(&"k", "next".to_string()).is_consumed());
    }
}
