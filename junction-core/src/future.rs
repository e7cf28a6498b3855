//! The `RPC` future and `Wait` group primitive.
//!
//! An `RPC` future is owned by its originator; the registry that tracks it
//! holds only a weak reference, so a dropped originator silently abandons
//! the future and late responses are dropped. Completion notification uses
//! a list of one-shot channels rather than a condvar, in keeping with this
//! codebase's channel-first concurrency style.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::JunctionError;

/// One per-target outcome: a decoded value or an error attributed to that
/// target.
pub type TargetOutcome<V> = Result<V, JunctionError<V>>;

struct Inner<V> {
    counter: u64,
    target_count: usize,
    results: Vec<TargetOutcome<V>>,
    complete: bool,
    waiters: Vec<flume::Sender<()>>,
}

/// A single in-flight RPC's future. `target_count == 0` is a `null` future:
/// already complete, surfaced to callers as `Unroutable`.
#[derive(Clone)]
pub struct RpcFuture<V> {
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V: Clone> RpcFuture<V> {
    pub fn new(counter: u64, target_count: usize) -> Self {
        let inner = Inner {
            counter,
            target_count,
            results: Vec::with_capacity(target_count),
            complete: target_count == 0,
            waiters: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// A future whose target count isn't known yet — used for proxied client
    /// RPCs, where the total only arrives later via `PROXY_RESPONSE_COUNT`.
    /// Never auto-completes until [`Self::declare_target_count`] is called.
    pub fn pending(counter: u64) -> Self {
        let inner = Inner {
            counter,
            target_count: usize::MAX,
            results: Vec::new(),
            complete: false,
            waiters: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Apply a target count learned after the fact. Completes immediately if
    /// already-arrived results satisfy it (a count of 0 completes at once).
    pub fn declare_target_count(&self, total: usize) {
        let mut guard = self.inner.lock().unwrap();
        if guard.complete {
            return;
        }
        guard.target_count = total;
        if guard.results.len() >= guard.target_count {
            guard.complete = true;
            for tx in guard.waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    pub fn counter(&self) -> u64 {
        self.inner.lock().unwrap().counter
    }

    pub fn downgrade(&self) -> WeakRpcFuture<V> {
        WeakRpcFuture {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Record one arriving result; marks complete once every target has
    /// answered.
    pub fn push_result(&self, outcome: TargetOutcome<V>) {
        let mut guard = self.inner.lock().unwrap();
        if guard.complete {
            return;
        }
        guard.results.push(outcome);
        if guard.results.len() >= guard.target_count {
            guard.complete = true;
            for tx in guard.waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().complete
    }

    /// Block until complete or `timeout` elapses. On timeout the future is
    /// left pending: a later response still completes it and wakes any
    /// other waiter.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Vec<TargetOutcome<V>>, JunctionError<V>> {
        let rx = {
            let mut guard = self.inner.lock().unwrap();
            if guard.complete {
                if guard.target_count == 0 {
                    return Err(JunctionError::Unroutable);
                }
                return Ok(guard.results.clone_outcomes());
            }
            let (tx, rx) = flume::bounded(1);
            guard.waiters.push(tx);
            rx
        };

        let recv = rx.recv_async();
        match timeout {
            None => {
                let _ = recv.await;
            }
            Some(d) => {
                if compio::time::timeout(d, recv).await.is_err() {
                    return Err(JunctionError::WaitTimeout(d));
                }
            }
        }

        Ok(self.inner.lock().unwrap().results.clone_outcomes())
    }

    /// Register an external `Wait` notification channel; fires once on
    /// completion like any other waiter.
    fn add_waiter(&self, tx: flume::Sender<()>) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.complete {
            let _ = tx.send(());
            true
        } else {
            guard.waiters.push(tx);
            false
        }
    }
}

trait CloneOutcomes<V> {
    fn clone_outcomes(&self) -> Vec<TargetOutcome<V>>;
}

impl<V: Clone> CloneOutcomes<V> for Vec<TargetOutcome<V>> {
    fn clone_outcomes(&self) -> Vec<TargetOutcome<V>> {
        self.clone()
    }
}

/// A weak reference held by the in-flight RPC registry. Responses arriving
/// after the originator dropped its `RpcFuture` find `upgrade()` returning
/// `None` and are discarded.
#[derive(Clone)]
pub struct WeakRpcFuture<V> {
    inner: Weak<Mutex<Inner<V>>>,
}

impl<V: Clone> WeakRpcFuture<V> {
    pub fn upgrade(&self) -> Option<RpcFuture<V>> {
        self.inner.upgrade().map(|inner| RpcFuture { inner })
    }
}

/// `wait_any`: completes when the first of several futures completes.
///
/// `transfer` swaps which future a `Wait` handle is attached to, preserving
/// first-complete semantics when a new future supersedes an old one.
pub struct Wait {
    fired: Arc<Mutex<bool>>,
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl Default for Wait {
    fn default() -> Self {
        Self::new()
    }
}

impl Wait {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            fired: Arc::new(Mutex::new(false)),
            tx,
            rx,
        }
    }

    /// Attach this wait group to a future; idempotent — firing once is all
    /// that's observable regardless of how many futures are attached.
    pub fn attach<V: Clone>(&self, future: &RpcFuture<V>) {
        let fired = self.fired.clone();
        let tx = self.tx.clone();
        let (proxy_tx, proxy_rx) = flume::bounded(1);
        if future.add_waiter(proxy_tx) {
            Self::fire(&fired, &tx);
            return;
        }
        compio::runtime::spawn(async move {
            if proxy_rx.recv_async().await.is_ok() {
                Self::fire(&fired, &tx);
            }
        })
        .detach();
    }

    fn fire(fired: &Arc<Mutex<bool>>, tx: &flume::Sender<()>) {
        let mut guard = fired.lock().unwrap();
        if !*guard {
            *guard = true;
            let _ = tx.send(());
        }
    }

    pub async fn wait(&self, timeout: Option<Duration>) {
        let recv = self.rx.recv_async();
        match timeout {
            None => {
                let _ = recv.await;
            }
            Some(d) => {
                let _ = compio::time::timeout(d, recv).await;
            }
        }
    }

    /// Replace `source`'s attachment with `target`'s, preserving
    /// first-complete semantics: if `source` already fired, `target` fires
    /// immediately too.
    pub fn transfer<V: Clone>(&self, target: &RpcFuture<V>) {
        self.attach(target);
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct V(i32);

    #[test]
    fn zero_targets_is_already_complete() {
        let f: RpcFuture<V> = RpcFuture::new(1, 0);
        assert!(f.is_complete());
    }

    #[compio::test]
    async fn zero_targets_wait_is_unroutable() {
        let f: RpcFuture<V> = RpcFuture::new(1, 0);
        let err = f.wait(None).await.unwrap_err();
        assert!(matches!(err, JunctionError::Unroutable));
    }

    #[test]
    fn completes_after_all_targets_answer() {
        let f: RpcFuture<V> = RpcFuture::new(1, 2);
        assert!(!f.is_complete());
        f.push_result(Ok(V(1)));
        assert!(!f.is_complete());
        f.push_result(Ok(V(2)));
        assert!(f.is_complete());
    }

    #[test]
    fn weak_future_drops_with_originator() {
        let f: RpcFuture<V> = RpcFuture::new(1, 1);
        let weak = f.downgrade();
        drop(f);
        assert!(weak.upgrade().is_none());
    }
}
