//! Call deduplication ("singleflight")
//!
//! Concurrent calls that share a key share a single execution: the first caller
//! runs the work, every caller that arrives while it is running waits for it and
//! receives a clone of the same result.
//!
//! ```text
//! A ------->calls work with key<------------------->returns val
//! B --------------------->calls work with key------>returns val
//! ```
//!
//! # Example
//!
//! ```rust
//! use flight_sync::SingleFlight;
//!
//! # futures::executor::block_on(async {
//! let flight: SingleFlight<String, String> = SingleFlight::new();
//!
//! let first = flight
//!     .execute_marked("profile:42", || async { Ok("alice".to_string()) })
//!     .await;
//! assert_eq!(first.result.as_deref(), Ok("alice"));
//! assert!(first.fresh);
//!
//! // Nothing is cached once the call has finished
//! assert_eq!(flight.in_flight(), 0);
//! # });
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace};

use crate::lock::lock;

/// Deduplicates concurrent executions of keyed work
///
/// The registry lock only guards map bookkeeping. The work itself always runs
/// outside of it, so slow work for one key never delays another key.
///
/// `T` and `E` must be `Clone`: every caller sharing an execution receives its
/// own clone of the result. Wrap expensive values in an `Arc`.
pub struct SingleFlight<T, E, K = String> {
    /// In-flight calls, at most one per key
    calls: Mutex<HashMap<K, Arc<Call<T, E>>>>,
}

/// Result of [`SingleFlight::execute_marked`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution<T, E> {
    /// The shared result of the execution
    pub result: Result<T, E>,
    /// `true` if this caller ran the work, `false` if it joined another caller
    pub fresh: bool,
}

/// One execution for a key
struct Call<T, E> {
    state: Mutex<CallState<T, E>>,
}

struct CallState<T, E> {
    /// Set exactly once, then waiters are woken
    settled: Option<Settled<T, E>>,
    next_id: u64,
    waiters: Vec<Waiter>,
}

/// A parked follower, identified so it can leave when dropped
struct Waiter {
    id: u64,
    waker: Waker,
}

enum Settled<T, E> {
    Done(Result<T, E>),
    /// The leader went away without a result (dropped or panicked)
    Abandoned,
}

enum Role<T, E, K> {
    Leader(K, Arc<Call<T, E>>),
    Follower(Arc<Call<T, E>>),
}

impl<T, E, K> SingleFlight<T, E, K>
where
    K: Hash + Eq,
{
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys with an execution currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of callers currently parked on the execution for `key`
    ///
    /// Only counts callers that have been polled at least once. Like
    /// [`in_flight`](Self::in_flight) this is meant for monitoring and tests.
    #[must_use]
    pub fn waiters<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let call = lock(&self.calls).get(key).cloned();
        call.map_or(0, |call| lock(&call.state).waiters.len())
    }

    fn join_or_lead<Q>(&self, key: &Q) -> Role<T, E, K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let mut calls = lock(&self.calls);
        if let Some(call) = calls.get(key) {
            return Role::Follower(Arc::clone(call));
        }

        let call = Arc::new(Call::new());
        calls.insert(key.to_owned(), Arc::clone(&call));
        Role::Leader(key.to_owned(), call)
    }
}

impl<T, E, K> SingleFlight<T, E, K>
where
    T: Clone,
    E: Clone,
    K: Hash + Eq,
{
    /// Run `work` for `key`, or wait for the execution already in flight
    ///
    /// Returns the result of exactly one logical execution among all callers
    /// that overlapped on `key`. Errors are shared verbatim, never retried.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the shared execution of `work`.
    pub async fn execute<Q, F, Fut>(&self, key: &Q, work: F) -> Result<T, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_marked(key, work).await.result
    }

    /// Like [`execute`](Self::execute), also reporting whether this caller ran
    /// the work itself
    ///
    /// If the caller running the work is dropped or panics before finishing,
    /// its waiters start over and one of them runs its own `work`.
    pub async fn execute_marked<Q, F, Fut>(&self, key: &Q, work: F) -> Execution<T, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match self.join_or_lead(key) {
                Role::Follower(call) => {
                    trace!("joining in-flight call");
                    if let Some(result) = (WaitCall { call, id: None }).await {
                        return Execution {
                            result,
                            fresh: false,
                        };
                    }
                    debug!("in-flight call was abandoned, starting over");
                }
                Role::Leader(key, call) => {
                    trace!("starting call");
                    let guard = LeaderGuard {
                        flight: self,
                        key: Some(key),
                        call,
                    };
                    let result = work().await;
                    guard.finish(result.clone());
                    return Execution {
                        result,
                        fresh: true,
                    };
                }
            }
        }
    }
}

impl<T, E, K> Default for SingleFlight<T, E, K>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Call<T, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState {
                settled: None,
                next_id: 0,
                waiters: Vec::new(),
            }),
        }
    }

    fn settle(&self, settled: Settled<T, E>) {
        let waiters = {
            let mut state = lock(&self.state);
            debug_assert!(state.settled.is_none(), "call settled twice");
            state.settled = Some(settled);
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            waiter.waker.wake();
        }
    }
}

/// Removes the call from the registry and settles it, even if the leader never
/// finishes
struct LeaderGuard<'a, T, E, K>
where
    K: Hash + Eq,
{
    flight: &'a SingleFlight<T, E, K>,
    /// `None` once settled
    key: Option<K>,
    call: Arc<Call<T, E>>,
}

impl<T, E, K> LeaderGuard<'_, T, E, K>
where
    K: Hash + Eq,
{
    fn finish(mut self, result: Result<T, E>) {
        self.complete(Settled::Done(result));
    }

    fn complete(&mut self, settled: Settled<T, E>) {
        if let Some(key) = self.key.take() {
            // Unregister first: a caller that misses the key from here on
            // starts a new execution instead of joining this one.
            lock(&self.flight.calls).remove(&key);
            self.call.settle(settled);
        }
    }
}

impl<T, E, K> Drop for LeaderGuard<'_, T, E, K>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        if self.key.is_some() {
            debug!("leader dropped before finishing, abandoning call");
            self.complete(Settled::Abandoned);
        }
    }
}

/// Resolves once the call settles; `None` if it was abandoned
struct WaitCall<T, E> {
    call: Arc<Call<T, E>>,
    /// Registered in `waiters` while `Some`
    id: Option<u64>,
}

impl<T, E> Future for WaitCall<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Option<Result<T, E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = lock(&this.call.state);
        match &state.settled {
            Some(Settled::Done(result)) => {
                let result = result.clone();
                this.id = None;
                Poll::Ready(Some(result))
            }
            Some(Settled::Abandoned) => {
                this.id = None;
                Poll::Ready(None)
            }
            None => {
                let id = *this.id.get_or_insert_with(|| {
                    let id = state.next_id;
                    state.next_id = state.next_id.wrapping_add(1);
                    id
                });
                if let Some(existing) = state.waiters.iter_mut().find(|w| w.id == id) {
                    existing.waker.clone_from(cx.waker());
                } else {
                    state.waiters.push(Waiter {
                        id,
                        waker: cx.waker().clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> Drop for WaitCall<T, E> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            lock(&self.call.state).waiters.retain(|w| w.id != id);
        }
    }
}
