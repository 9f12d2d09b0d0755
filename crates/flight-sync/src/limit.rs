//! Counting limiter for bounding concurrent access
//!
//! A [`Limit`] hands out up to `capacity` interchangeable tokens. It does not
//! track who holds a token: matching every borrow with one give-back is the
//! caller's job, and the limiter only refuses to let the count exceed its bound.
//!
//! # Example
//!
//! ```rust
//! use flight_sync::{Limit, LimitError};
//!
//! # futures::executor::block_on(async {
//! // At most two outstanding connections
//! let limit = Limit::new(2);
//!
//! limit.borrow().await;
//! assert!(limit.try_borrow());
//! assert!(!limit.try_borrow()); // Exhausted
//!
//! limit.give_back().unwrap();
//! limit.give_back().unwrap();
//! assert_eq!(limit.give_back(), Err(LimitError::OverReturn));
//! # });
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::LimitError;
use crate::lock::lock;

/// A counting semaphore with over-release detection
///
/// # Design
///
/// - **Lock-free fast path**: `try_borrow` and `give_back` only touch an atomic counter
/// - **FIFO waiters**: parked borrowers are woken in arrival order
/// - **Cloneable**: clones share the same pool of tokens
#[derive(Clone)]
pub struct Limit {
    /// Shared state between all clones of this limit
    inner: Arc<LimitInner>,
}

struct LimitInner {
    /// Tokens not currently borrowed
    available: AtomicUsize,
    /// Fixed number of tokens
    capacity: usize,
    /// Borrowers waiting for a token
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    next_id: u64,
    queue: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    waker: Waker,
}

impl Limit {
    /// Create a limiter handing out at most `capacity` tokens at once
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 (nothing could ever be borrowed)
    ///
    /// # Example
    ///
    /// ```rust
    /// use flight_sync::Limit;
    ///
    /// let limit = Limit::new(8);
    /// assert_eq!(limit.available(), 8);
    /// assert_eq!(limit.capacity(), 8);
    /// ```
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Limit must have a capacity of at least one token");
        Self {
            inner: Arc::new(LimitInner {
                available: AtomicUsize::new(capacity),
                capacity,
                waiters: Mutex::new(Waiters::default()),
            }),
        }
    }

    /// Borrow a token, waiting until one is available
    pub async fn borrow(&self) {
        BorrowFuture {
            limit: self,
            id: None,
        }
        .await;
    }

    /// Borrow a token, parking the current thread until one is available
    ///
    /// For callers running on plain threads. Do not call this from inside an
    /// async runtime worker; use [`borrow`](Self::borrow) there.
    pub fn borrow_blocking(&self) {
        futures::executor::block_on(self.borrow());
    }

    /// Borrow a token if one is immediately available
    ///
    /// Returns `false` without waiting if the pool is exhausted.
    #[must_use]
    pub fn try_borrow(&self) -> bool {
        let mut current = self.inner.available.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return false;
            }

            match self.inner.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back a previously borrowed token
    ///
    /// Wakes the longest-waiting borrower, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::OverReturn`] if no token is currently borrowed.
    /// The count is left untouched in that case.
    pub fn give_back(&self) -> Result<(), LimitError> {
        let mut current = self.inner.available.load(Ordering::Acquire);

        loop {
            if current >= self.inner.capacity {
                return Err(LimitError::OverReturn);
            }

            match self.inner.available.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.wake_next();
        Ok(())
    }

    /// Borrow a token that is given back when the guard is dropped
    pub async fn borrow_guard(&self) -> LimitGuard {
        self.borrow().await;
        LimitGuard {
            limit: self.clone(),
        }
    }

    /// Non-waiting variant of [`borrow_guard`](Self::borrow_guard)
    #[must_use]
    pub fn try_borrow_guard(&self) -> Option<LimitGuard> {
        self.try_borrow().then(|| LimitGuard {
            limit: self.clone(),
        })
    }

    /// Number of tokens that can be borrowed right now
    ///
    /// Useful for monitoring; the value may change immediately after reading.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Total number of tokens
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of tokens currently borrowed
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.available()
    }

    fn wake_next(&self) {
        let next = lock(&self.inner.waiters).queue.pop_front();
        if let Some(waiter) = next {
            waiter.waker.wake();
        }
    }
}

/// A borrowed token that is given back on drop
///
/// Returned by [`Limit::borrow_guard`] and [`Limit::try_borrow_guard`].
#[must_use = "the token is given back as soon as the guard is dropped"]
pub struct LimitGuard {
    limit: Limit,
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        // Only fails if a raw give_back() already returned this token
        let _ = self.limit.give_back();
    }
}

struct BorrowFuture<'a> {
    limit: &'a Limit,
    /// Queue entry, assigned on first park
    id: Option<u64>,
}

impl Future for BorrowFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.limit.try_borrow() {
            this.leave_queue();
            return Poll::Ready(());
        }

        let mut waiters = lock(&this.limit.inner.waiters);

        // give_back() bumps the counter before taking this lock, so a token
        // returned since the check above is either visible now or its wake-up
        // will find the waker registered below.
        if this.limit.try_borrow() {
            if let Some(id) = this.id.take() {
                waiters.queue.retain(|waiter| waiter.id != id);
            }
            return Poll::Ready(());
        }

        let id = *this.id.get_or_insert_with(|| {
            let id = waiters.next_id;
            waiters.next_id = waiters.next_id.wrapping_add(1);
            id
        });

        if let Some(existing) = waiters.queue.iter_mut().find(|waiter| waiter.id == id) {
            existing.waker.clone_from(cx.waker());
        } else {
            waiters.queue.push_back(Waiter {
                id,
                waker: cx.waker().clone(),
            });
        }

        Poll::Pending
    }
}

impl BorrowFuture<'_> {
    /// Drop our queue entry; returns whether it was still queued
    fn leave_queue(&mut self) -> bool {
        let Some(id) = self.id.take() else {
            return true;
        };

        let mut waiters = lock(&self.limit.inner.waiters);
        let before = waiters.queue.len();
        waiters.queue.retain(|waiter| waiter.id != id);
        waiters.queue.len() != before
    }
}

impl Drop for BorrowFuture<'_> {
    fn drop(&mut self) {
        if self.id.is_some() && !self.leave_queue() {
            // We were woken for a token but never took it; pass the wake-up on
            self.limit.wake_next();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    use super::*;
    use futures::poll;
    use futures::task::{waker, ArcWake};
    use rstest::rstest;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    /// Waker that records whether it was woken
    #[derive(Default)]
    struct WakeFlag(AtomicBool);

    impl ArcWake for WakeFlag {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.store(true, Ordering::SeqCst);
        }
    }

    impl WakeFlag {
        fn woken(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_limit_new() {
        let limit = Limit::new(100);
        assert_eq!(limit.available(), 100);
        assert_eq!(limit.capacity(), 100);
        assert_eq!(limit.in_use(), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(16)]
    fn test_try_borrow_stops_at_capacity(#[case] capacity: usize) {
        let limit = Limit::new(capacity);

        for _ in 0..capacity {
            assert!(limit.try_borrow());
        }
        assert!(!limit.try_borrow());
        assert_eq!(limit.in_use(), capacity);

        limit.give_back().unwrap();
        assert!(limit.try_borrow());
    }

    #[test]
    fn test_over_return_leaves_count_intact() {
        let limit = Limit::new(2);

        assert_eq!(limit.give_back(), Err(LimitError::OverReturn));
        assert_eq!(limit.available(), 2);

        assert!(limit.try_borrow());
        limit.give_back().unwrap();
        assert_eq!(limit.give_back(), Err(LimitError::OverReturn));

        // Still a well-behaved limiter afterwards
        assert!(limit.try_borrow());
        assert!(limit.try_borrow());
        assert!(!limit.try_borrow());
        limit.give_back().unwrap();
        limit.give_back().unwrap();
        assert_eq!(limit.available(), 2);
    }

    #[test]
    fn test_guard_gives_back_on_drop() {
        let limit = Limit::new(1);

        {
            let _guard = limit.try_borrow_guard().unwrap();
            assert_eq!(limit.available(), 0);
            assert!(limit.try_borrow_guard().is_none());
        }

        assert_eq!(limit.available(), 1);
    }

    #[compio::test]
    async fn test_borrow_waits_for_give_back() {
        let limit = Limit::new(1);
        limit.borrow().await;

        let mut pending = Box::pin(limit.borrow());
        assert!(poll!(pending.as_mut()).is_pending());
        assert!(poll!(pending.as_mut()).is_pending());

        limit.give_back().unwrap();
        assert!(poll!(pending.as_mut()).is_ready());
        assert_eq!(limit.available(), 0);
    }

    #[compio::test]
    async fn test_borrow_guard() {
        let limit = Limit::new(2);

        let first = limit.borrow_guard().await;
        let second = limit.borrow_guard().await;
        assert_eq!(limit.in_use(), 2);

        drop(first);
        assert_eq!(limit.available(), 1);
        drop(second);
        assert_eq!(limit.available(), 2);
    }

    #[test]
    fn test_waiters_woken_in_order() {
        let limit = Limit::new(1);
        assert!(limit.try_borrow());

        let flags: Vec<_> = (0..3).map(|_| Arc::new(WakeFlag::default())).collect();
        let mut borrows: Vec<_> = (0..3).map(|_| Box::pin(limit.borrow())).collect();

        for (borrow, flag) in borrows.iter_mut().zip(&flags) {
            let waker = waker(Arc::clone(flag));
            let mut cx = Context::from_waker(&waker);
            assert!(borrow.as_mut().poll(&mut cx).is_pending());
        }

        limit.give_back().unwrap();
        assert!(flags[0].woken());
        assert!(!flags[1].woken());
        assert!(!flags[2].woken());
    }

    #[test]
    fn test_dropped_waiter_passes_wake_on() {
        let limit = Limit::new(1);
        assert!(limit.try_borrow());

        let first_flag = Arc::new(WakeFlag::default());
        let second_flag = Arc::new(WakeFlag::default());
        let first_waker = waker(Arc::clone(&first_flag));
        let second_waker = waker(Arc::clone(&second_flag));

        let mut first = Box::pin(limit.borrow());
        let mut second = Box::pin(limit.borrow());
        assert!(first
            .as_mut()
            .poll(&mut Context::from_waker(&first_waker))
            .is_pending());
        assert!(second
            .as_mut()
            .poll(&mut Context::from_waker(&second_waker))
            .is_pending());

        limit.give_back().unwrap();
        assert!(first_flag.woken());
        assert!(!second_flag.woken());

        // The first borrower gives up before claiming its token
        drop(first);
        assert!(second_flag.woken());
        assert!(second
            .as_mut()
            .poll(&mut Context::from_waker(&second_waker))
            .is_ready());
    }

    #[test]
    fn test_borrow_blocking_parks_until_give_back() {
        let limit = Limit::new(1);
        assert!(limit.try_borrow());

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let limit = limit.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                limit.borrow_blocking();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        limit.give_back().unwrap();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(limit.available(), 0);
    }

    #[test]
    fn test_concurrent_holders_never_exceed_capacity() {
        const CAPACITY: usize = 4;
        const THREADS: usize = 32;

        let limit = Limit::new(CAPACITY);
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let limit = limit.clone();
                let holders = Arc::clone(&holders);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..10 {
                        limit.borrow_blocking();
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        holders.fetch_sub(1, Ordering::SeqCst);
                        limit.give_back().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(limit.available(), CAPACITY);
    }

    #[test]
    #[should_panic(expected = "Limit must have a capacity of at least one token")]
    fn test_zero_capacity_panics() {
        let _limit = Limit::new(0);
    }
}
