//! Simulated client connections used as cached resources

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flight_sync::Closeable;
use tracing::trace;

use crate::error::{DialError, HarnessError};

/// Controls how dials and closes behave
#[derive(Debug, Clone, Copy, Default)]
pub struct DialPlan {
    /// How long a dial takes
    pub latency: Duration,
    /// Fail the dial instead of connecting
    pub refuse: bool,
    /// Close fails for connections whose id is a multiple of this (0 = never)
    pub fail_close_every: usize,
}

/// A pretend connection to a remote address
#[derive(Debug)]
pub struct Connection {
    id: u64,
    addr: String,
    open: AtomicBool,
    fail_on_close: bool,
}

impl Connection {
    /// Dial `addr`, taking `plan.latency` to do so
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] if the plan refuses the dial.
    pub async fn dial(addr: &str, id: u64, plan: DialPlan) -> Result<Self, DialError> {
        tokio::time::sleep(plan.latency).await;

        if plan.refuse {
            return Err(DialError {
                addr: addr.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        trace!(id, addr, "dialed");
        Ok(Self {
            id,
            addr: addr.to_string(),
            open: AtomicBool::new(true),
            fail_on_close: plan.fail_close_every > 0 && id % plan.fail_close_every as u64 == 0,
        })
    }

    /// Connection id, unique per dial
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Address this connection was dialed to
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check whether the connection has not been closed yet
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Closeable for Connection {
    type Error = HarnessError;

    fn close(&self) -> Result<(), HarnessError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(HarnessError::AlreadyClosed {
                id: self.id,
                addr: self.addr.clone(),
            });
        }

        if self.fail_on_close {
            return Err(HarnessError::CloseFailed {
                id: self.id,
                addr: self.addr.clone(),
            });
        }

        Ok(())
    }
}
