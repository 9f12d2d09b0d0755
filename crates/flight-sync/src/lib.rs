//! Concurrency primitives for sharing scarce work and resources
//!
//! This crate provides three runtime-agnostic primitives. They are plain
//! futures built on `std` locks and wakers, so they run under
//! [compio](https://github.com/compio-rs/compio), tokio, or
//! `futures::executor::block_on` on native threads.
//!
//! # Primitives
//!
//! - [`SingleFlight`] - Collapses concurrent calls with the same key into one execution
//! - [`ResourceManager`] - Creates each keyed [`Closeable`] resource at most once
//! - [`Limit`] - Counting semaphore with over-release detection
//!
//! # Example
//!
//! ```rust,no_run
//! use flight_sync::SingleFlight;
//! use std::sync::Arc;
//!
//! #[compio::main]
//! async fn main() {
//!     let flight: Arc<SingleFlight<u64, String>> = Arc::new(SingleFlight::new());
//!
//!     // Concurrent lookups of the same key run the query only once
//!     let lookups = (0..100).map(|_| {
//!         let flight = flight.clone();
//!         async move { flight.execute("users", || async { Ok(42) }).await }
//!     });
//!
//!     for rows in futures::future::join_all(lookups).await {
//!         println!("rows: {rows:?}");
//!     }
//! }
//! ```

mod batch_error;
mod error;
mod limit;
mod lock;
mod resource;
mod singleflight;

pub use batch_error::BatchError;
pub use error::{LimitError, ResourceError};
pub use limit::{Limit, LimitGuard};
pub use resource::{Closeable, ResourceManager};
pub use singleflight::{Execution, SingleFlight};
