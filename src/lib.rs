//! syncx: stress harness for shared-work concurrency primitives
//!
//! This library wires the [`flight_sync`] primitives (call deduplication,
//! lazily created shared resources, and a counting limiter) into a simulated
//! connection pool and checks their guarantees under concurrent load.

pub mod cli;
pub mod connection;
pub mod error;
pub mod progress;
pub mod scenario;

// Re-export commonly used types
pub use connection::{Connection, DialPlan};
pub use error::{DialError, HarnessError, Result};
pub use progress::ProgressTracker;
pub use scenario::{run_scenarios, ScenarioConfig, ScenarioReport};
