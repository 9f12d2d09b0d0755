//! Stress scenarios that check the primitives' guarantees under load
//!
//! Each scenario spawns many concurrent callers on the tokio runtime, checks
//! the properties its primitive promises, and fails with
//! [`HarnessError::PropertyViolated`] as soon as one does not hold.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flight_sync::{Limit, LimitError, ResourceError, ResourceManager, SingleFlight};
use tokio::sync::Barrier;
use tracing::{debug, info};

use crate::cli::Scenario;
use crate::connection::{Connection, DialPlan};
use crate::error::{DialError, HarnessError, Result};
use crate::progress::ProgressTracker;

/// Load shape shared by all scenarios
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Concurrent callers per key (per round for the limit scenario)
    pub callers: usize,
    /// Distinct keys callers spread over
    pub keys: usize,
    /// Token capacity for the limit scenario
    pub capacity: usize,
    /// Duration of each unit of simulated work
    pub work: Duration,
    /// Number of rounds per scenario
    pub rounds: usize,
    /// Fail closing every n-th connection (0 = never)
    pub fail_close_every: usize,
    /// Refuse every dial in the first cache round
    pub flaky_dials: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            callers: 64,
            keys: 4,
            capacity: 8,
            work: Duration::from_millis(10),
            rounds: 3,
            fail_close_every: 0,
            flaky_dials: false,
        }
    }
}

impl ScenarioConfig {
    /// Check that the configuration describes a runnable load
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidConfig`] if any count is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("callers", self.callers),
            ("keys", self.keys),
            ("capacity", self.capacity),
            ("rounds", self.rounds),
        ] {
            if value == 0 {
                return Err(HarnessError::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one scenario run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    /// Calls issued across all rounds
    pub calls: usize,
    /// Times the protected work actually ran
    pub executions: usize,
    /// Calls that were served without running the work themselves
    pub shared: usize,
    /// Highest number of simultaneous token holders
    pub peak: usize,
    /// Creation failures delivered to callers
    pub dial_failures: usize,
    /// Resources that failed to close on teardown
    pub close_failures: usize,
    pub elapsed: Duration,
}

impl ScenarioReport {
    fn new(scenario: &'static str) -> Self {
        Self {
            scenario,
            ..Self::default()
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} calls, {} executions, {} shared",
            self.scenario, self.calls, self.executions, self.shared
        )?;
        if self.peak > 0 {
            write!(f, ", peak {} holders", self.peak)?;
        }
        if self.dial_failures > 0 {
            write!(f, ", {} dial failures", self.dial_failures)?;
        }
        if self.close_failures > 0 {
            write!(f, ", {} close failures", self.close_failures)?;
        }
        write!(f, " in {:?}", self.elapsed)
    }
}

/// Run the selected scenarios one after the other
///
/// # Errors
///
/// Returns the first violated property or failed caller task.
pub async fn run_scenarios(
    scenario: Scenario,
    config: &ScenarioConfig,
    progress: &ProgressTracker,
) -> Result<Vec<ScenarioReport>> {
    config.validate()?;

    let mut reports = Vec::new();
    for &selected in scenario.expand() {
        progress.set_scenario(selected.name());
        let report = match selected {
            Scenario::Flight => run_flight(config, progress).await?,
            Scenario::Cache => run_cache(config, progress).await?,
            Scenario::Limit => run_limit(config, progress).await?,
            // Already expanded into the concrete scenarios
            Scenario::All => continue,
        };
        info!("{report}");
        reports.push(report);
    }
    Ok(reports)
}

/// Concurrent callers per key share one execution per overlap
///
/// # Errors
///
/// Fails if two fresh callers report the same execution, a shared result does
/// not come from a fresh execution of the same key, or the number of
/// executions differs from the number of fresh callers.
pub async fn run_flight(
    config: &ScenarioConfig,
    progress: &ProgressTracker,
) -> Result<ScenarioReport> {
    const NAME: &str = "flight";

    let started = Instant::now();
    let flight: Arc<SingleFlight<u64, String>> = Arc::new(SingleFlight::new());
    let executions = Arc::new(AtomicU64::new(0));
    let mut report = ScenarioReport::new(NAME);

    for round in 0..config.rounds {
        let total = config.callers * config.keys;
        let barrier = Arc::new(Barrier::new(total));
        let mut handles = Vec::with_capacity(total);

        for caller in 0..total {
            let key = format!("key-{}", caller % config.keys);
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            let barrier = Arc::clone(&barrier);
            let work = config.work;

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let execution = flight
                    .execute_marked(key.as_str(), || async move {
                        let id = executions.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(work).await;
                        Ok(id)
                    })
                    .await;
                (key, execution)
            }));
        }

        let mut fresh_ids: HashMap<String, HashSet<u64>> = HashMap::new();
        let mut seen_ids: HashMap<String, HashSet<u64>> = HashMap::new();

        for handle in handles {
            let (key, execution) = handle.await?;
            let id = execution
                .result
                .map_err(|err| HarnessError::violated(NAME, err))?;

            if execution.fresh {
                if !fresh_ids.entry(key.clone()).or_default().insert(id) {
                    return Err(HarnessError::violated(
                        NAME,
                        format!("execution {id} for {key} reported fresh twice"),
                    ));
                }
                report.executions += 1;
            } else {
                report.shared += 1;
            }
            seen_ids.entry(key).or_default().insert(id);
            report.calls += 1;
        }

        for (key, ids) in &seen_ids {
            let fresh = fresh_ids.get(key);
            if let Some(stray) = ids.iter().find(|&&id| !fresh.is_some_and(|f| f.contains(&id))) {
                return Err(HarnessError::violated(
                    NAME,
                    format!("{key} returned execution {stray} that no caller ran"),
                ));
            }
        }

        debug!(round, executions = report.executions, "flight round done");
        progress.round_done();
    }

    let ran = executions.load(Ordering::SeqCst);
    if ran != report.executions as u64 {
        return Err(HarnessError::violated(
            NAME,
            format!("{ran} executions ran but {} callers saw a fresh result", report.executions),
        ));
    }
    if flight.in_flight() != 0 {
        return Err(HarnessError::violated(NAME, "calls left in flight after all callers returned"));
    }

    report.elapsed = started.elapsed();
    Ok(report)
}

/// Concurrent first access creates each connection once; teardown closes all
///
/// # Errors
///
/// Fails if a key is dialed successfully more than once, callers of one key
/// receive different connections, a refused dial is not delivered to every
/// caller, or teardown skips a connection or misreports close failures.
pub async fn run_cache(
    config: &ScenarioConfig,
    progress: &ProgressTracker,
) -> Result<ScenarioReport> {
    const NAME: &str = "cache";

    let started = Instant::now();
    let manager: Arc<ResourceManager<Connection, DialError>> = Arc::new(ResourceManager::new());
    let attempts = Arc::new(AtomicU64::new(0));
    let connected = Arc::new(AtomicUsize::new(0));
    let mut connections: HashMap<String, Arc<Connection>> = HashMap::new();
    let mut report = ScenarioReport::new(NAME);

    for round in 0..config.rounds {
        let plan = DialPlan {
            latency: config.work,
            refuse: config.flaky_dials && round == 0,
            fail_close_every: config.fail_close_every,
        };
        let total = config.callers * config.keys;
        let barrier = Arc::new(Barrier::new(total));
        let mut handles = Vec::with_capacity(total);

        for caller in 0..total {
            let addr = format!("10.0.0.{}:5432", caller % config.keys);
            let manager = Arc::clone(&manager);
            let attempts = Arc::clone(&attempts);
            let connected = Arc::clone(&connected);
            let barrier = Arc::clone(&barrier);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let result = manager
                    .get(&addr, || async {
                        let id = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        let conn = Connection::dial(&addr, id, plan).await?;
                        connected.fetch_add(1, Ordering::SeqCst);
                        Ok(conn)
                    })
                    .await;
                (addr, result)
            }));
        }

        for handle in handles {
            let (addr, result) = handle.await?;
            report.calls += 1;

            match result {
                Ok(conn) => {
                    if plan.refuse {
                        return Err(HarnessError::violated(
                            NAME,
                            format!("{addr} connected although every dial is refused"),
                        ));
                    }
                    let first = connections.entry(addr.clone()).or_insert_with(|| Arc::clone(&conn));
                    if !Arc::ptr_eq(first, &conn) {
                        return Err(HarnessError::violated(
                            NAME,
                            format!(
                                "{addr} handed out connections {} and {}",
                                first.id(),
                                conn.id()
                            ),
                        ));
                    }
                }
                Err(err) if plan.refuse => {
                    check_refusal(&addr, &err)?;
                    report.dial_failures += 1;
                }
                Err(err) => {
                    return Err(HarnessError::violated(
                        NAME,
                        format!("{addr} failed unexpectedly: {err}"),
                    ));
                }
            }
        }

        if plan.refuse && !manager.is_empty() {
            return Err(HarnessError::violated(NAME, "a refused dial left an entry behind"));
        }

        debug!(round, cached = manager.len(), "cache round done");
        progress.round_done();
    }

    let dialed = connected.load(Ordering::SeqCst);
    if dialed != connections.len() {
        return Err(HarnessError::violated(
            NAME,
            format!("{dialed} connections dialed for {} keys", connections.len()),
        ));
    }

    let attempts = usize::try_from(attempts.load(Ordering::SeqCst)).unwrap_or(usize::MAX);
    report.executions = attempts;
    report.shared = report.calls.saturating_sub(attempts);

    let expected_failures = connections
        .values()
        .filter(|conn| {
            config.fail_close_every > 0 && conn.id() % config.fail_close_every as u64 == 0
        })
        .count();
    let close_failures = manager.close().err().map_or(0, |batch| batch.len());
    if close_failures != expected_failures {
        return Err(HarnessError::violated(
            NAME,
            format!("expected {expected_failures} close failures, got {close_failures}"),
        ));
    }
    if let Some(conn) = connections.values().find(|conn| conn.is_open()) {
        return Err(HarnessError::violated(
            NAME,
            format!("connection {} to {} was not closed", conn.id(), conn.addr()),
        ));
    }
    report.close_failures = close_failures;

    report.elapsed = started.elapsed();
    Ok(report)
}

/// Holders never exceed capacity and over-release is rejected
///
/// # Errors
///
/// Fails if more callers hold a token than the capacity allows, tokens leak,
/// a borrow succeeds on an exhausted limit, or an over-release is accepted.
pub async fn run_limit(
    config: &ScenarioConfig,
    progress: &ProgressTracker,
) -> Result<ScenarioReport> {
    const NAME: &str = "limit";

    let started = Instant::now();
    let limit = Limit::new(config.capacity);
    let holders = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut report = ScenarioReport::new(NAME);

    for round in 0..config.rounds {
        let mut handles = Vec::with_capacity(config.callers);

        for _ in 0..config.callers {
            let limit = limit.clone();
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            let work = config.work;

            handles.push(tokio::spawn(async move {
                limit.borrow().await;
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                limit.give_back()
            }));
        }

        for handle in handles {
            handle
                .await?
                .map_err(|err| HarnessError::violated(NAME, err.to_string()))?;
            report.calls += 1;
            report.executions += 1;
        }

        debug!(round, peak = peak.load(Ordering::SeqCst), "limit round done");
        progress.round_done();
    }

    report.peak = peak.load(Ordering::SeqCst);
    if report.peak > config.capacity {
        return Err(HarnessError::violated(
            NAME,
            format!("{} holders at once with capacity {}", report.peak, config.capacity),
        ));
    }
    if limit.available() != config.capacity {
        return Err(HarnessError::violated(
            NAME,
            format!("{} of {} tokens leaked", limit.in_use(), config.capacity),
        ));
    }

    check_exhaustion(&limit)?;

    report.elapsed = started.elapsed();
    Ok(report)
}

/// A refused dial must reach every caller as the dial error for its own address
fn check_refusal(addr: &str, err: &ResourceError<DialError>) -> Result<()> {
    match err.create_error() {
        Some(dial) if dial.addr == addr => {
            debug!(%dial, "dial refused as planned");
            Ok(())
        }
        _ => Err(HarnessError::violated(
            "cache",
            format!("{addr} failed with an unexpected error: {err}"),
        )),
    }
}

fn check_exhaustion(limit: &Limit) -> Result<()> {
    const NAME: &str = "limit";

    if limit.give_back() != Err(LimitError::OverReturn) {
        return Err(HarnessError::violated(NAME, "over-release on an idle limit was accepted"));
    }

    for _ in 0..limit.capacity() {
        if !limit.try_borrow() {
            return Err(HarnessError::violated(NAME, "try_borrow failed below capacity"));
        }
    }
    if limit.try_borrow() {
        return Err(HarnessError::violated(NAME, "try_borrow succeeded on an exhausted limit"));
    }
    for _ in 0..limit.capacity() {
        limit
            .give_back()
            .map_err(|err| HarnessError::violated(NAME, err.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_validate_rejects_zero_counts() {
        let config = ScenarioConfig {
            keys: 0,
            ..ScenarioConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(HarnessError::InvalidConfig(msg)) if msg == "keys must be at least 1"
        ));
        assert!(ScenarioConfig::default().validate().is_ok());
    }

    #[test]
    fn test_report_display() {
        let report = ScenarioReport {
            scenario: "cache",
            calls: 10,
            executions: 2,
            shared: 8,
            close_failures: 1,
            ..ScenarioReport::default()
        };
        assert_eq!(
            report.to_string(),
            "cache: 10 calls, 2 executions, 8 shared, 1 close failures in 0ns"
        );
    }

    #[test]
    fn test_check_refusal() {
        let refused = ResourceError::Create(DialError {
            addr: "10.0.0.1:5432".to_string(),
            reason: "connection refused".to_string(),
        });
        assert!(check_refusal("10.0.0.1:5432", &refused).is_ok());
        assert!(matches!(
            check_refusal("10.0.0.2:5432", &refused),
            Err(HarnessError::PropertyViolated { scenario: "cache", .. })
        ));
        assert!(check_refusal("10.0.0.1:5432", &ResourceError::Closed).is_err());
    }

    #[test]
    fn test_check_exhaustion_restores_tokens() {
        let limit = Limit::new(3);
        check_exhaustion(&limit).unwrap();
        assert_eq!(limit.available(), 3);
    }
}
