//! Command-line interface definitions

use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use crate::scenario::ScenarioConfig;

/// Stress harness for call deduplication, shared resources and limiting
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Scenario to run
    #[arg(long, value_enum, default_value = "all")]
    pub scenario: Scenario,

    /// Concurrent callers per key
    ///
    /// For the limit scenario this is the number of callers competing for
    /// tokens in each round.
    #[arg(long, default_value = "64")]
    pub callers: usize,

    /// Number of distinct keys the callers spread over
    #[arg(long, default_value = "4")]
    pub keys: usize,

    /// Token capacity for the limit scenario
    #[arg(long, default_value = "8")]
    pub capacity: usize,

    /// Simulated work (and dial latency) in milliseconds
    #[arg(long, default_value = "10")]
    pub work_ms: u64,

    /// Rounds per scenario
    #[arg(long, default_value = "3")]
    pub rounds: usize,

    /// Make every n-th connection fail to close on teardown (0 = never)
    #[arg(long, default_value = "0")]
    pub fail_close_every: usize,

    /// Refuse every dial in the first cache round to exercise retries
    #[arg(long)]
    pub flaky_dials: bool,

    /// Runtime worker threads (0 = one per CPU)
    #[arg(long, default_value = "0")]
    pub worker_threads: usize,

    /// Show progress information
    #[arg(long)]
    pub progress: bool,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress all output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Which primitive to put under load
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Call deduplication
    Flight,
    /// Lazily created shared connections and teardown
    Cache,
    /// Counting limiter
    Limit,
    /// Every scenario in turn
    All,
}

impl Scenario {
    /// The concrete scenarios this selection stands for
    #[must_use]
    pub const fn expand(self) -> &'static [Self] {
        match self {
            Self::Flight => &[Self::Flight],
            Self::Cache => &[Self::Cache],
            Self::Limit => &[Self::Limit],
            Self::All => &[Self::Flight, Self::Cache, Self::Limit],
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Flight => "flight",
            Self::Cache => "cache",
            Self::Limit => "limit",
            Self::All => "all",
        }
    }
}

impl Args {
    /// Validate command-line arguments
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - Callers, keys, capacity or rounds is zero or unreasonably large
    /// - Work duration is longer than a minute
    /// - Both --quiet and --verbose options are used
    pub fn validate(&self) -> Result<()> {
        if self.callers == 0 || self.callers > 100_000 {
            anyhow::bail!(
                "Callers must be between 1 and 100000, got: {}",
                self.callers
            );
        }

        if self.keys == 0 || self.keys > 10_000 {
            anyhow::bail!("Keys must be between 1 and 10000, got: {}", self.keys);
        }

        if self.callers.saturating_mul(self.keys) > 1_000_000 {
            anyhow::bail!(
                "Too many concurrent callers: {} callers x {} keys",
                self.callers,
                self.keys
            );
        }

        if self.capacity == 0 {
            anyhow::bail!("Capacity must be at least 1");
        }

        if self.rounds == 0 {
            anyhow::bail!("Rounds must be at least 1");
        }

        if self.work_ms > 60_000 {
            anyhow::bail!("Work duration too long (max 60000 ms): {} ms", self.work_ms);
        }

        if self.quiet && self.verbose > 0 {
            anyhow::bail!("Cannot use both --quiet and --verbose options");
        }

        Ok(())
    }

    /// Get the actual worker thread count to use
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Total rounds across the selected scenarios, for progress reporting
    #[must_use]
    pub fn total_rounds(&self) -> u64 {
        (self.scenario.expand().len() * self.rounds) as u64
    }

    /// Scenario load described by these arguments
    #[must_use]
    pub fn scenario_config(&self) -> ScenarioConfig {
        ScenarioConfig {
            callers: self.callers,
            keys: self.keys,
            capacity: self.capacity,
            work: Duration::from_millis(self.work_ms),
            rounds: self.rounds,
            fail_close_every: self.fail_close_every,
            flaky_dials: self.flaky_dials,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("syncx").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let args = parse(&[]);
        assert_eq!(args.scenario, Scenario::All);
        assert_eq!(args.callers, 64);
        assert_eq!(args.keys, 4);
        assert_eq!(args.capacity, 8);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_scenario_config_mapping() {
        let args = parse(&[
            "--scenario",
            "cache",
            "--work-ms",
            "25",
            "--fail-close-every",
            "3",
            "--flaky-dials",
        ]);
        let config = args.scenario_config();
        assert_eq!(args.scenario, Scenario::Cache);
        assert_eq!(config.work, Duration::from_millis(25));
        assert_eq!(config.fail_close_every, 3);
        assert!(config.flaky_dials);
        assert_eq!(args.total_rounds(), 3);
    }

    #[test]
    fn test_all_expands_to_every_scenario() {
        assert_eq!(
            Scenario::All.expand(),
            &[Scenario::Flight, Scenario::Cache, Scenario::Limit]
        );
        assert_eq!(parse(&["--rounds", "2"]).total_rounds(), 6);
    }

    #[rstest]
    #[case(&["--callers", "0"], "Callers must be between 1 and 100000")]
    #[case(&["--keys", "0"], "Keys must be between 1 and 10000")]
    #[case(&["--capacity", "0"], "Capacity must be at least 1")]
    #[case(&["--rounds", "0"], "Rounds must be at least 1")]
    #[case(&["--work-ms", "60001"], "Work duration too long")]
    #[case(&["--callers", "1000", "--keys", "2000"], "Too many concurrent callers")]
    #[case(&["-q", "-v"], "Cannot use both --quiet and --verbose options")]
    fn test_validate_rejects(#[case] args: &[&str], #[case] message: &str) {
        let err = parse(args).validate().unwrap_err();
        assert!(
            err.to_string().contains(message),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_effective_worker_threads() {
        assert_eq!(parse(&["--worker-threads", "3"]).effective_worker_threads(), 3);
        assert!(parse(&[]).effective_worker_threads() >= 1);
    }
}
