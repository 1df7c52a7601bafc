use crate::filter::{FilterError, LogicStateFilter};
use std::time::{Duration, Instant};
use tracing::warn;

/// Drift-free tally timer: the n-th deadline is `start + n * period`,
/// always computed from the anchor so jitter in the measurement loop (or a
/// slow tally) never accumulates into the schedule.
#[derive(Debug)]
pub struct TallyScheduler {
    start: Instant,
    period: Duration,
    tick: u32,
}

impl TallyScheduler {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period,
            tick: 1,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.start + self.period * self.tick
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_deadline()
    }

    /// How long until the next deadline; zero once it has passed.
    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_deadline().saturating_duration_since(now)
    }

    /// Steps to the following grid point, returning the deadline that just
    /// elapsed (the timestamp a tally row is attributed to).
    pub fn advance(&mut self) -> Instant {
        let elapsed_deadline = self.next_deadline();
        self.tick += 1;
        elapsed_deadline
    }
}

/// One row of the coverage time series. Appended, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct TallySnapshot {
    /// Seconds since measurement start.
    pub elapsed_secs: u64,
    /// Estimated number of distinct logic states.
    pub cardinality: u64,
    /// The filter was completely full; `cardinality` is a capped value.
    pub saturated: bool,
    /// Lower/upper error bounds, when bound reporting is enabled.
    pub bounds: Option<(u64, u64)>,
    /// Percentage of filter bits set.
    pub density_percent: f64,
    /// New states per second over the last period.
    pub rate_inst: u64,
    /// New states per execution over the last period, as a percentage.
    pub rate_per_exec: f64,
    /// States per second over the whole session.
    pub rate_avg: u64,
    /// States per execution over the whole session, as a percentage.
    pub rate_per_exec_avg: f64,
}

/// Rate bookkeeping between consecutive snapshots. Lives on the tally
/// worker, away from the hot consumption loop that pays for neither the
/// popcount nor the float math here.
pub struct TallyCounter {
    period_secs: u64,
    error_percent: u8,
    prev_cardinality: u64,
}

impl TallyCounter {
    pub fn new(period: Duration, error_percent: u8) -> Self {
        Self {
            period_secs: period.as_secs().max(1),
            error_percent,
            prev_cardinality: 0,
        }
    }

    /// Computes a full snapshot: popcount sweep, cardinality estimate,
    /// density, and both rate pairs.
    pub fn snapshot(
        &mut self,
        filter: &LogicStateFilter,
        elapsed: Duration,
        execs_total: u64,
        execs_in_period: u64,
    ) -> TallySnapshot {
        let ones = filter.population_count();
        self.snapshot_from_ones(filter, ones, elapsed, execs_total, execs_in_period)
    }

    fn snapshot_from_ones(
        &mut self,
        filter: &LogicStateFilter,
        ones: u64,
        elapsed: Duration,
        execs_total: u64,
        execs_in_period: u64,
    ) -> TallySnapshot {
        let (cardinality, saturated) = match filter.estimate_cardinality(ones) {
            Ok(estimate) => (estimate, false),
            Err(FilterError::Saturated { bits }) => {
                warn!(bits, "bloom filter saturated; reporting capped estimate");
                let capped = filter
                    .estimate_cardinality(bits - 1)
                    .unwrap_or(u64::MAX);
                (capped, true)
            }
            // estimate_cardinality has no other failure mode
            Err(_) => (0, false),
        };

        let elapsed_secs = elapsed.as_secs();
        let delta = cardinality.saturating_sub(self.prev_cardinality);

        let bounds = (self.error_percent > 0).then(|| {
            let margin = cardinality * u64::from(self.error_percent) / 100;
            (cardinality - margin, cardinality + margin)
        });

        let snapshot = TallySnapshot {
            elapsed_secs,
            cardinality,
            saturated,
            bounds,
            density_percent: ones as f64 / filter.size_bits() as f64 * 100.0,
            rate_inst: delta / self.period_secs,
            rate_per_exec: if execs_in_period > 0 {
                delta as f64 / execs_in_period as f64 * 100.0
            } else {
                0.0
            },
            rate_avg: if elapsed_secs > 0 {
                cardinality / elapsed_secs
            } else {
                0
            },
            rate_per_exec_avg: if execs_total > 0 {
                cardinality as f64 / execs_total as f64 * 100.0
            } else {
                0.0
            },
        };

        self.prev_cardinality = cardinality;
        snapshot
    }
}
