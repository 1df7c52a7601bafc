//! The measurement session: one owned context for every resource the daemon
//! holds, constructed at startup and driven by [`Session::run`].
//!
//! The primary loop alternates between a bounded handshake wait and a tally
//! deadline check. Tally computation (the O(M) popcount) runs on a separate
//! worker thread fed over a channel, so a slow tally never inflates the
//! target's handshake latency. Signal handlers are expected to only flip the
//! stop flag; the final tally and all IPC teardown happen here and in the
//! resource Drop impls.

use crate::bucket::Bucketizer;
use crate::channel::{DEFAULT_SHM_KEY, ExecutionChannel, LifecycleStatus, STATE_SIZE};
use crate::config::LscovConfig;
use crate::filter::{FilterError, LogicStateFilter};
use crate::handshake::{DaemonEndpoint, HandshakeError, HandshakeNames};
use crate::report::{ReportError, ReportSink};
use crate::tally::{TallyCounter, TallyScheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] crate::channel::ChannelError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Upper bound on a single handshake wait, so the loop revisits the stop
/// flag and the tally deadline promptly even when no target is running.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct TallyJob {
    elapsed: Duration,
    execs_total: u64,
    execs_in_period: u64,
}

#[derive(Default)]
struct ExecCounters {
    total: u64,
    in_period: u64,
}

pub struct Session {
    channel: ExecutionChannel,
    endpoint: DaemonEndpoint,
    filter: Arc<LogicStateFilter>,
    bucketizer: Bucketizer,
    period: Duration,
    error_percent: u8,
    output_path: PathBuf,
}

impl Session {
    /// Creates the session on the well-known IPC names. Any acquisition
    /// failure is fatal; in particular an existing segment is never reused,
    /// since it may belong to a daemon that is still running.
    pub fn new(config: &LscovConfig) -> Result<Self, SessionError> {
        Self::with_ipc(config, DEFAULT_SHM_KEY, &HandshakeNames::default())
    }

    /// Same as [`Session::new`] on explicit IPC identifiers.
    pub fn with_ipc(
        config: &LscovConfig,
        shm_key: i32,
        names: &HandshakeNames,
    ) -> Result<Self, SessionError> {
        let channel = ExecutionChannel::create(shm_key)?;
        let endpoint = DaemonEndpoint::host(names)?;
        let filter = Arc::new(LogicStateFilter::new(
            config.filter_size_bytes,
            config.num_hashes,
        )?);

        Ok(Self {
            channel,
            endpoint,
            filter,
            bucketizer: Bucketizer::new(),
            period: Duration::from_secs(config.tally_period_secs),
            error_percent: config.error_percent,
            output_path: config.output_path.clone(),
        })
    }

    /// Runs the measurement until `stop` is set or a protocol violation
    /// aborts the session. On a clean stop, one final snapshot is forced at
    /// the actual elapsed time rather than the next scheduled grid point.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), SessionError> {
        let sink = ReportSink::create(&self.output_path, self.error_percent > 0)?;
        let (job_tx, job_rx) = mpsc::channel::<TallyJob>();
        let worker = Self::spawn_tally_worker(
            job_rx,
            sink,
            TallyCounter::new(self.period, self.error_percent),
            Arc::clone(&self.filter),
        );

        // Anchor the measurement clock at the first execution, not at
        // daemon startup: the report's time axis should measure the
        // campaign, not how early the daemon was launched.
        info!("waiting for an instrumented target");
        while self.channel.status()? == LifecycleStatus::Ready {
            if stop.load(Ordering::SeqCst) {
                drop(job_tx);
                let _ = worker.join();
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        info!(output = %self.output_path.display(), "target attached, recording");

        let start = Instant::now();
        let mut scheduler = TallyScheduler::new(start, self.period);
        let mut execs = ExecCounters::default();

        let result = self.consume_loop(stop, start, &mut scheduler, &job_tx, &mut execs);

        if result.is_ok() {
            let _ = job_tx.send(TallyJob {
                elapsed: start.elapsed(),
                execs_total: execs.total,
                execs_in_period: execs.in_period,
            });
        }
        drop(job_tx);
        if worker.join().is_err() {
            warn!("tally worker panicked during shutdown");
        }
        result
    }

    fn consume_loop(
        &self,
        stop: &AtomicBool,
        start: Instant,
        scheduler: &mut TallyScheduler,
        job_tx: &mpsc::Sender<TallyJob>,
        execs: &mut ExecCounters,
    ) -> Result<(), SessionError> {
        let mut state = vec![0u8; STATE_SIZE];

        while !stop.load(Ordering::SeqCst) {
            let wait = scheduler.time_until_due(Instant::now()).min(WAIT_SLICE);
            if self.endpoint.await_filled(wait)? {
                execs.total += 1;
                execs.in_period += 1;

                // Reduce and hand the slot back before the k hash passes;
                // the target can start its next execution while we index.
                self.bucketizer.classify(self.channel.hit_counts(), &mut state);
                self.channel.clear();
                self.endpoint.release_slot()?;

                self.filter.insert(&state)?;
            }

            if scheduler.is_due(Instant::now()) {
                let deadline = scheduler.advance();
                let _ = job_tx.send(TallyJob {
                    elapsed: deadline - start,
                    execs_total: execs.total,
                    execs_in_period: execs.in_period,
                });
                execs.in_period = 0;
            }
        }
        Ok(())
    }

    fn spawn_tally_worker(
        job_rx: mpsc::Receiver<TallyJob>,
        mut sink: ReportSink,
        mut counter: TallyCounter,
        filter: Arc<LogicStateFilter>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for job in job_rx {
                let snapshot =
                    counter.snapshot(&filter, job.elapsed, job.execs_total, job.execs_in_period);
                match sink.append(&snapshot) {
                    Ok(()) => info!(
                        time = snapshot.elapsed_secs,
                        coverage = snapshot.cardinality,
                        "recorded new coverage"
                    ),
                    Err(e) => warn!("failed to append tally row: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::TargetEndpoint;

    fn test_ipc(tag: &str, salt: i32) -> (i32, HandshakeNames) {
        let pid = std::process::id();
        let key = (pid as i32 & 0x00ff_ffff) ^ (salt << 24);
        let names = HandshakeNames {
            target_ready: format!("/lscov-test-{tag}-ready-{pid}"),
            slot_free: format!("/lscov-test-{tag}-free-{pid}"),
        };
        (key, names)
    }

    #[test]
    fn session_stops_cleanly_before_any_target() {
        let (key, names) = test_ipc("idle", 0x21);
        let dir = tempfile::tempdir().unwrap();
        let config = LscovConfig {
            output_path: dir.path().join("idle.csv"),
            filter_size_bytes: 1 << 10,
            ..Default::default()
        };

        let mut session = Session::with_ipc(&config, key, &names).unwrap();
        let stop = AtomicBool::new(true);
        session.run(&stop).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("idle.csv")).unwrap();
        assert_eq!(
            contents.lines().count(),
            1,
            "an unused session leaves only the header behind"
        );
    }

    #[test]
    fn end_to_end_fifty_unique_executions() {
        let (key, names) = test_ipc("e2e", 0x22);
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("e2e.csv");
        let config = LscovConfig {
            tally_period_secs: 2,
            filter_size_bytes: 1 << 16,
            num_hashes: 4,
            output_path: out_path.clone(),
            error_percent: 0,
        };

        let mut session = Session::with_ipc(&config, key, &names).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let daemon_stop = Arc::clone(&stop);
        let daemon = thread::spawn(move || session.run(&daemon_stop));

        // Drive 50 executions, each with a structurally unique hit
        // pattern, through the real shared-memory handshake.
        let mut channel = ExecutionChannel::attach(key).unwrap();
        let target = TargetEndpoint::join(&names).unwrap();
        let run_start = Instant::now();
        for exec in 0..50usize {
            target.claim_slot(&channel).unwrap();
            let hits = channel.hit_counts_mut();
            hits[exec * 512] = 1;
            hits[exec * 512 + 7] = (exec as u8).wrapping_add(1);
            target.finish(&channel).unwrap();
        }

        // Let one full tally period elapse, then request shutdown.
        while run_start.elapsed() < Duration::from_millis(2600) {
            thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::SeqCst);
        daemon.join().unwrap().unwrap();

        let contents = std::fs::read_to_string(&out_path).unwrap();
        let rows: Vec<&str> = contents.lines().skip(1).collect();
        assert!(
            rows.len() >= 2,
            "expected a periodic row plus the final forced row, got: {contents}"
        );

        let parse = |row: &str| -> (u64, u64) {
            let mut fields = row.split(',');
            let time = fields.next().unwrap().parse().unwrap();
            let coverage = fields.next().unwrap().parse().unwrap();
            (time, coverage)
        };

        let (first_time, first_cov) = parse(rows[0]);
        assert_eq!(first_time, 2, "first row belongs to the first deadline");
        assert!(
            (45..=55).contains(&first_cov),
            "estimate {first_cov} outside tolerance of 50 distinct states"
        );

        // The forced shutdown row is stamped with the actual elapsed time,
        // not rounded up to the next scheduled multiple of the period.
        let (last_time, last_cov) = parse(rows.last().unwrap());
        assert!(
            last_time < 4,
            "final row must use actual elapsed time, got {last_time}"
        );
        assert!((45..=55).contains(&last_cov));
    }

    #[test]
    fn corrupted_handshake_aborts_the_session() {
        let (key, names) = test_ipc("abort", 0x23);
        let dir = tempfile::tempdir().unwrap();
        let config = LscovConfig {
            output_path: dir.path().join("abort.csv"),
            filter_size_bytes: 1 << 10,
            ..Default::default()
        };

        let mut session = Session::with_ipc(&config, key, &names).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let daemon_stop = Arc::clone(&stop);
        let daemon = thread::spawn(move || session.run(&daemon_stop));

        // One legitimate claim gets the loop past the attach wait.
        let mut channel = ExecutionChannel::attach(key).unwrap();
        let target = TargetEndpoint::join(&names).unwrap();
        target.claim_slot(&channel).unwrap();
        channel.hit_counts_mut()[0] = 1;
        target.finish(&channel).unwrap();

        // Then break the lock-step from the outside: two stray posts push
        // slot-free beyond its bound.
        target.post_slot_free_for_test();
        target.post_slot_free_for_test();

        let result = daemon.join().unwrap();
        match result {
            Err(SessionError::Handshake(HandshakeError::Corrupted { count })) => {
                assert!(count > 1);
            }
            other => panic!("expected fatal Corrupted error, got {other:?}"),
        }
    }
}
