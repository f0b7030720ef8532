use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use crate::board::BoardClient;
use crate::engine::Reconciler;
use crate::error::{Error, Result};
use crate::report::SyncReport;
use crate::sources::FindingSource;

/// Longest uninterrupted sleep between cancellation checks.
pub const CANCEL_CHECK: Duration = Duration::from_secs(60);

/// Upper bound on the wait between pass starts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Observer for pass progress.
pub trait SyncReporter: Send + Sync {
    fn pass_started(&self, pass: u32);
    fn pass_finished(&self, pass: u32, report: &SyncReport);
    fn pass_failed(&self, pass: u32, error: &Error);
}

/// Default reporter that prints to stderr.
pub struct StderrReporter;

impl SyncReporter for StderrReporter {
    fn pass_started(&self, pass: u32) {
        eprintln!("[kanbridge] Starting pass {pass}");
    }

    fn pass_finished(&self, pass: u32, report: &SyncReport) {
        eprintln!("[kanbridge] Pass {pass} complete\n{report}");
    }

    fn pass_failed(&self, pass: u32, error: &Error) {
        eprintln!("[kanbridge] Pass {pass} failed: {error}");
    }
}

pub struct Scheduler<S, B, P = StderrReporter> {
    reconciler: Reconciler<S, B>,
    interval: Duration,
    max_passes: Option<u32>,
    reporter: P,
}

impl<S: FindingSource, B: BoardClient + 'static> Scheduler<S, B> {
    pub fn new(reconciler: Reconciler<S, B>, interval: Duration) -> Self {
        Self::with_reporter(reconciler, interval, StderrReporter)
    }
}

impl<S: FindingSource, B: BoardClient + 'static, P: SyncReporter> Scheduler<S, B, P> {
    pub fn with_reporter(reconciler: Reconciler<S, B>, interval: Duration, reporter: P) -> Self {
        Self {
            reconciler,
            interval: interval.min(MAX_INTERVAL),
            max_passes: None,
            reporter,
        }
    }

    pub fn max_passes(mut self, max_passes: Option<u32>) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn reconciler(&self) -> &Reconciler<S, B> {
        &self.reconciler
    }

    /// Run one pass and return its report. Errors propagate.
    pub async fn run_once(&self) -> Result<SyncReport> {
        self.reporter.pass_started(1);
        match self.reconciler.run_pass().await {
            Ok(report) => {
                self.reporter.pass_finished(1, &report);
                Ok(report)
            }
            Err(e) => {
                self.reporter.pass_failed(1, &e);
                Err(e)
            }
        }
    }

    /// Run passes until shutdown or `max_passes`, one per interval measured
    /// from each pass start. Failed passes are reported and the loop goes on.
    ///
    /// Returns the number of passes run.
    pub async fn run_continuous(&self, mut shutdown: Option<watch::Receiver<bool>>) -> Result<u32> {
        let mut passes = 0u32;

        loop {
            if shutdown_requested(shutdown.as_ref()) {
                info!("shutdown requested, exiting loop");
                break;
            }

            let started = Instant::now();
            passes += 1;
            self.reporter.pass_started(passes);
            match self.reconciler.run_pass().await {
                Ok(report) => self.reporter.pass_finished(passes, &report),
                Err(e) => {
                    error!(pass = passes, error = %e, "pass failed");
                    self.reporter.pass_failed(passes, &e);
                }
            }

            if let Some(max) = self.max_passes
                && passes >= max
            {
                info!(max, "reached max passes, exiting");
                break;
            }

            info!(
                interval_secs = self.interval.as_secs(),
                "waiting for next pass"
            );
            if wait_until_or_shutdown(started + self.interval, &mut shutdown).await {
                info!("shutdown requested, exiting loop");
                break;
            }
        }

        Ok(passes)
    }
}

fn shutdown_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

/// Sleep until `deadline` in slices of at most [`CANCEL_CHECK`]. Returns true
/// if shutdown was requested first. A dropped sender stops the watch.
async fn wait_until_or_shutdown(
    deadline: Instant,
    shutdown: &mut Option<watch::Receiver<bool>>,
) -> bool {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(CANCEL_CHECK);

        let closed = match shutdown.as_mut() {
            Some(rx) => tokio::select! {
                _ = tokio::time::sleep(slice) => false,
                changed = rx.changed() => match changed {
                    Ok(()) if *rx.borrow() => return true,
                    Ok(()) => false,
                    Err(_) => true,
                },
            },
            None => {
                tokio::time::sleep(slice).await;
                false
            }
        };
        if closed {
            *shutdown = None;
        }
    }
}
