//! Job scheduler
//!
//! A fixed list of jobs is registered at startup and each one gets its own
//! tokio task. A job runs once immediately, then on every tick of its
//! interval, and whenever it is triggered through a [`SchedulerHandle`].
//! A job never overlaps with itself: a trigger that arrives mid-run is kept
//! and starts the next run as soon as the current one returns.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A unit of recurring background work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable name, used in logs and for manual triggers
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

struct Registration {
    job: Arc<dyn Job>,
    interval: Duration,
    trigger: Arc<Notify>,
}

/// Owns the job list until [`start`](Scheduler::start) hands it to tasks
pub struct Scheduler {
    jobs: Vec<Registration>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            jobs: Vec::new(),
            shutdown,
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>, interval: Duration) -> &mut Self {
        info!(job = job.name(), interval_secs = interval.as_secs(), "Registered job");
        self.jobs.push(Registration {
            job,
            interval,
            trigger: Arc::new(Notify::new()),
        });
        self
    }

    /// Spawn one loop per job. The returned task finishes once every loop
    /// has seen the shutdown signal.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let triggers = self
            .jobs
            .iter()
            .map(|r| (r.job.name(), r.trigger.clone()))
            .collect();
        let handle = SchedulerHandle {
            triggers: Arc::new(triggers),
        };

        let shutdown = self.shutdown;
        let loops: Vec<JoinHandle<()>> = self
            .jobs
            .into_iter()
            .map(|registration| tokio::spawn(run_loop(registration, shutdown.clone())))
            .collect();

        info!(jobs = loops.len(), "Job scheduler started");
        let task = tokio::spawn(async move {
            for handle in loops {
                if let Err(e) = handle.await {
                    error!(error = %e, "Job loop ended abnormally");
                }
            }
            info!("Job scheduler stopped");
        });

        (handle, task)
    }
}

/// Cheap clonable handle for waking jobs by name
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    triggers: Arc<HashMap<&'static str, Arc<Notify>>>,
}

impl SchedulerHandle {
    /// Ask `name` to run now. Returns false for an unknown job.
    pub fn trigger(&self, name: &str) -> bool {
        match self.triggers.get(name) {
            Some(notify) => {
                notify.notify_one();
                debug!(job = name, "Job triggered");
                true
            },
            None => false,
        }
    }
}

async fn run_loop(registration: Registration, shutdown: CancellationToken) {
    let Registration {
        job,
        interval,
        trigger,
    } = registration;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {},
            _ = trigger.notified() => {},
        }
        run_once(&job).await;
    }

    debug!(job = job.name(), "Job loop stopped");
}

/// Run in a separate task so a panic is logged as a failed run
async fn run_once(job: &Arc<dyn Job>) {
    let name = job.name();
    let started = Instant::now();
    let task = {
        let job = job.clone();
        tokio::spawn(async move { job.run().await })
    };

    match task.await {
        Ok(Ok(())) => debug!(
            job = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job run finished"
        ),
        Ok(Err(e)) => error!(job = name, error = %format!("{e:#}"), "Job run failed"),
        Err(e) => error!(job = name, error = %e, "Job run panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        panics: bool,
    }

    impl CountingJob {
        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_on_start_tick_and_trigger() {
        let job = Arc::new(CountingJob::default());
        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::new(shutdown.clone());
        scheduler.register(job.clone(), Duration::from_secs(60));
        let (handle, task) = scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs(), 1);

        assert!(handle.trigger("counting"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.runs(), 3);

        assert!(!handle.trigger("missing"));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_keeps_its_loop() {
        let job = Arc::new(CountingJob {
            panics: true,
            ..CountingJob::default()
        });
        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::new(shutdown.clone());
        scheduler.register(job.clone(), Duration::from_secs(3600));
        let (handle, task) = scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger("counting");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
