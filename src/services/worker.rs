use futures::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{select, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use super::{
    jobqueue::JobQueue,
    jobrunner::{JobRunner, RunOutcome},
    locker::Locker,
    reclaimer::StaleLockReclaimer,
    registry::HandlerRegistry,
};
use crate::{
    db::Store,
    models::{Error, Job, WorkerOptions},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reclaimed: usize,
    pub fetched: usize,
    pub claimed: usize,
    /// Candidates another worker claimed first.
    pub lost: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
}

struct Running {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// One poller. Any number of workers, in this process or others, may share
/// a store; the claim is their only coordination.
pub struct Worker {
    store: Arc<dyn Store>,
    options: WorkerOptions,
    locker: Locker,
    reclaimer: StaleLockReclaimer,
    runner: JobRunner,
    running: Mutex<Option<Running>>,
}

impl Worker {
    pub fn new(
        worker_id: String,
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        queue: JobQueue,
        options: WorkerOptions,
    ) -> Self {
        let locker = Locker::new(Arc::clone(&store), worker_id);
        let reclaimer = StaleLockReclaimer::new(Arc::clone(&store), options.stale_after);
        let runner = JobRunner::new(Arc::clone(&store), registry, queue, options.clone());
        Self {
            store,
            options,
            locker,
            reclaimer,
            runner,
            running: Mutex::new(None),
        }
    }

    /// `{hostname}:{pid}:{random}`, unique per worker value.
    pub fn generate_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}:{}:{}",
            whoami::hostname(),
            std::process::id(),
            &suffix[..8]
        )
    }

    pub fn worker_id(&self) -> &str {
        self.locker.worker_id()
    }

    /// Spawns the polling loop. A no-op while a loop is already running.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!({ worker_id = self.worker_id() }, "already started");
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = Arc::clone(self);
            let token = token.clone();
            async move { worker.run(token).await }
        });
        *running = Some(Running { handle, token });
    }

    /// Halts future ticks and waits for the tick in flight, if any.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { handle, token }) = running else {
            return;
        };
        token.cancel();
        if let Err(err) = handle.await {
            error!({ worker_id = self.worker_id() }, "worker task error {:?}", err);
        }
    }

    async fn run(&self, token: CancellationToken) {
        let worker_id = self.worker_id();
        info!(
            {
                worker_id,
                poll_interval_ms = self.options.poll_interval.as_millis() as u64,
                batch_size = self.options.batch_size,
                backoff_base_secs = self.options.backoff.base_delay().as_secs()
            },
            "start"
        );
        let mut interval = time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            select!(
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {},
            );
            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(report)) if report != TickReport::default() => {
                    debug!({ worker_id }, "tick {:?}", report)
                }
                Ok(Ok(_)) => trace!({ worker_id }, "tick idle"),
                Ok(Err(err)) => error!({ worker_id }, "error {}", err),
                Err(_) => error!({ worker_id }, "tick panicked"),
            }
        }
        info!({ worker_id }, "stop");
    }

    /// Reclaims stale locks, then claims and runs due jobs one at a time.
    pub async fn tick(&self) -> Result<TickReport, Error> {
        let reclaimed = match self.reclaimer.run().await {
            Ok(report) => report.total(),
            Err(err) => {
                error!({ worker_id = self.worker_id() }, "reclaim error {}", err);
                0
            }
        };
        let due = self.store.fetch_due(self.options.batch_size).await?;
        let mut report = self.process(due).await;
        report.reclaimed = reclaimed;
        Ok(report)
    }

    pub(crate) async fn process(&self, candidates: Vec<Job>) -> TickReport {
        let mut report = TickReport {
            fetched: candidates.len(),
            ..TickReport::default()
        };
        for candidate in candidates {
            let job = match self.locker.claim(candidate.id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    report.lost += 1;
                    continue;
                }
                Err(err) => {
                    error!({ worker_id = self.worker_id(), job_id = candidate.id }, "claim error {}", err);
                    continue;
                }
            };
            report.claimed += 1;
            match self.runner.run(&job).await {
                Ok(RunOutcome::Succeeded) => report.succeeded += 1,
                Ok(RunOutcome::Retrying) => report.retrying += 1,
                Ok(RunOutcome::Failed) => report.failed += 1,
                Ok(RunOutcome::LockLost) => {}
                Err(err) => {
                    error!({ worker_id = self.worker_id(), job_id = job.id }, "run error {:?}", err)
                }
            }
        }
        report
    }
}
