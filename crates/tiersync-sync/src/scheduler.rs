use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{CycleSummary, SyncError, UpsertEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(CycleSummary),
    /// A previous cycle was still running; nothing was done.
    Skipped,
    Aborted(SyncError),
}

/// Serializes cycles: `Idle -> Running -> Idle`, never two at once.
#[derive(Debug, Default)]
pub struct CycleGate {
    running: AtomicBool,
    idle: Notify,
}

struct RunningGuard<'a>(&'a CycleGate);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

impl CycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CycleState {
        if self.running.load(Ordering::Acquire) {
            CycleState::Running
        } else {
            CycleState::Idle
        }
    }

    /// Run one cycle if idle. Errors are logged here and the gate always
    /// returns to idle, even if the cycle future is dropped mid-flight.
    pub async fn trigger(&self, engine: &UpsertEngine, cancel: &CancellationToken) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("previous sync cycle still running; skipping trigger");
            return TriggerOutcome::Skipped;
        }
        let _guard = RunningGuard(self);

        match engine.run_cycle(cancel).await {
            Ok(summary) => TriggerOutcome::Completed(summary),
            Err(err) => {
                error!(error = %err, "sync cycle aborted");
                TriggerOutcome::Aborted(err)
            }
        }
    }

    /// Resolves as soon as no cycle is running.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a guard dropped in between still wakes us
            notified.as_mut().enable();
            if self.state() == CycleState::Idle {
                return;
            }
            notified.await;
        }
    }
}

/// Fires the engine on a cron expression through a shared [`CycleGate`].
pub struct SyncScheduler {
    engine: Arc<UpsertEngine>,
    gate: Arc<CycleGate>,
    cancel: CancellationToken,
    cron: String,
}

impl SyncScheduler {
    pub fn new(engine: Arc<UpsertEngine>, cron: impl Into<String>) -> Self {
        Self {
            engine,
            gate: Arc::new(CycleGate::new()),
            cancel: CancellationToken::new(),
            cron: cron.into(),
        }
    }

    pub async fn start(&self) -> Result<JobScheduler, SyncError> {
        let sched = JobScheduler::new().await?;
        let engine = Arc::clone(&self.engine);
        let gate = Arc::clone(&self.gate);
        let cancel = self.cancel.clone();

        let job = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            Box::pin(async move {
                if let TriggerOutcome::Completed(summary) = gate.trigger(&engine, &cancel).await {
                    if !summary.failures.is_empty() {
                        warn!(
                            run_id = %summary.run_id,
                            failures = summary.failures.len(),
                            "sync cycle finished with skipped units"
                        );
                    }
                }
            })
        })?;
        sched.add(job).await?;
        sched.start().await?;
        info!(cron = %self.cron, "sync scheduler started");
        Ok(sched)
    }

    /// Cancel any running cycle between units, wait for it to finish, then stop the scheduler.
    pub async fn shutdown(&self, mut sched: JobScheduler, grace: Duration) -> Result<(), SyncError> {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.gate.wait_idle()).await.is_err() {
            warn!(?grace, "sync cycle still running at shutdown");
        }
        sched.shutdown().await?;
        info!("sync scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tiersync_core::ParentRecord;
    use tiersync_source::{DataSource, SourceBatch, SourceError};
    use tiersync_storage::MemoryStore;

    /// Blocks every fetch until released.
    struct GatedSource {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl DataSource for GatedSource {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn fetch_batch(&self) -> Result<SourceBatch, SourceError> {
            self.release.notified().await;
            Ok(SourceBatch {
                parents: vec![ParentRecord {
                    name: "Optimus".into(),
                    username: None,
                    email: "optimus@cybertron.com".into(),
                }],
                ..SourceBatch::default()
            })
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_a_no_op() {
        let release = Arc::new(Notify::new());
        let engine = Arc::new(UpsertEngine::new(
            Arc::new(GatedSource {
                release: Arc::clone(&release),
            }),
            Arc::new(MemoryStore::new()),
        ));
        let gate = Arc::new(CycleGate::new());
        let cancel = CancellationToken::new();

        let first = tokio::spawn({
            let (gate, engine, cancel) = (Arc::clone(&gate), Arc::clone(&engine), cancel.clone());
            async move { gate.trigger(&engine, &cancel).await }
        });
        while gate.state() != CycleState::Running {
            tokio::task::yield_now().await;
        }

        assert!(matches!(gate.trigger(&engine, &cancel).await, TriggerOutcome::Skipped));

        release.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Completed(ref s) if s.parents.inserted == 1));
        assert_eq!(gate.state(), CycleState::Idle);
    }

    struct DownSource;

    #[async_trait]
    impl DataSource for DownSource {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn fetch_batch(&self) -> Result<SourceBatch, SourceError> {
            Err(SourceError::Unavailable {
                collection: tiersync_source::Collection::Parents,
                reason: "timed out".into(),
            })
        }
    }

    #[tokio::test]
    async fn aborted_cycle_returns_gate_to_idle() {
        let engine = UpsertEngine::new(Arc::new(DownSource), Arc::new(MemoryStore::new()));
        let gate = CycleGate::new();

        let outcome = gate.trigger(&engine, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            TriggerOutcome::Aborted(SyncError::SourceUnavailable(_))
        ));
        assert_eq!(gate.state(), CycleState::Idle);

        // the next trigger is free to run
        assert!(matches!(
            gate.trigger(&engine, &CancellationToken::new()).await,
            TriggerOutcome::Aborted(_)
        ));
    }

    #[tokio::test]
    async fn waiting_for_idle_wakes_when_the_cycle_ends() {
        let release = Arc::new(Notify::new());
        let engine = Arc::new(UpsertEngine::new(
            Arc::new(GatedSource {
                release: Arc::clone(&release),
            }),
            Arc::new(MemoryStore::new()),
        ));
        let gate = Arc::new(CycleGate::new());

        let cycle = tokio::spawn({
            let (gate, engine) = (Arc::clone(&gate), Arc::clone(&engine));
            async move { gate.trigger(&engine, &CancellationToken::new()).await }
        });
        while gate.state() != CycleState::Running {
            tokio::task::yield_now().await;
        }

        assert!(
            tokio::time::timeout(Duration::from_millis(20), gate.wait_idle())
                .await
                .is_err(),
            "must not report idle mid-cycle"
        );

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait_idle().await }
        });
        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken once the cycle finished")
            .unwrap();
        assert!(matches!(cycle.await.unwrap(), TriggerOutcome::Completed(_)));
    }
}
