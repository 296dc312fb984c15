// src/sync/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ingest::config::CadenceSpec;
use crate::sync::SyncOrchestrator;

/// Work run on a fixed cadence. Failures are the task's own business: `run`
/// returns nothing and must not panic past its own boundary.
#[async_trait]
pub trait RecurringTask: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run(&self);
}

/// Registers recurring tasks. Decoupled from any particular timer library.
pub trait TaskScheduler {
    fn schedule(&self, every: Duration, task: Arc<dyn RecurringTask>) -> JoinHandle<()>;
}

/// `tokio::time::interval` per task, in its own spawned loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler {
    /// Wait one full period before the first run.
    pub delay_first_run: bool,
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, every: Duration, task: Arc<dyn RecurringTask>) -> JoinHandle<()> {
        let delay_first_run = self.delay_first_run;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if delay_first_run {
                ticker.tick().await;
            }
            loop {
                ticker.tick().await;
                tracing::debug!(task = task.name(), "tick");
                task.run().await;
            }
        })
    }
}

/// One cadence-table row bound to the orchestrator.
pub struct CadenceTask {
    orchestrator: Arc<SyncOrchestrator>,
    spec: CadenceSpec,
}

impl CadenceTask {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, spec: CadenceSpec) -> Self {
        Self { orchestrator, spec }
    }
}

#[async_trait]
impl RecurringTask for CadenceTask {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn run(&self) {
        let report = self.orchestrator.run_cadence(&self.spec).await;
        let now = chrono::Utc::now().timestamp().max(0) as f64;
        gauge!("sync_cadence_last_run_ts", "cadence" => self.spec.name.clone()).set(now);
        tracing::info!(
            target: "sync",
            cadence = %self.spec.name,
            job = %self.spec.job,
            completed = report.completed.len(),
            rejected = report.rejected.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "cadence tick"
        );
    }
}

/// Start one loop per cadence row. Rows with a zero period are ignored.
pub fn spawn_cadences<S: TaskScheduler>(
    scheduler: &S,
    orchestrator: Arc<SyncOrchestrator>,
    cadences: Vec<CadenceSpec>,
) -> Vec<JoinHandle<()>> {
    cadences
        .into_iter()
        .filter(|c| c.every_minutes > 0 && !c.sources.is_empty())
        .map(|spec| {
            let every = Duration::from_secs(spec.every_minutes * 60);
            tracing::info!(cadence = %spec.name, job = %spec.job, every_minutes = spec.every_minutes, "cadence scheduled");
            let task: Arc<dyn RecurringTask> =
                Arc::new(CadenceTask::new(Arc::clone(&orchestrator), spec));
            scheduler.schedule(every, task)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl RecurringTask for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn run(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_period() {
        let task = Arc::new(Counting(AtomicUsize::new(0)));
        let h = TokioScheduler::default().schedule(Duration::from_secs(60), task.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 3);
        h.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_first_run_waits_one_period() {
        let task = Arc::new(Counting(AtomicUsize::new(0)));
        let sched = TokioScheduler {
            delay_first_run: true,
        };
        let h = sched.schedule(Duration::from_secs(60), task.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 1);
        h.abort();
    }
}
