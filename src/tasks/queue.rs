use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

pub type JobError = Box<dyn Error + Send + Sync>;

/// Work performed for a job key.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, key: &str) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobStatus {
    #[default]
    Absent,
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn in_flight(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A fresh job was queued.
    Queued,
    /// The running job will run once more when it finishes.
    FollowUp,
    /// Already covered by a queued job or a pending follow-up.
    Coalesced,
    /// The queue has been shut down.
    Stopped,
}

/// Keyed work queue with at most one job in flight per key.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Checks for an in-flight job and enqueues in one atomic step.
    async fn enqueue_if_absent(&self, key: &str) -> Enqueued;

    async fn status(&self, key: &str) -> JobStatus;

    /// Waits until nothing is in flight for `key`, then marks it running for the
    /// caller, who does the work itself and must `release` afterwards.
    async fn claim(&self, key: &str);

    /// Ends a claim. Requests that arrived meanwhile become one queued job.
    fn release(&self, key: &str, succeeded: bool);
}

#[derive(Debug, Default)]
struct JobEntry {
    status: JobStatus,
    follow_up: bool,
    settled_at: Option<Instant>,
}

impl JobEntry {
    fn settle(&mut self, succeeded: bool) {
        self.status = if succeeded {
            JobStatus::Finished
        } else {
            JobStatus::Failed
        };
        self.settled_at = Some(Instant::now());
    }

    /// Settled entries are kept for `retention`, after which they read as absent.
    fn is_live(&self, retention: Duration) -> bool {
        self.status.in_flight() || self.settled_at.is_some_and(|at| at.elapsed() < retention)
    }
}

type JobTable = Arc<Mutex<HashMap<String, JobEntry>>>;
type KeyReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>;

/// In-process job queue drained by a fixed pool of tokio workers.
pub struct LocalJobQueue {
    name: String,
    jobs: JobTable,
    idle: Arc<Notify>,
    retention: Duration,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalJobQueue {
    pub fn start(
        name: &str,
        handler: Arc<dyn JobHandler>,
        worker_count: usize,
        retention: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: KeyReceiver = Arc::new(AsyncMutex::new(receiver));
        let jobs: JobTable = Arc::default();
        let idle = Arc::new(Notify::new());

        let workers = (0..worker_count.max(1))
            .map(|index| {
                tokio::spawn(work(
                    format!("{}-{}", name, index),
                    Arc::clone(&receiver),
                    Arc::clone(&jobs),
                    Arc::clone(&idle),
                    Arc::clone(&handler),
                ))
            })
            .collect::<Vec<_>>();
        info!("Started queue {} with {} worker(s)", name, workers.len());

        Arc::new(Self {
            name: name.to_string(),
            jobs,
            idle,
            retention,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Stops accepting jobs, lets the workers drain what is queued, and waits for them.
    pub async fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker of queue {} ended abnormally: {}", self.name, e);
            }
        }
        info!("Queue {} stopped", self.name);
    }

    fn send(&self, key: &str) -> bool {
        lock(&self.sender)
            .as_ref()
            .is_some_and(|sender| sender.send(key.to_string()).is_ok())
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue_if_absent(&self, key: &str) -> Enqueued {
        let mut jobs = lock(&self.jobs);
        let retention = self.retention;
        jobs.retain(|_, entry| entry.is_live(retention));

        let entry = jobs.entry(key.to_string()).or_default();
        match entry.status {
            JobStatus::Queued => Enqueued::Coalesced,
            JobStatus::Running if entry.follow_up => Enqueued::Coalesced,
            JobStatus::Running => {
                entry.follow_up = true;
                Enqueued::FollowUp
            }
            JobStatus::Absent | JobStatus::Finished | JobStatus::Failed => {
                if !self.send(key) {
                    return Enqueued::Stopped;
                }
                entry.status = JobStatus::Queued;
                entry.settled_at = None;
                Enqueued::Queued
            }
        }
    }

    async fn status(&self, key: &str) -> JobStatus {
        lock(&self.jobs)
            .get(key)
            .filter(|entry| entry.is_live(self.retention))
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    async fn claim(&self, key: &str) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            {
                let mut jobs = lock(&self.jobs);
                let entry = jobs.entry(key.to_string()).or_default();
                if !entry.status.in_flight() {
                    entry.status = JobStatus::Running;
                    entry.settled_at = None;
                    return;
                }
            }
            debug!("Waiting for in-flight job {} on queue {}", key, self.name);
            idle.await;
        }
    }

    fn release(&self, key: &str, succeeded: bool) {
        let mut jobs = lock(&self.jobs);
        let entry = jobs.entry(key.to_string()).or_default();
        if entry.follow_up {
            entry.follow_up = false;
            if self.send(key) {
                entry.status = JobStatus::Queued;
                return;
            }
            warn!("Queue {} stopped, dropping follow-up for {}", self.name, key);
        }
        entry.settle(succeeded);
        drop(jobs);
        self.idle.notify_waiters();
    }
}

async fn work(
    worker: String,
    receiver: KeyReceiver,
    jobs: JobTable,
    idle: Arc<Notify>,
    handler: Arc<dyn JobHandler>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(key) = next else {
            break;
        };

        loop {
            lock(&jobs).entry(key.clone()).or_default().status = JobStatus::Running;
            let succeeded = run_isolated(&worker, &handler, &key).await;

            let rerun = {
                let mut table = lock(&jobs);
                let entry = table.entry(key.clone()).or_default();
                if entry.follow_up {
                    entry.follow_up = false;
                    true
                } else {
                    entry.settle(succeeded);
                    false
                }
            };
            if !rerun {
                idle.notify_waiters();
                break;
            }
            debug!("{} running {} again for requests that arrived meanwhile", worker, key);
        }
    }
    debug!("{} exiting", worker);
}

/// Runs the handler on its own task so a panic is contained to this job.
async fn run_isolated(worker: &str, handler: &Arc<dyn JobHandler>, key: &str) -> bool {
    let handler = Arc::clone(handler);
    let owned_key = key.to_string();
    match tokio::spawn(async move { handler.run(&owned_key).await }).await {
        Ok(Ok(())) => {
            debug!("{} finished job {}", worker, key);
            true
        }
        Ok(Err(e)) => {
            error!("{} job {} failed: {}", worker, key, e);
            false
        }
        Err(e) => {
            error!("{} job {} aborted: {}", worker, key, e);
            false
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    const RETENTION: Duration = Duration::from_secs(60);

    struct GatedHandler {
        runs: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn run(&self, _key: &str) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            Ok(())
        }
    }

    struct FlakyHandler {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn run(&self, _key: &str) -> Result<(), JobError> {
            match self.runs.fetch_add(1, Ordering::SeqCst) {
                0 => Err("tabulation blew up".into()),
                1 => panic!("tabulation panicked"),
                _ => Ok(()),
            }
        }
    }

    async fn wait_for(queue: &LocalJobQueue, key: &str, wanted: JobStatus) {
        timeout(Duration::from_secs(5), async {
            while queue.status(key).await != wanted {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never reached the wanted status");
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_follow_up() {
        let handler = Arc::new(GatedHandler {
            runs: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let queue = LocalJobQueue::start("test", handler.clone(), 2, RETENTION);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Running).await;

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::FollowUp);
        for _ in 0..20 {
            assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Coalesced);
        }

        handler.gate.add_permits(2);
        wait_for(&queue, "e1", JobStatus::Finished).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn keys_do_not_block_each_other() {
        let handler = Arc::new(GatedHandler {
            runs: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let queue = LocalJobQueue::start("test", handler.clone(), 2, RETENTION);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        assert_eq!(queue.enqueue_if_absent("e2").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Running).await;
        wait_for(&queue, "e2", JobStatus::Running).await;

        handler.gate.add_permits(2);
        wait_for(&queue, "e1", JobStatus::Finished).await;
        wait_for(&queue, "e2", JobStatus::Finished).await;
        assert_eq!(queue.status("e3").await, JobStatus::Absent);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn failed_and_panicked_jobs_can_be_rescheduled() {
        let handler = Arc::new(FlakyHandler {
            runs: AtomicUsize::new(0),
        });
        let queue = LocalJobQueue::start("test", handler.clone(), 1, RETENTION);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Failed).await;

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Failed).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Finished).await;

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_queue_refuses_work() {
        let handler = Arc::new(FlakyHandler {
            runs: AtomicUsize::new(2),
        });
        let queue = LocalJobQueue::start("test", handler, 1, RETENTION);
        queue.shutdown().await;

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Stopped);
        assert!(!queue.status("e1").await.in_flight());
    }

    #[tokio::test]
    async fn claim_waits_for_the_running_job() {
        let handler = Arc::new(GatedHandler {
            runs: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let queue = LocalJobQueue::start("test", handler.clone(), 1, RETENTION);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        wait_for(&queue, "e1", JobStatus::Running).await;

        let claimer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.claim("e1").await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!claimer.is_finished());

        handler.gate.add_permits(1);
        timeout(Duration::from_secs(5), claimer).await.unwrap().unwrap();
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status("e1").await, JobStatus::Running);

        // A request during the claim is handed to a worker on release.
        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::FollowUp);
        queue.release("e1", true);
        handler.gate.add_permits(1);
        wait_for(&queue, "e1", JobStatus::Finished).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn released_claim_records_the_outcome() {
        let handler = Arc::new(FlakyHandler {
            runs: AtomicUsize::new(2),
        });
        let queue = LocalJobQueue::start("test", handler, 1, RETENTION);

        queue.claim("e1").await;
        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::FollowUp);
        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Coalesced);
        queue.shutdown().await;

        queue.release("e1", false);
        assert_eq!(queue.status("e1").await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn settled_jobs_are_forgotten_after_retention() {
        let handler = Arc::new(FlakyHandler {
            runs: AtomicUsize::new(2),
        });
        let queue = LocalJobQueue::start("test", handler.clone(), 1, Duration::ZERO);

        assert_eq!(queue.enqueue_if_absent("e1").await, Enqueued::Queued);
        timeout(Duration::from_secs(5), async {
            while handler.runs.load(Ordering::SeqCst) < 3 || queue.status("e1").await.in_flight() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.status("e1").await, JobStatus::Absent);

        assert_eq!(queue.enqueue_if_absent("e2").await, Enqueued::Queued);
        assert!(!lock(&queue.jobs).contains_key("e1"));

        queue.shutdown().await;
    }
}
