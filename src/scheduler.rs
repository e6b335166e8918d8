//! Scheduler - named repeating jobs with result subscribers
//!
//! Each job runs on its own tokio task. The first run happens one interval
//! after registration, `trigger` requests an extra run right away, and every
//! successful result is handed to the job's subscribers in registration
//! order. A job never overlaps with itself, even after being replaced under
//! the same name.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type WorkFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
pub type Subscriber<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type Subscribers<T> = Arc<Mutex<Vec<Subscriber<T>>>>;

struct JobHandle<T> {
    subscribers: Subscribers<T>,
    trigger: Arc<Notify>,
    /// Dropping the sender ends the job loop after any in-flight run
    _stop: watch::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Scheduler<T> {
    jobs: Mutex<HashMap<String, JobHandle<T>>>,
    /// Survive re-registration so a replaced job cannot overlap its successor
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + Sync + 'static> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register `work` to run every `interval`, replacing any job with the
    /// same name. Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, name: &str, work: F, interval: Duration)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let work: WorkFn<T> = Arc::new(move || work().boxed());
        let interval = interval.max(Duration::from_millis(1));

        let run_lock = lock(&self.run_locks)
            .entry(name.to_string())
            .or_default()
            .clone();

        let subscribers: Subscribers<T> = Arc::new(Mutex::new(Vec::new()));
        let trigger = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = watch::channel(());

        let task = tokio::spawn(job_loop(
            name.to_string(),
            work,
            interval,
            subscribers.clone(),
            trigger.clone(),
            run_lock,
            stop_rx,
        ));

        let previous = lock(&self.jobs).insert(
            name.to_string(),
            JobHandle {
                subscribers,
                trigger,
                _stop: stop_tx,
                task,
            },
        );

        if previous.is_some() {
            info!("Job '{}' replaced (every {:?})", name, interval);
        } else {
            info!("Job '{}' scheduled (every {:?})", name, interval);
        }
    }

    /// Add a callback for a job's results. Returns false for an unknown job.
    pub fn subscribe<F, Fut>(&self, name: &str, callback: F) -> bool
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let jobs = lock(&self.jobs);
        let Some(job) = jobs.get(name) else {
            debug!("Ignoring subscription to unknown job '{}'", name);
            return false;
        };

        let subscriber: Subscriber<T> = Arc::new(move |result| callback(result).boxed());
        lock(&job.subscribers).push(subscriber);
        true
    }

    /// Queue an immediate run, after any run already in flight.
    pub fn trigger(&self, name: &str) -> bool {
        match lock(&self.jobs).get(name) {
            Some(job) => {
                job.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Cancel a job's timer and forget it. A run in flight still completes.
    pub fn stop(&self, name: &str) -> bool {
        let removed = lock(&self.jobs).remove(name);
        if removed.is_some() {
            info!("Job '{}' stopped", name);
        }
        removed.is_some()
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.jobs).keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every job and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        // Dropping each handle's sender signals every loop before waiting on any
        let tasks: Vec<(String, JoinHandle<()>)> = lock(&self.jobs)
            .drain()
            .map(|(name, job)| (name, job.task))
            .collect();

        for (name, task) in tasks {
            if let Err(e) = task.await {
                warn!("Job '{}' ended abnormally: {}", name, e);
            }
        }

        info!("Scheduler shut down");
    }
}

async fn job_loop<T: Send + Sync + 'static>(
    name: String,
    work: WorkFn<T>,
    interval: Duration,
    subscribers: Subscribers<T>,
    trigger: Arc<Notify>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    mut stop: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            // Resolves with an error once the sender is dropped
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => debug!("Job '{}' triggered", name),
        }

        let _running = run_lock.lock().await;
        execute(&name, &work, &subscribers).await;
    }

    debug!("Job '{}' loop exited", name);
}

/// Run the work function once and fan its result out to subscribers.
/// Errors and panics are contained here.
async fn execute<T: Send + Sync + 'static>(
    name: &str,
    work: &WorkFn<T>,
    subscribers: &Subscribers<T>,
) {
    let started = Instant::now();

    let result = match AssertUnwindSafe(async { work().await }).catch_unwind().await {
        Ok(Ok(result)) => Arc::new(result),
        Ok(Err(e)) => {
            error!("Job '{}' failed: {:#}", name, e);
            return;
        }
        Err(_) => {
            error!("Job '{}' panicked", name);
            return;
        }
    };

    debug!("Job '{}' finished in {:?}", name, started.elapsed());

    let subscribers: Vec<Subscriber<T>> = lock(subscribers).clone();
    for (index, subscriber) in subscribers.iter().enumerate() {
        let outcome = AssertUnwindSafe(async { subscriber(result.clone()).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Subscriber {} of job '{}' failed: {:#}", index, name, e),
            Err(_) => warn!("Subscriber {} of job '{}' panicked", index, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_work(counter: Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, Result<usize>> + Send + Sync {
        move || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_after_one_interval() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("job", counting_work(runs.clone()), Duration::from_secs(10));

        sleep(Duration::from_secs(9)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_receive_results_in_order() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("job", counting_work(runs), Duration::from_secs(5));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let seen = seen.clone();
            assert!(scheduler.subscribe("job", move |result: Arc<usize>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((label, *result));
                    Ok(())
                }
            }));
        }

        sleep(Duration::from_secs(11)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_unknown_job_is_noop() {
        let scheduler: Scheduler<usize> = Scheduler::new();
        assert!(!scheduler.subscribe("missing", |_| async { Ok(()) }));
        assert!(!scheduler.trigger("missing"));
        assert!(!scheduler.stop("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_work_skips_subscribers() {
        let scheduler: Scheduler<usize> = Scheduler::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_job = attempts.clone();
        scheduler.schedule(
            "job",
            move || {
                let attempts = attempts_in_job.clone();
                async move {
                    match attempts.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(anyhow!("remote unavailable")),
                        1 => panic!("unexpected payload"),
                        n => Ok(n),
                    }
                }
            },
            Duration::from_secs(1),
        );

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_in_sub = delivered.clone();
        scheduler.subscribe("job", move |_| {
            let delivered = delivered_in_sub.clone();
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        sleep(Duration::from_millis(3500)).await;
        // Error, panic, then the first success
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_failure_is_isolated() {
        let scheduler = Scheduler::new();
        scheduler.schedule("job", counting_work(Arc::new(AtomicUsize::new(0))), Duration::from_secs(1));

        scheduler.subscribe("job", |_| async { Err::<(), _>(anyhow!("send failed")) });
        scheduler.subscribe("job", |result: Arc<usize>| async move {
            if *result > 0 {
                panic!("subscriber bug");
            }
            Ok(())
        });

        let reached = Arc::new(AtomicUsize::new(0));
        let reached_in_sub = reached.clone();
        scheduler.subscribe("job", move |_| {
            let reached = reached_in_sub.clone();
            async move {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_runs() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("job", counting_work(runs.clone()), Duration::from_secs(1));

        sleep(Duration::from_millis(1500)).await;
        assert!(scheduler.stop("job"));
        assert!(scheduler.job_names().is_empty());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_immediately() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("job", counting_work(runs.clone()), Duration::from_secs(3600));

        assert!(scheduler.trigger("job"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    /// Work that sleeps for `busy` while tracking how many copies run at once
    fn overlapping_work(
        running: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
        busy: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Result<()>> + Send + Sync {
        move || {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let runs = runs.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                sleep(busy).await;
                running.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_never_overlaps_itself() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            "job",
            overlapping_work(running.clone(), max_seen.clone(), runs.clone(), Duration::from_secs(25)),
            Duration::from_secs(10),
        );

        sleep(Duration::from_secs(15)).await;
        // Queued behind the run in flight
        scheduler.trigger("job");

        sleep(Duration::from_secs(100)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_job_waits_for_predecessor() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let old_runs = Arc::new(AtomicUsize::new(0));
        let new_runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            "job",
            overlapping_work(running.clone(), max_seen.clone(), old_runs.clone(), Duration::from_secs(30)),
            Duration::from_secs(10),
        );

        // Old run is in flight from t=10s to t=40s
        sleep(Duration::from_secs(15)).await;
        scheduler.schedule(
            "job",
            overlapping_work(running.clone(), max_seen.clone(), new_runs.clone(), Duration::from_secs(1)),
            Duration::from_secs(1),
        );

        sleep(Duration::from_secs(20)).await;
        assert_eq!(new_runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(old_runs.load(Ordering::SeqCst), 1);
        assert!(new_runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_run() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            "job",
            overlapping_work(running.clone(), max_seen, runs.clone(), Duration::from_secs(5)),
            Duration::from_secs(1),
        );

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(running.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.job_names().is_empty());
    }
}
