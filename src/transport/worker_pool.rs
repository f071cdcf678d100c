use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A pool of worker tasks for processing received messages. The number of workers grows with
///  demand up to `max_threads`, and workers in excess of `min_threads` terminate after being
///  idle for `max_idle_time`.
///
/// Jobs are queued without limit - the number of frames in flight is bounded by the receiver's
///  task pool instead.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_idle_time: Duration,

    send_queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    receive_queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    workers: Mutex<JoinSet<()>>,

    live: AtomicUsize,
    idle: AtomicUsize,
    active: AtomicUsize,
    task_count: AtomicU64,
    completed_task_count: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, min_threads: usize, max_threads: usize, max_idle_time: Duration) -> WorkerPool {
        let (send, receive) = mpsc::unbounded_channel();
        WorkerPool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                min_threads: min_threads.min(max_threads),
                max_threads: max_threads.max(1),
                max_idle_time,
                send_queue: Mutex::new(Some(send)),
                receive_queue: tokio::sync::Mutex::new(receive),
                workers: Mutex::new(JoinSet::new()),
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                task_count: AtomicU64::new(0),
                completed_task_count: AtomicU64::new(0),
            })
        }
    }

    /// Queues a job for execution, starting a new worker if there is no idle worker and the
    ///  pool is not at capacity yet. This must be called from inside a tokio runtime.
    pub fn execute(&self, job: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        {
            let send_queue = self.inner.send_queue.lock().unwrap();
            let send_queue = send_queue.as_ref()
                .ok_or_else(|| anyhow!("worker pool {} is shut down", self.inner.name))?;
            send_queue.send(Box::pin(job))
                .map_err(|_| anyhow!("worker pool {} is shut down", self.inner.name))?;
        }
        self.inner.task_count.fetch_add(1, Ordering::AcqRel);

        let mut workers = self.inner.workers.lock().unwrap();
        while workers.try_join_next().is_some() {}

        let live = self.inner.live.load(Ordering::Acquire);
        let needs_worker = live < self.inner.min_threads
            || (self.inner.idle.load(Ordering::Acquire) == 0 && live < self.inner.max_threads);
        if needs_worker {
            self.inner.live.fetch_add(1, Ordering::AcqRel);
            trace!("worker pool {}: starting worker #{}", self.inner.name, live + 1);
            workers.spawn(worker_loop(self.inner.clone()));
        }
        Ok(())
    }

    /// Aborts all workers, including jobs that are currently running, and discards queued jobs.
    ///  The pool does not accept jobs afterwards.
    pub fn shutdown_now(&self) {
        debug!("shutting down worker pool {}", self.inner.name);
        self.inner.send_queue.lock().unwrap().take();
        self.inner.workers.lock().unwrap().abort_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.send_queue.lock().unwrap().is_none()
    }

    /// number of live workers
    pub fn pool_size(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// number of workers currently running a job
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// number of jobs ever submitted
    pub fn task_count(&self) -> u64 {
        self.inner.task_count.load(Ordering::Acquire)
    }

    pub fn completed_task_count(&self) -> u64 {
        self.inner.completed_task_count.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

/// keeps the counters accurate however a worker terminates, including abort
struct Decrement<'a>(&'a AtomicUsize);
impl Drop for Decrement<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    let live = Decrement(&inner.live);

    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let next = tokio::time::timeout(inner.max_idle_time, async {
            inner.receive_queue.lock().await
                .recv().await
        }).await;
        inner.idle.fetch_sub(1, Ordering::AcqRel);

        match next {
            Ok(Some(job)) => run_job(&inner, job).await,
            Ok(None) => {
                trace!("worker pool {}: queue closed, terminating worker", inner.name);
                return;
            }
            Err(_) => {
                // `execute` decides about starting workers under the same lock, so a job it
                //  queued either is seen here or gets a new worker
                let leftover = {
                    let _workers = inner.workers.lock().unwrap();
                    let leftover = inner.receive_queue.try_lock().ok()
                        .and_then(|mut queue| queue.try_recv().ok());
                    if leftover.is_none() && inner.live.load(Ordering::Acquire) > inner.min_threads {
                        inner.live.fetch_sub(1, Ordering::AcqRel);
                        trace!("worker pool {}: idle worker terminating", inner.name);
                        // already decremented
                        std::mem::forget(live);
                        return;
                    }
                    leftover
                };
                if let Some(job) = leftover {
                    run_job(&inner, job).await;
                }
            }
        }
    }
}

async fn run_job(inner: &PoolInner, job: Job) {
    inner.active.fetch_add(1, Ordering::AcqRel);
    let active = Decrement(&inner.active);
    job.await;
    drop(active);
    inner.completed_task_count.fetch_add(1, Ordering::AcqRel);
}
