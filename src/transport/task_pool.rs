use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub trait TaskCreator<T>: Send + Sync + 'static {
    fn create_task(&self) -> T;
}

impl<T, F> TaskCreator<T> for F
where F: Fn() -> T + Send + Sync + 'static
{
    fn create_task(&self) -> T {
        self()
    }
}

/// A bounded pool of reusable receive tasks (buffers and per-frame state). At most `max_tasks`
///  tasks are handed out at any given time, callers of [RxTaskPool::acquire] wait when that
///  limit is reached. Tasks are created lazily beyond the `min_tasks` that are created up front.
pub struct RxTaskPool<T: Send + 'static> {
    idle: Mutex<Vec<T>>,
    permits: Arc<Semaphore>,
    creator: Box<dyn TaskCreator<T>>,
    max_tasks: usize,
}

impl<T: Send + 'static> RxTaskPool<T> {
    pub fn new(min_tasks: usize, max_tasks: usize, creator: impl TaskCreator<T>) -> Arc<RxTaskPool<T>> {
        let idle = (0..min_tasks.min(max_tasks))
            .map(|_| creator.create_task())
            .collect();

        Arc::new(RxTaskPool {
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(max_tasks)),
            creator: Box::new(creator),
            max_tasks,
        })
    }

    /// Waits until a task is available. This fails only if the pool was closed.
    pub async fn acquire(self: &Arc<Self>) -> anyhow::Result<PooledTask<T>> {
        let permit = self.permits.clone().acquire_owned().await
            .map_err(|_| anyhow!("task pool is closed"))?;
        Ok(self.checkout(permit))
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledTask<T>> {
        self.permits.clone().try_acquire_owned().ok()
            .map(|permit| self.checkout(permit))
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PooledTask<T> {
        let pooled = self.idle.lock().unwrap().pop();
        let task = pooled.unwrap_or_else(|| self.creator.create_task());
        PooledTask {
            task: Some(task),
            pool: self.clone(),
            _permit: permit,
        }
    }

    /// wakes up all waiting callers with an error, and rejects all future calls
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().unwrap().clear();
    }

    /// number of tasks currently handed out
    pub fn outstanding(&self) -> usize {
        self.max_tasks - self.permits.available_permits()
    }

    /// number of tasks available for reuse without creating a new one
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }
}

/// A task that is checked out from a pool. It is returned to the pool when this guard is
///  dropped, regardless of how the code using it terminated.
pub struct PooledTask<T: Send + 'static> {
    task: Option<T>,
    pool: Arc<RxTaskPool<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> Deref for PooledTask<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.task.as_ref().expect("task is present until drop")
    }
}

impl<T: Send + 'static> DerefMut for PooledTask<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.task.as_mut().expect("task is present until drop")
    }
}

impl<T: Send + 'static> Drop for PooledTask<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            // the permit is released after this, so the task is available before a waiting
            //  caller is woken up
            if !self.pool.permits.is_closed() {
                self.pool.idle.lock().unwrap().push(task);
            }
        }
    }
}
