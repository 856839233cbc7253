//! Task execution context for retry attempts and callback dispatch.

use crate::error::StreamError;
use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

/// An owned handle to the runtime that runs a client's background work.
///
/// Every task spawned through the pool is tracked so that [`shutdown`](Self::shutdown)
/// can abort whatever is still running. A client owns its pool; dropping the
/// client only closes it, [`StreamingClient::shutdown`](crate::StreamingClient::shutdown)
/// also shuts the pool down.
pub struct TaskPool {
    handle: Handle,
    inner: Mutex<PoolState>,
}

struct PoolState {
    tasks: Vec<AbortHandle>,
    shut_down: bool,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TaskPool")
            .field("tracked_tasks", &state.tasks.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl TaskPool {
    /// Create a pool that spawns onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            inner: Mutex::new(PoolState {
                tasks: Vec::new(),
                shut_down: false,
            }),
        }
    }

    /// Create a pool on the runtime the caller is running in.
    pub fn current() -> Result<Self, StreamError> {
        let handle = Handle::try_current().map_err(|e| StreamError::Task(e.to_string()))?;
        Ok(Self::new(handle))
    }

    /// Spawn a task, failing if the pool has been shut down.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, StreamError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.shut_down {
            return Err(StreamError::Task("task pool is shut down".to_string()));
        }

        state.tasks.retain(|task| !task.is_finished());
        let join = self.handle.spawn(future);
        state.tasks.push(join.abort_handle());
        Ok(join)
    }

    /// Run blocking code on the runtime's blocking threads, failing if the pool
    /// has been shut down. Shutdown cannot interrupt a closure that is running.
    pub fn spawn_blocking<F, R>(&self, f: F) -> Result<JoinHandle<R>, StreamError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.shut_down {
            return Err(StreamError::Task("task pool is shut down".to_string()));
        }

        state.tasks.retain(|task| !task.is_finished());
        let join = self.handle.spawn_blocking(f);
        state.tasks.push(join.abort_handle());
        Ok(join)
    }

    /// Abort every tracked task and refuse new ones. Idempotent.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            std::mem::take(&mut state.tasks)
        };

        if !tasks.is_empty() {
            tracing::debug!(tasks = tasks.len(), "aborting pool tasks");
        }
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        let mut state = self.inner.lock();
        state.tasks.retain(|task| !task.is_finished());
        state.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = assert_ok!(TaskPool::current());
        let join = assert_ok!(pool.spawn(async { 21 * 2 }));
        assert_eq!(assert_ok!(join.await), 42);
    }

    #[tokio::test]
    async fn test_spawn_blocking_leaves_runtime_free() {
        let pool = assert_ok!(TaskPool::current());
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let join = assert_ok!(pool.spawn_blocking(move || gate.recv().is_ok()));

        // The single runtime thread keeps running while the closure blocks
        tokio::task::yield_now().await;
        assert!(!join.is_finished());
        release.send(()).unwrap();
        assert!(assert_ok!(join.await));

        pool.shutdown();
        assert_err!(pool.spawn_blocking(|| ()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_and_refuses() {
        let pool = assert_ok!(TaskPool::current());
        let join = assert_ok!(pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        assert_eq!(pool.active_tasks(), 1);

        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(assert_err!(join.await).is_cancelled());
        assert_err!(pool.spawn(async {}));

        // Second shutdown is harmless
        pool.shutdown();
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        let err = assert_err!(TaskPool::current());
        assert_eq!(err.kind(), crate::error::FailureKind::Task);
    }
}
