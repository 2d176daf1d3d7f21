//! Running callables concurrently.

use std::thread;
use tokio::runtime::Handle;


/// Something which can run a callable concurrently with the caller
///
/// The spawned task runs to completion independently. If it panics, the panic is not propagated
/// to whoever spawned it; report failures through a conduit or tracker if they need observing.
pub trait Spawn {
    /// Run the task concurrently
    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static;
}

/// Spawns each task on a new OS thread
#[derive(Debug, Copy, Clone, Default)]
pub struct ThreadSpawner;

impl Spawn for ThreadSpawner {
    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // the join handle is dropped, detaching the thread
        drop(thread::spawn(task));
    }
}

/// Spawns each task onto a tokio runtime's blocking thread pool
#[derive(Debug, Clone)]
pub struct TokioSpawner(Handle);

impl TokioSpawner {
    /// Spawn onto the given runtime
    pub fn new(handle: Handle) -> Self {
        TokioSpawner(handle)
    }

    /// Spawn onto the runtime this is called from
    ///
    /// # Panics
    ///
    /// If not called from within a tokio runtime.
    pub fn current() -> Self {
        TokioSpawner(Handle::current())
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.0.spawn_blocking(task));
    }
}

impl<S: Spawn + ?Sized> Spawn for &S {
    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        (**self).spawn(task)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tracker;
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    fn run_tracked<S: Spawn>(spawner: S) -> usize {
        let tracker = Tracker::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let guard = tracker.enter();
            let ran = Arc::clone(&ran);
            spawner.spawn(move || {
                let _guard = guard;
                ran.fetch_add(1, SeqCst);
            });
        }
        tracker.wait().block();
        ran.load(SeqCst)
    }

    #[test]
    fn thread_spawner_runs_tasks() {
        assert_eq!(run_tracked(ThreadSpawner), 10);
    }

    #[test]
    fn tokio_spawner_runs_tasks() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .build()
            .unwrap();
        assert_eq!(run_tracked(TokioSpawner::new(runtime.handle().clone())), 10);
    }
}
