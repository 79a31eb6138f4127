// ───── Std Lib ─────
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

// ───── Crates ─────
use log::{debug, error};

// ───── Local Modules ─────
use crate::error::ServiceError;

/// Grace period granted to the worker thread when shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Queue depth; monitoring never keeps more than one job pending.
const QUEUE_BOUND: usize = 8;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Locks a mutex, recovering the guard when a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-worker task queue providing the thread on which the monitoring
/// jobs of one observable reader run.
///
/// Tasks execute in submission order. Cancellation is not the executor's
/// business: each monitoring job carries its own stop flag.
pub(crate) struct Executor {
    sender: Mutex<Option<mpsc::SyncSender<Task>>>,
    done: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Executor {
    pub(crate) fn new(name: &str) -> Self {
        let (sender, tasks) = mpsc::sync_channel::<Task>(QUEUE_BOUND);
        let (done_sender, done) = mpsc::channel::<()>();
        let thread_name = format!("{}-monitoring", name);
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(task) = tasks.recv() {
                    task();
                }
                let _ = done_sender.send(());
            });
        match spawned {
            Ok(_) => Executor {
                sender: Mutex::new(Some(sender)),
                done: Mutex::new(Some(done)),
            },
            Err(e) => {
                error!("Failed to spawn worker thread '{}': {}", thread_name, e);
                Executor {
                    sender: Mutex::new(None),
                    done: Mutex::new(None),
                }
            }
        }
    }

    /// Queues a task for execution on the worker thread.
    pub(crate) fn execute(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ServiceError> {
        let sender = {
            let guard = lock(&self.sender);
            guard.clone()
        };
        match sender {
            Some(sender) => sender.send(Box::new(task)).map_err(|_| {
                ServiceError::IllegalState("the monitoring executor worker is gone".to_string())
            }),
            None => Err(ServiceError::IllegalState(
                "the monitoring executor has been shut down".to_string(),
            )),
        }
    }

    /// Stops accepting tasks and waits for the worker to drain, up to a
    /// small grace period. Pending blocking jobs must have been unblocked by
    /// the caller beforehand.
    pub(crate) fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        drop(sender);
        if let Some(done) = lock(&self.done).take() {
            if done.recv_timeout(SHUTDOWN_GRACE).is_err() {
                debug!("Monitoring worker did not drain within {:?}, detaching", SHUTDOWN_GRACE);
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_submission_order_on_one_thread() {
        let executor = Executor::new("test");
        let trace = Arc::new(Mutex::new(Vec::new()));
        for index in 0..4 {
            let trace = Arc::clone(&trace);
            executor
                .execute(move || lock(&trace).push(index))
                .expect("task accepted");
        }
        executor.shutdown();
        assert_eq!(*lock(&trace), vec![0, 1, 2, 3]);
    }

    #[test]
    fn execute_after_shutdown_is_rejected() {
        let executor = Executor::new("test");
        executor.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        let result = executor.execute(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Err(ServiceError::IllegalState(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
