//! Single-consumer executor pool.
//!
//! Every session is pinned to one executor for its lifetime, so all session
//! state is mutated from a single task. An executor is a spawned worker
//! draining an unbounded queue; the dispatcher probes `is_active` before
//! submitting and still has to handle a rejected submit, because the worker
//! may shut down in between.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor rejected task: worker is shut down")]
    Rejected,
}

/// Handle to a single-consumer worker task. Clones share the same worker.
#[derive(Clone)]
pub struct Executor {
    tx: mpsc::UnboundedSender<Task>,
    token: CancellationToken,
}

impl Executor {
    fn start(index: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let token = CancellationToken::new();
        let worker_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => task(),
                        None => break,
                    },
                    _ = worker_token.cancelled() => break,
                }
            }
            debug!(index, "executor worker exited");
        });
        Self { tx, token }
    }

    /// False once the worker is draining or gone. A true result is only a
    /// hint; `submit` can still be rejected afterwards.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.tx.is_closed()
    }

    /// Enqueue a task on the worker. Tasks from one submitter run in
    /// submission order.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        if !self.is_active() {
            return Err(ExecutorError::Rejected);
        }
        self.tx
            .send(Box::new(task))
            .map_err(|_| ExecutorError::Rejected)
    }

    /// Stop the worker. Queued tasks that have not started are dropped.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Fixed pool of executors handed out round-robin.
pub struct ExecutorPool {
    workers: Vec<Executor>,
    next: AtomicUsize,
}

impl ExecutorPool {
    /// Spawn `count` workers. Must be called from within a tokio runtime.
    pub fn new(count: usize) -> Arc<Self> {
        let count = count.max(1);
        let workers = (0..count).map(Executor::start).collect();
        Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn acquire(&self) -> Executor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn submitted_task_runs() {
        let pool = ExecutorPool::new(1);
        let exec = pool.acquire();
        let (tx, rx) = oneshot::channel();
        exec.submit(move || {
            let _ = tx.send(42u32);
        })
        .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let pool = ExecutorPool::new(1);
        let exec = pool.acquire();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..10u32 {
            let seen = seen.clone();
            exec.submit(move || seen.lock().unwrap().push(i)).unwrap();
        }
        exec.submit(move || {
            let _ = done_tx.send(());
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stopped_executor_rejects() {
        let pool = ExecutorPool::new(2);
        let exec = pool.acquire();
        assert!(exec.is_active());
        exec.stop();
        assert!(!exec.is_active());
        assert!(matches!(
            exec.submit(|| {}),
            Err(ExecutorError::Rejected)
        ));
    }

    #[tokio::test]
    async fn acquire_round_robins() {
        let pool = ExecutorPool::new(3);
        let hits = Arc::new(AtomicU32::new(0));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let exec = pool.acquire();
            let hits = hits.clone();
            let (tx, rx) = oneshot::channel();
            exec.submit(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            tokio::time::timeout(Duration::from_secs(1), rx)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
