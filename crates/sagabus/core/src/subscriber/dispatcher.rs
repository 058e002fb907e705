//! Bounded worker pool served over a rendezvous channel of slots.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A unit of work bound to one worker slot.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One idle worker, capable of receiving exactly one task. After the task
/// finishes the worker re-enqueues a fresh slot into the pool.
pub struct WorkerSlot {
    task_tx: mpsc::Sender<TaskFuture>,
    busy: Arc<AtomicUsize>,
}

impl WorkerSlot {
    /// Hand the task to the worker behind this slot. The slot is consumed;
    /// it returns to the pool when the task completes.
    pub fn submit(self, task: TaskFuture) {
        self.busy.fetch_add(1, Ordering::SeqCst);
        if self.task_tx.try_send(task).is_err() {
            // The worker is gone (shutdown). The task is dropped with it.
            self.busy.fetch_sub(1, Ordering::SeqCst);
            debug!("worker slot vanished before task submission");
        }
    }
}

/// Fixed-size pool of workers.
///
/// `start` prefills the pool channel with one slot per worker. Obtaining a
/// slot blocks until a worker is free; cancelling the token stops every
/// worker after its current task.
pub struct WorkerDispatcher {
    size: usize,
    busy: Arc<AtomicUsize>,
    pool_tx: mpsc::Sender<WorkerSlot>,
    pool_rx: Mutex<mpsc::Receiver<WorkerSlot>>,
    started: AtomicBool,
}

impl WorkerDispatcher {
    pub fn new(size: usize) -> Self {
        let (pool_tx, pool_rx) = mpsc::channel(size.max(1));
        Self {
            size,
            busy: Arc::new(AtomicUsize::new(0)),
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the workers and fill the pool. Idempotent.
    pub fn start(&self, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.size {
            let (task_tx, task_rx) = mpsc::channel::<TaskFuture>(1);
            let slot = WorkerSlot {
                task_tx: task_tx.clone(),
                busy: Arc::clone(&self.busy),
            };
            // The pool channel holds `size` slots, so this cannot fail.
            let _ = self.pool_tx.try_send(slot);
            self.spawn_worker(task_tx, task_rx, cancel.clone());
        }
    }

    fn spawn_worker(
        &self,
        task_tx: mpsc::Sender<TaskFuture>,
        mut task_rx: mpsc::Receiver<TaskFuture>,
        cancel: CancellationToken,
    ) {
        let pool_tx = self.pool_tx.clone();
        let busy = Arc::clone(&self.busy);
        tokio::spawn(async move {
            loop {
                // Drain an already-submitted task before honoring the
                // cancellation, so a slot obtained right at shutdown still
                // runs (and settles) its message.
                let task = tokio::select! {
                    biased;
                    task = task_rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };

                // Run the task in its own spawn and await the handle: a
                // panicking task aborts with a JoinError and the slot still
                // returns to the pool.
                if let Err(err) = tokio::spawn(task).await {
                    debug!(error = %err, "worker task terminated abnormally");
                }
                busy.fetch_sub(1, Ordering::SeqCst);

                let slot = WorkerSlot {
                    task_tx: task_tx.clone(),
                    busy: Arc::clone(&busy),
                };
                if pool_tx.send(slot).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Take an idle slot, blocking until a worker is free.
    pub async fn obtain(&self) -> Option<WorkerSlot> {
        let mut pool_rx = self.pool_rx.lock().await;
        pool_rx.recv().await
    }

    /// Return an unused slot to the pool.
    pub async fn release(&self, slot: WorkerSlot) {
        let _ = self.pool_tx.send(slot).await;
    }

    /// Number of workers currently executing a task.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn task(fut: impl Future<Output = ()> + Send + 'static) -> TaskFuture {
        Box::pin(fut)
    }

    #[tokio::test]
    async fn pool_is_prefilled_with_size_slots() {
        let dispatcher = WorkerDispatcher::new(3);
        dispatcher.start(CancellationToken::new());

        for _ in 0..3 {
            let slot = timeout(Duration::from_secs(1), dispatcher.obtain())
                .await
                .unwrap()
                .unwrap();
            dispatcher.release(slot).await;
        }
        assert_eq!(dispatcher.busy_workers(), 0);
    }

    #[tokio::test]
    async fn obtain_blocks_while_all_workers_are_busy() {
        let dispatcher = Arc::new(WorkerDispatcher::new(1));
        dispatcher.start(CancellationToken::new());

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slot = dispatcher.obtain().await.unwrap();
        slot.submit(task(async move {
            let _ = release_rx.await;
        }));

        // The only worker is busy: obtaining must time out.
        assert!(
            timeout(Duration::from_millis(200), dispatcher.obtain())
                .await
                .is_err()
        );
        assert_eq!(dispatcher.busy_workers(), 1);

        release_tx.send(()).unwrap();
        let slot = timeout(Duration::from_secs(1), dispatcher.obtain())
            .await
            .unwrap()
            .unwrap();
        dispatcher.release(slot).await;
        assert_eq!(dispatcher.busy_workers(), 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_lose_the_worker() {
        let dispatcher = WorkerDispatcher::new(1);
        dispatcher.start(CancellationToken::new());

        let slot = dispatcher.obtain().await.unwrap();
        slot.submit(task(async {
            panic!("boom");
        }));

        // The slot must come back despite the panic.
        let slot = timeout(Duration::from_secs(1), dispatcher.obtain())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatcher.busy_workers(), 0);
        dispatcher.release(slot).await;
    }

    #[tokio::test]
    async fn cancel_stops_idle_workers() {
        let dispatcher = WorkerDispatcher::new(2);
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone());

        let slot = dispatcher.obtain().await.unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        slot.submit(task(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
        }));

        cancel.cancel();

        // The in-flight task still runs to completion.
        timeout(Duration::from_secs(1), async {
            while dispatcher.busy_workers() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}
