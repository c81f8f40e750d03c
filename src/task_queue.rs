//! A strict single-flight task executor: tasks run one at a time in enqueue
//! order on a dedicated worker, and a running task keeps the queue blocked
//! even across its suspension points. Every multiplexer and every session
//! drains its work through one of these.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex as SyncMutex,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    runtime, BoxFuture,
};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(0);

tokio::task_local! {
    /// The id of the queue whose worker is executing the current task, used
    /// to detect reentrant submissions that would deadlock.
    static CURRENT_QUEUE: u64;
}

type QueuedTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Handle to a single-flight task queue. Clones share the queue; the worker
/// exits once every handle is dropped and the backlog is drained.
#[derive(Clone, Debug)]
pub(crate) struct TaskQueue {
    id: u64,
    sender: mpsc::UnboundedSender<QueuedTask>,
    draining: std::sync::Arc<SyncMutex<bool>>,
}

impl TaskQueue {
    /// Creates a queue and spawns its worker. Must be called from within a
    /// Tokio runtime.
    pub(crate) fn new() -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedTask>();
        runtime::spawn(async move {
            while let Some(task) = receiver.recv().await {
                CURRENT_QUEUE.scope(id, task()).await;
            }
        });
        Self {
            id,
            sender,
            draining: Default::default(),
        }
    }

    /// Whether the caller is running inside one of this queue's own tasks.
    fn inside_own_task(&self) -> bool {
        CURRENT_QUEUE.try_with(|current| *current == self.id).unwrap_or(false)
    }

    /// Enqueues a fire-and-forget task. The task's own code is responsible
    /// for logging its failures.
    pub(crate) fn queue_task<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // A send error means the worker is gone; queued work is then
        // discarded by contract.
        let _ = self.sender.send(Box::new(move || Box::pin(task())));
    }

    /// Enqueues a task and waits for it to run, yielding its result. Must
    /// not be called from inside a task of the same queue; the queue would
    /// never reach the new task.
    pub(crate) async fn run_task<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inside_own_task() {
            return Err(Error::internal(
                "can't run a task from inside a task on the same queue",
            ));
        }
        let (ack, completion) = oneshot::channel::<Result<T>>();
        self.queue_task(move || async move {
            // An unreceived result means the submitter gave up waiting.
            let _ = ack.send(task().await);
        });
        completion
            .await
            .map_err(|_| Error::stopped("task queue stopped before the task ran"))?
    }

    /// Waits until every task enqueued so far has completed. A reentrant
    /// call from inside the queue's own worker, or while another drain is in
    /// flight, returns immediately.
    pub(crate) async fn drain(&self) {
        if self.inside_own_task() {
            return;
        }
        {
            let mut draining = self.draining.lock().unwrap();
            if *draining {
                return;
            }
            *draining = true;
        }
        let _ = self.run_task(|| async { Ok(()) }).await;
        *self.draining.lock().unwrap() = false;
    }
}
