//! Background execution of runs with cooperative cancellation.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{channel, Receiver},
        Arc, Mutex,
    },
};

use anyhow::{Context, Result};
use log::{error, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::driver::Inference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// A shared flag checked by the driver between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type Job = Box<dyn FnOnce(TaskId, CancelToken) + Send + 'static>;

/// A handle to a submitted job.
pub struct TaskHandle {
    id: TaskId,
    run: u64,
    token: CancelToken,
    done: Receiver<()>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Block until the job has returned.
    pub fn wait(&self) {
        // The sender is dropped when the job returns or panics.
        let _ = self.done.recv();
    }
}

/// Queue that accepts jobs for runs and cancels them by task id.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, run: u64, job: Job) -> TaskHandle;

    /// Request cancellation. Returns false if the task is unknown or finished.
    fn cancel(&self, task: TaskId) -> bool;
}

#[derive(Default)]
struct Registry {
    next: AtomicU64,
    active: Mutex<HashMap<TaskId, CancelToken>>,
}

impl Registry {
    fn register(&self) -> (TaskId, CancelToken) {
        let id = TaskId(self.next.fetch_add(1, Ordering::SeqCst));
        let token = CancelToken::new();
        self.active
            .lock()
            .expect("Poisoned lock")
            .insert(id, token.clone());
        (id, token)
    }

    fn finish(&self, id: TaskId) {
        self.active.lock().expect("Poisoned lock").remove(&id);
    }

    fn cancel(&self, id: TaskId) -> bool {
        match self.active.lock().expect("Poisoned lock").get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Runs every job synchronously inside `submit`.
#[derive(Default)]
pub struct InlineQueue {
    registry: Registry,
}

impl InlineQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for InlineQueue {
    fn submit(&self, run: u64, job: Job) -> TaskHandle {
        let (id, token) = self.registry.register();
        let (tx, done) = channel();
        job(id, token.clone());
        self.registry.finish(id);
        let _ = tx.send(());
        TaskHandle {
            id,
            run,
            token,
            done,
        }
    }

    fn cancel(&self, task: TaskId) -> bool {
        self.registry.cancel(task)
    }
}

/// Runs jobs on a rayon thread pool, fire-and-forget.
pub struct ThreadPoolQueue {
    pool: ThreadPool,
    registry: Arc<Registry>,
}

impl ThreadPoolQueue {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("pmx-worker-{}", i))
            .build()
            .context("Could not start thread pool")?;
        Ok(Self {
            pool,
            registry: Arc::new(Registry::default()),
        })
    }
}

impl TaskQueue for ThreadPoolQueue {
    fn submit(&self, run: u64, job: Job) -> TaskHandle {
        let (id, token) = self.registry.register();
        let (tx, done) = channel();
        let registry = self.registry.clone();
        let job_token = token.clone();
        self.pool.spawn(move || {
            job(id, job_token);
            registry.finish(id);
            let _ = tx.send(());
        });
        TaskHandle {
            id,
            run,
            token,
            done,
        }
    }

    fn cancel(&self, task: TaskId) -> bool {
        self.registry.cancel(task)
    }
}

/// Submit a run to `queue`. The task id is recorded on the run while it
/// executes; failures are recorded on the run and logged.
pub fn spawn_run(queue: &dyn TaskQueue, mut inference: Inference) -> TaskHandle {
    let run = inference.id();
    queue.submit(
        run,
        Box::new(move |task, token| match inference.run_task(task, &token) {
            Ok(state) => info!("Task {} finished run {} in state {:?}", task.0, run, state),
            Err(err) => error!("Task {} failed run {}: {:#}", task.0, run, err),
        }),
    )
}
