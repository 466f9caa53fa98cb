//! In-memory content-addressed archiver.
//!
//! Objects are bincode-encoded and stored under the blake3 digest of their
//! encoding, so pushing identical content twice yields the same handle and
//! writes nothing new. The scheduled interface runs a small pool of worker
//! threads over the shared task queue.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bincode::Options;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{Error, Result};
use crate::exec::{CompletionQueue, ErrorMap, ProgressTracker, Scheduler, TaskQueue};
use crate::serial::{Archiver, BatchArchiver, Meta, PullTask, PushTask, ScheduledArchiver};

type Store = Arc<Mutex<HashMap<Meta, Vec<u8>>>>;

pub struct MemoryArchiver<T> {
    store: Store,
    serializer: bincode::DefaultOptions,
    workers: usize,
    rejected: Arc<Mutex<HashSet<Meta>>>,
    tracker: Option<Arc<dyn ProgressTracker>>,
    phantom: PhantomData<fn(T) -> T>,
}

impl<T> MemoryArchiver<T> {
    pub fn new() -> MemoryArchiver<T> {
        MemoryArchiver {
            store: Arc::new(Mutex::new(HashMap::new())),
            serializer: bincode::DefaultOptions::new(),
            workers: 4,
            rejected: Arc::new(Mutex::new(HashSet::new())),
            tracker: None,
            phantom: PhantomData,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> MemoryArchiver<T> {
        self.workers = workers.max(1);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ProgressTracker>) -> MemoryArchiver<T> {
        self.tracker = Some(tracker);
        self
    }

    /// Number of distinct objects currently stored.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Make every future pull of `meta` fail with a task abort. Lets
    /// callers rehearse partial-failure paths against a real scheduler.
    pub fn reject_pulls(&self, meta: Meta) {
        self.rejected.lock().insert(meta);
    }

    /// Lift a [`MemoryArchiver::reject_pulls`] fault again.
    pub fn permit_pulls(&self, meta: &Meta) {
        self.rejected.lock().remove(meta);
    }
}

impl<T> Default for MemoryArchiver<T> {
    fn default() -> Self {
        MemoryArchiver::new()
    }
}

fn fetch<T: DeserializeOwned>(
    store: &Store,
    rejected: &Mutex<HashSet<Meta>>,
    task: &mut PullTask<T>,
) -> Result<()> {
    if rejected.lock().contains(&task.meta) {
        return Err(Error::abort_msg(format!("pull rejected: {:?}", task.meta)));
    }
    let bytes = store
        .lock()
        .get(&task.meta)
        .cloned()
        .ok_or_else(|| Error::abort_msg(format!("no object stored under {:?}", task.meta)))?;
    let data: T = bincode::DefaultOptions::new().deserialize(&bytes)?;
    task.data = Some(data);
    Ok(())
}

impl<T> Archiver<T> for MemoryArchiver<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn pull(&self, task: &mut PullTask<T>) -> Result<()> {
        fetch(&self.store, &self.rejected, task)
    }

    fn push(&self, task: &mut PushTask<T>) -> Result<()> {
        let bytes = self.serializer.serialize(&task.data)?;
        let meta = Meta(blake3::hash(&bytes).as_bytes().to_vec());
        // Identical content is already stored under the same digest, so a
        // repeated push only hands back the existing handle.
        self.store.lock().entry(meta.clone()).or_insert(bytes);
        task.meta = Some(meta);
        Ok(())
    }
}

impl<T> BatchArchiver<T> for MemoryArchiver<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn tracker(&self) -> Option<Arc<dyn ProgressTracker>> {
        self.tracker.clone()
    }
}

impl<T> ScheduledArchiver<T> for MemoryArchiver<T>
where
    T: Serialize + DeserializeOwned + Ord + Send + 'static,
{
    fn pull_schedule(
        &self,
        tasks: Arc<TaskQueue<PullTask<T>>>,
        completed: Arc<CompletionQueue<PullTask<T>>>,
        errors: Arc<ErrorMap<PullTask<T>>>,
    ) -> Box<dyn Scheduler> {
        let served: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let tasks = tasks.clone();
            let completed = completed.clone();
            let errors = errors.clone();
            let served = served.clone();
            let store = self.store.clone();
            let rejected = self.rejected.clone();
            handles.push(std::thread::spawn(move || loop {
                let mut task = match tasks.poll(Duration::from_millis(50)) {
                    Some(task) => task,
                    None => {
                        if tasks.is_closed() {
                            return;
                        }
                        continue;
                    }
                };
                let duplicate = !served.lock().insert(task.tag);
                if duplicate {
                    trace!(worker, tag = task.tag, "duplicate pull eliminated");
                    errors.put(task, Error::TaskComplete);
                } else {
                    match fetch(&store, &rejected, &mut task) {
                        Ok(()) => completed.put(task),
                        Err(e) => errors.put(task, e),
                    }
                }
                // The deposit above must be visible before the in-flight
                // count drops, or the driver could observe a quiet pool
                // with work still missing.
                tasks.task_done();
            }));
        }
        Box::new(PoolScheduler {
            tasks,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }
}

struct PoolScheduler<T> {
    tasks: Arc<TaskQueue<PullTask<T>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<T: Send + 'static> Scheduler for PoolScheduler<T> {
    fn is_active(&self) -> bool {
        self.tasks.in_flight() > 0
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.close();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
