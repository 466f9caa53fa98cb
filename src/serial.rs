//! Archiver contracts: how serialized objects leave and re-enter the tree.
//!
//! An [`Archiver`] persists objects under opaque [`Meta`] handles and
//! retrieves them again. [`BatchArchiver`] adds batched variants with
//! per-task failure attachment, and [`ScheduledArchiver`] adds a worker
//! pool that drains a task queue asynchronously. The tree stores whichever
//! capability level it was given as an [`ArchiverKind`] and picks the bulk
//! inflate strategy accordingly.

use std::fmt;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exec::{CompletionQueue, ErrorMap, ProgressTracker, Scheduler, TaskQueue};

pub mod memory;

/// Opaque storage handle naming one archived object.
///
/// The archiver owns the interpretation; a content-addressed store will use
/// a digest of the object's encoding, a file store might use a path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Meta(pub Vec<u8>);

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Meta(")?;
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// A request to retrieve the object stored under `meta`.
///
/// `tag` is a correlation id assigned by the submitter and carried through
/// unchanged; schedulers identify a unit of work by it and must convert a
/// duplicate submission of an already-served tag into a
/// [`Error::TaskComplete`] deposit instead of fetching twice.
#[derive(Debug)]
pub struct PullTask<T> {
    pub meta: Meta,
    pub tag: u64,
    pub data: Option<T>,
    pub err: Option<Error>,
}

impl<T> PullTask<T> {
    pub fn new(meta: Meta, tag: u64) -> PullTask<T> {
        PullTask {
            meta,
            tag,
            data: None,
            err: None,
        }
    }
}

// Completed pulls are drained in the natural order of the fetched objects,
// so tasks order by their payload; unfetched tasks sort first.
impl<T: Ord> Ord for PullTask<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.data.cmp(&other.data)
    }
}

impl<T: Ord> PartialOrd for PullTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> PartialEq for PullTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T: Ord> Eq for PullTask<T> {}

/// A request to persist `data`.
///
/// The archiver may honor a pre-assigned `meta` or invent one, writing it
/// back into the task either way.
#[derive(Debug)]
pub struct PushTask<T> {
    pub data: T,
    pub meta: Option<Meta>,
    pub err: Option<Error>,
}

impl<T> PushTask<T> {
    pub fn new(data: T) -> PushTask<T> {
        PushTask {
            data,
            meta: None,
            err: None,
        }
    }
}

/// Minimal persist/retrieve capability.
pub trait Archiver<T>: Send + Sync {
    /// Retrieve the object named by `task.meta` into `task.data`.
    fn pull(&self, task: &mut PullTask<T>) -> Result<()>;

    /// Persist `task.data`, writing the resulting handle into `task.meta`.
    fn push(&self, task: &mut PushTask<T>) -> Result<()>;
}

/// Batched pull/push with at-least-once semantics per task.
///
/// A failing task gets its error attached to `task.err`; the batch call
/// itself only fails for faults that prevent processing the batch at all.
pub trait BatchArchiver<T>: Archiver<T> {
    fn pull_batch(&self, tasks: &mut [PullTask<T>]) -> Result<()> {
        for task in tasks {
            if let Err(e) = self.pull(task) {
                task.err = Some(e);
            }
        }
        Ok(())
    }

    fn push_batch(&self, tasks: &mut [PushTask<T>]) -> Result<()> {
        for task in tasks {
            if let Err(e) = self.push(task) {
                task.err = Some(e);
            }
        }
        Ok(())
    }

    /// Progress reporting hook; archivers without one return `None`.
    fn tracker(&self) -> Option<Arc<dyn ProgressTracker>> {
        None
    }
}

/// Archiver that can fetch asynchronously through a worker pool.
pub trait ScheduledArchiver<T>: BatchArchiver<T> {
    /// Start a scheduler that drains `tasks`, depositing each completed
    /// task into `completed` and each failed task into `errors` (never
    /// both). Duplicate tags must surface as [`Error::TaskComplete`] in
    /// `errors`.
    fn pull_schedule(
        &self,
        tasks: Arc<TaskQueue<PullTask<T>>>,
        completed: Arc<CompletionQueue<PullTask<T>>>,
        errors: Arc<ErrorMap<PullTask<T>>>,
    ) -> Box<dyn Scheduler>;
}

/// The capability level a tree was handed.
///
/// Whole-tree `inflate` walks recursively for `Batch` archivers and runs
/// the parallel driver for `Scheduled` ones.
#[derive(Clone)]
pub enum ArchiverKind<T> {
    Batch(Arc<dyn BatchArchiver<T>>),
    Scheduled(Arc<dyn ScheduledArchiver<T>>),
}

impl<T> ArchiverKind<T> {
    pub fn pull(&self, task: &mut PullTask<T>) -> Result<()> {
        match self {
            ArchiverKind::Batch(a) => a.pull(task),
            ArchiverKind::Scheduled(a) => a.pull(task),
        }
    }

    pub fn push(&self, task: &mut PushTask<T>) -> Result<()> {
        match self {
            ArchiverKind::Batch(a) => a.push(task),
            ArchiverKind::Scheduled(a) => a.push(task),
        }
    }

    pub fn pull_batch(&self, tasks: &mut [PullTask<T>]) -> Result<()> {
        match self {
            ArchiverKind::Batch(a) => a.pull_batch(tasks),
            ArchiverKind::Scheduled(a) => a.pull_batch(tasks),
        }
    }

    pub fn push_batch(&self, tasks: &mut [PushTask<T>]) -> Result<()> {
        match self {
            ArchiverKind::Batch(a) => a.push_batch(tasks),
            ArchiverKind::Scheduled(a) => a.push_batch(tasks),
        }
    }

    pub fn tracker(&self) -> Option<Arc<dyn ProgressTracker>> {
        match self {
            ArchiverKind::Batch(a) => a.tracker(),
            ArchiverKind::Scheduled(a) => a.tracker(),
        }
    }

    pub fn scheduled(&self) -> Option<&Arc<dyn ScheduledArchiver<T>>> {
        match self {
            ArchiverKind::Batch(_) => None,
            ArchiverKind::Scheduled(a) => Some(a),
        }
    }
}
