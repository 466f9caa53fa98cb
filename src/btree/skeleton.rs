//! The skeletal overlay: swapping subtrees between live and ghost form.
//!
//! `deflate` pushes bare subtrees through the archiver and replaces them
//! with ghosts; `inflate` pulls them back. Whole-tree inflation runs either
//! as a plain recursive descent or, when the archiver is scheduled, as a
//! single-threaded driver feeding a worker pool: a priority queue of live
//! nodes pending expansion, a bounded pull queue, a priority queue of
//! completed pulls, and an error map. Workers only fetch; every tree
//! mutation happens on the driver.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::exec::{CompletionQueue, ErrorMap, ProgressTracker, Scheduler, TaskQueue};
use crate::serial::{ArchiverKind, Meta, PullTask, PushTask, ScheduledArchiver};
use crate::translate::{NodeRepr, NodeTranslator, Translator, TreeRepr, TreeTranslator};

use super::node::{bounds_eq, Child, GhostNode, Node, NodeId};
use super::{Descent, SkeletonBtreeMap};

/// Capacity of the pull handoff queue; a full queue blocks the driver as
/// deliberate backpressure on the scheduler.
const PULL_QUEUE_CAPACITY: usize = 16;

/// How long the driver waits on the completion queue before re-inspecting
/// the scheduler state and the error map.
const COMPLETION_POLL: Duration = Duration::from_secs(1);

impl<K, V> SkeletonBtreeMap<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    /// Attach the archiver used to push and pull nodes.
    ///
    /// Replacing an existing archiver is only permitted while the tree is
    /// fully live; a partially loaded tree still owes pulls to the old one.
    pub fn set_archiver(&mut self, archiver: ArchiverKind<NodeRepr<K, V>>) -> Result<()> {
        if self.archiver.is_some() && !self.is_live() {
            return Err(Error::IllegalState(
                "cannot change the archiver while the tree is not live".into(),
            ));
        }
        self.archiver = Some(archiver);
        Ok(())
    }

    fn require_archiver(&self) -> Result<ArchiverKind<NodeRepr<K, V>>> {
        self.archiver
            .clone()
            .ok_or_else(|| Error::IllegalState("no archiver set".into()))
    }

    /// True when every node is materialized and every entries map loaded.
    pub fn is_live(&self) -> bool {
        self.node_is_live(self.root)
    }

    /// True when the root is bare: its entries deflated and all its
    /// children ghosts.
    pub fn is_bare(&self) -> bool {
        self.node_is_bare(self.root)
    }

    pub(crate) fn node_is_live(&self, id: NodeId) -> bool {
        let node = &self.arena[id];
        if node.ghosts > 0 || node.entries.is_bare() {
            return false;
        }
        node.children
            .iter()
            .filter_map(Child::live_id)
            .all(|child| self.node_is_live(child))
    }

    pub(crate) fn node_is_bare(&self, id: NodeId) -> bool {
        let node = &self.arena[id];
        node.entries.is_bare() && (node.leaf || node.ghosts == node.child_count())
    }

    // ------------------------------------------------------------------
    // child slot state machine
    // ------------------------------------------------------------------

    /// Replace the live child at `idx` with a ghost, handing the subtree's
    /// memory back. The child must already be pushed; `meta` names it.
    fn attach_ghost(&mut self, parent: NodeId, idx: usize, meta: Meta) {
        let child_id = self.arena[parent].children[idx]
            .live_id()
            .expect("attach_ghost expects a live child slot");
        let child = &self.arena[child_id];
        let ghost = GhostNode {
            lkey: child.lkey.clone(),
            rkey: child.rkey.clone(),
            size: child.size,
            parent,
            meta,
        };
        self.arena.free_subtree(child_id);
        let parent_node = &mut self.arena[parent];
        parent_node.children[idx] = Child::Ghost(ghost);
        parent_node.ghosts += 1;
    }

    /// Replace the ghost at `idx` with a pulled node, which must already be
    /// verified against the ghost's boundaries.
    fn attach_skeleton(&mut self, parent: NodeId, idx: usize, node: Node<K, V>) -> NodeId {
        let child_id = self.arena.alloc(node);
        self.reparent_ghosts(child_id);
        let parent_node = &mut self.arena[parent];
        debug_assert!(parent_node.children[idx].is_ghost());
        parent_node.children[idx] = Child::Live(child_id);
        parent_node.ghosts -= 1;
        child_id
    }

    /// Verify a pulled repr against its ghost and rebuild the node.
    fn check_pulled(
        &self,
        task: PullTask<NodeRepr<K, V>>,
        lkey: Option<&K>,
        rkey: Option<&K>,
        size: usize,
        range: &str,
    ) -> Result<Node<K, V>> {
        let repr = task
            .data
            .ok_or_else(|| Error::abort_msg(format!("pull of {} returned no data", range)))?;
        if !bounds_eq(repr.lkey.as_ref(), lkey) || !bounds_eq(repr.rkey.as_ref(), rkey) {
            return Err(Error::abort(
                format!("could not inflate node {}", range),
                Error::DataFormat("pulled node lkey/rkey does not match its ghost".into()),
            ));
        }
        let node = NodeTranslator::new(self.node_min)
            .rev(repr)
            .map_err(|e| Error::abort(format!("could not inflate node {}", range), e))?;
        if node.size != size {
            return Err(Error::abort(
                format!("could not inflate node {}", range),
                Error::DataFormat(format!(
                    "pulled node holds {} entries, its ghost recorded {}",
                    node.size, size
                )),
            ));
        }
        Ok(node)
    }

    // ------------------------------------------------------------------
    // targeted deflate / inflate
    // ------------------------------------------------------------------

    /// Deflate the root's child immediately to the right of `key`.
    ///
    /// A leaf root or an already ghosted child is a no-op; a child that is
    /// not bare is an [`Error::IllegalState`].
    pub fn deflate_key(&mut self, key: &K) -> Result<()> {
        let root = self.root;
        self.deflate_child(root, Some(key))
    }

    /// Make `key` reachable, pulling every missing node on its path.
    ///
    /// This is a retry loop over the descent: each not-loaded report
    /// inflates the offending range and the descent restarts, so lookups
    /// cost at most one pull per tree level.
    pub fn inflate_key(&mut self, key: &K) -> Result<()> {
        loop {
            match self.locate(key) {
                Descent::Value { .. } | Descent::Missing => return Ok(()),
                Descent::Bare { node, .. } => {
                    self.arena[node].entries.inflate();
                }
                Descent::Ghost { parent, lkey, .. } => {
                    self.inflate_child(parent, lkey.as_ref(), false)?;
                }
            }
        }
    }

    /// Deflate the child of `id` immediately right of `key` after pushing
    /// it through the archiver.
    pub(crate) fn deflate_child(&mut self, id: NodeId, key: Option<&K>) -> Result<()> {
        if self.arena[id].leaf {
            return Ok(());
        }
        let idx = self.arena[id].child_index_right_of(key);
        let child_id = match &self.arena[id].children[idx] {
            Child::Ghost(_) => return Ok(()),
            Child::Live(child) => *child,
        };
        if !self.node_is_bare(child_id) {
            return Err(Error::IllegalState(format!(
                "cannot deflate non-bare node {}",
                self.arena[child_id].range()
            )));
        }
        let range = self.arena[child_id].range();
        let arch = self.require_archiver()?;
        let repr = NodeTranslator::new(self.node_min).app(&self.arena[child_id])?;
        let mut task = PushTask::new(repr);
        trace!(range = %range, "pushing node");
        match arch.push(&mut task) {
            Ok(()) => {}
            Err(e) if e.is_task_complete() => {
                // The push was covered by concurrent work; the slot must
                // already be a ghost then.
                return match &self.arena[id].children[idx] {
                    Child::Ghost(_) => Ok(()),
                    Child::Live(_) => Err(Error::abort_msg(format!(
                        "push of {} reported complete but the node is still live",
                        range
                    ))),
                };
            }
            Err(e) => return Err(Error::abort(format!("could not deflate node {}", range), e)),
        }
        match task.meta {
            Some(meta) => {
                self.attach_ghost(id, idx, meta);
                Ok(())
            }
            None => Err(Error::abort_msg(format!(
                "push of {} returned no meta",
                range
            ))),
        }
    }

    /// Inflate the child of `id` immediately right of `key`; with `auto`
    /// the newly attached subtree is inflated recursively as well.
    fn inflate_child(&mut self, id: NodeId, key: Option<&K>, auto: bool) -> Result<()> {
        if self.arena[id].leaf {
            return Ok(());
        }
        let idx = self.arena[id].child_index_right_of(key);
        let (meta, lkey, rkey, size, range) = match &self.arena[id].children[idx] {
            Child::Live(_) => return Ok(()),
            Child::Ghost(g) => (
                g.meta.clone(),
                g.lkey.clone(),
                g.rkey.clone(),
                g.size,
                g.range(),
            ),
        };
        let arch = self.require_archiver()?;
        let mut task = PullTask::new(meta, 0);
        trace!(range = %range, "pulling node");
        match arch.pull(&mut task) {
            Ok(()) => {}
            Err(e) if e.is_task_complete() => {
                return match &self.arena[id].children[idx] {
                    Child::Live(_) => Ok(()),
                    Child::Ghost(_) => Err(Error::abort_msg(format!(
                        "pull of {} reported complete but the node is still a ghost",
                        range
                    ))),
                };
            }
            Err(e) => return Err(Error::abort(format!("could not inflate node {}", range), e)),
        }
        let node = self.check_pulled(task, lkey.as_ref(), rkey.as_ref(), size, &range)?;
        let child_id = self.attach_skeleton(id, idx, node);
        if auto {
            self.inflate_node(child_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // whole-tree deflate / inflate
    // ------------------------------------------------------------------

    /// Deflate the whole tree depth-first until the root is bare.
    ///
    /// All live children of a node are pushed as one batch; a failed push
    /// aborts with its range, leaving the tree partially deflated but
    /// consistent. Deflating an already bare tree pushes nothing.
    pub fn deflate(&mut self) -> Result<()> {
        let root = self.root;
        self.deflate_node(root)
    }

    fn deflate_node(&mut self, id: NodeId) -> Result<()> {
        let arch = self.require_archiver()?;
        if !self.arena[id].leaf {
            let live: Vec<(usize, NodeId)> = self.arena[id]
                .children
                .iter()
                .enumerate()
                .filter_map(|(idx, c)| c.live_id().map(|child| (idx, child)))
                .collect();
            for (_, child_id) in &live {
                if !self.node_is_bare(*child_id) {
                    self.deflate_node(*child_id)?;
                }
            }
            let translator = NodeTranslator::new(self.node_min);
            let mut tasks = Vec::with_capacity(live.len());
            for (_, child_id) in &live {
                tasks.push(PushTask::new(translator.app(&self.arena[*child_id])?));
            }
            if !tasks.is_empty() {
                debug!(range = %self.arena[id].range(), count = tasks.len(), "pushing deflated children");
                arch.push_batch(&mut tasks)?;
            }
            for ((idx, child_id), task) in live.into_iter().zip(tasks) {
                let child_range = self.arena[child_id].range();
                if let Some(err) = task.err {
                    if err.is_task_complete() {
                        if self.arena[id].children[idx].is_ghost() {
                            continue;
                        }
                        return Err(Error::abort_msg(format!(
                            "push of {} reported complete but the node is still live",
                            child_range
                        )));
                    }
                    return Err(Error::abort(
                        format!("could not deflate node {}", child_range),
                        err,
                    ));
                }
                match task.meta {
                    Some(meta) => self.attach_ghost(id, idx, meta),
                    None => {
                        return Err(Error::abort_msg(format!(
                            "push of {} returned no meta",
                            child_range
                        )))
                    }
                }
            }
        }
        self.arena[id].entries.deflate();
        debug_assert!(self.node_is_bare(id));
        Ok(())
    }

    /// Inflate the whole tree.
    ///
    /// With a scheduled archiver the pulls run in parallel through its
    /// worker pool; otherwise the tree is walked recursively. Both paths
    /// leave the tree in the same state.
    pub fn inflate(&mut self) -> Result<()> {
        let arch = self.require_archiver()?;
        let result = match arch.scheduled() {
            None => {
                let root = self.root;
                self.inflate_node(root)
            }
            Some(sched) => {
                let sched = sched.clone();
                let tracker = arch.tracker();
                self.scheduled_inflate(sched, tracker)
            }
        };
        if result.is_ok() {
            debug_assert!(self.is_live());
        }
        result
    }

    fn inflate_node(&mut self, id: NodeId) -> Result<()> {
        self.arena[id].entries.inflate();
        if self.arena[id].leaf {
            return Ok(());
        }
        for idx in 0..self.arena[id].child_count() {
            let step = match &self.arena[id].children[idx] {
                Child::Live(child) => {
                    if self.node_is_live(*child) {
                        continue;
                    }
                    Step::Recurse(*child)
                }
                Child::Ghost(g) => Step::Pull(g.lkey.clone()),
            };
            match step {
                Step::Recurse(child) => self.inflate_node(child)?,
                Step::Pull(lkey) => self.inflate_child(id, lkey.as_ref(), true)?,
            }
        }
        debug_assert!(self.node_is_live(id));
        Ok(())
    }

    fn scheduled_inflate(
        &mut self,
        arch: Arc<dyn ScheduledArchiver<NodeRepr<K, V>>>,
        tracker: Option<Arc<dyn ProgressTracker>>,
    ) -> Result<()> {
        let tasks = Arc::new(TaskQueue::bounded(PULL_QUEUE_CAPACITY));
        let completed = Arc::new(CompletionQueue::new());
        let errors = Arc::new(ErrorMap::new());
        let pool = arch.pull_schedule(tasks.clone(), completed.clone(), errors.clone());
        debug!(size = self.len(), "bulk inflate started");
        let result = {
            let mut driver = BulkInflate {
                map: self,
                tasks,
                completed,
                errors,
                tracker,
                nodequeue: BinaryHeap::new(),
                pending: HashMap::new(),
                attached: HashMap::new(),
                slot_tags: BTreeMap::new(),
                next_tag: 0,
            };
            driver.run(pool.as_ref())
        };
        // The pool is released on every exit path.
        pool.close();
        result
    }

    // ------------------------------------------------------------------
    // wire form
    // ------------------------------------------------------------------

    /// Serialize the tree shell; the root must be bare (deflate first).
    pub fn to_repr(&self) -> Result<TreeRepr<K, V>> {
        TreeTranslator.app(self)
    }

    /// Rebuild a tree from its shell. The result is bare; attach an
    /// archiver before inflating.
    pub fn from_repr(repr: TreeRepr<K, V>) -> Result<SkeletonBtreeMap<K, V>> {
        TreeTranslator.rev(repr)
    }
}

enum Step<K> {
    Recurse(NodeId),
    Pull(Option<K>),
}

/// Nodes pending expansion, ordered by their left boundary so the driver
/// expands the tree in order even though fetches complete out of order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct QueuedNode<K> {
    lkey: Option<K>,
    id: usize,
}

struct PendingPull<K> {
    parent: NodeId,
    lkey: Option<K>,
    rkey: Option<K>,
    size: usize,
    range: String,
}

struct BulkInflate<'a, K, V>
where
    K: Ord + Clone + Debug,
{
    map: &'a mut SkeletonBtreeMap<K, V>,
    tasks: Arc<TaskQueue<PullTask<NodeRepr<K, V>>>>,
    completed: Arc<CompletionQueue<PullTask<NodeRepr<K, V>>>>,
    errors: Arc<ErrorMap<PullTask<NodeRepr<K, V>>>>,
    tracker: Option<Arc<dyn ProgressTracker>>,
    nodequeue: BinaryHeap<Reverse<QueuedNode<K>>>,
    /// Submitted pulls not yet attached, by tag.
    pending: HashMap<u64, PendingPull<K>>,
    /// Tags whose node has been attached, with the node it became.
    attached: HashMap<u64, NodeId>,
    /// The tag in flight per child slot, keyed by (parent, lkey); used to
    /// avoid resubmitting a slot that is already being pulled.
    slot_tags: BTreeMap<(usize, Option<K>), u64>,
    next_tag: u64,
}

impl<'a, K, V> BulkInflate<'a, K, V>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    fn run(&mut self, pool: &dyn Scheduler) -> Result<()> {
        let root = self.map.root;
        self.enqueue_node(root);
        loop {
            self.drain_errors()?;
            self.drain_completed()?;
            self.expand_nodes()?;
            if !pool.is_active()
                && self.tasks.is_empty()
                && self.completed.is_empty()
                && self.errors.is_empty()
            {
                break;
            }
        }
        debug!(
            pulls = self.next_tag,
            nodes = self.map.arena.live_nodes(),
            "bulk inflate finished"
        );
        Ok(())
    }

    fn enqueue_node(&mut self, id: NodeId) {
        let lkey = self.map.arena[id].lkey.clone();
        self.nodequeue.push(Reverse(QueuedNode { lkey, id: id.0 }));
    }

    /// Handle failed tasks. `TaskComplete` means a duplicate pull was
    /// eliminated: if its twin already attached the node, revisit that
    /// node; if not, the completion is still queued, so defer to the next
    /// iteration. Anything else aborts the inflate.
    fn drain_errors(&mut self) -> Result<()> {
        for (task, cause) in self.errors.drain() {
            if !cause.is_task_complete() {
                let range = self
                    .pending
                    .get(&task.tag)
                    .map(|p| p.range.clone())
                    .unwrap_or_else(|| "<unknown range>".to_string());
                return Err(Error::abort(
                    format!("could not inflate node {}", range),
                    cause,
                ));
            }
            if let Some(child) = self.attached.get(&task.tag) {
                let child = *child;
                self.enqueue_node(child);
            } else if self.pending.contains_key(&task.tag) {
                trace!(tag = task.tag, "task complete before its twin attached, deferring");
                self.errors.put(task, Error::TaskComplete);
            } else {
                trace!(tag = task.tag, "task complete for an unknown tag, ignoring");
            }
        }
        Ok(())
    }

    /// Attach completed pulls. Blocks briefly only when there is nothing
    /// else to do, so scheduler state is re-inspected at least once per
    /// second while fetches are outstanding.
    fn drain_completed(&mut self) -> Result<()> {
        loop {
            let task = if self.nodequeue.is_empty() {
                self.completed.poll(COMPLETION_POLL)
            } else {
                self.completed.try_poll()
            };
            match task {
                None => return Ok(()),
                Some(task) => self.attach_completed(task)?,
            }
        }
    }

    fn attach_completed(&mut self, task: PullTask<NodeRepr<K, V>>) -> Result<()> {
        let tag = task.tag;
        let ctx = self
            .pending
            .remove(&tag)
            .ok_or_else(|| Error::abort_msg("completed pull carries an unknown tag"))?;
        self.slot_tags.remove(&(ctx.parent.0, ctx.lkey.clone()));
        let node = self
            .map
            .check_pulled(task, ctx.lkey.as_ref(), ctx.rkey.as_ref(), ctx.size, &ctx.range)?;
        let idx = self.map.arena[ctx.parent].child_index_right_of(ctx.lkey.as_ref());
        debug_assert!(self.map.arena[ctx.parent].children[idx].is_ghost());
        let child_id = self.map.attach_skeleton(ctx.parent, idx, node);
        if let Some(tracker) = &self.tracker {
            tracker.pull_done(&ctx.range);
        }
        trace!(range = %ctx.range, "attached pulled node");
        self.attached.insert(tag, child_id);
        self.enqueue_node(child_id);
        Ok(())
    }

    /// Expand queued nodes: inflate their entries and either revisit
    /// not-fully-live children or submit pulls for ghosts.
    fn expand_nodes(&mut self) -> Result<()> {
        while let Some(Reverse(queued)) = self.nodequeue.pop() {
            let id = NodeId(queued.id);
            self.map.arena[id].entries.inflate();
            if self.map.arena[id].leaf {
                continue;
            }
            for idx in 0..self.map.arena[id].child_count() {
                let work = match &self.map.arena[id].children[idx] {
                    Child::Live(child) => {
                        if self.map.node_is_live(*child) {
                            None
                        } else {
                            Some(ChildWork::Revisit(*child))
                        }
                    }
                    Child::Ghost(g) => Some(ChildWork::Pull {
                        meta: g.meta.clone(),
                        lkey: g.lkey.clone(),
                        rkey: g.rkey.clone(),
                        size: g.size,
                        range: g.range(),
                    }),
                };
                match work {
                    None => {}
                    Some(ChildWork::Revisit(child)) => self.enqueue_node(child),
                    Some(ChildWork::Pull {
                        meta,
                        lkey,
                        rkey,
                        size,
                        range,
                    }) => self.submit_pull(id, meta, lkey, rkey, size, range)?,
                }
            }
        }
        Ok(())
    }

    fn submit_pull(
        &mut self,
        parent: NodeId,
        meta: Meta,
        lkey: Option<K>,
        rkey: Option<K>,
        size: usize,
        range: String,
    ) -> Result<()> {
        let slot = (parent.0, lkey.clone());
        if self.slot_tags.contains_key(&slot) {
            trace!(range = %range, "pull already in flight for this slot");
            return Ok(());
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        self.slot_tags.insert(slot, tag);
        if let Some(tracker) = &self.tracker {
            tracker.pull_queued(&range);
        }
        trace!(range = %range, tag, "submitting pull");
        self.pending.insert(
            tag,
            PendingPull {
                parent,
                lkey,
                rkey,
                size,
                range,
            },
        );
        self.tasks.put(PullTask::new(meta, tag))
    }
}

enum ChildWork<K> {
    Revisit(NodeId),
    Pull {
        meta: Meta,
        lkey: Option<K>,
        rkey: Option<K>,
        size: usize,
        range: String,
    },
}
