use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use debug_tree::TreeBuilder;
use fake::{Fake, StringFaker};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::Error;
use crate::exec::{CompletionQueue, ErrorMap, ProgressTracker, Scheduler, TaskQueue};
use crate::serial::memory::MemoryArchiver;
use crate::serial::{Archiver, ArchiverKind, BatchArchiver, PullTask, ScheduledArchiver};
use crate::translate::{NodeRepr, Translator, TreeTranslator};

use super::node::{above_lower, below_upper, bounds_eq, Child, NodeId};
use super::*;

fn print_tree<K, V>(t: &SkeletonBtreeMap<K, V>)
where
    K: Ord + Clone + Debug,
{
    let mut b = TreeBuilder::new();
    print_tree_node(&mut b, t, t.root);
    b.print();
}

fn print_tree_node<K, V>(builder: &mut TreeBuilder, t: &SkeletonBtreeMap<K, V>, id: NodeId)
where
    K: Ord + Clone + Debug,
{
    let node = &t.arena[id];
    let mut branch = builder.add_branch(&format!(
        "(node {} {} with {} entries and {} children)",
        id.0,
        node.range(),
        node.entries.len(),
        node.child_count()
    ));
    if node.leaf {
        for (k, _) in node.entries.iter() {
            builder.add_leaf(&format!("{:?}", k));
        }
    } else {
        for (i, child) in node.children.iter().enumerate() {
            match child {
                Child::Live(c) => print_tree_node(builder, t, *c),
                Child::Ghost(g) => {
                    builder.add_leaf(&format!("(ghost {} holding {} entries)", g.range(), g.size))
                }
            }
            if i < node.entries.len() {
                builder.add_leaf(&format!("{:?}", node.entries.key_at(i)));
            }
        }
    }
    branch.release();
}

/// Walk the whole live part of the tree and assert the structural
/// invariants: fan-out bounds, range contiguity, entry order, ghost
/// counters, and subtree sizes.
fn check_invariants<K, V>(t: &SkeletonBtreeMap<K, V>)
where
    K: Ord + Clone + Debug,
{
    let total = check_node(t, t.root, None, None, true);
    assert_eq!(total, t.len());
}

fn check_node<K, V>(
    t: &SkeletonBtreeMap<K, V>,
    id: NodeId,
    lkey: Option<&K>,
    rkey: Option<&K>,
    is_root: bool,
) -> usize
where
    K: Ord + Clone + Debug,
{
    let node = &t.arena[id];
    assert!(
        bounds_eq(node.lkey.as_ref(), lkey),
        "node {} has wrong lkey",
        node.range()
    );
    assert!(
        bounds_eq(node.rkey.as_ref(), rkey),
        "node {} has wrong rkey",
        node.range()
    );

    let n = node.entries.len();
    assert!(n <= 2 * t.node_min, "node {} is overfull", node.range());
    if !is_root {
        assert!(n >= t.node_min, "node {} is underfull", node.range());
    }
    let mut previous: Option<&K> = None;
    for (k, _) in node.entries.iter() {
        assert!(above_lower(k, node.lkey.as_ref()));
        assert!(below_upper(k, node.rkey.as_ref()));
        if let Some(p) = previous {
            assert_eq!(Ordering::Less, p.cmp(k));
        }
        previous = Some(k);
    }

    let mut total = n;
    if node.leaf {
        assert!(node.children.is_empty());
        assert_eq!(0, node.ghosts);
    } else {
        assert_eq!(n + 1, node.child_count(), "node {} arity", node.range());
        let pairs = node.key_pairs();
        let mut ghosts = 0;
        for (child, (l, r)) in node.children.iter().zip(pairs) {
            match child {
                Child::Live(c) => {
                    total += check_node(t, *c, l, r, false);
                }
                Child::Ghost(g) => {
                    ghosts += 1;
                    assert!(bounds_eq(g.lkey.as_ref(), l), "ghost {} lkey", g.range());
                    assert!(bounds_eq(g.rkey.as_ref(), r), "ghost {} rkey", g.range());
                    total += g.size;
                }
            }
        }
        assert_eq!(ghosts, node.ghosts, "node {} ghost counter", node.range());
    }
    assert_eq!(total, node.size, "node {} size", node.range());
    total
}

/// Iterate the whole tree, assert strict ordering, and return the count.
fn check_order<K, V>(t: &SkeletonBtreeMap<K, V>) -> usize
where
    K: Ord + Clone + Debug,
{
    let mut previous: Option<K> = None;
    let mut count = 0;
    for e in t.iter() {
        let (k, _v) = e.unwrap();
        if let Some(p) = &previous {
            assert_eq!(Ordering::Less, p.cmp(k));
        }
        previous = Some(k.clone());
        count += 1;
    }
    count
}

fn scheduled_archiver<K, V>() -> (
    Arc<MemoryArchiver<NodeRepr<K, V>>>,
    ArchiverKind<NodeRepr<K, V>>,
)
where
    K: Ord + Clone + Debug + serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    let archiver = Arc::new(MemoryArchiver::new());
    (archiver.clone(), ArchiverKind::Scheduled(archiver))
}

#[test]
fn insert_get_static_size() {
    let nr_entries = 2000u64;

    let mut t: SkeletonBtreeMap<u64, u64> = SkeletonBtreeMap::new(BtreeConfig::default()).unwrap();

    assert_eq!(true, t.is_empty());

    assert_eq!(None, t.insert(0, 42).unwrap());

    assert_eq!(false, t.is_empty());
    assert_eq!(1, t.len());

    for i in 1..nr_entries {
        assert_eq!(None, t.insert(i, i).unwrap());
    }

    assert_eq!(false, t.is_empty());
    assert_eq!(nr_entries as usize, t.len());

    assert_eq!(true, t.contains_key(&0).unwrap());
    assert_eq!(Some(&42), t.get(&0).unwrap());
    assert_eq!(Some(42), t.insert(0, 100).unwrap());
    assert_eq!(Some(100), t.insert(0, 42).unwrap());

    for i in 1..nr_entries {
        assert_eq!(true, t.contains_key(&i).unwrap());
        assert_eq!(Some(&i), t.get(&i).unwrap());
    }
    assert_eq!(false, t.contains_key(&nr_entries).unwrap());
    assert_eq!(None, t.get(&nr_entries).unwrap());
    assert_eq!(None, t.get(&5000).unwrap());

    check_invariants(&t);
}

#[test]
fn minimal_node_min() {
    // Too small fan-outs should create an error
    assert!(SkeletonBtreeMap::<u64, u64>::new(BtreeConfig::default().node_min(0)).is_err());
    assert!(SkeletonBtreeMap::<u64, u64>::new(BtreeConfig::default().node_min(1)).is_err());

    // Test with the minimal fan-out 2
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();

    for i in 0..2000u64 {
        t.insert(i, i).unwrap();
    }
    assert_eq!(2000, check_order(&t));
    check_invariants(&t);
}

#[test]
fn sorted_iterator() {
    let mut t: SkeletonBtreeMap<Vec<u8>, bool> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(4)).unwrap();

    for a in 0..=255u8 {
        t.insert(vec![1, a], true).unwrap();
    }
    for a in 0..=255u8 {
        t.insert(vec![0, a], true).unwrap();
    }
    assert_eq!(512, t.len());
    print_tree(&t);
    assert_eq!(512, check_order(&t));
    check_invariants(&t);
}

#[test]
fn parallel_get() {
    let nr_entries = 2000usize;

    let mut t: SkeletonBtreeMap<usize, usize> =
        SkeletonBtreeMap::new(BtreeConfig::default()).unwrap();

    for i in 0..nr_entries {
        t.insert(i, i).unwrap();
    }

    // Get all values in parallel
    let entries: Vec<Option<usize>> = (0..nr_entries)
        .into_par_iter()
        .map(|i| t.get(&i).unwrap().copied())
        .collect();
    for (i, e) in entries.iter().enumerate() {
        assert_eq!(Some(i), *e);
    }
}

#[test]
fn remove_rebalances_under_churn() {
    let seed = 1971428643569665;
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);

    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(4)).unwrap();

    let n = 10_000u64;
    for i in 0..n {
        t.insert(i, i * 3).unwrap();
    }
    check_invariants(&t);

    let mut keys: Vec<u64> = (0..n).collect();
    keys.shuffle(&mut rng);
    let (removed, kept) = keys.split_at(keys.len() / 2);

    for (step, key) in removed.iter().enumerate() {
        assert_eq!(Some(*key * 3), t.remove(key).unwrap());
        if step % 97 == 0 {
            check_invariants(&t);
        }
    }
    check_invariants(&t);

    assert_eq!(n as usize / 2, t.len());
    for key in removed {
        assert_eq!(None, t.get(key).unwrap());
        assert_eq!(None, t.remove(key).unwrap());
    }
    for key in kept {
        assert_eq!(Some(&(*key * 3)), t.get(key).unwrap());
    }
    assert_eq!(n as usize / 2, check_order(&t));
}

#[test]
fn remove_down_to_empty() {
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();

    for i in 0..500u64 {
        t.insert(i, i).unwrap();
    }
    // Removing in ascending order exercises the merge-heavy path.
    for i in 0..500u64 {
        assert_eq!(Some(i), t.remove(&i).unwrap());
        if i % 61 == 0 {
            check_invariants(&t);
        }
    }
    assert_eq!(0, t.len());
    assert!(t.is_empty());
    check_invariants(&t);

    // The collapsed tree is a plain leaf root again and stays usable.
    t.insert(7, 7).unwrap();
    assert_eq!(Some(&7), t.get(&7).unwrap());
}

#[test]
fn deflate_inflate_roundtrip() {
    let (_store, kind) = scheduled_archiver::<u64, u64>();
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();

    for i in 1..=100u64 {
        t.insert(i, i * 10).unwrap();
    }
    assert!(t.is_live());

    t.deflate().unwrap();
    assert!(t.is_bare());
    assert!(!t.is_live());
    assert_eq!(100, t.len());

    t.inflate().unwrap();
    assert!(t.is_live());

    let entries: Vec<(u64, u64)> = t.iter().map(|e| e.map(|(k, v)| (*k, *v)).unwrap()).collect();
    let expected: Vec<(u64, u64)> = (1..=100).map(|i| (i, i * 10)).collect();
    assert_eq!(expected, entries);
    check_invariants(&t);
}

#[test]
fn bare_tree_reports_not_loaded() {
    let (_store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();
    for i in 0..100u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    assert!(matches!(t.get(&50), Err(Error::NotLoaded { .. })));
    assert!(matches!(t.insert(50, 1), Err(Error::NotLoaded { .. })));
    assert!(matches!(t.remove(&50), Err(Error::NotLoaded { .. })));
    let first = t.iter().next().unwrap();
    assert!(matches!(first, Err(Error::NotLoaded { .. })));
    // Nothing was mutated by the failing writes.
    assert_eq!(100, t.len());
}

#[test]
fn deflate_is_idempotent() {
    let (store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();
    for i in 0..500u64 {
        t.insert(i, i).unwrap();
    }

    t.deflate().unwrap();
    assert!(t.is_bare());
    let stored = store.len();
    assert!(stored > 0);

    // A second deflate finds everything ghosted and pushes nothing.
    t.deflate().unwrap();
    assert!(t.is_bare());
    assert_eq!(stored, store.len());
}

#[test]
fn sequential_and_scheduled_inflate_agree() {
    let (store, _) = scheduled_archiver::<u64, u64>();
    let batch_kind: ArchiverKind<NodeRepr<u64, u64>> = ArchiverKind::Batch(store.clone());
    let scheduled_kind: ArchiverKind<NodeRepr<u64, u64>> = ArchiverKind::Scheduled(store.clone());

    let build = |kind: ArchiverKind<NodeRepr<u64, u64>>| {
        let mut t: SkeletonBtreeMap<u64, u64> =
            SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
        t.set_archiver(kind).unwrap();
        for i in 0..1000u64 {
            t.insert(i, i + 7).unwrap();
        }
        t.deflate().unwrap();
        t
    };

    // Identical content lands on identical handles, so both trees share
    // the same archived nodes.
    let mut sequential = build(batch_kind);
    let mut scheduled = build(scheduled_kind);

    sequential.inflate().unwrap();
    scheduled.inflate().unwrap();

    assert!(sequential.is_live());
    assert!(scheduled.is_live());
    let a: Vec<(u64, u64)> = sequential
        .iter()
        .map(|e| e.map(|(k, v)| (*k, *v)).unwrap())
        .collect();
    let b: Vec<(u64, u64)> = scheduled
        .iter()
        .map(|e| e.map(|(k, v)| (*k, *v)).unwrap())
        .collect();
    assert_eq!(a, b);
    check_invariants(&sequential);
    check_invariants(&scheduled);
}

/// Counts every pull going through, for verifying the targeted-inflate
/// cost bound.
struct CountingArchiver {
    inner: Arc<MemoryArchiver<NodeRepr<u64, u64>>>,
    pulls: AtomicUsize,
}

impl Archiver<NodeRepr<u64, u64>> for CountingArchiver {
    fn pull(&self, task: &mut PullTask<NodeRepr<u64, u64>>) -> crate::error::Result<()> {
        self.pulls.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.pull(task)
    }

    fn push(&self, task: &mut crate::serial::PushTask<NodeRepr<u64, u64>>) -> crate::error::Result<()> {
        self.inner.push(task)
    }
}

impl BatchArchiver<NodeRepr<u64, u64>> for CountingArchiver {}

#[test]
fn targeted_inflate_pulls_one_path() {
    let counting = Arc::new(CountingArchiver {
        inner: Arc::new(MemoryArchiver::new()),
        pulls: AtomicUsize::new(0),
    });
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(ArchiverKind::Batch(counting.clone())).unwrap();

    for i in 1..=100u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    assert!(matches!(t.get(&50), Err(Error::NotLoaded { .. })));
    t.inflate_key(&50).unwrap();
    assert_eq!(Some(&50), t.get(&50).unwrap());

    // One pull per level below the root at most: ceil(log_3(100)) = 5.
    let pulls = counting.pulls.load(AtomicOrdering::Relaxed);
    assert!(pulls <= 5, "targeted inflate used {} pulls", pulls);

    // Re-inflating the same key pulls nothing further.
    t.inflate_key(&50).unwrap();
    assert_eq!(pulls, counting.pulls.load(AtomicOrdering::Relaxed));
    check_invariants(&t);
}

#[test]
fn scheduled_inflate_reports_failed_pulls() {
    let (store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();
    for i in 1..=100u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    // Sabotage one mid-tree subtree and remember a key inside it.
    let (poisoned, probe) = {
        let root = &t.arena[t.root];
        let target = root
            .children
            .iter()
            .filter_map(Child::as_ghost)
            .nth(1)
            .expect("root has more than one child");
        let probe = target.lkey.clone().expect("inner child has a left boundary") + 1;
        assert!(above_lower(&probe, target.lkey.as_ref()));
        assert!(below_upper(&probe, target.rkey.as_ref()));
        (target.meta.clone(), probe)
    };
    store.reject_pulls(poisoned.clone());

    let err = t.inflate().unwrap_err();
    assert!(matches!(err, Error::TaskAbort { .. }));

    // The partially inflated tree is still consistent and still usable.
    check_invariants(&t);
    assert!(matches!(t.inflate_key(&probe), Err(Error::TaskAbort { .. })));

    // Clearing the fault lets the remaining subtrees load.
    store.permit_pulls(&poisoned);
    t.inflate().unwrap();
    assert!(t.is_live());
    assert_eq!(100, check_order(&t));
}

/// Scheduler wrapper that reports an eliminated twin for every pull it
/// serves, as a scheduled archiver would under duplicated submissions.
struct EchoCompleteArchiver {
    inner: Arc<MemoryArchiver<NodeRepr<u64, u64>>>,
}

impl Archiver<NodeRepr<u64, u64>> for EchoCompleteArchiver {
    fn pull(&self, task: &mut PullTask<NodeRepr<u64, u64>>) -> crate::error::Result<()> {
        self.inner.pull(task)
    }

    fn push(&self, task: &mut crate::serial::PushTask<NodeRepr<u64, u64>>) -> crate::error::Result<()> {
        self.inner.push(task)
    }
}

impl BatchArchiver<NodeRepr<u64, u64>> for EchoCompleteArchiver {}

struct EchoScheduler {
    tasks: Arc<TaskQueue<PullTask<NodeRepr<u64, u64>>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Scheduler for EchoScheduler {
    fn is_active(&self) -> bool {
        self.tasks.in_flight() > 0
    }

    fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        self.tasks.close();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ScheduledArchiver<NodeRepr<u64, u64>> for EchoCompleteArchiver {
    fn pull_schedule(
        &self,
        tasks: Arc<TaskQueue<PullTask<NodeRepr<u64, u64>>>>,
        completed: Arc<CompletionQueue<PullTask<NodeRepr<u64, u64>>>>,
        errors: Arc<ErrorMap<PullTask<NodeRepr<u64, u64>>>>,
    ) -> Box<dyn Scheduler> {
        let inner = self.inner.clone();
        let worker_tasks = tasks.clone();
        let handle = std::thread::spawn(move || loop {
            let mut task = match worker_tasks.poll(Duration::from_millis(20)) {
                Some(task) => task,
                None => {
                    if worker_tasks.is_closed() {
                        return;
                    }
                    continue;
                }
            };
            let twin = PullTask::new(task.meta.clone(), task.tag);
            match inner.pull(&mut task) {
                Ok(()) => {
                    completed.put(task);
                    errors.put(twin, Error::TaskComplete);
                }
                Err(e) => errors.put(task, e),
            }
            worker_tasks.task_done();
        });
        Box::new(EchoScheduler {
            tasks,
            handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }
}

#[test]
fn task_complete_notifications_are_benign() {
    let store = Arc::new(MemoryArchiver::new());
    let echo = Arc::new(EchoCompleteArchiver {
        inner: store.clone(),
    });
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(ArchiverKind::Scheduled(echo)).unwrap();

    for i in 0..300u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    // Every pull is shadowed by a task-complete notification; the inflate
    // must shrug all of them off and still converge.
    t.inflate().unwrap();
    assert!(t.is_live());
    assert_eq!(300, check_order(&t));
    check_invariants(&t);
}

struct CountingTracker {
    queued: AtomicUsize,
    done: AtomicUsize,
}

impl ProgressTracker for CountingTracker {
    fn pull_queued(&self, _subject: &str) {
        self.queued.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn pull_done(&self, _subject: &str) {
        self.done.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[test]
fn bulk_inflate_reports_progress() {
    let tracker = Arc::new(CountingTracker {
        queued: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });
    let archiver: Arc<MemoryArchiver<NodeRepr<u64, u64>>> =
        Arc::new(MemoryArchiver::new().with_workers(2).with_tracker(tracker.clone()));
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(ArchiverKind::Scheduled(archiver)).unwrap();

    for i in 0..500u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();
    t.inflate().unwrap();

    let queued = tracker.queued.load(AtomicOrdering::Relaxed);
    let done = tracker.done.load(AtomicOrdering::Relaxed);
    assert!(queued > 0);
    assert_eq!(queued, done);
}

#[test]
fn archiver_swap_requires_live_tree() {
    let (_store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();
    for i in 0..100u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    let (_other_store, other_kind) = scheduled_archiver::<u64, u64>();
    assert!(matches!(
        t.set_archiver(other_kind),
        Err(Error::IllegalState(_))
    ));

    t.inflate().unwrap();
    let (_third_store, third_kind) = scheduled_archiver::<u64, u64>();
    t.set_archiver(third_kind).unwrap();
}

#[test]
fn deflate_key_contract() {
    let (store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();

    // Leaf root: targeted deflate is a no-op.
    t.insert(1, 1).unwrap();
    t.deflate_key(&1).unwrap();
    assert!(t.is_live());

    for i in 2..=100u64 {
        t.insert(i, i).unwrap();
    }

    // A live, non-bare child is a contract violation.
    assert!(matches!(t.deflate_key(&1), Err(Error::IllegalState(_))));

    // A bare child gets pushed and swapped for a ghost.
    let before = store.len();
    let (first_child, child_lkey) = {
        let root = &t.arena[t.root];
        let child = root.children[0].live_id().unwrap();
        (child, t.arena[child].lkey.clone())
    };
    mark_subtree_bare(&mut t, first_child);
    assert!(child_lkey.is_none());
    t.deflate_key(&1).unwrap();
    assert!(t.arena[t.root].children[0].is_ghost());
    assert!(store.len() > before);
    check_invariants(&t);

    // Already a ghost: no-op.
    t.deflate_key(&1).unwrap();

    // The ghosted range loads back on demand.
    t.inflate_key(&1).unwrap();
    assert_eq!(Some(&1), t.get(&1).unwrap());
}

/// Force a live subtree into the bare state bottom-up: ghost all children
/// through the archiver, then deflate the local entries. The subtree root
/// itself stays attached and live.
fn mark_subtree_bare(t: &mut SkeletonBtreeMap<u64, u64>, id: NodeId) {
    let children: Vec<NodeId> = t.arena[id].children.iter().filter_map(Child::live_id).collect();
    for child in &children {
        mark_subtree_bare(t, *child);
    }
    let child_slots: Vec<Option<u64>> = {
        let node = &t.arena[id];
        node.key_pairs().iter().map(|(l, _)| l.copied()).collect()
    };
    for lkey in child_slots {
        t.deflate_child(id, lkey.as_ref()).unwrap();
    }
    t.arena[id].entries.deflate();
}

#[test]
fn tree_repr_roundtrip() {
    let (store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind.clone()).unwrap();
    for i in 0..1000u64 {
        t.insert(i, i * 2).unwrap();
    }

    // Translating a non-bare tree is a programming error.
    assert!(matches!(t.to_repr(), Err(Error::IllegalState(_))));

    t.deflate().unwrap();
    let repr = t.to_repr().unwrap();

    // The shell survives an encoding roundtrip.
    let bytes = bincode::serialize(&repr).unwrap();
    let repr: crate::translate::TreeRepr<u64, u64> = bincode::deserialize(&bytes).unwrap();

    let mut rebuilt = SkeletonBtreeMap::from_repr(repr).unwrap();
    assert_eq!(1000, rebuilt.len());
    assert_eq!(t.node_min, rebuilt.node_min);
    rebuilt.set_archiver(kind).unwrap();
    rebuilt.inflate().unwrap();
    assert_eq!(1000, check_order(&rebuilt));
    check_invariants(&rebuilt);
    assert!(store.len() > 0);
}

#[test]
fn tree_repr_rejects_size_mismatch() {
    let (_store, kind) = scheduled_archiver::<u64, u64>();
    let mut t = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    t.set_archiver(kind).unwrap();
    for i in 0..100u64 {
        t.insert(i, i).unwrap();
    }
    t.deflate().unwrap();

    let mut repr = TreeTranslator.app(&t).unwrap();
    repr.size += 1;
    assert!(matches!(
        TreeTranslator.rev(repr),
        Err(Error::DataFormat(_))
    ));
}

#[test]
fn no_archiver_is_an_illegal_state() {
    let mut t: SkeletonBtreeMap<u64, u64> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(2)).unwrap();
    for i in 0..100u64 {
        t.insert(i, i).unwrap();
    }
    assert!(matches!(t.deflate(), Err(Error::IllegalState(_))));
    assert!(matches!(t.inflate(), Err(Error::IllegalState(_))));
}

#[test]
fn string_keys_survive_a_skeleton_roundtrip() {
    let seed = 1971428643569665;
    let n_entries = 2_000;
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    const ASCII: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let id_faker = StringFaker::with(Vec::from(ASCII), 8..16);
    let name_faker = fake::faker::name::en::Name();

    let (_store, kind) = scheduled_archiver::<String, String>();
    let mut t: SkeletonBtreeMap<String, String> =
        SkeletonBtreeMap::new(BtreeConfig::default().node_min(8)).unwrap();
    t.set_archiver(kind).unwrap();

    for _ in 0..n_entries {
        t.insert(
            id_faker.fake_with_rng(&mut rng),
            name_faker.fake_with_rng(&mut rng),
        )
        .unwrap();
    }
    let search_key: String = id_faker.fake_with_rng(&mut rng);
    let search_value: String = name_faker.fake_with_rng(&mut rng);
    t.insert(search_key.clone(), search_value.clone()).unwrap();

    t.deflate().unwrap();
    t.inflate_key(&search_key).unwrap();
    assert_eq!(Some(&search_value), t.get(&search_key).unwrap());

    t.inflate().unwrap();
    assert!(t.is_live());
    check_invariants(&t);
}
