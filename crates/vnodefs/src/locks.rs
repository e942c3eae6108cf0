//! Hierarchical node locking.
//!
//! Every node carries a `RwLock<()>`. An operation locks a *chain*: its
//! target node (or the target's parent) and every ancestor up to the root.
//! Operations touching two directories lock two chains merged into one
//! acquisition plan.
//!
//! # Deadlock Prevention
//!
//! 1. Within a chain, children are locked before parents.
//! 2. Two chains are merged at their lowest common ancestor. The branch whose
//!    highest diverging ancestor has the lower id is locked first, then the
//!    other branch, then the shared suffix from the common ancestor to the
//!    root. Every plan over the same nodes therefore agrees on one order.
//! 3. Only the first node of a chain may be write-locked; ancestors are
//!    read-locked.
//! 4. The table lock is never held while blocking on a node lock.
//!
//! # Revalidation
//!
//! Blocking means dropping the table lock, and the graph may change while
//! it is down. Every acquisition remembers the table generation before
//! blocking. If it moved, the plan is recomputed from the current graph; a
//! different plan releases everything and starts over.

use crate::error::{FsError, FsResult};
use crate::graph::{DirectoryGraph, Node, Tables};
use crate::types::NodeId;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{MutexGuard, RawRwLock, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vnodefs_mount::VolumeStats;

/// How a single node is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// One chain to lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSpec {
    pub node: NodeId,
    /// Start at the node's parent instead of the node.
    pub lock_parent: bool,
    /// Write-lock the first node of the chain.
    pub write: bool,
}

impl ChainSpec {
    pub fn read(node: NodeId) -> Self {
        Self {
            node,
            lock_parent: false,
            write: false,
        }
    }

    pub fn write(node: NodeId) -> Self {
        Self {
            node,
            lock_parent: false,
            write: true,
        }
    }

    #[must_use]
    pub fn from_parent(mut self) -> Self {
        self.lock_parent = true;
        self
    }
}

type Step = (NodeId, LockMode);

enum HeldLock {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl HeldLock {
    fn try_acquire(lock: &Arc<RwLock<()>>, mode: LockMode) -> Option<Self> {
        match mode {
            LockMode::Read => lock.try_read_arc().map(HeldLock::Read),
            LockMode::Write => lock.try_write_arc().map(HeldLock::Write),
        }
    }

    fn acquire(lock: &Arc<RwLock<()>>, mode: LockMode) -> Self {
        match mode {
            LockMode::Read => HeldLock::Read(lock.read_arc()),
            LockMode::Write => HeldLock::Write(lock.write_arc()),
        }
    }

    fn mode(&self) -> LockMode {
        match self {
            HeldLock::Read(_) => LockMode::Read,
            HeldLock::Write(_) => LockMode::Write,
        }
    }
}

struct HeldNode {
    id: NodeId,
    lock: HeldLock,
}

/// Locks held on one or two merged chains.
///
/// Each locked node also carries one reference. Dropping the guard unlocks
/// and releases them bottom-up; it takes the table lock, so a guard must not
/// be dropped while the current thread holds it. Use
/// [`ChainGuard::release`] there instead.
#[must_use]
pub struct ChainGuard<'g> {
    graph: &'g DirectoryGraph,
    held: Vec<HeldNode>,
}

impl ChainGuard<'_> {
    /// Locked node ids in acquisition order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.held.iter().map(|h| h.id).collect()
    }

    pub fn mode_of(&self, id: NodeId) -> Option<LockMode> {
        self.held.iter().find(|h| h.id == id).map(|h| h.lock.mode())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release under an already held table lock.
    pub fn release(mut self, tables: &mut Tables) {
        release_held(tables, std::mem::take(&mut self.held));
    }
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            release_held(&mut self.graph.lock(), held);
        }
    }
}

impl fmt::Debug for ChainGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.held.iter().map(|h| (h.id, h.lock.mode())))
            .finish()
    }
}

fn release_held(tables: &mut Tables, held: Vec<HeldNode>) {
    for HeldNode { id, lock } in held {
        drop(lock);
        tables.put_node(id);
    }
}

/// A walk that runs past the depth bound never reaches the root.
fn walk_error(err: FsError) -> FsError {
    match err {
        FsError::TooDeep(_) => FsError::LockFailure,
        other => other,
    }
}

fn start_of(tables: &Tables, spec: ChainSpec) -> FsResult<NodeId> {
    if spec.lock_parent {
        tables.parent_of(spec.node).ok_or(FsError::NotFound)
    } else if tables.contains_node(spec.node) {
        Ok(spec.node)
    } else {
        Err(FsError::NotFound)
    }
}

fn mode_for(first: bool, write: bool) -> LockMode {
    if first && write {
        LockMode::Write
    } else {
        LockMode::Read
    }
}

/// Plan for a single chain: the start node up to the root.
fn chain_plan(tables: &Tables, spec: ChainSpec) -> FsResult<Vec<Step>> {
    let chain = tables.ancestors(start_of(tables, spec)?)?;
    Ok(chain
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, mode_for(i == 0, spec.write)))
        .collect())
}

/// Plan for two chains merged at their lowest common ancestor.
fn merged_plan(tables: &Tables, a: ChainSpec, b: ChainSpec) -> FsResult<Vec<Step>> {
    let chain_a = tables.ancestors(start_of(tables, a)?)?;
    let chain_b = tables.ancestors(start_of(tables, b)?)?;

    // Both chains end at the root, so at least one node is shared.
    let shared = chain_a
        .iter()
        .rev()
        .zip(chain_b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let common_a = chain_a.len() - shared;
    let common_b = chain_b.len() - shared;

    // If one start is the common ancestor its branch is empty and the order
    // between branches does not matter.
    let b_first =
        common_a > 0 && common_b > 0 && chain_a[common_a - 1] > chain_b[common_b - 1];

    let branch = |chain: &[NodeId], write: bool| -> Vec<Step> {
        chain
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, mode_for(i == 0, write)))
            .collect()
    };
    let branch_a = branch(&chain_a[..common_a], a.write);
    let branch_b = branch(&chain_b[..common_b], b.write);

    let suffix_write = (common_a == 0 && a.write) || (common_b == 0 && b.write);
    let suffix = branch(&chain_a[common_a..], suffix_write);

    let mut plan = Vec::new();
    plan.try_reserve_exact(chain_a.len() + common_b)?;
    if b_first {
        plan.extend(branch_b);
        plan.extend(branch_a);
    } else {
        plan.extend(branch_a);
        plan.extend(branch_b);
    }
    plan.extend(suffix);
    Ok(plan)
}

/// Acquires node chains against a [`DirectoryGraph`].
#[derive(Debug)]
pub struct LockManager {
    stats: Arc<VolumeStats>,
}

impl LockManager {
    pub fn new(stats: Arc<VolumeStats>) -> Self {
        Self { stats }
    }

    /// Lock one chain. Must be called without the table lock held.
    pub fn lock_chain<'g>(
        &self,
        graph: &'g DirectoryGraph,
        spec: ChainSpec,
    ) -> FsResult<ChainGuard<'g>> {
        trace!(?spec, "lock chain");
        self.acquire(graph, |tables| chain_plan(tables, spec))
    }

    /// Lock two chains at once. Must be called without the table lock held.
    pub fn lock_chains<'g>(
        &self,
        graph: &'g DirectoryGraph,
        first: ChainSpec,
        second: ChainSpec,
    ) -> FsResult<ChainGuard<'g>> {
        trace!(?first, ?second, "lock chains");
        self.acquire(graph, |tables| merged_plan(tables, first, second))
    }

    fn acquire<'g>(
        &self,
        graph: &'g DirectoryGraph,
        plan_for: impl Fn(&Tables) -> FsResult<Vec<Step>>,
    ) -> FsResult<ChainGuard<'g>> {
        let mut tables = graph.lock();
        let mut plan = plan_for(&tables).map_err(walk_error)?;

        'attempt: loop {
            let mut held: Vec<HeldNode> = Vec::new();
            held.try_reserve_exact(plan.len())?;

            for &(id, mode) in &plan {
                let Some(lock) = tables.node(id).map(Node::lock_handle) else {
                    release_held(&mut tables, held);
                    return Err(FsError::NotFound);
                };
                if let Err(err) = tables.ref_node(id) {
                    release_held(&mut tables, held);
                    return Err(err);
                }

                if let Some(guard) = HeldLock::try_acquire(&lock, mode) {
                    held.push(HeldNode { id, lock: guard });
                    continue;
                }

                self.stats.record_lock_contention();
                let generation = tables.generation();
                let guard = MutexGuard::unlocked(&mut tables, || HeldLock::acquire(&lock, mode));
                held.push(HeldNode { id, lock: guard });

                if tables.generation() == generation {
                    continue;
                }
                match plan_for(&tables) {
                    Ok(current) if current == plan => {}
                    Ok(current) => {
                        release_held(&mut tables, held);
                        self.stats.record_lock_retry();
                        debug!(node = id, "graph changed while blocked, relocking");
                        plan = current;
                        continue 'attempt;
                    }
                    Err(err) => {
                        release_held(&mut tables, held);
                        warn!(node = id, error = %err, "lock chain lost while blocked");
                        return Err(walk_error(err));
                    }
                }
            }

            self.stats.record_lock_acquisition();
            return Ok(ChainGuard { graph, held });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;
    use crossbeam_channel::unbounded;
    use std::thread;
    use std::time::Duration;

    //        1
    //      /   \
    //     2     3
    //    / \     \
    //   4   5     6
    fn tree() -> (DirectoryGraph, Arc<VolumeStats>) {
        let stats = Arc::new(VolumeStats::new());
        let graph = DirectoryGraph::new(32, 1024, Arc::clone(&stats));
        {
            let mut t = graph.lock();
            t.insert_root(1, NodeType::Directory).unwrap();
            for (parent, name, id) in [(1, "a", 2), (1, "b", 3), (2, "c", 4), (2, "d", 5), (3, "e", 6)] {
                t.get_or_create_node(id, NodeType::Directory).unwrap();
                t.link_entry(parent, name, id).unwrap();
                t.put_node(id);
            }
        }
        (graph, stats)
    }

    fn steps(plan: &[Step]) -> Vec<NodeId> {
        plan.iter().map(|s| s.0).collect()
    }

    #[test]
    fn test_single_chain_plan() {
        let (graph, _) = tree();
        let t = graph.lock();
        let plan = chain_plan(&t, ChainSpec::write(4)).unwrap();
        assert_eq!(
            plan,
            vec![(4, LockMode::Write), (2, LockMode::Read), (1, LockMode::Read)]
        );
        let plan = chain_plan(&t, ChainSpec::write(4).from_parent()).unwrap();
        assert_eq!(plan, vec![(2, LockMode::Write), (1, LockMode::Read)]);
    }

    #[test]
    fn test_merged_plan_siblings_lower_branch_first() {
        let (graph, _) = tree();
        let t = graph.lock();
        let forward = merged_plan(&t, ChainSpec::write(5), ChainSpec::write(4)).unwrap();
        let backward = merged_plan(&t, ChainSpec::write(4), ChainSpec::write(5)).unwrap();
        assert_eq!(steps(&forward), vec![4, 5, 2, 1]);
        assert_eq!(steps(&backward), vec![4, 5, 2, 1]);
        assert_eq!(forward[2].1, LockMode::Read);
    }

    #[test]
    fn test_merged_plan_disjoint_branches() {
        let (graph, _) = tree();
        let t = graph.lock();
        // Diverging ancestors are 2 (for 4) and 3 (for 6).
        let plan = merged_plan(&t, ChainSpec::write(6), ChainSpec::read(4)).unwrap();
        assert_eq!(steps(&plan), vec![4, 2, 6, 3, 1]);
        assert_eq!(plan[0].1, LockMode::Read);
        assert_eq!(plan[2].1, LockMode::Write);
    }

    #[test]
    fn test_merged_plan_ancestor_and_descendant() {
        let (graph, _) = tree();
        let t = graph.lock();
        let plan = merged_plan(&t, ChainSpec::write(2), ChainSpec::write(4)).unwrap();
        assert_eq!(
            plan,
            vec![(4, LockMode::Write), (2, LockMode::Write), (1, LockMode::Read)]
        );
        let same = merged_plan(&t, ChainSpec::write(2), ChainSpec::read(2)).unwrap();
        assert_eq!(same, vec![(2, LockMode::Write), (1, LockMode::Read)]);
    }

    #[test]
    fn test_merged_plan_orders_by_diverging_child() {
        let (graph, _) = tree();
        let t = graph.lock();
        // 6 diverges below the root through 3, 5 through 2: 5's branch goes first.
        let plan = merged_plan(&t, ChainSpec::write(6), ChainSpec::write(5)).unwrap();
        assert_eq!(
            plan,
            vec![
                (5, LockMode::Write),
                (2, LockMode::Read),
                (6, LockMode::Write),
                (3, LockMode::Read),
                (1, LockMode::Read),
            ]
        );
    }

    #[test]
    fn test_merged_plan_meets_only_at_root() {
        let (graph, _) = tree();
        let t = graph.lock();
        let plan = merged_plan(&t, ChainSpec::write(3), ChainSpec::write(2)).unwrap();
        assert_eq!(
            plan,
            vec![(2, LockMode::Write), (3, LockMode::Write), (1, LockMode::Read)]
        );
        // Parent chains of 4 and 6 start at 2 and 3.
        let parents =
            merged_plan(&t, ChainSpec::read(6).from_parent(), ChainSpec::write(4).from_parent()).unwrap();
        assert_eq!(
            parents,
            vec![(2, LockMode::Write), (3, LockMode::Read), (1, LockMode::Read)]
        );
    }

    #[test]
    fn test_merged_plan_shared_start_is_written() {
        let (graph, _) = tree();
        let t = graph.lock();
        // A read-only chain starting at the common ancestor leaves it shared.
        let plan = merged_plan(&t, ChainSpec::read(2), ChainSpec::write(4)).unwrap();
        assert_eq!(
            plan,
            vec![(4, LockMode::Write), (2, LockMode::Read), (1, LockMode::Read)]
        );
        // Either chain asking for write on the same start makes the suffix head a writer.
        let plan = merged_plan(&t, ChainSpec::read(2), ChainSpec::write(2)).unwrap();
        assert_eq!(plan, vec![(2, LockMode::Write), (1, LockMode::Read)]);
        let plan = merged_plan(&t, ChainSpec::read(2), ChainSpec::read(2)).unwrap();
        assert_eq!(plan, vec![(2, LockMode::Read), (1, LockMode::Read)]);
    }

    #[test]
    fn test_merged_plans_follow_post_order() {
        // Every merged plan must be a subsequence of one global order, or two
        // of them could wait on each other.
        let (graph, _) = tree();
        let t = graph.lock();
        let order: Vec<NodeId> = vec![4, 5, 2, 6, 3, 1];
        for a in 1..=6 {
            for b in 1..=6 {
                let plan = merged_plan(&t, ChainSpec::write(a), ChainSpec::read(b)).unwrap();
                let positions: Vec<usize> = plan
                    .iter()
                    .map(|(id, _)| order.iter().position(|o| o == id).unwrap())
                    .collect();
                assert!(
                    positions.windows(2).all(|w| w[0] < w[1]),
                    "plan for ({a}, {b}) out of order: {plan:?}"
                );
            }
        }
    }

    #[test]
    fn test_overlapping_chain_pairs_never_deadlock() {
        use rand::Rng;

        const THREADS: usize = 6;
        const ROUNDS: usize = 400;

        let (graph, stats) = tree();
        let graph = Arc::new(graph);
        let manager = Arc::new(LockManager::new(Arc::clone(&stats)));
        let (tx, rx) = unbounded();

        for _ in 0..THREADS {
            let graph = Arc::clone(&graph);
            let manager = Arc::clone(&manager);
            let tx = tx.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..ROUNDS {
                    let mut spec = || {
                        let node = rng.random_range(1..=6);
                        let spec = if rng.random_bool(0.5) {
                            ChainSpec::write(node)
                        } else {
                            ChainSpec::read(node)
                        };
                        if node != 1 && rng.random_bool(0.3) {
                            spec.from_parent()
                        } else {
                            spec
                        }
                    };
                    let (a, b) = (spec(), spec());
                    let guard = manager.lock_chains(&graph, a, b).unwrap();
                    if rng.random_bool(0.1) {
                        thread::yield_now();
                    }
                    drop(guard);
                }
                let _ = tx.send(());
            });
        }
        drop(tx);

        // Watchdog: a deadlocked worker never reports back.
        for _ in 0..THREADS {
            rx.recv_timeout(Duration::from_secs(30))
                .expect("lock workers stalled");
        }
        assert_eq!(stats.snapshot().lock_acquisitions, (THREADS * ROUNDS) as u64);
        let t = graph.lock();
        assert_eq!(t.ref_count(1), Some(3));
        t.check_consistency().unwrap();
    }

    #[test]
    fn test_lock_chain_refs_and_releases() {
        let (graph, stats) = tree();
        let before = graph.lock().ref_count(2);
        let guard = LockManager::new(Arc::clone(&stats))
            .lock_chain(&graph, ChainSpec::write(4))
            .unwrap();
        assert_eq!(guard.ids(), vec![4, 2, 1]);
        assert_eq!(guard.mode_of(4), Some(LockMode::Write));
        assert_eq!(graph.lock().ref_count(2), before.map(|c| c + 1));
        drop(guard);
        assert_eq!(graph.lock().ref_count(2), before);
        assert_eq!(stats.snapshot().lock_acquisitions, 1);
    }

    #[test]
    fn test_detached_node_is_not_found() {
        let (graph, stats) = tree();
        graph.lock().get_or_create_node(99, NodeType::File).unwrap();
        let err = LockManager::new(stats)
            .lock_chain(&graph, ChainSpec::read(99))
            .unwrap_err();
        assert!(matches!(err, FsError::NotFound));
    }

    #[test]
    fn test_too_deep_is_lock_failure() {
        let stats = Arc::new(VolumeStats::new());
        let graph = DirectoryGraph::new(2, 1024, Arc::clone(&stats));
        {
            let mut t = graph.lock();
            t.insert_root(1, NodeType::Directory).unwrap();
            t.get_or_create_node(2, NodeType::Directory).unwrap();
            t.link_entry(1, "a", 2).unwrap();
            t.get_or_create_node(3, NodeType::Directory).unwrap();
            t.link_entry(2, "b", 3).unwrap();
        }
        let err = LockManager::new(stats)
            .lock_chain(&graph, ChainSpec::read(3))
            .unwrap_err();
        assert!(matches!(err, FsError::LockFailure));
    }

    #[test]
    fn test_writer_blocks_until_reader_releases() {
        let (graph, stats) = tree();
        let graph = Arc::new(graph);
        let manager = Arc::new(LockManager::new(Arc::clone(&stats)));
        let reader = manager.lock_chain(&graph, ChainSpec::read(4)).unwrap();

        let (tx, rx) = unbounded();
        let handle = {
            let graph = Arc::clone(&graph);
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let guard = manager.lock_chain(&graph, ChainSpec::write(4)).unwrap();
                tx.send(guard.ids()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(reader);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![4, 2, 1]);
        handle.join().unwrap();
        assert!(stats.snapshot().lock_contentions >= 1);
    }

    #[test]
    fn test_blocked_walk_sees_rename() {
        let (graph, stats) = tree();
        let graph = Arc::new(graph);
        let manager = Arc::new(LockManager::new(Arc::clone(&stats)));
        let holder = manager.lock_chain(&graph, ChainSpec::write(4)).unwrap();

        let (tx, rx) = unbounded();
        let handle = {
            let graph = Arc::clone(&graph);
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let guard = manager.lock_chain(&graph, ChainSpec::write(4)).unwrap();
                tx.send(guard.ids()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));

        // Move 4 under 6 while the second walker is parked on it.
        {
            let mut t = graph.lock();
            t.rename_entry(2, "c", 6, "c").unwrap();
            holder.release(&mut t);
        }

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            vec![4, 6, 3, 1]
        );
        handle.join().unwrap();
        graph.lock().check_consistency().unwrap();
    }
}
