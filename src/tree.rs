//! The speculation tree.
//!
//! A binary tree of candidate nodes backed by a flat arena. Node references
//! are integer indices, child links are indices, and a parent index is
//! stored alongside, so there are no ownership cycles and no per-node
//! reference counting. Nodes are never removed from the arena: workers and
//! the cleanup pool may hold a `NodeId` across lock releases and it stays
//! valid for the lifetime of the run.
//!
//! Each node carries at most one task. A node without a task is an empty
//! placeholder reserving the branch the driver bet against; it is filled in
//! later if the bet turns out wrong.
//!
//! The whole structure is owned by whichever thread holds the tree lock
//! (`Mutex<Tree>` in the driver). Methods here assume that exclusivity and
//! do no locking of their own. Task mutexes must not be acquired while the
//! tree lock is held; everything below reads only the lock-free task
//! mirrors (status, elapsed).

use std::sync::Arc;
use std::time::Duration;

use crate::task::{Task, TaskStatus};

/// Index of a node in the tree arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The arena index, stable for the lifetime of the run.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Child slot labels. The failure slot is index 0, success is index 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    Failure = 0,
    Success = 1,
}

impl Branch {
    /// The opposite slot.
    pub fn other(self) -> Branch {
        match self {
            Branch::Failure => Branch::Success,
            Branch::Success => Branch::Failure,
        }
    }
}

struct Node {
    task: Option<Arc<Task>>,
    parent: Option<NodeId>,
    children: [Option<NodeId>; 2],
    depth: u32,
}

/// Arena-backed binary speculation tree.
pub struct Tree {
    nodes: Vec<Node>,
    /// Roots of subtrees unlinked by compression. Kept so their nodes stay
    /// reachable for end-of-run cleanup.
    retired: Vec<NodeId>,
    live_count: usize,
    max_depth: u32,
    collapsed: Duration,
}

impl Tree {
    /// Creates a tree whose root carries the original input task.
    pub fn new(root: Arc<Task>) -> Tree {
        Tree {
            nodes: vec![Node {
                task: Some(root),
                parent: None,
                children: [None, None],
                depth: 1,
            }],
            retired: Vec::new(),
            live_count: 1,
            max_depth: 1,
            collapsed: Duration::ZERO,
        }
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The task carried by `id`, or `None` for a placeholder.
    pub fn task(&self, id: NodeId) -> Option<&Arc<Task>> {
        self.nodes[id.0 as usize].task.as_ref()
    }

    /// The parent of `id`, `None` for the root and for retired subtree roots.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].parent
    }

    /// The child of `id` on `branch`.
    pub fn child(&self, id: NodeId, branch: Branch) -> Option<NodeId> {
        self.nodes[id.0 as usize].children[branch as usize]
    }

    /// True if `id` has no children.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0 as usize];
        node.children[0].is_none() && node.children[1].is_none()
    }

    /// Depth of `id`; the root has depth 1.
    pub fn depth(&self, id: NodeId) -> u32 {
        self.nodes[id.0 as usize].depth
    }

    /// Number of nodes reachable from the root, placeholders included.
    pub fn len(&self) -> usize {
        self.live_count
    }

    /// True if the tree holds only the root.
    pub fn is_empty(&self) -> bool {
        self.live_count <= 1
    }

    /// Height of the live tree.
    pub fn height(&self) -> u32 {
        self.max_depth
    }

    /// Total elapsed time of tasks removed by compression.
    pub fn collapsed_time(&self) -> Duration {
        self.collapsed
    }

    /// Inserts a child under `parent` on `branch`. Pass `None` to create an
    /// empty placeholder reserving the branch.
    ///
    /// # Panics
    /// Panics if the slot is already occupied.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        branch: Branch,
        task: Option<Arc<Task>>,
    ) -> NodeId {
        assert!(
            self.child(parent, branch).is_none(),
            "child slot already occupied"
        );
        let depth = self.depth(parent) + 1;
        let id = NodeId(u32::try_from(self.nodes.len()).expect("tree arena overflow"));
        self.nodes.push(Node {
            task,
            parent: Some(parent),
            children: [None, None],
            depth,
        });
        self.nodes[parent.0 as usize].children[branch as usize] = Some(id);
        self.live_count += 1;
        self.max_depth = self.max_depth.max(depth);
        id
    }

    /// Fills a placeholder with a real task.
    ///
    /// # Panics
    /// Panics if the node already carries a task.
    pub fn attach_task(&mut self, id: NodeId, task: Arc<Task>) {
        let node = &mut self.nodes[id.0 as usize];
        assert!(node.task.is_none(), "node already carries a task");
        node.task = Some(task);
    }

    /// Iterates `from` and its ancestors up to and including the root.
    pub fn ancestors(&self, from: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: Some(from),
        }
    }

    /// True if every node from `id` up to the root carries a task whose
    /// verdict is known and kept.
    pub fn root_path_finalized(&self, id: NodeId) -> bool {
        self.ancestors(id).all(|n| {
            self.task(n)
                .map(|t| t.status().is_final())
                .unwrap_or(false)
        })
    }

    /// Walks the predicted path from the root and returns the deepest
    /// finalized node: the deepest Success if `success_only`, otherwise the
    /// deepest node of either polarity. The returned node's root path is
    /// finalized by construction.
    pub fn find_finalized(&self, success_only: bool) -> Option<NodeId> {
        let mut best = None;
        let mut cur = self.root();
        loop {
            let Some(task) = self.task(cur) else { break };
            let next = match task.status() {
                TaskStatus::Success => {
                    best = Some(cur);
                    self.child(cur, Branch::Success)
                }
                TaskStatus::Failure => {
                    if !success_only {
                        best = Some(cur);
                    }
                    self.child(cur, Branch::Failure)
                }
                _ => break,
            };
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }
        best
    }

    /// Sums the recorded predicate time along the path from `id` to the
    /// root (the root's own verification run is not counted).
    pub fn path_elapsed(&self, id: NodeId) -> Duration {
        self.ancestors(id)
            .filter(|n| *n != self.root())
            .filter_map(|n| self.task(n).and_then(|t| t.elapsed()))
            .sum()
    }

    /// Collects every task in the subtree rooted at `id`, preorder.
    pub fn subtree_tasks(&self, id: NodeId) -> Vec<Arc<Task>> {
        let mut tasks = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(task) = self.task(n) {
                tasks.push(Arc::clone(task));
            }
            let node = &self.nodes[n.0 as usize];
            stack.extend(node.children.iter().flatten().copied());
        }
        tasks
    }

    /// Every task in the arena, live and retired. Used by end-of-run cleanup.
    pub fn arena_tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.nodes.iter().filter_map(|n| n.task.as_ref())
    }

    /// Folds long finalized failure runs out of the live tree.
    ///
    /// Walks the finalized prefix of the predicted path and re-parents each
    /// Success one hop at a time, so every Success becomes the immediate
    /// success child of the previous one; only the run of Failures between
    /// two kept Successes is unlinked. A final splice folds the finalized
    /// failure tail below the deepest Success the same way. A Success node
    /// is never retired.
    ///
    /// Unlinked runs go to the retired list and their tasks are returned
    /// for the cleanup pool; their recorded compute time is added to
    /// [`collapsed_time`](Self::collapsed_time) so user-visible totals stay
    /// accurate. Everything at or below the deepest finalized node is
    /// untouched, so in-flight speculative work survives compression.
    pub fn compress(&mut self) -> Vec<Arc<Task>> {
        let mut removed = Vec::new();

        // Hoist the chain of finalized Successes into adjacent links.
        let mut anchor = self.root();
        while let Some(success) = self.next_success_below(anchor) {
            if self.child(anchor, Branch::Success) != Some(success) {
                self.splice(anchor, success, &mut removed);
            }
            anchor = success;
        }

        // Fold the finalized failure tail below the deepest Success.
        let final_any = self
            .find_finalized(false)
            .expect("the root is always finalized");
        if final_any != anchor && self.child(anchor, Branch::Success) != Some(final_any) {
            self.splice(anchor, final_any, &mut removed);
        }

        if !removed.is_empty() {
            self.refresh_live_metrics();
        }
        removed
    }

    /// Returns the next finalized Success strictly below `from` on the
    /// predicted path, or `None` if a non-finalized node comes first.
    ///
    /// `from` must be a Success, so the path leaves it through the success
    /// slot and then descends through failure slots until the next Success.
    fn next_success_below(&self, from: NodeId) -> Option<NodeId> {
        let mut cur = self.child(from, Branch::Success)?;
        loop {
            let task = self.task(cur)?;
            match task.status() {
                TaskStatus::Success => return Some(cur),
                TaskStatus::Failure => cur = self.child(cur, Branch::Failure)?,
                _ => return None,
            }
        }
    }

    /// Detaches `keep` from its parent, retires `anchor`'s success subtree
    /// (now holding only the Failure or Discarded material between the two),
    /// and reattaches `keep` as `anchor`'s success child.
    fn splice(&mut self, anchor: NodeId, keep: NodeId, removed: &mut Vec<Arc<Task>>) {
        let keep_parent = self.parent(keep).expect("kept node is below its anchor");
        let slot = self.nodes[keep_parent.0 as usize]
            .children
            .iter()
            .position(|c| *c == Some(keep))
            .expect("parent links to child");
        self.nodes[keep_parent.0 as usize].children[slot] = None;

        let old = self.nodes[anchor.0 as usize].children[Branch::Success as usize]
            .take()
            .expect("anchor has a success subtree");
        self.nodes[old.0 as usize].parent = None;
        self.retired.push(old);

        for task in self.subtree_tasks(old) {
            assert_ne!(
                task.status(),
                TaskStatus::Success,
                "a success node must never be retired"
            );
            if let Some(elapsed) = task.elapsed() {
                self.collapsed += elapsed;
            }
            removed.push(task);
        }

        self.nodes[keep.0 as usize].parent = Some(anchor);
        self.nodes[anchor.0 as usize].children[Branch::Success as usize] = Some(keep);
    }

    /// Recomputes depths, the live node count, and the height after surgery.
    fn refresh_live_metrics(&mut self) {
        let mut count = 0usize;
        let mut height = 0u32;
        let mut stack = vec![(self.root(), 1u32)];
        while let Some((n, depth)) = stack.pop() {
            count += 1;
            height = height.max(depth);
            self.nodes[n.0 as usize].depth = depth;
            let node = &self.nodes[n.0 as usize];
            for child in node.children.iter().flatten().copied().collect::<Vec<_>>() {
                stack.push((child, depth + 1));
            }
        }
        self.live_count = count;
        self.max_depth = height;
    }
}

/// Iterator over a node and its ancestors.
pub struct Ancestors<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.parent(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ChunkState;
    use std::time::Duration;

    fn task(status: TaskStatus, elapsed_ms: u64) -> Arc<Task> {
        let t = Task::new(
            tempfile::tempfile().unwrap(),
            8,
            ChunkState {
                offset: 0,
                chunksize: 8,
            },
        );
        if status != TaskStatus::Pending {
            t.set_status(status);
        }
        if elapsed_ms > 0 {
            t.record_elapsed(Duration::from_millis(elapsed_ms));
        }
        Arc::new(t)
    }

    fn root_tree() -> Tree {
        Tree::new(task(TaskStatus::Success, 0))
    }

    /// Builds a run of `failures` finalized failures along the predicted path
    /// out of `from` (assumed Success), then a Success tail node, placing
    /// each child on the slot the driver would have predicted. Returns the
    /// success node's id.
    fn failure_chain(tree: &mut Tree, from: NodeId, failures: usize) -> NodeId {
        let mut cur = from;
        let mut branch = Branch::Success;
        for _ in 0..failures {
            let fail = tree.insert_child(cur, branch, Some(task(TaskStatus::Failure, 10)));
            tree.insert_child(cur, branch.other(), None);
            cur = fail;
            branch = Branch::Failure;
        }
        let succ = tree.insert_child(cur, branch, Some(task(TaskStatus::Success, 10)));
        tree.insert_child(cur, branch.other(), None);
        succ
    }

    #[test]
    fn insert_tracks_depth_and_count() {
        let mut tree = root_tree();
        let root = tree.root();
        assert_eq!(tree.height(), 1);
        let a = tree.insert_child(root, Branch::Success, Some(task(TaskStatus::Pending, 0)));
        tree.insert_child(root, Branch::Failure, None);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.parent(a), Some(root));
        assert!(tree.is_leaf(a));
        assert!(!tree.is_leaf(root));
    }

    #[test]
    #[should_panic(expected = "slot already occupied")]
    fn double_insert_panics() {
        let mut tree = root_tree();
        let root = tree.root();
        tree.insert_child(root, Branch::Success, None);
        tree.insert_child(root, Branch::Success, None);
    }

    #[test]
    fn placeholder_attach() {
        let mut tree = root_tree();
        let ph = tree.insert_child(tree.root(), Branch::Failure, None);
        assert!(tree.task(ph).is_none());
        tree.attach_task(ph, task(TaskStatus::Pending, 0));
        assert!(tree.task(ph).is_some());
    }

    #[test]
    fn finalized_path_queries() {
        let mut tree = root_tree();
        // root(S) -> fail(F) -> success tail(S)
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 1);
        assert!(tree.root_path_finalized(s));

        let pending = tree.insert_child(s, Branch::Success, Some(task(TaskStatus::Pending, 0)));
        assert!(!tree.root_path_finalized(pending));

        assert_eq!(tree.find_finalized(true), Some(s));
        assert_eq!(tree.find_finalized(false), Some(s));
    }

    #[test]
    fn deepest_finalized_of_either_polarity() {
        let mut tree = root_tree();
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 2);
        // Predicted continuation below the success: one more failure.
        let f = tree.insert_child(s, Branch::Success, Some(task(TaskStatus::Failure, 5)));
        tree.insert_child(s, Branch::Failure, None);

        assert_eq!(tree.find_finalized(true), Some(s));
        assert_eq!(tree.find_finalized(false), Some(f));
    }

    #[test]
    fn path_elapsed_excludes_root() {
        let mut tree = root_tree();
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 3);
        // 3 failures at 10ms plus the success at 10ms.
        assert_eq!(tree.path_elapsed(s), Duration::from_millis(40));
    }

    #[test]
    fn compress_hoists_the_deepest_success() {
        let mut tree = root_tree();
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 5);
        let height_before = tree.height();
        assert_eq!(height_before, 7);

        let removed = tree.compress();
        // The five failures were retired; their placeholders carried nothing.
        assert_eq!(removed.len(), 5);
        assert!(removed
            .iter()
            .all(|t| t.status() == TaskStatus::Failure));
        assert_eq!(tree.child(tree.root(), Branch::Success), Some(s));
        assert_eq!(tree.parent(s), Some(tree.root()));
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.collapsed_time(), Duration::from_millis(50));
        // Retired tasks stay reachable for final cleanup.
        assert_eq!(tree.arena_tasks().count(), 1 + 5 + 1);
    }

    #[test]
    fn compress_folds_the_failure_tail_too() {
        let mut tree = root_tree();
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 2);
        // Finalized failure tail below the success: the first step leaves a
        // Success node via its success slot, every later step follows the
        // failure slot. Ends in a pending frontier that must survive.
        let mut cur = s;
        let mut branch = Branch::Success;
        let mut last_fail = s;
        for _ in 0..5 {
            let f = tree.insert_child(cur, branch, Some(task(TaskStatus::Failure, 1)));
            tree.insert_child(cur, branch.other(), None);
            last_fail = f;
            cur = f;
            branch = Branch::Failure;
        }
        let frontier =
            tree.insert_child(last_fail, Branch::Failure, Some(task(TaskStatus::Pending, 0)));
        tree.insert_child(last_fail, Branch::Success, None);

        let removed = tree.compress();
        // Two failures between root and the success, four between the
        // success and the deepest finalized failure.
        assert_eq!(removed.len(), 6);
        assert_eq!(tree.child(tree.root(), Branch::Success), Some(s));
        assert_eq!(tree.child(s, Branch::Success), Some(last_fail));
        // The pending frontier is still attached below the kept tail.
        assert_eq!(tree.child(last_fail, Branch::Failure), Some(frontier));
        assert_eq!(tree.task(frontier).unwrap().status(), TaskStatus::Pending);
    }

    #[test]
    fn compress_keeps_intermediate_successes() {
        // root(S) -> n1(S) -> n2(F) -> n3(F) -> n4(S): consecutive
        // successes are the mainline shape (a success keeps its window, so
        // the next candidate often succeeds too). n1 must survive as a kept
        // link; only the failure run between n1 and n4 may go.
        let mut tree = root_tree();
        let n1 = tree.insert_child(tree.root(), Branch::Success, Some(task(TaskStatus::Success, 10)));
        tree.insert_child(tree.root(), Branch::Failure, None);
        let n2 = tree.insert_child(n1, Branch::Success, Some(task(TaskStatus::Failure, 10)));
        tree.insert_child(n1, Branch::Failure, None);
        let n3 = tree.insert_child(n2, Branch::Failure, Some(task(TaskStatus::Failure, 10)));
        tree.insert_child(n2, Branch::Success, None);
        let n4 = tree.insert_child(n3, Branch::Failure, Some(task(TaskStatus::Success, 10)));
        tree.insert_child(n3, Branch::Success, None);

        let removed = tree.compress();

        assert!(removed.iter().all(|t| t.status() != TaskStatus::Success));
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.child(tree.root(), Branch::Success), Some(n1));
        assert_eq!(tree.child(n1, Branch::Success), Some(n4));
        assert_eq!(tree.parent(n4), Some(n1));
        assert_eq!(tree.find_finalized(true), Some(n4));
        assert_eq!(tree.collapsed_time(), Duration::from_millis(20));
        // The retired failures stay reachable for end-of-run cleanup.
        assert_eq!(tree.arena_tasks().count(), 5);
    }

    #[test]
    fn compress_noop_when_already_flat() {
        let mut tree = root_tree();
        let root = tree.root();
        let s = failure_chain(&mut tree, root, 0);
        assert_eq!(tree.child(tree.root(), Branch::Success), Some(s));
        let removed = tree.compress();
        assert!(removed.is_empty());
    }
}
