//! An in-memory, duplicate-aware B+ tree index.
//!
//! [`BPlusTree`] keeps ordered keys in a chain of leaf nodes threaded
//! together for fast range scans, with an internal-node layer above them
//! for O(log n) descent. It takes an opaque key `K`, an opaque value `V`,
//! and a caller-supplied total-order comparator over `K` — there is no
//! persistence, transaction, or query-language layer here; those belong to
//! whatever embeds this tree.
//!
//! Nodes are held in an arena (`Vec<Option<Node<K, V>>>`) and addressed by
//! a stable [`node::NodeId`] handle rather than shared/weak pointers, so
//! the parent/child/sibling graph can never form an uncollectable cycle.

mod node;
mod sorted_list;

use std::cmp::Ordering;

use crate::error::{invariant_violation, BPlusTreeError, BPlusTreeResult};

use node::{Cell, Node, NodeId};
use sorted_list::SortedList;

pub use sorted_list::SearchMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceIs {
    LeftSibling,
    RightSibling,
}

/// An in-memory B+ tree mapping keys `K` to values `V`.
///
/// `max_node_size` must be even and at least 4; construction fails
/// otherwise. `cmp` must implement a stable total order over `K` for the
/// lifetime of the tree — the rebalancing algorithm has no way to detect a
/// comparator that contradicts itself between calls, and doing so
/// surfaces as an [`BPlusTreeError::InvariantViolation`] panic somewhere
/// downstream rather than as a clean error at the call that triggered it.
pub struct BPlusTree<K, V, C>
where
    C: Fn(&K, &K) -> Ordering,
{
    nodes: Vec<Option<Node<K, V>>>,
    free_list: Vec<NodeId>,
    root: Option<NodeId>,
    leftmost_leaf: Option<NodeId>,
    rightmost_leaf: Option<NodeId>,
    size: u64,
    max_node_size: usize,
    half_capacity: usize,
    cmp: C,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Clone,
    V: Clone,
    C: Fn(&K, &K) -> Ordering + Clone,
{
    pub fn new(max_node_size: usize, cmp: C) -> BPlusTreeResult<Self> {
        if max_node_size % 2 != 0 || max_node_size < 4 {
            return Err(BPlusTreeError::ConfigError { max_node_size });
        }

        Ok(Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
            root: None,
            leftmost_leaf: None,
            rightmost_leaf: None,
            size: 0,
            max_node_size,
            half_capacity: max_node_size / 2,
            cmp,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    // ---------------------------------------------------------------
    // arena plumbing
    // ---------------------------------------------------------------

    fn node(&self, id: NodeId) -> &Node<K, V> {
        self.nodes[id as usize]
            .as_ref()
            .unwrap_or_else(|| invariant_violation(format!("dangling node handle {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        self.nodes[id as usize]
            .as_mut()
            .unwrap_or_else(|| invariant_violation(format!("dangling node handle {id}")))
    }

    fn alloc_node(&mut self, is_leaf: bool) -> NodeId {
        let node = Node::new(is_leaf);
        if let Some(id) = self.free_list.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            let id = self.nodes.len() as NodeId;
            self.nodes.push(Some(node));
            id
        }
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id as usize] = None;
        self.free_list.push(id);
    }

    fn set_left_most_child(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(parent).left_most_child = Some(child);
        self.node_mut(child).parent_node = Some(parent);
    }

    fn set_cells(&mut self, node_id: NodeId, cells: SortedList<Cell<K, V>>) {
        self.node_mut(node_id).cells = cells;
        self.reinforce_parentage(node_id);
    }

    /// Re-points `parent_node` on every child referenced by `node_id`'s
    /// current cell list. Idempotent; used after splicing cells into a
    /// node without replacing the whole list via [`Self::set_cells`].
    fn reinforce_parentage(&mut self, node_id: NodeId) {
        if self.node(node_id).is_leaf {
            return;
        }
        let children: Vec<NodeId> = self
            .node(node_id)
            .cells
            .iter()
            .filter_map(|c| c.right_child)
            .collect();
        for child in children {
            self.node_mut(child).parent_node = Some(node_id);
        }
    }

    /// If `node` is not its parent's left-most child, returns the parent
    /// and the index of the cell whose `right_child` is `node`. Returns
    /// `None` either when `node` has no parent (it's the root) or when it
    /// *is* the parent's left-most child (there is no governing cell).
    fn located_parent_cell(&self, node: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.node(node).parent_node?;
        if self.node(parent).left_most_child == Some(node) {
            return None;
        }
        let idx = self
            .node(parent)
            .cells
            .iter()
            .position(|c| c.right_child == Some(node))
            .unwrap_or_else(|| invariant_violation("child missing from parent's cell list"));
        Some((parent, idx))
    }

    /// The nearest ancestor cell that separates `node`'s subtree from its
    /// right sibling's subtree, climbing through left-most-child ancestors
    /// when `node` itself has no governing cell. Falls back to the
    /// immediate parent's first cell if the climb reaches the root without
    /// finding one (this only happens along the tree's global left edge).
    fn effective_parent_cell(&self, node: NodeId) -> (NodeId, usize) {
        let mut current = node;
        loop {
            if let Some(loc) = self.located_parent_cell(current) {
                return loc;
            }
            match self.node(current).parent_node {
                Some(parent) => current = parent,
                None => break,
            }
        }
        let parent = self
            .node(node)
            .parent_node
            .unwrap_or_else(|| invariant_violation("effective_parent_cell requires a parent"));
        (parent, 0)
    }

    fn cell_cmp(cmp: &C) -> impl Fn(&Cell<K, V>, &Cell<K, V>) -> Ordering + '_ {
        move |a, b| cmp(&a.key, &b.key)
    }

    // ---------------------------------------------------------------
    // descent
    // ---------------------------------------------------------------

    /// Descends from the root to the leaf that should hold `key`, using an
    /// `Le` search at every internal node. `None` only for an empty tree.
    fn search_for_leaf(&self, key: &K) -> Option<NodeId> {
        let mut current = self.root?;
        let probe = Cell::probe(key.clone());
        let cell_cmp = |a: &Cell<K, V>, b: &Cell<K, V>| (self.cmp)(&a.key, &b.key);

        loop {
            let n = self.node(current);
            if n.is_leaf {
                return Some(current);
            }
            current = match n.cells.search_index(&probe, &cell_cmp, SearchMode::Le) {
                None => n
                    .left_most_child
                    .unwrap_or_else(|| invariant_violation("internal node missing left_most_child")),
                Some(idx) => {
                    let hit = n.cells.get(idx);
                    if (self.cmp)(key, &hit.key) == Ordering::Equal {
                        if idx == 0 {
                            n.left_most_child.unwrap_or_else(|| {
                                invariant_violation("internal node missing left_most_child")
                            })
                        } else {
                            n.cells.get(idx - 1).right_child.unwrap_or_else(|| {
                                invariant_violation("internal cell missing right_child")
                            })
                        }
                    } else {
                        hit.right_child
                            .unwrap_or_else(|| invariant_violation("internal cell missing right_child"))
                    }
                }
            };
        }
    }

    // ---------------------------------------------------------------
    // insert / delete
    // ---------------------------------------------------------------

    /// Inserts `key`/`value`. If `key` already compares equal to an
    /// existing entry, the existing cell absorbs it: both the stored key
    /// and value are replaced and its duplicate count increases. Returns
    /// the inserted key.
    pub fn insert(&mut self, key: K, value: V) -> K {
        let cmp = self.cmp.clone();
        let returned_key = key.clone();

        if self.root.is_none() {
            let root = self.alloc_node(true);
            let cell_cmp = Self::cell_cmp(&cmp);
            self.node_mut(root).cells.insert(Cell::leaf(key, value), &cell_cmp);
            self.root = Some(root);
            self.leftmost_leaf = Some(root);
            self.rightmost_leaf = Some(root);
            self.size = 1;
            return returned_key;
        }

        let leaf = self
            .search_for_leaf(&key)
            .unwrap_or_else(|| invariant_violation("search_for_leaf found nothing in a non-empty tree"));
        let cell_cmp = Self::cell_cmp(&cmp);
        self.node_mut(leaf).cells.insert(Cell::leaf(key, value), &cell_cmp);
        self.size += 1;
        log::trace!("b_plus_tree: inserted into leaf {leaf}, size now {}", self.size);
        self.balance(leaf, &cmp);

        returned_key
    }

    /// Removes `key`. Returns the removed key together with the duplicate
    /// count it had absorbed, or `None` if the key was not present.
    pub fn delete(&mut self, key: &K) -> Option<(K, u32)> {
        if self.root.is_none() {
            return None;
        }
        let cmp = self.cmp.clone();
        let leaf = self.search_for_leaf(key)?;
        let cell_cmp = Self::cell_cmp(&cmp);
        let probe = Cell::probe(key.clone());
        let (removed, dup) = self.node_mut(leaf).cells.remove(&probe, &cell_cmp)?;
        self.size -= 1 + dup as u64;
        log::trace!("b_plus_tree: deleted from leaf {leaf}, size now {}", self.size);
        self.balance(leaf, &cmp);
        Some((removed.key, dup))
    }

    // ---------------------------------------------------------------
    // rebalancing
    // ---------------------------------------------------------------

    fn balance(&mut self, node_id: NodeId, cmp: &C) {
        let n = self.node(node_id);
        let size = n.len();

        if size > self.max_node_size {
            log::debug!("b_plus_tree: node {node_id} overflowed ({size}), splitting");
            let parent = self.split(node_id, cmp);
            self.balance(parent, cmp);
            return;
        }
        if self.half_capacity <= size {
            log::trace!("b_plus_tree: node {node_id} balanced ({size}), nothing to do");
            return;
        }

        let left_sibling = n.left_sibling;
        let right_sibling = n.right_sibling;
        let left_size = left_sibling.map(|id| self.node(id).len()).unwrap_or(0);
        let right_size = right_sibling.map(|id| self.node(id).len()).unwrap_or(0);

        if left_size == 0 && right_size == 0 {
            if self.node(node_id).is_empty() {
                log::debug!("b_plus_tree: root {node_id} emptied, collapsing");
                self.remove_root();
            }
            return;
        }
        if right_size > self.half_capacity {
            log::debug!("b_plus_tree: distributing right sibling into {node_id}");
            self.distribute(right_sibling.unwrap(), node_id, SourceIs::RightSibling, cmp);
            return;
        }
        if left_size > self.half_capacity {
            log::debug!("b_plus_tree: distributing left sibling into {node_id}");
            self.distribute(left_sibling.unwrap(), node_id, SourceIs::LeftSibling, cmp);
            return;
        }
        if right_size > 0 {
            log::debug!("b_plus_tree: merging right sibling into {node_id}");
            let parent = self.merge(right_sibling.unwrap(), node_id, cmp);
            self.balance(parent, cmp);
            return;
        }
        if left_size > 0 {
            log::debug!("b_plus_tree: merging {node_id} into left sibling");
            let parent = self.merge(node_id, left_sibling.unwrap(), cmp);
            self.balance(parent, cmp);
            return;
        }

        invariant_violation(format!("node {node_id} classified to no rebalance case"));
    }

    fn remove_root(&mut self) {
        let root = self
            .root
            .unwrap_or_else(|| invariant_violation("remove_root called without a root"));
        let new_root = self.node(root).left_most_child;
        self.root = new_root;
        if let Some(nr) = new_root {
            self.node_mut(nr).parent_node = None;
        } else {
            // The collapsing root had no child, i.e. it was an emptied leaf
            // root with no siblings — the tree is now empty.
            self.leftmost_leaf = None;
            self.rightmost_leaf = None;
        }
        self.free_node(root);
    }

    /// Splits an overfull node in two, promoting a separator key into its
    /// parent (creating a new root first if the node being split was the
    /// root). Returns the parent, which `balance` re-checks next.
    fn split(&mut self, node_id: NodeId, cmp: &C) -> NodeId {
        let is_leaf = self.node(node_id).is_leaf;
        let half = self.half_capacity;

        let right_list = self.node_mut(node_id).cells.split_at(half);
        let left_max_right_child = self.node(node_id).cells.last().and_then(|c| c.right_child);

        let right_id = self.alloc_node(is_leaf);
        if let Some(lmc) = left_max_right_child {
            self.node_mut(right_id).left_most_child = Some(lmc);
            self.node_mut(lmc).parent_node = Some(right_id);
        }
        self.set_cells(right_id, right_list);

        let old_right_sibling = self.node(node_id).right_sibling;
        self.node_mut(right_id).right_sibling = old_right_sibling;
        if let Some(orb) = old_right_sibling {
            self.node_mut(orb).left_sibling = Some(right_id);
        }
        self.node_mut(right_id).left_sibling = Some(node_id);
        self.node_mut(node_id).right_sibling = Some(right_id);

        if self.node(node_id).parent_node.is_none() {
            let new_root = self.alloc_node(false);
            self.set_left_most_child(new_root, node_id);
            self.root = Some(new_root);
        }

        let parent = self
            .node(node_id)
            .parent_node
            .unwrap_or_else(|| invariant_violation("split: node still has no parent"));
        self.node_mut(right_id).parent_node = Some(parent);

        let promoted_key = self
            .node(node_id)
            .cells
            .last()
            .unwrap_or_else(|| invariant_violation("split: left portion unexpectedly empty"))
            .key
            .clone();
        let cell_cmp = Self::cell_cmp(cmp);
        self.node_mut(parent)
            .cells
            .insert(Cell::internal(promoted_key.clone(), right_id), &cell_cmp);

        if is_leaf {
            if self.rightmost_leaf == Some(node_id) {
                self.rightmost_leaf = Some(right_id);
            }
        } else {
            let probe = Cell::probe(promoted_key);
            self.node_mut(node_id).cells.remove(&probe, &cell_cmp);
        }

        log::debug!("b_plus_tree: split {node_id} -> ({node_id}, {right_id}), promoted into {parent}");
        parent
    }

    /// Absorbs `source` into `target`. `source` is always the node to the
    /// right of `target` — `balance` swaps which of N/sibling plays which
    /// role before calling in here. Returns `source`'s former parent,
    /// which `balance` re-checks next.
    fn merge(&mut self, source: NodeId, target: NodeId, cmp: &C) -> NodeId {
        let cell_cmp = Self::cell_cmp(cmp);
        let (ep_node, ep_idx) = self.effective_parent_cell(source);
        let source_is_leaf = self.node(source).is_leaf;

        if !source_is_leaf {
            let ep_key = self.node(ep_node).cells.get(ep_idx).key.clone();
            let lmc = self
                .node(source)
                .left_most_child
                .unwrap_or_else(|| invariant_violation("merge: internal source missing left_most_child"));
            self.node_mut(target)
                .cells
                .insert(Cell::internal(ep_key, lmc), &cell_cmp);
        }

        let source_cells = std::mem::replace(&mut self.node_mut(source).cells, SortedList::new());
        self.node_mut(target).cells.merge_right_into_left(source_cells);
        self.reinforce_parentage(target);

        let source_right_sibling = self.node(source).right_sibling;
        self.node_mut(target).right_sibling = source_right_sibling;
        if let Some(rs) = source_right_sibling {
            self.node_mut(rs).left_sibling = Some(target);
        }

        let parent = self
            .node(source)
            .parent_node
            .unwrap_or_else(|| invariant_violation("merge: source has no parent"));

        if self.node(parent).left_most_child == Some(source) {
            let removed_key = self
                .node(parent)
                .cells
                .first()
                .unwrap_or_else(|| invariant_violation("merge: left-most-child source's parent has no cells"))
                .key
                .clone();
            let new_lmc = self.node(parent).cells.first().and_then(|c| c.right_child);
            self.node_mut(parent).cells.remove_at(0);
            if let Some(new_lmc) = new_lmc {
                self.set_left_most_child(parent, new_lmc);
            }
            self.node_mut(ep_node).cells.get_mut(ep_idx).key = removed_key;
        } else {
            let idx = self
                .node(parent)
                .cells
                .iter()
                .position(|c| c.right_child == Some(source))
                .unwrap_or_else(|| invariant_violation("merge: source missing from parent's cells"));
            self.node_mut(parent).cells.remove_at(idx);
        }

        if self.rightmost_leaf == Some(source) {
            self.rightmost_leaf = Some(target);
        }

        self.free_node(source);
        parent
    }

    /// Moves cells from an over-filled `source` into an under-filled
    /// `target`, updating the separator key between them. Strictly local:
    /// never propagates further up the tree.
    fn distribute(&mut self, source: NodeId, target: NodeId, source_is: SourceIs, cmp: &C) {
        let cell_cmp = Self::cell_cmp(cmp);

        let effective_node = match source_is {
            SourceIs::LeftSibling => target,
            SourceIs::RightSibling => source,
        };
        let (ep_node, ep_idx) = self.effective_parent_cell(effective_node);
        let ep_key = self.node(ep_node).cells.get(ep_idx).key.clone();

        let source_is_leaf = self.node(source).is_leaf;

        if !source_is_leaf {
            let right_child_node = match source_is {
                SourceIs::LeftSibling => self.node(target).left_most_child,
                SourceIs::RightSibling => self.node(source).left_most_child,
            };
            if let Some(rc) = right_child_node {
                self.node_mut(target)
                    .cells
                    .insert(Cell::internal(ep_key, rc), &cell_cmp);
            }
        }

        let source_len = self.node(source).len();
        let half = self.half_capacity;
        let split_after = match (source_is, source_is_leaf) {
            (SourceIs::RightSibling, _) => source_len - half - 1,
            (SourceIs::LeftSibling, false) => source_len - half + 1,
            (SourceIs::LeftSibling, true) => half - 1,
        };
        let split_right = self.node_mut(source).cells.split_at(split_after);

        let (moving, effective_lmc, replacement_key) = match source_is {
            SourceIs::LeftSibling => {
                let boundary = self
                    .node(source)
                    .cells
                    .last()
                    .unwrap_or_else(|| invariant_violation("distribute: left-sibling source empty after split"))
                    .clone();
                if !source_is_leaf {
                    let probe = Cell::probe(boundary.key.clone());
                    self.node_mut(source).cells.remove(&probe, &cell_cmp);
                }
                (split_right, boundary.right_child, boundary.key)
            }
            SourceIs::RightSibling => {
                let mut moving = std::mem::replace(&mut self.node_mut(source).cells, split_right);
                let boundary = moving
                    .last()
                    .unwrap_or_else(|| invariant_violation("distribute: right-sibling moving portion empty"))
                    .clone();
                if !source_is_leaf {
                    let probe = Cell::probe(boundary.key.clone());
                    moving.remove(&probe, &cell_cmp);
                }
                (moving, boundary.right_child, boundary.key)
            }
        };

        match source_is {
            SourceIs::LeftSibling => {
                if moving.len() > 0 {
                    moving.merge_left_into_right(&mut self.node_mut(target).cells);
                    self.reinforce_parentage(target);
                }
            }
            SourceIs::RightSibling => {
                if moving.len() > 0 {
                    self.node_mut(target).cells.merge_right_into_left(moving);
                    self.reinforce_parentage(target);
                }
            }
        }

        if !source_is_leaf {
            let lmc = effective_lmc
                .unwrap_or_else(|| invariant_violation("distribute: internal boundary cell missing right_child"));
            match source_is {
                SourceIs::LeftSibling => self.set_left_most_child(target, lmc),
                SourceIs::RightSibling => self.set_left_most_child(source, lmc),
            }
        }

        let final_key = if source_is == SourceIs::RightSibling && source_is_leaf {
            self.node(target)
                .cells
                .last()
                .unwrap_or_else(|| invariant_violation("distribute: target unexpectedly empty"))
                .key
                .clone()
        } else {
            replacement_key
        };
        self.node_mut(ep_node).cells.get_mut(ep_idx).key = final_key;

        log::debug!(
            "b_plus_tree: distributed {source}-as-{source_is:?} into {target}, separator updated at {ep_node}[{ep_idx}]"
        );
    }

    // ---------------------------------------------------------------
    // queries
    // ---------------------------------------------------------------

    pub fn search_key(&self, key: &K, mode: SearchMode) -> Option<&K> {
        let leaf = self.search_for_leaf(key)?;
        let probe = Cell::probe(key.clone());
        let cell_cmp = |a: &Cell<K, V>, b: &Cell<K, V>| (self.cmp)(&a.key, &b.key);
        let idx = self.node(leaf).cells.search_index(&probe, &cell_cmp, mode)?;
        Some(&self.node(leaf).cells.get(idx).key)
    }

    pub fn search_value(&self, key: &K, mode: SearchMode) -> Option<&V> {
        let leaf = self.search_for_leaf(key)?;
        let probe = Cell::probe(key.clone());
        let cell_cmp = |a: &Cell<K, V>, b: &Cell<K, V>| (self.cmp)(&a.key, &b.key);
        let idx = self.node(leaf).cells.search_index(&probe, &cell_cmp, mode)?;
        self.node(leaf).cells.get(idx).value.as_ref()
    }

    fn range_cells(
        &self,
        offset: u64,
        limit: Option<u64>,
        start: Option<&K>,
        end: Option<&K>,
        yield_dups: bool,
    ) -> Vec<&Cell<K, V>> {
        let start_leaf = match start {
            Some(k) => self.search_for_leaf(k),
            None => self.leftmost_leaf,
        };
        let end_leaf = match end {
            Some(k) => self.search_for_leaf(k),
            None => self.rightmost_leaf,
        };
        let (Some(mut current), Some(end_leaf)) = (start_leaf, end_leaf) else {
            return Vec::new();
        };

        let cell_cmp = |a: &Cell<K, V>, b: &Cell<K, V>| (self.cmp)(&a.key, &b.key);
        let start_probe = start.map(|k| Cell::probe(k.clone()));
        let end_probe = end.map(|k| Cell::probe(k.clone()));

        let mut skipped = 0u64;
        let mut out = Vec::new();
        loop {
            let node = self.node(current);
            for cell in node
                .cells
                .range_stream(&cell_cmp, start_probe.as_ref(), end_probe.as_ref(), yield_dups)
            {
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                if let Some(limit) = limit {
                    if out.len() as u64 >= limit {
                        return out;
                    }
                }
                out.push(cell);
            }
            if current == end_leaf {
                break;
            }
            current = match node.right_sibling {
                Some(next) => next,
                None => break,
            };
        }
        out
    }

    /// Ordered keys in `[start, end]`, skipping `offset` and stopping
    /// after `limit` (`None` = unbounded). Duplicates within a key are
    /// collapsed to one emission unless `yield_dups` is set.
    pub fn range_keys(
        &self,
        offset: u64,
        limit: Option<u64>,
        start: Option<&K>,
        end: Option<&K>,
        yield_dups: bool,
    ) -> Vec<K> {
        self.range_cells(offset, limit, start, end, yield_dups)
            .into_iter()
            .map(|c| c.key.clone())
            .collect()
    }

    /// Same pagination as [`Self::range_keys`] but over values.
    pub fn range_values(
        &self,
        offset: u64,
        limit: Option<u64>,
        start: Option<&K>,
        end: Option<&K>,
        yield_dups: bool,
    ) -> Vec<V> {
        self.range_cells(offset, limit, start, end, yield_dups)
            .into_iter()
            .filter_map(|c| c.value.clone())
            .collect()
    }

    fn find_cells<'a>(
        &'a self,
        predicate: &dyn Fn(&K) -> bool,
        bookmark: Option<&K>,
        yield_dups: bool,
        limit: Option<usize>,
    ) -> Vec<&'a Cell<K, V>> {
        let mut current = match bookmark {
            Some(k) => self.search_for_leaf(k),
            None => self.leftmost_leaf,
        };
        let mut skip_first = bookmark.is_some();
        let mut out = Vec::new();

        'outer: while let Some(node_id) = current {
            let node = self.node(node_id);
            for (cell, dup) in node.cells.iter_with_duplicates() {
                if !predicate(&cell.key) {
                    continue;
                }
                if skip_first {
                    skip_first = false;
                    continue;
                }
                let repeats = if yield_dups { dup + 1 } else { 1 };
                for _ in 0..repeats {
                    out.push(cell);
                    if let Some(limit) = limit {
                        if out.len() >= limit {
                            break 'outer;
                        }
                    }
                }
            }
            current = node.right_sibling;
        }
        out
    }

    /// A leaf-order scan across every leaf (or starting at the leaf
    /// containing `bookmark`), yielding every key for which `predicate`
    /// holds. When a bookmark is given, the first matching cell found is
    /// skipped once (matching the reference implementation's bookmark
    /// handling: it is not necessarily the bookmark itself).
    pub fn find_keys(&self, predicate: impl Fn(&K) -> bool, bookmark: Option<&K>, yield_dups: bool) -> Vec<K> {
        self.find_cells(&predicate, bookmark, yield_dups, None)
            .into_iter()
            .map(|c| c.key.clone())
            .collect()
    }

    /// Same as [`Self::find_keys`] but over values, with an optional cap
    /// on the number of results.
    pub fn find_values(
        &self,
        predicate: impl Fn(&K) -> bool,
        bookmark: Option<&K>,
        yield_dups: bool,
        limit: Option<usize>,
    ) -> Vec<V> {
        self.find_cells(&predicate, bookmark, yield_dups, limit)
            .into_iter()
            .filter_map(|c| c.value.clone())
            .collect()
    }

    /// The minimum key of the leaf holding the tree's size/2-th element,
    /// walking the leaf chain from `leftmost_leaf`.
    pub fn middle_key(&self) -> Option<&K> {
        let mut current = self.leftmost_leaf?;
        let half = self.size / 2;
        let mut count = 0u64;
        loop {
            let node = self.node(current);
            let advanced = count + node.len() as u64;
            if advanced < half {
                match node.right_sibling {
                    Some(next) => {
                        current = next;
                        count = advanced;
                    }
                    None => invariant_violation("middle_key: leaf chain exhausted before reaching size/2"),
                }
            } else {
                return node.cells.first().map(|c| &c.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use std::collections::BTreeMap as StdBTreeMap;

    fn new_tree() -> BPlusTree<i32, i32, fn(&i32, &i32) -> Ordering> {
        BPlusTree::new(4, i32::cmp as fn(&i32, &i32) -> Ordering).unwrap()
    }

    #[test]
    fn rejects_odd_or_small_node_size() {
        assert!(BPlusTree::<i32, i32, _>::new(5, i32::cmp as fn(&i32, &i32) -> Ordering).is_err());
        assert!(BPlusTree::<i32, i32, _>::new(2, i32::cmp as fn(&i32, &i32) -> Ordering).is_err());
        assert!(BPlusTree::<i32, i32, _>::new(4, i32::cmp as fn(&i32, &i32) -> Ordering).is_ok());
    }

    #[test]
    fn s1_split_on_ascending_insert() {
        let mut tree = new_tree();
        for k in [10, 20, 30, 40, 50] {
            tree.insert(k, k * 10);
        }
        assert_eq!(tree.size(), 5);
        assert_eq!(
            tree.range_keys(0, None, None, None, false),
            vec![10, 20, 30, 40, 50]
        );
        assert_eq!(tree.search_key(&30, SearchMode::Eq), Some(&30));
    }

    #[test]
    fn s2_duplicate_collapse() {
        let mut tree = new_tree();
        tree.insert(7, 1);
        tree.insert(7, 2);
        tree.insert(7, 3);
        assert_eq!(tree.size(), 3);
        assert_eq!(tree.range_keys(0, None, None, None, false), vec![7]);
        assert_eq!(tree.range_keys(0, None, None, None, true), vec![7, 7, 7]);
        assert_eq!(tree.search_value(&7, SearchMode::Eq), Some(&3));
    }

    #[test]
    fn s3_and_s4_merge_and_root_collapse() {
        let mut tree = new_tree();
        for k in [10, 20, 30, 40, 50] {
            tree.insert(k, k);
        }
        tree.delete(&40);
        tree.delete(&50);
        assert_eq!(tree.range_keys(0, None, None, None, false), vec![10, 20, 30]);

        tree.delete(&30);
        tree.delete(&20);
        assert_eq!(tree.range_keys(0, None, None, None, false), vec![10]);
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn s5_range_pagination() {
        let mut tree = new_tree();
        for k in 1..=10 {
            tree.insert(k, k);
        }
        assert_eq!(
            tree.range_keys(3, Some(4), Some(&2), Some(&9), false),
            vec![5, 6, 7, 8]
        );
    }

    #[test]
    fn s6_ordered_scan_survives_random_insert_order() {
        let mut keys: Vec<i32> = (1..=20).collect();
        keys.shuffle(&mut thread_rng());

        let mut tree = new_tree();
        for k in keys {
            tree.insert(k, k);
        }
        assert_eq!(
            tree.range_keys(0, None, None, None, false),
            (1..=20).collect::<Vec<_>>()
        );
    }

    #[test]
    fn find_keys_skips_exactly_the_bookmarked_match() {
        let mut tree = new_tree();
        for k in 1..=12 {
            tree.insert(k, k);
        }
        let even = |k: &i32| k % 2 == 0;
        let all_evens = tree.find_keys(even, None, false);
        assert_eq!(all_evens, vec![2, 4, 6, 8, 10, 12]);

        let from_four = tree.find_keys(even, Some(&4), false);
        assert_eq!(from_four, vec![6, 8, 10, 12]);
    }

    #[test]
    fn delete_then_insert_restores_size() {
        let mut tree = new_tree();
        for k in 1..=8 {
            tree.insert(k, k);
        }
        let before = tree.size();
        assert!(tree.delete(&42).is_none());
        assert_eq!(tree.delete(&5), Some((5, 0)));
        assert_eq!(tree.size(), before - 1);
        tree.insert(5, 5);
        assert_eq!(tree.size(), before);
    }

    #[test]
    fn randomized_insert_delete_preserves_leaf_chain_ordering() {
        let mut rng = thread_rng();
        let mut keys: Vec<i32> = (0..300).collect();
        keys.shuffle(&mut rng);

        let mut tree = BPlusTree::new(6, i32::cmp as fn(&i32, &i32) -> Ordering).unwrap();
        let mut model: StdBTreeMap<i32, i32> = StdBTreeMap::new();

        for &k in &keys {
            tree.insert(k, k * 2);
            model.insert(k, k * 2);
            assert_invariants(&tree);
        }
        assert_eq!(tree.size() as usize, model.len());
        assert_eq!(
            tree.range_keys(0, None, None, None, false),
            model.keys().copied().collect::<Vec<_>>()
        );

        let mut to_delete = keys.clone();
        to_delete.shuffle(&mut rng);
        for k in to_delete.into_iter().take(150) {
            tree.delete(&k);
            model.remove(&k);
            assert_invariants(&tree);
        }
        assert_eq!(tree.size() as usize, model.len());
        assert_eq!(
            tree.range_keys(0, None, None, None, false),
            model.keys().copied().collect::<Vec<_>>()
        );
        for (k, v) in &model {
            assert_eq!(tree.search_value(k, SearchMode::Eq), Some(v));
        }
    }

    #[test]
    fn randomized_full_drain_empties_tree_and_preserves_invariants() {
        let mut rng = thread_rng();
        let mut keys: Vec<i32> = (0..200).collect();
        keys.shuffle(&mut rng);

        let mut tree = BPlusTree::new(4, i32::cmp as fn(&i32, &i32) -> Ordering).unwrap();
        for &k in &keys {
            tree.insert(k, k);
            assert_invariants(&tree);
        }

        let mut delete_order = keys.clone();
        delete_order.shuffle(&mut rng);
        for k in delete_order {
            tree.delete(&k);
            assert_invariants(&tree);
        }

        assert_eq!(tree.size(), 0);
        assert!(tree.range_keys(0, None, None, None, false).is_empty());
        assert_eq!(tree.search_key(&0, SearchMode::Eq), None);
        assert_eq!(tree.middle_key(), None);

        // The arena must still be usable after draining to empty.
        tree.insert(1, 1);
        assert_invariants(&tree);
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.range_keys(0, None, None, None, false), vec![1]);
    }

    /// Walks the live tree and checks invariants 1-8 of the data model
    /// directly against the node arena, rather than only checking what
    /// queries return.
    fn assert_invariants(tree: &BPlusTree<i32, i32, fn(&i32, &i32) -> Ordering>) {
        assert_eq!(tree.max_node_size % 2, 0, "max_node_size must be even");
        assert!(tree.max_node_size >= 4, "max_node_size must be at least 4");
        assert_eq!(tree.half_capacity, tree.max_node_size / 2);

        let Some(root) = tree.root else {
            assert!(tree.leftmost_leaf.is_none(), "empty tree must clear leftmost_leaf");
            assert!(tree.rightmost_leaf.is_none(), "empty tree must clear rightmost_leaf");
            assert_eq!(tree.size, 0);
            return;
        };

        walk_subtree(tree, root, true, None, None, None);

        let mut current = tree
            .leftmost_leaf
            .expect("non-empty tree must have a leftmost leaf");
        assert!(
            tree.node(current).left_sibling.is_none(),
            "leftmost_leaf has a left sibling"
        );
        let mut total = 0u64;
        let mut last_key: Option<i32> = None;
        loop {
            let node = tree.node(current);
            assert!(node.is_leaf, "leaf chain must only contain leaves");
            for (cell, dup) in node.cells.iter_with_duplicates() {
                if let Some(last) = last_key {
                    assert!(last < cell.key, "leaf chain keys are not strictly ascending");
                }
                last_key = Some(cell.key);
                total += 1 + dup as u64;
            }
            match node.right_sibling {
                Some(next) => {
                    assert_eq!(
                        tree.node(next).left_sibling,
                        Some(current),
                        "sibling back-link mismatch"
                    );
                    current = next;
                }
                None => {
                    assert_eq!(Some(current), tree.rightmost_leaf, "chain end must be rightmost_leaf");
                    break;
                }
            }
        }
        assert_eq!(total, tree.size, "size must equal leaf cell count including duplicates");
    }

    /// Checks invariants 2, 3, 4 and 6 over a subtree, returning its
    /// `(min_key, max_key)` so the caller can check ordering against its
    /// own separators.
    fn walk_subtree(
        tree: &BPlusTree<i32, i32, fn(&i32, &i32) -> Ordering>,
        node_id: NodeId,
        is_root: bool,
        expected_parent: Option<NodeId>,
        lower: Option<i32>,
        upper: Option<i32>,
    ) -> (i32, i32) {
        let node = tree.node(node_id);
        assert_eq!(
            node.parent_node, expected_parent,
            "node {node_id} has a stale parent back-reference"
        );

        let len = node.len();
        if is_root {
            assert!(len <= tree.max_node_size, "root {node_id} exceeds max_node_size");
        } else {
            assert!(
                len >= tree.half_capacity && len <= tree.max_node_size,
                "node {node_id} size {len} violates half_capacity..=max_node_size"
            );
        }

        if node.is_leaf {
            assert!(!node.cells.is_empty(), "leaf {node_id} has no cells");
            let min = node.cells.first().unwrap().key;
            let max = node.cells.last().unwrap().key;
            if let Some(lo) = lower {
                assert!(min > lo, "leaf {node_id} min {min} must exceed lower bound {lo}");
            }
            if let Some(hi) = upper {
                assert!(max <= hi, "leaf {node_id} max {max} must not exceed upper bound {hi}");
            }
            (min, max)
        } else {
            let lmc = node
                .left_most_child
                .unwrap_or_else(|| panic!("internal node {node_id} missing left_most_child"));
            let separators: Vec<(i32, NodeId)> = node
                .cells
                .iter()
                .map(|c| {
                    (
                        c.key,
                        c.right_child
                            .unwrap_or_else(|| panic!("internal node {node_id} cell missing right_child")),
                    )
                })
                .collect();
            assert!(!separators.is_empty(), "internal node {node_id} has no cells");

            let first_sep = separators[0].0;
            let (overall_min, lmc_max) = walk_subtree(tree, lmc, false, Some(node_id), lower, Some(first_sep));
            assert!(
                lmc_max <= first_sep,
                "left_most_child of {node_id} overruns separator {first_sep}"
            );

            let mut overall_max = lmc_max;
            for (i, (key, child)) in separators.iter().enumerate() {
                let next_upper = separators.get(i + 1).map(|(k, _)| *k).or(upper);
                let (child_min, child_max) = walk_subtree(tree, *child, false, Some(node_id), Some(*key), next_upper);
                assert!(
                    child_min > *key,
                    "right_child of cell {key} in {node_id} has min {child_min} not greater than separator"
                );
                if let Some(next) = next_upper {
                    assert!(
                        child_max <= next,
                        "right_child of cell {key} in {node_id} overruns next separator {next}"
                    );
                }
                overall_max = child_max;
            }
            (overall_min, overall_max)
        }
    }
}
