use bitflags::bitflags;
use hashbrown::HashSet;

use crate::namespace::TaxonId;
use crate::TreeError;

bitflags! {
    #[derive(Default)]
    pub struct NodeFlags: u32 {
        /// The edge into this node must not be broken by later grafts.
        const EDGE_LOCKED = 0b1;
    }
}

/// How a node came to exist, recorded for nodes added by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMethod {
    FillNewTaxa,
    CreateClade,
}

impl CreationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CreationMethod::FillNewTaxa => "fill_new_taxa",
            CreationMethod::CreateClade => "create_clade",
        }
    }
}

/// Stable handle into a [`Tree`] arena. Handles are never invalidated:
/// nodes are added and re-linked, never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Time before present; 0 for extant tips.
    pub age: f64,
    /// Length of the edge into this node; meaningless on the root.
    pub edge_length: f64,
    /// Taxon name on tips, rank name on internals.
    pub label: Option<String>,
    /// Namespace handle, set on tips only.
    pub taxon: Option<TaxonId>,
    pub flags: NodeFlags,
    pub birth: Option<f64>,
    pub death: Option<f64>,
    pub creation_method: Option<CreationMethod>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn locked(&self) -> bool {
        self.flags.contains(NodeFlags::EDGE_LOCKED)
    }
}

/// Rooted tree over an arena of nodes. Parent and child references are
/// [`NodeId`] handles, so detaching and re-attaching subtrees is a couple
/// of index swaps and never touches unrelated edges.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree consisting of a single root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn age(&self, id: NodeId) -> f64 {
        self.nodes[id.0].age
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_leaf()
    }

    /// Add a detached node to the arena.
    pub fn new_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::default());
        id
    }

    /// Link `child` under `parent`. Edge length is left untouched; callers
    /// set it from ages (or file input) themselves.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        debug_assert!(self.nodes[child.0].parent.is_none());
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Unlink `child` from its parent without disturbing the lengths or
    /// order of any sibling edge.
    pub fn detach(&mut self, child: NodeId) {
        if let Some(p) = self.nodes[child.0].parent.take() {
            self.nodes[p.0].children.retain(|c| *c != child);
        }
    }

    /// Nodes of the subtree rooted at `from`, parents before children.
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.nodes[id.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Nodes of the subtree rooted at `from`, children before parents,
    /// siblings in their stored left-to-right order.
    pub fn postorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in &self.nodes[id.0].children {
                stack.push(*child);
            }
        }
        out.reverse();
        out
    }

    /// Ancestors of `from`, nearest first, root last.
    pub fn ancestors(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[from.0].parent;
        while let Some(id) = cur {
            out.push(id);
            cur = self.nodes[id.0].parent;
        }
        out
    }

    /// Child ends of every edge strictly below `from`.
    pub fn edges_below(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = self.preorder(from);
        out.retain(|id| *id != from);
        out
    }

    pub fn leaves(&self, from: NodeId) -> Vec<NodeId> {
        self.preorder(from)
            .into_iter()
            .filter(|id| self.is_leaf(*id))
            .collect()
    }

    pub fn leaf_count(&self, from: NodeId) -> usize {
        self.preorder(from)
            .into_iter()
            .filter(|id| self.is_leaf(*id))
            .count()
    }

    /// Taxon handles of every tip below (and including) `from`.
    pub fn tip_taxa(&self, from: NodeId) -> HashSet<TaxonId> {
        self.leaves(from)
            .into_iter()
            .filter_map(|id| self.nodes[id.0].taxon)
            .collect()
    }

    /// First node in preorder whose label equals `label`.
    pub fn find_by_label(&self, label: &str) -> Option<NodeId> {
        self.preorder(self.root)
            .into_iter()
            .find(|id| self.nodes[id.0].label.as_deref() == Some(label))
    }

    /// Ages of the internal nodes of the subtree at `from` (including
    /// `from` itself), sorted descending. For a tip this is the tip's own
    /// age, so a singleton clade still yields a usable age grid.
    pub fn subtree_internal_ages(&self, from: NodeId) -> Vec<f64> {
        if self.is_leaf(from) {
            return vec![self.nodes[from.0].age];
        }
        let mut ages: Vec<f64> = self
            .preorder(from)
            .into_iter()
            .filter(|id| !self.is_leaf(*id))
            .map(|id| self.nodes[id.0].age)
            .collect();
        ages.sort_by(|a, b| b.total_cmp(a));
        ages
    }

    /// Every internal node of the subtree has exactly two children.
    pub fn is_binary(&self, from: NodeId) -> bool {
        self.preorder(from)
            .into_iter()
            .all(|id| self.is_leaf(id) || self.nodes[id.0].children.len() == 2)
    }

    /// Recover node ages from edge lengths, bottom-up. Fails if root-to-tip
    /// paths below any node disagree by more than `precision`.
    pub fn ages_from_lengths(&mut self, precision: f64) -> Result<(), TreeError> {
        for id in self.postorder(self.root) {
            if self.is_leaf(id) {
                self.nodes[id.0].age = 0.0;
                continue;
            }
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for child in self.nodes[id.0].children.clone() {
                let a = self.nodes[child.0].age + self.nodes[child.0].edge_length;
                lo = lo.min(a);
                hi = hi.max(a);
            }
            if hi - lo > precision {
                return Err(TreeError::NotUltrametric {
                    label: self.describe(id),
                    spread: hi - lo,
                });
            }
            self.nodes[id.0].age = hi;
        }
        Ok(())
    }

    /// Check `age(parent) == age(child) + edge_length(child)` on every edge.
    pub fn validate_ultrametric(&self, tolerance: f64) -> Result<(), TreeError> {
        for id in self.edges_below(self.root) {
            let node = &self.nodes[id.0];
            let parent = node.parent.map(|p| self.nodes[p.0].age).unwrap_or(node.age);
            let spread = (parent - node.age - node.edge_length).abs();
            if spread > tolerance {
                return Err(TreeError::NotUltrametric {
                    label: self.describe(id),
                    spread,
                });
            }
        }
        Ok(())
    }

    /// Mark every edge strictly below `from` as locked. Locking is
    /// monotonic; there is no unlock.
    pub fn lock_clade(&mut self, from: NodeId) {
        for id in self.edges_below(from) {
            self.nodes[id.0].flags |= NodeFlags::EDGE_LOCKED;
        }
    }

    /// Every edge strictly below `from` is locked. Vacuously true on a tip,
    /// which is what routes singleton clades to their stem.
    pub fn is_fully_locked(&self, from: NodeId) -> bool {
        self.edges_below(from)
            .into_iter()
            .all(|id| self.nodes[id.0].locked())
    }

    /// Youngest child end among unlocked edges below `from`; 0 when every
    /// edge is locked.
    pub fn min_unlocked_age_below(&self, from: NodeId) -> f64 {
        let min = self
            .edges_below(from)
            .into_iter()
            .filter(|id| !self.nodes[id.0].locked())
            .map(|id| self.nodes[id.0].age)
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() {
            min
        } else {
            0.0
        }
    }

    /// Child ends of edges below `from` not longer than `threshold`.
    pub fn short_edges_below(&self, from: NodeId, threshold: f64) -> Vec<NodeId> {
        self.edges_below(from)
            .into_iter()
            .filter(|id| self.nodes[id.0].edge_length <= threshold)
            .collect()
    }

    /// Sort every child list by subtree size, smallest first. Stable, so
    /// equal-sized clades keep their construction order.
    pub fn ladderize(&mut self) {
        let mut sizes = vec![0usize; self.nodes.len()];
        for id in self.postorder(self.root) {
            sizes[id.0] = if self.is_leaf(id) {
                1
            } else {
                self.nodes[id.0]
                    .children
                    .iter()
                    .map(|c| sizes[c.0])
                    .sum()
            };
        }
        for node in &mut self.nodes {
            node.children.sort_by_key(|c| sizes[c.0]);
        }
    }

    /// Human-readable handle for diagnostics: the label if there is one.
    pub fn describe(&self, id: NodeId) -> String {
        match &self.nodes[id.0].label {
            Some(label) => label.clone(),
            None => format!("<unnamed node {} at age {}>", id, self.nodes[id.0].age),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::TaxonNamespace;
    use crate::parse_newick;

    fn three_taxon_tree() -> (Tree, TaxonNamespace) {
        let mut ns = TaxonNamespace::new();
        let mut tree = parse_newick("((A:1,B:1):1,C:2):0;", &mut ns).unwrap();
        tree.ages_from_lengths(1e-6).unwrap();
        (tree, ns)
    }

    #[test]
    fn test_ages_from_lengths() {
        let (tree, _) = three_taxon_tree();
        assert_eq!(tree.age(tree.root()), 2.0);
        let internal = tree
            .edges_below(tree.root())
            .into_iter()
            .find(|id| !tree.is_leaf(*id))
            .unwrap();
        assert_eq!(tree.age(internal), 1.0);
        tree.validate_ultrametric(1e-9).unwrap();
    }

    #[test]
    fn test_non_ultrametric_input_is_rejected() {
        let mut ns = TaxonNamespace::new();
        let mut tree = parse_newick("((A:1,B:1.5):1,C:2):0;", &mut ns).unwrap();
        assert!(matches!(
            tree.ages_from_lengths(1e-6),
            Err(TreeError::NotUltrametric { .. })
        ));
    }

    #[test]
    fn test_detach_preserves_sibling_edges() {
        let (mut tree, _ns) = three_taxon_tree();
        let a = tree.find_by_label("A").unwrap();
        let b = tree.find_by_label("B").unwrap();
        let before = tree.node(b).edge_length;
        tree.detach(a);
        assert_eq!(tree.node(b).edge_length, before);
        assert!(tree.parent(a).is_none());
        assert_eq!(tree.tip_taxa(tree.root()).len(), 2);
    }

    #[test]
    fn test_lock_is_monotonic_and_scoped() {
        let (mut tree, _) = three_taxon_tree();
        let a = tree.find_by_label("A").unwrap();
        let inner = tree.parent(a).unwrap();
        tree.lock_clade(inner);
        assert!(tree.node(a).locked());
        assert!(!tree.node(inner).locked());
        assert!(tree.is_fully_locked(inner));
        assert!(!tree.is_fully_locked(tree.root()));
    }

    #[test]
    fn test_min_unlocked_age() {
        let (mut tree, _) = three_taxon_tree();
        let a = tree.find_by_label("A").unwrap();
        let inner = tree.parent(a).unwrap();
        assert_eq!(tree.min_unlocked_age_below(tree.root()), 0.0);
        tree.lock_clade(tree.root());
        assert_eq!(tree.min_unlocked_age_below(tree.root()), 0.0);
        assert!(tree.is_fully_locked(inner));
    }

    #[test]
    fn test_postorder_visits_children_first() {
        let (tree, _) = three_taxon_tree();
        let order = tree.postorder(tree.root());
        let pos = |id: NodeId| order.iter().position(|x| *x == id).unwrap();
        for id in tree.edges_below(tree.root()) {
            assert!(pos(id) < pos(tree.parent(id).unwrap()));
        }
    }

    #[test]
    fn test_ladderize_orders_small_clades_first() {
        let (mut tree, _) = three_taxon_tree();
        tree.ladderize();
        let first = tree.children(tree.root())[0];
        assert!(tree.is_leaf(first));
    }

    #[test]
    fn test_subtree_internal_ages_of_tip_is_own_age() {
        let (tree, _) = three_taxon_tree();
        let a = tree.find_by_label("A").unwrap();
        assert_eq!(tree.subtree_internal_ages(a), vec![0.0]);
        assert_eq!(tree.subtree_internal_ages(tree.root()), vec![2.0, 1.0]);
    }
}
