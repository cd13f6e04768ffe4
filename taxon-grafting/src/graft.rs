use rand::Rng;

use phylo_common::{CreationMethod, NodeId, TaxonId, TaxonNamespace, Tree};

use crate::{GraftError, SHORT_BRANCH_THRESHOLD};

/// Attach the subtree rooted at `graft` (its age already set) somewhere in
/// the clade of `recipient`, keeping the tree ultrametric.
///
/// The splice point is an edge `(seed -> focal)` with
/// `focal.age <= graft.age <= seed.age` and no lock mark; with `stem` the
/// recipient's own incoming edge is also a candidate. One eligible edge is
/// picked uniformly, `focal` is detached without touching its siblings,
/// `graft` takes its place, and `focal` becomes a child of `graft`.
///
/// Returns the (possibly new) root of the recipient clade: `graft` itself
/// when the splice happened on the recipient's stem.
pub fn graft_node<R: Rng>(
    tree: &mut Tree,
    recipient: NodeId,
    graft: NodeId,
    stem: bool,
    rng: &mut R,
) -> Result<NodeId, GraftError> {
    let graft_age = tree.age(graft);
    let eligible = |id: NodeId| match tree.parent(id) {
        Some(parent) => {
            tree.age(id) <= graft_age && tree.age(parent) >= graft_age && !tree.node(id).locked()
        }
        None => false,
    };

    let mut candidates: Vec<NodeId> = tree
        .edges_below(recipient)
        .into_iter()
        .filter(|id| eligible(*id))
        .collect();
    if stem && eligible(recipient) {
        candidates.push(recipient);
    }
    if candidates.is_empty() {
        return Err(GraftError::UngraftableClade {
            recipient: tree.describe(recipient),
            graft: tree.describe(graft),
        });
    }

    let focal = candidates[rng.gen_range(0..candidates.len())];
    let seed = tree
        .parent(focal)
        .expect("eligible edges always have a parent end");

    let graft_length = tree.age(seed) - graft_age;
    let focal_length = graft_age - tree.age(focal);
    if graft_length < 0.0 || focal_length < 0.0 {
        return Err(GraftError::NegativeBranch {
            parent: tree.describe(seed),
            child: tree.describe(graft),
        });
    }

    tree.detach(focal);
    tree.attach(seed, graft);
    tree.node_mut(graft).edge_length = graft_length;
    tree.attach(graft, focal);
    tree.node_mut(focal).edge_length = focal_length;

    if tree.parent(recipient) == Some(graft) {
        Ok(graft)
    } else {
        Ok(recipient)
    }
}

/// Add one new tip lineage per entry of `new_taxa`, each branching off at
/// the matching time. With `stem` the grafts may land on the recipient's
/// stem edge (the recipient is first swapped for its parent, mirroring
/// where the eligible edges then live).
pub fn fill_new_taxa<R: Rng>(
    tree: &mut Tree,
    ns: &TaxonNamespace,
    node: NodeId,
    new_taxa: &[TaxonId],
    times: &[f64],
    stem: bool,
    rng: &mut R,
) -> Result<NodeId, GraftError> {
    assert_eq!(new_taxa.len(), times.len());
    let mut node = node;
    if stem {
        node = tree
            .parent(node)
            .ok_or_else(|| GraftError::UngraftableClade {
                recipient: tree.describe(node),
                graft: "stem lineage".to_string(),
            })?;
    }

    for (taxon, age) in new_taxa.iter().zip(times) {
        let attach_point = tree.new_node();
        {
            let n = tree.node_mut(attach_point);
            n.age = *age;
            n.creation_method = Some(CreationMethod::FillNewTaxa);
        }
        let leaf = tree.new_node();
        {
            let n = tree.node_mut(leaf);
            n.age = 0.0;
            n.label = Some(ns.label(*taxon).to_string());
            n.taxon = Some(*taxon);
        }
        tree.attach(attach_point, leaf);
        tree.node_mut(leaf).edge_length = *age;
        node = graft_node(tree, node, attach_point, stem, rng)?;
    }

    let short = tree.short_edges_below(node, SHORT_BRANCH_THRESHOLD).len();
    if short > 0 {
        log::warn!("{} short branches detected", short);
    }
    Ok(node)
}
