use rand::seq::SliceRandom;
use rand::Rng;

use phylo_common::{CreationMethod, NodeId, TaxonId, TaxonNamespace, Tree};

use crate::SHORT_BRANCH_THRESHOLD;

/// Build a new ultrametric clade for `species` inside the backbone arena
/// and return its stem node, still detached and ready for the grafter.
///
/// `ages` carries one age per species: the oldest becomes the stem age, the
/// rest the crown divergences. Topology is grown one divergence at a time
/// under a uniformly chosen unsaturated older node, then the shuffled
/// species are attached in preorder wherever a slot is free. The result is
/// binary below the stem's single child, fully locked, and annotated as
/// synthesized.
pub fn create_clade<R: Rng>(
    tree: &mut Tree,
    ns: &TaxonNamespace,
    species: &[TaxonId],
    mut ages: Vec<f64>,
    rng: &mut R,
) -> NodeId {
    assert!(!species.is_empty());
    assert_eq!(
        ages.len(),
        species.len(),
        "need one branching time per species (stem included)"
    );
    ages.sort_by(|a, b| b.total_cmp(a));
    let mut ages = ages.into_iter();

    let stem = tree.new_node();
    let stem_age = ages.next().expect("ages cannot be empty here");
    tree.node_mut(stem).age = stem_age;

    if species.len() == 1 {
        let leaf = new_leaf(tree, ns, species[0]);
        tree.attach(stem, leaf);
        tree.node_mut(leaf).edge_length = stem_age;
        for id in [stem, leaf] {
            tree.node_mut(id).creation_method = Some(CreationMethod::CreateClade);
        }
        return stem;
    }

    let first_age = ages.next().expect("two or more species leave ages here");
    let first = tree.new_node();
    tree.node_mut(first).age = first_age;
    tree.attach(stem, first);
    tree.node_mut(first).edge_length = stem_age - first_age;

    for age in ages {
        let hosts: Vec<NodeId> = tree
            .preorder(stem)
            .into_iter()
            .filter(|id| {
                *id != stem && tree.children(*id).len() < 2 && tree.age(*id) > age
            })
            .collect();
        assert!(!hosts.is_empty(), "no host for divergence at age {age}");
        let host = hosts[rng.gen_range(0..hosts.len())];
        let child = tree.new_node();
        tree.node_mut(child).age = age;
        tree.attach(host, child);
        tree.node_mut(child).edge_length = tree.age(host) - age;
    }

    let mut pool: Vec<TaxonId> = species.to_vec();
    pool.shuffle(rng);
    for host in tree.preorder(stem) {
        if host == stem || tree.age(host) <= 0.0 {
            continue;
        }
        while tree.children(host).len() < 2 {
            let Some(taxon) = pool.pop() else { break };
            let leaf = new_leaf(tree, ns, taxon);
            tree.attach(host, leaf);
            tree.node_mut(leaf).edge_length = tree.age(host);
        }
    }
    assert!(pool.is_empty(), "species left over after filling the clade");
    assert_eq!(tree.leaf_count(stem), species.len());
    assert_eq!(tree.children(stem).len(), 1);

    for id in tree.preorder(stem) {
        tree.node_mut(id).creation_method = Some(CreationMethod::CreateClade);
    }
    assert!(tree.is_binary(first));
    tree.lock_clade(stem);

    let short = tree.short_edges_below(stem, SHORT_BRANCH_THRESHOLD).len();
    if short > 0 {
        log::warn!("{} short branches detected", short);
    }
    stem
}

fn new_leaf(tree: &mut Tree, ns: &TaxonNamespace, taxon: TaxonId) -> NodeId {
    let leaf = tree.new_node();
    let node = tree.node_mut(leaf);
    node.age = 0.0;
    node.label = Some(ns.label(taxon).to_string());
    node.taxon = Some(taxon);
    leaf
}
