use hashbrown::HashSet;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use phylo_common::{newick_string, parse_newick, NodeId, TaxonNamespace, Tree};
use taxon_grafting::{add_taxa, precompute_rates, FastMrca, RunContext};

fn load(taxonomy: &str, backbone: &str) -> (Tree, Tree, TaxonNamespace) {
    let mut ns = TaxonNamespace::new();
    let taxonomy = parse_newick(taxonomy, &mut ns).unwrap();
    ns.freeze();
    let mut backbone = parse_newick(backbone, &mut ns).unwrap();
    backbone.ages_from_lengths(1e-6).unwrap();
    (taxonomy, backbone, ns)
}

fn context(backbone: &Tree, ns: &TaxonNamespace, min_ccp: f64, seed: u64) -> RunContext<Pcg64> {
    let mut tune = Pcg64::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15);
    let mrca = FastMrca::new(backbone, ns, 2, Some(ns.len()), &mut tune).unwrap();
    RunContext::new(mrca, Pcg64::seed_from_u64(seed), min_ccp)
}

fn tip_labels(tree: &Tree) -> Vec<String> {
    let mut labels: Vec<String> = tree
        .leaves(tree.root())
        .into_iter()
        .filter_map(|id| tree.node(id).label.clone())
        .collect();
    labels.sort();
    labels
}

fn strict_clade(tree: &Tree, ns: &TaxonNamespace, labels: &[&str]) -> Option<NodeId> {
    let mut tune = Pcg64::seed_from_u64(0);
    let index = FastMrca::new(tree, ns, 1, Some(ns.len()), &mut tune).unwrap();
    let mask = index.bitmask_of_labels(ns, labels).unwrap();
    index.strict_mrca(tree, &mask)
}

#[test]
fn test_singleton_expansion() {
    // S1: D joins the clade containing A and B
    let (taxonomy, mut backbone, ns) = load("((A,B,D)genus,C)root;", "((A:1,B:1):1,C:2):0;");
    let mut ctx = context(&backbone, &ns, 0.0, 101);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();

    assert_eq!(tip_labels(&backbone), vec!["A", "B", "C", "D"]);
    backbone.validate_ultrametric(1e-9).unwrap();
    let d = backbone.find_by_label("D").unwrap();
    let parent = backbone.parent(d).unwrap();
    let age = backbone.age(parent);
    assert!(age > 0.0 && age <= 2.0, "D attached at age {age}");
    assert!(backbone.is_binary(backbone.root()));
}

#[test]
fn test_full_synthesis_of_missing_genus() {
    // S2: no tip of genus g exists; the family supplies the anchor
    let (taxonomy, mut backbone, ns) = load(
        "(((g1,g2,g3)genus_g,(x1,x2)genus_x)family,O)order;",
        "((x1:1,x2:1):1,O:2);",
    );
    let mut ctx = context(&backbone, &ns, 0.0, 7);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();

    assert_eq!(
        tip_labels(&backbone),
        vec!["O", "g1", "g2", "g3", "x1", "x2"]
    );
    backbone.validate_ultrametric(1e-9).unwrap();

    let stem = strict_clade(&backbone, &ns, &["g1", "g2", "g3"])
        .expect("synthesized genus must be monophyletic");
    for id in backbone.edges_below(stem) {
        assert!(backbone.node(id).locked(), "synthesized edge left unlocked");
    }
    assert!(backbone.is_binary(backbone.root()));
}

#[test]
fn test_monophyly_lock_survives_enclosing_rank() {
    // S3: genus_a is well sampled (3 of 4, ccp 0.83), so its fill happens
    // inside its own crown and the clade is locked; the later singleton
    // fill for genus_b must not break it
    let (taxonomy, mut backbone, ns) = load(
        "(((a1,a2,a3,a4)genus_a,(b1,b2)genus_b)family,O)order;",
        "((((a1:1,a2:1):0.5,a3:1.5):0.5,b1:2):1,O:3);",
    );
    let mut ctx = context(&backbone, &ns, 0.8, 13);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();

    assert_eq!(
        tip_labels(&backbone),
        vec!["O", "a1", "a2", "a3", "a4", "b1", "b2"]
    );
    assert!(
        strict_clade(&backbone, &ns, &["a1", "a2", "a3", "a4"]).is_some(),
        "genus_a was broken by a later insertion"
    );
    backbone.validate_ultrametric(1e-9).unwrap();
}

#[test]
fn test_stem_attachment_when_clade_is_locked() {
    // S4: the rank's only sampled tip R counts as fully locked, so the new
    // lineage must land on R's stem with a branching time below R's parent
    let (taxonomy, mut backbone, ns) = load(
        "(((R,R2)genus_r,S)family,O)order;",
        "((R:1,S:1):1,O:2);",
    );
    // S was locked by an earlier, already-finished rank
    let s = backbone.find_by_label("S").unwrap();
    backbone.node_mut(s).flags |= phylo_common::NodeFlags::EDGE_LOCKED;

    let mut ctx = context(&backbone, &ns, 0.8, 23);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();

    let r = backbone.find_by_label("R").unwrap();
    let r2 = backbone.find_by_label("R2").unwrap();
    let join = backbone.parent(r2).unwrap();
    assert_eq!(
        backbone.parent(r),
        Some(join),
        "R2 must branch off R's own stem"
    );
    let age = backbone.age(join);
    assert!(age > 0.0 && age <= 1.0, "stem time {age} outside (0, 1]");
    backbone.validate_ultrametric(1e-9).unwrap();
}

#[test]
fn test_sampling_backoff_memoizes_and_inserts() {
    // S5: genus_a has one sampled member; the tribe fails monophyly, the
    // family fails the ccp floor, and the seed rank finally anchors it
    let (taxonomy, mut backbone, ns) = load(
        "((((A,A2)genus_a,(B,B2)genus_b)tribe,(C,C2)genus_c)family,D)order;",
        "(((A:1,C:1):1,B:2):1,D:3);",
    );
    let mut ctx = context(&backbone, &ns, 0.8, 31);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();

    assert_eq!(
        tip_labels(&backbone),
        vec!["A", "A2", "B", "B2", "C", "C2", "D"]
    );
    let replacement = ctx
        .invalid
        .get("tribe")
        .expect("failed ancestor must be memoized");
    assert_eq!(
        taxonomy.node(*replacement).label.as_deref(),
        Some("order")
    );
    backbone.validate_ultrametric(1e-9).unwrap();
}

#[test]
fn test_identical_seeds_give_identical_trees() {
    // S6
    let run = |seed: u64| {
        let (taxonomy, mut backbone, ns) = load(
            "(((a1,a2,a3)genus_a,(b1,b2)genus_b)family,O)order;",
            "(((a1:1,a2:1):1,b1:2):1,O:3);",
        );
        let mut ctx = context(&backbone, &ns, 0.8, seed);
        precompute_rates(&ctx.mrca, &taxonomy, &mut backbone, 2).unwrap();
        add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();
        backbone.ladderize();
        newick_string(&backbone, true)
    };
    assert_eq!(run(99), run(99));
}

#[test]
fn test_complete_backbone_is_a_no_op() {
    // property 7: nothing to insert, nothing changes
    let (taxonomy, mut backbone, ns) = load(
        "(((A,B)genus,C)family,D)order;",
        "(((A:1,B:1):1,C:2):1,D:3);",
    );
    let before = newick_string(&backbone, true);
    let mut ctx = context(&backbone, &ns, 0.8, 55);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();
    assert_eq!(newick_string(&backbone, true), before);
}

#[test]
fn test_every_taxonomy_tip_appears_exactly_once() {
    // invariant 1 across a run that mixes fill and synthesis
    let (taxonomy, mut backbone, ns) = load(
        "(((g1,g2,g3)genus_g,(x1,x2)genus_x)family,O)order;",
        "((x1:1,x2:1):1,O:2);",
    );
    let expected: HashSet<String> = taxonomy
        .leaves(taxonomy.root())
        .into_iter()
        .filter_map(|id| taxonomy.node(id).label.clone())
        .collect();
    let mut ctx = context(&backbone, &ns, 0.0, 3);
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx).unwrap();
    let labels = tip_labels(&backbone);
    let unique: HashSet<String> = labels.iter().cloned().collect();
    assert_eq!(labels.len(), unique.len(), "duplicated tip label");
    assert!(expected.is_subset(&unique));
    // no negative edges anywhere
    for id in backbone.edges_below(backbone.root()) {
        assert!(backbone.node(id).edge_length >= 0.0);
    }
}
