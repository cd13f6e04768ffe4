use rayon::prelude::*;

use branching_process::estimate_birth_death;
use phylo_common::{NodeId, TaxonNamespace, Tree};

use crate::fastmrca::FastMrca;
use crate::GraftError;

/// One row of the consistency report: how a taxonomy rank fares in the
/// backbone and in the simulated tree.
#[derive(Debug, Clone)]
pub struct TaxonCheckRow {
    pub taxon: String,
    pub taxonomy_tips: usize,
    pub backbone_tips: Option<usize>,
    pub simulated_tips: Option<usize>,
    pub backbone_monophyletic: bool,
    pub simulated_monophyletic: bool,
    pub backbone_birth: Option<f64>,
    pub backbone_death: Option<f64>,
    pub simulated_birth: Option<f64>,
    pub simulated_death: Option<f64>,
    pub warnings: String,
}

/// Cross-check a simulated tree against the backbone it grew from and the
/// taxonomy that guided the growth. Rows come back in taxonomy preorder;
/// node work is spread over the index pool in `chunksize` batches.
pub fn check_trees(
    taxonomy: &Tree,
    backbone: &Tree,
    simulated: &Tree,
    ns: &TaxonNamespace,
    cores: usize,
    chunksize: Option<usize>,
) -> Result<Vec<TaxonCheckRow>, GraftError> {
    let mut probe_rng = rand::rngs::mock::StepRng::new(0, 1);
    let backbone_index =
        FastMrca::new(backbone, ns, cores, Some(ns.len()), &mut probe_rng)?;
    let simulated_index =
        FastMrca::new(simulated, ns, cores, Some(ns.len()), &mut probe_rng)?;

    let seed = taxonomy.root();
    let ranks: Vec<NodeId> = taxonomy
        .edges_below(seed)
        .into_iter()
        .filter(|id| !taxonomy.is_leaf(*id) && taxonomy.node(*id).label.is_some())
        .collect();
    let nnodes = ranks.len();
    let chunksize = chunksize.unwrap_or_else(|| {
        let per_core = (nnodes + cores.max(1) - 1) / cores.max(1);
        (per_core / 10).max(5)
    });
    log::info!("checking {} nodes with chunks of {}", nnodes, chunksize);

    let rows = backbone_index.install(|| {
        ranks
            .par_iter()
            .with_min_len(chunksize)
            .map(|rank| {
                analyze_rank(
                    taxonomy,
                    backbone,
                    simulated,
                    &backbone_index,
                    &simulated_index,
                    *rank,
                )
            })
            .collect()
    });
    Ok(rows)
}

fn clade_summary(
    tree: &Tree,
    index: &FastMrca,
    mask: &fixedbitset::FixedBitSet,
    n_taxonomy: usize,
) -> (Option<usize>, Option<f64>, Option<f64>) {
    let Some(node) = index.strict_mrca(tree, mask) else {
        return (None, None, None);
    };
    let ntax = tree.leaf_count(node);
    let sampling = (ntax as f64 / n_taxonomy as f64).min(1.0);
    let est = estimate_birth_death(&tree.subtree_internal_ages(node), sampling);
    (Some(ntax), Some(est.birth), Some(est.death))
}

fn analyze_rank(
    taxonomy: &Tree,
    backbone: &Tree,
    simulated: &Tree,
    backbone_index: &FastMrca,
    simulated_index: &FastMrca,
    rank: NodeId,
) -> TaxonCheckRow {
    let taxon = taxonomy
        .node(rank)
        .label
        .clone()
        .unwrap_or_default();
    let species = taxonomy.tip_taxa(rank);
    let n_taxonomy = species.len();
    let mut warnings: Vec<&str> = vec![];

    let mut backbone_mask = backbone_index.bitmask_of_taxa(species.iter().copied());
    backbone_mask.intersect_with(&backbone_index.tree_mask(backbone));
    let sampled_in_backbone = backbone_mask.count_ones(..) > 0;
    let (backbone_tips, backbone_birth, backbone_death) = if sampled_in_backbone {
        clade_summary(backbone, backbone_index, &backbone_mask, n_taxonomy)
    } else {
        (Some(0), None, None)
    };
    if matches!(backbone_tips, Some(n) if n > n_taxonomy) {
        warnings.push("BACKBONE clade has more tips than the taxonomy suggests");
    }

    let mut simulated_mask = simulated_index.bitmask_of_taxa(species.iter().copied());
    simulated_mask.intersect_with(&simulated_index.tree_mask(simulated));
    let (simulated_tips, simulated_birth, simulated_death) =
        clade_summary(simulated, simulated_index, &simulated_mask, n_taxonomy);
    if matches!(simulated_tips, Some(n) if n > n_taxonomy) {
        warnings.push("SIMULATED clade has more tips than the taxonomy suggests");
    }

    let backbone_monophyletic = backbone_birth.is_some();
    let simulated_monophyletic = simulated_tips.is_some();
    if backbone_monophyletic && !simulated_monophyletic {
        warnings.push("BACKBONE and SIMULATED trees differ in monophyly for this taxon");
    }

    TaxonCheckRow {
        taxon,
        taxonomy_tips: n_taxonomy,
        backbone_tips,
        simulated_tips,
        backbone_monophyletic,
        simulated_monophyletic,
        backbone_birth,
        backbone_death,
        simulated_birth,
        simulated_death,
        warnings: warnings.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_common::parse_newick;

    #[test]
    fn test_rows_cover_labeled_ranks_in_order() {
        let mut ns = TaxonNamespace::new();
        let taxonomy = parse_newick("(((A,B)genus1,(C,D)genus2)family,E)order;", &mut ns).unwrap();
        let mut backbone = parse_newick("(((A:1,B:1):1,C:2.0):1,E:3);", &mut ns).unwrap();
        backbone.ages_from_lengths(1e-6).unwrap();
        let mut simulated =
            parse_newick("(((A:1,B:1):1,(C:1.5,D:1.5):0.5):1,E:3);", &mut ns).unwrap();
        simulated.ages_from_lengths(1e-6).unwrap();

        let rows = check_trees(&taxonomy, &backbone, &simulated, &ns, 2, None).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.taxon.as_str()).collect();
        assert_eq!(names, vec!["family", "genus1", "genus2"]);

        let genus1 = &rows[1];
        assert!(genus1.backbone_monophyletic);
        assert!(genus1.simulated_monophyletic);
        assert_eq!(genus1.backbone_tips, Some(2));
        assert_eq!(genus1.simulated_tips, Some(2));
        assert!(genus1.warnings.is_empty());

        // genus2 has a single backbone member (C): monophyly of a singleton
        // holds in both trees, and the simulated side has both tips
        let genus2 = &rows[2];
        assert_eq!(genus2.simulated_tips, Some(2));
    }

    #[test]
    fn test_unsampled_rank_reports_zero_backbone_tips() {
        let mut ns = TaxonNamespace::new();
        let taxonomy = parse_newick("(((A,B)genus1,(C,D)genus2)family,E)order;", &mut ns).unwrap();
        let mut backbone = parse_newick("((A:1,B:1):2,E:3);", &mut ns).unwrap();
        backbone.ages_from_lengths(1e-6).unwrap();
        let mut simulated =
            parse_newick("(((A:1,B:1):1,(C:1.5,D:1.5):0.5):1,E:3);", &mut ns).unwrap();
        simulated.ages_from_lengths(1e-6).unwrap();

        let rows = check_trees(&taxonomy, &backbone, &simulated, &ns, 1, Some(1)).unwrap();
        let genus2 = rows.iter().find(|r| r.taxon == "genus2").unwrap();
        assert_eq!(genus2.backbone_tips, Some(0));
        assert!(!genus2.backbone_monophyletic);
        assert!(genus2.simulated_monophyletic);
        assert!(genus2.backbone_birth.is_none());
    }
}
