use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use rayon::prelude::*;

use branching_process::estimate_birth_death;
use phylo_common::{NodeId, Tree};

use crate::fastmrca::FastMrca;
use crate::GraftError;

/// Estimate birth and death rates for every labeled taxonomy rank whose
/// extant members resolve to a backbone MRCA, and annotate that backbone
/// node with them. Already-annotated nodes are left alone, so re-running
/// on an annotated backbone is a no-op.
///
/// Work is balanced into `max(cores / 4, 2)` buckets by largest-processing-
/// time against per-rank leaf counts; each bucket runs as one job on the
/// index's pool. Workers only read the trees; all writes happen here after
/// the join.
pub fn precompute_rates(
    mrca: &FastMrca,
    taxonomy: &Tree,
    backbone: &mut Tree,
    cores: usize,
) -> Result<(), GraftError> {
    let seed = taxonomy.root();
    let ranks: Vec<(usize, NodeId)> = taxonomy
        .edges_below(seed)
        .into_iter()
        .filter(|id| !taxonomy.is_leaf(*id) && taxonomy.node(*id).label.is_some())
        .map(|id| (taxonomy.leaf_count(id), id))
        .collect();

    let nbuckets = (cores / 4).max(2);
    let mut buckets: Vec<Vec<NodeId>> = vec![vec![]; nbuckets];
    let mut loads: BinaryHeap<Reverse<(usize, usize)>> =
        (0..nbuckets).map(|i| Reverse((0, i))).collect();
    let mut by_size = ranks;
    by_size.sort_by_key(|(ntips, id)| (Reverse(*ntips), *id));
    for (ntips, id) in by_size {
        let Reverse((load, bucket)) = loads.pop().expect("bucket heap is never empty");
        buckets[bucket].push(id);
        loads.push(Reverse((load + ntips, bucket)));
    }
    buckets.sort_by_key(|b| b.len());
    log::debug!(
        "parallel worker assignments ({} buckets): {:?}",
        nbuckets,
        buckets.iter().map(|b| b.len()).collect::<Vec<_>>()
    );

    let backbone_mask = mrca.tree_mask(backbone);
    let start = Instant::now();
    let results: Vec<Vec<(NodeId, f64, f64)>> = mrca.install(|| {
        buckets
            .par_iter()
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|rank| {
                        let mut mask = mrca.bitmask_of_taxa(
                            taxonomy.tip_taxa(*rank).into_iter(),
                        );
                        mask.intersect_with(&backbone_mask);
                        let node = mrca.mrca(backbone, &mask)?;
                        let n_total = taxonomy.leaf_count(*rank);
                        let n_extant = backbone.leaf_count(node);
                        let sampling = (n_extant as f64 / n_total as f64).min(1.0);
                        let est = estimate_birth_death(
                            &backbone.subtree_internal_ages(node),
                            sampling,
                        );
                        Some((node, est.birth, est.death))
                    })
                    .collect()
            })
            .collect()
    });

    let mut annotated = 0usize;
    for (node, birth, death) in results.into_iter().flatten() {
        let n = backbone.node_mut(node);
        if n.birth.is_none() {
            n.birth = Some(birth);
            n.death = Some(death);
            annotated += 1;
        }
    }
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 5.0 {
        log::info!("rate precompute: {:.1} seconds", elapsed);
    }
    log::debug!("annotated {annotated} backbone nodes with birth/death rates");
    Ok(())
}
