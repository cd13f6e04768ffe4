use hashbrown::HashSet;
use itertools::Itertools;
use rand::Rng;

use branching_process::{branching_times, crown_capture_probability, estimate_birth_death};
use phylo_common::{NodeId, TaxonId, TaxonNamespace, Tree};

use crate::context::RunContext;
use crate::graft::{fill_new_taxa, graft_node};
use crate::synthesize::create_clade;
use crate::GraftError;

/// Graft every taxonomy tip that is missing from the backbone, mutating the
/// backbone in place.
///
/// Labeled taxonomy ranks are visited postorder (seed excluded), so genera
/// are settled before the families that contain them. Ranks with no sampled
/// member are parked as deferred full clades and synthesized once an
/// enclosing rank with sampled, monophyletic members comes up; partially
/// sampled monophyletic ranks are filled tip by tip and then locked.
pub fn add_taxa<R: Rng>(
    backbone: &mut Tree,
    taxonomy: &Tree,
    ns: &TaxonNamespace,
    ctx: &mut RunContext<R>,
) -> Result<(), GraftError> {
    let all_tips = taxonomy.tip_taxa(taxonomy.root());
    let mut tree_tips = backbone.tip_taxa(backbone.root());
    log::info!(
        "{} tips to add",
        all_tips.difference(&tree_tips).count()
    );

    let mut full_clades: HashSet<String> = HashSet::new();
    let seed = taxonomy.root();
    let order: Vec<NodeId> = taxonomy
        .postorder(seed)
        .into_iter()
        .filter(|id| *id != seed && !taxonomy.is_leaf(*id))
        .collect();

    'ranks: for tax_node in order {
        let Some(taxon) = taxonomy.node(tax_node).label.clone() else {
            continue;
        };
        let pad = "  ".repeat(taxonomy.ancestors(tax_node).len());
        let species = taxonomy.tip_taxa(tax_node);
        let mut extant: HashSet<TaxonId> =
            species.intersection(&tree_tips).copied().collect();
        log::info!(
            "{}{} ({}/{})... ({} remain)",
            pad,
            taxon,
            extant.len(),
            species.len(),
            all_tips.difference(&tree_tips).count()
        );

        if extant.is_empty() {
            // nothing sampled: park the whole rank for an enclosing one
            full_clades.insert(taxon);
            continue;
        }
        if extant == species {
            log::debug!("{}  => all species accounted for", pad);
            continue;
        }

        let extant_mask = ctx.mrca.bitmask_of_taxa(extant.iter().copied());
        let Some(mut node) = ctx.mrca.strict_mrca(backbone, &extant_mask) else {
            log::info!("{}  => not monophyletic", pad);
            continue;
        };

        // deferred full clades strictly under this rank, smallest first so
        // genera graft before the families around them
        let pending: Vec<(usize, String, NodeId)> = taxonomy
            .postorder(tax_node)
            .into_iter()
            .filter(|id| *id != tax_node && !taxonomy.is_leaf(*id))
            .filter_map(|id| {
                let label = taxonomy.node(id).label.as_ref()?;
                full_clades
                    .contains(label)
                    .then(|| (taxonomy.leaf_count(id), label.clone(), id))
            })
            .sorted()
            .collect();

        for (clade_size, clade, clade_node) in pending {
            let full_species = taxonomy.tip_taxa(clade_node);
            if full_species.is_subset(&tree_tips) {
                log::info!(
                    "{}  => skipping {} as all species already present in tree",
                    pad,
                    clade
                );
                full_clades.remove(&clade);
                continue;
            }
            let t_young = backbone.min_unlocked_age_below(node);
            let (_, _, _, mut times) = match new_branching_times(
                ctx,
                backbone,
                taxonomy,
                node,
                tax_node,
                None,
                t_young,
                Some(full_species.len()),
            ) {
                Ok(drawn) => drawn,
                Err(e @ GraftError::AncestorChainExhausted { .. }) => {
                    log::warn!("{e}");
                    continue 'ranks;
                }
                Err(e) => return Err(e),
            };
            log::info!("{}  => adding {} (n={})", pad, clade, clade_size);

            let fully_locked = backbone.is_fully_locked(node);
            if fully_locked {
                log::info!("{}  => {} is fully locked, attaching to stem", pad, taxon);
                let stem_old = backbone
                    .parent(node)
                    .map(|p| backbone.age(p))
                    .unwrap_or_else(|| backbone.age(node));
                let (_, _, _, stem_times) = match new_branching_times(
                    ctx,
                    backbone,
                    taxonomy,
                    node,
                    tax_node,
                    Some(stem_old),
                    backbone.age(node),
                    Some(1),
                ) {
                    Ok(drawn) => drawn,
                    Err(e @ GraftError::AncestorChainExhausted { .. }) => {
                        log::warn!("{e}");
                        continue 'ranks;
                    }
                    Err(e) => return Err(e),
                };
                // the stem draw replaces the oldest crown draw
                times.sort_by(f64::total_cmp);
                times.pop();
                times.extend(stem_times);
            }

            let mut members: Vec<TaxonId> = full_species.iter().copied().collect();
            members.sort();
            let clade_root = create_clade(backbone, ns, &members, times, &mut ctx.rng);
            node = graft_node(backbone, node, clade_root, fully_locked, &mut ctx.rng)?;
            ctx.mrca.encode(backbone);
            tree_tips = backbone.tip_taxa(backbone.root());
            extant = species.intersection(&tree_tips).copied().collect();
            full_clades.remove(&clade);
            assert!(backbone.is_binary(node));
        }

        if extant == species {
            // every member arrived with the grafted clades
            backbone.lock_clade(node);
            continue;
        }

        let mut missing: Vec<TaxonId> = species.difference(&tree_tips).copied().collect();
        missing.sort();
        log::info!("{}  => adding {} new species", pad, missing.len());

        let extant_mask = ctx.mrca.bitmask_of_taxa(extant.iter().copied());
        let Some(node) = ctx.mrca.strict_mrca(backbone, &extant_mask) else {
            log::warn!(
                "{} is no longer monophyletic after grafting; skipping its fill",
                taxon
            );
            continue;
        };
        let t_young = backbone.min_unlocked_age_below(node);
        let (_, _, ccp, times) = match new_branching_times(
            ctx, backbone, taxonomy, node, tax_node, None, t_young, None,
        ) {
            Ok(drawn) => drawn,
            Err(e @ GraftError::AncestorChainExhausted { .. }) => {
                log::warn!("{e}");
                continue;
            }
            Err(e) => return Err(e),
        };
        assert_eq!(times.len(), missing.len());
        fill_new_taxa(
            backbone,
            ns,
            node,
            &missing,
            &times,
            ccp < ctx.min_ccp,
            &mut ctx.rng,
        )?;
        ctx.mrca.encode(backbone);
        tree_tips = backbone.tip_taxa(backbone.root());
        // lock the completed rank where it ended up monophyletic; a stem
        // fill may have dropped the new tip next to an interloper, and a
        // lock there would fence off lineages outside the rank
        let species_mask = ctx.mrca.bitmask_of_taxa(species.iter().copied());
        if let Some(crown) = ctx.mrca.strict_mrca(backbone, &species_mask) {
            backbone.lock_clade(crown);
            assert!(backbone.is_binary(crown));
        }
    }

    for clade in full_clades.iter().sorted() {
        log::warn!("clade {clade} had no sampled enclosing rank and was not inserted");
    }
    assert!(backbone.is_binary(backbone.root()));
    Ok(())
}

/// Draw `num` new branching times anchored at `backbone_node`, estimating
/// (or reusing) that clade's birth and death rates on the way.
///
/// When the anchor is too thin to estimate from (two or fewer sampled tips,
/// or crown capture below the floor), the taxonomy ancestor chain is walked
/// until a monophyletic, well-captured rank takes over; ancestors that
/// failed are memoized for the rest of the run. The times themselves are
/// always drawn on the original anchor's age grid.
#[allow(clippy::too_many_arguments)]
fn new_branching_times<R: Rng>(
    ctx: &mut RunContext<R>,
    backbone: &mut Tree,
    taxonomy: &Tree,
    backbone_node: NodeId,
    tax_node: NodeId,
    t_old: Option<f64>,
    t_young: f64,
    num: Option<usize>,
) -> Result<(f64, f64, f64, Vec<f64>), GraftError> {
    let origin = backbone_node;
    let mut backbone_node = backbone_node;
    let mut tax_node = tax_node;
    let mut n_extant = backbone.leaf_count(backbone_node);
    let mut n_total = taxonomy.leaf_count(tax_node);
    let num = num.unwrap_or_else(|| n_total.saturating_sub(n_extant));
    let ccp = crown_capture_probability(n_total, n_extant.min(n_total));
    let mut ccp_now = ccp;

    let tree_tips = backbone.tip_taxa(backbone.root());
    while n_extant <= 2 || ccp_now < ctx.min_ccp {
        log::debug!(
            "backtracking from {} due to poor sampling",
            taxonomy.describe(tax_node)
        );
        let (tax_target, backbone_target) =
            search_ancestors(ctx, taxonomy, backbone, tax_node, &tree_tips)?;
        tax_node = tax_target;
        backbone_node = backbone_target;
        n_extant = backbone.leaf_count(backbone_node);
        n_total = taxonomy.leaf_count(tax_node);
        ccp_now = crown_capture_probability(n_total, n_extant.min(n_total));
    }

    let sampling = (n_extant as f64 / n_total as f64).min(1.0);
    let anchor = backbone.node(backbone_node);
    let (birth, death) = match (anchor.birth, anchor.death) {
        (Some(birth), Some(death)) => (birth, death),
        _ => {
            log::debug!(
                "cache miss on birth/death rates for {}",
                taxonomy.describe(tax_node)
            );
            let est = estimate_birth_death(
                &backbone.subtree_internal_ages(backbone_node),
                sampling,
            );
            let anchor = backbone.node_mut(backbone_node);
            anchor.birth = Some(est.birth);
            anchor.death = Some(est.death);
            (est.birth, est.death)
        }
    };

    let mut t_old = t_old;
    if ccp < ctx.min_ccp && t_old.is_some() {
        if let Some(parent) = backbone.parent(origin) {
            t_old = Some(backbone.age(parent));
        }
    }
    if backbone.leaf_count(origin) == 1 && t_old.is_none() {
        // a lone sampled tip gives no crown; use its stem instead
        if let Some(parent) = backbone.parent(origin) {
            t_old = Some(backbone.age(parent));
        }
    }

    let times = branching_times(
        &mut ctx.rng,
        &backbone.subtree_internal_ages(origin),
        birth,
        death,
        num,
        t_old,
        t_young,
    )?;
    Ok((birth, death, ccp, times))
}

/// Walk up the taxonomy from `from` to the first ancestor whose sampled
/// members are monophyletic in the backbone and whose crown capture clears
/// the floor. Failed ancestors are memoized in `ctx.invalid` (label of the
/// failure, replacement that finally worked).
fn search_ancestors<R: Rng>(
    ctx: &mut RunContext<R>,
    taxonomy: &Tree,
    backbone: &Tree,
    from: NodeId,
    backbone_tips: &HashSet<TaxonId>,
) -> Result<(NodeId, NodeId), GraftError> {
    let mut seen: Vec<Option<String>> = vec![];
    let mut target: Option<(NodeId, NodeId)> = None;

    for anc in taxonomy.ancestors(from) {
        let mut anc = anc;
        if let Some(label) = &taxonomy.node(anc).label {
            if let Some(replacement) = ctx.invalid.get(label) {
                log::debug!(
                    "cache hit on backoff map: {} => {}",
                    label,
                    taxonomy.describe(*replacement)
                );
                anc = *replacement;
            }
        }
        let full = taxonomy.tip_taxa(anc);
        let extant: Vec<TaxonId> = full
            .intersection(backbone_tips)
            .copied()
            .collect();
        let mask = ctx.mrca.bitmask_of_taxa(extant.iter().copied());
        seen.push(taxonomy.node(anc).label.clone());
        let Some(found) = ctx.mrca.strict_mrca(backbone, &mask) else {
            log::debug!("...{} not monophyletic...", taxonomy.describe(anc));
            continue;
        };
        let ccp = crown_capture_probability(full.len(), extant.len().min(full.len()));
        if ccp < ctx.min_ccp {
            log::debug!(
                "...{} fails crown threshold ({} < {})...",
                taxonomy.describe(anc),
                ccp,
                ctx.min_ccp
            );
            continue;
        }
        log::debug!("...got valid node: {}", taxonomy.describe(anc));
        target = Some((anc, found));
        break;
    }

    let Some((tax_target, backbone_target)) = target else {
        return Err(GraftError::AncestorChainExhausted {
            taxon: taxonomy.describe(from),
            chain: seen
                .iter()
                .map(|l| l.as_deref().unwrap_or("<unnamed rank>"))
                .join(" => "),
        });
    };

    // everything tried before the hit redirects there from now on
    seen.pop();
    for label in seen.into_iter().flatten() {
        ctx.invalid.insert(label, tax_target);
    }
    Ok((tax_target, backbone_target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastmrca::FastMrca;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    use phylo_common::parse_newick;

    fn context(backbone: &Tree, ns: &TaxonNamespace, min_ccp: f64) -> RunContext<Pcg64> {
        let mut tune = Pcg64::seed_from_u64(99);
        let mrca = FastMrca::new(backbone, ns, 2, Some(ns.len()), &mut tune).unwrap();
        RunContext::new(mrca, Pcg64::seed_from_u64(4), min_ccp)
    }

    #[test]
    fn test_backoff_memoizes_failed_ancestors() {
        let mut ns = TaxonNamespace::new();
        let taxonomy = parse_newick(
            "((((A,A2)genus_a,(B,B2)genus_b)tribe,(C,C2)genus_c)family,D)order;",
            &mut ns,
        )
        .unwrap();
        let mut backbone = parse_newick("(((A:1,C:1):1,B:2):1,D:3);", &mut ns).unwrap();
        backbone.ages_from_lengths(1e-6).unwrap();
        let mut ctx = context(&backbone, &ns, 0.0);
        let tips = backbone.tip_taxa(backbone.root());

        // genus_a has one sampled member; its parent "tribe" restricts to
        // {A, B} which is paraphyletic here, so the search must land on
        // "family" and memoize the tribe
        let genus_a = taxonomy.find_by_label("genus a").unwrap();
        let (tax_target, _) =
            search_ancestors(&mut ctx, &taxonomy, &backbone, genus_a, &tips).unwrap();
        assert_eq!(
            taxonomy.node(tax_target).label.as_deref(),
            Some("family")
        );
        assert_eq!(ctx.invalid.get("tribe"), Some(&tax_target));
        assert!(!ctx.invalid.contains_key("family"));
    }

    #[test]
    fn test_exhausted_chain_is_an_error() {
        let mut ns = TaxonNamespace::new();
        // "family" restricts to a paraphyletic set, and the seed rank (the
        // only monophyletic ancestor) misses the crown-capture floor
        // because E was never sampled
        let taxonomy =
            parse_newick("(((A,B)genus,C)family,(D,E)genus_d)order;", &mut ns).unwrap();
        let mut backbone = parse_newick("(((A:1,D:1):1,B:2):1,C:3);", &mut ns).unwrap();
        backbone.ages_from_lengths(1e-6).unwrap();
        let mut ctx = context(&backbone, &ns, 0.95);
        let tips = backbone.tip_taxa(backbone.root());
        let genus = taxonomy.find_by_label("genus").unwrap();
        let result = search_ancestors(&mut ctx, &taxonomy, &backbone, genus, &tips);
        assert!(matches!(
            result,
            Err(GraftError::AncestorChainExhausted { .. })
        ));
    }
}
