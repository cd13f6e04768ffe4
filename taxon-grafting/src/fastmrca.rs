use std::time::Instant;

use fixedbitset::FixedBitSet;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use phylo_common::{NodeId, TaxonId, TaxonNamespace, Tree};

use crate::GraftError;

/// Smallest wall-clock win (seconds) that justifies the parallel bitmask
/// path for a given query size.
const PARALLEL_ADVANTAGE_SECS: f64 = 0.75;

/// Bitmask MRCA service over a backbone tree.
///
/// Every taxon owns one bit (its `TaxonId`), a query label set becomes the
/// OR of its bits, and each backbone node carries the mask of its subtended
/// tips. Resolution descends from the root into whichever child still
/// covers the query, so a lookup is O(depth) once the mask is built. Mask
/// construction is the expensive part for huge queries and is what the
/// serial/parallel switch tunes.
///
/// The index stays valid across insertions because the engine re-encodes it
/// after every mutation batch and never queries a tip before grafting it.
pub struct FastMrca {
    cores: usize,
    pool: rayon::ThreadPool,
    nbits: usize,
    maxtax: usize,
    parallel: bool,
    leafsets: Vec<FixedBitSet>,
}

impl FastMrca {
    /// Build the index for `tree`. With `max_singlethread_taxa` given the
    /// cutoff is taken as-is; otherwise it is autotuned by timing both
    /// paths on random label batches drawn from `tune_rng` (a private
    /// stream, so probe counts cannot shift the simulation's draws).
    pub fn new<R: Rng>(
        tree: &Tree,
        ns: &TaxonNamespace,
        cores: usize,
        max_singlethread_taxa: Option<usize>,
        tune_rng: &mut R,
    ) -> Result<Self, GraftError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cores)
            .build()?;
        let mut index = Self {
            cores: cores.max(1),
            pool,
            nbits: ns.len(),
            maxtax: ns.len(),
            parallel: false,
            leafsets: vec![],
        };
        index.encode(tree);
        match max_singlethread_taxa {
            Some(n) => {
                index.maxtax = n.min(ns.len());
                index.parallel = n < ns.len();
            }
            None => index.autotune(ns, tune_rng)?,
        }
        log::info!(
            "single-thread bitmask cutoff is {} taxa (parallel path {})",
            index.maxtax,
            if index.parallel { "enabled" } else { "disabled" }
        );
        Ok(index)
    }

    /// Recompute every node's leafset mask. Must be called after each batch
    /// of mutations to the indexed tree.
    pub fn encode(&mut self, tree: &Tree) {
        self.leafsets = vec![FixedBitSet::with_capacity(self.nbits); tree.len()];
        for id in tree.postorder(tree.root()) {
            let mut mask = FixedBitSet::with_capacity(self.nbits);
            let node = tree.node(id);
            if node.is_leaf() {
                if let Some(taxon) = node.taxon {
                    mask.insert(taxon.bit());
                }
            } else {
                for child in &node.children {
                    mask.union_with(&self.leafsets[child.index()]);
                }
            }
            self.leafsets[id.index()] = mask;
        }
    }

    /// Mask of every tip currently in the indexed tree.
    pub fn tree_mask(&self, tree: &Tree) -> FixedBitSet {
        self.leafsets[tree.root().index()].clone()
    }

    /// OR the bits of already-resolved taxon handles. Cheap; no label
    /// lookups, no parallel path.
    pub fn bitmask_of_taxa(&self, taxa: impl IntoIterator<Item = TaxonId>) -> FixedBitSet {
        let mut mask = FixedBitSet::with_capacity(self.nbits);
        for taxon in taxa {
            mask.insert(taxon.bit());
        }
        mask
    }

    /// Resolve labels against the namespace and OR their bits, switching to
    /// the tuned parallel fold for large queries.
    pub fn bitmask_of_labels(
        &self,
        ns: &TaxonNamespace,
        labels: &[&str],
    ) -> Result<FixedBitSet, GraftError> {
        if self.parallel && labels.len() >= self.maxtax {
            let start = Instant::now();
            let mask = self.parallel_mask(ns, labels)?;
            log::debug!(
                "parallel bitmask: n={}, t={:.1}s",
                labels.len(),
                start.elapsed().as_secs_f64()
            );
            Ok(mask)
        } else {
            self.serial_mask(ns, labels)
        }
    }

    fn serial_mask(&self, ns: &TaxonNamespace, labels: &[&str]) -> Result<FixedBitSet, GraftError> {
        let mut mask = FixedBitSet::with_capacity(self.nbits);
        for label in labels {
            let taxon = ns
                .get(label)
                .ok_or_else(|| GraftError::UnknownTaxon(label.to_string()))?;
            mask.insert(taxon.bit());
        }
        Ok(mask)
    }

    fn parallel_mask(
        &self,
        ns: &TaxonNamespace,
        labels: &[&str],
    ) -> Result<FixedBitSet, GraftError> {
        let chunk = (labels.len() + self.cores - 1) / self.cores;
        let nbits = self.nbits;
        self.pool.install(|| {
            labels
                .par_chunks(chunk.max(1))
                .map(|chunk| self.serial_mask(ns, chunk))
                .try_reduce(
                    || FixedBitSet::with_capacity(nbits),
                    |mut a, b| {
                        a.union_with(&b);
                        Ok(a)
                    },
                )
        })
    }

    fn autotune<R: Rng>(&mut self, ns: &TaxonNamespace, rng: &mut R) -> Result<(), GraftError> {
        let all: Vec<&str> = ns.labels().collect();
        let mut ntax = self.cores * self.cores;
        loop {
            if ntax > all.len() {
                self.maxtax = all.len();
                self.parallel = false;
                return Ok(());
            }
            let mut serial = [0.0_f64; 3];
            let mut multi = [0.0_f64; 3];
            for i in 0..3 {
                let sample: Vec<&str> = all.choose_multiple(rng, ntax).copied().collect();
                let start = Instant::now();
                let a = self.serial_mask(ns, &sample)?;
                serial[i] = start.elapsed().as_secs_f64();
                let start = Instant::now();
                let b = self.parallel_mask(ns, &sample)?;
                multi[i] = start.elapsed().as_secs_f64();
                debug_assert_eq!(a, b);
            }
            serial.sort_by(f64::total_cmp);
            multi.sort_by(f64::total_cmp);
            log::debug!("autotune ntax={} serial={} parallel={}", ntax, serial[1], multi[1]);
            if serial[1] - multi[1] >= PARALLEL_ADVANTAGE_SECS {
                self.maxtax = ntax;
                self.parallel = true;
                return Ok(());
            }
            ntax *= 4;
        }
    }

    /// Most recent common ancestor of the masked tips, or `None` when the
    /// mask is empty or covers tips outside the tree.
    pub fn mrca(&self, tree: &Tree, mask: &FixedBitSet) -> Option<NodeId> {
        if mask.count_ones(..) == 0 {
            return None;
        }
        let mut cur = tree.root();
        if !mask.is_subset(&self.leafsets[cur.index()]) {
            return None;
        }
        'descend: loop {
            for child in tree.children(cur) {
                if mask.is_subset(&self.leafsets[child.index()]) {
                    cur = *child;
                    continue 'descend;
                }
            }
            return Some(cur);
        }
    }

    /// The MRCA only if its tip set equals the query exactly, i.e. the
    /// query is monophyletic in the tree.
    pub fn strict_mrca(&self, tree: &Tree, mask: &FixedBitSet) -> Option<NodeId> {
        let node = self.mrca(tree, mask)?;
        if self.leafsets[node.index()].is_subset(mask) {
            Some(node)
        } else {
            None
        }
    }

    /// Run `op` on the index's worker pool.
    pub fn install<OP, T>(&self, op: OP) -> T
    where
        OP: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool.install(op)
    }
}
