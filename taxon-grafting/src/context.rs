use hashbrown::HashMap;
use rand::Rng;

use phylo_common::NodeId;

use crate::fastmrca::FastMrca;

/// Everything the insertion engine threads through a run: the MRCA index
/// over the backbone, the memo of taxonomy ranks that failed the sampling
/// backoff (label of the failed rank, replacement taxonomy node), the
/// process-wide PRNG, and the crown-capture floor.
pub struct RunContext<R: Rng> {
    pub mrca: FastMrca,
    pub invalid: HashMap<String, NodeId>,
    pub rng: R,
    pub min_ccp: f64,
}

impl<R: Rng> RunContext<R> {
    pub fn new(mrca: FastMrca, rng: R, min_ccp: f64) -> Self {
        Self {
            mrca,
            invalid: HashMap::new(),
            rng,
            min_ccp,
        }
    }
}
