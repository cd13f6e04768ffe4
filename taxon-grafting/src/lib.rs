//! Grafting of missing taxa onto a dated backbone phylogeny, guided by a
//! rank-labeled taxonomy: a bitmask MRCA index over the backbone, per-clade
//! birth–death rate precomputation, clade synthesis, and the postorder
//! insertion engine that ties them together.

mod check;
mod context;
mod engine;
mod fastmrca;
mod graft;
mod rates;
mod synthesize;

pub use check::{check_trees, TaxonCheckRow};
pub use context::RunContext;
pub use engine::add_taxa;
pub use fastmrca::FastMrca;
pub use graft::{fill_new_taxa, graft_node};
pub use rates::precompute_rates;
pub use synthesize::create_clade;

use thiserror::Error;

/// Terminal edges at or below this length get flagged in diagnostics.
pub const SHORT_BRANCH_THRESHOLD: f64 = 0.001;

#[derive(Error, Debug)]
pub enum GraftError {
    #[error("unknown taxon {0:?}")]
    UnknownTaxon(String),

    #[error("negative branch length between {parent:?} and {child:?}")]
    NegativeBranch { parent: String, child: String },

    #[error("could not place {graft:?} anywhere in clade {recipient:?}")]
    UngraftableClade { recipient: String, graft: String },

    #[error("no usable anchor in the ancestor chain of {taxon:?} (searched {chain})")]
    AncestorChainExhausted { taxon: String, chain: String },

    #[error(transparent)]
    Process(#[from] branching_process::ProcessError),

    #[error(transparent)]
    Tree(#[from] phylo_common::TreeError),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
