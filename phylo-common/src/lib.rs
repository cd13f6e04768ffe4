//! Shared tree model for dated phylogenies: an arena-backed rooted tree with
//! node ages, edge lengths and lock marks, a taxon namespace with stable bit
//! positions, and newick/nexus input and output.

mod namespace;
mod newick;
mod tree;

pub use namespace::{TaxonId, TaxonNamespace};
pub use newick::{newick_string, parse_newick, write_newick, write_nexus};
pub use tree::{CreationMethod, Node, NodeFlags, NodeId, Tree};

use thiserror::Error;

/// Absolute tolerance used when reconstructing node ages from the branch
/// lengths of an input tree. File round-off routinely perturbs path sums.
pub const ULTRAMETRICITY_PRECISION: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("newick parse error at byte {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("tree is not ultrametric: paths below {label:?} disagree by {spread}")]
    NotUltrametric { label: String, spread: f64 },

    #[error("taxon {label:?} is not registered and the namespace is frozen")]
    FrozenNamespace { label: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
