//! LD score regression toolkit (library crate).
//!
//! Two halves: LD score estimation from a chunked reference genotype
//! source (`windows`, `ldscore`), and block-jackknife regression of GWAS
//! summary statistics on those scores (`design`, `jackknife`,
//! `estimate`, `enrich`). Persistence of the score tables lives in `io`.

pub mod error;
pub mod logging;
pub mod types;

pub mod io;
pub mod parallel;
pub mod windows;

pub mod design;
pub mod enrich;
pub mod estimate;
pub mod jackknife;
pub mod ldscore;
