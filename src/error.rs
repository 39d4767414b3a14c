use thiserror::Error;

/// Error taxonomy for the estimation engine.
///
/// `Configuration` and `Alignment` are raised eagerly at component
/// boundaries, before any numeric work starts. `AlleleMismatch` is
/// per-SNP and only becomes fatal past the drop-rate threshold.
/// `SingularDesign` is fatal unless the caller opted into the
/// regularized fallback. `InvalidPrevalence` only fails the
/// liability-scale conversion; observed-scale results are unaffected.
#[derive(Debug, Error)]
pub enum LdscError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("alignment error: {0}")]
    Alignment(String),

    #[error("allele mismatch for {dropped} of {total} SNPs exceeds the drop-rate threshold")]
    AlleleMismatch { dropped: usize, total: usize },

    #[error("singular regression design: {0}")]
    SingularDesign(String),

    #[error("invalid prevalence: {0}")]
    InvalidPrevalence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LdscError>;
