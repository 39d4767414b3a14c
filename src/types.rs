use anyhow::Result;
use ndarray::{s, Array2};

use crate::error::LdscError;

/// Per-SNP metadata from the reference panel.
///
/// Positions must be non-decreasing within each chromosome; that
/// invariant is enforced when a `GenotypeMatrix` is constructed.
#[derive(Debug, Clone)]
pub struct SnpRecord {
    pub id: String,
    pub chr: u8,
    pub bp: u32,
    /// Genetic-distance position in centimorgans.
    pub cm: f64,
    pub a1: String,
    pub a2: String,
    /// Minor allele frequency; filled by the genotype source.
    pub maf: f64,
}

/// Ordered genotype source the LD score calculator reads from.
///
/// Implementations expose the SNP list once and serve dosage columns in
/// bounded chunks so the calculator never holds the full pairwise
/// correlation structure in memory.
pub trait GenotypeSource {
    fn snps(&self) -> &[SnpRecord];

    fn n_individuals(&self) -> usize;

    /// Dosage columns for SNPs `[lo, hi)`, shaped (individuals, hi - lo).
    /// Missing genotypes are NaN.
    fn read_chunk(&self, lo: usize, hi: usize) -> Result<Array2<f64>>;
}

/// In-memory dosage matrix (individuals x SNPs), immutable once built.
#[derive(Debug, Clone)]
pub struct GenotypeMatrix {
    snps: Vec<SnpRecord>,
    dosages: Array2<f64>,
}

impl GenotypeMatrix {
    /// Build a matrix from SNP metadata and a (SNPs x individuals) dosage
    /// block. Allele frequencies are computed here and written back into
    /// the records; positions are validated to be sorted per chromosome.
    pub fn new(mut snps: Vec<SnpRecord>, dosages_by_snp: Array2<f64>) -> Result<Self> {
        if snps.len() != dosages_by_snp.nrows() {
            return Err(LdscError::Alignment(format!(
                "genotype matrix has {} rows but {} SNP records",
                dosages_by_snp.nrows(),
                snps.len()
            ))
            .into());
        }
        validate_sorted(&snps)?;

        for (i, snp) in snps.iter_mut().enumerate() {
            let row = dosages_by_snp.row(i);
            let (sum, count) = row.iter().fold((0.0, 0usize), |(s, c), &v| {
                if v.is_nan() {
                    (s, c)
                } else {
                    (s + v, c + 1)
                }
            });
            let mean = if count > 0 { sum / count as f64 } else { 0.0 };
            let freq = (mean / 2.0).clamp(0.0, 1.0);
            snp.maf = freq.min(1.0 - freq);
        }

        Ok(Self {
            snps,
            dosages: dosages_by_snp.t().to_owned(),
        })
    }
}

fn validate_sorted(snps: &[SnpRecord]) -> Result<()> {
    for pair in snps.windows(2) {
        if pair[0].chr == pair[1].chr && pair[0].bp > pair[1].bp {
            return Err(LdscError::Alignment(format!(
                "SNPs {} and {} are out of position order on chromosome {}",
                pair[0].id, pair[1].id, pair[0].chr
            ))
            .into());
        }
    }
    Ok(())
}

impl GenotypeSource for GenotypeMatrix {
    fn snps(&self) -> &[SnpRecord] {
        &self.snps
    }

    fn n_individuals(&self) -> usize {
        self.dosages.nrows()
    }

    fn read_chunk(&self, lo: usize, hi: usize) -> Result<Array2<f64>> {
        if hi > self.snps.len() || lo > hi {
            return Err(LdscError::Alignment(format!(
                "chunk [{lo}, {hi}) out of range for {} SNPs",
                self.snps.len()
            ))
            .into());
        }
        Ok(self.dosages.slice(s![.., lo..hi]).to_owned())
    }
}

/// SNP x category weight table for partitioned LD scores.
///
/// Row order must match the genotype source; that is checked where the
/// two meet, in the LD score calculator.
#[derive(Debug, Clone)]
pub struct AnnotationMatrix {
    pub names: Vec<String>,
    pub weights: Array2<f64>,
}

impl AnnotationMatrix {
    pub fn new(names: Vec<String>, weights: Array2<f64>) -> Result<Self> {
        if names.len() != weights.ncols() {
            return Err(LdscError::Alignment(format!(
                "annotation matrix has {} columns but {} category names",
                weights.ncols(),
                names.len()
            ))
            .into());
        }
        Ok(Self { names, weights })
    }

    pub fn n_categories(&self) -> usize {
        self.names.len()
    }
}

/// Per-SNP LD scores, one column per category, with the per-category
/// SNP-count scalars used to normalize regression predictors.
///
/// Produced per chromosome, concatenated, persisted, and read-only from
/// then on.
#[derive(Debug, Clone)]
pub struct LdScoreTable {
    pub snp_ids: Vec<String>,
    pub chr: Vec<u8>,
    pub bp: Vec<u32>,
    pub categories: Vec<String>,
    /// (SNPs x categories).
    pub scores: Array2<f64>,
    /// Per-category annotation mass over all SNPs.
    pub m: Vec<f64>,
    /// Same, restricted to 0.05 < MAF < 0.50.
    pub m_5_50: Vec<f64>,
}

impl LdScoreTable {
    pub fn n_snps(&self) -> usize {
        self.snp_ids.len()
    }

    /// Concatenate per-chromosome tables, summing the M scalars.
    pub fn concat(tables: &[LdScoreTable]) -> Result<LdScoreTable> {
        let first = tables
            .first()
            .ok_or_else(|| LdscError::Configuration("no LD score tables to concatenate".into()))?;
        let k = first.categories.len();
        let mut snp_ids = Vec::new();
        let mut chr = Vec::new();
        let mut bp = Vec::new();
        let mut m = vec![0.0; k];
        let mut m_5_50 = vec![0.0; k];
        let mut rows = Vec::new();
        for table in tables {
            if table.categories != first.categories {
                return Err(LdscError::Alignment(
                    "LD score tables have mismatched category names".into(),
                )
                .into());
            }
            snp_ids.extend(table.snp_ids.iter().cloned());
            chr.extend(table.chr.iter().copied());
            bp.extend(table.bp.iter().copied());
            for (acc, v) in m.iter_mut().zip(&table.m) {
                *acc += v;
            }
            for (acc, v) in m_5_50.iter_mut().zip(&table.m_5_50) {
                *acc += v;
            }
            rows.extend(table.scores.iter().copied());
        }
        let scores = Array2::from_shape_vec((snp_ids.len(), k), rows)
            .map_err(|e| anyhow::anyhow!("concatenating LD score tables: {e}"))?;
        Ok(LdScoreTable {
            snp_ids,
            chr,
            bp,
            categories: first.categories.clone(),
            scores,
            m,
            m_5_50,
        })
    }
}

/// Exclusion and intersection diagnostics attached to each regression run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCounts {
    /// SNPs read from the summary statistics.
    pub read: usize,
    /// SNPs surviving the LD score intersection.
    pub merged: usize,
    /// Dropped at the SNP-identifier join.
    pub dropped_join: usize,
    /// Dropped because cross-trait alleles could not be matched.
    pub dropped_mismatch: usize,
    /// Dropped by the chi-square ceiling.
    pub dropped_chisq: usize,
}
