//! Regression design assembly: the inner join between LD scores and
//! summary statistics, response construction, and the two-pass LDSC
//! regression weights.
//!
//! The weight scheme is two pure passes: an aggregate moment fit of the
//! model on uniformly-weighted data, then per-SNP weights from the
//! variance that fit predicts. Nothing stateful survives between the
//! passes.

use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use polars::prelude::*;

use crate::error::LdscError;
use crate::io::{column_f64, column_str, ldscore_to_dataframe};
use crate::types::{LdScoreTable, RunCounts};

#[derive(Debug, Clone)]
pub struct DesignOptions {
    /// Chi-square ceiling; None picks `max(0.001 * max N, 80)`.
    pub chisq_max: Option<f64>,
    /// Use the all-SNP M instead of the MAF-restricted M_5_50.
    pub not_m_5_50: bool,
    /// Cross-trait allele harmonization; disable only when inputs are
    /// known pre-aligned.
    pub check_alleles: bool,
    /// Mismatch drop rate above which harmonization fails the run.
    pub max_mismatch_rate: f64,
}

impl Default for DesignOptions {
    fn default() -> Self {
        Self {
            chisq_max: None,
            not_m_5_50: false,
            check_alleles: true,
            max_mismatch_rate: 0.10,
        }
    }
}

/// Single-trait design: chi-square response over M-rescaled LD score
/// predictors with LDSC regression weights.
#[derive(Debug, Clone)]
pub struct RegressionDesign {
    pub snp_ids: Vec<String>,
    /// (SNPs x categories), each column divided by its M.
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub weights: Array1<f64>,
    pub n_bar: f64,
    pub m: Vec<f64>,
    pub categories: Vec<String>,
    pub counts: RunCounts,
}

/// Cross-trait design: shared predictors with the z-product response and
/// the two per-trait chi-square responses, all over the same row set so
/// jackknife blocks align across the three fits.
#[derive(Debug, Clone)]
pub struct CrossTraitDesign {
    pub snp_ids: Vec<String>,
    pub x: Array2<f64>,
    pub y_cross: Array1<f64>,
    pub w_cross: Array1<f64>,
    pub chi2_1: Array1<f64>,
    pub w_1: Array1<f64>,
    pub chi2_2: Array1<f64>,
    pub w_2: Array1<f64>,
    pub n_bar_1: f64,
    pub n_bar_2: f64,
    /// Geometric mean of the two sample sizes.
    pub n_bar_cross: f64,
    pub m: Vec<f64>,
    pub categories: Vec<String>,
    pub counts: RunCounts,
}

pub fn single_trait(
    ldscores: &LdScoreTable,
    weight_scores: Option<&LdScoreTable>,
    sumstats: &DataFrame,
    opts: &DesignOptions,
) -> Result<RegressionDesign> {
    let (m, categories) = resolve_m(ldscores, opts)?;
    let merged = merge(ldscores, weight_scores, &[sumstats.clone()])?;

    let read = sumstats.height();
    let merged_rows = merged.height();
    if merged_rows == 0 {
        return Err(LdscError::Alignment(
            "no SNPs remain after intersecting summary statistics with LD scores".into(),
        )
        .into());
    }
    tracing::info!(
        "{merged_rows} of {read} SNPs remain after merging with LD scores"
    );

    let z = column_f64(&merged, "Z")?;
    let n = column_f64(&merged, "N")?;
    let wld = column_f64(&merged, "wLD")?;
    let snp_ids = column_str(&merged, "SNP")?;
    let l2: Vec<Array1<f64>> = categories
        .iter()
        .map(|name| column_f64(&merged, name))
        .collect::<Result<_>>()?;
    let chi2 = z.mapv(|v| v * v);

    let ceiling = resolve_chisq_max(opts.chisq_max, &n);
    let mask: Vec<bool> = chi2.iter().map(|&c| c <= ceiling).collect();
    let dropped_chisq = mask.iter().filter(|&&keep| !keep).count();
    if dropped_chisq > 0 {
        tracing::info!("Removed {dropped_chisq} SNPs with chi^2 > {ceiling}");
    }

    let chi2 = filter(&chi2, &mask);
    let n = filter(&n, &mask);
    let wld = filter(&wld, &mask);
    let snp_ids = filter_ids(snp_ids, &mask);
    let l2: Vec<Array1<f64>> = l2.iter().map(|col| filter(col, &mask)).collect();

    let n_bar = mean(&n);
    let m_tot: f64 = m.iter().sum();
    let l2_tot = row_sums(&l2);
    let weights = h2_weights(&chi2, &n, &l2_tot, &wld, m_tot);
    let x = predictors(&l2, &m)?;

    Ok(RegressionDesign {
        snp_ids,
        x,
        y: chi2,
        weights,
        n_bar,
        m,
        categories,
        counts: RunCounts {
            read,
            merged: merged_rows - dropped_chisq,
            dropped_join: read - merged_rows,
            dropped_mismatch: 0,
            dropped_chisq,
        },
    })
}

pub fn cross_trait(
    ldscores: &LdScoreTable,
    weight_scores: Option<&LdScoreTable>,
    sumstats_1: &DataFrame,
    sumstats_2: &DataFrame,
    opts: &DesignOptions,
) -> Result<CrossTraitDesign> {
    let (m, categories) = resolve_m(ldscores, opts)?;

    let mut ss2 = sumstats_2
        .select(["SNP", "A1", "A2", "Z", "N"])
        .context("second sumstats columns")?;
    ss2.rename("A1", "A1_2".into())?;
    ss2.rename("A2", "A2_2".into())?;
    ss2.rename("Z", "Z_2".into())?;
    ss2.rename("N", "N_2".into())?;

    let merged = merge(ldscores, weight_scores, &[sumstats_1.clone(), ss2])?;
    let read = sumstats_1.height().max(sumstats_2.height());
    let merged_rows = merged.height();
    if merged_rows == 0 {
        return Err(LdscError::Alignment(
            "no SNPs shared between the two studies and the LD scores".into(),
        )
        .into());
    }

    let z1 = column_f64(&merged, "Z")?;
    let z2 = column_f64(&merged, "Z_2")?;
    let n1 = column_f64(&merged, "N")?;
    let n2 = column_f64(&merged, "N_2")?;
    let wld = column_f64(&merged, "wLD")?;
    let snp_ids = column_str(&merged, "SNP")?;
    let l2: Vec<Array1<f64>> = categories
        .iter()
        .map(|name| column_f64(&merged, name))
        .collect::<Result<_>>()?;

    // Align trait-1 effect direction to trait 2: matching allele pairs
    // keep the sign, swapped pairs flip it, anything else is dropped.
    let (sign, allele_mask, dropped_mismatch) = if opts.check_alleles {
        let a1_1 = column_str(&merged, "A1")?;
        let a2_1 = column_str(&merged, "A2")?;
        let a1_2 = column_str(&merged, "A1_2")?;
        let a2_2 = column_str(&merged, "A2_2")?;
        harmonize_alleles(&a1_1, &a2_1, &a1_2, &a2_2)
    } else {
        (vec![1.0; merged_rows], vec![true; merged_rows], 0)
    };
    if dropped_mismatch > 0 {
        tracing::warn!("Dropped {dropped_mismatch} SNPs with unmatched alleles");
        if dropped_mismatch as f64 > opts.max_mismatch_rate * merged_rows as f64 {
            return Err(LdscError::AlleleMismatch {
                dropped: dropped_mismatch,
                total: merged_rows,
            }
            .into());
        }
    }

    let chi2_1 = z1.mapv(|v| v * v);
    let chi2_2 = z2.mapv(|v| v * v);
    let ceiling_1 = resolve_chisq_max(opts.chisq_max, &n1);
    let ceiling_2 = resolve_chisq_max(opts.chisq_max, &n2);
    let mask: Vec<bool> = (0..merged_rows)
        .map(|i| allele_mask[i] && chi2_1[i] <= ceiling_1 && chi2_2[i] <= ceiling_2)
        .collect();
    let dropped_chisq = mask.iter().filter(|&&keep| !keep).count() - dropped_mismatch;
    if dropped_chisq > 0 {
        tracing::info!("Removed {dropped_chisq} SNPs past the chi^2 ceiling");
    }

    let z1 = filter(&z1, &mask);
    let z2 = filter(&z2, &mask);
    let sign = Array1::from_iter(
        sign.iter()
            .zip(&mask)
            .filter_map(|(&s, &keep)| if keep { Some(s) } else { None }),
    );
    let n1 = filter(&n1, &mask);
    let n2 = filter(&n2, &mask);
    let wld = filter(&wld, &mask);
    let snp_ids = filter_ids(snp_ids, &mask);
    let l2: Vec<Array1<f64>> = l2.iter().map(|col| filter(col, &mask)).collect();
    let chi2_1 = filter(&chi2_1, &mask);
    let chi2_2 = filter(&chi2_2, &mask);

    let y_cross = Array1::from_iter(
        z1.iter()
            .zip(z2.iter())
            .zip(sign.iter())
            .map(|((&a, &b), &s)| s * a * b),
    );

    let n_bar_1 = mean(&n1);
    let n_bar_2 = mean(&n2);
    let m_tot: f64 = m.iter().sum();
    let l2_tot = row_sums(&l2);

    let w_1 = h2_weights(&chi2_1, &n1, &l2_tot, &wld, m_tot);
    let w_2 = h2_weights(&chi2_2, &n2, &l2_tot, &wld, m_tot);
    let w_cross = cross_weights(&chi2_1, &chi2_2, &n1, &n2, &l2_tot, &wld, m_tot);
    let x = predictors(&l2, &m)?;

    Ok(CrossTraitDesign {
        snp_ids,
        x,
        y_cross,
        w_cross,
        chi2_1,
        w_1,
        chi2_2,
        w_2,
        n_bar_1,
        n_bar_2,
        n_bar_cross: (n_bar_1 * n_bar_2).sqrt(),
        m,
        categories,
        counts: RunCounts {
            read,
            merged: merged_rows - dropped_mismatch - dropped_chisq,
            dropped_join: read.saturating_sub(merged_rows),
            dropped_mismatch,
            dropped_chisq,
        },
    })
}

// ---------------------------------------------------------------------------
// Join and response helpers
// ---------------------------------------------------------------------------

fn merge(
    ldscores: &LdScoreTable,
    weight_scores: Option<&LdScoreTable>,
    sumstats: &[DataFrame],
) -> Result<DataFrame> {
    let ld = ldscore_to_dataframe(ldscores)?;
    let w = weight_dataframe(ldscores, weight_scores)?;

    let mut lf = sumstats
        .first()
        .ok_or_else(|| LdscError::Configuration("no summary statistics supplied".into()))?
        .clone()
        .lazy();
    for extra in &sumstats[1..] {
        lf = lf.join(
            extra.clone().lazy(),
            [col("SNP")],
            [col("SNP")],
            JoinArgs::new(JoinType::Inner),
        );
    }
    lf = lf
        .join(
            ld.lazy(),
            [col("SNP")],
            [col("SNP")],
            JoinArgs::new(JoinType::Inner),
        )
        .join(
            w.lazy(),
            [col("SNP")],
            [col("SNP")],
            JoinArgs::new(JoinType::Inner),
        );
    let merged = lf.collect().context("merging sumstats with LD scores")?;
    // Jackknife blocks must follow genomic order regardless of join order.
    let merged = merged.sort(["CHR", "BP"], Default::default())?;
    Ok(merged)
}

/// Weight LD scores: the last column of the supplied table, or the
/// row-sum of the reference scores when no separate table is given.
fn weight_dataframe(
    ldscores: &LdScoreTable,
    weight_scores: Option<&LdScoreTable>,
) -> Result<DataFrame> {
    let (table, from_ref) = match weight_scores {
        Some(w) => (w, false),
        None => (ldscores, true),
    };
    let n = table.n_snps();
    let k = table.categories.len();
    let vals: Vec<f64> = (0..n)
        .map(|i| {
            if from_ref {
                (0..k).map(|c| table.scores[[i, c]]).sum()
            } else {
                table.scores[[i, k - 1]]
            }
        })
        .collect();
    let df = df!(
        "SNP" => table.snp_ids.clone(),
        "wLD" => vals,
    )?;
    Ok(df)
}

fn harmonize_alleles(
    a1_1: &[String],
    a2_1: &[String],
    a1_2: &[String],
    a2_2: &[String],
) -> (Vec<f64>, Vec<bool>, usize) {
    let n = a1_1.len();
    let mut sign = vec![1.0; n];
    let mut keep = vec![true; n];
    let mut dropped = 0usize;
    for i in 0..n {
        if a1_1[i] == a1_2[i] && a2_1[i] == a2_2[i] {
            sign[i] = 1.0;
        } else if a1_1[i] == a2_2[i] && a2_1[i] == a1_2[i] {
            sign[i] = -1.0;
        } else {
            keep[i] = false;
            dropped += 1;
        }
    }
    (sign, keep, dropped)
}

fn resolve_chisq_max(requested: Option<f64>, n: &Array1<f64>) -> f64 {
    match requested {
        Some(v) => v,
        None => {
            let max_n = n.iter().cloned().fold(0.0f64, f64::max);
            (0.001 * max_n).max(80.0)
        }
    }
}

fn resolve_m(ldscores: &LdScoreTable, opts: &DesignOptions) -> Result<(Vec<f64>, Vec<String>)> {
    let m = if opts.not_m_5_50 {
        ldscores.m.clone()
    } else {
        ldscores.m_5_50.clone()
    };
    for (name, value) in ldscores.categories.iter().zip(&m) {
        if *value <= 0.0 {
            return Err(LdscError::Configuration(format!(
                "category {name} has non-positive M ({value}); cannot rescale predictors"
            ))
            .into());
        }
    }
    Ok((m, ldscores.categories.clone()))
}

fn predictors(l2: &[Array1<f64>], m: &[f64]) -> Result<Array2<f64>> {
    let n = l2.first().map(|c| c.len()).unwrap_or(0);
    let k = l2.len();
    let mut x = Array2::<f64>::zeros((n, k));
    for (cat, col) in l2.iter().enumerate() {
        for i in 0..n {
            x[[i, cat]] = col[i].max(0.0) / m[cat];
        }
    }
    Ok(x)
}

// ---------------------------------------------------------------------------
// Two-pass LDSC weights
// ---------------------------------------------------------------------------

/// Pass 1: aggregate moment fit of the slope on uniformly-weighted data,
/// clamped into [0, 1].
fn aggregate_fit(mean_resp_excess: f64, mean_l2n: f64, m_tot: f64) -> f64 {
    let tot = m_tot * mean_resp_excess / mean_l2n;
    if tot.is_finite() {
        tot.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Pass 2: reciprocal predicted response variance, combining the
/// heteroskedasticity term from pass 1 with the oversampling correction
/// from the weight LD scores. Scores are floored at 1.
fn h2_weights(
    chi2: &Array1<f64>,
    n: &Array1<f64>,
    l2_tot: &Array1<f64>,
    wld: &Array1<f64>,
    m_tot: f64,
) -> Array1<f64> {
    let mean_chi = mean(chi2);
    let mean_l2n = mean_product(l2_tot, n);
    let tot_agg = aggregate_fit(mean_chi - 1.0, mean_l2n, m_tot);
    Array1::from_iter((0..chi2.len()).map(|i| {
        let ld = l2_tot[i].max(1.0);
        let w = wld[i].max(1.0);
        let c = tot_agg * n[i] / m_tot;
        let het = 2.0 * (1.0 + c * ld).powi(2);
        1.0 / (het * w)
    }))
}

#[allow(clippy::too_many_arguments)]
fn cross_weights(
    chi2_1: &Array1<f64>,
    chi2_2: &Array1<f64>,
    n1: &Array1<f64>,
    n2: &Array1<f64>,
    l2_tot: &Array1<f64>,
    wld: &Array1<f64>,
    m_tot: f64,
) -> Array1<f64> {
    let tot_1 = aggregate_fit(mean(chi2_1) - 1.0, mean_product(l2_tot, n1), m_tot);
    let tot_2 = aggregate_fit(mean(chi2_2) - 1.0, mean_product(l2_tot, n2), m_tot);
    Array1::from_iter((0..chi2_1.len()).map(|i| {
        let ld = l2_tot[i].max(1.0);
        let w = wld[i].max(1.0);
        let het_1 = 1.0 + tot_1 * n1[i] / m_tot * ld;
        let het_2 = 1.0 + tot_2 * n2[i] / m_tot * ld;
        1.0 / (het_1 * het_2 * w)
    }))
}

fn mean(values: &Array1<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0.0;
    for v in values {
        if v.is_finite() {
            sum += v;
            count += 1.0;
        }
    }
    if count == 0.0 {
        f64::NAN
    } else {
        sum / count
    }
}

fn mean_product(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0.0;
    for (x, y) in a.iter().zip(b) {
        if x.is_finite() && y.is_finite() {
            sum += x * y;
            count += 1.0;
        }
    }
    if count == 0.0 {
        f64::NAN
    } else {
        sum / count
    }
}

fn row_sums(cols: &[Array1<f64>]) -> Array1<f64> {
    let n = cols.first().map(|c| c.len()).unwrap_or(0);
    let mut out = Array1::<f64>::zeros(n);
    for col in cols {
        out += col;
    }
    out
}

fn filter(v: &Array1<f64>, mask: &[bool]) -> Array1<f64> {
    Array1::from_iter(
        v.iter()
            .zip(mask)
            .filter_map(|(&val, &keep)| if keep { Some(val) } else { None }),
    )
}

fn filter_ids(ids: Vec<String>, mask: &[bool]) -> Vec<String> {
    ids.into_iter()
        .zip(mask)
        .filter_map(|(id, &keep)| if keep { Some(id) } else { None })
        .collect()
}
