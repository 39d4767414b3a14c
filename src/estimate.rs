//! Heritability, genetic covariance and genetic correlation summaries on
//! top of the block jackknife, with delta-method standard errors taken
//! from the jackknife coefficient covariance. Derived quantities never
//! re-run the resampling.

use anyhow::Result;
use ndarray::{Array1, Array2};
use statrs::distribution::{ChiSquared, Continuous, ContinuousCDF, Normal};

use crate::design::{CrossTraitDesign, RegressionDesign};
use crate::error::LdscError;
use crate::jackknife::{self, FitOptions, JackknifeFit};
use crate::types::RunCounts;

/// How the regression intercept is treated.
#[derive(Debug, Clone, Copy)]
pub enum InterceptMode {
    Free,
    /// Held at the supplied value.
    Fixed(f64),
    /// Estimated on rows with response at or below the threshold, then
    /// held fixed while slopes are refit on the full data.
    TwoStep(f64),
}

#[derive(Debug, Clone, Copy)]
pub struct RegressionOptions {
    pub n_blocks: usize,
    pub intercept: InterceptMode,
    pub allow_singular: bool,
    pub cores: Option<usize>,
}

impl Default for RegressionOptions {
    fn default() -> Self {
        Self {
            n_blocks: 200,
            intercept: InterceptMode::Free,
            allow_singular: false,
            cores: None,
        }
    }
}

impl RegressionOptions {
    fn fit_options(&self) -> FitOptions {
        FitOptions {
            n_blocks: self.n_blocks,
            allow_singular: self.allow_singular,
            cores: self.cores,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeritabilityEstimate {
    pub h2: f64,
    pub h2_se: f64,
    pub intercept: f64,
    /// None when the intercept was constrained.
    pub intercept_se: Option<f64>,
    pub mean_chi2: f64,
    pub lambda_gc: Option<f64>,
    /// (intercept - 1) / (mean chi^2 - 1): share of inflation not
    /// attributable to polygenicity.
    pub ratio: f64,
    pub ratio_se: f64,
    pub approximate: bool,
    pub counts: RunCounts,
}

#[derive(Debug, Clone)]
pub struct CategoryEstimate {
    pub name: String,
    pub m: f64,
    pub h2: f64,
    pub h2_se: f64,
    pub prop_h2: f64,
    pub prop_snps: f64,
    pub enrichment: f64,
    pub enrichment_se: f64,
    /// Per-SNP coefficient for the category.
    pub tau: f64,
    pub tau_se: f64,
}

#[derive(Debug, Clone)]
pub struct PartitionedHeritability {
    pub total: HeritabilityEstimate,
    pub categories: Vec<CategoryEstimate>,
    /// Categories with a negative point estimate; reported, never fatal.
    pub negative_categories: usize,
}

#[derive(Debug, Clone)]
pub struct GeneticCorrelationEstimate {
    pub gencov: f64,
    pub gencov_se: f64,
    pub gencov_intercept: f64,
    pub gencov_intercept_se: Option<f64>,
    pub rg: f64,
    pub rg_se: f64,
    pub h2_1: HeritabilityEstimate,
    pub h2_2: HeritabilityEstimate,
    pub counts: RunCounts,
}

struct FitBundle {
    slopes: JackknifeFit,
    intercept: f64,
    intercept_se: Option<f64>,
}

fn fit_design(
    x_slopes: &Array2<f64>,
    y: &Array1<f64>,
    weights: &Array1<f64>,
    mode: InterceptMode,
    opts: &FitOptions,
) -> Result<FitBundle> {
    let k = x_slopes.ncols();
    match mode {
        InterceptMode::Free => {
            let full = jackknife::fit_with_intercept(x_slopes, y, weights, opts)?;
            let intercept = full.est[k];
            let intercept_se = full.se()[k];
            Ok(FitBundle {
                slopes: full.take_coefficients(0, k),
                intercept,
                intercept_se: Some(intercept_se),
            })
        }
        InterceptMode::Fixed(value) => {
            let slopes = jackknife::fit_constrained(x_slopes, y, weights, value, opts)?;
            Ok(FitBundle {
                slopes,
                intercept: value,
                intercept_se: None,
            })
        }
        InterceptMode::TwoStep(threshold) => {
            let two_step = jackknife::fit_two_step(x_slopes, y, weights, threshold, opts)?;
            Ok(FitBundle {
                slopes: two_step.slopes,
                intercept: two_step.intercept,
                intercept_se: Some(two_step.intercept_se),
            })
        }
    }
}

/// Observed-scale SNP heritability from a single-trait design.
pub fn h2(design: &RegressionDesign, opts: &RegressionOptions) -> Result<HeritabilityEstimate> {
    let bundle = fit_design(
        &design.x,
        &design.y,
        &design.weights,
        opts.intercept,
        &opts.fit_options(),
    )?;
    Ok(summarize_h2(&bundle, &design.y, design.n_bar, design.counts))
}

fn summarize_h2(
    bundle: &FitBundle,
    chi2: &Array1<f64>,
    n_bar: f64,
    counts: RunCounts,
) -> HeritabilityEstimate {
    let slopes = &bundle.slopes;
    let h2 = slopes.est.sum() / n_bar;
    let h2_var = slopes.cov.sum() / (n_bar * n_bar);
    let mean_chi2 = mean(chi2);
    let ratio = safe_div(bundle.intercept - 1.0, mean_chi2 - 1.0);
    let ratio_se = match bundle.intercept_se {
        Some(se) => safe_div(se, mean_chi2 - 1.0),
        None => f64::NAN,
    };
    HeritabilityEstimate {
        h2,
        h2_se: h2_var.max(0.0).sqrt(),
        intercept: bundle.intercept,
        intercept_se: bundle.intercept_se,
        mean_chi2,
        lambda_gc: lambda_gc(chi2),
        ratio,
        ratio_se,
        approximate: slopes.approximate,
        counts,
    }
}

/// Per-category heritability with enrichment ratios. Negative category
/// estimates are counted and warned about, never rejected: they are
/// ordinary noise around a small true value.
pub fn partitioned_h2(
    design: &RegressionDesign,
    opts: &RegressionOptions,
) -> Result<PartitionedHeritability> {
    let bundle = fit_design(
        &design.x,
        &design.y,
        &design.weights,
        opts.intercept,
        &opts.fit_options(),
    )?;
    let total = summarize_h2(&bundle, &design.y, design.n_bar, design.counts);
    let categories = category_estimates(
        &bundle.slopes,
        &design.categories,
        &design.m,
        design.n_bar,
    );
    let negative_categories = categories.iter().filter(|c| c.h2 < 0.0).count();
    if negative_categories > 0 {
        tracing::warn!(
            "{negative_categories} categories have negative point estimates; \
             retaining them as noise around zero"
        );
    }
    Ok(PartitionedHeritability {
        total,
        categories,
        negative_categories,
    })
}

pub(crate) fn category_estimates(
    slopes: &JackknifeFit,
    names: &[String],
    m: &[f64],
    n_bar: f64,
) -> Vec<CategoryEstimate> {
    let k = names.len();
    let h2_k: Vec<f64> = (0..k).map(|c| slopes.est[c] / n_bar).collect();
    let h2_total: f64 = h2_k.iter().sum();
    let m_total: f64 = m.iter().sum();
    let se = slopes.se();

    (0..k)
        .map(|c| {
            let prop_h2 = safe_div(h2_k[c], h2_total);
            let prop_snps = m[c] / m_total;
            let enrichment = safe_div(prop_h2, prop_snps);
            // Delta method for e_c = (b_c / sum b) * (M_tot / M_c).
            let sum_b: f64 = slopes.est.sum();
            let grad: Vec<f64> = (0..k)
                .map(|j| {
                    let d = if j == c { sum_b - slopes.est[c] } else { -slopes.est[c] };
                    (m_total / m[c]) * d / (sum_b * sum_b)
                })
                .collect();
            let mut var = 0.0;
            for i in 0..k {
                for j in 0..k {
                    var += grad[i] * slopes.cov[[i, j]] * grad[j];
                }
            }
            CategoryEstimate {
                name: names[c].clone(),
                m: m[c],
                h2: h2_k[c],
                h2_se: se[c] / n_bar,
                prop_h2,
                prop_snps,
                enrichment,
                enrichment_se: var.max(0.0).sqrt(),
                tau: h2_k[c] / m[c],
                tau_se: se[c] / n_bar / m[c],
            }
        })
        .collect()
}

/// Genetic covariance and correlation from a cross-trait design. The
/// three regressions share rows and blocks, so their delete values can
/// be pooled into one joint covariance for the delta method on rg.
pub fn rg(
    design: &CrossTraitDesign,
    opts: &RegressionOptions,
) -> Result<GeneticCorrelationEstimate> {
    let fit_opts = opts.fit_options();
    let cross = fit_design(
        &design.x,
        &design.y_cross,
        &design.w_cross,
        opts.intercept,
        &fit_opts,
    )?;
    // The per-trait heritability legs always estimate their own
    // intercepts; the requested mode applies to the covariance fit.
    let leg_1 = fit_design(
        &design.x,
        &design.chi2_1,
        &design.w_1,
        InterceptMode::Free,
        &fit_opts,
    )?;
    let leg_2 = fit_design(
        &design.x,
        &design.chi2_2,
        &design.w_2,
        InterceptMode::Free,
        &fit_opts,
    )?;

    let gencov = cross.slopes.est.sum() / design.n_bar_cross;
    let gencov_se = (cross.slopes.cov.sum() / (design.n_bar_cross * design.n_bar_cross))
        .max(0.0)
        .sqrt();
    let h2_1 = summarize_h2(&leg_1, &design.chi2_1, design.n_bar_1, design.counts);
    let h2_2 = summarize_h2(&leg_2, &design.chi2_2, design.n_bar_2, design.counts);

    let (rg, rg_se) = if h2_1.h2 > 0.0 && h2_2.h2 > 0.0 {
        let rg = gencov / (h2_1.h2 * h2_2.h2).sqrt();
        let joint = joint_scalar_covariance(&[
            (&cross.slopes, design.n_bar_cross),
            (&leg_1.slopes, design.n_bar_1),
            (&leg_2.slopes, design.n_bar_2),
        ]);
        let grad = [
            1.0 / (h2_1.h2 * h2_2.h2).sqrt(),
            -rg / (2.0 * h2_1.h2),
            -rg / (2.0 * h2_2.h2),
        ];
        let mut var = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                var += grad[i] * joint[[i, j]] * grad[j];
            }
        }
        (rg, var.max(0.0).sqrt())
    } else {
        tracing::warn!(
            "negative heritability point estimate; genetic correlation is undefined"
        );
        (f64::NAN, f64::NAN)
    };

    Ok(GeneticCorrelationEstimate {
        gencov,
        gencov_se,
        gencov_intercept: cross.intercept,
        gencov_intercept_se: cross.intercept_se,
        rg,
        rg_se,
        h2_1,
        h2_2,
        counts: design.counts,
    })
}

/// Jackknife covariance of derived scalars (total slope / n_bar per
/// fit), pooled across fits that share block boundaries.
fn joint_scalar_covariance(fits: &[(&JackknifeFit, f64)]) -> Array2<f64> {
    let b = fits[0].0.delete_values.nrows();
    let p = fits.len();
    let mut series = Array2::<f64>::zeros((b, p));
    for (col, (fit, n_bar)) in fits.iter().enumerate() {
        for block in 0..b {
            series[[block, col]] = fit.delete_values.row(block).sum() / n_bar;
        }
    }
    jackknife::delete_value_covariance(&series)
}

// ---------------------------------------------------------------------------
// Liability-scale conversion
// ---------------------------------------------------------------------------

/// Ascertainment-correction factor from sample and population prevalence.
/// When the study is a random sample (equal prevalences) no correction
/// applies and the factor is exactly 1.
pub fn liability_factor(sample_prev: f64, population_prev: f64) -> Result<f64> {
    for (name, value) in [
        ("sample prevalence", sample_prev),
        ("population prevalence", population_prev),
    ] {
        if !(value > 0.0 && value < 1.0) {
            return Err(LdscError::InvalidPrevalence(format!(
                "{name} {value} is outside (0, 1)"
            ))
            .into());
        }
    }
    if (sample_prev - population_prev).abs() < 1e-12 {
        return Ok(1.0);
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| anyhow::anyhow!("normal distribution: {e}"))?;
    let t = normal.inverse_cdf(1.0 - population_prev);
    let z = normal.pdf(t);
    let k = population_prev;
    let p = sample_prev;
    Ok(k * k * (1.0 - k) * (1.0 - k) / (p * (1.0 - p) * z * z))
}

/// Observed-scale h2 rescaled to the liability scale.
pub fn h2_to_liability(h2: f64, sample_prev: f64, population_prev: f64) -> Result<f64> {
    Ok(h2 * liability_factor(sample_prev, population_prev)?)
}

/// Observed-scale genetic covariance rescaled to the liability scale;
/// each trait contributes the square root of its factor.
pub fn gencov_to_liability(
    gencov: f64,
    prev_1: (f64, f64),
    prev_2: (f64, f64),
) -> Result<f64> {
    let c1 = liability_factor(prev_1.0, prev_1.1)?;
    let c2 = liability_factor(prev_2.0, prev_2.1)?;
    Ok(gencov * (c1 * c2).sqrt())
}

// ---------------------------------------------------------------------------
// Small statistical helpers
// ---------------------------------------------------------------------------

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

fn median(values: &Array1<f64>) -> Option<f64> {
    let mut vals: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if vals.is_empty() {
        return None;
    }
    vals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = vals.len() / 2;
    if vals.len() % 2 == 1 {
        Some(vals[mid])
    } else {
        Some((vals[mid - 1] + vals[mid]) / 2.0)
    }
}

/// Median chi^2 over the 1-df chi^2 median.
fn lambda_gc(chi2: &Array1<f64>) -> Option<f64> {
    let med = median(chi2)?;
    let dist = ChiSquared::new(1.0).ok()?;
    Some(med / dist.inverse_cdf(0.5))
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 || !den.is_finite() {
        f64::NAN
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunCounts;
    use ndarray::Array2;

    /// Exact single-column design: chi2 = 1 + n_bar * h2 * x.
    fn exact_design(h2_true: f64, n_bar: f64, m: f64, rows: usize) -> RegressionDesign {
        let l2: Vec<f64> = (0..rows).map(|i| 1.0 + (i as f64) * 0.37).collect();
        let x = Array2::from_shape_fn((rows, 1), |(i, _)| l2[i] / m);
        let y = Array1::from_shape_fn(rows, |i| 1.0 + n_bar * h2_true * l2[i] / m);
        RegressionDesign {
            snp_ids: (0..rows).map(|i| format!("rs{i}")).collect(),
            x,
            y,
            weights: Array1::from_elem(rows, 1.0),
            n_bar,
            m: vec![m],
            categories: vec!["L2".to_string()],
            counts: RunCounts::default(),
        }
    }

    #[test]
    fn h2_recovers_exact_signal() {
        let design = exact_design(0.4, 10_000.0, 1000.0, 100);
        let opts = RegressionOptions {
            n_blocks: 20,
            ..Default::default()
        };
        let est = h2(&design, &opts).unwrap();
        assert!((est.h2 - 0.4).abs() < 1e-8, "h2 = {}", est.h2);
        assert!((est.intercept - 1.0).abs() < 1e-8);
        assert!(est.h2_se < 1e-6);
    }

    #[test]
    fn fixed_intercept_matches_free_on_exact_data() {
        let design = exact_design(0.25, 50_000.0, 500.0, 80);
        let fixed = h2(
            &design,
            &RegressionOptions {
                n_blocks: 10,
                intercept: InterceptMode::Fixed(1.0),
                ..Default::default()
            },
        )
        .unwrap();
        assert!((fixed.h2 - 0.25).abs() < 1e-8);
        assert!(fixed.intercept_se.is_none());
    }

    #[test]
    fn two_step_recovers_slope() {
        let design = exact_design(0.3, 20_000.0, 800.0, 120);
        let max_y = design.y.iter().cloned().fold(f64::MIN, f64::max);
        let est = h2(
            &design,
            &RegressionOptions {
                n_blocks: 12,
                intercept: InterceptMode::TwoStep(max_y * 0.6),
                ..Default::default()
            },
        )
        .unwrap();
        assert!((est.h2 - 0.3).abs() < 1e-7, "h2 = {}", est.h2);
        assert!((est.intercept - 1.0).abs() < 1e-7);
    }

    #[test]
    fn partitioned_h2_splits_categories() {
        // Two categories with h2 0.3 and 0.1 on disjoint score columns.
        let rows = 90;
        let m = [600.0, 400.0];
        let n_bar = 30_000.0;
        let l2a: Vec<f64> = (0..rows).map(|i| 1.0 + (i as f64 % 13.0)).collect();
        let l2b: Vec<f64> = (0..rows).map(|i| 1.0 + ((i * 5) as f64 % 17.0)).collect();
        let x = Array2::from_shape_fn((rows, 2), |(i, j)| {
            if j == 0 {
                l2a[i] / m[0]
            } else {
                l2b[i] / m[1]
            }
        });
        let y = Array1::from_shape_fn(rows, |i| {
            1.0 + n_bar * (0.3 * l2a[i] / m[0] + 0.1 * l2b[i] / m[1])
        });
        let design = RegressionDesign {
            snp_ids: (0..rows).map(|i| format!("rs{i}")).collect(),
            x,
            y,
            weights: Array1::from_elem(rows, 1.0),
            n_bar,
            m: m.to_vec(),
            categories: vec!["aL2".to_string(), "bL2".to_string()],
            counts: RunCounts::default(),
        };
        let part = partitioned_h2(
            &design,
            &RegressionOptions {
                n_blocks: 9,
                ..Default::default()
            },
        )
        .unwrap();
        assert!((part.total.h2 - 0.4).abs() < 1e-7);
        assert!((part.categories[0].h2 - 0.3).abs() < 1e-7);
        assert!((part.categories[1].h2 - 0.1).abs() < 1e-7);
        assert_eq!(part.negative_categories, 0);
        let e0 = part.categories[0].enrichment;
        // 75% of h2 on 60% of SNPs.
        assert!((e0 - 0.75 / 0.6).abs() < 1e-6);
    }

    #[test]
    fn liability_factor_is_identity_at_equal_prevalence() {
        let f = liability_factor(0.1, 0.1).unwrap();
        assert_eq!(f, 1.0);
        assert!((h2_to_liability(0.37, 0.1, 0.1).unwrap() - 0.37).abs() < 1e-12);
    }

    /// Balanced case-control with 1% population prevalence: the classic
    /// correction factor is about 0.5519.
    #[test]
    fn liability_factor_balanced_study() {
        let f = liability_factor(0.5, 0.01).unwrap();
        assert!((f - 0.551907).abs() < 1e-4, "factor = {f}");
    }

    #[test]
    fn liability_rejects_out_of_range_prevalence() {
        for (sp, pp) in [(0.0, 0.1), (1.0, 0.1), (0.5, -0.2), (0.5, 1.5)] {
            let err = liability_factor(sp, pp).unwrap_err();
            match err.downcast_ref::<LdscError>() {
                Some(LdscError::InvalidPrevalence(_)) => {}
                other => panic!("expected InvalidPrevalence, got {other:?}"),
            }
        }
    }

    #[test]
    fn gencov_liability_combines_both_traits() {
        let both = gencov_to_liability(1.0, (0.5, 0.01), (0.5, 0.01)).unwrap();
        let single = liability_factor(0.5, 0.01).unwrap();
        assert!((both - single).abs() < 1e-10);
    }
}
