//! Weighted block jackknife over a SNP-ordered design.
//!
//! Rows are cut into contiguous, near-equal blocks so resampling
//! respects local LD. Per-block partial normal equations make each
//! leave-one-block-out fit a subtraction rather than a re-scan, and the
//! coefficient covariance is derived from the delete values alone, so
//! the point estimate and its standard error always come from the same
//! resampling pass.

use anyhow::Result;
use ndarray::{s, Array1, Array2};
use rayon::prelude::*;

use crate::error::LdscError;
use crate::parallel;

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub n_blocks: usize,
    /// Fall back to a ridge-regularized solve on an ill-conditioned
    /// design instead of failing; the result is flagged approximate.
    pub allow_singular: bool,
    /// Worker threads for the per-block fits; None runs inline.
    pub cores: Option<usize>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            n_blocks: 200,
            allow_singular: false,
            cores: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JackknifeFit {
    /// Full-data weighted least squares coefficients.
    pub est: Array1<f64>,
    /// Leave-one-block-out coefficient vectors, (blocks x coefficients).
    pub delete_values: Array2<f64>,
    /// Coefficient covariance from the delete values.
    pub cov: Array2<f64>,
    /// True when any solve needed the ridge fallback.
    pub approximate: bool,
}

impl JackknifeFit {
    pub fn se(&self) -> Array1<f64> {
        Array1::from_iter((0..self.est.len()).map(|i| self.cov[[i, i]].max(0.0).sqrt()))
    }

    /// Restrict the fit to a coefficient subrange (delete values and
    /// covariance included), e.g. slopes without the intercept column.
    pub fn take_coefficients(&self, lo: usize, hi: usize) -> JackknifeFit {
        JackknifeFit {
            est: self.est.slice(s![lo..hi]).to_owned(),
            delete_values: self.delete_values.slice(s![.., lo..hi]).to_owned(),
            cov: self.cov.slice(s![lo..hi, lo..hi]).to_owned(),
            approximate: self.approximate,
        }
    }
}

/// Result of the two-step variant: slopes refit with the intercept held
/// at its step-1 estimate.
#[derive(Debug, Clone)]
pub struct TwoStepFit {
    pub slopes: JackknifeFit,
    pub intercept: f64,
    pub intercept_se: f64,
    pub step1_rows: usize,
}

/// Contiguous near-equal block boundaries.
pub fn block_bounds(n_rows: usize, n_blocks: usize) -> Vec<(usize, usize)> {
    (0..n_blocks)
        .map(|b| (b * n_rows / n_blocks, (b + 1) * n_rows / n_blocks))
        .collect()
}

/// Weighted least squares with a delete-one-block jackknife.
pub fn fit(
    x: &Array2<f64>,
    y: &Array1<f64>,
    weights: &Array1<f64>,
    opts: &FitOptions,
) -> Result<JackknifeFit> {
    let n = x.nrows();
    let k = x.ncols();
    if y.len() != n || weights.len() != n {
        return Err(LdscError::Alignment(format!(
            "design rows ({n}), response ({}) and weights ({}) differ",
            y.len(),
            weights.len()
        ))
        .into());
    }
    if opts.n_blocks == 0 {
        return Err(LdscError::Configuration("n_blocks must be at least 1".into()).into());
    }
    if opts.n_blocks > n {
        return Err(LdscError::Configuration(format!(
            "n_blocks ({}) exceeds the number of rows ({n})",
            opts.n_blocks
        ))
        .into());
    }
    if k == 0 || k > n {
        return Err(LdscError::Configuration(format!(
            "design has {k} coefficients for {n} rows"
        ))
        .into());
    }

    let b = opts.n_blocks;
    let bounds = block_bounds(n, b);

    // Per-block partial normal equations.
    let mut xtwx_blocks = vec![Array2::<f64>::zeros((k, k)); b];
    let mut xtwy_blocks = vec![Array1::<f64>::zeros(k); b];
    for (block, &(lo, hi)) in bounds.iter().enumerate() {
        let xtwx = &mut xtwx_blocks[block];
        let xtwy = &mut xtwy_blocks[block];
        for row in lo..hi {
            let w = weights[row];
            for a in 0..k {
                let xa = x[[row, a]];
                xtwy[a] += w * xa * y[row];
                for c in a..k {
                    xtwx[[a, c]] += w * xa * x[[row, c]];
                }
            }
        }
    }
    for xtwx in xtwx_blocks.iter_mut() {
        mirror_upper(xtwx);
    }

    let mut xtwx = Array2::<f64>::zeros((k, k));
    let mut xtwy = Array1::<f64>::zeros(k);
    for block in 0..b {
        xtwx += &xtwx_blocks[block];
        xtwy += &xtwy_blocks[block];
    }

    let (est, mut approximate) = solve(&xtwx, &xtwy, opts.allow_singular)?;

    let threads = parallel::resolve_threads(opts.cores, b);
    let delete_results: Vec<Result<(Array1<f64>, bool)>> =
        parallel::run_in_pool(threads, "jackknife worker pool", || {
            let solve_block = |block: usize| {
                let xtwx_del = &xtwx - &xtwx_blocks[block];
                let xtwy_del = &xtwy - &xtwy_blocks[block];
                solve(&xtwx_del, &xtwy_del, opts.allow_singular)
            };
            if threads.is_some() {
                (0..b).into_par_iter().map(solve_block).collect()
            } else {
                (0..b).map(solve_block).collect()
            }
        })?;

    let mut delete_values = Array2::<f64>::zeros((b, k));
    for (block, result) in delete_results.into_iter().enumerate() {
        let (del, approx) = result?;
        approximate |= approx;
        delete_values.row_mut(block).assign(&del);
    }

    let cov = delete_value_covariance(&delete_values);

    Ok(JackknifeFit {
        est,
        delete_values,
        cov,
        approximate,
    })
}

/// Fit with a trailing intercept column appended to the slope design;
/// the intercept is the last coefficient.
pub fn fit_with_intercept(
    x_slopes: &Array2<f64>,
    y: &Array1<f64>,
    weights: &Array1<f64>,
    opts: &FitOptions,
) -> Result<JackknifeFit> {
    fit(&append_intercept(x_slopes), y, weights, opts)
}

/// Fit slopes with the intercept constrained to a supplied value; the
/// response is pre-adjusted and no intercept column enters the design.
pub fn fit_constrained(
    x_slopes: &Array2<f64>,
    y: &Array1<f64>,
    weights: &Array1<f64>,
    intercept: f64,
    opts: &FitOptions,
) -> Result<JackknifeFit> {
    let y_adj = y.mapv(|v| v - intercept);
    fit(x_slopes, &y_adj, weights, opts)
}

/// Two-step fit: the intercept is estimated on the rows with
/// `y <= step1_max`, then held fixed while slopes are refit on all rows.
pub fn fit_two_step(
    x_slopes: &Array2<f64>,
    y: &Array1<f64>,
    weights: &Array1<f64>,
    step1_max: f64,
    opts: &FitOptions,
) -> Result<TwoStepFit> {
    let mask: Vec<bool> = y.iter().map(|&v| v <= step1_max).collect();
    let step1_rows = mask.iter().filter(|&&keep| keep).count();
    if step1_rows == 0 {
        return Err(LdscError::Configuration(format!(
            "two-step threshold {step1_max} excludes every row"
        ))
        .into());
    }
    let x1 = filter_rows(x_slopes, &mask);
    let y1 = filter_vec(y, &mask);
    let w1 = filter_vec(weights, &mask);
    let step1_opts = FitOptions {
        n_blocks: opts.n_blocks.min(step1_rows),
        ..*opts
    };
    let step1 = fit_with_intercept(&x1, &y1, &w1, &step1_opts)?;
    let k = x_slopes.ncols();
    let intercept = step1.est[k];
    let intercept_se = step1.se()[k];

    let slopes = fit_constrained(x_slopes, y, weights, intercept, opts)?;
    Ok(TwoStepFit {
        slopes,
        intercept,
        intercept_se,
        step1_rows,
    })
}

pub fn append_intercept(x: &Array2<f64>) -> Array2<f64> {
    let (n, k) = x.dim();
    let mut out = Array2::<f64>::zeros((n, k + 1));
    out.slice_mut(s![.., ..k]).assign(x);
    out.column_mut(k).fill(1.0);
    out
}

pub fn filter_rows(x: &Array2<f64>, mask: &[bool]) -> Array2<f64> {
    let k = x.ncols();
    let kept: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &keep)| if keep { Some(i) } else { None })
        .collect();
    let mut out = Array2::<f64>::zeros((kept.len(), k));
    for (row, &src) in kept.iter().enumerate() {
        out.row_mut(row).assign(&x.row(src));
    }
    out
}

pub fn filter_vec(v: &Array1<f64>, mask: &[bool]) -> Array1<f64> {
    Array1::from_iter(
        v.iter()
            .zip(mask)
            .filter_map(|(&val, &keep)| if keep { Some(val) } else { None }),
    )
}

/// `(b - 1)/b * sum_k (d_k - d_bar)(d_k - d_bar)^T` over delete values.
pub fn delete_value_covariance(delete_values: &Array2<f64>) -> Array2<f64> {
    let (b, k) = delete_values.dim();
    let mut mean = Array1::<f64>::zeros(k);
    for row in delete_values.rows() {
        mean += &row;
    }
    mean /= b as f64;
    let mut cov = Array2::<f64>::zeros((k, k));
    for row in delete_values.rows() {
        let d = &row.to_owned() - &mean;
        for i in 0..k {
            for j in i..k {
                cov[[i, j]] += d[i] * d[j];
            }
        }
    }
    mirror_upper(&mut cov);
    cov * ((b as f64 - 1.0) / b as f64)
}

fn mirror_upper(a: &mut Array2<f64>) {
    let k = a.nrows();
    for i in 0..k {
        for j in (i + 1)..k {
            a[[j, i]] = a[[i, j]];
        }
    }
}

/// Gaussian elimination with partial pivoting; small symmetric systems
/// only. On an ill-conditioned matrix, either reports SingularDesign or,
/// when allowed, retries with a growing ridge on the diagonal.
fn solve(a: &Array2<f64>, b: &Array1<f64>, allow_singular: bool) -> Result<(Array1<f64>, bool)> {
    match solve_exact(a, b) {
        Some(sol) => Ok((sol, false)),
        None => {
            if !allow_singular {
                return Err(LdscError::SingularDesign(
                    "normal equations are singular; rerun with the regularized-solve override \
                     if an approximate fit is acceptable"
                        .into(),
                )
                .into());
            }
            let k = a.nrows();
            let scale = (0..k).map(|i| a[[i, i]].abs()).sum::<f64>().max(1.0) / k as f64;
            let mut ridge = 1e-8 * scale;
            for _ in 0..8 {
                let mut reg = a.clone();
                for i in 0..k {
                    reg[[i, i]] += ridge;
                }
                if let Some(sol) = solve_exact(&reg, b) {
                    return Ok((sol, true));
                }
                ridge *= 10.0;
            }
            Err(LdscError::SingularDesign(
                "regularized solve failed to stabilize the normal equations".into(),
            )
            .into())
        }
    }
}

fn solve_exact(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let k = a.nrows();
    let mut aug = a.clone();
    let mut rhs = b.clone();
    let max_abs = aug.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if !max_abs.is_finite() || max_abs == 0.0 {
        return None;
    }
    let tol = max_abs * 1e-12 * k as f64;

    for col in 0..k {
        let mut pivot = col;
        for row in (col + 1)..k {
            if aug[[row, col]].abs() > aug[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if aug[[pivot, col]].abs() <= tol {
            return None;
        }
        if pivot != col {
            for c in 0..k {
                aug.swap([col, c], [pivot, c]);
            }
            rhs.swap(col, pivot);
        }
        let diag = aug[[col, col]];
        for row in (col + 1)..k {
            let factor = aug[[row, col]] / diag;
            if factor == 0.0 {
                continue;
            }
            for c in col..k {
                aug[[row, c]] -= factor * aug[[col, c]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut sol = Array1::<f64>::zeros(k);
    for row in (0..k).rev() {
        let mut acc = rhs[row];
        for c in (row + 1)..k {
            acc -= aug[[row, c]] * sol[c];
        }
        sol[row] = acc / aug[[row, row]];
        if !sol[row].is_finite() {
            return None;
        }
    }
    Some(sol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LdscError;

    fn line_design(n: usize, slope: f64, intercept: f64) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 + 1.0);
        let y = Array1::from_shape_fn(n, |i| intercept + slope * (i as f64 + 1.0));
        let w = Array1::from_elem(n, 1.0);
        (x, y, w)
    }

    #[test]
    fn recovers_exact_line_with_free_intercept() {
        let (x, y, w) = line_design(40, 0.5, 1.0);
        let fit = fit_with_intercept(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 8,
                ..Default::default()
            },
        )
        .unwrap();
        assert!((fit.est[0] - 0.5).abs() < 1e-10);
        assert!((fit.est[1] - 1.0).abs() < 1e-10);
        assert!(!fit.approximate);
    }

    #[test]
    fn constrained_intercept_recovers_slope() {
        let (x, y, w) = line_design(50, 0.5, 1.0);
        let fit = fit_constrained(
            &x,
            &y,
            &w,
            1.0,
            &FitOptions {
                n_blocks: 10,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fit.est.len(), 1);
        assert!(
            (fit.est[0] - 0.5).abs() < 1e-10,
            "slope {} should be 0.5",
            fit.est[0]
        );
    }

    #[test]
    fn singleton_blocks_are_legal() {
        let (x, y, w) = line_design(12, 0.3, 0.7);
        let fit = fit_with_intercept(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 12,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fit.delete_values.nrows(), 12);
        assert!((fit.est[0] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn too_many_blocks_is_a_configuration_error() {
        let (x, y, w) = line_design(5, 1.0, 0.0);
        let err = fit(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 6,
                ..Default::default()
            },
        )
        .unwrap_err();
        match err.downcast_ref::<LdscError>() {
            Some(LdscError::Configuration(_)) => {}
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn covariance_is_symmetric_psd() {
        // Noisy quadratic-ish response so delete values actually vary.
        let n = 60;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                (i as f64).sin() + 2.0
            } else {
                1.0
            }
        });
        let y = Array1::from_shape_fn(n, |i| 1.0 + 0.5 * x[[i, 0]] + ((i * 7) % 11) as f64 * 0.05);
        let w = Array1::from_shape_fn(n, |i| 1.0 + (i % 3) as f64);
        let fit = fit(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 15,
                ..Default::default()
            },
        )
        .unwrap();
        let cov = &fit.cov;
        for i in 0..2 {
            assert!(cov[[i, i]] >= 0.0);
            for j in 0..2 {
                assert!((cov[[i, j]] - cov[[j, i]]).abs() < 1e-12);
            }
        }
        // 2x2 PSD check via determinant.
        let det = cov[[0, 0]] * cov[[1, 1]] - cov[[0, 1]] * cov[[1, 0]];
        assert!(det >= -1e-12, "determinant {det} should be non-negative");
    }

    #[test]
    fn singular_design_fails_without_override() {
        // Two identical columns.
        let n = 20;
        let x = Array2::from_shape_fn((n, 2), |(i, _)| i as f64 + 1.0);
        let y = Array1::from_shape_fn(n, |i| 2.0 * (i as f64 + 1.0));
        let w = Array1::from_elem(n, 1.0);
        let err = fit(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 4,
                ..Default::default()
            },
        )
        .unwrap_err();
        match err.downcast_ref::<LdscError>() {
            Some(LdscError::SingularDesign(_)) => {}
            other => panic!("expected SingularDesign error, got {other:?}"),
        }
    }

    #[test]
    fn singular_override_flags_approximate() {
        let n = 20;
        let x = Array2::from_shape_fn((n, 2), |(i, _)| i as f64 + 1.0);
        let y = Array1::from_shape_fn(n, |i| 2.0 * (i as f64 + 1.0));
        let w = Array1::from_elem(n, 1.0);
        let fit = fit(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 4,
                allow_singular: true,
                cores: None,
            },
        )
        .unwrap();
        assert!(fit.approximate);
        // The two degenerate columns should split the signal.
        let total = fit.est[0] + fit.est[1];
        assert!((total - 2.0).abs() < 1e-3, "combined slope {total}");
    }

    #[test]
    fn two_step_holds_step1_intercept() {
        let (x, y, w) = line_design(60, 0.5, 1.0);
        let two_step = fit_two_step(
            &x,
            &y,
            &w,
            // Step 1 sees roughly the lower half of the responses.
            16.0,
            &FitOptions {
                n_blocks: 10,
                ..Default::default()
            },
        )
        .unwrap();
        assert!((two_step.intercept - 1.0).abs() < 1e-8);
        assert!((two_step.slopes.est[0] - 0.5).abs() < 1e-8);
        assert!(two_step.step1_rows < 60);
    }

    #[test]
    fn parallel_blocks_match_serial() {
        let (x, y, w) = line_design(48, 0.8, 0.2);
        let serial = fit_with_intercept(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 12,
                ..Default::default()
            },
        )
        .unwrap();
        let parallel = fit_with_intercept(
            &x,
            &y,
            &w,
            &FitOptions {
                n_blocks: 12,
                allow_singular: false,
                cores: Some(3),
            },
        )
        .unwrap();
        for i in 0..2 {
            assert!((serial.est[i] - parallel.est[i]).abs() < 1e-15);
        }
        for (a, b) in serial
            .delete_values
            .iter()
            .zip(parallel.delete_values.iter())
        {
            assert!((a - b).abs() < 1e-15);
        }
    }
}
