//! Cell-type-specific enrichment: one refit per cell-type annotation on
//! top of a shared base design.
//!
//! The base SNP intersection, response, weights and M values are built
//! once; every cell-type test appends that set's LD score column to the
//! base predictors and refits. Row membership never changes between
//! cell types, so block boundaries and results stay comparable across
//! the whole scan. Results are produced lazily, one per `next()`.

use std::collections::HashMap;

use anyhow::Result;
use ndarray::{s, Array2};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::design::RegressionDesign;
use crate::error::LdscError;
use crate::estimate::{self, CategoryEstimate, RegressionOptions};
use crate::types::LdScoreTable;

/// A named cell-type annotation set: a single-category LD score table
/// computed from the same reference panel as the base scores.
#[derive(Debug, Clone)]
pub struct CellTypeSet {
    pub name: String,
    pub table: LdScoreTable,
}

#[derive(Debug, Clone)]
pub struct CellTypeResult {
    pub name: String,
    /// Estimate for the cell-type category within the augmented model.
    pub category: CategoryEstimate,
    /// One-sided p-value for a positive cell-type coefficient.
    pub p_value: f64,
    pub approximate: bool,
}

/// Lazy scan over cell-type sets against one shared base design.
pub struct CellTypeScan<'a> {
    base: &'a RegressionDesign,
    sets: std::slice::Iter<'a, CellTypeSet>,
    opts: RegressionOptions,
}

pub fn enrich<'a>(
    base: &'a RegressionDesign,
    sets: &'a [CellTypeSet],
    opts: &RegressionOptions,
) -> CellTypeScan<'a> {
    CellTypeScan {
        base,
        sets: sets.iter(),
        opts: *opts,
    }
}

impl Iterator for CellTypeScan<'_> {
    type Item = Result<CellTypeResult>;

    fn next(&mut self) -> Option<Self::Item> {
        let set = self.sets.next()?;
        Some(run_one(self.base, set, &self.opts))
    }
}

fn run_one(
    base: &RegressionDesign,
    set: &CellTypeSet,
    opts: &RegressionOptions,
) -> Result<CellTypeResult> {
    if set.table.categories.len() != 1 {
        return Err(LdscError::Configuration(format!(
            "cell-type set {} has {} score columns, expected exactly 1",
            set.name,
            set.table.categories.len()
        ))
        .into());
    }
    let m_cts = if set.table.m_5_50[0] > 0.0 {
        set.table.m_5_50[0]
    } else {
        set.table.m[0]
    };
    if m_cts <= 0.0 {
        return Err(LdscError::Configuration(format!(
            "cell-type set {} has non-positive M",
            set.name
        ))
        .into());
    }

    // The base row set is fixed; every base SNP must be scored by the
    // cell-type table or the per-category results stop being comparable.
    let lookup: HashMap<&str, f64> = set
        .table
        .snp_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), set.table.scores[[i, 0]]))
        .collect();
    let n = base.snp_ids.len();
    let k = base.x.ncols();
    let mut x = Array2::<f64>::zeros((n, k + 1));
    x.slice_mut(s![.., ..k]).assign(&base.x);
    let mut missing = 0usize;
    for (row, id) in base.snp_ids.iter().enumerate() {
        match lookup.get(id.as_str()) {
            Some(score) => x[[row, k]] = score.max(0.0) / m_cts,
            None => missing += 1,
        }
    }
    if missing > 0 {
        return Err(LdscError::Alignment(format!(
            "cell-type set {} is missing scores for {missing} of {n} base SNPs",
            set.name
        ))
        .into());
    }

    let design = RegressionDesign {
        snp_ids: base.snp_ids.clone(),
        x,
        y: base.y.clone(),
        weights: base.weights.clone(),
        n_bar: base.n_bar,
        m: {
            let mut m = base.m.clone();
            m.push(m_cts);
            m
        },
        categories: {
            let mut names = base.categories.clone();
            names.push(set.name.clone());
            names
        },
        counts: base.counts,
    };
    let part = estimate::partitioned_h2(&design, opts)?;
    let category = part
        .categories
        .last()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no category estimates for {}", set.name))?;

    let normal = Normal::new(0.0, 1.0).map_err(|e| anyhow::anyhow!("normal distribution: {e}"))?;
    let z = if category.tau_se > 0.0 {
        category.tau / category.tau_se
    } else {
        f64::NAN
    };
    let p_value = if z.is_finite() {
        1.0 - normal.cdf(z)
    } else {
        f64::NAN
    };

    Ok(CellTypeResult {
        name: set.name.clone(),
        category,
        p_value,
        approximate: part.total.approximate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunCounts;
    use ndarray::{Array1, Array2};

    fn base_design(rows: usize, n_bar: f64, m: f64) -> (RegressionDesign, Vec<f64>) {
        let l2: Vec<f64> = (0..rows).map(|i| 1.0 + (i as f64 % 11.0)).collect();
        let x = Array2::from_shape_fn((rows, 1), |(i, _)| l2[i] / m);
        let y = Array1::from_shape_fn(rows, |i| 1.0 + n_bar * 0.2 * l2[i] / m);
        let design = RegressionDesign {
            snp_ids: (0..rows).map(|i| format!("rs{i}")).collect(),
            x,
            y,
            weights: Array1::from_elem(rows, 1.0),
            n_bar,
            m: vec![m],
            categories: vec!["baseL2".to_string()],
            counts: RunCounts::default(),
        };
        (design, l2)
    }

    fn cts_table(ids: &[String], scores: Vec<f64>, m: f64) -> LdScoreTable {
        LdScoreTable {
            snp_ids: ids.to_vec(),
            chr: vec![1; ids.len()],
            bp: (0..ids.len() as u32).map(|i| 100 * (i + 1)).collect(),
            categories: vec!["ctsL2".to_string()],
            scores: Array2::from_shape_vec((ids.len(), 1), scores).unwrap(),
            m: vec![m],
            m_5_50: vec![m],
        }
    }

    #[test]
    fn scan_is_lazy_and_ordered() {
        let (base, _l2) = base_design(60, 10_000.0, 500.0);
        let neuron: Vec<f64> = (0..60).map(|i| ((i * 13) % 17) as f64).collect();
        let liver: Vec<f64> = (0..60).map(|i| ((i * 3) % 5 + 1) as f64).collect();
        let sets = vec![
            CellTypeSet {
                name: "neuron".to_string(),
                table: cts_table(&base.snp_ids, neuron, 100.0),
            },
            CellTypeSet {
                name: "liver".to_string(),
                table: cts_table(&base.snp_ids, liver, 100.0),
            },
        ];
        let opts = RegressionOptions {
            n_blocks: 10,
            ..Default::default()
        };
        let mut scan = enrich(&base, &sets, &opts);
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first.name, "neuron");
        let second = scan.next().unwrap().unwrap();
        assert_eq!(second.name, "liver");
        assert!(scan.next().is_none());
    }

    #[test]
    fn missing_base_snps_fail_alignment() {
        let (base, l2) = base_design(30, 10_000.0, 500.0);
        let short_ids: Vec<String> = base.snp_ids[..20].to_vec();
        let sets = vec![CellTypeSet {
            name: "partial".to_string(),
            table: cts_table(&short_ids, l2[..20].to_vec(), 100.0),
        }];
        let opts = RegressionOptions {
            n_blocks: 5,
            ..Default::default()
        };
        let err = enrich(&base, &sets, &opts).next().unwrap().unwrap_err();
        match err.downcast_ref::<crate::error::LdscError>() {
            Some(LdscError::Alignment(_)) => {}
            other => panic!("expected Alignment error, got {other:?}"),
        }
    }

    #[test]
    fn concentrated_signal_is_enriched() {
        // All heritability sits on SNPs the cell type scores highly.
        let rows = 80;
        let n_bar = 20_000.0;
        let m_base = 1000.0;
        let m_cts = 200.0;
        let cts: Vec<f64> = (0..rows)
            .map(|i| if i % 4 == 0 { 8.0 } else { 0.0 })
            .collect();
        let base_l2: Vec<f64> = (0..rows).map(|i| 2.0 + (i as f64 % 7.0)).collect();
        let x = Array2::from_shape_fn((rows, 1), |(i, _)| base_l2[i] / m_base);
        // Small deterministic jitter so the jackknife SE is non-zero.
        let y = Array1::from_shape_fn(rows, |i| {
            1.0 + n_bar * (0.05 * base_l2[i] / m_base + 0.30 * cts[i] / m_cts)
                + 0.001 * (((i * 7) % 13) as f64 - 6.0)
        });
        let base = RegressionDesign {
            snp_ids: (0..rows).map(|i| format!("rs{i}")).collect(),
            x,
            y,
            weights: Array1::from_elem(rows, 1.0),
            n_bar,
            m: vec![m_base],
            categories: vec!["baseL2".to_string()],
            counts: RunCounts::default(),
        };
        let sets = vec![CellTypeSet {
            name: "cts".to_string(),
            table: cts_table(&base.snp_ids, cts, m_cts),
        }];
        let opts = RegressionOptions {
            n_blocks: 8,
            ..Default::default()
        };
        let result = enrich(&base, &sets, &opts).next().unwrap().unwrap();
        assert!(
            (result.category.h2 - 0.30).abs() < 0.05,
            "cell-type h2 = {}",
            result.category.h2
        );
        assert!(
            result.category.enrichment > 1.0,
            "enrichment = {}",
            result.category.enrichment
        );
        assert!(result.p_value < 0.05, "p = {}", result.p_value);
    }
}
