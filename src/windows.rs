use anyhow::Result;

use crate::error::LdscError;
use crate::types::SnpRecord;

/// Window extent around each SNP. Exactly one unit is active per run.
#[derive(Debug, Clone, Copy)]
pub enum WindowUnit {
    /// Fixed number of flanking SNPs on each side.
    Snp(usize),
    /// Physical distance in kilobases.
    Kb(f64),
    /// Genetic distance in centimorgans.
    Cm(f64),
}

/// Unresolved window request, e.g. straight from CLI flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSpec {
    pub snp: Option<usize>,
    pub kb: Option<f64>,
    pub cm: Option<f64>,
}

impl WindowSpec {
    pub fn resolve(&self) -> Result<WindowUnit> {
        match (self.snp, self.kb, self.cm) {
            (Some(n), None, None) => Ok(WindowUnit::Snp(n)),
            (None, Some(kb), None) => Ok(WindowUnit::Kb(kb)),
            (None, None, Some(cm)) => Ok(WindowUnit::Cm(cm)),
            (None, None, None) => Err(LdscError::Configuration(
                "no window unit given; set exactly one of snp, kb, cm".into(),
            )
            .into()),
            _ => Err(LdscError::Configuration(
                "conflicting window units; set exactly one of snp, kb, cm".into(),
            )
            .into()),
        }
    }
}

/// Symmetric half-open windows `[lo, hi)` over a sorted coordinate
/// sequence: for SNP i, all j with `|coords[j] - coords[i]| <= max_dist`.
///
/// Single two-pointer sweep; both pointers only move forward, so the
/// bounds are non-decreasing in i and the whole computation is linear.
/// Ties at the boundary fall inside the window on both sides.
pub fn window_bounds(coords: &[f64], max_dist: f64) -> Result<Vec<(usize, usize)>> {
    for (i, pair) in coords.windows(2).enumerate() {
        if pair[0] > pair[1] {
            return Err(LdscError::Alignment(format!(
                "positions are not sorted at index {i}: {} > {}",
                pair[0], pair[1]
            ))
            .into());
        }
    }
    let m = coords.len();
    let mut bounds = Vec::with_capacity(m);
    let mut lo = 0usize;
    let mut hi = 0usize;
    for i in 0..m {
        while coords[i] - coords[lo] > max_dist {
            lo += 1;
        }
        if hi < i + 1 {
            hi = i + 1;
        }
        while hi < m && coords[hi] - coords[i] <= max_dist {
            hi += 1;
        }
        bounds.push((lo, hi));
    }
    Ok(bounds)
}

/// Fixed-SNP-count windows: i ± half, truncated at the ends.
pub fn window_bounds_snp(m: usize, half: usize) -> Vec<(usize, usize)> {
    (0..m)
        .map(|i| (i.saturating_sub(half), (i + half + 1).min(m)))
        .collect()
}

/// Windows for a SNP slice under the selected unit. The slice must be a
/// single chromosome; kb and cM windows use the record coordinates.
pub fn windows(snps: &[SnpRecord], unit: WindowUnit) -> Result<Vec<(usize, usize)>> {
    match unit {
        WindowUnit::Snp(half) => Ok(window_bounds_snp(snps.len(), half)),
        WindowUnit::Kb(kb) => {
            let coords: Vec<f64> = snps.iter().map(|s| s.bp as f64 / 1000.0).collect();
            window_bounds(&coords, kb)
        }
        WindowUnit::Cm(cm) => {
            let coords: Vec<f64> = snps.iter().map(|s| s.cm).collect();
            window_bounds(&coords, cm)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LdscError;

    #[test]
    fn snp_windows_truncate_at_ends() {
        let bounds = window_bounds_snp(6, 1);
        assert_eq!(bounds[0], (0, 2));
        assert_eq!(bounds[1], (0, 3));
        assert_eq!(bounds[5], (4, 6));
    }

    #[test]
    fn bounds_are_monotone_and_contain_self() {
        let coords = vec![0.0, 0.4, 1.0, 2.5, 2.5, 3.1, 9.0];
        let bounds = window_bounds(&coords, 1.0).unwrap();
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            assert!(lo <= i && i < hi, "SNP {i} outside its own window");
            if i > 0 {
                assert!(bounds[i - 1].0 <= lo);
                assert!(bounds[i - 1].1 <= hi);
            }
        }
    }

    #[test]
    fn duplicate_positions_fall_in_both_windows() {
        let coords = vec![1.0, 2.0, 2.0, 3.0];
        let bounds = window_bounds(&coords, 0.0).unwrap();
        assert_eq!(bounds[1], (1, 3));
        assert_eq!(bounds[2], (1, 3));
    }

    /// Left boundaries for coords (1,4,6,7,7,8) with distance 2 are
    /// (0,1,1,2,2,2).
    #[test]
    fn irregular_spacing_left_bounds() {
        let coords = vec![1.0, 4.0, 6.0, 7.0, 7.0, 8.0];
        let bounds = window_bounds(&coords, 2.0).unwrap();
        let lefts: Vec<usize> = bounds.iter().map(|b| b.0).collect();
        assert_eq!(lefts, vec![0, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn zero_distance_isolates_unique_positions() {
        let coords = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let bounds = window_bounds(&coords, 0.0).unwrap();
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            assert_eq!((lo, hi), (i, i + 1));
        }
    }

    #[test]
    fn unsorted_positions_fail_fast() {
        let err = window_bounds(&[1.0, 3.0, 2.0], 1.0).unwrap_err();
        match err.downcast_ref::<LdscError>() {
            Some(LdscError::Alignment(_)) => {}
            other => panic!("expected Alignment error, got {other:?}"),
        }
    }

    #[test]
    fn window_spec_rejects_conflicting_units() {
        let spec = WindowSpec {
            snp: Some(10),
            kb: Some(100.0),
            cm: None,
        };
        let err = spec.resolve().unwrap_err();
        match err.downcast_ref::<LdscError>() {
            Some(LdscError::Configuration(_)) => {}
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn window_spec_requires_a_unit() {
        assert!(WindowSpec::default().resolve().is_err());
    }
}
