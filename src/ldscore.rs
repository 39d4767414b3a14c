//! LD score computation over a chunked genotype source.
//!
//! For each SNP i, `L2[i, c] = sum_j r2_adj(i, j) * w[j, c]` where j runs
//! over the SNPs whose position falls within the window of i, `r` is the
//! correlation of standardized dosage columns, and `w` is the annotation
//! weight (a single all-ones column when unpartitioned), optionally
//! scaled by `(p(1-p))^a` for frequency-dependent scores. The adjustment
//! `r2_adj = r2 - (1 - r2)/(n - 2)` removes finite-panel bias.
//!
//! Columns are processed in fixed-size chunks; standardized columns still
//! inside some upcoming window are retained in a ring buffer so pairs
//! crossing chunk boundaries are computed exactly once. Chunk size never
//! changes the result.

use std::collections::VecDeque;

use anyhow::Result;
use ndarray::{s, Array2, ArrayViewMut1};

use crate::error::LdscError;
use crate::types::{AnnotationMatrix, GenotypeSource, LdScoreTable, SnpRecord};
use crate::windows::{self, WindowUnit};

#[derive(Debug, Clone)]
pub struct LdScoreConfig {
    pub window: WindowUnit,
    /// SNP columns standardized and multiplied per step.
    pub chunk_size: usize,
    /// Exponent `a` for `(p(1-p))^a` frequency weighting.
    pub freq_weight_exponent: Option<f64>,
}

impl Default for LdScoreConfig {
    fn default() -> Self {
        Self {
            window: WindowUnit::Cm(1.0),
            chunk_size: 50,
            freq_weight_exponent: None,
        }
    }
}

/// Compute LD scores for every chromosome in the source, one table per
/// chromosome in genomic order. Chromosomes are processed sequentially
/// and windows never cross a chromosome boundary.
pub fn ldscore(
    source: &dyn GenotypeSource,
    annot: Option<&AnnotationMatrix>,
    config: &LdScoreConfig,
) -> Result<Vec<LdScoreTable>> {
    let snps = source.snps();
    if config.chunk_size == 0 {
        return Err(LdscError::Configuration("chunk size must be at least 1".into()).into());
    }
    if let Some(annot) = annot {
        if annot.weights.nrows() != snps.len() {
            return Err(LdscError::Alignment(format!(
                "annotation matrix has {} rows but the genotype source has {} SNPs",
                annot.weights.nrows(),
                snps.len()
            ))
            .into());
        }
    }
    let runs = chromosome_runs(snps)?;
    let mut tables = Vec::with_capacity(runs.len());
    for (start, end) in runs {
        tracing::info!(
            "Computing LD scores for chromosome {} ({} SNPs)",
            snps[start].chr,
            end - start
        );
        tables.push(ldscore_run(source, start, end, annot, config)?);
    }
    Ok(tables)
}

/// Contiguous chromosome spans; a chromosome split across two spans means
/// the input ordering is broken.
fn chromosome_runs(snps: &[SnpRecord]) -> Result<Vec<(usize, usize)>> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut seen = Vec::new();
    for (i, snp) in snps.iter().enumerate() {
        match runs.last_mut() {
            Some((_, end)) if snps[*end - 1].chr == snp.chr => *end = i + 1,
            _ => {
                if seen.contains(&snp.chr) {
                    return Err(LdscError::Alignment(format!(
                        "chromosome {} appears in two non-adjacent spans",
                        snp.chr
                    ))
                    .into());
                }
                seen.push(snp.chr);
                runs.push((i, i + 1));
            }
        }
    }
    Ok(runs)
}

fn ldscore_run(
    source: &dyn GenotypeSource,
    start: usize,
    end: usize,
    annot: Option<&AnnotationMatrix>,
    config: &LdScoreConfig,
) -> Result<LdScoreTable> {
    let snps = &source.snps()[start..end];
    let m = snps.len();
    let n = source.n_individuals();
    let bounds = windows::windows(snps, config.window)?;

    let categories: Vec<String> = match annot {
        Some(a) => a.names.iter().map(|name| format!("{name}L2")).collect(),
        None => vec!["L2".to_string()],
    };
    let k = categories.len();

    // Effective per-SNP weights: annotation row (or 1) times the optional
    // frequency factor. Filled as each column is standardized.
    let mut eff = Array2::<f64>::zeros((m, k));
    let mut l2 = Array2::<f64>::zeros((m, k));
    let mut maf = vec![0.0f64; m];

    let chunk = config.chunk_size.min(m.max(1));
    let max_window = bounds
        .iter()
        .enumerate()
        .map(|(i, (lo, _))| i - lo)
        .max()
        .unwrap_or(0);
    // Ring sized so no column still awaiting a pairing is overwritten.
    let ring_size = (max_window + chunk).max(1);
    let mut ring = Array2::<f64>::zeros((n, ring_size));
    let mut ring_next = 0usize;
    let mut live: VecDeque<(usize, usize)> = VecDeque::new(); // (snp idx, ring slot)

    let mut b_mat = Array2::<f64>::zeros((n, chunk));
    let mut a_mat = Array2::<f64>::zeros((n, max_window.max(1)));

    for cs in (0..m).step_by(chunk) {
        let ce = (cs + chunk).min(m);
        let c = ce - cs;

        while live
            .front()
            .map(|(idx, _)| *idx < bounds[cs].0)
            .unwrap_or(false)
        {
            live.pop_front();
        }

        let raw = source.read_chunk(start + cs, start + ce)?;
        if raw.nrows() != n || raw.ncols() != c {
            return Err(LdscError::Alignment(format!(
                "genotype chunk [{cs}, {ce}) has shape {:?}, expected ({n}, {c})",
                raw.dim()
            ))
            .into());
        }
        {
            let mut bv = b_mat.slice_mut(s![.., ..c]);
            for j in 0..c {
                bv.column_mut(j).assign(&raw.column(j));
                let snp_maf = standardize(bv.column_mut(j), n);
                maf[cs + j] = snp_maf;
                let scale = match config.freq_weight_exponent {
                    Some(a) => (snp_maf * (1.0 - snp_maf)).powf(a),
                    None => 1.0,
                };
                for cat in 0..k {
                    let base = match annot {
                        Some(a) => a.weights[[start + cs + j, cat]],
                        None => 1.0,
                    };
                    eff[[cs + j, cat]] = base * scale;
                }
                // Self term, r2 = 1 exactly.
                for cat in 0..k {
                    l2[[cs + j, cat]] += eff[[cs + j, cat]];
                }
            }
        }
        let b_slice = b_mat.slice(s![.., ..c]);

        // Within-chunk pairs.
        let bb = b_slice.t().dot(&b_slice);
        for j in 0..c {
            let lo_j = bounds[cs + j].0;
            for i in 0..j {
                let ig = cs + i;
                if ig < lo_j {
                    continue;
                }
                let r2u = r2_unbiased(bb[[i, j]] / n as f64, n);
                accumulate_pair(&mut l2, &eff, ig, cs + j, r2u, k);
            }
        }

        // Pairs against retained earlier columns.
        if !live.is_empty() {
            let w = live.len();
            for (wi, (_, slot)) in live.iter().enumerate() {
                a_mat.column_mut(wi).assign(&ring.column(*slot));
            }
            let ab = a_mat.slice(s![.., ..w]).t().dot(&b_slice);
            for (wi, (ig, _)) in live.iter().enumerate() {
                for j in 0..c {
                    if *ig < bounds[cs + j].0 {
                        continue;
                    }
                    let r2u = r2_unbiased(ab[[wi, j]] / n as f64, n);
                    accumulate_pair(&mut l2, &eff, *ig, cs + j, r2u, k);
                }
            }
        }

        for j in 0..c {
            let slot = ring_next % ring_size;
            ring.column_mut(slot).assign(&b_slice.column(j));
            live.push_back((cs + j, slot));
            ring_next += 1;
        }
    }

    let mut m_vals = vec![0.0; k];
    let mut m_5_50 = vec![0.0; k];
    for i in 0..m {
        let common = maf[i] > 0.05 && maf[i] < 0.50;
        for cat in 0..k {
            m_vals[cat] += eff[[i, cat]];
            if common {
                m_5_50[cat] += eff[[i, cat]];
            }
        }
    }

    Ok(LdScoreTable {
        snp_ids: snps.iter().map(|s| s.id.clone()).collect(),
        chr: snps.iter().map(|s| s.chr).collect(),
        bp: snps.iter().map(|s| s.bp).collect(),
        categories,
        scores: l2,
        m: m_vals,
        m_5_50,
    })
}

/// Each unordered pair contributes to both endpoints, weighted by the
/// other SNP's effective annotation row.
#[inline]
fn accumulate_pair(
    l2: &mut Array2<f64>,
    eff: &Array2<f64>,
    i: usize,
    j: usize,
    r2u: f64,
    k: usize,
) {
    for cat in 0..k {
        l2[[j, cat]] += r2u * eff[[i, cat]];
        l2[[i, cat]] += r2u * eff[[j, cat]];
    }
}

/// Mean-impute missing dosages, centre, scale to unit (1/n) variance.
/// Returns the minor allele frequency. Constant columns become all-zero.
fn standardize(mut col: ArrayViewMut1<f64>, n: usize) -> f64 {
    let (sum, count) = col.iter().fold((0.0f64, 0usize), |(s, c), &v| {
        if v.is_nan() {
            (s, c)
        } else {
            (s + v, c + 1)
        }
    });
    let mean = if count > 0 { sum / count as f64 } else { 0.0 };
    let freq = (mean / 2.0).clamp(0.0, 1.0);
    let maf = freq.min(1.0 - freq);

    for v in col.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
        } else {
            *v -= mean;
        }
    }
    let var: f64 = col.iter().map(|&v| v * v).sum::<f64>() / n as f64;
    let std = var.sqrt();
    if std > 0.0 {
        let inv = 1.0 / std;
        col.iter_mut().for_each(|v| *v *= inv);
    }
    maf
}

/// Unbiased r2 estimator: `r2 - (1 - r2)/(n - 2)` for n > 2.
#[inline]
fn r2_unbiased(r: f64, n: usize) -> f64 {
    let sq = r * r;
    if n > 2 {
        sq - (1.0 - sq) / (n as f64 - 2.0)
    } else {
        sq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenotypeMatrix;
    use ndarray::Array1;

    fn snp(id: &str, chr: u8, bp: u32) -> SnpRecord {
        SnpRecord {
            id: id.to_string(),
            chr,
            bp,
            cm: bp as f64 / 1_000_000.0,
            a1: "A".to_string(),
            a2: "G".to_string(),
            maf: f64::NAN,
        }
    }

    fn toy_matrix(m: usize, n: usize, seed: u64) -> GenotypeMatrix {
        // Small deterministic LCG so tests need no RNG dependency.
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % 3) as f64
        };
        let snps: Vec<SnpRecord> = (0..m)
            .map(|i| snp(&format!("rs{i}"), 1, 1000 * (i as u32 + 1)))
            .collect();
        let mut dosages = Array2::<f64>::zeros((m, n));
        for i in 0..m {
            for j in 0..n {
                dosages[[i, j]] = next();
            }
        }
        GenotypeMatrix::new(snps, dosages).unwrap()
    }

    #[test]
    fn empty_window_gives_self_term_only() {
        let gm = toy_matrix(5, 8, 7);
        let config = LdScoreConfig {
            window: WindowUnit::Snp(0),
            ..Default::default()
        };
        let tables = ldscore(&gm, None, &config).unwrap();
        assert_eq!(tables.len(), 1);
        for i in 0..5 {
            assert!(
                (tables[0].scores[[i, 0]] - 1.0).abs() < 1e-12,
                "self-only LD score should be 1, got {}",
                tables[0].scores[[i, 0]]
            );
        }
    }

    #[test]
    fn all_ones_annotation_matches_unpartitioned() {
        let gm = toy_matrix(12, 10, 3);
        let config = LdScoreConfig {
            window: WindowUnit::Kb(3.0),
            chunk_size: 4,
            freq_weight_exponent: None,
        };
        let plain = ldscore(&gm, None, &config).unwrap();
        let annot = AnnotationMatrix::new(
            vec!["base".to_string()],
            Array2::from_elem((12, 1), 1.0),
        )
        .unwrap();
        let part = ldscore(&gm, Some(&annot), &config).unwrap();
        assert_eq!(part[0].categories, vec!["baseL2".to_string()]);
        for i in 0..12 {
            let d = (plain[0].scores[[i, 0]] - part[0].scores[[i, 0]]).abs();
            assert!(d < 1e-12, "row {i} differs by {d}");
        }
        assert!((plain[0].m[0] - part[0].m[0]).abs() < 1e-12);
    }

    #[test]
    fn chunk_size_never_changes_results() {
        let gm = toy_matrix(30, 12, 11);
        let mut scores = Vec::new();
        for chunk in [2usize, 7, 64] {
            let config = LdScoreConfig {
                window: WindowUnit::Kb(6.0),
                chunk_size: chunk,
                freq_weight_exponent: None,
            };
            let tables = ldscore(&gm, None, &config).unwrap();
            scores.push(tables[0].scores.clone());
        }
        for alt in &scores[1..] {
            for i in 0..30 {
                let d = (scores[0][[i, 0]] - alt[[i, 0]]).abs();
                assert!(d < 1e-12, "row {i} differs by {d} across chunk sizes");
            }
        }
    }

    #[test]
    fn duplicated_column_counts_as_perfect_ld() {
        // Two identical SNP columns: r = 1, r2_adj = 1, L2 = 2 for both.
        let snps = vec![snp("rs1", 1, 100), snp("rs2", 1, 200)];
        let col = [0.0, 1.0, 2.0, 1.0, 0.0, 2.0];
        let mut dosages = Array2::<f64>::zeros((2, 6));
        dosages.row_mut(0).assign(&Array1::from_vec(col.to_vec()));
        dosages.row_mut(1).assign(&Array1::from_vec(col.to_vec()));
        let gm = GenotypeMatrix::new(snps, dosages).unwrap();
        let config = LdScoreConfig {
            window: WindowUnit::Kb(1.0),
            ..Default::default()
        };
        let tables = ldscore(&gm, None, &config).unwrap();
        for i in 0..2 {
            assert!(
                (tables[0].scores[[i, 0]] - 2.0).abs() < 1e-9,
                "perfect LD pair should score 2, got {}",
                tables[0].scores[[i, 0]]
            );
        }
    }

    #[test]
    fn m_counts_track_frequency_bounds() {
        // rs1 has MAF 0.5 (excluded from M_5_50), rs2 has MAF 1/3.
        let snps = vec![snp("rs1", 1, 100), snp("rs2", 1, 200)];
        let mut dosages = Array2::<f64>::zeros((2, 6));
        dosages
            .row_mut(0)
            .assign(&Array1::from_vec(vec![0.0, 1.0, 2.0, 1.0, 0.0, 2.0]));
        dosages
            .row_mut(1)
            .assign(&Array1::from_vec(vec![0.0, 1.0, 1.0, 0.0, 1.0, 1.0]));
        let gm = GenotypeMatrix::new(snps, dosages).unwrap();
        let tables = ldscore(
            &gm,
            None,
            &LdScoreConfig {
                window: WindowUnit::Snp(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(tables[0].m, vec![2.0]);
        assert_eq!(tables[0].m_5_50, vec![1.0]);
    }

    #[test]
    fn frequency_weight_scales_terms_and_m() {
        let gm = toy_matrix(6, 10, 19);
        let config = LdScoreConfig {
            window: WindowUnit::Snp(0),
            chunk_size: 3,
            freq_weight_exponent: Some(1.0),
        };
        let tables = ldscore(&gm, None, &config).unwrap();
        // With an empty window the score reduces to the SNP's own pq term.
        let mafs: Vec<f64> = gm.snps().iter().map(|s| s.maf).collect();
        for (i, maf) in mafs.iter().enumerate() {
            let pq = maf * (1.0 - maf);
            assert!(
                (tables[0].scores[[i, 0]] - pq).abs() < 1e-12,
                "pq-weighted self term mismatch at {i}"
            );
        }
        let m_expected: f64 = mafs.iter().map(|p| p * (1.0 - p)).sum();
        assert!((tables[0].m[0] - m_expected).abs() < 1e-12);
    }

    #[test]
    fn misaligned_annotation_is_rejected() {
        let gm = toy_matrix(5, 6, 23);
        let annot =
            AnnotationMatrix::new(vec!["a".to_string()], Array2::from_elem((4, 1), 1.0)).unwrap();
        let err = ldscore(&gm, Some(&annot), &LdScoreConfig::default()).unwrap_err();
        match err.downcast_ref::<LdscError>() {
            Some(LdscError::Alignment(_)) => {}
            other => panic!("expected Alignment error, got {other:?}"),
        }
    }
}
