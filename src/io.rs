//! Table IO: generic delimited reading with transparent decompression,
//! the persisted LD score format, and summary-statistic loading.
//!
//! Persisted LD scores are one gzip TSV per chromosome
//! (`{prefix}{chr}.l2.ldscore.gz` with columns CHR, SNP, BP and one named
//! column per category) plus sidecar `.l2.M` / `.l2.M_5_50` files holding
//! per-category totals on a single tab-separated line.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use tempfile::NamedTempFile;

use crate::error::LdscError;
use crate::types::{AnnotationMatrix, LdScoreTable, SnpRecord};

pub fn read_table(path: &Path) -> Result<DataFrame> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if ext == "gz" || ext == "bz2" {
        let tmp = decompress_to_temp(path, &ext)?;
        return read_table_plain(tmp.path());
    }

    read_table_plain(path)
}

fn read_table_plain(path: &Path) -> Result<DataFrame> {
    let delimiter = detect_delimiter(path)?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(delimiter)
                .with_null_values(Some(NullValues::AllColumns(vec![
                    "".into(),
                    "NA".into(),
                    "NaN".into(),
                    ".".into(),
                ])))
                .with_missing_is_null(true),
        )
        .with_ignore_errors(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("read {}", path.display()))?;
    Ok(df)
}

fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut first = String::new();
    reader.read_line(&mut first)?;
    if first.contains('\t') {
        return Ok(b'\t');
    }
    if first.contains(',') {
        return Ok(b',');
    }
    Ok(b' ')
}

fn decompress_to_temp(path: &Path, ext: &str) -> Result<NamedTempFile> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut decoder: Box<dyn Read> = match ext {
        "gz" => Box::new(GzDecoder::new(file)),
        "bz2" => Box::new(BzDecoder::new(file)),
        _ => Box::new(file),
    };
    let mut tmp = NamedTempFile::new()?;
    std::io::copy(&mut decoder, &mut tmp)?;
    Ok(tmp)
}

pub fn column_f64(df: &DataFrame, name: &str) -> Result<Array1<f64>> {
    let series = df
        .column(name)
        .with_context(|| format!("column {name} not found"))?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .with_context(|| format!("cast column {name} to f64"))?;
    let ca = series.f64()?;
    Ok(Array1::from_iter(
        ca.into_iter().map(|v| v.unwrap_or(f64::NAN)),
    ))
}

pub fn column_str(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df
        .column(name)
        .with_context(|| format!("column {name} not found"))?;
    let ca = column
        .as_materialized_series()
        .str()
        .with_context(|| format!("column {name} as string"))?
        .clone();
    Ok(ca
        .into_iter()
        .map(|v| v.unwrap_or("").to_string())
        .collect())
}

// ---------------------------------------------------------------------------
// Persisted LD score tables
// ---------------------------------------------------------------------------

/// Write one per-chromosome table set under `prefix`. Each table must
/// hold a single chromosome.
pub fn write_ldscore(prefix: &str, tables: &[LdScoreTable]) -> Result<()> {
    for table in tables {
        let chr = *table
            .chr
            .first()
            .ok_or_else(|| LdscError::Configuration("empty LD score table".into()))?;
        if table.chr.iter().any(|c| *c != chr) {
            return Err(LdscError::Alignment(
                "per-chromosome LD score table spans multiple chromosomes".into(),
            )
            .into());
        }

        let path = format!("{prefix}{chr}.l2.ldscore.gz");
        let file = File::create(&path).with_context(|| format!("create {path}"))?;
        let mut gz = GzEncoder::new(file, Compression::fast());
        write!(gz, "CHR\tSNP\tBP")?;
        for name in &table.categories {
            write!(gz, "\t{name}")?;
        }
        writeln!(gz)?;
        for i in 0..table.n_snps() {
            write!(gz, "{}\t{}\t{}", table.chr[i], table.snp_ids[i], table.bp[i])?;
            for cat in 0..table.categories.len() {
                write!(gz, "\t{:.6}", table.scores[[i, cat]])?;
            }
            writeln!(gz)?;
        }
        gz.finish().with_context(|| format!("finish {path}"))?;

        write_m_sidecar(&format!("{prefix}{chr}.l2.M"), &table.m)?;
        write_m_sidecar(&format!("{prefix}{chr}.l2.M_5_50"), &table.m_5_50)?;
    }
    Ok(())
}

fn write_m_sidecar(path: &str, values: &[f64]) -> Result<()> {
    let line = values
        .iter()
        .map(|v| format!("{v}"))
        .collect::<Vec<_>>()
        .join("\t");
    std::fs::write(path, format!("{line}\n")).with_context(|| format!("write {path}"))?;
    Ok(())
}

fn read_m_sidecar(path: &str) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("open {path}"))?;
    let mut values = Vec::new();
    for token in text.split_whitespace() {
        values.push(
            token
                .parse::<f64>()
                .with_context(|| format!("parse {token} in {path}"))?,
        );
    }
    Ok(values)
}

/// Read and concatenate the per-chromosome tables written by
/// [`write_ldscore`], summing the M sidecars.
pub fn read_ldscore(prefix: &str, chromosomes: &[u8]) -> Result<LdScoreTable> {
    if chromosomes.is_empty() {
        return Err(LdscError::Configuration("no chromosomes to read".into()).into());
    }
    let mut tables = Vec::with_capacity(chromosomes.len());
    for chr in chromosomes {
        let path = format!("{prefix}{chr}.l2.ldscore.gz");
        let df = read_table(Path::new(&path))?;
        let snp_ids = column_str(&df, "SNP")?;
        let chr_col = column_f64(&df, "CHR")?;
        let bp_col = column_f64(&df, "BP")?;
        let categories: Vec<String> = df
            .get_column_names()
            .iter()
            .filter(|name| !matches!(name.as_str(), "CHR" | "SNP" | "BP" | "CM" | "MAF"))
            .map(|s| s.to_string())
            .collect();
        if categories.is_empty() {
            return Err(LdscError::Alignment(format!("no LD score columns in {path}")).into());
        }
        let mut scores = Array2::<f64>::zeros((df.height(), categories.len()));
        for (cat, name) in categories.iter().enumerate() {
            let col = column_f64(&df, name)?;
            for (i, v) in col.iter().enumerate() {
                scores[[i, cat]] = *v;
            }
        }
        let m = read_m_sidecar(&format!("{prefix}{chr}.l2.M"))?;
        let m_5_50 = read_m_sidecar(&format!("{prefix}{chr}.l2.M_5_50"))?;
        if m.len() != categories.len() || m_5_50.len() != categories.len() {
            return Err(LdscError::Alignment(format!(
                "M sidecars for chromosome {chr} do not match {} score columns",
                categories.len()
            ))
            .into());
        }
        tables.push(LdScoreTable {
            snp_ids,
            chr: chr_col.iter().map(|v| *v as u8).collect(),
            bp: bp_col.iter().map(|v| *v as u32).collect(),
            categories,
            scores,
            m,
            m_5_50,
        });
    }
    LdScoreTable::concat(&tables)
}

/// DataFrame view of a table for SNP-identifier joins.
pub fn ldscore_to_dataframe(table: &LdScoreTable) -> Result<DataFrame> {
    let mut df = df!(
        "SNP" => table.snp_ids.clone(),
        "CHR" => table.chr.iter().map(|c| *c as i64).collect::<Vec<_>>(),
        "BP" => table.bp.iter().map(|b| *b as i64).collect::<Vec<_>>(),
    )?;
    for (cat, name) in table.categories.iter().enumerate() {
        let vals: Vec<f64> = (0..table.n_snps()).map(|i| table.scores[[i, cat]]).collect();
        df.with_column(Series::new(name.as_str().into(), vals))?;
    }
    Ok(df)
}

// ---------------------------------------------------------------------------
// Summary statistics and genotype-side collaborator tables
// ---------------------------------------------------------------------------

/// Load munged summary statistics. Requires SNP, A1, A2, Z, N; alleles
/// are uppercased and rows with missing required fields are dropped.
pub fn read_sumstats(path: &Path) -> Result<DataFrame> {
    let df = read_table(path)?;
    let needed = ["SNP", "A1", "A2", "Z", "N"];
    for col in needed {
        if df.column(col).is_err() {
            return Err(LdscError::Configuration(format!(
                "missing required column {col} in {}",
                path.display()
            ))
            .into());
        }
    }
    let mut df = df.select(needed)?;
    df = df.drop_nulls::<String>(None)?;
    for allele_col in ["A1", "A2"] {
        let upper: Vec<String> = column_str(&df, allele_col)?
            .into_iter()
            .map(|v| v.to_ascii_uppercase())
            .collect();
        df.with_column(Series::new(allele_col.into(), upper))?;
    }
    Ok(df)
}

/// SNP metadata table for the genotype source: columns CHR, SNP, CM, BP,
/// A1, A2. MAF is filled when the dosage matrix is attached.
pub fn read_snp_table(path: &Path) -> Result<Vec<SnpRecord>> {
    let df = read_table(path)?;
    for col in ["CHR", "SNP", "CM", "BP", "A1", "A2"] {
        if df.column(col).is_err() {
            return Err(LdscError::Configuration(format!(
                "missing required column {col} in {}",
                path.display()
            ))
            .into());
        }
    }
    let ids = column_str(&df, "SNP")?;
    let chr = column_f64(&df, "CHR")?;
    let cm = column_f64(&df, "CM")?;
    let bp = column_f64(&df, "BP")?;
    let a1 = column_str(&df, "A1")?;
    let a2 = column_str(&df, "A2")?;
    Ok((0..df.height())
        .map(|i| SnpRecord {
            id: ids[i].clone(),
            chr: chr[i] as u8,
            bp: bp[i] as u32,
            cm: cm[i],
            a1: a1[i].clone(),
            a2: a2[i].clone(),
            maf: f64::NAN,
        })
        .collect())
}

/// Headerless whitespace dosage matrix, one row per SNP. `NA` and `.`
/// become missing.
pub fn read_dosage_matrix(path: &Path) -> Result<Array2<f64>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values: Vec<f64> = Vec::new();
    let mut n_cols = 0usize;
    let mut n_rows = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<f64> = line
            .split_whitespace()
            .map(|tok| match tok {
                "NA" | "NaN" | "." => f64::NAN,
                _ => tok.parse::<f64>().unwrap_or(f64::NAN),
            })
            .collect();
        if n_cols == 0 {
            n_cols = row.len();
        } else if row.len() != n_cols {
            return Err(LdscError::Alignment(format!(
                "dosage line {} has {} fields, expected {n_cols}",
                line_no + 1,
                row.len()
            ))
            .into());
        }
        values.extend(row);
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols), values)
        .map_err(|e| anyhow::anyhow!("dosage matrix shape: {e}"))
}

/// Annotation table aligned to the genotype SNP ordering. A SNP column,
/// when present, is checked against the expected identifiers; all other
/// non-metadata columns become categories.
pub fn read_annotations(path: &Path, snps: &[SnpRecord]) -> Result<AnnotationMatrix> {
    let df = read_table(path)?;
    if df.column("SNP").is_ok() {
        let ids = column_str(&df, "SNP")?;
        if ids.len() != snps.len() {
            return Err(LdscError::Alignment(format!(
                "annotation table has {} rows but the genotype source has {} SNPs",
                ids.len(),
                snps.len()
            ))
            .into());
        }
        for (i, (id, snp)) in ids.iter().zip(snps).enumerate() {
            if id != &snp.id {
                return Err(LdscError::Alignment(format!(
                    "annotation row {i} is {id} but the genotype source has {}",
                    snp.id
                ))
                .into());
            }
        }
    } else if df.height() != snps.len() {
        return Err(LdscError::Alignment(format!(
            "annotation table has {} rows but the genotype source has {} SNPs",
            df.height(),
            snps.len()
        ))
        .into());
    }

    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .filter(|name| !matches!(name.as_str(), "CHR" | "SNP" | "BP" | "CM"))
        .map(|s| s.to_string())
        .collect();
    if names.is_empty() {
        return Err(
            LdscError::Configuration(format!("no category columns in {}", path.display())).into(),
        );
    }
    let mut weights = Array2::<f64>::zeros((df.height(), names.len()));
    for (cat, name) in names.iter().enumerate() {
        let col = column_f64(&df, name)?;
        for (i, v) in col.iter().enumerate() {
            weights[[i, cat]] = *v;
        }
    }
    AnnotationMatrix::new(names, weights)
}
