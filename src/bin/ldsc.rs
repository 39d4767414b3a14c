use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ldsc::design::{self, DesignOptions};
use ldsc::enrich::{enrich, CellTypeSet};
use ldsc::estimate::{self, InterceptMode, RegressionOptions};
use ldsc::io::{
    read_annotations, read_dosage_matrix, read_ldscore, read_snp_table, read_sumstats,
    write_ldscore,
};
use ldsc::ldscore::{ldscore, LdScoreConfig};
use ldsc::logging::{init_tracing, log_line, warn_line};
use ldsc::types::{GenotypeMatrix, GenotypeSource, RunCounts};
use ldsc::windows::WindowSpec;

#[derive(Parser)]
#[command(name = "ldsc")]
#[command(about = "LD score regression", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute LD scores from a reference dosage matrix.
    Ldscore {
        /// SNP table with columns CHR, SNP, CM, BP, A1, A2.
        #[arg(long, required = true)]
        snps: PathBuf,
        /// Whitespace dosage matrix, one row per SNP.
        #[arg(long, required = true)]
        dosages: PathBuf,
        /// Output prefix for per-chromosome score files.
        #[arg(long, required = true)]
        out: String,
        #[arg(long)]
        ld_wind_snps: Option<usize>,
        #[arg(long)]
        ld_wind_kb: Option<f64>,
        #[arg(long)]
        ld_wind_cm: Option<f64>,
        /// Annotation table for partitioned scores.
        #[arg(long)]
        annot: Option<PathBuf>,
        /// Exponent a for (p(1-p))^a frequency weighting.
        #[arg(long)]
        pq_exp: Option<f64>,
        #[arg(long, default_value_t = 50)]
        chunk_size: usize,
    },
    /// SNP heritability from summary statistics.
    H2 {
        #[arg(long, required = true)]
        sumstats: PathBuf,
        /// Prefix of persisted reference LD scores.
        #[arg(long, required = true)]
        ref_ld: String,
        /// Prefix of weight LD scores; defaults to the reference scores.
        #[arg(long)]
        w_ld: Option<String>,
        /// Chromosomes to read, e.g. 1-22.
        #[arg(long, default_value_t = 22)]
        chr: u8,
        #[arg(long, default_value_t = 200)]
        n_blocks: usize,
        #[arg(long)]
        chisq_max: Option<f64>,
        /// Constrain the regression intercept to this value.
        #[arg(long)]
        intercept: Option<f64>,
        /// Two-step estimation: step-1 chi-square ceiling.
        #[arg(long)]
        two_step: Option<f64>,
        /// Use all-SNP M instead of M_5_50.
        #[arg(long)]
        not_m_5_50: bool,
        /// Ridge-regularize a singular design instead of failing.
        #[arg(long)]
        allow_singular: bool,
        /// Report each annotation category separately.
        #[arg(long)]
        partitioned: bool,
        #[arg(long)]
        samp_prev: Option<f64>,
        #[arg(long)]
        pop_prev: Option<f64>,
        #[arg(long)]
        cores: Option<usize>,
        #[arg(long)]
        log_name: Option<String>,
    },
    /// Genetic covariance and correlation between two traits.
    Rg {
        /// Exactly two munged summary statistic files.
        #[arg(long, required = true, num_args = 2)]
        sumstats: Vec<PathBuf>,
        #[arg(long, required = true)]
        ref_ld: String,
        #[arg(long)]
        w_ld: Option<String>,
        #[arg(long, default_value_t = 22)]
        chr: u8,
        #[arg(long, default_value_t = 200)]
        n_blocks: usize,
        #[arg(long)]
        chisq_max: Option<f64>,
        /// Constrain the cross-trait intercept to this value.
        #[arg(long)]
        intercept: Option<f64>,
        #[arg(long)]
        two_step: Option<f64>,
        #[arg(long)]
        not_m_5_50: bool,
        #[arg(long)]
        allow_singular: bool,
        /// Skip allele harmonization between the two studies.
        #[arg(long)]
        no_check_alleles: bool,
        /// Sample prevalences for the two traits.
        #[arg(long, num_args = 2)]
        samp_prev: Option<Vec<f64>>,
        /// Population prevalences for the two traits.
        #[arg(long, num_args = 2)]
        pop_prev: Option<Vec<f64>>,
        #[arg(long)]
        cores: Option<usize>,
        #[arg(long)]
        log_name: Option<String>,
    },
    /// Cell-type-specific enrichment against a base model.
    Celltype {
        #[arg(long, required = true)]
        sumstats: PathBuf,
        /// Prefix of the base (reference) LD scores.
        #[arg(long, required = true)]
        ref_ld: String,
        #[arg(long)]
        w_ld: Option<String>,
        /// One prefix per cell-type score set, as name:prefix.
        #[arg(long, required = true)]
        cts_ld: Vec<String>,
        #[arg(long, default_value_t = 22)]
        chr: u8,
        #[arg(long, default_value_t = 200)]
        n_blocks: usize,
        #[arg(long)]
        chisq_max: Option<f64>,
        #[arg(long)]
        not_m_5_50: bool,
        #[arg(long)]
        allow_singular: bool,
        #[arg(long)]
        cores: Option<usize>,
        #[arg(long)]
        log_name: Option<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Ldscore {
            snps,
            dosages,
            out,
            ld_wind_snps,
            ld_wind_kb,
            ld_wind_cm,
            annot,
            pq_exp,
            chunk_size,
        } => run_ldscore(
            snps,
            dosages,
            out,
            WindowSpec {
                snp: ld_wind_snps,
                kb: ld_wind_kb,
                cm: ld_wind_cm,
            },
            annot,
            pq_exp,
            chunk_size,
        ),
        Command::H2 {
            sumstats,
            ref_ld,
            w_ld,
            chr,
            n_blocks,
            chisq_max,
            intercept,
            two_step,
            not_m_5_50,
            allow_singular,
            partitioned,
            samp_prev,
            pop_prev,
            cores,
            log_name,
        } => run_h2(H2Run {
            sumstats,
            ref_ld,
            w_ld,
            chr,
            n_blocks,
            chisq_max,
            intercept,
            two_step,
            not_m_5_50,
            allow_singular,
            partitioned,
            samp_prev,
            pop_prev,
            cores,
            log_name,
        }),
        Command::Rg {
            sumstats,
            ref_ld,
            w_ld,
            chr,
            n_blocks,
            chisq_max,
            intercept,
            two_step,
            not_m_5_50,
            allow_singular,
            no_check_alleles,
            samp_prev,
            pop_prev,
            cores,
            log_name,
        } => run_rg(RgRun {
            sumstats,
            ref_ld,
            w_ld,
            chr,
            n_blocks,
            chisq_max,
            intercept,
            two_step,
            not_m_5_50,
            allow_singular,
            no_check_alleles,
            samp_prev,
            pop_prev,
            cores,
            log_name,
        }),
        Command::Celltype {
            sumstats,
            ref_ld,
            w_ld,
            cts_ld,
            chr,
            n_blocks,
            chisq_max,
            not_m_5_50,
            allow_singular,
            cores,
            log_name,
        } => run_celltype(CelltypeRun {
            sumstats,
            ref_ld,
            w_ld,
            cts_ld,
            chr,
            n_blocks,
            chisq_max,
            not_m_5_50,
            allow_singular,
            cores,
            log_name,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_ldscore(
    snps: PathBuf,
    dosages: PathBuf,
    out: String,
    window: WindowSpec,
    annot: Option<PathBuf>,
    pq_exp: Option<f64>,
    chunk_size: usize,
) -> Result<()> {
    let unit = window.resolve()?;
    let records = read_snp_table(&snps)?;
    let matrix = read_dosage_matrix(&dosages)?;
    let source = GenotypeMatrix::new(records, matrix).context("building genotype matrix")?;
    let annotations = match annot {
        Some(path) => Some(read_annotations(&path, source.snps())?),
        None => None,
    };
    let config = LdScoreConfig {
        window: unit,
        chunk_size,
        freq_weight_exponent: pq_exp,
    };
    let tables = ldscore(&source, annotations.as_ref(), &config)?;
    write_ldscore(&out, &tables)?;
    for table in &tables {
        tracing::info!(
            "chr {}: {} SNPs, M = {:?}, M_5_50 = {:?}",
            table.chr.first().copied().unwrap_or(0),
            table.n_snps(),
            table.m,
            table.m_5_50
        );
    }
    Ok(())
}

struct H2Run {
    sumstats: PathBuf,
    ref_ld: String,
    w_ld: Option<String>,
    chr: u8,
    n_blocks: usize,
    chisq_max: Option<f64>,
    intercept: Option<f64>,
    two_step: Option<f64>,
    not_m_5_50: bool,
    allow_singular: bool,
    partitioned: bool,
    samp_prev: Option<f64>,
    pop_prev: Option<f64>,
    cores: Option<usize>,
    log_name: Option<String>,
}

fn run_h2(run: H2Run) -> Result<()> {
    let mut log = open_log(run.log_name.as_deref(), &run.sumstats, "h2")?;
    let chromosomes: Vec<u8> = (1..=run.chr).collect();
    let ref_scores = read_ldscore(&run.ref_ld, &chromosomes)?;
    let weight_scores = match &run.w_ld {
        Some(prefix) => Some(read_ldscore(prefix, &chromosomes)?),
        None => None,
    };
    let ss = read_sumstats(&run.sumstats)?;
    log_line(
        &mut log,
        &format!(
            "Read {} summary statistics from {}",
            ss.height(),
            run.sumstats.display()
        ),
        true,
    )?;

    let design_opts = DesignOptions {
        chisq_max: run.chisq_max,
        not_m_5_50: run.not_m_5_50,
        ..Default::default()
    };
    let design = design::single_trait(&ref_scores, weight_scores.as_ref(), &ss, &design_opts)?;
    report_counts(&mut log, &design.counts)?;

    let opts = RegressionOptions {
        n_blocks: run.n_blocks,
        intercept: resolve_intercept(run.intercept, run.two_step),
        allow_singular: run.allow_singular,
        cores: run.cores,
    };

    if run.partitioned {
        let part = estimate::partitioned_h2(&design, &opts)?;
        report_h2(&mut log, &part.total)?;
        log_line(
            &mut log,
            "Category\tProp_SNPs\tProp_h2\tEnrichment\tEnrichment_SE",
            true,
        )?;
        for cat in &part.categories {
            log_line(
                &mut log,
                &format!(
                    "{}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
                    cat.name, cat.prop_snps, cat.prop_h2, cat.enrichment, cat.enrichment_se
                ),
                true,
            )?;
        }
        if part.negative_categories > 0 {
            warn_line(
                &mut log,
                &format!(
                    "{} categories have negative point estimates",
                    part.negative_categories
                ),
            )?;
        }
        report_liability(&mut log, part.total.h2, run.samp_prev, run.pop_prev)?;
    } else {
        let est = estimate::h2(&design, &opts)?;
        report_h2(&mut log, &est)?;
        report_liability(&mut log, est.h2, run.samp_prev, run.pop_prev)?;
    }
    Ok(())
}

struct RgRun {
    sumstats: Vec<PathBuf>,
    ref_ld: String,
    w_ld: Option<String>,
    chr: u8,
    n_blocks: usize,
    chisq_max: Option<f64>,
    intercept: Option<f64>,
    two_step: Option<f64>,
    not_m_5_50: bool,
    allow_singular: bool,
    no_check_alleles: bool,
    samp_prev: Option<Vec<f64>>,
    pop_prev: Option<Vec<f64>>,
    cores: Option<usize>,
    log_name: Option<String>,
}

fn run_rg(run: RgRun) -> Result<()> {
    let mut log = open_log(run.log_name.as_deref(), &run.sumstats[0], "rg")?;
    let chromosomes: Vec<u8> = (1..=run.chr).collect();
    let ref_scores = read_ldscore(&run.ref_ld, &chromosomes)?;
    let weight_scores = match &run.w_ld {
        Some(prefix) => Some(read_ldscore(prefix, &chromosomes)?),
        None => None,
    };
    let ss1 = read_sumstats(&run.sumstats[0])?;
    let ss2 = read_sumstats(&run.sumstats[1])?;
    log_line(
        &mut log,
        &format!(
            "Computing rg: {} vs {}",
            run.sumstats[0].display(),
            run.sumstats[1].display()
        ),
        true,
    )?;

    let design_opts = DesignOptions {
        chisq_max: run.chisq_max,
        not_m_5_50: run.not_m_5_50,
        check_alleles: !run.no_check_alleles,
        ..Default::default()
    };
    let design = design::cross_trait(
        &ref_scores,
        weight_scores.as_ref(),
        &ss1,
        &ss2,
        &design_opts,
    )?;
    report_counts(&mut log, &design.counts)?;

    let opts = RegressionOptions {
        n_blocks: run.n_blocks,
        intercept: resolve_intercept(run.intercept, run.two_step),
        allow_singular: run.allow_singular,
        cores: run.cores,
    };
    let est = estimate::rg(&design, &opts)?;

    log_line(
        &mut log,
        &format!(
            "Genetic covariance: {:.4} ({:.4}); intercept {:.4}",
            est.gencov, est.gencov_se, est.gencov_intercept
        ),
        true,
    )?;
    log_line(
        &mut log,
        &format!("h2 trait 1: {:.4} ({:.4})", est.h2_1.h2, est.h2_1.h2_se),
        true,
    )?;
    log_line(
        &mut log,
        &format!("h2 trait 2: {:.4} ({:.4})", est.h2_2.h2, est.h2_2.h2_se),
        true,
    )?;
    log_line(
        &mut log,
        &format!("Genetic correlation: {:.4} ({:.4})", est.rg, est.rg_se),
        true,
    )?;

    if let (Some(sp), Some(pp)) = (&run.samp_prev, &run.pop_prev) {
        match estimate::gencov_to_liability(est.gencov, (sp[0], pp[0]), (sp[1], pp[1])) {
            Ok(liab) => log_line(
                &mut log,
                &format!("Liability-scale genetic covariance: {liab:.4}"),
                true,
            )?,
            Err(err) => warn_line(&mut log, &format!("Liability conversion failed: {err}"))?,
        }
    }
    Ok(())
}

struct CelltypeRun {
    sumstats: PathBuf,
    ref_ld: String,
    w_ld: Option<String>,
    cts_ld: Vec<String>,
    chr: u8,
    n_blocks: usize,
    chisq_max: Option<f64>,
    not_m_5_50: bool,
    allow_singular: bool,
    cores: Option<usize>,
    log_name: Option<String>,
}

fn run_celltype(run: CelltypeRun) -> Result<()> {
    let mut log = open_log(run.log_name.as_deref(), &run.sumstats, "celltype")?;
    let chromosomes: Vec<u8> = (1..=run.chr).collect();
    let ref_scores = read_ldscore(&run.ref_ld, &chromosomes)?;
    let weight_scores = match &run.w_ld {
        Some(prefix) => Some(read_ldscore(prefix, &chromosomes)?),
        None => None,
    };
    let ss = read_sumstats(&run.sumstats)?;

    let mut sets = Vec::with_capacity(run.cts_ld.len());
    for entry in &run.cts_ld {
        let (name, prefix) = entry.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("--cts-ld entries must look like name:prefix, got {entry}")
        })?;
        sets.push(CellTypeSet {
            name: name.to_string(),
            table: read_ldscore(prefix, &chromosomes)?,
        });
    }

    let design_opts = DesignOptions {
        chisq_max: run.chisq_max,
        not_m_5_50: run.not_m_5_50,
        ..Default::default()
    };
    let base = design::single_trait(&ref_scores, weight_scores.as_ref(), &ss, &design_opts)?;
    report_counts(&mut log, &base.counts)?;

    let opts = RegressionOptions {
        n_blocks: run.n_blocks,
        intercept: InterceptMode::Free,
        allow_singular: run.allow_singular,
        cores: run.cores,
    };
    log_line(&mut log, "Name\th2\th2_SE\tEnrichment\tP", true)?;
    for result in enrich(&base, &sets, &opts) {
        let result = result?;
        log_line(
            &mut log,
            &format!(
                "{}\t{:.4}\t{:.4}\t{:.4}\t{:.3e}",
                result.name,
                result.category.h2,
                result.category.h2_se,
                result.category.enrichment,
                result.p_value
            ),
            true,
        )?;
    }
    Ok(())
}

fn resolve_intercept(fixed: Option<f64>, two_step: Option<f64>) -> InterceptMode {
    match (fixed, two_step) {
        (Some(value), _) => InterceptMode::Fixed(value),
        (None, Some(threshold)) => InterceptMode::TwoStep(threshold),
        (None, None) => InterceptMode::Free,
    }
}

fn open_log(log_name: Option<&str>, first_input: &std::path::Path, suffix: &str) -> Result<File> {
    let stem = match log_name {
        Some(name) => name.to_string(),
        None => first_input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("ldsc")
            .to_string(),
    };
    File::create(format!("{stem}_{suffix}.log")).context("create log file")
}

fn report_counts(log: &mut File, counts: &RunCounts) -> Result<()> {
    log_line(
        &mut *log,
        &format!(
            "{} SNPs in the regression ({} dropped at the join, {} allele mismatches, {} past the chi^2 ceiling)",
            counts.merged, counts.dropped_join, counts.dropped_mismatch, counts.dropped_chisq
        ),
        true,
    )
}

fn report_h2(log: &mut File, est: &estimate::HeritabilityEstimate) -> Result<()> {
    log_line(
        &mut *log,
        &format!("Mean chi^2: {:.4}", est.mean_chi2),
        true,
    )?;
    if let Some(lambda) = est.lambda_gc {
        log_line(&mut *log, &format!("Lambda GC: {lambda:.4}"), true)?;
    }
    match est.intercept_se {
        Some(se) => log_line(
            &mut *log,
            &format!("Intercept: {:.4} ({se:.4})", est.intercept),
            true,
        )?,
        None => log_line(
            &mut *log,
            &format!("Intercept: {:.4} (constrained)", est.intercept),
            true,
        )?,
    }
    if est.ratio.is_finite() {
        log_line(
            &mut *log,
            &format!("Ratio: {:.4} ({:.4})", est.ratio, est.ratio_se),
            true,
        )?;
    }
    log_line(
        &mut *log,
        &format!("Total observed-scale h2: {:.4} ({:.4})", est.h2, est.h2_se),
        true,
    )?;
    if est.approximate {
        warn_line(
            log,
            "Result used a regularized solve and is approximate",
        )?;
    }
    Ok(())
}

fn report_liability(
    log: &mut File,
    h2: f64,
    samp_prev: Option<f64>,
    pop_prev: Option<f64>,
) -> Result<()> {
    if let (Some(sp), Some(pp)) = (samp_prev, pop_prev) {
        match estimate::h2_to_liability(h2, sp, pp) {
            Ok(liab) => log_line(
                &mut *log,
                &format!("Total liability-scale h2: {liab:.4}"),
                true,
            )?,
            Err(err) => warn_line(log, &format!("Liability conversion failed: {err}"))?,
        }
    }
    Ok(())
}
