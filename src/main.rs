mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use isodecipher_rs::annotation;
use isodecipher_rs::assign::{AssignmentEngine, ConflictPolicy, EngineConfig};
use isodecipher_rs::bam_input::{ReadTags, RecordFilter, parse_tag};
use isodecipher_rs::config::{self, PanelConfig, Strategy};
use isodecipher_rs::panel::build_panel;
use isodecipher_rs::pipeline::{self, RunOptions};
use isodecipher_rs::relabel::RuleTable;
use isodecipher_rs::table;
use mimalloc::MiMalloc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    let args = cli::Args::parse();

    // Initialize tracing subscriber
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.quiet {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &args.command {
        cli::Command::BuildPanel(a) => run_build_panel(a),
        cli::Command::Quantify(a) => run_quantify(a),
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn run_build_panel(args: &cli::BuildPanelArgs) -> Result<()> {
    let genes = config::load_gene_list(&args.genes)?;
    let overrides = match &args.custom_params {
        Some(path) => config::load_overrides(path)?,
        None => Default::default(),
    };
    let panel_config = PanelConfig {
        polya_window: args.polya_window,
        end_tolerance: args.end_tolerance,
        strategy: args.strategy.parse::<Strategy>()?,
        overrides,
        skip_singleton: !args.no_skip_singleton,
        skip_collapsed: !args.no_skip_collapsed,
    };
    // Fail on bad parameters before parsing the annotation.
    panel_config.validate(&genes)?;

    let wanted: BTreeSet<String> = genes.iter().cloned().collect();
    let transcripts = annotation::load_transcripts(&args.annotation, &wanted)?;
    let build = build_panel(&genes, &transcripts, &panel_config, &RuleTable::with_defaults())?;

    table::write_panel(&with_suffix(&args.out_prefix, "_panel.csv"), &build.panel)?;
    table::write_summary(&with_suffix(&args.out_prefix, "_summary.csv"), &build.summary)?;
    let in_panel = build.summary.iter().filter(|s| s.in_panel).count();
    tracing::info!(
        genes = genes.len(),
        in_panel,
        groups = build.panel.groups().len(),
        strategy = %panel_config.strategy,
        "isodecipher-rs: panel complete"
    );
    Ok(())
}

fn run_quantify(args: &cli::QuantifyArgs) -> Result<()> {
    let panel = table::read_panel(&args.panel)?;
    let target_genes = args.genes.as_deref().map(config::load_gene_list).transpose()?;
    let cell_whitelist = match &args.cells {
        Some(path) => Some(
            config::load_gene_list(path)
                .with_context(|| format!("failed to load cell whitelist {}", path.display()))?
                .into_iter()
                .collect::<BTreeSet<_>>(),
        ),
        None => None,
    };
    let engine_config = EngineConfig {
        target_genes,
        conflict_policy: args.conflict_policy.parse::<ConflictPolicy>()?,
        cell_whitelist,
    };
    let engine = AssignmentEngine::new(&panel, engine_config)?;

    let opts = RunOptions {
        threads: args.threads.max(1) as usize,
        tags: ReadTags {
            cell: parse_tag(&args.cell_tag)?,
            umi: parse_tag(&args.umi_tag)?,
            gene: if args.no_gene_tag {
                None
            } else {
                Some(parse_tag(&args.gene_tag)?)
            },
        },
        filter: RecordFilter {
            min_mapq: args.min_mapq,
        },
        ..Default::default()
    };
    let (quant, stats) = pipeline::run_quantify(&args.in_bam, &engine, &opts)?;

    let genes = engine.target_genes();
    let prefix = &args.out_prefix;
    table::write_counts(&with_suffix(prefix, "_counts.csv"), &quant, &panel)?;
    table::write_fractions(&with_suffix(prefix, "_fractions.csv"), &quant.fractions(&panel, genes), &panel)?;
    table::write_weighted_utr(&with_suffix(prefix, "_weighted_utr.csv"), &quant.weighted_utr(&panel))?;
    table::write_qc(&with_suffix(prefix, "_qc.tsv"), &quant.qc, Some(&stats))?;
    table::write_gene_qc(&with_suffix(prefix, "_gene_qc.tsv"), &quant.gene_coverage(&panel, genes))?;

    tracing::info!(
        total_records = stats.total_records,
        unmapped_records = stats.unmapped,
        cells = quant.counts.num_cells(),
        umis = quant.counts.total(),
        molecule_conflicts = quant.qc.molecule_conflicts,
        "isodecipher-rs: quantification complete"
    );
    Ok(())
}
