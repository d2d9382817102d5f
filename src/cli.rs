use isodecipher_rs::config::{DEFAULT_END_TOLERANCE, DEFAULT_POLYA_WINDOW};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "isodecipher-rs",
    about = "Group transcript 3' ends into isoform panels and quantify them in single-cell BAMs",
    version
)]
pub struct Args {
    /// Set logging level to WARN
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an isoform panel from an annotation
    BuildPanel(BuildPanelArgs),
    /// Assign reads to isoform groups and count UMIs per cell
    Quantify(QuantifyArgs),
}

#[derive(ClapArgs, Debug)]
pub struct BuildPanelArgs {
    /// Reference annotation (GTF/GFF3)
    #[arg(short = 'G', long = "gtf", value_name = "GTF/GFF")]
    pub annotation: PathBuf,

    /// Target genes, one symbol per line
    #[arg(short = 'g', long, value_name = "FILE")]
    pub genes: PathBuf,

    /// Output prefix; writes <prefix>_panel.csv and <prefix>_summary.csv
    #[arg(short = 'o', long = "out", value_name = "PREFIX")]
    pub out_prefix: PathBuf,

    /// Half-width of the polyA window around the mean 3' end
    #[arg(long = "polyA-window", default_value_t = DEFAULT_POLYA_WINDOW)]
    pub polya_window: u32,

    /// Base tolerance for clustering 3' ends
    #[arg(long, default_value_t = DEFAULT_END_TOLERANCE)]
    pub end_tolerance: u32,

    /// Sensitivity profile: precise, balanced or sensitive
    #[arg(long, default_value = "balanced")]
    pub strategy: String,

    /// Per-gene overrides (CSV/TSV with gene, polyA_window, end_tolerance)
    #[arg(long = "custom-params", value_name = "FILE")]
    pub custom_params: Option<PathBuf>,

    /// Keep genes with a single transcript
    #[arg(long)]
    pub no_skip_singleton: bool,

    /// Keep genes whose transcripts collapse into one group
    #[arg(long)]
    pub no_skip_collapsed: bool,
}

#[derive(ClapArgs, Debug)]
pub struct QuantifyArgs {
    /// Coordinate-sorted BAM with cell and UMI tags
    pub in_bam: PathBuf,

    /// Panel table written by build-panel
    #[arg(short = 'P', long, value_name = "CSV")]
    pub panel: PathBuf,

    /// Output prefix for counts, fractions, UTR and QC tables
    #[arg(short = 'o', long = "out", value_name = "PREFIX")]
    pub out_prefix: PathBuf,

    /// Restrict quantification to these genes, one per line
    #[arg(short = 'g', long, value_name = "FILE")]
    pub genes: Option<PathBuf>,

    /// Count only these cell barcodes, one per line
    #[arg(long, value_name = "FILE")]
    pub cells: Option<PathBuf>,

    /// Number of threads (CPUs) to use
    #[arg(short = 'p', long = "threads", default_value_t = 1)]
    pub threads: u8,

    /// Tie-break for molecules supporting several groups:
    /// tier-first, majority-first or discard
    #[arg(long, default_value = "tier-first")]
    pub conflict_policy: String,

    /// Skip alignments with a lower mapping quality
    #[arg(long, default_value_t = 0)]
    pub min_mapq: u8,

    /// Cell barcode tag
    #[arg(long, default_value = "CB")]
    pub cell_tag: String,

    /// UMI tag
    #[arg(long, default_value = "UB")]
    pub umi_tag: String,

    /// Gene name tag
    #[arg(long, default_value = "GN")]
    pub gene_tag: String,

    /// Ignore the gene tag and match by position only
    #[arg(long)]
    pub no_gene_tag: bool,
}
