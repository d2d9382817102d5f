//! Tabular outputs and the panel-table reader.
//!
//! Writers emit the header explicitly so an empty table still has one.

use crate::bam_input::BamStats;
use crate::panel::{EvidenceTier, GeneSummary, IsoformGroup, Member, Panel, UtrStats};
use crate::quant::{CellUtr, FractionRow, GeneCoverage, QcReport, Quantification};
use crate::types::{HashMap, HashMapExt, Interval};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

pub const FEATURE_LAST_EXON: &str = "last_exon_group";
pub const FEATURE_POLYA_WINDOW: &str = "polyA_window";

const PANEL_HEADER: [&str; 14] = [
    "gene",
    "polyA_group",
    "feature_type",
    "feature_id",
    "chrom",
    "start",
    "end",
    "strand",
    "transcripts",
    "transcript_names",
    "avg_utr_length",
    "min_utr_length",
    "max_utr_length",
    "evidence_tier",
];

/// One feature of the panel table. Exon rows describe a single member, so
/// their UTR columns hold that transcript's own length; window rows carry the
/// group statistics and list every member.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PanelRow {
    gene: String,
    #[serde(rename = "polyA_group")]
    group: String,
    feature_type: String,
    feature_id: String,
    chrom: String,
    start: u32,
    end: u32,
    strand: char,
    transcripts: String,
    transcript_names: String,
    avg_utr_length: Option<f64>,
    min_utr_length: Option<u32>,
    max_utr_length: Option<u32>,
    evidence_tier: String,
}

fn csv_writer(path: &Path, delimiter: u8) -> Result<csv::Writer<File>> {
    csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))
}

fn format_fraction(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.6}")).unwrap_or_default()
}

pub fn write_panel(path: &Path, panel: &Panel) -> Result<()> {
    let mut wtr = csv_writer(path, b',')?;
    wtr.write_record(PANEL_HEADER)?;
    for group in panel.groups() {
        for member in &group.members {
            wtr.serialize(PanelRow {
                gene: group.gene.clone(),
                group: group.id.clone(),
                feature_type: FEATURE_LAST_EXON.to_string(),
                feature_id: group.exon_feature_id(member),
                chrom: group.seqname.clone(),
                start: member.last_exon.start,
                end: member.last_exon.end,
                strand: group.strand,
                transcripts: member.transcript_id.clone(),
                transcript_names: member.transcript_name.clone(),
                avg_utr_length: member.utr_length.map(f64::from),
                min_utr_length: member.utr_length,
                max_utr_length: member.utr_length,
                evidence_tier: member.tier.to_string(),
            })?;
        }
        wtr.serialize(PanelRow {
            gene: group.gene.clone(),
            group: group.id.clone(),
            feature_type: FEATURE_POLYA_WINDOW.to_string(),
            feature_id: group.window_feature_id(),
            chrom: group.seqname.clone(),
            start: group.polya_window.start,
            end: group.polya_window.end,
            strand: group.strand,
            transcripts: join(group.members.iter().map(|m| m.transcript_id.as_str())),
            transcript_names: join(group.members.iter().map(|m| m.transcript_name.as_str())),
            avg_utr_length: group.utr.mean,
            min_utr_length: group.utr.min,
            max_utr_length: group.utr.max,
            evidence_tier: EvidenceTier::Tier3.to_string(),
        })?;
    }
    wtr.flush()?;
    tracing::info!(path = %path.display(), groups = panel.groups().len(), "wrote panel table");
    Ok(())
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(";")
}

/// Rebuild a [`Panel`] from a table written by [`write_panel`]. Groups keep
/// the order in which they first appear in the file.
pub fn read_panel(path: &Path) -> Result<Panel> {
    let mut rdr = csv::ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to open panel table {}", path.display()))?;

    let mut groups: Vec<IsoformGroup> = Vec::new();
    let mut windows: Vec<bool> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (i, result) in rdr.deserialize::<PanelRow>().enumerate() {
        let line = i + 2;
        let row = result.with_context(|| format!("{}:{line}: malformed panel row", path.display()))?;
        if row.end < row.start {
            bail!("{}:{line}: feature {} ends before it starts", path.display(), row.feature_id);
        }
        let gi = match by_id.get(&row.group) {
            Some(&gi) => gi,
            None => {
                by_id.insert(row.group.clone(), groups.len());
                groups.push(IsoformGroup {
                    id: row.group.clone(),
                    gene: row.gene.clone(),
                    seqname: row.chrom.clone(),
                    strand: row.strand,
                    members: Vec::new(),
                    polya_window: Interval::new(row.start, row.end),
                    utr: UtrStats::default(),
                });
                windows.push(false);
                groups.len() - 1
            }
        };
        let group = &mut groups[gi];
        if group.gene != row.gene || group.seqname != row.chrom || group.strand != row.strand {
            bail!(
                "{}:{line}: group {} has features on more than one gene or location",
                path.display(),
                row.group
            );
        }
        match row.feature_type.as_str() {
            FEATURE_LAST_EXON => {
                let Some(tier) = EvidenceTier::parse(&row.evidence_tier) else {
                    bail!("{}:{line}: unknown evidence tier '{}'", path.display(), row.evidence_tier);
                };
                group.members.push(Member {
                    transcript_id: row.transcripts,
                    transcript_name: row.transcript_names,
                    last_exon: Interval::new(row.start, row.end),
                    utr_length: row.min_utr_length,
                    tier,
                });
            }
            FEATURE_POLYA_WINDOW => {
                if windows[gi] {
                    bail!("{}:{line}: group {} has two polyA windows", path.display(), row.group);
                }
                windows[gi] = true;
                group.polya_window = Interval::new(row.start, row.end);
                group.utr = UtrStats {
                    min: row.min_utr_length,
                    max: row.max_utr_length,
                    mean: row.avg_utr_length,
                };
            }
            other => bail!("{}:{line}: unknown feature type '{other}'", path.display()),
        }
    }

    let mut panel = Panel::new();
    let mut by_gene: Vec<(String, Vec<IsoformGroup>)> = Vec::new();
    for (group, has_window) in groups.into_iter().zip(windows) {
        if !has_window {
            bail!("{}: group {} has no polyA window", path.display(), group.id);
        }
        if group.members.is_empty() {
            bail!("{}: group {} has no last exon", path.display(), group.id);
        }
        match by_gene.iter_mut().find(|(gene, _)| *gene == group.gene) {
            Some((_, gs)) => gs.push(group),
            None => by_gene.push((group.gene.clone(), vec![group])),
        }
    }
    for (gene, gs) in by_gene {
        panel.push_gene(&gene, gs);
    }
    tracing::info!(path = %path.display(), groups = panel.groups().len(), "loaded panel table");
    Ok(panel)
}

pub fn write_summary(path: &Path, summary: &[GeneSummary]) -> Result<()> {
    let mut wtr = csv_writer(path, b',')?;
    wtr.write_record(["gene", "num_transcripts", "num_groups", "status", "in_panel"])?;
    for s in summary {
        wtr.serialize((&s.gene, s.num_transcripts, s.num_groups, s.status.as_str(), s.in_panel))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_counts(path: &Path, quant: &Quantification, panel: &Panel) -> Result<()> {
    let mut wtr = csv_writer(path, b',')?;
    wtr.write_record(["cell", "gene", "polyA_group", "umis"])?;
    for (cell, row) in quant.counts.cells() {
        for (&g, &n) in row {
            let group = panel.group(g);
            wtr.serialize((cell, &group.gene, &group.id, n))?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_fractions(path: &Path, rows: &[FractionRow], panel: &Panel) -> Result<()> {
    let mut wtr = csv_writer(path, b',')?;
    wtr.write_record(["cell", "gene", "polyA_group", "fraction"])?;
    for row in rows {
        wtr.serialize((&row.cell, &row.gene, &panel.group(row.group).id, format_fraction(row.fraction)))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_weighted_utr(path: &Path, rows: &[CellUtr]) -> Result<()> {
    let mut wtr = csv_writer(path, b',')?;
    wtr.write_record(["cell", "umis", "weighted_utr_length"])?;
    for row in rows {
        let utr = row.weighted_utr_length.map(|v| format!("{v:.2}")).unwrap_or_default();
        wtr.serialize((&row.cell, row.umis, utr))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Run-level metrics as `metric\tvalue` rows.
pub fn qc_metrics(qc: &QcReport, bam: Option<&BamStats>) -> Vec<(&'static str, u64)> {
    let r = &qc.reads;
    let mut metrics = Vec::new();
    if let Some(b) = bam {
        metrics.extend([
            ("bam_records", b.total_records),
            ("bam_unmapped", b.unmapped),
            ("bam_secondary", b.secondary),
            ("bam_supplementary", b.supplementary),
            ("bam_low_mapq", b.low_mapq),
        ]);
    }
    metrics.extend([
        ("reads_total", r.total_reads),
        ("reads_missing_tags", r.missing_tags),
        ("reads_off_target", r.off_target),
        ("reads_filtered_cell", r.filtered_cells),
        ("reads_inconsistent", r.inconsistent),
        ("reads_unassigned", r.unassigned),
        ("reads_assigned_tier1", r.assigned_reads.tier1),
        ("reads_assigned_tier3", r.assigned_reads.tier3),
        ("reads_ambiguous_tier1", r.ambiguous_reads.tier1),
        ("reads_ambiguous_tier3", r.ambiguous_reads.tier3),
        ("molecules", qc.molecules),
        ("molecule_conflicts", qc.molecule_conflicts),
        ("molecules_discarded", qc.discarded_molecules),
        ("umis_tier1", qc.umis.tier1),
        ("umis_tier3", qc.umis.tier3),
        ("umis_total", qc.umis.total()),
        ("cells_observed", qc.cells.len() as u64),
    ]);
    metrics
}

pub fn write_qc(path: &Path, qc: &QcReport, bam: Option<&BamStats>) -> Result<()> {
    let mut wtr = csv_writer(path, b'\t')?;
    wtr.write_record(["metric", "value"])?;
    for (metric, value) in qc_metrics(qc, bam) {
        wtr.serialize((metric, value))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_gene_qc(path: &Path, rows: &[GeneCoverage]) -> Result<()> {
    let mut wtr = csv_writer(path, b'\t')?;
    wtr.write_record([
        "gene",
        "cells_with_umi",
        "coverage",
        "umis",
        "ambiguous_reads",
        "unassigned_reads",
    ])?;
    for row in rows {
        wtr.serialize((
            &row.gene,
            row.cells_with_umi,
            format!("{:.4}", row.coverage),
            row.umis,
            row.ambiguous_reads,
            row.unassigned_reads,
        ))?;
    }
    wtr.flush()?;
    Ok(())
}
