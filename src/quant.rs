//! Aggregates produced by the assignment engine and the tables derived from
//! them.

use crate::panel::{EvidenceTier, Panel};
use crate::types::GroupIdx;
use std::collections::{BTreeMap, BTreeSet};

/// Counters split by evidence tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub tier1: u64,
    pub tier3: u64,
}

impl TierCounts {
    pub fn add(&mut self, tier: EvidenceTier, n: u64) {
        match tier {
            EvidenceTier::Tier1 => self.tier1 += n,
            EvidenceTier::Tier3 => self.tier3 += n,
        }
    }

    pub fn get(&self, tier: EvidenceTier) -> u64 {
        match tier {
            EvidenceTier::Tier1 => self.tier1,
            EvidenceTier::Tier3 => self.tier3,
        }
    }

    pub fn total(&self) -> u64 {
        self.tier1 + self.tier3
    }

    fn merge(&mut self, other: &TierCounts) {
        self.tier1 += other.tier1;
        self.tier3 += other.tier3;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneReadQc {
    pub assigned_reads: u64,
    pub ambiguous_reads: u64,
    pub unassigned_reads: u64,
}

/// Read-level tallies, before molecule deduplication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadQc {
    pub total_reads: u64,
    pub missing_tags: u64,
    pub off_target: u64,
    pub filtered_cells: u64,
    /// Reads whose location contradicts their gene tag. Also counted in
    /// `unassigned`.
    pub inconsistent: u64,
    pub unassigned: u64,
    pub assigned_reads: TierCounts,
    pub ambiguous_reads: TierCounts,
    pub per_gene: BTreeMap<String, GeneReadQc>,
}

impl ReadQc {
    pub fn gene_mut(&mut self, gene: &str) -> &mut GeneReadQc {
        self.per_gene.entry(gene.to_string()).or_default()
    }

    pub fn merge(&mut self, other: &ReadQc) {
        self.total_reads += other.total_reads;
        self.missing_tags += other.missing_tags;
        self.off_target += other.off_target;
        self.filtered_cells += other.filtered_cells;
        self.inconsistent += other.inconsistent;
        self.unassigned += other.unassigned;
        self.assigned_reads.merge(&other.assigned_reads);
        self.ambiguous_reads.merge(&other.ambiguous_reads);
        for (gene, q) in &other.per_gene {
            let mine = self.gene_mut(gene);
            mine.assigned_reads += q.assigned_reads;
            mine.ambiguous_reads += q.ambiguous_reads;
            mine.unassigned_reads += q.unassigned_reads;
        }
    }
}

/// Run-level QC: read tallies plus molecule-level outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QcReport {
    pub reads: ReadQc,
    /// UMIs counted, by the tier of the winning group's best evidence.
    pub umis: TierCounts,
    pub molecules: u64,
    pub molecule_conflicts: u64,
    pub discarded_molecules: u64,
    /// Cells with at least one read that reached matching.
    pub cells: BTreeSet<String>,
}

impl QcReport {
    pub fn merge(&mut self, other: QcReport) {
        self.reads.merge(&other.reads);
        self.umis.merge(&other.umis);
        self.molecules += other.molecules;
        self.molecule_conflicts += other.molecule_conflicts;
        self.discarded_molecules += other.discarded_molecules;
        self.cells.extend(other.cells);
    }
}

/// Cell x group UMI counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountMatrix {
    cells: BTreeMap<String, BTreeMap<GroupIdx, u64>>,
}

impl CountMatrix {
    pub fn add(&mut self, cell: &str, group: GroupIdx, n: u64) {
        *self
            .cells
            .entry(cell.to_string())
            .or_default()
            .entry(group)
            .or_insert(0) += n;
    }

    pub fn get(&self, cell: &str, group: GroupIdx) -> u64 {
        self.cells
            .get(cell)
            .and_then(|row| row.get(&group))
            .copied()
            .unwrap_or(0)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &BTreeMap<GroupIdx, u64>)> {
        self.cells.iter().map(|(c, row)| (c.as_str(), row))
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn total(&self) -> u64 {
        self.cells.values().flat_map(|row| row.values()).sum()
    }

    /// Element-wise sum. Commutative and associative.
    pub fn merge(&mut self, other: CountMatrix) {
        for (cell, row) in other.cells {
            let mine = self.cells.entry(cell).or_default();
            for (group, n) in row {
                *mine.entry(group).or_insert(0) += n;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FractionRow {
    pub cell: String,
    pub gene: String,
    pub group: GroupIdx,
    /// `None` when the cell has no UMI for the gene.
    pub fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellUtr {
    pub cell: String,
    pub umis: u64,
    pub weighted_utr_length: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneCoverage {
    pub gene: String,
    pub cells_with_umi: usize,
    /// Fraction of observed cells with at least one UMI for the gene.
    pub coverage: f64,
    pub umis: u64,
    pub ambiguous_reads: u64,
    pub unassigned_reads: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Quantification {
    pub counts: CountMatrix,
    pub qc: QcReport,
}

impl Quantification {
    pub fn merge(&mut self, other: Quantification) {
        self.counts.merge(other.counts);
        self.qc.merge(other.qc);
    }

    /// Every observed cell plus every cell with a count.
    fn all_cells(&self) -> BTreeSet<&str> {
        let mut cells: BTreeSet<&str> = self.qc.cells.iter().map(String::as_str).collect();
        cells.extend(self.counts.cells().map(|(c, _)| c));
        cells
    }

    /// Per-cell isoform fractions, normalised within each gene. A cell with
    /// no UMI for a gene gets undefined fractions rather than zeros.
    pub fn fractions(&self, panel: &Panel, genes: &[String]) -> Vec<FractionRow> {
        let mut rows = Vec::new();
        for cell in self.all_cells() {
            for gene in genes {
                let groups = panel.gene_groups(gene);
                let total: u64 = groups.iter().map(|&g| self.counts.get(cell, g)).sum();
                for &g in groups {
                    let fraction = (total > 0).then(|| self.counts.get(cell, g) as f64 / total as f64);
                    rows.push(FractionRow {
                        cell: cell.to_string(),
                        gene: gene.clone(),
                        group: g,
                        fraction,
                    });
                }
            }
        }
        rows
    }

    /// UMI-weighted mean of the assigned groups' mean UTR lengths, per cell.
    /// Groups without a UTR estimate do not contribute to the weights.
    pub fn weighted_utr(&self, panel: &Panel) -> Vec<CellUtr> {
        self.counts
            .cells()
            .map(|(cell, row)| {
                let mut weight = 0u64;
                let mut sum = 0f64;
                for (&g, &n) in row {
                    if let Some(mean) = panel.group(g).utr.mean {
                        weight += n;
                        sum += mean * n as f64;
                    }
                }
                CellUtr {
                    cell: cell.to_string(),
                    umis: row.values().sum(),
                    weighted_utr_length: (weight > 0).then(|| sum / weight as f64),
                }
            })
            .collect()
    }

    pub fn gene_coverage(&self, panel: &Panel, genes: &[String]) -> Vec<GeneCoverage> {
        let observed = self.all_cells().len();
        genes
            .iter()
            .map(|gene| {
                let groups = panel.gene_groups(gene);
                let mut cells_with_umi = 0;
                let mut umis = 0;
                for (_, row) in self.counts.cells() {
                    let n: u64 = groups.iter().filter_map(|g| row.get(g)).sum();
                    if n > 0 {
                        cells_with_umi += 1;
                        umis += n;
                    }
                }
                let reads = self.qc.reads.per_gene.get(gene).copied().unwrap_or_default();
                GeneCoverage {
                    gene: gene.clone(),
                    cells_with_umi,
                    coverage: if observed > 0 {
                        cells_with_umi as f64 / observed as f64
                    } else {
                        0.0
                    },
                    umis,
                    ambiguous_reads: reads.ambiguous_reads,
                    unassigned_reads: reads.unassigned_reads,
                }
            })
            .collect()
    }
}
