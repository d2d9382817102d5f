//! Read-to-group assignment with tiered evidence and UMI deduplication.

use crate::config::ConfigError;
use crate::index::GroupIndex;
use crate::panel::{EvidenceTier, Panel};
use crate::quant::{CountMatrix, QcReport, Quantification, ReadQc};
use crate::types::{GroupIdx, HashMap, HashMapExt, HashSet, HashSetExt, Pos};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One aligned-read observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub seqname: String,
    /// 1-based position of the read's 3' end.
    pub pos: Pos,
    pub strand: char,
    /// Gene symbol(s) from the aligner, `;`-separated when several.
    pub gene: Option<String>,
    pub cell: Option<String>,
    pub umi: Option<String>,
}

impl ReadEvent {
    pub fn new(seqname: &str, pos: Pos, strand: char, cell: &str, umi: &str) -> Self {
        Self {
            seqname: seqname.to_string(),
            pos,
            strand,
            gene: None,
            cell: Some(cell.to_string()),
            umi: Some(umi.to_string()),
        }
    }

    pub fn with_gene(mut self, gene: &str) -> Self {
        self.gene = Some(gene.to_string());
        self
    }
}

/// Result of matching one read against the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Assigned { group: GroupIdx, tier: EvidenceTier },
    /// Several distinct groups at the first tier that matched.
    Ambiguous {
        tier: EvidenceTier,
        groups: BTreeSet<GroupIdx>,
    },
    Unassigned,
}

impl Match {
    /// Apply the one/zero/many rule to a set of distinct group ids.
    /// Returns `None` when the set is empty so the caller can fall back to
    /// the next tier.
    pub fn from_groups(groups: BTreeSet<GroupIdx>, tier: EvidenceTier) -> Option<Self> {
        match groups.len() {
            0 => None,
            1 => groups
                .first()
                .map(|&group| Match::Assigned { group, tier }),
            _ => Some(Match::Ambiguous { tier, groups }),
        }
    }
}

/// What happened to a read before and during matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Cell barcode or UMI missing.
    MissingTags,
    /// Not in a target gene, by tag or by position.
    OffTarget,
    /// Cell not in the whitelist.
    FilteredCell,
    /// Chromosome/strand disagrees with every claimed target gene.
    Inconsistent,
    Matched(Match),
}

/// Tie-break for a molecule whose reads resolve to more than one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Best tier, then most supporting reads, then group id.
    #[default]
    TierFirst,
    /// Most supporting reads, then best tier, then group id.
    MajorityFirst,
    /// Drop conflicting molecules.
    Discard,
}

impl ConflictPolicy {
    pub fn name(self) -> &'static str {
        match self {
            ConflictPolicy::TierFirst => "tier-first",
            ConflictPolicy::MajorityFirst => "majority-first",
            ConflictPolicy::Discard => "discard",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tier-first" => Ok(ConflictPolicy::TierFirst),
            "majority-first" => Ok(ConflictPolicy::MajorityFirst),
            "discard" => Ok(ConflictPolicy::Discard),
            _ => Err(ConfigError::UnknownConflictPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Genes to quantify; all panel genes when `None`.
    pub target_genes: Option<Vec<String>>,
    pub conflict_policy: ConflictPolicy,
    /// Restrict counting to these cell barcodes.
    pub cell_whitelist: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MoleculeKey {
    cell: String,
    gene: u32,
    umi: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupSupport {
    group: GroupIdx,
    reads: u32,
    best_tier: EvidenceTier,
}

/// Per-shard state: molecule tallies plus read-level QC.
#[derive(Debug, Default)]
pub struct Accumulator {
    molecules: HashMap<MoleculeKey, Vec<GroupSupport>>,
    qc: ReadQc,
    cells: HashSet<String>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            molecules: HashMap::new(),
            qc: ReadQc::default(),
            cells: HashSet::new(),
        }
    }

    fn add_support(&mut self, key: MoleculeKey, group: GroupIdx, tier: EvidenceTier) {
        let tally = self.molecules.entry(key).or_default();
        match tally.iter_mut().find(|s| s.group == group) {
            Some(s) => {
                s.reads += 1;
                s.best_tier = s.best_tier.min(tier);
            }
            None => tally.push(GroupSupport {
                group,
                reads: 1,
                best_tier: tier,
            }),
        }
    }

    /// Fold another accumulator's raw tallies into this one. Summation is
    /// order-independent, so shards may be merged in any order.
    pub fn merge(&mut self, other: Accumulator) {
        for (key, supports) in other.molecules {
            let tally = self.molecules.entry(key).or_default();
            for s in supports {
                match tally.iter_mut().find(|t| t.group == s.group) {
                    Some(t) => {
                        t.reads += s.reads;
                        t.best_tier = t.best_tier.min(s.best_tier);
                    }
                    None => tally.push(s),
                }
            }
        }
        self.qc.merge(&other.qc);
        self.cells.extend(other.cells);
    }

    pub fn qc(&self) -> &ReadQc {
        &self.qc
    }

    pub fn molecules(&self) -> usize {
        self.molecules.len()
    }
}

pub struct AssignmentEngine<'p> {
    panel: &'p Panel,
    index: GroupIndex,
    genes: Vec<String>,
    gene_ids: BTreeMap<String, u32>,
    /// (seqname, strand) of each target gene, by gene index.
    loci: Vec<(String, char)>,
    config: EngineConfig,
}

impl<'p> AssignmentEngine<'p> {
    pub fn new(panel: &'p Panel, config: EngineConfig) -> Result<Self, ConfigError> {
        let genes: Vec<String> = match &config.target_genes {
            Some(targets) => {
                for gene in targets {
                    if !panel.contains_gene(gene) {
                        return Err(ConfigError::UnknownTargetGene { gene: gene.clone() });
                    }
                }
                targets
                    .iter()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            }
            None => panel.genes().map(str::to_string).collect(),
        };
        let genes: Vec<String> = genes
            .into_iter()
            .filter(|g| !panel.gene_groups(g).is_empty())
            .collect();

        let gene_ids: BTreeMap<String, u32> = genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.clone(), i as u32))
            .collect();
        let loci = genes
            .iter()
            .map(|g| {
                let first = panel.group(panel.gene_groups(g)[0]);
                (first.seqname.clone(), first.strand)
            })
            .collect();
        let index = GroupIndex::build(
            panel,
            genes.iter().enumerate().map(|(i, g)| (i as u32, g.as_str())),
        );
        tracing::info!(
            genes = genes.len(),
            policy = %config.conflict_policy,
            "assignment engine ready"
        );
        Ok(Self {
            panel,
            index,
            genes,
            gene_ids,
            loci,
            config,
        })
    }

    pub fn panel(&self) -> &Panel {
        self.panel
    }

    pub fn target_genes(&self) -> &[String] {
        &self.genes
    }

    /// Candidate target genes for a read: its tagged genes, or the genes
    /// whose locus contains the read when untagged.
    fn candidate_genes(&self, event: &ReadEvent) -> Result<BTreeSet<u32>, ReadOutcome> {
        match &event.gene {
            Some(tag) => {
                let tagged: BTreeSet<u32> = tag
                    .split(';')
                    .filter_map(|g| self.gene_ids.get(g.trim()).copied())
                    .collect();
                if tagged.is_empty() {
                    return Err(ReadOutcome::OffTarget);
                }
                let consistent: BTreeSet<u32> = tagged
                    .into_iter()
                    .filter(|&g| {
                        let (seqname, strand) = &self.loci[g as usize];
                        *seqname == event.seqname && *strand == event.strand
                    })
                    .collect();
                if consistent.is_empty() {
                    return Err(ReadOutcome::Inconsistent);
                }
                Ok(consistent)
            }
            None => {
                let genes = self.index.genes_at(&event.seqname, event.strand, event.pos);
                if genes.is_empty() {
                    return Err(ReadOutcome::OffTarget);
                }
                Ok(genes)
            }
        }
    }

    fn groups_at(&self, event: &ReadEvent, tier: EvidenceTier, genes: &BTreeSet<u32>) -> BTreeSet<GroupIdx> {
        self.index
            .groups_at(&event.seqname, event.strand, event.pos, tier)
            .into_iter()
            .filter(|&g| {
                self.gene_ids
                    .get(&self.panel.group(g).gene)
                    .is_some_and(|id| genes.contains(id))
            })
            .collect()
    }

    /// Match a read: tier1 last exons first, polyA windows second. Matches
    /// are collected as a set of group ids, so several same-group transcripts
    /// covering the position still count as one unambiguous hit.
    pub fn match_read(&self, event: &ReadEvent, genes: &BTreeSet<u32>) -> Match {
        for tier in [EvidenceTier::Tier1, EvidenceTier::Tier3] {
            let groups = self.groups_at(event, tier, genes);
            if let Some(m) = Match::from_groups(groups, tier) {
                return m;
            }
        }
        Match::Unassigned
    }

    pub fn classify(&self, event: &ReadEvent) -> ReadOutcome {
        self.classify_with_genes(event).0
    }

    fn classify_with_genes(&self, event: &ReadEvent) -> (ReadOutcome, BTreeSet<u32>) {
        let (Some(cell), Some(_)) = (&event.cell, &event.umi) else {
            return (ReadOutcome::MissingTags, BTreeSet::new());
        };
        if let Some(whitelist) = &self.config.cell_whitelist
            && !whitelist.contains(cell)
        {
            return (ReadOutcome::FilteredCell, BTreeSet::new());
        }
        match self.candidate_genes(event) {
            Ok(genes) => (ReadOutcome::Matched(self.match_read(event, &genes)), genes),
            Err(outcome) => (outcome, BTreeSet::new()),
        }
    }

    /// Classify a read and fold it into `acc`.
    pub fn observe(&self, acc: &mut Accumulator, event: &ReadEvent) {
        let (outcome, genes) = self.classify_with_genes(event);
        let qc = &mut acc.qc;
        qc.total_reads += 1;
        match outcome {
            ReadOutcome::MissingTags => qc.missing_tags += 1,
            ReadOutcome::OffTarget => qc.off_target += 1,
            ReadOutcome::FilteredCell => qc.filtered_cells += 1,
            ReadOutcome::Inconsistent => {
                qc.inconsistent += 1;
                qc.unassigned += 1;
            }
            ReadOutcome::Matched(m) => {
                let (Some(cell), Some(umi)) = (&event.cell, &event.umi) else {
                    return;
                };
                if !acc.cells.contains(cell.as_str()) {
                    acc.cells.insert(cell.clone());
                }
                match m {
                    Match::Assigned { group, tier } => {
                        qc.assigned_reads.add(tier, 1);
                        let gene = &self.panel.group(group).gene;
                        qc.gene_mut(gene).assigned_reads += 1;
                        let key = MoleculeKey {
                            cell: cell.clone(),
                            gene: self.gene_ids[gene],
                            umi: umi.clone(),
                        };
                        acc.add_support(key, group, tier);
                    }
                    Match::Ambiguous { tier, groups } => {
                        qc.ambiguous_reads.add(tier, 1);
                        let genes: BTreeSet<&str> =
                            groups.iter().map(|&g| self.panel.group(g).gene.as_str()).collect();
                        for gene in genes {
                            qc.gene_mut(gene).ambiguous_reads += 1;
                        }
                    }
                    Match::Unassigned => {
                        qc.unassigned += 1;
                        for g in genes {
                            qc.gene_mut(&self.genes[g as usize]).unassigned_reads += 1;
                        }
                    }
                }
            }
        }
    }

    /// Resolve every molecule to at most one group and build the counts.
    pub fn finish(&self, acc: Accumulator) -> Quantification {
        let mut counts = CountMatrix::default();
        let mut qc = QcReport {
            reads: acc.qc,
            cells: acc.cells.into_iter().collect(),
            ..Default::default()
        };

        for (key, supports) in acc.molecules {
            qc.molecules += 1;
            let winner = if supports.len() == 1 {
                Some(supports[0])
            } else {
                qc.molecule_conflicts += 1;
                self.resolve_conflict(&supports)
            };
            match winner {
                Some(s) => {
                    counts.add(&key.cell, s.group, 1);
                    qc.umis.add(s.best_tier, 1);
                }
                None => qc.discarded_molecules += 1,
            }
        }
        Quantification { counts, qc }
    }

    fn resolve_conflict(&self, supports: &[GroupSupport]) -> Option<GroupSupport> {
        let id = |s: &GroupSupport| self.panel.group(s.group).id.as_str();
        match self.config.conflict_policy {
            ConflictPolicy::TierFirst => supports
                .iter()
                .min_by_key(|s| (s.best_tier, Reverse(s.reads), id(s)))
                .copied(),
            ConflictPolicy::MajorityFirst => supports
                .iter()
                .min_by_key(|s| (Reverse(s.reads), s.best_tier, id(s)))
                .copied(),
            ConflictPolicy::Discard => None,
        }
    }

    /// Single-pass convenience over an in-memory stream.
    pub fn quantify<I>(&self, events: I) -> Quantification
    where
        I: IntoIterator<Item = ReadEvent>,
    {
        let mut acc = Accumulator::new();
        for event in events {
            self.observe(&mut acc, &event);
        }
        self.finish(acc)
    }
}
