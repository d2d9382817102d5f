//! Panel construction: clustering transcript 3' ends into isoform groups.

use crate::annotation::{Transcript, TranscriptsByGene};
use crate::config::{ConfigError, GeneParams, PanelConfig};
use crate::relabel::{GroupDraft, RuleTable};
use crate::types::{GroupIdx, Interval, Pos};
use std::collections::BTreeMap;
use std::fmt;

/// Confidence of the genomic feature a read matched. Lower sorts better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvidenceTier {
    /// Last exon attributable to a single group.
    Tier1,
    /// PolyA window, or a last exon shared with another group.
    Tier3,
}

impl EvidenceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceTier::Tier1 => "tier1",
            EvidenceTier::Tier3 => "tier3",
        }
    }

    /// Accepts `tier1`/`tier3` as well as the `tier1_group`/`tier3_polyA`
    /// spellings of older panel tables.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tier1" | "tier1_group" => Some(EvidenceTier::Tier1),
            "tier3" | "tier3_polyA" | "tier3_group" => Some(EvidenceTier::Tier3),
            _ => None,
        }
    }
}

impl fmt::Display for EvidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transcript of a group together with its `last_exon_group` feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub transcript_id: String,
    pub transcript_name: String,
    pub last_exon: Interval,
    pub utr_length: Option<u32>,
    pub tier: EvidenceTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UtrStats {
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub mean: Option<f64>,
}

impl UtrStats {
    pub fn from_lengths(lengths: impl IntoIterator<Item = u32>) -> Self {
        let lengths: Vec<u32> = lengths.into_iter().collect();
        if lengths.is_empty() {
            return Self::default();
        }
        let sum: u64 = lengths.iter().map(|&l| l as u64).sum();
        Self {
            min: lengths.iter().min().copied(),
            max: lengths.iter().max().copied(),
            mean: Some(sum as f64 / lengths.len() as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsoformGroup {
    pub id: String,
    pub gene: String,
    pub seqname: String,
    pub strand: char,
    pub members: Vec<Member>,
    pub polya_window: Interval,
    pub utr: UtrStats,
}

impl IsoformGroup {
    /// `tier1` when at least one member's last exon is unique to this group.
    pub fn tier(&self) -> EvidenceTier {
        self.members
            .iter()
            .map(|m| m.tier)
            .min()
            .unwrap_or(EvidenceTier::Tier3)
    }

    pub fn window_feature_id(&self) -> String {
        format!("{}_window", self.id)
    }

    pub fn exon_feature_id(&self, member: &Member) -> String {
        format!("{}_exon_{}", self.id, member.transcript_id)
    }
}

/// Gene symbol -> isoform groups, the unit handed to the assignment engine.
#[derive(Debug, Clone, Default)]
pub struct Panel {
    groups: Vec<IsoformGroup>,
    by_gene: BTreeMap<String, Vec<GroupIdx>>,
}

impl Panel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the groups of one gene. Group ids must be unique panel-wide.
    ///
    /// Last exons shared between the gene's groups are demoted to tier3 here,
    /// whatever tier the caller gave them.
    pub fn push_gene(&mut self, gene: &str, mut groups: Vec<IsoformGroup>) {
        assign_tiers(&mut groups);
        let idxs = self.by_gene.entry(gene.to_string()).or_default();
        for group in groups {
            idxs.push(self.groups.len() as GroupIdx);
            self.groups.push(group);
        }
    }

    pub fn groups(&self) -> &[IsoformGroup] {
        &self.groups
    }

    pub fn group(&self, idx: GroupIdx) -> &IsoformGroup {
        &self.groups[idx as usize]
    }

    pub fn genes(&self) -> impl Iterator<Item = &str> {
        self.by_gene.keys().map(String::as_str)
    }

    pub fn contains_gene(&self, gene: &str) -> bool {
        self.by_gene.contains_key(gene)
    }

    pub fn gene_groups(&self, gene: &str) -> &[GroupIdx] {
        self.by_gene.get(gene).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, group_id: &str) -> Option<GroupIdx> {
        self.groups
            .iter()
            .position(|g| g.id == group_id)
            .map(|i| i as GroupIdx)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneStatus {
    /// Two or more groups: the gene carries isoform signal.
    Informative,
    /// Several transcripts that all fall into one group.
    Collapsed,
    /// A single transcript.
    Singleton,
    /// Absent from the annotation or without a usable transcript.
    Skipped,
}

impl GeneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GeneStatus::Informative => "informative",
            GeneStatus::Collapsed => "collapsed",
            GeneStatus::Singleton => "singleton",
            GeneStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneSummary {
    pub gene: String,
    pub num_transcripts: usize,
    pub num_groups: usize,
    pub status: GeneStatus,
    pub in_panel: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PanelBuild {
    pub panel: Panel,
    pub summary: Vec<GeneSummary>,
}

impl PanelBuild {
    pub fn summary_for(&self, gene: &str) -> Option<&GeneSummary> {
        self.summary.iter().find(|s| s.gene == gene)
    }
}

/// Build the isoform panel for `genes`.
///
/// Configuration problems are reported before any gene is touched. Per-gene
/// problems (gene absent, malformed transcripts) are logged and reflected in
/// the summary without aborting.
pub fn build_panel(
    genes: &[String],
    transcripts: &TranscriptsByGene,
    config: &PanelConfig,
    rules: &RuleTable,
) -> Result<PanelBuild, ConfigError> {
    config.validate(genes)?;

    let mut out = PanelBuild::default();
    for gene in genes {
        let valid = usable_transcripts(gene, transcripts.get(gene).map(Vec::as_slice).unwrap_or(&[]));
        if valid.is_empty() {
            tracing::warn!(gene = %gene, "gene not found in annotation or has no usable transcript; skipping");
            out.summary.push(GeneSummary {
                gene: gene.clone(),
                num_transcripts: 0,
                num_groups: 0,
                status: GeneStatus::Skipped,
                in_panel: false,
            });
            continue;
        }

        let num_transcripts = valid.len();
        if num_transcripts == 1 && config.skip_singleton {
            tracing::info!(gene = %gene, "only one transcript; skipping");
            out.summary.push(GeneSummary {
                gene: gene.clone(),
                num_transcripts,
                num_groups: 0,
                status: GeneStatus::Singleton,
                in_panel: false,
            });
            continue;
        }

        let params = config.params_for(gene, num_transcripts);
        tracing::debug!(
            gene = %gene,
            window = params.polya_window,
            tolerance = params.end_tolerance,
            "resolved gene parameters"
        );

        let drafts: Vec<GroupDraft<'_>> = cluster_three_prime_ends(&valid, params.end_tolerance)
            .into_iter()
            .enumerate()
            .map(|(i, members)| GroupDraft::new(format!("polyA{}", i + 1), members))
            .collect();
        let drafts: Vec<GroupDraft<'_>> = rules
            .apply(gene, drafts)
            .into_iter()
            .filter(|draft| {
                if draft.members.is_empty() {
                    tracing::warn!(gene = %gene, label = %draft.label, "relabel rule produced an empty group; dropping");
                }
                !draft.members.is_empty()
            })
            .collect();

        let status = if num_transcripts == 1 {
            GeneStatus::Singleton
        } else if drafts.len() <= 1 {
            GeneStatus::Collapsed
        } else {
            GeneStatus::Informative
        };
        let in_panel = !(status == GeneStatus::Collapsed && config.skip_collapsed);
        out.summary.push(GeneSummary {
            gene: gene.clone(),
            num_transcripts,
            num_groups: drafts.len(),
            status,
            in_panel,
        });
        if !in_panel {
            tracing::info!(gene = %gene, "collapsed into one group; skipping");
            continue;
        }

        let groups = finalize_groups(gene, drafts, params);
        tracing::info!(gene = %gene, transcripts = num_transcripts, groups = groups.len(), status = status.as_str(), "built isoform groups");
        out.panel.push_gene(gene, groups);
    }
    Ok(out)
}

/// Drop transcripts with malformed coordinates or a location that disagrees
/// with the gene's first valid transcript.
fn usable_transcripts<'a>(gene: &str, transcripts: &'a [Transcript]) -> Vec<&'a Transcript> {
    let mut valid: Vec<&Transcript> = Vec::with_capacity(transcripts.len());
    for tx in transcripts {
        if let Err(e) = tx.validate() {
            tracing::warn!(gene, error = %e, "rejecting transcript");
            continue;
        }
        if let Some(first) = valid.first()
            && (first.seqname != tx.seqname || first.strand != tx.strand)
        {
            tracing::warn!(
                gene,
                transcript = %tx.id,
                "transcript location {}:{} disagrees with gene location {}:{}; rejecting",
                tx.seqname, tx.strand, first.seqname, first.strand
            );
            continue;
        }
        valid.push(tx);
    }
    valid
}

/// Greedy sweep over sorted 3' ends: a transcript joins the open cluster
/// while its end lies within `tolerance` of the previous member's end.
///
/// Clusters are returned in transcription order, i.e. ascending coordinate on
/// the plus strand and descending on the minus strand.
pub fn cluster_three_prime_ends<'a>(
    transcripts: &[&'a Transcript],
    tolerance: u32,
) -> Vec<Vec<&'a Transcript>> {
    let mut sorted: Vec<&Transcript> = transcripts.to_vec();
    sorted.sort_by(|a, b| {
        a.three_prime_end()
            .cmp(&b.three_prime_end())
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut clusters: Vec<Vec<&Transcript>> = Vec::new();
    let mut current: Vec<&Transcript> = Vec::new();
    for tx in sorted {
        let joins = current
            .last()
            .is_some_and(|prev| tx.three_prime_end() - prev.three_prime_end() <= tolerance);
        if !joins && !current.is_empty() {
            clusters.push(std::mem::take(&mut current));
        }
        current.push(tx);
    }
    if !current.is_empty() {
        clusters.push(current);
    }

    if transcripts.first().is_some_and(|tx| tx.strand == '-') {
        clusters.reverse();
        for cluster in &mut clusters {
            cluster.reverse();
        }
    }
    clusters
}

/// PolyA window of a cluster: its span of 3' ends padded by half the
/// tolerance, widened to at least `window` on either side of the mean end.
pub fn polya_window(ends: &[Pos], params: GeneParams) -> Interval {
    let min_end = ends.iter().copied().min().unwrap_or(0);
    let max_end = ends.iter().copied().max().unwrap_or(0);
    let mean = if ends.is_empty() {
        0
    } else {
        (ends.iter().map(|&e| e as u64).sum::<u64>() / ends.len() as u64) as Pos
    };
    let half = params.end_tolerance / 2;
    let start = min_end
        .saturating_sub(half)
        .min(mean.saturating_sub(params.polya_window))
        .max(1);
    let end = max_end
        .saturating_add(half)
        .max(mean.saturating_add(params.polya_window));
    Interval::new(start, end)
}

fn finalize_groups(gene: &str, drafts: Vec<GroupDraft<'_>>, params: GeneParams) -> Vec<IsoformGroup> {
    drafts
        .into_iter()
        .map(|draft| {
            let anchor = if draft.anchor.is_empty() { &draft.members } else { &draft.anchor };
            let ends: Vec<Pos> = anchor.iter().map(|tx| tx.three_prime_end()).collect();
            let first = draft.members[0];
            IsoformGroup {
                id: format!("{}_{}", gene, draft.label),
                gene: gene.to_string(),
                seqname: first.seqname.clone(),
                strand: first.strand,
                members: draft
                    .members
                    .iter()
                    .map(|tx| Member {
                        transcript_id: tx.id.clone(),
                        transcript_name: tx.display_name().to_string(),
                        last_exon: tx.last_exon,
                        utr_length: tx.utr_length,
                        tier: EvidenceTier::Tier1,
                    })
                    .collect(),
                polya_window: polya_window(&ends, params),
                utr: UtrStats::from_lengths(draft.members.iter().filter_map(|tx| tx.utr_length)),
            }
        })
        .collect()
}

/// Demote every last exon that overlaps a last exon of another group of the
/// same gene to tier3, so tier1 regions of distinct groups never overlap.
pub fn assign_tiers(groups: &mut [IsoformGroup]) {
    let mut demoted: Vec<(usize, usize)> = Vec::new();
    for (gi, group) in groups.iter().enumerate() {
        for (mi, member) in group.members.iter().enumerate() {
            let shared = groups.iter().enumerate().any(|(gj, other)| {
                gj != gi
                    && other
                        .members
                        .iter()
                        .any(|m| m.last_exon.overlaps(&member.last_exon))
            });
            if shared {
                demoted.push((gi, mi));
            }
        }
    }
    for (gi, mi) in demoted {
        let group = &mut groups[gi];
        tracing::debug!(
            group = %group.id,
            transcript = %group.members[mi].transcript_id,
            "last exon shared across groups; demoted to tier3"
        );
        group.members[mi].tier = EvidenceTier::Tier3;
    }
}
