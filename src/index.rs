use crate::panel::{EvidenceTier, Panel};
use crate::types::{GroupIdx, HashMap, HashMapExt, Pos};
use coitrees::{BasicCOITree, Interval, IntervalTree as CoitreeIntervalTree};
use std::collections::BTreeSet;

/// Payload stored on every interval: a group index, or a gene index for the
/// locus trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureRef {
    pub id: u32,
}

pub struct IntervalTree {
    intervals: Vec<Interval<FeatureRef>>,
    tree: Option<BasicCOITree<FeatureRef, u32>>,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
            tree: None,
        }
    }

    /// `start`/`end` are 1-based inclusive, which is what COITree expects.
    pub fn add_interval(&mut self, start: Pos, end: Pos, id: u32) {
        if end >= start {
            self.intervals
                .push(Interval::new(start as i32, end as i32, FeatureRef { id }));
        }
    }

    pub fn index(&mut self) {
        self.tree = Some(BasicCOITree::new(&self.intervals));
    }

    /// Distinct ids of every interval containing `pos`.
    pub fn ids_at(&self, pos: Pos) -> BTreeSet<u32> {
        let mut ids = BTreeSet::new();
        if let Some(tree) = self.tree.as_ref() {
            tree.query(pos as i32, pos as i32, |node| {
                ids.insert(node.metadata.id);
            });
        }
        ids
    }
}

impl Default for IntervalTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Trees for one strand of one chromosome.
#[derive(Default)]
struct StrandTrees {
    tier1: IntervalTree,
    tier3: IntervalTree,
    loci: IntervalTree,
}

impl StrandTrees {
    fn index(&mut self) {
        self.tier1.index();
        self.tier3.index();
        self.loci.index();
    }
}

/// Interval index over the features of the target genes of a panel.
///
/// Tier1 trees hold the last exons that are unique to their group; tier3
/// trees hold polyA windows plus last exons shared between groups. Locus
/// trees hold the hull of each gene's features and carry gene indices.
pub struct GroupIndex {
    // Per seqname: (forward, reverse)
    trees: HashMap<String, (StrandTrees, StrandTrees)>,
}

impl GroupIndex {
    /// `genes` pairs each target gene symbol with the index reported by
    /// [`GroupIndex::genes_at`].
    pub fn build<'g>(panel: &Panel, genes: impl IntoIterator<Item = (u32, &'g str)>) -> Self {
        let mut index = Self {
            trees: HashMap::new(),
        };
        for (gene_idx, gene) in genes {
            let mut hull: Option<(String, char, Pos, Pos)> = None;
            for &gidx in panel.gene_groups(gene) {
                let group = panel.group(gidx);
                let trees = index.get_trees_mut(&group.seqname, group.strand);
                for member in &group.members {
                    let le = member.last_exon;
                    match member.tier {
                        EvidenceTier::Tier1 => trees.tier1.add_interval(le.start, le.end, gidx),
                        EvidenceTier::Tier3 => trees.tier3.add_interval(le.start, le.end, gidx),
                    }
                }
                let w = group.polya_window;
                trees.tier3.add_interval(w.start, w.end, gidx);

                let lo = group.members.iter().map(|m| m.last_exon.start).fold(w.start, Pos::min);
                let hi = group.members.iter().map(|m| m.last_exon.end).fold(w.end, Pos::max);
                hull = Some(match hull {
                    Some((s, st, a, b)) => (s, st, a.min(lo), b.max(hi)),
                    None => (group.seqname.clone(), group.strand, lo, hi),
                });
            }
            if let Some((seqname, strand, lo, hi)) = hull {
                index.get_trees_mut(&seqname, strand).loci.add_interval(lo, hi, gene_idx);
            }
        }
        // Index all trees only after all intervals are inserted.
        for (fw, rc) in index.trees.values_mut() {
            fw.index();
            rc.index();
        }
        index
    }

    fn get_trees_mut(&mut self, seqname: &str, strand: char) -> &mut StrandTrees {
        let (fw, rc) = self.trees.entry(seqname.to_string()).or_default();
        if strand == '-' { rc } else { fw }
    }

    fn get_trees(&self, seqname: &str, strand: char) -> Option<&StrandTrees> {
        let pair = self.trees.get(seqname)?;
        if strand == '-' {
            Some(&pair.1)
        } else {
            Some(&pair.0)
        }
    }

    /// Distinct groups whose `tier` features contain `pos`.
    pub fn groups_at(&self, seqname: &str, strand: char, pos: Pos, tier: EvidenceTier) -> BTreeSet<GroupIdx> {
        match self.get_trees(seqname, strand) {
            Some(trees) => match tier {
                EvidenceTier::Tier1 => trees.tier1.ids_at(pos),
                EvidenceTier::Tier3 => trees.tier3.ids_at(pos),
            },
            None => BTreeSet::new(),
        }
    }

    /// Target genes whose feature hull contains `pos`.
    pub fn genes_at(&self, seqname: &str, strand: char, pos: Pos) -> BTreeSet<u32> {
        self.get_trees(seqname, strand)
            .map(|trees| trees.loci.ids_at(pos))
            .unwrap_or_default()
    }
}
