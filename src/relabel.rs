//! Gene-family relabeling of clustered isoform groups.
//!
//! Clustering names groups `polyA1..n` in transcription order. Some gene
//! families carry a well-known biological reading of those groups, so a
//! [`RuleTable`] maps gene symbols to a [`RelabelRule`] that may rename,
//! merge or split the drafts before the panel is finalised.

use crate::annotation::Transcript;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Immunoglobulin heavy-chain constant-region genes whose polyA groups split
/// into secreted (`short`) and membrane-bound (`long`) forms.
pub const IG_CONSTANT_GENES: [&str; 8] = [
    "IGHM", "IGHG1", "IGHG2", "IGHG3", "IGHG4", "IGHA1", "IGHA2", "IGHE",
];

/// A cluster of transcripts awaiting its final group label.
///
/// `anchor` holds the members whose 3' ends place the polyA window. It is
/// the whole cluster unless a rule merged clusters together.
#[derive(Debug, Clone)]
pub struct GroupDraft<'a> {
    pub label: String,
    pub members: Vec<&'a Transcript>,
    pub anchor: Vec<&'a Transcript>,
}

impl<'a> GroupDraft<'a> {
    pub fn new(label: impl Into<String>, members: Vec<&'a Transcript>) -> Self {
        Self {
            label: label.into(),
            anchor: members.clone(),
            members,
        }
    }

    pub fn with_anchor(mut self, anchor: Vec<&'a Transcript>) -> Self {
        self.anchor = anchor;
        self
    }
}

pub trait RelabelRule: Send + Sync + fmt::Debug {
    /// Rewrite the drafts of one gene. Drafts arrive in transcription order
    /// (most proximal polyA site first) and every transcript must still be
    /// present exactly once in the output.
    fn relabel<'a>(&self, gene: &str, drafts: Vec<GroupDraft<'a>>) -> Vec<GroupDraft<'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsoformClass {
    Short,
    Long,
}

impl IsoformClass {
    pub fn label(self) -> &'static str {
        match self {
            IsoformClass::Short => "short",
            IsoformClass::Long => "long",
        }
    }
}

/// Two-class rule: the proximal group is `short`, every other group `long`.
/// Transcripts listed in `exceptions` take the given class regardless of the
/// group they clustered into.
#[derive(Debug, Clone, Default)]
pub struct ShortLongRule {
    exceptions: BTreeMap<String, IsoformClass>,
}

impl ShortLongRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule used for the immunoglobulin constant genes. `IGHG1-203` ends with
    /// the membrane exons but encodes the secreted form.
    pub fn immunoglobulin() -> Self {
        Self::new().with_exception("IGHG1-203", IsoformClass::Short)
    }

    pub fn with_exception(mut self, transcript: &str, class: IsoformClass) -> Self {
        self.exceptions.insert(transcript.to_string(), class);
        self
    }

    fn class_of(&self, tx: &Transcript, positional: IsoformClass) -> IsoformClass {
        self.exceptions
            .get(tx.display_name())
            .or_else(|| self.exceptions.get(&tx.id))
            .copied()
            .unwrap_or(positional)
    }
}

impl RelabelRule for ShortLongRule {
    /// A class gathering several clusters keeps the window of the cluster
    /// that contributed the most positional members. Transcripts moved in by
    /// an exception keep their last exons but do not stretch the window.
    fn relabel<'a>(&self, gene: &str, drafts: Vec<GroupDraft<'a>>) -> Vec<GroupDraft<'a>> {
        // Per class: (positional members, transcripts) for every source cluster.
        let mut pieces: [Vec<(usize, Vec<&'a Transcript>)>; 2] = Default::default();
        for (i, draft) in drafts.into_iter().enumerate() {
            let positional = if i == 0 {
                IsoformClass::Short
            } else {
                IsoformClass::Long
            };
            let mut split: [Vec<&'a Transcript>; 2] = Default::default();
            for tx in draft.members {
                let class = self.class_of(tx, positional);
                if class != positional {
                    tracing::debug!(gene, transcript = tx.display_name(), class = class.label(), "named exception");
                }
                split[class as usize].push(tx);
            }
            for (c, txs) in split.into_iter().enumerate() {
                if txs.is_empty() {
                    continue;
                }
                let n = if c == positional as usize { txs.len() } else { 0 };
                pieces[c].push((n, txs));
            }
        }

        [IsoformClass::Short, IsoformClass::Long]
            .into_iter()
            .zip(pieces)
            .filter(|(_, ps)| !ps.is_empty())
            .map(|(class, ps)| {
                let anchor = ps
                    .iter()
                    .enumerate()
                    .max_by_key(|(j, (n, txs))| (*n, txs.len(), Reverse(*j)))
                    .map(|(_, (_, txs))| txs.clone())
                    .unwrap_or_default();
                let members = ps.into_iter().flat_map(|(_, txs)| txs).collect();
                GroupDraft::new(class.label(), members).with_anchor(anchor)
            })
            .collect()
    }
}

/// Gene symbol -> relabeling rule.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: BTreeMap<String, Arc<dyn RelabelRule>>,
}

impl RuleTable {
    /// A table without any rules; every gene keeps its numeric labels.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The immunoglobulin short/long rule registered for every gene in
    /// [`IG_CONSTANT_GENES`].
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        let ig: Arc<dyn RelabelRule> = Arc::new(ShortLongRule::immunoglobulin());
        for gene in IG_CONSTANT_GENES {
            table.register(gene, Arc::clone(&ig));
        }
        table
    }

    pub fn register(&mut self, gene: &str, rule: Arc<dyn RelabelRule>) {
        self.rules.insert(gene.to_string(), rule);
    }

    pub fn contains(&self, gene: &str) -> bool {
        self.rules.contains_key(gene)
    }

    pub fn apply<'a>(&self, gene: &str, drafts: Vec<GroupDraft<'a>>) -> Vec<GroupDraft<'a>> {
        match self.rules.get(gene) {
            Some(rule) => rule.relabel(gene, drafts),
            None => drafts,
        }
    }
}
