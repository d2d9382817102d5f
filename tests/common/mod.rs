#![allow(dead_code)]

use isodecipher_rs::annotation::{Transcript, TranscriptsByGene};
use isodecipher_rs::types::Interval;

/// Plus/minus-strand transcript whose last exon is `[le_start, le_end]` and
/// whose span starts 1 kb upstream.
pub fn tx(id: &str, gene: &str, strand: char, le_start: u32, le_end: u32, cds_edge: Option<u32>) -> Transcript {
    tx_on("chr1", id, gene, strand, le_start, le_end, cds_edge)
}

pub fn tx_on(
    seqname: &str,
    id: &str,
    gene: &str,
    strand: char,
    le_start: u32,
    le_end: u32,
    cds_edge: Option<u32>,
) -> Transcript {
    let span = if strand == '-' {
        Interval::new(le_start, le_end + 1000)
    } else {
        Interval::new(le_start.saturating_sub(1000).max(1), le_end)
    };
    // `cds_edge` is the CDS boundary next to the 3' UTR.
    let cds = cds_edge.map(|edge| {
        if strand == '-' {
            Interval::new(edge, span.end)
        } else {
            Interval::new(span.start, edge)
        }
    });
    Transcript::new(id, Some(id), gene, seqname, strand, span, Interval::new(le_start, le_end), cds)
}

pub fn by_gene(transcripts: Vec<Transcript>) -> TranscriptsByGene {
    let mut map = TranscriptsByGene::new();
    for t in transcripts {
        map.entry(t.gene.clone()).or_default().push(t);
    }
    map
}

pub fn genes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// IGHM on the minus strand: two secreted transcripts ending near 3000 and a
/// membrane transcript ending 2 kb further downstream, at 1000.
pub fn ighm() -> TranscriptsByGene {
    by_gene(vec![
        tx_on("chr14", "IGHM-201", "IGHM", '-', 3000, 3200, Some(3100)),
        tx_on("chr14", "IGHM-202", "IGHM", '-', 2990, 3200, Some(3140)),
        tx_on("chr14", "IGHM-203", "IGHM", '-', 1000, 1300, Some(1100)),
    ])
}
