use crate::assign::ReadEvent;
use crate::types::Pos;
use anyhow::{Context, Result, anyhow, bail};
use noodles::bam;
use noodles::sam::alignment::record::data::field::{Tag, Value};
use std::fs::File;
use std::path::Path;

/// Which auxiliary tags carry the cell barcode, UMI and gene.
#[derive(Debug, Clone, Copy)]
pub struct ReadTags {
    pub cell: Tag,
    pub umi: Tag,
    pub gene: Option<Tag>,
}

impl Default for ReadTags {
    /// Corrected cell barcode `CB`, corrected UMI `UB`, gene name `GN`.
    fn default() -> Self {
        Self {
            cell: Tag::new(b'C', b'B'),
            umi: Tag::new(b'U', b'B'),
            gene: Some(Tag::new(b'G', b'N')),
        }
    }
}

pub fn parse_tag(s: &str) -> Result<Tag> {
    match s.as_bytes() {
        [a, b] => Ok(Tag::new(*a, *b)),
        _ => bail!("invalid SAM tag '{s}': expected two characters"),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter {
    pub min_mapq: u8,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BamStats {
    pub total_records: u64,
    pub unmapped: u64,
    pub secondary: u64,
    pub supplementary: u64,
    pub low_mapq: u64,
    pub events: u64,
}

/// Stream every usable record of a BAM as a [`ReadEvent`].
///
/// Unmapped, secondary, supplementary and low-MAPQ records are skipped and
/// counted. An unreadable file or a corrupt record aborts with an error.
pub fn read_events<F>(path: &Path, tags: &ReadTags, filter: &RecordFilter, mut sink: F) -> Result<BamStats>
where
    F: FnMut(ReadEvent) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("failed to open BAM {}", path.display()))?;
    let mut reader = bam::io::Reader::new(file);
    let header = reader
        .read_header()
        .with_context(|| format!("failed to read BAM header from {}", path.display()))?;
    let refnames: Vec<String> = header
        .reference_sequences()
        .keys()
        .map(|name| name.to_string())
        .collect();

    let mut stats = BamStats::default();
    for result in reader.records() {
        let record = result.with_context(|| format!("failed to read record from {}", path.display()))?;
        stats.total_records += 1;

        let flags = record.flags();
        if flags.is_unmapped() {
            stats.unmapped += 1;
            continue;
        }
        if flags.is_secondary() {
            stats.secondary += 1;
            continue;
        }
        if flags.is_supplementary() {
            stats.supplementary += 1;
            continue;
        }
        if let Some(mapq) = record.mapping_quality()
            && mapq.get() < filter.min_mapq
        {
            stats.low_mapq += 1;
            continue;
        }

        if let Some(event) = record_to_event(&record, &refnames, tags)? {
            stats.events += 1;
            sink(event)?;
        }
    }
    Ok(stats)
}

/// Position is the read's 3' end: alignment end when forward, alignment
/// start when reverse-complemented.
pub fn record_to_event(record: &bam::Record, refnames: &[String], tags: &ReadTags) -> Result<Option<ReadEvent>> {
    let Some(ref_id) = record.reference_sequence_id().transpose()? else {
        return Ok(None);
    };
    let Some(start) = record.alignment_start().transpose()? else {
        return Ok(None);
    };
    let seqname = refnames
        .get(ref_id)
        .ok_or_else(|| anyhow!("reference id {ref_id} missing from BAM header"))?;

    let reverse = record.flags().is_reverse_complemented();
    let start = start.get();
    let pos = if reverse {
        start
    } else {
        start + alignment_span(record)?.max(1) - 1
    };
    let pos = Pos::try_from(pos).map_err(|_| anyhow!("alignment position {pos} out of range"))?;

    Ok(Some(ReadEvent {
        seqname: seqname.clone(),
        pos,
        strand: if reverse { '-' } else { '+' },
        gene: tags.gene.and_then(|t| get_string_tag(record, t)),
        cell: get_string_tag(record, tags.cell),
        umi: get_string_tag(record, tags.umi),
    }))
}

fn alignment_span(record: &bam::Record) -> Result<usize> {
    let mut span = 0usize;
    for op in record.cigar().iter() {
        let op = op?;
        if op.kind().consumes_reference() {
            span += op.len();
        }
    }
    Ok(span)
}

fn get_string_tag(record: &bam::Record, tag: Tag) -> Option<String> {
    let data = record.data();
    let value = data.get(&tag)?;
    let value = value.ok()?;
    match value {
        Value::String(s) => Some(s.to_string()),
        Value::Character(c) => Some((c as char).to_string()),
        _ => None,
    }
}
