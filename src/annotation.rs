use crate::types::{Interval, Pos};
use anyhow::{Context, Result, anyhow};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Gtf,
    Gff3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtrStatus {
    Valid,
    MissingCds,
    InvalidOrNegative,
}

impl UtrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UtrStatus::Valid => "valid",
            UtrStatus::MissingCds => "missing_CDS",
            UtrStatus::InvalidOrNegative => "invalid_or_negative",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript {id}: end {end} precedes start {start}")]
    EndBeforeStart { id: String, start: Pos, end: Pos },

    #[error("transcript {id}: last exon {exon_start}-{exon_end} is malformed or lies outside {start}-{end}")]
    LastExonOutside {
        id: String,
        start: Pos,
        end: Pos,
        exon_start: Pos,
        exon_end: Pos,
    },

    #[error("transcript {id}: strand '{strand}' does not define a 3' end")]
    UnknownStrand { id: String, strand: char },
}

/// One annotated transcript of a target gene.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub id: String,
    pub name: Option<String>,
    pub gene: String,
    pub seqname: String,
    pub strand: char,
    pub start: Pos,
    pub end: Pos,
    pub last_exon: Interval,
    pub utr_length: Option<u32>,
    pub utr_status: UtrStatus,
}

impl Transcript {
    /// Assemble a transcript from its span, last exon and optional CDS
    /// extent `(min start, max end)`. The 3'UTR length is measured from the
    /// CDS boundary to the strand-aware 3' end of the last exon.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        name: Option<&str>,
        gene: &str,
        seqname: &str,
        strand: char,
        span: Interval,
        last_exon: Interval,
        cds: Option<Interval>,
    ) -> Self {
        let (utr_length, utr_status) = match cds {
            None => (None, UtrStatus::MissingCds),
            Some(cds) => {
                let utr = if strand == '-' {
                    cds.start as i64 - last_exon.start as i64
                } else {
                    last_exon.end as i64 - cds.end as i64
                };
                if utr > 0 {
                    (Some(utr as u32), UtrStatus::Valid)
                } else {
                    (None, UtrStatus::InvalidOrNegative)
                }
            }
        };
        Self {
            id: id.to_string(),
            name: name.filter(|n| !n.is_empty()).map(str::to_string),
            gene: gene.to_string(),
            seqname: seqname.to_string(),
            strand,
            start: span.start,
            end: span.end,
            last_exon,
            utr_length,
            utr_status,
        }
    }

    /// Cleavage coordinate: last exon end on plus, last exon start on minus.
    pub fn three_prime_end(&self) -> Pos {
        if self.strand == '-' {
            self.last_exon.start
        } else {
            self.last_exon.end
        }
    }

    /// Transcript name when annotated, otherwise the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn validate(&self) -> Result<(), TranscriptError> {
        if self.end < self.start {
            return Err(TranscriptError::EndBeforeStart {
                id: self.id.clone(),
                start: self.start,
                end: self.end,
            });
        }
        let le = self.last_exon;
        if le.end < le.start || le.start < self.start || le.end > self.end {
            return Err(TranscriptError::LastExonOutside {
                id: self.id.clone(),
                start: self.start,
                end: self.end,
                exon_start: le.start,
                exon_end: le.end,
            });
        }
        if self.strand != '+' && self.strand != '-' {
            return Err(TranscriptError::UnknownStrand {
                id: self.id.clone(),
                strand: self.strand,
            });
        }
        Ok(())
    }
}

/// Transcripts grouped by gene symbol, in a stable order.
pub type TranscriptsByGene = BTreeMap<String, Vec<Transcript>>;

pub fn detect_format(path: &Path) -> Result<InputFormat> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "gtf" => Ok(InputFormat::Gtf),
        "gff" | "gff3" => Ok(InputFormat::Gff3),
        _ => Err(anyhow!(
            "unable to detect annotation format from extension: .{}",
            ext
        )),
    }
}

/// Load transcripts of the requested genes from a GTF/GFF3 file.
///
/// Only `transcript` (GFF3: `mRNA`/`transcript`), `exon` and `CDS` features
/// are consulted. Genes are keyed by `gene_name`, falling back to `gene_id`.
/// Coordinates stay 1-based closed, as in the file.
pub fn load_transcripts(path: &Path, genes: &BTreeSet<String>) -> Result<TranscriptsByGene> {
    let parts = match detect_format(path)? {
        InputFormat::Gtf => read_gtf(path)?,
        InputFormat::Gff3 => read_gff3(path)?,
    };
    let by_gene = assemble(parts, genes);
    tracing::info!(
        genes = by_gene.len(),
        transcripts = by_gene.values().map(Vec::len).sum::<usize>(),
        "loaded annotation"
    );
    Ok(by_gene)
}

#[derive(Debug, Default)]
struct TranscriptParts {
    gene: String,
    name: Option<String>,
    seqname: String,
    strand: char,
    span: Option<Interval>,
    exons: Vec<Interval>,
    cds: Option<Interval>,
}

impl TranscriptParts {
    fn add_cds(&mut self, iv: Interval) {
        self.cds = Some(match self.cds {
            Some(c) => Interval::new(c.start.min(iv.start), c.end.max(iv.end)),
            None => iv,
        });
    }
}

fn assemble(parts: HashMap<String, TranscriptParts>, genes: &BTreeSet<String>) -> TranscriptsByGene {
    let mut by_gene: TranscriptsByGene = BTreeMap::new();
    for (id, p) in parts {
        if !genes.contains(&p.gene) {
            continue;
        }
        let span = p.span.unwrap_or_else(|| {
            let start = p.exons.iter().map(|e| e.start).min().unwrap_or(0);
            let end = p.exons.iter().map(|e| e.end).max().unwrap_or(0);
            Interval::new(start, end)
        });
        let last_exon = if p.strand == '-' {
            p.exons.iter().min_by_key(|e| e.start).copied()
        } else {
            p.exons.iter().max_by_key(|e| e.end).copied()
        }
        .unwrap_or(span);
        by_gene.entry(p.gene.clone()).or_default().push(Transcript::new(
            &id,
            p.name.as_deref(),
            &p.gene,
            &p.seqname,
            p.strand,
            span,
            last_exon,
            p.cds,
        ));
    }
    for txs in by_gene.values_mut() {
        txs.sort_by(|a, b| a.id.cmp(&b.id));
    }
    by_gene
}

fn read_gtf(path: &Path) -> Result<HashMap<String, TranscriptParts>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = noodles::gtf::io::Reader::new(BufReader::new(file));

    let mut transcripts: HashMap<String, TranscriptParts> = HashMap::new();

    for result in reader.record_bufs() {
        let record = result?;

        let feature_type: &[u8] = record.ty().as_ref();
        if feature_type != b"transcript" && feature_type != b"exon" && feature_type != b"CDS" {
            continue;
        }

        let attrs = record.attributes();
        let Some(transcript_id) = get_record_buf_attribute(attrs, b"transcript_id") else {
            continue;
        };
        let gene = get_record_buf_attribute(attrs, b"gene_name")
            .or_else(|| get_record_buf_attribute(attrs, b"gene_id"))
            .unwrap_or_default();
        let interval = record_interval(record.start().get(), record.end().get())?;

        let entry = transcripts.entry(transcript_id).or_insert_with(|| TranscriptParts {
            gene,
            seqname: record.reference_sequence_name().to_string(),
            strand: strand_to_char(record.strand()),
            ..Default::default()
        });
        if entry.name.is_none() {
            entry.name = get_record_buf_attribute(attrs, b"transcript_name");
        }

        match feature_type {
            b"transcript" => entry.span = Some(interval),
            b"exon" => entry.exons.push(interval),
            _ => entry.add_cds(interval),
        }
    }

    Ok(transcripts)
}

fn read_gff3(path: &Path) -> Result<HashMap<String, TranscriptParts>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = noodles::gff::io::Reader::new(BufReader::new(file));

    let mut gene_names: HashMap<String, String> = HashMap::new();
    let mut transcripts: HashMap<String, TranscriptParts> = HashMap::new();
    // exon/CDS rows may precede their parent transcript
    let mut children: Vec<(String, bool, Interval)> = Vec::new();

    for result in reader.record_bufs() {
        let record = result?;

        let feature_type: &[u8] = record.ty().as_ref();
        let attrs = record.attributes();
        let interval = record_interval(record.start().get(), record.end().get())?;

        match feature_type {
            b"gene" => {
                if let (Some(id), Some(name)) = (
                    get_record_buf_attribute(attrs, b"ID"),
                    get_record_buf_attribute(attrs, b"Name")
                        .or_else(|| get_record_buf_attribute(attrs, b"gene_name")),
                ) {
                    gene_names.insert(id, name);
                }
            }
            b"transcript" | b"mRNA" => {
                let Some(id) = get_record_buf_attribute(attrs, b"ID") else {
                    continue;
                };
                let gene = get_record_buf_attribute(attrs, b"gene_name")
                    .or_else(|| get_record_buf_attribute(attrs, b"Parent"))
                    .unwrap_or_default();
                let entry = transcripts.entry(id).or_default();
                entry.gene = gene;
                entry.name = get_record_buf_attribute(attrs, b"Name")
                    .or_else(|| get_record_buf_attribute(attrs, b"transcript_name"));
                entry.seqname = record.reference_sequence_name().to_string();
                entry.strand = strand_to_char(record.strand());
                entry.span = Some(interval);
            }
            b"exon" | b"CDS" => {
                if let Some(parent) = get_record_buf_attribute(attrs, b"Parent") {
                    children.push((parent, feature_type == b"exon", interval));
                }
            }
            _ => {}
        }
    }

    for (parent, is_exon, interval) in children {
        let Some(entry) = transcripts.get_mut(&parent) else {
            continue;
        };
        if is_exon {
            entry.exons.push(interval);
        } else {
            entry.add_cds(interval);
        }
    }
    // `Parent` of a transcript points at a gene ID; swap in its symbol.
    for parts in transcripts.values_mut() {
        if let Some(name) = gene_names.get(&parts.gene) {
            parts.gene = name.clone();
        }
    }

    Ok(transcripts)
}

fn record_interval(start: usize, end: usize) -> Result<Interval> {
    let start = Pos::try_from(start).map_err(|_| anyhow!("feature start out of range"))?;
    let end = Pos::try_from(end).map_err(|_| anyhow!("feature end out of range"))?;
    Ok(Interval::new(start, end))
}

fn get_record_buf_attribute(
    attrs: &noodles::gff::feature::record_buf::Attributes,
    key: &[u8],
) -> Option<String> {
    let value = attrs.get(key)?;
    value.iter().next().map(|v| v.to_string())
}

fn strand_to_char(strand: noodles::gff::feature::record::Strand) -> char {
    use noodles::gff::feature::record::Strand;
    match strand {
        Strand::Forward => '+',
        Strand::Reverse => '-',
        Strand::None => '.',
        Strand::Unknown => '?',
    }
}
