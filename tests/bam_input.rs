use isodecipher_rs::bam_input::{BamStats, ReadTags, RecordFilter, parse_tag, read_events};
use isodecipher_rs::assign::ReadEvent;
use noodles::bam;
use noodles::core::Position;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record::cigar::{Op, op::Kind};
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::{Flags, MappingQuality};
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{Cigar, Data, Sequence};
use noodles::sam::header::record::value::{Map, map::ReferenceSequence};
use noodles::sam;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::Path;

fn header() -> sam::Header {
    sam::Header::builder()
        .add_reference_sequence(
            "chr1",
            Map::<ReferenceSequence>::new(NonZeroUsize::try_from(100_000).unwrap()),
        )
        .build()
}

fn record(flags: Flags, start: usize, ops: &[(Kind, usize)], mapq: u8, tags: &[(&[u8; 2], &str)]) -> RecordBuf {
    let mut rec = RecordBuf::default();
    *rec.flags_mut() = flags;
    *rec.reference_sequence_id_mut() = Some(0);
    *rec.alignment_start_mut() = Some(Position::try_from(start).unwrap());
    *rec.mapping_quality_mut() = MappingQuality::new(mapq);
    let read_len: usize = ops.iter().filter(|(k, _)| k.consumes_read()).map(|(_, n)| n).sum();
    *rec.cigar_mut() = ops.iter().map(|&(k, n)| Op::new(k, n)).collect::<Cigar>();
    *rec.sequence_mut() = Sequence::from(vec![b'A'; read_len]);
    *rec.data_mut() = tags
        .iter()
        .map(|(t, v)| (Tag::new(t[0], t[1]), Value::from(*v)))
        .collect::<Data>();
    rec
}

fn write_bam(path: &Path, records: &[RecordBuf]) {
    let header = header();
    let mut writer = bam::io::Writer::new(File::create(path).unwrap());
    writer.write_header(&header).unwrap();
    for r in records {
        writer.write_alignment_record(&header, r).unwrap();
    }
    // Dropping the writer finishes the BGZF stream.
    drop(writer);
}

#[test]
fn records_become_three_prime_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reads.bam");
    let full = [(b"CB", "AAAC-1"), (b"UB", "GGTT"), (b"GN", "GENEA")];
    write_bam(
        &path,
        &[
            record(Flags::empty(), 1001, &[(Kind::Match, 50)], 60, &full),
            record(
                Flags::REVERSE_COMPLEMENTED,
                2001,
                &[(Kind::Match, 30), (Kind::Skip, 100), (Kind::Match, 20)],
                60,
                &[(b"CB", "AAAC-1")],
            ),
            record(
                Flags::empty(),
                101,
                &[(Kind::SoftClip, 10), (Kind::Match, 40)],
                60,
                &[(b"CB", "CCGA-1"), (b"UB", "TTAA")],
            ),
            record(Flags::SECONDARY, 1001, &[(Kind::Match, 50)], 60, &full),
            record(Flags::SUPPLEMENTARY, 1001, &[(Kind::Match, 50)], 60, &full),
            record(Flags::empty(), 1001, &[(Kind::Match, 50)], 5, &full),
            RecordBuf::default(),
        ],
    );

    let mut events: Vec<ReadEvent> = Vec::new();
    let stats = read_events(&path, &ReadTags::default(), &RecordFilter { min_mapq: 10 }, |e| {
        events.push(e);
        Ok(())
    })
    .unwrap();

    assert_eq!(
        stats,
        BamStats {
            total_records: 7,
            unmapped: 1,
            secondary: 1,
            supplementary: 1,
            low_mapq: 1,
            events: 3,
        }
    );
    assert_eq!(
        events,
        vec![
            ReadEvent::new("chr1", 1050, '+', "AAAC-1", "GGTT").with_gene("GENEA"),
            ReadEvent {
                seqname: "chr1".to_string(),
                pos: 2001,
                strand: '-',
                gene: None,
                cell: Some("AAAC-1".to_string()),
                umi: None,
            },
            ReadEvent::new("chr1", 140, '+', "CCGA-1", "TTAA"),
        ]
    );
}

#[test]
fn custom_tags_and_missing_file() {
    assert_eq!(parse_tag("CR").unwrap(), Tag::new(b'C', b'R'));
    assert!(parse_tag("CBX").is_err());

    let tags = ReadTags {
        gene: None,
        ..ReadTags::default()
    };
    let missing = read_events(Path::new("/nonexistent/reads.bam"), &tags, &RecordFilter::default(), |_| Ok(()));
    assert!(missing.is_err());
}
