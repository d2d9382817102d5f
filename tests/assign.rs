mod common;

use common::{by_gene, genes, ighm, tx, tx_on};
use isodecipher_rs::assign::{AssignmentEngine, ConflictPolicy, EngineConfig, Match, ReadEvent, ReadOutcome};
use isodecipher_rs::config::{ConfigError, PanelConfig};
use isodecipher_rs::panel::{EvidenceTier, IsoformGroup, Member, Panel, UtrStats, build_panel};
use isodecipher_rs::quant::CountMatrix;
use isodecipher_rs::pipeline::{run_sharded, shard_of};
use isodecipher_rs::relabel::RuleTable;
use isodecipher_rs::types::Interval;
use std::collections::BTreeSet;

/// GENEA on chr1: polyA1 = {A-1, A-2} (last exons 900-1030, window 815-1215),
/// polyA2 = {A-3} (last exon 1500-1600, window 1400-1800).
/// GENEB on chr2: polyA1 = {B-1} (window 800-1200), polyA2 = {B-2}
/// (window 900-1300); the windows overlap between 1001 and 1049.
fn two_gene_panel() -> Panel {
    let mut transcripts = by_gene(vec![
        tx("A-1", "GENEA", '+', 900, 1000, Some(900)),
        tx("A-2", "GENEA", '+', 920, 1030, Some(930)),
        tx("A-3", "GENEA", '+', 1500, 1600, Some(1560)),
    ]);
    transcripts.extend(by_gene(vec![
        tx_on("chr2", "B-1", "GENEB", '+', 900, 1000, None),
        tx_on("chr2", "B-2", "GENEB", '+', 1050, 1100, None),
    ]));
    build_panel(&genes(&["GENEA", "GENEB"]), &transcripts, &PanelConfig::default(), &RuleTable::empty())
        .unwrap()
        .panel
}

fn ighm_panel() -> Panel {
    build_panel(&genes(&["IGHM"]), &ighm(), &PanelConfig::default(), &RuleTable::with_defaults())
        .unwrap()
        .panel
}

fn read(seqname: &str, pos: u32, cell: &str, umi: &str) -> ReadEvent {
    ReadEvent::new(seqname, pos, '+', cell, umi)
}

fn idx(panel: &Panel, id: &str) -> u32 {
    panel.find(id).expect("group present")
}

#[test]
fn same_group_transcripts_count_once() {
    let panel = two_gene_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    // 950 lies in both A-1 and A-2 last exons, which share a group.
    assert_eq!(
        engine.classify(&read("chr1", 950, "C1", "U1")),
        ReadOutcome::Matched(Match::Assigned {
            group: idx(&panel, "GENEA_polyA1"),
            tier: EvidenceTier::Tier1,
        })
    );
}

#[test]
fn falls_back_to_polya_window() {
    let panel = two_gene_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    assert_eq!(
        engine.classify(&read("chr1", 1100, "C1", "U1")),
        ReadOutcome::Matched(Match::Assigned {
            group: idx(&panel, "GENEA_polyA1"),
            tier: EvidenceTier::Tier3,
        })
    );
    assert_eq!(
        engine.classify(&read("chr1", 1300, "C1", "U1")),
        ReadOutcome::Matched(Match::Unassigned)
    );
    assert_eq!(engine.classify(&read("chr1", 5000, "C1", "U1")), ReadOutcome::OffTarget);
}

#[test]
fn overlapping_windows_are_ambiguous() {
    let panel = two_gene_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    let expected: BTreeSet<u32> = [idx(&panel, "GENEB_polyA1"), idx(&panel, "GENEB_polyA2")].into();
    assert_eq!(
        engine.classify(&read("chr2", 1020, "C1", "U1")),
        ReadOutcome::Matched(Match::Ambiguous {
            tier: EvidenceTier::Tier3,
            groups: expected,
        })
    );

    let quant = engine.quantify(vec![read("chr2", 1020, "C1", "U1")]);
    assert_eq!(quant.counts.total(), 0);
    assert_eq!(quant.qc.reads.ambiguous_reads.tier3, 1);
    assert_eq!(quant.qc.reads.per_gene["GENEB"].ambiguous_reads, 1);
}

#[test]
fn shared_last_exons_of_a_hand_built_panel_fall_back_to_tier3() {
    let group = |id: &str, le: Interval, window: Interval| IsoformGroup {
        id: id.to_string(),
        gene: "GENEX".to_string(),
        seqname: "chr3".to_string(),
        strand: '+',
        members: vec![Member {
            transcript_id: format!("{id}-tx"),
            transcript_name: format!("{id}-tx"),
            last_exon: le,
            utr_length: None,
            tier: EvidenceTier::Tier1,
        }],
        polya_window: window,
        utr: UtrStats::default(),
    };
    let mut panel = Panel::new();
    panel.push_gene(
        "GENEX",
        vec![
            group("GENEX_a", Interval::new(100, 200), Interval::new(50, 140)),
            group("GENEX_b", Interval::new(150, 250), Interval::new(260, 400)),
        ],
    );
    assert!(panel.groups().iter().all(|g| g.tier() == EvidenceTier::Tier3));

    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    assert_eq!(
        engine.classify(&read("chr3", 175, "C1", "U1")),
        ReadOutcome::Matched(Match::Ambiguous {
            tier: EvidenceTier::Tier3,
            groups: [0, 1].into(),
        })
    );
    assert_eq!(
        engine.classify(&read("chr3", 120, "C1", "U1")),
        ReadOutcome::Matched(Match::Assigned {
            group: 0,
            tier: EvidenceTier::Tier3
        })
    );
}

#[test]
fn exception_transcripts_do_not_claim_the_gap_between_clusters() {
    let transcripts = by_gene(vec![
        tx("IGHG1-201", "IGHG1", '+', 900, 1000, None),
        tx("IGHG1-202", "IGHG1", '+', 1900, 2000, None),
        tx("IGHG1-203", "IGHG1", '+', 2900, 3000, None),
    ]);
    let panel = build_panel(&genes(&["IGHG1"]), &transcripts, &PanelConfig::default(), &RuleTable::with_defaults())
        .unwrap()
        .panel;
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    let short = idx(&panel, "IGHG1_short");
    let long = idx(&panel, "IGHG1_long");

    assert_eq!(
        engine.classify(&read("chr1", 1500, "C1", "U1")),
        ReadOutcome::Matched(Match::Unassigned)
    );
    assert_eq!(
        engine.classify(&read("chr1", 2100, "C1", "U1")),
        ReadOutcome::Matched(Match::Assigned {
            group: long,
            tier: EvidenceTier::Tier3
        })
    );
    assert_eq!(
        engine.classify(&read("chr1", 2950, "C1", "U1")),
        ReadOutcome::Matched(Match::Assigned {
            group: short,
            tier: EvidenceTier::Tier1
        })
    );
}

#[test]
fn count_matrix_accumulates_per_cell_and_group() {
    let mut counts = CountMatrix::default();
    counts.add("C1", 0, 2);
    counts.add("C1", 0, 1);
    counts.add("C1", 1, 1);
    counts.add("C2", 1, 4);
    assert_eq!(counts.get("C1", 0), 3);
    assert_eq!(counts.get("C1", 1), 1);
    assert_eq!(counts.get("C2", 0), 0);
    assert_eq!(counts.total(), 8);
}

#[test]
fn ighm_short_and_long_split_evenly() {
    let panel = ighm_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    let events = vec![
        ReadEvent::new("chr14", 3100, '-', "C1", "U1"),
        ReadEvent::new("chr14", 3050, '-', "C1", "U1"),
        ReadEvent::new("chr14", 1150, '-', "C1", "U2"),
    ];
    let quant = engine.quantify(events);

    let short = idx(&panel, "IGHM_short");
    let long = idx(&panel, "IGHM_long");
    assert_eq!(quant.counts.get("C1", short), 1);
    assert_eq!(quant.counts.get("C1", long), 1);
    assert_eq!(quant.qc.umis.tier1, 2);
    assert_eq!(quant.qc.reads.assigned_reads.tier1, 3);

    let fractions = quant.fractions(&panel, engine.target_genes());
    assert_eq!(fractions.len(), 2);
    for row in &fractions {
        assert_eq!(row.fraction, Some(0.5));
    }

    let utr = quant.weighted_utr(&panel);
    assert_eq!(utr.len(), 1);
    assert_eq!(utr[0].umis, 2);
    assert_eq!(utr[0].weighted_utr_length, Some(112.5));

    let coverage = quant.gene_coverage(&panel, engine.target_genes());
    assert_eq!(coverage[0].gene, "IGHM");
    assert_eq!(coverage[0].cells_with_umi, 1);
    assert_eq!(coverage[0].coverage, 1.0);
}

#[test]
fn deduplication_ignores_read_order() {
    let panel = two_gene_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    let events = vec![
        read("chr1", 950, "C1", "U1"),
        read("chr1", 1550, "C1", "U1"),
        read("chr1", 1700, "C1", "U1"),
        read("chr1", 1000, "C2", "U1"),
        read("chr1", 1100, "C2", "U2"),
        read("chr2", 950, "C2", "U3"),
        read("chr2", 1020, "C1", "U4"),
    ];
    let forward = engine.quantify(events.clone());
    let backward = engine.quantify(events.into_iter().rev());
    assert_eq!(forward.counts, backward.counts);
    assert_eq!(forward.qc, backward.qc);
    // C2/U1 and C2/U2 are distinct molecules of the same group.
    assert_eq!(forward.counts.get("C2", idx(&panel, "GENEA_polyA1")), 2);
}

#[test]
fn fractions_sum_to_one_or_stay_undefined() {
    let panel = two_gene_panel();
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();
    let quant = engine.quantify(vec![
        read("chr1", 950, "C1", "U1"),
        read("chr1", 1550, "C1", "U2"),
        read("chr1", 1560, "C1", "U3"),
        read("chr1", 950, "C2", "U1"),
    ]);
    let fractions = quant.fractions(&panel, engine.target_genes());

    for cell in ["C1", "C2"] {
        let a: Vec<_> = fractions.iter().filter(|r| r.cell == cell && r.gene == "GENEA").collect();
        let sum: f64 = a.iter().map(|r| r.fraction.unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-9);

        let b: Vec<_> = fractions.iter().filter(|r| r.cell == cell && r.gene == "GENEB").collect();
        assert_eq!(b.len(), 2);
        assert!(b.iter().all(|r| r.fraction.is_none()));
    }
    let c1_polya2 = fractions
        .iter()
        .find(|r| r.cell == "C1" && r.group == idx(&panel, "GENEA_polyA2"))
        .unwrap();
    assert!((c1_polya2.fraction.unwrap() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn conflict_policies_resolve_deterministically() {
    let panel = two_gene_panel();
    let polya1 = idx(&panel, "GENEA_polyA1");
    let polya2 = idx(&panel, "GENEA_polyA2");
    // One tier1 read for polyA1, two tier3 reads for polyA2, same molecule.
    let events = vec![
        read("chr1", 950, "C1", "U1"),
        read("chr1", 1450, "C1", "U1"),
        read("chr1", 1700, "C1", "U1"),
    ];
    let run = |policy: ConflictPolicy| {
        let config = EngineConfig {
            conflict_policy: policy,
            ..EngineConfig::default()
        };
        let engine = AssignmentEngine::new(&panel, config).unwrap();
        engine.quantify(events.clone())
    };

    let tier_first = run(ConflictPolicy::TierFirst);
    assert_eq!(tier_first.counts.get("C1", polya1), 1);
    assert_eq!(tier_first.counts.get("C1", polya2), 0);
    assert_eq!(tier_first.qc.molecule_conflicts, 1);
    assert_eq!(tier_first.qc.umis.tier1, 1);

    let majority = run(ConflictPolicy::MajorityFirst);
    assert_eq!(majority.counts.get("C1", polya1), 0);
    assert_eq!(majority.counts.get("C1", polya2), 1);
    assert_eq!(majority.qc.umis.tier3, 1);

    let discard = run(ConflictPolicy::Discard);
    assert_eq!(discard.counts.total(), 0);
    assert_eq!(discard.qc.discarded_molecules, 1);
    assert_eq!(discard.qc.molecule_conflicts, 1);

    // Equal tier and support: the smaller group id wins.
    let tied = AssignmentEngine::new(&panel, EngineConfig::default())
        .unwrap()
        .quantify(vec![read("chr1", 1100, "C1", "U9"), read("chr1", 1450, "C1", "U9")]);
    assert_eq!(tied.counts.get("C1", polya1), 1);
    assert_eq!(tied.counts.total(), 1);

    assert_eq!("majority-first".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::MajorityFirst);
    assert!(matches!(
        "coin-flip".parse::<ConflictPolicy>(),
        Err(ConfigError::UnknownConflictPolicy(_))
    ));
}

#[test]
fn tags_whitelist_and_gene_consistency() {
    let panel = two_gene_panel();
    let config = EngineConfig {
        cell_whitelist: Some(["C1".to_string()].into()),
        ..EngineConfig::default()
    };
    let engine = AssignmentEngine::new(&panel, config).unwrap();

    let mut untagged = read("chr1", 950, "C1", "U1");
    untagged.umi = None;
    assert_eq!(engine.classify(&untagged), ReadOutcome::MissingTags);
    assert_eq!(engine.classify(&read("chr1", 950, "C9", "U1")), ReadOutcome::FilteredCell);

    let off_target = read("chr1", 950, "C1", "U1").with_gene("ACTB");
    assert_eq!(engine.classify(&off_target), ReadOutcome::OffTarget);

    let wrong_strand = ReadEvent::new("chr1", 950, '-', "C1", "U1").with_gene("GENEA");
    assert_eq!(engine.classify(&wrong_strand), ReadOutcome::Inconsistent);

    let multi = read("chr1", 950, "C1", "U1").with_gene("ACTB;GENEA");
    assert!(matches!(
        engine.classify(&multi),
        ReadOutcome::Matched(Match::Assigned { .. })
    ));
    // A GENEB tag restricts matching to GENEB, which has nothing on chr1.
    let restricted = read("chr1", 950, "C1", "U1").with_gene("GENEB");
    assert_eq!(engine.classify(&restricted), ReadOutcome::Inconsistent);

    let quant = engine.quantify(vec![untagged, wrong_strand, off_target]);
    let qc = &quant.qc.reads;
    assert_eq!(qc.total_reads, 3);
    assert_eq!(qc.missing_tags, 1);
    assert_eq!(qc.off_target, 1);
    assert_eq!(qc.inconsistent, 1);
    assert_eq!(qc.unassigned, 1);
}

#[test]
fn unknown_target_gene_is_a_config_error() {
    let panel = two_gene_panel();
    let config = EngineConfig {
        target_genes: Some(vec!["GENEZ".to_string()]),
        ..EngineConfig::default()
    };
    assert!(matches!(
        AssignmentEngine::new(&panel, config),
        Err(ConfigError::UnknownTargetGene { .. })
    ));

    let config = EngineConfig {
        target_genes: Some(vec!["GENEB".to_string()]),
        ..EngineConfig::default()
    };
    let engine = AssignmentEngine::new(&panel, config).unwrap();
    assert_eq!(engine.target_genes(), ["GENEB".to_string()]);
    assert_eq!(engine.classify(&read("chr1", 950, "C1", "U1")), ReadOutcome::OffTarget);
}

#[test]
fn sharded_run_matches_single_pass() {
    let mut transcripts = by_gene(vec![
        tx("A-1", "GENEA", '+', 900, 1000, Some(900)),
        tx("A-3", "GENEA", '+', 1500, 1600, Some(1560)),
    ]);
    transcripts.extend(ighm());
    let panel = build_panel(
        &genes(&["GENEA", "IGHM"]),
        &transcripts,
        &PanelConfig::default(),
        &RuleTable::with_defaults(),
    )
    .unwrap()
    .panel;
    let engine = AssignmentEngine::new(&panel, EngineConfig::default()).unwrap();

    let mut events = Vec::new();
    for c in 0..6 {
        let cell = format!("C{c}");
        for u in 0..5 {
            let umi = format!("U{u}");
            events.push(read("chr1", 950 + u, &cell, &umi));
            events.push(read("chr1", 1550, &cell, &umi));
            events.push(ReadEvent::new("chr14", 3100 - u, '-', &cell, &umi));
            events.push(ReadEvent::new("chr14", 1150, '-', &cell, &format!("M{u}")));
        }
        events.push(read("chr9", 10, &cell, "X"));
    }

    let single = engine.quantify(events.clone());
    for workers in [2, 3, 5] {
        let (sharded, produced) = run_sharded(workers, 3, &engine, |sink: &mut dyn FnMut(ReadEvent) -> anyhow::Result<()>| {
            for event in events.clone() {
                sink(event)?;
            }
            Ok(events.len())
        })
        .unwrap();
        assert_eq!(produced, events.len());
        assert_eq!(sharded.counts, single.counts);
        assert_eq!(sharded.qc, single.qc);
    }
    assert!(shard_of("chr14", 3) < 3);
    assert_eq!(shard_of("chr1", 4), shard_of("chr1", 4));
}
