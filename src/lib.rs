//! isodecipher-rs: group transcript 3' ends into isoform panels and count
//! isoform usage in single-cell BAMs.
//!
//! # Library usage
//!
//! ```no_run
//! use isodecipher_rs::{AssignmentEngine, EngineConfig, PanelConfig, ReadEvent, RuleTable, build_panel};
//! use isodecipher_rs::annotation::load_transcripts;
//!
//! // let transcripts = load_transcripts(path_to_gtf, &wanted_genes)?;
//! // let build = build_panel(&genes, &transcripts, &PanelConfig::default(), &RuleTable::with_defaults())?;
//! //
//! // let engine = AssignmentEngine::new(&build.panel, EngineConfig::default())?;
//! // // ReadEvents from noodles, an aligner, or a test fixture.
//! // let events: Vec<ReadEvent> = /* … */;
//! // let quant = engine.quantify(events);
//! // let fractions = quant.fractions(&build.panel, engine.target_genes());
//! ```

pub mod annotation;
pub mod assign;
pub mod bam_input;
pub mod config;
pub mod panel;
pub mod pipeline;
pub mod quant;
pub mod relabel;
pub mod table;
pub mod types;

// Internal modules, not part of the public API.
pub(crate) mod index;

// Flat re-exports for the most commonly used public types.
pub use assign::{AssignmentEngine, ConflictPolicy, EngineConfig, Match, ReadEvent, ReadOutcome};
pub use config::{ConfigError, PanelConfig, Strategy};
pub use panel::{EvidenceTier, IsoformGroup, Panel, build_panel};
pub use quant::Quantification;
pub use relabel::RuleTable;
