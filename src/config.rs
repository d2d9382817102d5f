use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default half-width of the polyA window around a group's mean 3' end.
pub const DEFAULT_POLYA_WINDOW: u32 = 200;
/// Default distance under which two 3' ends fall into the same group.
pub const DEFAULT_END_TOLERANCE: u32 = 40;
/// Genes with more transcripts than this use the "complex" tolerance multiplier.
pub const COMPLEX_GENE_TRANSCRIPTS: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("polyA window must be greater than zero (gene: {gene})")]
    InvalidWindow { gene: String },

    #[error("end tolerance {tolerance} exceeds polyA window {window} (gene: {gene})")]
    InvalidTolerance {
        gene: String,
        tolerance: u32,
        window: u32,
    },

    #[error("unknown sensitivity profile '{0}'; choose one of precise, balanced, sensitive")]
    UnknownStrategy(String),

    #[error("override table names gene '{gene}' which is not in the target gene list")]
    UnknownOverrideGene { gene: String },

    #[error("override table lists gene '{gene}' more than once")]
    DuplicateOverride { gene: String },

    #[error("target gene '{gene}' is not present in the panel")]
    UnknownTargetGene { gene: String },

    #[error("unknown conflict policy '{0}'; choose one of tier-first, majority-first, discard")]
    UnknownConflictPolicy(String),

    #[error("failed to read override table {path:?}: {source}")]
    OverrideTable {
        path: std::path::PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Sensitivity profile controlling how aggressively nearby 3' ends merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    Precise,
    #[default]
    Balanced,
    Sensitive,
}

impl Strategy {
    /// `(standard, complex)` tolerance multipliers.
    pub fn multipliers(self) -> (f64, f64) {
        match self {
            Strategy::Precise => (0.5, 1.0),
            Strategy::Balanced => (1.0, 1.5),
            Strategy::Sensitive => (1.5, 2.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Precise => "precise",
            Strategy::Balanced => "balanced",
            Strategy::Sensitive => "sensitive",
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "precise" => Ok(Strategy::Precise),
            "balanced" => Ok(Strategy::Balanced),
            "sensitive" => Ok(Strategy::Sensitive),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-gene replacement for the polyA window and end tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneOverride {
    pub polya_window: u32,
    pub end_tolerance: u32,
}

#[derive(Debug, Deserialize)]
struct OverrideRow {
    gene: String,
    #[serde(rename = "polyA_window")]
    polya_window: u32,
    end_tolerance: u32,
}

/// Window and tolerance resolved for one gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneParams {
    pub polya_window: u32,
    pub end_tolerance: u32,
}

/// Configuration for panel construction.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub polya_window: u32,
    pub end_tolerance: u32,
    pub strategy: Strategy,
    pub overrides: BTreeMap<String, GeneOverride>,
    pub skip_singleton: bool,
    pub skip_collapsed: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            polya_window: DEFAULT_POLYA_WINDOW,
            end_tolerance: DEFAULT_END_TOLERANCE,
            strategy: Strategy::default(),
            overrides: BTreeMap::new(),
            skip_singleton: true,
            skip_collapsed: true,
        }
    }
}

impl PanelConfig {
    /// Resolve window and tolerance for a gene. An override wins outright;
    /// otherwise the profile scales the base tolerance, with the larger
    /// multiplier for genes carrying many transcripts.
    pub fn params_for(&self, gene: &str, num_transcripts: usize) -> GeneParams {
        if let Some(o) = self.overrides.get(gene) {
            return GeneParams {
                polya_window: o.polya_window,
                end_tolerance: o.end_tolerance,
            };
        }
        let (standard, complex) = self.strategy.multipliers();
        let multiplier = if num_transcripts > COMPLEX_GENE_TRANSCRIPTS {
            complex
        } else {
            standard
        };
        GeneParams {
            polya_window: self.polya_window,
            end_tolerance: (self.end_tolerance as f64 * multiplier) as u32,
        }
    }

    /// Reject configurations that cannot produce a meaningful panel. Must be
    /// called before any gene is processed.
    pub fn validate(&self, targets: &[String]) -> Result<(), ConfigError> {
        if self.polya_window == 0 {
            return Err(ConfigError::InvalidWindow {
                gene: "<default>".to_string(),
            });
        }
        if self.end_tolerance > self.polya_window {
            return Err(ConfigError::InvalidTolerance {
                gene: "<default>".to_string(),
                tolerance: self.end_tolerance,
                window: self.polya_window,
            });
        }
        let known: BTreeSet<&str> = targets.iter().map(String::as_str).collect();
        for (gene, o) in &self.overrides {
            if !known.contains(gene.as_str()) {
                return Err(ConfigError::UnknownOverrideGene { gene: gene.clone() });
            }
            if o.polya_window == 0 {
                return Err(ConfigError::InvalidWindow { gene: gene.clone() });
            }
            if o.end_tolerance > o.polya_window {
                return Err(ConfigError::InvalidTolerance {
                    gene: gene.clone(),
                    tolerance: o.end_tolerance,
                    window: o.polya_window,
                });
            }
        }
        Ok(())
    }
}

/// Load `gene, polyA_window, end_tolerance` rows. Tab-separated when the file
/// ends in `.tsv`/`.txt`, comma-separated otherwise.
pub fn load_overrides(path: &Path) -> Result<BTreeMap<String, GeneOverride>, ConfigError> {
    let delimiter = match path.extension().and_then(|s| s.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    };
    let wrap = |source| ConfigError::OverrideTable {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(wrap)?;

    let mut overrides = BTreeMap::new();
    for row in reader.deserialize::<OverrideRow>() {
        let row = row.map_err(wrap)?;
        let params = GeneOverride {
            polya_window: row.polya_window,
            end_tolerance: row.end_tolerance,
        };
        if overrides.insert(row.gene.clone(), params).is_some() {
            return Err(ConfigError::DuplicateOverride { gene: row.gene });
        }
    }
    tracing::info!(genes = overrides.len(), path = %path.display(), "loaded per-gene overrides");
    Ok(overrides)
}

/// Read a gene list: one symbol per line, `#` comments and blanks ignored.
/// Returns a sorted, de-duplicated list.
pub fn load_gene_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read gene list {}", path.display()))?;
    Ok(parse_gene_list(&text))
}

pub fn parse_gene_list(text: &str) -> Vec<String> {
    let genes: BTreeSet<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    genes.into_iter().collect()
}
