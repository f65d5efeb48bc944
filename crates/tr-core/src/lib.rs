use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod events;
pub mod rule;

pub use events::{EventPayload, MarkerEvent, WindowSnapshot};
pub use rule::{ActivationRule, Cmp, Horizon, RuleParseError};

/// Schema version stamped on registered marker metadata.
pub const MARKER_SCHEMA_VERSION: i64 = 1;

/// The four pipeline levels, bottom-up. Marker ids carry the class as a
/// prefix and the loader derives the class from the directory a definition
/// lives in; the two must agree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MarkerClass {
    #[serde(rename = "ato")]
    Atomic,
    #[serde(rename = "sem")]
    Semantic,
    #[serde(rename = "clu")]
    Cluster,
    #[serde(rename = "mema")]
    Meta,
}

impl MarkerClass {
    pub const ALL: [MarkerClass; 4] = [
        MarkerClass::Atomic,
        MarkerClass::Semantic,
        MarkerClass::Cluster,
        MarkerClass::Meta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerClass::Atomic => "ato",
            MarkerClass::Semantic => "sem",
            MarkerClass::Cluster => "clu",
            MarkerClass::Meta => "mema",
        }
    }

    /// Id prefix, e.g. `ATO_` for atomic markers.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            MarkerClass::Atomic => "ATO_",
            MarkerClass::Semantic => "SEM_",
            MarkerClass::Cluster => "CLU_",
            MarkerClass::Meta => "MEMA_",
        }
    }

    /// Subdirectory of the markers root that holds this class.
    pub fn dir_name(&self) -> &'static str {
        match self {
            MarkerClass::Atomic => "atomic",
            MarkerClass::Semantic => "semantic",
            MarkerClass::Cluster => "cluster",
            MarkerClass::Meta => "meta",
        }
    }

    /// The class whose events this class composes, if any.
    pub fn composes(&self) -> Option<MarkerClass> {
        match self {
            MarkerClass::Atomic => None,
            MarkerClass::Semantic => Some(MarkerClass::Atomic),
            MarkerClass::Cluster => Some(MarkerClass::Semantic),
            MarkerClass::Meta => Some(MarkerClass::Cluster),
        }
    }

    pub fn from_id(id: &str) -> Option<MarkerClass> {
        MarkerClass::ALL
            .into_iter()
            .find(|class| id.starts_with(class.id_prefix()))
    }
}

impl fmt::Display for MarkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerClass {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "ato" | "atomic" => Ok(MarkerClass::Atomic),
            "sem" | "semantic" => Ok(MarkerClass::Semantic),
            "clu" | "cluster" => Ok(MarkerClass::Cluster),
            "mema" | "meta" => Ok(MarkerClass::Meta),
            other => Err(format!("unknown marker class: {other}")),
        }
    }
}

/// The four frame descriptors every marker carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    #[serde(default)]
    pub signal: String,
    #[serde(default)]
    pub concept: String,
    #[serde(default)]
    pub pragmatics: String,
    #[serde(default)]
    pub narrative: String,
}

impl Frame {
    /// Names of frame keys that are empty or whitespace-only.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (key, value) in [
            ("signal", &self.signal),
            ("concept", &self.concept),
            ("pragmatics", &self.pragmatics),
            ("narrative", &self.narrative),
        ] {
            if value.trim().is_empty() {
                missing.push(key);
            }
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFormula {
    Linear,
    Logistic,
}

impl Default for ScoreFormula {
    fn default() -> Self {
        Self::Linear
    }
}

impl ScoreFormula {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreFormula::Linear => "linear",
            ScoreFormula::Logistic => "logistic",
        }
    }

    /// Project a raw window value into the reported score.
    pub fn project(&self, raw: f64, base: f64) -> f64 {
        match self {
            ScoreFormula::Linear => raw,
            ScoreFormula::Logistic => 1.0 / (1.0 + (-(raw - base)).exp()),
        }
    }
}

/// Scoring parameters for CLU markers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scoring {
    #[serde(default)]
    pub base: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub decay: f64,
    #[serde(default)]
    pub formula: ScoreFormula,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for Scoring {
    fn default() -> Self {
        Self {
            base: 0.0,
            weight: 1.0,
            decay: 0.0,
            formula: ScoreFormula::Linear,
        }
    }
}

/// Activation block: the rule text is parsed during validation and again,
/// cheaply, by the engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activation {
    pub rule: String,
}

/// A parsed marker definition. Exactly one of `pattern`, `composed_of` and
/// `detect_class` may be set; the validator enforces this together with the
/// per-class composition rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerDefinition {
    pub id: String,
    pub class: MarkerClass,
    #[serde(default)]
    pub frame: Option<Frame>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub composed_of: Option<Vec<String>>,
    #[serde(default)]
    pub detect_class: Option<String>,
    #[serde(default)]
    pub activation: Option<Activation>,
    #[serde(default)]
    pub scoring: Option<Scoring>,
    #[serde(default)]
    pub window: Option<u32>,
}

impl MarkerDefinition {
    /// How many of the mutually exclusive structure blocks are present.
    pub fn structure_block_count(&self) -> usize {
        usize::from(self.pattern.is_some())
            + usize::from(self.composed_of.is_some())
            + usize::from(self.detect_class.is_some())
    }

    pub fn composed_of(&self) -> &[String] {
        self.composed_of.as_deref().unwrap_or_default()
    }

    pub fn activation_rule(&self) -> Option<&str> {
        self.activation.as_ref().map(|activation| activation.rule.as_str())
    }

    pub fn scoring(&self) -> Scoring {
        self.scoring.clone().unwrap_or_default()
    }
}

/// Definition metadata as registered in the store. The parsed definition
/// itself stays in the loader's in-memory catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkerMeta {
    pub id: String,
    pub class: MarkerClass,
    pub source_path: String,
    pub checksum: String,
    pub schema_version: i64,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Where a job's input comes from. Audio jobs exist so external tooling can
/// register them, but the engine only scans text transcripts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    Audio,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::Audio => "audio",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "text" => Ok(SourceKind::Text),
            "audio" => Ok(SourceKind::Audio),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// A scan job. `conv` is the tenancy unit across every runtime table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub conv: String,
    pub source_kind: SourceKind,
    pub source_path: String,
    pub chunksize: u32,
    pub overlap: u32,
    pub created_at: DateTime<Utc>,
}
