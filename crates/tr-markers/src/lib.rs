//! Marker definition loading.
//!
//! Walks a markers directory tree (`atomic/`, `semantic/`, `cluster/`,
//! `meta/`), parses each YAML document, checksums the raw bytes, validates
//! the whole catalog, and registers metadata in the store. Registration is
//! all-or-nothing: a single validation violation leaves the store untouched.

mod validator;

pub use validator::{validate, ValidationError};

use chrono::Utc;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tr_core::{
    Activation, Frame, MarkerClass, MarkerDefinition, MarkerMeta, Scoring, MARKER_SCHEMA_VERSION,
};
use tr_storage::{MarkerStore, StorageError};
use tracing::{debug, warn};

/// Per-file loader failures. These accumulate; a bad file never aborts the
/// batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("parse failed for {path}: {detail}")]
    ParseFailed { path: String, detail: String },
    #[error("{path} is not under a known marker class directory")]
    UnknownClass { path: String },
    #[error("duplicate marker id {id} at {path}")]
    DuplicateId { id: String, path: String },
}

/// A parsed definition together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMarker {
    pub def: MarkerDefinition,
    pub source_path: String,
    pub checksum: String,
}

/// Read-only definition cache built after a successful load, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct MarkerCatalog {
    defs: BTreeMap<String, MarkerDefinition>,
}

impl MarkerCatalog {
    pub fn get(&self, id: &str) -> Option<&MarkerDefinition> {
        self.defs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.defs.contains_key(id)
    }

    /// Definitions of one class in id order.
    pub fn of_class(&self, class: MarkerClass) -> Vec<&MarkerDefinition> {
        self.defs
            .values()
            .filter(|def| def.class == class)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerDefinition> {
        self.defs.values()
    }
}

/// Outcome of a load or validate pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<LoaderError>,
    pub violations: Vec<ValidationError>,
}

impl LoadReport {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// The YAML document shape. The class never appears in the file; the
/// directory decides it and the id prefix must agree.
#[derive(Debug, Deserialize)]
struct RawMarkerDoc {
    id: String,
    #[serde(default)]
    frame: Option<Frame>,
    #[serde(default)]
    examples: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    composed_of: Option<Vec<String>>,
    #[serde(default)]
    detect_class: Option<String>,
    #[serde(default)]
    activation: Option<Activation>,
    #[serde(default)]
    scoring: Option<Scoring>,
    #[serde(default)]
    window: Option<u32>,
}

/// Parse every marker file under `markers_dir` without validating. Files
/// that fail to parse are skipped and reported.
pub fn parse_tree(markers_dir: &Path) -> (BTreeMap<String, ParsedMarker>, Vec<LoaderError>) {
    let mut parsed = BTreeMap::new();
    let mut skipped = Vec::new();

    for entry in list_dir(markers_dir) {
        if entry.is_dir() {
            let dir_name = file_name(&entry);
            let class = MarkerClass::ALL
                .into_iter()
                .find(|class| class.dir_name() == dir_name);
            match class {
                Some(class) => parse_class_dir(&entry, class, &mut parsed, &mut skipped),
                None => {
                    for file in marker_files(&entry) {
                        skipped.push(LoaderError::UnknownClass {
                            path: display_path(&file),
                        });
                    }
                }
            }
        } else if is_marker_file(&entry) {
            skipped.push(LoaderError::UnknownClass {
                path: display_path(&entry),
            });
        }
    }

    (parsed, skipped)
}

fn parse_class_dir(
    dir: &Path,
    class: MarkerClass,
    parsed: &mut BTreeMap<String, ParsedMarker>,
    skipped: &mut Vec<LoaderError>,
) {
    for path in marker_files(dir) {
        match parse_file(&path, class) {
            Ok(marker) => {
                if parsed.contains_key(&marker.def.id) {
                    skipped.push(LoaderError::DuplicateId {
                        id: marker.def.id,
                        path: display_path(&path),
                    });
                    continue;
                }
                debug!(id = %marker.def.id, path = %marker.source_path, "parsed marker");
                parsed.insert(marker.def.id.clone(), marker);
            }
            Err(err) => {
                warn!(path = %display_path(&path), error = %err, "skipping marker file");
                skipped.push(err);
            }
        }
    }
}

fn parse_file(path: &Path, class: MarkerClass) -> Result<ParsedMarker, LoaderError> {
    let bytes = std::fs::read(path).map_err(|err| LoaderError::ParseFailed {
        path: display_path(path),
        detail: err.to_string(),
    })?;
    let text = std::str::from_utf8(&bytes).map_err(|err| LoaderError::ParseFailed {
        path: display_path(path),
        detail: err.to_string(),
    })?;
    let doc: RawMarkerDoc =
        serde_yaml::from_str(text).map_err(|err| LoaderError::ParseFailed {
            path: display_path(path),
            detail: err.to_string(),
        })?;

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    if doc.id != stem {
        return Err(LoaderError::ParseFailed {
            path: display_path(path),
            detail: format!("id {} does not match filename {stem}", doc.id),
        });
    }

    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    let checksum = format!("{:x}", hasher.finalize());

    Ok(ParsedMarker {
        def: MarkerDefinition {
            id: doc.id,
            class,
            frame: doc.frame,
            examples: doc.examples,
            tags: doc.tags,
            pattern: doc.pattern,
            composed_of: doc.composed_of,
            detect_class: doc.detect_class,
            activation: doc.activation,
            scoring: doc.scoring,
            window: doc.window,
        },
        source_path: display_path(path),
        checksum,
    })
}

/// Parse and validate without touching the store.
pub fn validate_tree(
    markers_dir: &Path,
    detectors: &BTreeSet<String>,
    strict: bool,
) -> LoadReport {
    let (parsed, skipped) = parse_tree(markers_dir);
    let violations = validate(&parsed, detectors, strict);
    LoadReport {
        loaded: if violations.is_empty() { parsed.len() } else { 0 },
        skipped,
        violations,
    }
}

/// Full load: parse, validate strictly, and register every definition's
/// metadata in the store. Any violation leaves the store untouched and the
/// returned catalog empty.
pub fn load_and_register(
    markers_dir: &Path,
    store: &MarkerStore,
    detectors: &BTreeSet<String>,
    strict: bool,
) -> Result<(MarkerCatalog, LoadReport), StorageError> {
    let (parsed, skipped) = parse_tree(markers_dir);
    let violations = validate(&parsed, detectors, strict);
    if !violations.is_empty() {
        return Ok((
            MarkerCatalog::default(),
            LoadReport {
                loaded: 0,
                skipped,
                violations,
            },
        ));
    }

    let now = Utc::now();
    for marker in parsed.values() {
        store.register_marker(&MarkerMeta {
            id: marker.def.id.clone(),
            class: marker.def.class,
            source_path: marker.source_path.clone(),
            checksum: marker.checksum.clone(),
            schema_version: MARKER_SCHEMA_VERSION,
            enabled: true,
            updated_at: now,
        })?;
    }

    let loaded = parsed.len();
    let catalog = MarkerCatalog {
        defs: parsed
            .into_iter()
            .map(|(id, marker)| (id, marker.def))
            .collect(),
    };
    debug!(loaded, skipped = skipped.len(), "marker load complete");

    Ok((
        catalog,
        LoadReport {
            loaded,
            skipped,
            violations: Vec::new(),
        },
    ))
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

fn marker_files(dir: &Path) -> Vec<PathBuf> {
    list_dir(dir)
        .into_iter()
        .filter(|path| path.is_file() && is_marker_file(path))
        .collect()
}

fn is_marker_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string()
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
