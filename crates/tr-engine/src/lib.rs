//! Marker pipeline orchestration.
//!
//! `MarkerEngine::run` executes one conversation bottom-up: clear runtime
//! state, chunk the transcript, then ATO → SEM → CLU → MEMA with a store
//! barrier between levels. Event emission per conv is totally ordered by
//! `(idx, marker_id)` within a level; appends are batched and transactional.
//! A cooperative cancel token is honored between messages and before every
//! flush; cancel and mid-run failure both leave the conv without partial
//! events.

pub mod atomic;
pub mod chunker;
pub mod cluster;
pub mod export;
pub mod meta;
pub mod semantic;

pub use export::{export_events, ExportLevel};
pub use meta::{DetectorRegistry, MetaDetector};

use chunker::{Message, MessageStream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tr_core::{ActivationRule, MarkerClass, MarkerDefinition, MarkerEvent, SourceKind};
use tr_markers::{MarkerCatalog, ValidationError};
use tr_storage::{MarkerStore, StorageError};
use tracing::{debug, info, info_span, warn};

pub const DEFAULT_BATCH_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pattern failed to compile for {marker_id}")]
    PatternCompile { marker_id: String },
    #[error("detector {name} is not registered")]
    DetectorMissing { name: String },
    #[error("engine internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    /// Stable tag for CLI error objects and exit-code mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Storage(err) => err.kind(),
            RunError::Engine(_) => "engine",
            RunError::Validation(_) => "validation",
            RunError::Cancelled => "cancelled",
        }
    }
}

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide defaults, normally read from `schemas/defaults.yml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDefaults {
    pub sem_rule: String,
    pub clu_rule: String,
    pub mema_hits: u32,
    pub mema_window: u32,
    pub chunksize: u32,
    pub overlap: u32,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            sem_rule: "ANY 2 IN 3 messages".to_string(),
            clu_rule: "AT_LEAST 2 DISTINCT SEMs IN 10 messages".to_string(),
            mema_hits: 3,
            mema_window: meta::DEFAULT_MEMA_WINDOW,
            chunksize: 800,
            overlap: 80,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DefaultsDoc {
    #[serde(default)]
    window: WindowDoc,
    #[serde(default)]
    aggregation: AggregationDoc,
    #[serde(default)]
    chunking: ChunkingDoc,
}

#[derive(Debug, Default, Deserialize)]
struct WindowDoc {
    #[serde(default)]
    sem: Option<String>,
    #[serde(default)]
    clu: Option<String>,
    #[serde(default)]
    mema_messages: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AggregationDoc {
    #[serde(default)]
    mema_hits: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkingDoc {
    #[serde(default)]
    chunksize: Option<u32>,
    #[serde(default)]
    overlap: Option<u32>,
}

impl EngineDefaults {
    /// Read `defaults.yml` from the schemas directory. A missing file or
    /// key falls back to the built-in defaults; a rule that fails to parse
    /// is ignored with a warning.
    pub fn load(schemas_dir: &Path) -> Self {
        let mut defaults = Self::default();
        let path = schemas_dir.join("defaults.yml");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return defaults;
        };
        let doc: DefaultsDoc = match serde_yaml::from_str(&contents) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed defaults document");
                return defaults;
            }
        };

        for (slot, value) in [
            (&mut defaults.sem_rule, doc.window.sem),
            (&mut defaults.clu_rule, doc.window.clu),
        ] {
            if let Some(rule) = value {
                match ActivationRule::parse(&rule) {
                    Ok(_) => *slot = rule,
                    Err(err) => {
                        warn!(error = %err, "ignoring malformed default rule");
                    }
                }
            }
        }
        if let Some(window) = doc.window.mema_messages {
            defaults.mema_window = window;
        }
        if let Some(hits) = doc.aggregation.mema_hits {
            defaults.mema_hits = hits;
        }
        if let Some(chunksize) = doc.chunking.chunksize {
            defaults.chunksize = chunksize;
        }
        if let Some(overlap) = doc.chunking.overlap {
            defaults.overlap = overlap;
        }
        defaults
    }
}

/// Per-run overrides, a closed set. `seed` is reserved for stochastic
/// detectors; none of the built-ins use it.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub window_sem: Option<String>,
    pub window_clu: Option<String>,
    pub seed: Option<u64>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub ato: usize,
    pub sem: usize,
    pub clu: usize,
    pub mema: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub ok: bool,
    pub counts: RunCounts,
    pub trace_id: String,
    pub duration_ms: u64,
}

pub struct MarkerEngine {
    defaults: EngineDefaults,
    detectors: DetectorRegistry,
}

impl Default for MarkerEngine {
    fn default() -> Self {
        Self::new(EngineDefaults::default())
    }
}

impl MarkerEngine {
    pub fn new(defaults: EngineDefaults) -> Self {
        Self {
            defaults,
            detectors: DetectorRegistry::builtin(),
        }
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    /// Detector names handed to the validator.
    pub fn detector_names(&self) -> BTreeSet<String> {
        self.detectors.names()
    }

    /// Run the full pipeline for one conv. The conv's previous runtime
    /// state is cleared first; on any failure or cancel the run's own
    /// writes are removed again, leaving the conv `cleared`.
    pub fn run(
        &self,
        store: &MarkerStore,
        catalog: &MarkerCatalog,
        conv: &str,
        overrides: &RunOverrides,
        cancel: &CancelToken,
    ) -> Result<RunSummary, RunError> {
        let span = info_span!("run_scan", conv);
        let _guard = span.enter();
        let started = Instant::now();

        let job = store.get_job(conv)?;
        store.clear_runtime(conv)?;

        match self.run_pipeline(store, catalog, &job, overrides, cancel) {
            Ok(counts) => {
                let summary = RunSummary {
                    ok: true,
                    counts,
                    trace_id: conv.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    ato = counts.ato,
                    sem = counts.sem,
                    clu = counts.clu,
                    mema = counts.mema,
                    duration_ms = summary.duration_ms,
                    "run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                // No partial events stay observable; the conv ends cleared.
                let _ = store.clear_runtime(conv);
                Err(err)
            }
        }
    }

    fn run_pipeline(
        &self,
        store: &MarkerStore,
        catalog: &MarkerCatalog,
        job: &tr_core::Job,
        overrides: &RunOverrides,
        cancel: &CancelToken,
    ) -> Result<RunCounts, RunError> {
        if job.source_kind == SourceKind::Audio {
            return Err(EngineError::Internal(format!(
                "job {} has an audio source and requires an external transcript",
                job.conv
            ))
            .into());
        }

        let text = std::fs::read_to_string(&job.source_path)
            .map_err(|err| StorageError::Io(format!("{}: {err}", job.source_path)))?;
        let messages: Vec<Message> = MessageStream::new(&text, job.created_at).collect();
        let chunks: usize = messages
            .iter()
            .map(|message| chunker::chunk_count(&message.text, job.chunksize, job.overlap))
            .sum();
        debug!(messages = messages.len(), chunks, "chunked input");

        let batch_size = overrides.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
        let conv = job.conv.as_str();

        // ATO: scan per message, flushing batches as they fill.
        let ato_defs = self.enabled_defs(store, catalog, MarkerClass::Atomic)?;
        let compiled = atomic::compile(&ato_defs)?;
        let mut pending: Vec<MarkerEvent> = Vec::new();
        for message in &messages {
            check_cancel(cancel)?;
            pending.extend(atomic::scan_message(&compiled, conv, message));
            if pending.len() >= batch_size {
                store.append_events(MarkerClass::Atomic, conv, &pending)?;
                pending.clear();
            }
        }
        check_cancel(cancel)?;
        store.append_events(MarkerClass::Atomic, conv, &pending)?;
        drop(pending);

        // Level barrier: each stage reads the level below back from the
        // store once its writes are complete.
        let ato_events = store.query_events(MarkerClass::Atomic, conv, None)?;

        let sem_default = self.default_rule(
            overrides.window_sem.as_deref(),
            &self.defaults.sem_rule,
            "window.sem",
        )?;
        let mut sem_pending = Vec::new();
        for def in self.enabled_defs(store, catalog, MarkerClass::Semantic)? {
            check_cancel(cancel)?;
            let rule = marker_rule(def, &sem_default)?;
            sem_pending.extend(semantic::evaluate(def, &rule, &ato_events, &messages, conv));
        }
        append_ordered(store, MarkerClass::Semantic, conv, sem_pending, batch_size, cancel)?;
        let sem_events = store.query_events(MarkerClass::Semantic, conv, None)?;

        let clu_default = self.default_rule(
            overrides.window_clu.as_deref(),
            &self.defaults.clu_rule,
            "window.clu",
        )?;
        let mut clu_pending = Vec::new();
        for def in self.enabled_defs(store, catalog, MarkerClass::Cluster)? {
            check_cancel(cancel)?;
            let rule = marker_rule(def, &clu_default)?;
            clu_pending.extend(cluster::evaluate(def, &rule, &sem_events, &messages, conv));
        }
        append_ordered(store, MarkerClass::Cluster, conv, clu_pending, batch_size, cancel)?;
        let clu_events = store.query_events(MarkerClass::Cluster, conv, None)?;

        let mut mema_pending = Vec::new();
        for def in self.enabled_defs(store, catalog, MarkerClass::Meta)? {
            check_cancel(cancel)?;
            if let Some(name) = def.detect_class.as_deref() {
                let detector = self
                    .detectors
                    .get(name)
                    .ok_or_else(|| EngineError::DetectorMissing {
                        name: name.to_string(),
                    })?;
                mema_pending.extend(meta::run_detector(
                    def,
                    detector,
                    &clu_events,
                    &messages,
                    catalog,
                    conv,
                ));
            } else {
                let rule = marker_rule(def, &self.mema_default_rule(def))?;
                mema_pending.extend(meta::evaluate_rule(def, &rule, &clu_events, &messages, conv));
            }
        }
        append_ordered(store, MarkerClass::Meta, conv, mema_pending, batch_size, cancel)?;

        Ok(RunCounts {
            ato: store.count_events(MarkerClass::Atomic, conv)? as usize,
            sem: store.count_events(MarkerClass::Semantic, conv)? as usize,
            clu: store.count_events(MarkerClass::Cluster, conv)? as usize,
            mema: store.count_events(MarkerClass::Meta, conv)? as usize,
        })
    }

    /// Rule-mode MEMA default: `ANY <hits> IN <window> messages`, where the
    /// marker's own `window` field narrows the default window.
    fn mema_default_rule(&self, def: &MarkerDefinition) -> ActivationRule {
        ActivationRule::Any {
            hits: self.defaults.mema_hits,
            window: def.window.unwrap_or(self.defaults.mema_window),
        }
    }

    fn default_rule(
        &self,
        override_text: Option<&str>,
        default_text: &str,
        option: &str,
    ) -> Result<ActivationRule, RunError> {
        let text = override_text.unwrap_or(default_text);
        ActivationRule::parse(text).map_err(|err| {
            ValidationError {
                marker_id: format!("<{option}>"),
                source_path: option.to_string(),
                rule: "activation rule".to_string(),
                detail: err.to_string(),
            }
            .into()
        })
    }

    fn enabled_defs<'c>(
        &self,
        store: &MarkerStore,
        catalog: &'c MarkerCatalog,
        class: MarkerClass,
    ) -> Result<Vec<&'c MarkerDefinition>, StorageError> {
        let enabled: BTreeSet<String> = store
            .list_markers(Some(class), true)?
            .into_iter()
            .map(|meta| meta.id)
            .collect();
        Ok(catalog
            .of_class(class)
            .into_iter()
            .filter(|def| enabled.contains(&def.id))
            .collect())
    }
}

/// A marker's own rule, or the level default when it has none. A rule that
/// fails to parse here slipped past validation and aborts the run.
fn marker_rule(
    def: &MarkerDefinition,
    default: &ActivationRule,
) -> Result<ActivationRule, RunError> {
    match def.activation_rule() {
        Some(text) => ActivationRule::parse(text).map_err(|err| {
            EngineError::Internal(format!("marker {} carries an invalid rule: {err}", def.id))
                .into()
        }),
        None => Ok(default.clone()),
    }
}

/// Sort a level's events into emission order and append in batches, with a
/// cancel check before each flush.
fn append_ordered(
    store: &MarkerStore,
    level: MarkerClass,
    conv: &str,
    mut events: Vec<MarkerEvent>,
    batch_size: usize,
    cancel: &CancelToken,
) -> Result<(), RunError> {
    events.sort_by(|left, right| left.emit_key().cmp(&right.emit_key()));
    for batch in events.chunks(batch_size) {
        check_cancel(cancel)?;
        store.append_events(level, conv, batch)?;
    }
    Ok(())
}

fn check_cancel(cancel: &CancelToken) -> Result<(), RunError> {
    if cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fall_back_without_a_schemas_file() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(EngineDefaults::load(dir.path()), EngineDefaults::default());
    }

    #[test]
    fn defaults_overlay_from_the_schemas_document() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("defaults.yml"),
            "window:\n  sem: \"ANY 3 IN 5 messages\"\n  mema_messages: 40\nchunking:\n  chunksize: 400\n",
        )
        .expect("write defaults");

        let defaults = EngineDefaults::load(dir.path());
        assert_eq!(defaults.sem_rule, "ANY 3 IN 5 messages");
        assert_eq!(defaults.mema_window, 40);
        assert_eq!(defaults.chunksize, 400);
        // Untouched keys keep their built-in values.
        assert_eq!(defaults.clu_rule, EngineDefaults::default().clu_rule);
        assert_eq!(defaults.overlap, 80);
    }

    #[test]
    fn malformed_default_rule_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("defaults.yml"),
            "window:\n  sem: \"ANY nonsense\"\n",
        )
        .expect("write defaults");

        let defaults = EngineDefaults::load(dir.path());
        assert_eq!(defaults.sem_rule, EngineDefaults::default().sem_rule);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn bad_override_rule_surfaces_as_validation() {
        let engine = MarkerEngine::default();
        let err = engine
            .default_rule(Some("ANY garbage"), "ANY 2 IN 3 messages", "window.sem")
            .expect_err("must fail");
        assert_eq!(err.kind(), "validation");
    }
}
