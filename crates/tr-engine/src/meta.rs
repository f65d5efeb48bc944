//! Meta-level aggregation.
//!
//! Two modes. Rule mode works like the cluster engine but over CLU events
//! and records a machine-readable rationale instead of a score. Detector
//! mode hands the marker's CLU window to a registered pure detector; the
//! registry is fixed at engine construction and its names are what the
//! validator accepts for `detect_class`.

use crate::chunker::Message;
use crate::cluster::evaluate_window;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tr_core::{ActivationRule, EventPayload, MarkerDefinition, MarkerEvent};
use tr_markers::MarkerCatalog;

pub const DEFAULT_MEMA_WINDOW: u32 = 30;

/// Evaluate one rule-mode MEMA definition over a conv's CLU events,
/// edge-triggered like a CLU.
pub fn evaluate_rule(
    def: &MarkerDefinition,
    rule: &ActivationRule,
    clu_events: &[MarkerEvent],
    messages: &[Message],
    conv: &str,
) -> Vec<MarkerEvent> {
    let composed: BTreeSet<&str> = def.composed_of().iter().map(String::as_str).collect();
    let scoring = def.scoring();

    let mut events = Vec::new();
    let mut armed = true;
    for message in messages {
        let eval = evaluate_window(rule, &composed, clu_events, &scoring, message);
        if eval.satisfied {
            if armed {
                armed = false;
                let rationale = match rule {
                    ActivationRule::Any { .. } => format!("rule:any count={}", eval.count),
                    ActivationRule::AtLeastDistinct { .. } => {
                        format!("rule:at_least_distinct count={}", eval.distinct)
                    }
                    ActivationRule::Sum { .. } => format!("rule:sum sum={:.2}", eval.raw),
                };
                events.push(MarkerEvent {
                    conv: conv.to_string(),
                    ts: message.ts,
                    idx: message.idx,
                    marker_id: def.id.clone(),
                    payload: EventPayload::Meta { rationale },
                });
            }
        } else {
            armed = true;
        }
    }
    events
}

/// A detection returned by a [`MetaDetector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub idx: i64,
    pub ts: DateTime<Utc>,
    pub rationale: String,
}

/// A built-in meta detector: a pure function of its CLU window and the
/// marker catalog. Implementations must not observe anything else.
pub trait MetaDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(
        &self,
        def: &MarkerDefinition,
        window: &[MarkerEvent],
        catalog: &MarkerCatalog,
    ) -> Vec<Detection>;
}

/// The registered detector set, fixed at engine init.
pub struct DetectorRegistry {
    detectors: BTreeMap<&'static str, Box<dyn MetaDetector>>,
}

impl DetectorRegistry {
    pub fn builtin() -> Self {
        let mut detectors: BTreeMap<&'static str, Box<dyn MetaDetector>> = BTreeMap::new();
        for detector in [
            Box::new(RecurringCluster) as Box<dyn MetaDetector>,
            Box::new(ClusterFlip) as Box<dyn MetaDetector>,
        ] {
            detectors.insert(detector.name(), detector);
        }
        Self { detectors }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.detectors
            .keys()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn MetaDetector> {
        self.detectors.get(name).map(Box::as_ref)
    }
}

/// Slide the marker's window over the CLU events and collect detections,
/// de-duplicated by message index.
pub fn run_detector(
    def: &MarkerDefinition,
    detector: &dyn MetaDetector,
    clu_events: &[MarkerEvent],
    messages: &[Message],
    catalog: &MarkerCatalog,
    conv: &str,
) -> Vec<MarkerEvent> {
    let window = i64::from(def.window.unwrap_or(DEFAULT_MEMA_WINDOW));

    let mut seen = BTreeSet::new();
    let mut events = Vec::new();
    for message in messages {
        let from_idx = message.idx - window + 1;
        let slice: Vec<MarkerEvent> = clu_events
            .iter()
            .filter(|event| event.idx >= from_idx && event.idx <= message.idx)
            .cloned()
            .collect();
        if slice.is_empty() {
            continue;
        }
        for detection in detector.detect(def, &slice, catalog) {
            if seen.insert(detection.idx) {
                events.push(MarkerEvent {
                    conv: conv.to_string(),
                    ts: detection.ts,
                    idx: detection.idx,
                    marker_id: def.id.clone(),
                    payload: EventPayload::Meta {
                        rationale: detection.rationale,
                    },
                });
            }
        }
    }
    events.sort_by(|left, right| left.emit_key().cmp(&right.emit_key()));
    events
}

/// Fires where one CLU id reaches its third occurrence within the window.
struct RecurringCluster;

impl MetaDetector for RecurringCluster {
    fn name(&self) -> &'static str {
        "recurring_cluster"
    }

    fn detect(
        &self,
        _def: &MarkerDefinition,
        window: &[MarkerEvent],
        _catalog: &MarkerCatalog,
    ) -> Vec<Detection> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut detections = Vec::new();
        for event in window {
            let count = counts.entry(event.marker_id.as_str()).or_insert(0);
            *count += 1;
            if *count == 3 {
                detections.push(Detection {
                    idx: event.idx,
                    ts: event.ts,
                    rationale: format!(
                        "detector:recurring_cluster id={} count=3",
                        event.marker_id
                    ),
                });
            }
        }
        detections
    }
}

/// Fires where two distinct CLU ids complete an A…B…A alternation within the
/// window.
struct ClusterFlip;

impl MetaDetector for ClusterFlip {
    fn name(&self) -> &'static str {
        "cluster_flip"
    }

    fn detect(
        &self,
        _def: &MarkerDefinition,
        window: &[MarkerEvent],
        _catalog: &MarkerCatalog,
    ) -> Vec<Detection> {
        // Collapse consecutive repeats, then look for x,y,x at the tail.
        let mut runs: Vec<&str> = Vec::new();
        let mut detections = Vec::new();
        for event in window {
            if runs.last() != Some(&event.marker_id.as_str()) {
                runs.push(event.marker_id.as_str());
            }
            if runs.len() >= 3 {
                let a = runs[runs.len() - 3];
                let b = runs[runs.len() - 2];
                let back = runs[runs.len() - 1];
                if a == back && a != b && back == event.marker_id {
                    detections.push(Detection {
                        idx: event.idx,
                        ts: event.ts,
                        rationale: format!("detector:cluster_flip a={a} b={b}"),
                    });
                }
            }
        }
        detections
    }
}
