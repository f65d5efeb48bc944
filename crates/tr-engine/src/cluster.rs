//! Cluster aggregation over SEM events.
//!
//! CLU markers are event-like: a marker emits when its predicate first
//! becomes true at a message and stays silent until the predicate has gone
//! false at least once. Sum rules maintain a decayed weighted sum whose
//! decay domain follows the horizon unit of the rule.

use crate::chunker::Message;
use std::collections::BTreeSet;
use tr_core::{
    ActivationRule, EventPayload, Horizon, MarkerDefinition, MarkerEvent, Scoring, WindowSnapshot,
};

/// One window evaluation at a message boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEval {
    pub satisfied: bool,
    /// Raw value before formula projection: decayed weighted sum for sum
    /// rules, contributing-event count for ANY, distinct-id count for
    /// AT_LEAST.
    pub raw: f64,
    pub contributors: Vec<String>,
    pub from_idx: i64,
    pub count: usize,
    pub distinct: usize,
}

/// Evaluate a rule's window ending at `message` over the level-below events
/// listed in `composed`.
pub fn evaluate_window(
    rule: &ActivationRule,
    composed: &BTreeSet<&str>,
    events: &[MarkerEvent],
    scoring: &Scoring,
    message: &Message,
) -> WindowEval {
    let mut contributors: Vec<String> = Vec::new();
    let mut count = 0usize;
    let mut sum = 0.0f64;
    let mut min_idx = message.idx;

    let message_window = match rule {
        ActivationRule::Any { window, .. } => Some(i64::from(*window)),
        ActivationRule::AtLeastDistinct { window, .. } => Some(i64::from(*window)),
        ActivationRule::Sum {
            horizon: Horizon::Messages(window),
            ..
        } => Some(i64::from(*window)),
        ActivationRule::Sum {
            horizon: Horizon::Seconds(_),
            ..
        } => None,
    };

    for event in events {
        let in_window = match (message_window, rule) {
            (Some(window), _) => {
                event.idx > message.idx - window && event.idx <= message.idx
            }
            (
                None,
                ActivationRule::Sum {
                    horizon: Horizon::Seconds(seconds),
                    ..
                },
            ) => {
                event.ts > message.ts - chrono::Duration::seconds(*seconds)
                    && event.ts <= message.ts
            }
            (None, _) => false,
        };
        if !in_window || !composed.contains(event.marker_id.as_str()) {
            continue;
        }

        count += 1;
        min_idx = min_idx.min(event.idx);
        if !contributors.contains(&event.marker_id) {
            contributors.push(event.marker_id.clone());
        }

        let delta = match rule {
            ActivationRule::Sum {
                horizon: Horizon::Seconds(_),
                ..
            } => (message.ts - event.ts).num_seconds().max(0) as f64,
            _ => (message.idx - event.idx) as f64,
        };
        sum += scoring.weight * (-scoring.decay * delta).exp();
    }

    let distinct = contributors.len();
    let (satisfied, raw) = match rule {
        ActivationRule::Any { hits, .. } => (count >= *hits as usize, count as f64),
        ActivationRule::AtLeastDistinct {
            distinct: needed, ..
        } => (distinct >= *needed as usize, distinct as f64),
        ActivationRule::Sum { cmp, threshold, .. } => (cmp.holds(sum, *threshold), sum),
    };

    let from_idx = message_window
        .map(|window| (message.idx - window + 1).max(1))
        .unwrap_or(min_idx);

    WindowEval {
        satisfied,
        raw,
        contributors,
        from_idx,
        count,
        distinct,
    }
}

/// Evaluate one CLU definition over a conv's SEM events, edge-triggered.
pub fn evaluate(
    def: &MarkerDefinition,
    rule: &ActivationRule,
    sem_events: &[MarkerEvent],
    messages: &[Message],
    conv: &str,
) -> Vec<MarkerEvent> {
    let composed: BTreeSet<&str> = def.composed_of().iter().map(String::as_str).collect();
    let scoring = def.scoring();

    let mut events = Vec::new();
    let mut armed = true;
    for message in messages {
        let eval = evaluate_window(rule, &composed, sem_events, &scoring, message);
        if eval.satisfied {
            if armed {
                armed = false;
                events.push(MarkerEvent {
                    conv: conv.to_string(),
                    ts: message.ts,
                    idx: message.idx,
                    marker_id: def.id.clone(),
                    payload: EventPayload::Cluster {
                        score: scoring.formula.project(eval.raw, scoring.base),
                        window: WindowSnapshot {
                            from_idx: eval.from_idx,
                            to_idx: message.idx,
                            contributors: eval.contributors,
                            sum: eval.raw,
                        },
                    },
                });
            }
        } else {
            armed = true;
        }
    }
    events
}
