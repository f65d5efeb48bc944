//! Semantic composition over sliding message windows.
//!
//! SEM markers are condition-like: a marker emits at most one event per
//! message index and re-emits at the next message if its window still
//! satisfies the rule.

use crate::chunker::Message;
use std::collections::BTreeSet;
use tr_core::{ActivationRule, EventPayload, MarkerDefinition, MarkerEvent};

/// Evaluate one SEM definition over a conv's ATO events. `ato_events` must
/// be in emission order; `messages` in ascending `idx`.
pub fn evaluate(
    def: &MarkerDefinition,
    rule: &ActivationRule,
    ato_events: &[MarkerEvent],
    messages: &[Message],
    conv: &str,
) -> Vec<MarkerEvent> {
    let composed: BTreeSet<&str> = def.composed_of().iter().map(String::as_str).collect();
    let Some(window) = rule.window_messages() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for message in messages {
        let from_idx = message.idx - i64::from(window) + 1;
        let mut contributing = 0usize;
        let mut atos: Vec<String> = Vec::new();
        for event in ato_events {
            if event.idx < from_idx || event.idx > message.idx {
                continue;
            }
            if !composed.contains(event.marker_id.as_str()) {
                continue;
            }
            contributing += 1;
            if !atos.contains(&event.marker_id) {
                atos.push(event.marker_id.clone());
            }
        }

        // The >=2 distinct ATO invariant holds at runtime regardless of the
        // rule's own threshold.
        let satisfied = match rule {
            ActivationRule::Any { hits, .. } => contributing >= *hits as usize && atos.len() >= 2,
            ActivationRule::AtLeastDistinct { distinct, .. } => {
                atos.len() >= *distinct as usize && atos.len() >= 2
            }
            ActivationRule::Sum { .. } => false,
        };

        if satisfied {
            events.push(MarkerEvent {
                conv: conv.to_string(),
                ts: message.ts,
                idx: message.idx,
                marker_id: def.id.clone(),
                payload: EventPayload::Semantic { atos },
            });
        }
    }
    events
}
