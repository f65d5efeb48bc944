//! Runtime event contracts shared by the store and the level engines.

use crate::MarkerClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the window that activated a CLU (or MEMA sum-rule) marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowSnapshot {
    pub from_idx: i64,
    pub to_idx: i64,
    /// Distinct contributing marker ids in first-seen order.
    pub contributors: Vec<String>,
    /// Raw window value before formula projection.
    pub sum: f64,
}

/// Per-level event payload. The variant fixes which runtime table the event
/// belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum EventPayload {
    #[serde(rename = "ato")]
    Atomic { text: String },
    #[serde(rename = "sem")]
    Semantic { atos: Vec<String> },
    #[serde(rename = "clu")]
    Cluster { score: f64, window: WindowSnapshot },
    #[serde(rename = "mema")]
    Meta { rationale: String },
}

impl EventPayload {
    pub fn class(&self) -> MarkerClass {
        match self {
            EventPayload::Atomic { .. } => MarkerClass::Atomic,
            EventPayload::Semantic { .. } => MarkerClass::Semantic,
            EventPayload::Cluster { .. } => MarkerClass::Cluster,
            EventPayload::Meta { .. } => MarkerClass::Meta,
        }
    }
}

/// A single marker activation. `idx` is the 1-based message index; for a
/// given conv, events within a level are totally ordered by
/// `(idx, marker_id)` and `ts` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerEvent {
    pub conv: String,
    pub ts: DateTime<Utc>,
    pub idx: i64,
    pub marker_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl MarkerEvent {
    pub fn class(&self) -> MarkerClass {
        self.payload.class()
    }

    /// Emission order within a level.
    pub fn emit_key(&self) -> (i64, &str) {
        (self.idx, self.marker_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn payload_reports_its_class() {
        let payload = EventPayload::Semantic {
            atos: vec!["ATO_A".to_string(), "ATO_B".to_string()],
        };
        assert_eq!(payload.class(), MarkerClass::Semantic);
    }

    #[test]
    fn event_json_roundtrips_bit_identically() {
        let event = MarkerEvent {
            conv: "demo".to_string(),
            ts: ts(),
            idx: 4,
            marker_id: "CLU_RETREAT".to_string(),
            payload: EventPayload::Cluster {
                score: 2.0,
                window: WindowSnapshot {
                    from_idx: 1,
                    to_idx: 4,
                    contributors: vec!["SEM_X".to_string()],
                    sum: 2.0,
                },
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: MarkerEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
        assert_eq!(serde_json::to_string(&back).expect("serialize"), json);
    }

    #[test]
    fn emit_key_orders_by_idx_then_marker_id() {
        let make = |idx: i64, marker_id: &str| MarkerEvent {
            conv: "demo".to_string(),
            ts: ts(),
            idx,
            marker_id: marker_id.to_string(),
            payload: EventPayload::Atomic {
                text: "x".to_string(),
            },
        };
        let a = make(2, "ATO_B");
        let b = make(2, "ATO_A");
        let c = make(1, "ATO_Z");
        let mut events = vec![a.clone(), b.clone(), c.clone()];
        events.sort_by(|left, right| left.emit_key().cmp(&right.emit_key()));
        assert_eq!(events, vec![c, b, a]);
    }
}
