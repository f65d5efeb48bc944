//! JSONL and CSV event dumps.
//!
//! One file pair per level under `<out_dir>/<conv>/`. JSONL keys are fixed
//! in the order `level, conv, ts, idx, marker_id, <payload>`; the CSV
//! carries the same head columns with the payload inlined as one JSON
//! column. Every written file is registered in the artifacts table.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tr_core::{EventPayload, MarkerClass, MarkerEvent, WindowSnapshot};
use tr_storage::{ArtifactRecord, MarkerStore, StorageError};
use tracing::debug;

/// Level selector for `export.events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportLevel {
    One(MarkerClass),
    All,
}

impl FromStr for ExportLevel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().eq_ignore_ascii_case("all") {
            return Ok(ExportLevel::All);
        }
        input.parse::<MarkerClass>().map(ExportLevel::One)
    }
}

#[derive(Serialize)]
struct AtoRow<'a> {
    level: &'static str,
    conv: &'a str,
    ts: String,
    idx: i64,
    marker_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct SemRow<'a> {
    level: &'static str,
    conv: &'a str,
    ts: String,
    idx: i64,
    marker_id: &'a str,
    atos: &'a [String],
}

#[derive(Serialize)]
struct CluRow<'a> {
    level: &'static str,
    conv: &'a str,
    ts: String,
    idx: i64,
    marker_id: &'a str,
    score: f64,
    window: &'a WindowSnapshot,
}

#[derive(Serialize)]
struct MemaRow<'a> {
    level: &'static str,
    conv: &'a str,
    ts: String,
    idx: i64,
    marker_id: &'a str,
    rationale: &'a str,
}

/// Dump a conv's events for the selected level(s). Levels without events
/// are skipped under `All` and produce empty files when named explicitly.
pub fn export_events(
    store: &MarkerStore,
    conv: &str,
    level: ExportLevel,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, StorageError> {
    let levels: Vec<MarkerClass> = match level {
        ExportLevel::One(class) => vec![class],
        ExportLevel::All => MarkerClass::ALL.to_vec(),
    };

    let conv_dir = out_dir.join(conv);
    std::fs::create_dir_all(&conv_dir).map_err(|err| StorageError::Io(err.to_string()))?;

    let mut files = Vec::new();
    for class in levels {
        let events = store.query_events(class, conv, None)?;
        if events.is_empty() && level == ExportLevel::All {
            continue;
        }

        let jsonl_path = conv_dir.join(format!("{class}.jsonl"));
        let csv_path = conv_dir.join(format!("{class}.csv"));
        write_file(&jsonl_path, &jsonl_dump(&events)?)?;
        write_file(&csv_path, &csv_dump(&events)?)?;

        let created_at = Utc::now();
        for path in [&jsonl_path, &csv_path] {
            store.record_artifact(&ArtifactRecord {
                conv: conv.to_string(),
                level: class,
                path: path.display().to_string(),
                created_at,
            })?;
        }
        debug!(conv, level = %class, events = events.len(), "exported level");
        files.push(jsonl_path);
        files.push(csv_path);
    }
    Ok(files)
}

fn jsonl_dump(events: &[MarkerEvent]) -> Result<String, StorageError> {
    let mut out = String::new();
    for event in events {
        out.push_str(&event_json_line(event)?);
        out.push('\n');
    }
    Ok(out)
}

fn event_json_line(event: &MarkerEvent) -> Result<String, StorageError> {
    let ts = event.ts.to_rfc3339();
    let line = match &event.payload {
        EventPayload::Atomic { text } => serde_json::to_string(&AtoRow {
            level: MarkerClass::Atomic.as_str(),
            conv: &event.conv,
            ts,
            idx: event.idx,
            marker_id: &event.marker_id,
            text,
        })?,
        EventPayload::Semantic { atos } => serde_json::to_string(&SemRow {
            level: MarkerClass::Semantic.as_str(),
            conv: &event.conv,
            ts,
            idx: event.idx,
            marker_id: &event.marker_id,
            atos,
        })?,
        EventPayload::Cluster { score, window } => serde_json::to_string(&CluRow {
            level: MarkerClass::Cluster.as_str(),
            conv: &event.conv,
            ts,
            idx: event.idx,
            marker_id: &event.marker_id,
            score: *score,
            window,
        })?,
        EventPayload::Meta { rationale } => serde_json::to_string(&MemaRow {
            level: MarkerClass::Meta.as_str(),
            conv: &event.conv,
            ts,
            idx: event.idx,
            marker_id: &event.marker_id,
            rationale,
        })?,
    };
    Ok(line)
}

fn csv_dump(events: &[MarkerEvent]) -> Result<String, StorageError> {
    let mut out = String::from("level,conv,ts,idx,marker_id,payload\n");
    for event in events {
        let payload = match &event.payload {
            EventPayload::Atomic { text } => json!({ "text": text }),
            EventPayload::Semantic { atos } => json!({ "atos": atos }),
            EventPayload::Cluster { score, window } => json!({ "score": score, "window": window }),
            EventPayload::Meta { rationale } => json!({ "rationale": rationale }),
        };
        let _ = writeln!(
            out,
            "{},{},{},{},{},{}",
            event.class(),
            csv_field(&event.conv),
            event.ts.to_rfc3339(),
            event.idx,
            csv_field(&event.marker_id),
            csv_field(&serde_json::to_string(&payload)?),
        );
    }
    Ok(out)
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), StorageError> {
    std::fs::write(path, contents).map_err(|err| StorageError::Io(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 1)
            .single()
            .expect("valid timestamp")
    }

    fn ato_event(idx: i64, marker_id: &str, text: &str) -> MarkerEvent {
        MarkerEvent {
            conv: "demo".to_string(),
            ts: ts(),
            idx,
            marker_id: marker_id.to_string(),
            payload: EventPayload::Atomic {
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn jsonl_keys_are_ordered() {
        let line = event_json_line(&ato_event(1, "ATO_JA_ABER", "Ja, aber")).expect("serialize");
        let level = line.find("\"level\"").expect("level key");
        let conv = line.find("\"conv\"").expect("conv key");
        let ts_key = line.find("\"ts\"").expect("ts key");
        let idx = line.find("\"idx\"").expect("idx key");
        let marker = line.find("\"marker_id\"").expect("marker key");
        let text = line.find("\"text\"").expect("text key");
        assert!(level < conv && conv < ts_key && ts_key < idx && idx < marker && marker < text);
    }

    #[test]
    fn csv_quotes_fields_with_commas() {
        let dump = csv_dump(&[ato_event(1, "ATO_JA_ABER", "Ja, aber")]).expect("dump");
        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some("level,conv,ts,idx,marker_id,payload"));
        let row = lines.next().expect("row");
        assert!(row.starts_with("ato,demo,"));
        assert!(row.contains("\"{\"\"text\"\":\"\"Ja, aber\"\"}\""));
    }

    #[test]
    fn export_writes_files_and_registers_artifacts() {
        let store = MarkerStore::open_in_memory().expect("open db");
        store
            .append_events(MarkerClass::Atomic, "demo", &[ato_event(1, "ATO_A", "hit")])
            .expect("append");

        let out = TempDir::new().expect("tempdir");
        let files =
            export_events(&store, "demo", ExportLevel::All, out.path()).expect("export");

        // Only the atomic level has events, so exactly one jsonl/csv pair.
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("demo/ato.jsonl"));
        let contents = std::fs::read_to_string(&files[0]).expect("read");
        assert_eq!(contents.lines().count(), 1);

        let artifacts = store.list_artifacts("demo").expect("artifacts");
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts
            .iter()
            .all(|artifact| artifact.level == MarkerClass::Atomic));
    }

    #[test]
    fn named_level_with_no_events_writes_empty_files() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let out = TempDir::new().expect("tempdir");
        let files = export_events(
            &store,
            "demo",
            ExportLevel::One(MarkerClass::Semantic),
            out.path(),
        )
        .expect("export");
        assert_eq!(files.len(), 2);
        let contents = std::fs::read_to_string(&files[0]).expect("read");
        assert!(contents.is_empty());
    }
}
