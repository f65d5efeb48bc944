use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tr_core::{EventPayload, Job, MarkerClass, MarkerEvent, MarkerMeta, SourceKind, WindowSnapshot};

pub const STORE_SCHEMA_VERSION: i64 = 1;

/// Storage failures, classified into the engine's closed error set. Raw
/// `rusqlite` errors never cross the crate boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt database: {0}")]
    Corrupt(String),
    #[error("storage io: {0}")]
    Io(String),
}

impl StorageError {
    /// Stable tag used by CLI error objects and exit-code mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "not_found",
            StorageError::Conflict(_) => "conflict",
            StorageError::Corrupt(_) => "corrupt",
            StorageError::Io(_) => "io",
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound("row".to_string()),
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => StorageError::Conflict(err.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageError::Corrupt(err.to_string())
                }
                _ => StorageError::Io(err.to_string()),
            },
            _ => StorageError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(format!("payload json: {err}"))
    }
}

/// A file produced by the exporter, tracked per conv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub conv: String,
    pub level: MarkerClass,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

pub struct MarkerStore {
    conn: Connection,
}

impl std::fmt::Debug for MarkerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerStore").finish_non_exhaustive()
    }
}

impl MarkerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STORE_SCHEMA_VERSION {
            return Err(StorageError::Corrupt(format!(
                "schema version {current} is newer than supported {STORE_SCHEMA_VERSION}"
            )));
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_marker_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn register_marker(&self, meta: &MarkerMeta) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO markers (
                id, class, source_path, checksum, schema_version, enabled, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                class=excluded.class,
                source_path=excluded.source_path,
                checksum=excluded.checksum,
                schema_version=excluded.schema_version,
                enabled=excluded.enabled,
                updated_at=excluded.updated_at
            ",
            params![
                meta.id,
                meta.class.as_str(),
                meta.source_path,
                meta.checksum,
                meta.schema_version,
                if meta.enabled { 1_i64 } else { 0_i64 },
                meta.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_marker(&self, id: &str) -> Result<Option<MarkerMeta>, StorageError> {
        let meta = self
            .conn
            .query_row(
                "
                SELECT id, class, source_path, checksum, schema_version, enabled, updated_at
                FROM markers
                WHERE id = ?1
                ",
                [id],
                marker_meta_from_row,
            )
            .optional()?;
        Ok(meta)
    }

    pub fn list_markers(
        &self,
        class: Option<MarkerClass>,
        enabled_only: bool,
    ) -> Result<Vec<MarkerMeta>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, class, source_path, checksum, schema_version, enabled, updated_at
            FROM markers
            WHERE (?1 IS NULL OR class = ?1)
              AND (?2 = 0 OR enabled = 1)
            ORDER BY id ASC
            ",
        )?;

        let class_filter = class.map(|class| class.as_str());
        let rows = statement.query_map(
            params![class_filter, if enabled_only { 1_i64 } else { 0_i64 }],
            marker_meta_from_row,
        )?;

        let mut markers = Vec::new();
        for row in rows {
            markers.push(row?);
        }
        Ok(markers)
    }

    pub fn set_marker_enabled(&self, id: &str, enabled: bool) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE markers SET enabled = ?2 WHERE id = ?1",
            params![id, if enabled { 1_i64 } else { 0_i64 }],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("marker {id}")));
        }
        Ok(())
    }

    pub fn create_job(&self, job: &Job) -> Result<(), StorageError> {
        let inserted = self.conn.execute(
            "
            INSERT OR IGNORE INTO jobs (
                conv, source_kind, source_path, chunksize, overlap, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                job.conv,
                job.source_kind.as_str(),
                job.source_path,
                i64::from(job.chunksize),
                i64::from(job.overlap),
                job.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::Conflict(format!("job {}", job.conv)));
        }
        Ok(())
    }

    pub fn get_job(&self, conv: &str) -> Result<Job, StorageError> {
        self.conn
            .query_row(
                "
                SELECT conv, source_kind, source_path, chunksize, overlap, created_at
                FROM jobs
                WHERE conv = ?1
                ",
                [conv],
                |row| {
                    let kind_raw: String = row.get(1)?;
                    let source_kind = kind_raw.parse::<SourceKind>().map_err(|detail| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            detail.into(),
                        )
                    })?;
                    Ok(Job {
                        conv: row.get(0)?,
                        source_kind,
                        source_path: row.get(2)?,
                        chunksize: row.get::<_, i64>(3)? as u32,
                        overlap: row.get::<_, i64>(4)? as u32,
                        created_at: parse_ts_column(row.get::<_, String>(5)?, 5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("job {conv}")))
    }

    pub fn list_jobs(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT conv FROM jobs ORDER BY conv ASC")?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut convs = Vec::new();
        for row in rows {
            convs.push(row?);
        }
        Ok(convs)
    }

    /// Append a batch of events to one level's table in a single transaction.
    /// Every event must carry the given level's payload and the given conv.
    pub fn append_events(
        &self,
        level: MarkerClass,
        conv: &str,
        batch: &[MarkerEvent],
    ) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        for event in batch {
            if event.class() != level {
                return Err(StorageError::Conflict(format!(
                    "event {} carries a {} payload, expected {level}",
                    event.marker_id,
                    event.class(),
                )));
            }
            if event.conv != conv {
                return Err(StorageError::Conflict(format!(
                    "event {} belongs to conv {}, expected {conv}",
                    event.marker_id, event.conv,
                )));
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(&format!(
                "INSERT INTO {} (conv, ts, idx, marker_id, {}) VALUES (?1, ?2, ?3, ?4, {})",
                table_name(level),
                payload_columns(level),
                payload_placeholders(level),
            ))?;
            for event in batch {
                let ts = event.ts.to_rfc3339();
                match &event.payload {
                    EventPayload::Atomic { text } => {
                        statement.execute(params![
                            event.conv,
                            ts,
                            event.idx,
                            event.marker_id,
                            text
                        ])?;
                    }
                    EventPayload::Semantic { atos } => {
                        statement.execute(params![
                            event.conv,
                            ts,
                            event.idx,
                            event.marker_id,
                            serde_json::to_string(atos)?,
                        ])?;
                    }
                    EventPayload::Cluster { score, window } => {
                        statement.execute(params![
                            event.conv,
                            ts,
                            event.idx,
                            event.marker_id,
                            score,
                            serde_json::to_string(window)?,
                        ])?;
                    }
                    EventPayload::Meta { rationale } => {
                        statement.execute(params![
                            event.conv,
                            ts,
                            event.idx,
                            event.marker_id,
                            rationale
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Events for one level of a conv in emission order `(idx, marker_id)`.
    /// With `last`, only the trailing `n` events are returned, still in
    /// ascending order.
    pub fn query_events(
        &self,
        level: MarkerClass,
        conv: &str,
        last: Option<usize>,
    ) -> Result<Vec<MarkerEvent>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT conv, ts, idx, marker_id, {}
            FROM {}
            WHERE conv = ?1
            ORDER BY idx DESC, marker_id DESC, ts DESC
            LIMIT ?2
            ",
            payload_columns(level),
            table_name(level),
        ))?;

        let limit = last.map(|n| n as i64).unwrap_or(-1);
        let rows = statement.query_map(params![conv, limit], |row| event_from_row(level, row))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        events.reverse();
        Ok(events)
    }

    pub fn count_events(&self, level: MarkerClass, conv: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE conv = ?1", table_name(level)),
            [conv],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove every runtime event and artifact row for a conv in one
    /// transaction. The job row and marker definitions stay.
    pub fn clear_runtime(&self, conv: &str) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        for level in MarkerClass::ALL {
            tx.execute(
                &format!("DELETE FROM {} WHERE conv = ?1", table_name(level)),
                [conv],
            )?;
        }
        tx.execute("DELETE FROM artifacts WHERE conv = ?1", [conv])?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT OR REPLACE INTO artifacts (conv, level, path, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                artifact.conv,
                artifact.level.as_str(),
                artifact.path,
                artifact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_artifacts(&self, conv: &str) -> Result<Vec<ArtifactRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT conv, level, path, created_at
            FROM artifacts
            WHERE conv = ?1
            ORDER BY level ASC, path ASC
            ",
        )?;

        let rows = statement.query_map([conv], |row| {
            let level_raw: String = row.get(1)?;
            let level = level_raw.parse::<MarkerClass>().map_err(|detail| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    detail.into(),
                )
            })?;
            Ok(ArtifactRecord {
                conv: row.get(0)?,
                level,
                path: row.get(2)?,
                created_at: parse_ts_column(row.get::<_, String>(3)?, 3)?,
            })
        })?;

        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?);
        }
        Ok(artifacts)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn table_name(level: MarkerClass) -> &'static str {
    match level {
        MarkerClass::Atomic => "events_atomic",
        MarkerClass::Semantic => "events_semantic",
        MarkerClass::Cluster => "events_cluster",
        MarkerClass::Meta => "events_meta",
    }
}

fn payload_columns(level: MarkerClass) -> &'static str {
    match level {
        MarkerClass::Atomic => "text",
        MarkerClass::Semantic => "atos_json",
        MarkerClass::Cluster => "score, window_json",
        MarkerClass::Meta => "rationale",
    }
}

fn payload_placeholders(level: MarkerClass) -> &'static str {
    match level {
        MarkerClass::Cluster => "?5, ?6",
        _ => "?5",
    }
}

fn event_from_row(level: MarkerClass, row: &rusqlite::Row<'_>) -> rusqlite::Result<MarkerEvent> {
    let payload = match level {
        MarkerClass::Atomic => EventPayload::Atomic { text: row.get(4)? },
        MarkerClass::Semantic => {
            let atos_json: String = row.get(4)?;
            let atos = serde_json::from_str(&atos_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            EventPayload::Semantic { atos }
        }
        MarkerClass::Cluster => {
            let window_json: String = row.get(5)?;
            let window: WindowSnapshot = serde_json::from_str(&window_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            EventPayload::Cluster {
                score: row.get(4)?,
                window,
            }
        }
        MarkerClass::Meta => EventPayload::Meta {
            rationale: row.get(4)?,
        },
    };

    Ok(MarkerEvent {
        conv: row.get(0)?,
        ts: parse_ts_column(row.get::<_, String>(1)?, 1)?,
        idx: row.get(2)?,
        marker_id: row.get(3)?,
        payload,
    })
}

fn marker_meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarkerMeta> {
    let class_raw: String = row.get(1)?;
    let class = class_raw.parse::<MarkerClass>().map_err(|detail| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, detail.into())
    })?;
    Ok(MarkerMeta {
        id: row.get(0)?,
        class,
        source_path: row.get(2)?,
        checksum: row.get(3)?,
        schema_version: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        updated_at: parse_ts_column(row.get::<_, String>(6)?, 6)?,
    })
}

fn parse_ts_column(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0)
            .single()
            .expect("valid timestamp")
            + chrono::Duration::seconds(offset_secs)
    }

    fn sample_meta(id: &str, class: MarkerClass) -> MarkerMeta {
        MarkerMeta {
            id: id.to_string(),
            class,
            source_path: format!("markers/{}/{id}.yml", class.dir_name()),
            checksum: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            schema_version: 1,
            enabled: true,
            updated_at: ts(0),
        }
    }

    fn ato_event(conv: &str, idx: i64, marker_id: &str, text: &str) -> MarkerEvent {
        MarkerEvent {
            conv: conv.to_string(),
            ts: ts(idx),
            idx,
            marker_id: marker_id.to_string(),
            payload: EventPayload::Atomic {
                text: text.to_string(),
            },
        }
    }

    fn sample_job(conv: &str) -> Job {
        Job {
            conv: conv.to_string(),
            source_kind: SourceKind::Text,
            source_path: "sessions/demo.txt".to_string(),
            chunksize: 800,
            overlap: 80,
            created_at: ts(0),
        }
    }

    #[test]
    fn migration_creates_schema() {
        let store = MarkerStore::open_in_memory().expect("open db");
        for table in [
            "markers",
            "jobs",
            "events_atomic",
            "events_semantic",
            "events_cluster",
            "events_meta",
            "artifacts",
        ] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            STORE_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_version_is_refused_as_corrupt() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 99", []).expect("bump");
        }
        let err = MarkerStore::open(file.path()).expect_err("must refuse");
        assert_eq!(err.kind(), "corrupt");
    }

    #[test]
    fn marker_metadata_roundtrips_and_filters() {
        let store = MarkerStore::open_in_memory().expect("open db");
        store
            .register_marker(&sample_meta("ATO_JA_ABER", MarkerClass::Atomic))
            .expect("register ato");
        store
            .register_marker(&sample_meta("SEM_HEDGE", MarkerClass::Semantic))
            .expect("register sem");

        let all = store.list_markers(None, false).expect("list all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "ATO_JA_ABER");

        let atos = store
            .list_markers(Some(MarkerClass::Atomic), false)
            .expect("list atos");
        assert_eq!(atos.len(), 1);
        assert_eq!(atos[0], sample_meta("ATO_JA_ABER", MarkerClass::Atomic));

        store
            .set_marker_enabled("SEM_HEDGE", false)
            .expect("disable");
        let enabled = store.list_markers(None, true).expect("list enabled");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "ATO_JA_ABER");

        let missing = store.set_marker_enabled("SEM_MISSING", false);
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn reregistering_a_marker_updates_in_place() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let mut meta = sample_meta("ATO_JA_ABER", MarkerClass::Atomic);
        store.register_marker(&meta).expect("register");

        meta.checksum = "0000000000000000000000000000000000000000".to_string();
        meta.updated_at = ts(60);
        store.register_marker(&meta).expect("re-register");

        let loaded = store
            .get_marker("ATO_JA_ABER")
            .expect("get")
            .expect("present");
        assert_eq!(loaded, meta);
        assert_eq!(store.list_markers(None, false).expect("list").len(), 1);
    }

    #[test]
    fn job_create_is_once_per_conv() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let job = sample_job("demo");
        store.create_job(&job).expect("create");
        assert_eq!(store.get_job("demo").expect("get"), job);
        assert_eq!(store.list_jobs().expect("list"), vec!["demo".to_string()]);

        let dup = store.create_job(&job);
        assert!(matches!(dup, Err(StorageError::Conflict(_))));

        let missing = store.get_job("absent");
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn events_append_and_query_in_emission_order() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let batch = vec![
            ato_event("demo", 1, "ATO_B", "b"),
            ato_event("demo", 1, "ATO_A", "a"),
            ato_event("demo", 2, "ATO_A", "a"),
        ];
        store
            .append_events(MarkerClass::Atomic, "demo", &batch)
            .expect("append");

        let events = store
            .query_events(MarkerClass::Atomic, "demo", None)
            .expect("query");
        let keys: Vec<(i64, String)> = events
            .iter()
            .map(|event| (event.idx, event.marker_id.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (1, "ATO_A".to_string()),
                (1, "ATO_B".to_string()),
                (2, "ATO_A".to_string()),
            ]
        );
        assert_eq!(
            store.count_events(MarkerClass::Atomic, "demo").expect("count"),
            3
        );

        let tail = store
            .query_events(MarkerClass::Atomic, "demo", Some(2))
            .expect("query last");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].idx, 1);
        assert_eq!(tail[0].marker_id, "ATO_B");
        assert_eq!(tail[1].idx, 2);
    }

    #[test]
    fn stored_events_are_bit_identical_on_read() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let event = MarkerEvent {
            conv: "demo".to_string(),
            ts: ts(4),
            idx: 4,
            marker_id: "CLU_RETREAT".to_string(),
            payload: EventPayload::Cluster {
                score: 2.0,
                window: WindowSnapshot {
                    from_idx: 1,
                    to_idx: 4,
                    contributors: vec!["SEM_X".to_string(), "SEM_Y".to_string()],
                    sum: 2.0,
                },
            },
        };
        store
            .append_events(MarkerClass::Cluster, "demo", &[event.clone()])
            .expect("append");

        let loaded = store
            .query_events(MarkerClass::Cluster, "demo", None)
            .expect("query");
        assert_eq!(loaded, vec![event.clone()]);
        assert_eq!(
            serde_json::to_string(&loaded[0]).expect("serialize"),
            serde_json::to_string(&event).expect("serialize")
        );
    }

    #[test]
    fn append_rejects_level_and_conv_mismatches() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let wrong_level =
            store.append_events(MarkerClass::Semantic, "demo", &[ato_event("demo", 1, "ATO_A", "a")]);
        assert!(matches!(wrong_level, Err(StorageError::Conflict(_))));

        let wrong_conv =
            store.append_events(MarkerClass::Atomic, "demo", &[ato_event("other", 1, "ATO_A", "a")]);
        assert!(matches!(wrong_conv, Err(StorageError::Conflict(_))));

        assert_eq!(
            store.count_events(MarkerClass::Atomic, "demo").expect("count"),
            0
        );
    }

    #[test]
    fn duplicate_event_key_rolls_back_the_whole_batch() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let duplicate = vec![
            ato_event("demo", 1, "ATO_A", "first"),
            ato_event("demo", 2, "ATO_B", "fine"),
            ato_event("demo", 1, "ATO_A", "first"),
        ];
        let err = store.append_events(MarkerClass::Atomic, "demo", &duplicate);
        assert!(matches!(err, Err(StorageError::Conflict(_))));
        assert_eq!(
            store.count_events(MarkerClass::Atomic, "demo").expect("count"),
            0
        );
    }

    #[test]
    fn clear_runtime_wipes_all_levels_and_artifacts() {
        let store = MarkerStore::open_in_memory().expect("open db");
        store
            .append_events(MarkerClass::Atomic, "demo", &[ato_event("demo", 1, "ATO_A", "a")])
            .expect("append ato");
        store
            .append_events(
                MarkerClass::Meta,
                "demo",
                &[MarkerEvent {
                    conv: "demo".to_string(),
                    ts: ts(9),
                    idx: 9,
                    marker_id: "MEMA_SPIRAL".to_string(),
                    payload: EventPayload::Meta {
                        rationale: "rule:any count=3".to_string(),
                    },
                }],
            )
            .expect("append mema");
        store
            .record_artifact(&ArtifactRecord {
                conv: "demo".to_string(),
                level: MarkerClass::Atomic,
                path: "exports/demo/ato.jsonl".to_string(),
                created_at: ts(10),
            })
            .expect("record artifact");
        store
            .append_events(MarkerClass::Atomic, "other", &[ato_event("other", 1, "ATO_A", "a")])
            .expect("append other conv");

        store.clear_runtime("demo").expect("clear");

        for level in MarkerClass::ALL {
            assert_eq!(store.count_events(level, "demo").expect("count"), 0);
        }
        assert!(store.list_artifacts("demo").expect("artifacts").is_empty());
        assert_eq!(
            store.count_events(MarkerClass::Atomic, "other").expect("count"),
            1
        );
    }

    #[test]
    fn artifacts_roundtrip() {
        let store = MarkerStore::open_in_memory().expect("open db");
        let artifact = ArtifactRecord {
            conv: "demo".to_string(),
            level: MarkerClass::Semantic,
            path: "exports/demo/sem.jsonl".to_string(),
            created_at: ts(0),
        };
        store.record_artifact(&artifact).expect("record");
        store.record_artifact(&artifact).expect("re-record is idempotent");

        let listed = store.list_artifacts("demo").expect("list");
        assert_eq!(listed, vec![artifact]);
    }
}
