use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use identity_ledger_core::{
    CandidatePreview, CandidateRecord, ConfidenceLevel, DecidedBy, JobStatus, MatchInput,
    MatchingConfig, NormalizedAttributes, OriginConflict, OriginLinkView, PersonId, RawAttributes,
    ReasonCode, ResolutionStatus, RunId, RunStatus, SourceKey, UnmatchedStatus,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::debug;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS persons (
  person_id TEXT PRIMARY KEY,
  confidence_level TEXT NOT NULL CHECK (confidence_level IN ('high','medium','low')),
  best_phone TEXT,
  best_license TEXT,
  best_plate TEXT,
  best_name TEXT,
  partition_key TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_table TEXT NOT NULL,
  source_pk TEXT NOT NULL,
  person_id TEXT NOT NULL,
  match_rule TEXT NOT NULL,
  match_score REAL NOT NULL,
  confidence_level TEXT NOT NULL CHECK (confidence_level IN ('high','medium','low')),
  evidence_json TEXT NOT NULL,
  snapshot_date TEXT NOT NULL,
  linked_at TEXT NOT NULL,
  run_id TEXT,
  UNIQUE (source_table, source_pk),
  FOREIGN KEY (person_id) REFERENCES persons(person_id)
);

CREATE TABLE IF NOT EXISTS identity_unmatched (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_table TEXT NOT NULL,
  source_pk TEXT NOT NULL,
  reason_code TEXT NOT NULL CHECK (reason_code IN ('no_candidates','ambiguous_candidates','missing_required_attributes','malformed_input')),
  details TEXT NOT NULL,
  candidates_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open','resolved','ignored')),
  run_id TEXT,
  first_seen_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL,
  UNIQUE (source_table, source_pk)
);

CREATE TABLE IF NOT EXISTS identity_origin (
  person_id TEXT PRIMARY KEY,
  origin_tag TEXT NOT NULL,
  origin_source_table TEXT NOT NULL,
  origin_source_pk TEXT NOT NULL,
  origin_confidence TEXT NOT NULL CHECK (origin_confidence IN ('high','medium','low')),
  decided_by TEXT NOT NULL CHECK (decided_by IN ('system','manual')),
  resolution_status TEXT NOT NULL CHECK (resolution_status IN ('pending_review','resolved_auto','resolved_manual','marked_legacy','discarded')),
  evidence_json TEXT NOT NULL,
  ruleset_version TEXT NOT NULL,
  decided_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (person_id) REFERENCES persons(person_id)
);

CREATE TABLE IF NOT EXISTS identity_origin_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  person_id TEXT NOT NULL,
  old_origin_tag TEXT,
  new_origin_tag TEXT NOT NULL,
  old_status TEXT,
  new_status TEXT NOT NULL,
  origin_source_table TEXT NOT NULL,
  origin_source_pk TEXT NOT NULL,
  origin_confidence TEXT NOT NULL,
  ruleset_version TEXT NOT NULL,
  decided_by TEXT NOT NULL,
  reason TEXT NOT NULL,
  changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_matching_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_table TEXT NOT NULL,
  source_pk TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','matched','failed')),
  attempt_count INTEGER NOT NULL DEFAULT 0,
  last_attempt_at TEXT,
  matched_person_id TEXT,
  fail_reason TEXT,
  enqueued_at TEXT NOT NULL,
  UNIQUE (source_table, source_pk)
);

CREATE TABLE IF NOT EXISTS origin_alerts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  person_id TEXT NOT NULL UNIQUE,
  detail_json TEXT NOT NULL,
  first_detected_at TEXT NOT NULL,
  last_detected_at TEXT NOT NULL,
  muted_until TEXT,
  resolved_at TEXT,
  resolution_note TEXT
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  scope_from TEXT NOT NULL,
  scope_to TEXT NOT NULL,
  incremental INTEGER NOT NULL,
  source_tables_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  stats_json TEXT,
  error TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT
);

CREATE TABLE IF NOT EXISTS source_records (
  source_table TEXT NOT NULL,
  source_pk TEXT NOT NULL,
  record_date TEXT NOT NULL,
  raw_phone TEXT,
  raw_license TEXT,
  raw_plate TEXT,
  raw_name TEXT,
  partition_key TEXT,
  ingested_at TEXT NOT NULL,
  PRIMARY KEY (source_table, source_pk)
);

CREATE TABLE IF NOT EXISTS source_index (
  source_table TEXT NOT NULL,
  source_pk TEXT NOT NULL,
  record_date TEXT NOT NULL,
  partition_key TEXT,
  phone TEXT,
  phone_suffix TEXT,
  license TEXT,
  plate TEXT,
  name TEXT,
  refreshed_at TEXT NOT NULL,
  PRIMARY KEY (source_table, source_pk)
);

CREATE INDEX IF NOT EXISTS idx_identity_links_person ON identity_links(person_id);
CREATE INDEX IF NOT EXISTS idx_identity_unmatched_status ON identity_unmatched(status);
CREATE INDEX IF NOT EXISTS idx_matching_jobs_status ON identity_matching_jobs(status, enqueued_at);
CREATE INDEX IF NOT EXISTS idx_source_index_phone ON source_index(phone);
CREATE INDEX IF NOT EXISTS idx_source_index_phone_suffix ON source_index(phone_suffix);
CREATE INDEX IF NOT EXISTS idx_source_index_license ON source_index(license);
CREATE INDEX IF NOT EXISTS idx_source_index_plate ON source_index(plate);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE TRIGGER IF NOT EXISTS identity_origin_forbid_delete
BEFORE DELETE ON identity_origin
BEGIN
  SELECT RAISE(ABORT, 'identity_origin is append-only: DELETE is forbidden');
END;

CREATE TRIGGER IF NOT EXISTS identity_origin_history_forbid_delete
BEFORE DELETE ON identity_origin_history
BEGIN
  SELECT RAISE(ABORT, 'identity_origin_history is append-only: DELETE is forbidden');
END;

CREATE TRIGGER IF NOT EXISTS identity_origin_history_forbid_update
BEFORE UPDATE ON identity_origin_history
BEGIN
  SELECT RAISE(ABORT, 'identity_origin_history is append-only: UPDATE is forbidden');
END;
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// One raw operational row as staged by the (external) ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StagedRecord {
    pub key: SourceKey,
    pub record_date: String,
    pub attributes: RawAttributes,
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub refreshed: usize,
    pub malformed: Vec<(SourceKey, String)>,
}

/// A source-index row in run scope, with the flags the run loop needs to
/// classify it without further lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRecord {
    pub input: MatchInput,
    pub linked: bool,
    pub ignored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRow {
    pub key: SourceKey,
    pub person_id: PersonId,
    pub match_rule: String,
    pub match_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub evidence: Vec<String>,
    pub snapshot_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub linked_at: OffsetDateTime,
    pub run_id: Option<RunId>,
}

/// Write request for one link decided by the rule engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub key: SourceKey,
    pub person_id: PersonId,
    pub match_rule: String,
    pub match_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub evidence: Vec<String>,
    pub snapshot_date: Date,
    pub attributes: NormalizedAttributes,
    pub partition: Option<String>,
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonRow {
    pub person_id: PersonId,
    pub confidence_level: ConfidenceLevel,
    pub best_phone: Option<String>,
    pub best_license: Option<String>,
    pub best_plate: Option<String>,
    pub best_name: Option<String>,
    pub partition: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnmatchedRow {
    pub key: SourceKey,
    pub reason_code: ReasonCode,
    pub details: String,
    pub candidates: Vec<CandidatePreview>,
    pub status: UnmatchedStatus,
    pub run_id: Option<RunId>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRow {
    pub key: SourceKey,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub matched_person_id: Option<PersonId>,
    pub fail_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRow {
    pub run_id: RunId,
    pub scope_from: Date,
    pub scope_to: Date,
    pub incremental: bool,
    pub source_tables: Vec<String>,
    pub status: RunStatus,
    pub stats_json: Option<String>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginRow {
    pub person_id: PersonId,
    pub origin_tag: String,
    pub source: SourceKey,
    pub confidence: ConfidenceLevel,
    pub decided_by: DecidedBy,
    pub resolution_status: ResolutionStatus,
    pub evidence: Vec<String>,
    pub ruleset_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginHistoryRow {
    pub id: i64,
    pub person_id: PersonId,
    pub old_origin_tag: Option<String>,
    pub new_origin_tag: String,
    pub old_status: Option<ResolutionStatus>,
    pub new_status: ResolutionStatus,
    pub source: SourceKey,
    pub confidence: ConfidenceLevel,
    pub ruleset_version: String,
    pub decided_by: DecidedBy,
    pub reason: String,
    pub changed_at: String,
}

/// Write request for one origin decision (system or manual).
#[derive(Debug, Clone, PartialEq)]
pub struct OriginWrite {
    pub person_id: PersonId,
    pub origin_tag: String,
    pub source: SourceKey,
    pub confidence: ConfidenceLevel,
    pub decided_by: DecidedBy,
    pub resolution_status: ResolutionStatus,
    pub evidence: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OriginChange {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertRow {
    pub person_id: PersonId,
    pub detail: OriginConflict,
    #[serde(with = "time::serde::rfc3339")]
    pub first_detected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_detected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub muted_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution_note: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed identity store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Stage one raw operational row. Re-staging the same key replaces the
    /// previous raw values — the staging table mirrors the source of truth.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn stage_source_record(&mut self, record: &StagedRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO source_records(
                    source_table, source_pk, record_date,
                    raw_phone, raw_license, raw_plate, raw_name,
                    partition_key, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(source_table, source_pk) DO UPDATE SET
                    record_date = excluded.record_date,
                    raw_phone = excluded.raw_phone,
                    raw_license = excluded.raw_license,
                    raw_plate = excluded.raw_plate,
                    raw_name = excluded.raw_name,
                    partition_key = excluded.partition_key,
                    ingested_at = excluded.ingested_at",
                params![
                    record.key.source_table,
                    record.key.source_pk,
                    record.record_date,
                    record.attributes.phone,
                    record.attributes.license,
                    record.attributes.plate,
                    record.attributes.name,
                    record.partition,
                    now_rfc3339()?,
                ],
            )
            .context("failed to stage source record")?;
        Ok(())
    }

    /// Rebuild the denormalized source index for the given tables. Idempotent
    /// upsert: calling it again with unchanged staging data changes nothing.
    /// Rows whose record date does not parse are reported, not indexed.
    ///
    /// # Errors
    /// Returns an error when reads or index writes fail.
    pub fn refresh_source_index(
        &mut self,
        config: &MatchingConfig,
        tables: &[String],
    ) -> Result<RefreshOutcome> {
        let staged = self.staged_records(tables)?;
        let now = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start index refresh transaction")?;
        let mut refreshed = 0_usize;
        let mut malformed = Vec::new();

        for record in staged {
            let Ok(record_date) = parse_date(&record.record_date) else {
                malformed.push((
                    record.key.clone(),
                    format!("unparseable record date: {}", record.record_date),
                ));
                continue;
            };
            let attributes = NormalizedAttributes::from_raw(&record.attributes, config);
            let suffix = attributes
                .phone
                .as_deref()
                .map(|phone| {
                    identity_ledger_core::phone_suffix(phone, config.phone_suffix_len).to_string()
                });

            tx.execute(
                "INSERT INTO source_index(
                    source_table, source_pk, record_date, partition_key,
                    phone, phone_suffix, license, plate, name, refreshed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(source_table, source_pk) DO UPDATE SET
                    record_date = excluded.record_date,
                    partition_key = excluded.partition_key,
                    phone = excluded.phone,
                    phone_suffix = excluded.phone_suffix,
                    license = excluded.license,
                    plate = excluded.plate,
                    name = excluded.name,
                    refreshed_at = excluded.refreshed_at",
                params![
                    record.key.source_table,
                    record.key.source_pk,
                    format_date(record_date)?,
                    record.partition,
                    attributes.phone,
                    suffix,
                    attributes.license,
                    attributes.plate,
                    attributes.name,
                    now,
                ],
            )
            .context("failed to upsert source index row")?;
            refreshed += 1;
        }

        tx.commit().context("failed to commit index refresh")?;
        debug!(refreshed, malformed = malformed.len(), "source index refreshed");
        Ok(RefreshOutcome { refreshed, malformed })
    }

    fn staged_records(&self, tables: &[String]) -> Result<Vec<StagedRecord>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(tables.len());
        let sql = format!(
            "SELECT source_table, source_pk, record_date,
                    raw_phone, raw_license, raw_plate, raw_name, partition_key
             FROM source_records
             WHERE source_table IN ({placeholders})
             ORDER BY source_table ASC, source_pk ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(tables.iter()), |row| {
            Ok(StagedRecord {
                key: SourceKey {
                    source_table: row.get(0)?,
                    source_pk: row.get(1)?,
                },
                record_date: row.get(2)?,
                attributes: RawAttributes {
                    phone: row.get(3)?,
                    license: row.get(4)?,
                    plate: row.get(5)?,
                    name: row.get(6)?,
                },
                partition: row.get(7)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Load the candidate snapshot: every linked source row with its
    /// normalized attributes. The cascade only ever matches against rows
    /// that already belong to a person.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_candidate_snapshot(&self) -> Result<Vec<CandidateRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.person_id, si.source_table, si.source_pk, si.record_date,
                    si.partition_key, si.phone, si.license, si.plate, si.name
             FROM identity_links l
             JOIN source_index si
               ON si.source_table = l.source_table AND si.source_pk = l.source_pk
             ORDER BY si.source_table ASC, si.source_pk ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let person_raw: String = row.get(0)?;
            let record_date_raw: String = row.get(3)?;
            records.push(CandidateRecord {
                person_id: parse_person_id(&person_raw)?,
                key: SourceKey {
                    source_table: row.get(1)?,
                    source_pk: row.get(2)?,
                },
                record_date: parse_date(&record_date_raw)?,
                partition: row.get(4)?,
                attributes: NormalizedAttributes {
                    phone: row.get(5)?,
                    license: row.get(6)?,
                    plate: row.get(7)?,
                    name: row.get(8)?,
                },
            });
        }
        Ok(records)
    }

    /// Load indexed rows for the given tables and date scope, flagged with
    /// the link/ignore state the run loop partitions on.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn scope_records(
        &self,
        tables: &[String],
        scope_from: Date,
        scope_to: Date,
    ) -> Result<Vec<ScopeRecord>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(tables.len());
        let sql = format!(
            "SELECT si.source_table, si.source_pk, si.record_date, si.partition_key,
                    si.phone, si.license, si.plate, si.name,
                    EXISTS(
                      SELECT 1 FROM identity_links l
                      WHERE l.source_table = si.source_table AND l.source_pk = si.source_pk
                    ),
                    EXISTS(
                      SELECT 1 FROM identity_unmatched u
                      WHERE u.source_table = si.source_table AND u.source_pk = si.source_pk
                        AND u.status = 'ignored'
                    )
             FROM source_index si
             WHERE si.source_table IN ({placeholders})
               AND si.record_date >= ? AND si.record_date <= ?
             ORDER BY si.source_table ASC, si.source_pk ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut values: Vec<String> = tables.to_vec();
        values.push(format_date(scope_from)?);
        values.push(format_date(scope_to)?);

        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let record_date_raw: String = row.get(2)?;
            records.push(ScopeRecord {
                input: MatchInput {
                    key: SourceKey {
                        source_table: row.get(0)?,
                        source_pk: row.get(1)?,
                    },
                    record_date: parse_date(&record_date_raw)?,
                    partition: row.get(3)?,
                    attributes: NormalizedAttributes {
                        phone: row.get(4)?,
                        license: row.get(5)?,
                        plate: row.get(6)?,
                        name: row.get(7)?,
                    },
                },
                linked: row.get::<_, i64>(8)? == 1,
                ignored: row.get::<_, i64>(9)? == 1,
            });
        }
        Ok(records)
    }

    /// Load the match input for a single indexed row, if present.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn match_input(&self, key: &SourceKey) -> Result<Option<MatchInput>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_date, partition_key, phone, license, plate, name
             FROM source_index
             WHERE source_table = ?1 AND source_pk = ?2",
        )?;
        let value = stmt
            .query_row(params![key.source_table, key.source_pk], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .optional()?;

        match value {
            Some((record_date_raw, partition, phone, license, plate, name)) => Ok(Some(MatchInput {
                key: key.clone(),
                record_date: parse_date(&record_date_raw)?,
                partition,
                attributes: NormalizedAttributes { phone, license, plate, name },
            })),
            None => Ok(None),
        }
    }

    /// Persist one attach decision. Returns `false` when a link for this
    /// source row already exists — the benign idempotent-conflict case; the
    /// existing link is never modified.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn attach_link(&mut self, request: &LinkRequest) -> Result<bool> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start link transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO identity_links(
                    source_table, source_pk, person_id, match_rule, match_score,
                    confidence_level, evidence_json, snapshot_date, linked_at, run_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(source_table, source_pk) DO NOTHING",
                params![
                    request.key.source_table,
                    request.key.source_pk,
                    request.person_id.to_string(),
                    request.match_rule,
                    request.match_score,
                    request.confidence_level.as_str(),
                    serde_json::to_string(&request.evidence)
                        .context("failed to serialize link evidence")?,
                    format_date(request.snapshot_date)?,
                    now,
                    request.run_id.map(|run_id| run_id.to_string()),
                ],
            )
            .context("failed to insert identity link")?;

        if inserted == 0 {
            tx.commit().context("failed to commit no-op link transaction")?;
            debug!(key = %request.key, "duplicate link attempt ignored");
            return Ok(false);
        }

        Self::absorb_link_into_person(&tx, request, &now)?;
        Self::settle_resolved_record(&tx, &request.key, request.person_id, &now)?;

        tx.commit().context("failed to commit link transaction")?;
        Ok(true)
    }

    /// Mint a brand-new person and link the originating record to it in one
    /// transaction. Returns the minted id, or the already-linked person when
    /// a concurrent writer got there first.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn mint_person(&mut self, request: &LinkRequest) -> Result<PersonId> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start mint transaction")?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT person_id FROM identity_links WHERE source_table = ?1 AND source_pk = ?2",
                params![request.key.source_table, request.key.source_pk],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(person_raw) = existing {
            tx.commit().context("failed to commit no-op mint transaction")?;
            debug!(key = %request.key, "duplicate mint attempt ignored");
            return parse_person_id(&person_raw);
        }

        tx.execute(
            "INSERT INTO persons(
                person_id, confidence_level, best_phone, best_license, best_plate,
                best_name, partition_key, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.person_id.to_string(),
                request.confidence_level.as_str(),
                request.attributes.phone,
                request.attributes.license,
                request.attributes.plate,
                request.attributes.name,
                request.partition,
                now,
                now,
            ],
        )
        .context("failed to insert minted person")?;

        tx.execute(
            "INSERT INTO identity_links(
                source_table, source_pk, person_id, match_rule, match_score,
                confidence_level, evidence_json, snapshot_date, linked_at, run_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.key.source_table,
                request.key.source_pk,
                request.person_id.to_string(),
                request.match_rule,
                request.match_score,
                request.confidence_level.as_str(),
                serde_json::to_string(&request.evidence)
                    .context("failed to serialize link evidence")?,
                format_date(request.snapshot_date)?,
                now,
                request.run_id.map(|run_id| run_id.to_string()),
            ],
        )
        .context("failed to insert minting link")?;

        Self::settle_resolved_record(&tx, &request.key, request.person_id, &now)?;

        tx.commit().context("failed to commit mint transaction")?;
        Ok(request.person_id)
    }

    /// Fold a newly attached link into the person row: confidence may only
    /// rise, and absent best attributes get filled from the link.
    fn absorb_link_into_person(
        tx: &rusqlite::Transaction<'_>,
        request: &LinkRequest,
        now: &str,
    ) -> Result<()> {
        let current: Option<String> = tx
            .query_row(
                "SELECT confidence_level FROM persons WHERE person_id = ?1",
                params![request.person_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current_raw) = current else {
            return Err(anyhow!("link references unknown person {}", request.person_id));
        };
        let current_level = ConfidenceLevel::parse(&current_raw)
            .ok_or_else(|| anyhow!("unknown confidence_level: {current_raw}"))?;

        let level = if request.confidence_level.rank() > current_level.rank() {
            request.confidence_level
        } else {
            current_level
        };

        tx.execute(
            "UPDATE persons SET
                confidence_level = ?2,
                best_phone = COALESCE(best_phone, ?3),
                best_license = COALESCE(best_license, ?4),
                best_plate = COALESCE(best_plate, ?5),
                best_name = COALESCE(best_name, ?6),
                partition_key = COALESCE(partition_key, ?7),
                updated_at = ?8
             WHERE person_id = ?1",
            params![
                request.person_id.to_string(),
                level.as_str(),
                request.attributes.phone,
                request.attributes.license,
                request.attributes.plate,
                request.attributes.name,
                request.partition,
                now,
            ],
        )
        .context("failed to absorb link into person")?;
        Ok(())
    }

    /// When a record finally links, its quarantine row (if any) flips to
    /// resolved and its pending retry job (if any) is marked matched.
    fn settle_resolved_record(
        tx: &rusqlite::Transaction<'_>,
        key: &SourceKey,
        person_id: PersonId,
        now: &str,
    ) -> Result<()> {
        tx.execute(
            "UPDATE identity_unmatched SET status = 'resolved', last_seen_at = ?3
             WHERE source_table = ?1 AND source_pk = ?2 AND status = 'open'",
            params![key.source_table, key.source_pk, now],
        )
        .context("failed to resolve unmatched row")?;

        tx.execute(
            "UPDATE identity_matching_jobs
             SET status = 'matched', matched_person_id = ?3, last_attempt_at = ?4, fail_reason = NULL
             WHERE source_table = ?1 AND source_pk = ?2 AND status = 'pending'",
            params![key.source_table, key.source_pk, person_id.to_string(), now],
        )
        .context("failed to mark matching job matched")?;
        Ok(())
    }

    /// Record (or refresh) the quarantine row for one unresolved record.
    /// `ignored` and `resolved` rows keep their status; open rows get the
    /// newest reason and preview.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_unmatched(
        &mut self,
        key: &SourceKey,
        reason: ReasonCode,
        details: &str,
        candidates: &[CandidatePreview],
        run_id: Option<RunId>,
    ) -> Result<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO identity_unmatched(
                    source_table, source_pk, reason_code, details, candidates_json,
                    status, run_id, first_seen_at, last_seen_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?7)
                ON CONFLICT(source_table, source_pk) DO UPDATE SET
                    reason_code = excluded.reason_code,
                    details = excluded.details,
                    candidates_json = excluded.candidates_json,
                    run_id = excluded.run_id,
                    last_seen_at = excluded.last_seen_at
                WHERE identity_unmatched.status = 'open'",
                params![
                    key.source_table,
                    key.source_pk,
                    reason.as_str(),
                    details,
                    serde_json::to_string(candidates)
                        .context("failed to serialize candidate preview")?,
                    run_id.map(|id| id.to_string()),
                    now,
                ],
            )
            .context("failed to upsert unmatched row")?;
        Ok(())
    }

    /// Dismiss one quarantined record as noise. Returns `false` when no open
    /// quarantine row exists for the key.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn ignore_unmatched(&mut self, key: &SourceKey) -> Result<bool> {
        let now = now_rfc3339()?;
        let updated = self
            .conn
            .execute(
                "UPDATE identity_unmatched SET status = 'ignored', last_seen_at = ?3
                 WHERE source_table = ?1 AND source_pk = ?2 AND status = 'open'",
                params![key.source_table, key.source_pk, now],
            )
            .context("failed to ignore unmatched row")?;
        Ok(updated > 0)
    }

    /// List quarantine rows, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_unmatched(&self, status: Option<UnmatchedStatus>) -> Result<Vec<UnmatchedRow>> {
        let sql = match status {
            Some(_) => {
                "SELECT source_table, source_pk, reason_code, details, candidates_json,
                        status, run_id, first_seen_at, last_seen_at
                 FROM identity_unmatched WHERE status = ?1
                 ORDER BY source_table ASC, source_pk ASC"
            }
            None => {
                "SELECT source_table, source_pk, reason_code, details, candidates_json,
                        status, run_id, first_seen_at, last_seen_at
                 FROM identity_unmatched
                 ORDER BY source_table ASC, source_pk ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = match status {
            Some(value) => stmt.query(params![value.as_str()])?,
            None => stmt.query([])?,
        };

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            result.push(unmatched_from_row(row)?);
        }
        Ok(result)
    }

    /// Fetch the quarantine row for one source record, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn unmatched_for(&self, key: &SourceKey) -> Result<Option<UnmatchedRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_table, source_pk, reason_code, details, candidates_json,
                    status, run_id, first_seen_at, last_seen_at
             FROM identity_unmatched WHERE source_table = ?1 AND source_pk = ?2",
        )?;
        let mut rows = stmt.query(params![key.source_table, key.source_pk])?;
        match rows.next()? {
            Some(row) => Ok(Some(unmatched_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Enqueue one record for retry. Re-enqueuing is a no-op whatever state
    /// the job is in; a matched job is never reopened. Returns whether a new
    /// job row was created.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn enqueue_job(&mut self, key: &SourceKey) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO identity_matching_jobs(
                    source_table, source_pk, status, attempt_count, enqueued_at
                ) VALUES (?1, ?2, 'pending', 0, ?3)
                ON CONFLICT(source_table, source_pk) DO NOTHING",
                params![key.source_table, key.source_pk, now_rfc3339()?],
            )
            .context("failed to enqueue matching job")?;
        Ok(inserted > 0)
    }

    /// Pull pending jobs oldest-first for one recovery batch.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_table, source_pk, status, attempt_count, last_attempt_at,
                    matched_person_id, fail_reason, enqueued_at
             FROM identity_matching_jobs
             WHERE status = 'pending'
             ORDER BY enqueued_at ASC, id ASC
             LIMIT ?1",
        )?;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![limit_i64])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// List jobs, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRow>> {
        let sql = match status {
            Some(_) => {
                "SELECT source_table, source_pk, status, attempt_count, last_attempt_at,
                        matched_person_id, fail_reason, enqueued_at
                 FROM identity_matching_jobs WHERE status = ?1
                 ORDER BY enqueued_at ASC, id ASC"
            }
            None => {
                "SELECT source_table, source_pk, status, attempt_count, last_attempt_at,
                        matched_person_id, fail_reason, enqueued_at
                 FROM identity_matching_jobs
                 ORDER BY enqueued_at ASC, id ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = match status {
            Some(value) => stmt.query(params![value.as_str()])?,
            None => stmt.query([])?,
        };
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// Record one inconclusive re-attempt for a pending job. The attempt
    /// count strictly increases; the job flips to failed only when the count
    /// reaches `max_attempts`. Returns the job status after the write.
    ///
    /// # Errors
    /// Returns an error when the job does not exist or the write fails.
    pub fn record_job_attempt(
        &mut self,
        key: &SourceKey,
        fail_reason: &str,
        max_attempts: u32,
    ) -> Result<JobStatus> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start job attempt transaction")?;

        let attempt_count: Option<i64> = tx
            .query_row(
                "SELECT attempt_count FROM identity_matching_jobs
                 WHERE source_table = ?1 AND source_pk = ?2 AND status = 'pending'",
                params![key.source_table, key.source_pk],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempt_count) = attempt_count else {
            return Err(anyhow!("no pending matching job for {key}"));
        };

        let next_count = attempt_count + 1;
        let status = if next_count >= i64::from(max_attempts) {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };

        tx.execute(
            "UPDATE identity_matching_jobs
             SET attempt_count = ?3, last_attempt_at = ?4, fail_reason = ?5, status = ?6
             WHERE source_table = ?1 AND source_pk = ?2",
            params![
                key.source_table,
                key.source_pk,
                next_count,
                now,
                fail_reason,
                status.as_str(),
            ],
        )
        .context("failed to record job attempt")?;

        tx.commit().context("failed to commit job attempt")?;
        Ok(status)
    }

    /// Start a run after verifying no RUNNING run overlaps these source
    /// tables. The check is durable state, so it holds across process
    /// restarts and crashed runs stay visible until abandoned.
    ///
    /// # Errors
    /// Returns an error when an overlapping run is active or writes fail.
    pub fn begin_run(
        &mut self,
        scope_from: Date,
        scope_to: Date,
        tables: &[String],
        incremental: bool,
    ) -> Result<RunId> {
        let tx = self.conn.transaction().context("failed to start run transaction")?;

        {
            let mut stmt = tx.prepare(
                "SELECT run_id, source_tables_json FROM runs WHERE status = 'running'",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let run_raw: String = row.get(0)?;
                let tables_json: String = row.get(1)?;
                let running_tables: Vec<String> = serde_json::from_str(&tables_json)
                    .context("failed to deserialize running run tables")?;
                if running_tables.iter().any(|table| tables.contains(table)) {
                    return Err(anyhow!(
                        "run {run_raw} is still RUNNING over an overlapping source scope; \
                         abandon it or wait for completion"
                    ));
                }
            }
        }

        let run_id = RunId::new();
        tx.execute(
            "INSERT INTO runs(
                run_id, scope_from, scope_to, incremental, source_tables_json,
                status, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
            params![
                run_id.to_string(),
                format_date(scope_from)?,
                format_date(scope_to)?,
                i64::from(incremental),
                serde_json::to_string(tables).context("failed to serialize run tables")?,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert run row")?;

        tx.commit().context("failed to commit run start")?;
        Ok(run_id)
    }

    /// Finish a run with its terminal status and stats payload.
    ///
    /// # Errors
    /// Returns an error when the run does not exist or the write fails.
    pub fn finish_run(
        &mut self,
        run_id: RunId,
        status: RunStatus,
        stats_json: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET status = ?2, stats_json = ?3, error = ?4, finished_at = ?5
                 WHERE run_id = ?1",
                params![run_id.to_string(), status.as_str(), stats_json, error, now_rfc3339()?],
            )
            .context("failed to finish run")?;
        if updated == 0 {
            return Err(anyhow!("run not found: {run_id}"));
        }
        Ok(())
    }

    /// Mark a crashed run FAILED so its scope becomes runnable again.
    /// Returns `false` when the run is not in RUNNING state.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn abandon_run(&mut self, run_id: RunId, error: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET status = 'failed', error = ?2, finished_at = ?3
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.to_string(), error, now_rfc3339()?],
            )
            .context("failed to abandon run")?;
        Ok(updated > 0)
    }

    /// Fetch one run row.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, scope_from, scope_to, incremental, source_tables_json,
                    status, stats_json, error, started_at, finished_at
             FROM runs WHERE run_id = ?1",
        )?;
        let value = stmt
            .query_row(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .optional()?;

        let Some((
            run_raw,
            from_raw,
            to_raw,
            incremental,
            tables_json,
            status_raw,
            stats_json,
            error,
            started_raw,
            finished_raw,
        )) = value
        else {
            return Ok(None);
        };

        Ok(Some(RunRow {
            run_id: parse_run_id(&run_raw)?,
            scope_from: parse_date(&from_raw)?,
            scope_to: parse_date(&to_raw)?,
            incremental: incremental == 1,
            source_tables: serde_json::from_str(&tables_json)
                .context("failed to deserialize run tables")?,
            status: RunStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("unknown run status: {status_raw}"))?,
            stats_json,
            error,
            started_at: parse_rfc3339(&started_raw)?,
            finished_at: finished_raw.as_deref().map(parse_rfc3339).transpose()?,
        }))
    }

    /// The incremental floor for a table set: the latest completed scope_to
    /// shared by every table, or `None` when any table has no completed run.
    ///
    /// # Errors
    /// Returns an error when run rows cannot be read or decoded.
    pub fn incremental_floor(&self, tables: &[String]) -> Result<Option<Date>> {
        let mut stmt = self.conn.prepare(
            "SELECT scope_to, source_tables_json FROM runs WHERE status = 'completed'",
        )?;
        let mut rows = stmt.query([])?;
        let mut per_table: std::collections::BTreeMap<&str, Option<Date>> =
            tables.iter().map(|table| (table.as_str(), None)).collect();
        while let Some(row) = rows.next()? {
            let scope_to_raw: String = row.get(0)?;
            let tables_json: String = row.get(1)?;
            let run_tables: Vec<String> = serde_json::from_str(&tables_json)
                .context("failed to deserialize run tables")?;
            let scope_to = parse_date(&scope_to_raw)?;
            for table in &run_tables {
                if let Some(entry) = per_table.get_mut(table.as_str()) {
                    let newer = match entry {
                        Some(existing) => scope_to > *existing,
                        None => true,
                    };
                    if newer {
                        *entry = Some(scope_to);
                    }
                }
            }
        }

        let mut floor: Option<Date> = None;
        for value in per_table.values() {
            let Some(date) = value else {
                return Ok(None);
            };
            let lower = match floor {
                Some(existing) => *date < existing,
                None => true,
            };
            if lower {
                floor = Some(*date);
            }
        }
        Ok(floor)
    }

    /// Fetch one person row.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn person(&self, person_id: PersonId) -> Result<Option<PersonRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, confidence_level, best_phone, best_license, best_plate,
                    best_name, partition_key, created_at, updated_at
             FROM persons WHERE person_id = ?1",
        )?;
        let value = stmt
            .query_row(params![person_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .optional()?;

        let Some((
            person_raw,
            confidence_raw,
            best_phone,
            best_license,
            best_plate,
            best_name,
            partition,
            created_raw,
            updated_raw,
        )) = value
        else {
            return Ok(None);
        };

        Ok(Some(PersonRow {
            person_id: parse_person_id(&person_raw)?,
            confidence_level: ConfidenceLevel::parse(&confidence_raw)
                .ok_or_else(|| anyhow!("unknown confidence_level: {confidence_raw}"))?,
            best_phone,
            best_license,
            best_plate,
            best_name,
            partition,
            created_at: parse_rfc3339(&created_raw)?,
            updated_at: parse_rfc3339(&updated_raw)?,
        }))
    }

    /// Fetch the link for one source row, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn link_for(&self, key: &SourceKey) -> Result<Option<LinkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_table, source_pk, person_id, match_rule, match_score,
                    confidence_level, evidence_json, snapshot_date, linked_at, run_id
             FROM identity_links WHERE source_table = ?1 AND source_pk = ?2",
        )?;
        let mut rows = stmt.query(params![key.source_table, key.source_pk])?;
        match rows.next()? {
            Some(row) => Ok(Some(link_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All links of one person, in stable source order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn person_links(&self, person_id: PersonId) -> Result<Vec<LinkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_table, source_pk, person_id, match_rule, match_score,
                    confidence_level, evidence_json, snapshot_date, linked_at, run_id
             FROM identity_links WHERE person_id = ?1
             ORDER BY source_table ASC, source_pk ASC",
        )?;
        let mut rows = stmt.query(params![person_id.to_string()])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push(link_from_row(row)?);
        }
        Ok(links)
    }

    /// The origin resolver's view of one person's links.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn origin_link_views(&self, person_id: PersonId) -> Result<Vec<OriginLinkView>> {
        let links = self.person_links(person_id)?;
        Ok(links
            .into_iter()
            .map(|link| OriginLinkView {
                key: link.key,
                snapshot_date: link.snapshot_date,
                confidence: link.confidence_level,
            })
            .collect())
    }

    /// Fetch the current origin row for one person.
    ///
    /// # Errors
    /// Returns an error when the lookup or decode fails.
    pub fn get_origin(&self, person_id: PersonId) -> Result<Option<OriginRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, origin_tag, origin_source_table, origin_source_pk,
                    origin_confidence, decided_by, resolution_status, evidence_json,
                    ruleset_version, decided_at, updated_at
             FROM identity_origin WHERE person_id = ?1",
        )?;
        let mut rows = stmt.query(params![person_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(origin_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Write one origin decision, appending exactly one history row for any
    /// actual change in the same transaction. Writes that change nothing are
    /// skipped without history. Status changes must be legal under the state
    /// machine for the given decider.
    ///
    /// # Errors
    /// Returns an error when the transition is forbidden or writes fail.
    pub fn write_origin(&mut self, write: &OriginWrite) -> Result<OriginChange> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start origin transaction")?;

        let existing = {
            let mut stmt = tx.prepare(
                "SELECT person_id, origin_tag, origin_source_table, origin_source_pk,
                        origin_confidence, decided_by, resolution_status, evidence_json,
                        ruleset_version, decided_at, updated_at
                 FROM identity_origin WHERE person_id = ?1",
            )?;
            let mut rows = stmt.query(params![write.person_id.to_string()])?;
            match rows.next()? {
                Some(row) => Some(origin_from_row(row)?),
                None => None,
            }
        };

        let change = match &existing {
            None => {
                tx.execute(
                    "INSERT INTO identity_origin(
                        person_id, origin_tag, origin_source_table, origin_source_pk,
                        origin_confidence, decided_by, resolution_status, evidence_json,
                        ruleset_version, decided_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        write.person_id.to_string(),
                        write.origin_tag,
                        write.source.source_table,
                        write.source.source_pk,
                        write.confidence.as_str(),
                        write.decided_by.as_str(),
                        write.resolution_status.as_str(),
                        serde_json::to_string(&write.evidence)
                            .context("failed to serialize origin evidence")?,
                        identity_ledger_core::RULESET_VERSION,
                        now,
                    ],
                )
                .context("failed to insert origin row")?;
                OriginChange::Inserted
            }
            Some(current) => {
                let unchanged = current.origin_tag == write.origin_tag
                    && current.source == write.source
                    && current.resolution_status == write.resolution_status
                    && current.confidence == write.confidence;
                if unchanged {
                    tx.commit().context("failed to commit no-op origin transaction")?;
                    return Ok(OriginChange::Unchanged);
                }
                if !current
                    .resolution_status
                    .can_transition(write.resolution_status, write.decided_by)
                {
                    return Err(anyhow!(
                        "forbidden origin transition {} -> {} for {} decider",
                        current.resolution_status.as_str(),
                        write.resolution_status.as_str(),
                        write.decided_by.as_str()
                    ));
                }
                tx.execute(
                    "UPDATE identity_origin SET
                        origin_tag = ?2, origin_source_table = ?3, origin_source_pk = ?4,
                        origin_confidence = ?5, decided_by = ?6, resolution_status = ?7,
                        evidence_json = ?8, ruleset_version = ?9, updated_at = ?10
                     WHERE person_id = ?1",
                    params![
                        write.person_id.to_string(),
                        write.origin_tag,
                        write.source.source_table,
                        write.source.source_pk,
                        write.confidence.as_str(),
                        write.decided_by.as_str(),
                        write.resolution_status.as_str(),
                        serde_json::to_string(&write.evidence)
                            .context("failed to serialize origin evidence")?,
                        identity_ledger_core::RULESET_VERSION,
                        now,
                    ],
                )
                .context("failed to update origin row")?;
                OriginChange::Updated
            }
        };

        tx.execute(
            "INSERT INTO identity_origin_history(
                person_id, old_origin_tag, new_origin_tag, old_status, new_status,
                origin_source_table, origin_source_pk, origin_confidence,
                ruleset_version, decided_by, reason, changed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                write.person_id.to_string(),
                existing.as_ref().map(|row| row.origin_tag.clone()),
                write.origin_tag,
                existing.as_ref().map(|row| row.resolution_status.as_str()),
                write.resolution_status.as_str(),
                write.source.source_table,
                write.source.source_pk,
                write.confidence.as_str(),
                identity_ledger_core::RULESET_VERSION,
                write.decided_by.as_str(),
                write.reason,
                now,
            ],
        )
        .context("failed to append origin history row")?;

        tx.commit().context("failed to commit origin transaction")?;
        Ok(change)
    }

    /// Append-only history of one person's origin, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn origin_history(&self, person_id: PersonId) -> Result<Vec<OriginHistoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, person_id, old_origin_tag, new_origin_tag, old_status, new_status,
                    origin_source_table, origin_source_pk, origin_confidence,
                    ruleset_version, decided_by, reason, changed_at
             FROM identity_origin_history
             WHERE person_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![person_id.to_string()])?;
        let mut history = Vec::new();
        while let Some(row) = rows.next()? {
            let person_raw: String = row.get(1)?;
            let old_status_raw: Option<String> = row.get(4)?;
            let new_status_raw: String = row.get(5)?;
            let confidence_raw: String = row.get(8)?;
            let decided_by_raw: String = row.get(10)?;
            history.push(OriginHistoryRow {
                id: row.get(0)?,
                person_id: parse_person_id(&person_raw)?,
                old_origin_tag: row.get(2)?,
                new_origin_tag: row.get(3)?,
                old_status: old_status_raw
                    .as_deref()
                    .map(|value| {
                        ResolutionStatus::parse(value)
                            .ok_or_else(|| anyhow!("unknown resolution status: {value}"))
                    })
                    .transpose()?,
                new_status: ResolutionStatus::parse(&new_status_raw)
                    .ok_or_else(|| anyhow!("unknown resolution status: {new_status_raw}"))?,
                source: SourceKey { source_table: row.get(6)?, source_pk: row.get(7)? },
                confidence: ConfidenceLevel::parse(&confidence_raw)
                    .ok_or_else(|| anyhow!("unknown confidence_level: {confidence_raw}"))?,
                ruleset_version: row.get(9)?,
                decided_by: DecidedBy::parse(&decided_by_raw)
                    .ok_or_else(|| anyhow!("unknown decided_by: {decided_by_raw}"))?,
                reason: row.get(11)?,
                changed_at: row.get(12)?,
            });
        }
        Ok(history)
    }

    /// Raise or refresh the conflict alert for one person. A repeat
    /// detection bumps `last_detected_at` (and reopens a resolved alert)
    /// without creating a second row.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_alert(&mut self, person_id: PersonId, detail: &OriginConflict) -> Result<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO origin_alerts(
                    person_id, detail_json, first_detected_at, last_detected_at
                ) VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(person_id) DO UPDATE SET
                    detail_json = excluded.detail_json,
                    last_detected_at = excluded.last_detected_at,
                    resolved_at = NULL",
                params![
                    person_id.to_string(),
                    serde_json::to_string(detail).context("failed to serialize alert detail")?,
                    now,
                ],
            )
            .context("failed to upsert origin alert")?;
        Ok(())
    }

    /// List alerts; resolved ones are included only on request.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_alerts(&self, include_resolved: bool) -> Result<Vec<AlertRow>> {
        let sql = if include_resolved {
            "SELECT person_id, detail_json, first_detected_at, last_detected_at,
                    muted_until, resolved_at, resolution_note
             FROM origin_alerts ORDER BY last_detected_at DESC, person_id ASC"
        } else {
            "SELECT person_id, detail_json, first_detected_at, last_detected_at,
                    muted_until, resolved_at, resolution_note
             FROM origin_alerts WHERE resolved_at IS NULL
             ORDER BY last_detected_at DESC, person_id ASC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut alerts = Vec::new();
        while let Some(row) = rows.next()? {
            let person_raw: String = row.get(0)?;
            let detail_json: String = row.get(1)?;
            let first_raw: String = row.get(2)?;
            let last_raw: String = row.get(3)?;
            let muted_raw: Option<String> = row.get(4)?;
            let resolved_raw: Option<String> = row.get(5)?;
            alerts.push(AlertRow {
                person_id: parse_person_id(&person_raw)?,
                detail: serde_json::from_str(&detail_json)
                    .context("failed to deserialize alert detail")?,
                first_detected_at: parse_rfc3339(&first_raw)?,
                last_detected_at: parse_rfc3339(&last_raw)?,
                muted_until: muted_raw.as_deref().map(parse_rfc3339).transpose()?,
                resolved_at: resolved_raw.as_deref().map(parse_rfc3339).transpose()?,
                resolution_note: row.get(6)?,
            });
        }
        Ok(alerts)
    }

    /// Mute one alert until the given instant. Returns `false` when the
    /// person has no alert.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn mute_alert(&mut self, person_id: PersonId, until: OffsetDateTime) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE origin_alerts SET muted_until = ?2 WHERE person_id = ?1",
                params![person_id.to_string(), format_rfc3339(until)?],
            )
            .context("failed to mute alert")?;
        Ok(updated > 0)
    }

    /// Resolve one alert with an operator note. Returns `false` when the
    /// person has no alert.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn resolve_alert(&mut self, person_id: PersonId, note: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE origin_alerts SET resolved_at = ?2, resolution_note = ?3
                 WHERE person_id = ?1",
                params![person_id.to_string(), now_rfc3339()?, note],
            )
            .context("failed to resolve alert")?;
        Ok(updated > 0)
    }
}

fn unmatched_from_row(row: &rusqlite::Row<'_>) -> Result<UnmatchedRow> {
    let reason_raw: String = row.get(2)?;
    let candidates_json: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let run_raw: Option<String> = row.get(6)?;
    let first_seen_raw: String = row.get(7)?;
    let last_seen_raw: String = row.get(8)?;
    Ok(UnmatchedRow {
        key: SourceKey { source_table: row.get(0)?, source_pk: row.get(1)? },
        reason_code: ReasonCode::parse(&reason_raw)
            .ok_or_else(|| anyhow!("unknown reason_code: {reason_raw}"))?,
        details: row.get(3)?,
        candidates: serde_json::from_str(&candidates_json)
            .context("failed to deserialize candidate preview")?,
        status: UnmatchedStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown unmatched status: {status_raw}"))?,
        run_id: run_raw.as_deref().map(parse_run_id).transpose()?,
        first_seen_at: parse_rfc3339(&first_seen_raw)?,
        last_seen_at: parse_rfc3339(&last_seen_raw)?,
    })
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<JobRow> {
    let status_raw: String = row.get(2)?;
    let last_attempt_raw: Option<String> = row.get(4)?;
    let matched_raw: Option<String> = row.get(5)?;
    let enqueued_raw: String = row.get(7)?;
    Ok(JobRow {
        key: SourceKey { source_table: row.get(0)?, source_pk: row.get(1)? },
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown job status: {status_raw}"))?,
        attempt_count: row.get::<_, u32>(3)?,
        last_attempt_at: last_attempt_raw.as_deref().map(parse_rfc3339).transpose()?,
        matched_person_id: matched_raw.as_deref().map(parse_person_id).transpose()?,
        fail_reason: row.get(6)?,
        enqueued_at: parse_rfc3339(&enqueued_raw)?,
    })
}

fn link_from_row(row: &rusqlite::Row<'_>) -> Result<LinkRow> {
    let person_raw: String = row.get(2)?;
    let confidence_raw: String = row.get(5)?;
    let evidence_json: String = row.get(6)?;
    let snapshot_raw: String = row.get(7)?;
    let linked_raw: String = row.get(8)?;
    let run_raw: Option<String> = row.get(9)?;
    Ok(LinkRow {
        key: SourceKey { source_table: row.get(0)?, source_pk: row.get(1)? },
        person_id: parse_person_id(&person_raw)?,
        match_rule: row.get(3)?,
        match_score: row.get(4)?,
        confidence_level: ConfidenceLevel::parse(&confidence_raw)
            .ok_or_else(|| anyhow!("unknown confidence_level: {confidence_raw}"))?,
        evidence: serde_json::from_str(&evidence_json)
            .context("failed to deserialize link evidence")?,
        snapshot_date: parse_date(&snapshot_raw)?,
        linked_at: parse_rfc3339(&linked_raw)?,
        run_id: run_raw.as_deref().map(parse_run_id).transpose()?,
    })
}

fn origin_from_row(row: &rusqlite::Row<'_>) -> Result<OriginRow> {
    let person_raw: String = row.get(0)?;
    let confidence_raw: String = row.get(4)?;
    let decided_by_raw: String = row.get(5)?;
    let status_raw: String = row.get(6)?;
    let evidence_json: String = row.get(7)?;
    let decided_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;
    Ok(OriginRow {
        person_id: parse_person_id(&person_raw)?,
        origin_tag: row.get(1)?,
        source: SourceKey { source_table: row.get(2)?, source_pk: row.get(3)? },
        confidence: ConfidenceLevel::parse(&confidence_raw)
            .ok_or_else(|| anyhow!("unknown confidence_level: {confidence_raw}"))?,
        decided_by: DecidedBy::parse(&decided_by_raw)
            .ok_or_else(|| anyhow!("unknown decided_by: {decided_by_raw}"))?,
        resolution_status: ResolutionStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown resolution status: {status_raw}"))?,
        evidence: serde_json::from_str(&evidence_json)
            .context("failed to deserialize origin evidence")?,
        ruleset_version: row.get(8)?,
        decided_at: parse_rfc3339(&decided_raw)?,
        updated_at: parse_rfc3339(&updated_raw)?,
    })
}

fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for index in 0..count {
        if index > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Format a calendar date as the ISO `YYYY-MM-DD` text the schema stores.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn format_date(value: Date) -> Result<String> {
    value.format(DATE_FORMAT).context("failed to format date")
}

/// Parse an ISO `YYYY-MM-DD` date string.
///
/// # Errors
/// Returns an error when the value does not parse.
pub fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value, DATE_FORMAT).with_context(|| format!("invalid date: {value}"))
}

fn now_rfc3339() -> Result<String> {
    format_rfc3339(OffsetDateTime::now_utc())
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_person_id(raw: &str) -> Result<PersonId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(PersonId(parsed))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(RunId(parsed))
}

#[cfg(test)]
mod tests {
    use identity_ledger_core::{ConfidenceLevel, MatchingConfig};
    use time::macros::date;

    use super::*;

    fn open_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn staged(table: &str, pk: &str, date: &str, phone: Option<&str>, name: Option<&str>) -> StagedRecord {
        StagedRecord {
            key: SourceKey::new(table, pk),
            record_date: date.to_string(),
            attributes: RawAttributes {
                phone: phone.map(str::to_string),
                license: None,
                plate: None,
                name: name.map(str::to_string),
            },
            partition: None,
        }
    }

    fn link_request(table: &str, pk: &str, person_id: PersonId) -> LinkRequest {
        LinkRequest {
            key: SourceKey::new(table, pk),
            person_id,
            match_rule: "R1_PHONE_EXACT".to_string(),
            match_score: 0.95,
            confidence_level: ConfidenceLevel::High,
            evidence: vec!["fixture".to_string()],
            snapshot_date: date!(2025 - 01 - 10),
            attributes: NormalizedAttributes {
                phone: Some("987654321".to_string()),
                license: None,
                plate: None,
                name: Some("JUAN PEREZ".to_string()),
            },
            partition: None,
            run_id: None,
        }
    }

    fn mint(store: &mut SqliteStore, table: &str, pk: &str) -> PersonId {
        let mut request = link_request(table, pk, PersonId::new());
        request.match_rule = "MINT_NEW".to_string();
        request.match_score = 1.0;
        match store.mint_person(&request) {
            Ok(person_id) => person_id,
            Err(err) => panic!("mint should succeed: {err}"),
        }
    }

    fn origin_write(person_id: PersonId, tag: &str, status: ResolutionStatus, decided_by: DecidedBy) -> OriginWrite {
        OriginWrite {
            person_id,
            origin_tag: tag.to_string(),
            source: SourceKey::new("lead_capture", "41"),
            confidence: ConfidenceLevel::High,
            decided_by,
            resolution_status: status,
            evidence: vec!["fixture".to_string()],
            reason: "fixture".to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_schema_status() {
        let mut store = open_store();
        if let Err(err) = store.migrate() {
            panic!("second migrate should be a no-op: {err}");
        }
        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[test]
    fn refresh_source_index_is_an_idempotent_upsert() {
        let mut store = open_store();
        let config = MatchingConfig::default();
        let tables = vec!["lead_capture".to_string()];

        let record = staged("lead_capture", "1", "2025-01-10", Some("+51 987-654-321"), Some("Juan Pérez"));
        if let Err(err) = store.stage_source_record(&record) {
            panic!("staging should succeed: {err}");
        }

        let first = match store.refresh_source_index(&config, &tables) {
            Ok(outcome) => outcome,
            Err(err) => panic!("refresh should succeed: {err}"),
        };
        assert_eq!(first.refreshed, 1);
        assert!(first.malformed.is_empty());

        let second = match store.refresh_source_index(&config, &tables) {
            Ok(outcome) => outcome,
            Err(err) => panic!("second refresh should succeed: {err}"),
        };
        assert_eq!(second.refreshed, 1);

        let input = match store.match_input(&SourceKey::new("lead_capture", "1")) {
            Ok(Some(input)) => input,
            Ok(None) => panic!("indexed row should exist"),
            Err(err) => panic!("match input should load: {err}"),
        };
        assert_eq!(input.attributes.phone.as_deref(), Some("987654321"));
        assert_eq!(input.attributes.name.as_deref(), Some("JUAN PEREZ"));
    }

    #[test]
    fn refresh_reports_malformed_record_dates() {
        let mut store = open_store();
        let config = MatchingConfig::default();
        let tables = vec!["lead_capture".to_string()];

        let record = staged("lead_capture", "2", "10/01/2025", Some("987654321"), Some("Juan"));
        if let Err(err) = store.stage_source_record(&record) {
            panic!("staging should succeed: {err}");
        }

        let outcome = match store.refresh_source_index(&config, &tables) {
            Ok(outcome) => outcome,
            Err(err) => panic!("refresh should succeed: {err}"),
        };
        assert_eq!(outcome.refreshed, 0);
        assert_eq!(outcome.malformed.len(), 1);
        assert_eq!(outcome.malformed[0].0, SourceKey::new("lead_capture", "2"));
    }

    #[test]
    fn duplicate_link_attempts_are_benign_noops() {
        let mut store = open_store();
        let person_id = mint(&mut store, "driver_master", "7");

        let request = link_request("lead_capture", "41", person_id);
        let first = match store.attach_link(&request) {
            Ok(inserted) => inserted,
            Err(err) => panic!("first attach should succeed: {err}"),
        };
        assert!(first);

        let mut replay = request.clone();
        replay.person_id = PersonId::new();
        let second = match store.attach_link(&replay) {
            Ok(inserted) => inserted,
            Err(err) => panic!("replayed attach should be a no-op, not an error: {err}"),
        };
        assert!(!second);

        let link = match store.link_for(&request.key) {
            Ok(Some(link)) => link,
            Ok(None) => panic!("link should exist"),
            Err(err) => panic!("link lookup should succeed: {err}"),
        };
        // The original winner is preserved; the replay never re-points it.
        assert_eq!(link.person_id, person_id);
    }

    #[test]
    fn attach_raises_person_confidence_and_fills_best_attributes() {
        let mut store = open_store();
        let mut request = link_request("driver_master", "9", PersonId::new());
        request.match_rule = "MINT_NEW".to_string();
        request.confidence_level = ConfidenceLevel::Low;
        request.attributes.name = None;
        let person_id = match store.mint_person(&request) {
            Ok(id) => id,
            Err(err) => panic!("mint should succeed: {err}"),
        };

        let mut second = link_request("lead_capture", "10", person_id);
        second.confidence_level = ConfidenceLevel::High;
        second.attributes.name = Some("JUAN PEREZ".to_string());
        match store.attach_link(&second) {
            Ok(inserted) => assert!(inserted),
            Err(err) => panic!("attach should succeed: {err}"),
        }

        let person = match store.person(person_id) {
            Ok(Some(person)) => person,
            Ok(None) => panic!("person should exist"),
            Err(err) => panic!("person lookup should succeed: {err}"),
        };
        assert_eq!(person.confidence_level, ConfidenceLevel::High);
        assert_eq!(person.best_name.as_deref(), Some("JUAN PEREZ"));
    }

    #[test]
    fn linking_resolves_quarantine_and_marks_job_matched() {
        let mut store = open_store();
        let key = SourceKey::new("lead_capture", "77");

        if let Err(err) =
            store.upsert_unmatched(&key, ReasonCode::NoCandidates, "no candidates", &[], None)
        {
            panic!("quarantine should succeed: {err}");
        }
        match store.enqueue_job(&key) {
            Ok(created) => assert!(created),
            Err(err) => panic!("enqueue should succeed: {err}"),
        }

        let person_id = mint(&mut store, "driver_master", "8");
        let request = link_request("lead_capture", "77", person_id);
        match store.attach_link(&request) {
            Ok(inserted) => assert!(inserted),
            Err(err) => panic!("attach should succeed: {err}"),
        }

        let unmatched = match store.list_unmatched(Some(UnmatchedStatus::Resolved)) {
            Ok(rows) => rows,
            Err(err) => panic!("unmatched listing should succeed: {err}"),
        };
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].key, key);

        let jobs = match store.list_jobs(Some(JobStatus::Matched)) {
            Ok(rows) => rows,
            Err(err) => panic!("job listing should succeed: {err}"),
        };
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].matched_person_id, Some(person_id));
    }

    #[test]
    fn reenqueue_of_pending_and_matched_jobs_is_a_noop() {
        let mut store = open_store();
        let key = SourceKey::new("lead_capture", "5");

        match store.enqueue_job(&key) {
            Ok(created) => assert!(created),
            Err(err) => panic!("enqueue should succeed: {err}"),
        }
        match store.enqueue_job(&key) {
            Ok(created) => assert!(!created),
            Err(err) => panic!("re-enqueue should be a no-op: {err}"),
        }

        let jobs = match store.pending_jobs(10) {
            Ok(rows) => rows,
            Err(err) => panic!("pending jobs should load: {err}"),
        };
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_count, 0);
    }

    #[test]
    fn job_attempts_increase_and_fail_only_at_threshold() {
        let mut store = open_store();
        let key = SourceKey::new("lead_capture", "6");
        match store.enqueue_job(&key) {
            Ok(created) => assert!(created),
            Err(err) => panic!("enqueue should succeed: {err}"),
        }

        for attempt in 1..3 {
            let status = match store.record_job_attempt(&key, "still ambiguous", 3) {
                Ok(status) => status,
                Err(err) => panic!("attempt should record: {err}"),
            };
            assert_eq!(status, JobStatus::Pending, "attempt {attempt} must stay pending");
        }

        let status = match store.record_job_attempt(&key, "still ambiguous", 3) {
            Ok(status) => status,
            Err(err) => panic!("final attempt should record: {err}"),
        };
        assert_eq!(status, JobStatus::Failed);

        let jobs = match store.list_jobs(Some(JobStatus::Failed)) {
            Ok(rows) => rows,
            Err(err) => panic!("job listing should succeed: {err}"),
        };
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_count, 3);
        assert_eq!(jobs[0].fail_reason.as_deref(), Some("still ambiguous"));
    }

    #[test]
    fn origin_writes_append_exactly_one_history_row_each() {
        let mut store = open_store();
        let person_id = mint(&mut store, "driver_master", "11");

        let change = match store.write_origin(&origin_write(
            person_id,
            "lead_form",
            ResolutionStatus::ResolvedAuto,
            DecidedBy::System,
        )) {
            Ok(change) => change,
            Err(err) => panic!("origin insert should succeed: {err}"),
        };
        assert_eq!(change, OriginChange::Inserted);

        // Unchanged decision: no update, no history spam.
        let change = match store.write_origin(&origin_write(
            person_id,
            "lead_form",
            ResolutionStatus::ResolvedAuto,
            DecidedBy::System,
        )) {
            Ok(change) => change,
            Err(err) => panic!("no-op origin write should succeed: {err}"),
        };
        assert_eq!(change, OriginChange::Unchanged);

        let change = match store.write_origin(&origin_write(
            person_id,
            "scout",
            ResolutionStatus::ResolvedManual,
            DecidedBy::Manual,
        )) {
            Ok(change) => change,
            Err(err) => panic!("manual override should succeed: {err}"),
        };
        assert_eq!(change, OriginChange::Updated);

        let history = match store.origin_history(person_id) {
            Ok(rows) => rows,
            Err(err) => panic!("history should load: {err}"),
        };
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_origin_tag, None);
        assert_eq!(history[0].new_origin_tag, "lead_form");
        assert_eq!(history[1].old_origin_tag.as_deref(), Some("lead_form"));
        assert_eq!(history[1].new_origin_tag, "scout");
        assert_eq!(history[1].decided_by, DecidedBy::Manual);
    }

    #[test]
    fn system_may_not_overwrite_a_manual_origin_decision() {
        let mut store = open_store();
        let person_id = mint(&mut store, "driver_master", "12");

        match store.write_origin(&origin_write(
            person_id,
            "legacy",
            ResolutionStatus::ResolvedManual,
            DecidedBy::Manual,
        )) {
            Ok(change) => assert_eq!(change, OriginChange::Inserted),
            Err(err) => panic!("manual origin insert should succeed: {err}"),
        }

        let result = store.write_origin(&origin_write(
            person_id,
            "lead_form",
            ResolutionStatus::ResolvedAuto,
            DecidedBy::System,
        ));
        assert!(result.is_err(), "system overwrite of a manual decision must be rejected");
    }

    #[test]
    fn origin_delete_is_structurally_forbidden() {
        let mut store = open_store();
        let person_id = mint(&mut store, "driver_master", "13");
        match store.write_origin(&origin_write(
            person_id,
            "lead_form",
            ResolutionStatus::ResolvedAuto,
            DecidedBy::System,
        )) {
            Ok(change) => assert_eq!(change, OriginChange::Inserted),
            Err(err) => panic!("origin insert should succeed: {err}"),
        }

        let delete = store.conn.execute(
            "DELETE FROM identity_origin WHERE person_id = ?1",
            params![person_id.to_string()],
        );
        assert!(delete.is_err(), "DELETE on identity_origin must be rejected by the trigger");

        let history_delete = store.conn.execute("DELETE FROM identity_origin_history", []);
        assert!(history_delete.is_err(), "DELETE on origin history must be rejected");
    }

    #[test]
    fn overlapping_running_scopes_are_rejected() {
        let mut store = open_store();
        let tables = vec!["lead_capture".to_string(), "scouting_log".to_string()];
        let run_id = match store.begin_run(date!(2025 - 01 - 01), date!(2025 - 01 - 31), &tables, false) {
            Ok(run_id) => run_id,
            Err(err) => panic!("first run should start: {err}"),
        };

        let overlap = store.begin_run(
            date!(2025 - 02 - 01),
            date!(2025 - 02 - 28),
            &["scouting_log".to_string()],
            false,
        );
        assert!(overlap.is_err(), "overlapping RUNNING scope must be rejected");

        let disjoint = store.begin_run(
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            &["legacy_roster".to_string()],
            false,
        );
        match disjoint {
            Ok(_) => {}
            Err(err) => panic!("disjoint table set should be allowed: {err}"),
        }

        if let Err(err) = store.finish_run(run_id, RunStatus::Completed, "{}", None) {
            panic!("finish should succeed: {err}");
        }
        let again = store.begin_run(
            date!(2025 - 02 - 01),
            date!(2025 - 02 - 28),
            &["scouting_log".to_string()],
            false,
        );
        match again {
            Ok(_) => {}
            Err(err) => panic!("scope should be free after completion: {err}"),
        }
    }

    #[test]
    fn abandoning_a_crashed_run_frees_its_scope() {
        let mut store = open_store();
        let tables = vec!["lead_capture".to_string()];
        let run_id = match store.begin_run(date!(2025 - 01 - 01), date!(2025 - 01 - 31), &tables, false) {
            Ok(run_id) => run_id,
            Err(err) => panic!("run should start: {err}"),
        };

        match store.abandon_run(run_id, "operator abandoned after crash") {
            Ok(abandoned) => assert!(abandoned),
            Err(err) => panic!("abandon should succeed: {err}"),
        }
        match store.abandon_run(run_id, "second abandon") {
            Ok(abandoned) => assert!(!abandoned, "a finished run cannot be abandoned again"),
            Err(err) => panic!("second abandon should be a no-op: {err}"),
        }

        match store.begin_run(date!(2025 - 01 - 01), date!(2025 - 01 - 31), &tables, false) {
            Ok(_) => {}
            Err(err) => panic!("scope should be free after abandon: {err}"),
        }
    }

    #[test]
    fn incremental_floor_requires_every_table_to_have_completed() {
        let mut store = open_store();
        let lead = vec!["lead_capture".to_string()];
        let run_id = match store.begin_run(date!(2025 - 01 - 01), date!(2025 - 01 - 31), &lead, false) {
            Ok(run_id) => run_id,
            Err(err) => panic!("run should start: {err}"),
        };
        if let Err(err) = store.finish_run(run_id, RunStatus::Completed, "{}", None) {
            panic!("finish should succeed: {err}");
        }

        let floor = match store.incremental_floor(&lead) {
            Ok(floor) => floor,
            Err(err) => panic!("floor should load: {err}"),
        };
        assert_eq!(floor, Some(date!(2025 - 01 - 31)));

        let both = vec!["lead_capture".to_string(), "scouting_log".to_string()];
        let floor = match store.incremental_floor(&both) {
            Ok(floor) => floor,
            Err(err) => panic!("floor should load: {err}"),
        };
        assert_eq!(floor, None, "a never-run table has no incremental floor");
    }

    #[test]
    fn ignored_quarantine_rows_keep_their_status_on_requarantine() {
        let mut store = open_store();
        let key = SourceKey::new("scouting_log", "30");

        if let Err(err) =
            store.upsert_unmatched(&key, ReasonCode::NoCandidates, "first pass", &[], None)
        {
            panic!("quarantine should succeed: {err}");
        }
        match store.ignore_unmatched(&key) {
            Ok(ignored) => assert!(ignored),
            Err(err) => panic!("ignore should succeed: {err}"),
        }

        if let Err(err) =
            store.upsert_unmatched(&key, ReasonCode::AmbiguousCandidates, "second pass", &[], None)
        {
            panic!("re-quarantine should succeed: {err}");
        }

        let rows = match store.list_unmatched(Some(UnmatchedStatus::Ignored)) {
            Ok(rows) => rows,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(rows.len(), 1);
        // The dismissal sticks; the newer reason does not reopen the row.
        assert_eq!(rows[0].reason_code, ReasonCode::NoCandidates);
    }

    #[test]
    fn alert_upserts_bump_last_detected_without_duplicating() {
        let mut store = open_store();
        let person_id = mint(&mut store, "driver_master", "14");
        let conflict = OriginConflict { contenders: Vec::new() };

        if let Err(err) = store.upsert_alert(person_id, &conflict) {
            panic!("alert upsert should succeed: {err}");
        }
        match store.resolve_alert(person_id, "reviewed: lead wins") {
            Ok(resolved) => assert!(resolved),
            Err(err) => panic!("resolve should succeed: {err}"),
        }
        if let Err(err) = store.upsert_alert(person_id, &conflict) {
            panic!("re-detection upsert should succeed: {err}");
        }

        let alerts = match store.list_alerts(false) {
            Ok(alerts) => alerts,
            Err(err) => panic!("alert listing should succeed: {err}"),
        };
        assert_eq!(alerts.len(), 1, "re-detection reopens the single alert row");
        assert!(alerts[0].resolved_at.is_none());
    }
}
