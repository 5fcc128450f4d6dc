use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use identity_ledger_core::{
    decide_match, determine_origin, CandidateRecord, ConfidenceLevel, DecidedBy, JobStatus,
    MatchOutcome, MatchingConfig, PersonId, ReasonCode, ResolutionStatus, RunId, RunStatus,
    SourceKey, UnmatchedStatus,
};
use identity_ledger_store_sqlite::{
    AlertRow, JobRow, LinkRequest, LinkRow, OriginHistoryRow, OriginRow, OriginWrite, PersonRow,
    RunRow, SqliteStore, StagedRecord, UnmatchedRow,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    pub scope_from: Date,
    pub scope_to: Date,
    /// Empty means every configured source table.
    pub source_tables: Vec<String>,
    pub incremental: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceStats {
    pub processed: u64,
    pub matched: u64,
    pub minted: u64,
    pub unmatched: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub scope_from: Date,
    pub scope_to: Date,
    pub per_source: BTreeMap<String, SourceStats>,
    pub error: Option<String>,
}

/// Recovery batch result. `skipped` counts jobs that stayed pending (more
/// attempts left), were dismissed as ignored, or had no indexed source row;
/// `failed` counts only jobs that crossed the attempt threshold this pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoverReport {
    pub processed: u64,
    pub matched: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AddSourceRecordRequest {
    pub source_table: String,
    pub source_pk: String,
    pub record_date: String,
    pub phone: Option<String>,
    pub license: Option<String>,
    pub plate: Option<String>,
    pub name: Option<String>,
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonReport {
    pub person: PersonRow,
    pub links: Vec<LinkRow>,
    pub origin: Option<OriginRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginReport {
    pub origin: Option<OriginRow>,
    pub history: Vec<OriginHistoryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OriginOverrideRequest {
    pub person_id: PersonId,
    pub origin_tag: String,
    pub source_table: Option<String>,
    pub source_pk: Option<String>,
    pub reason: String,
    pub operator: String,
}

/// Load matching configuration from a YAML file, falling back to the
/// documented defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&Path>) -> Result<MatchingConfig> {
    let Some(path) = path else {
        return Ok(MatchingConfig::default());
    };
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: MatchingConfig = serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate().map_err(|err| anyhow!("invalid matching config: {err}"))?;
    Ok(config)
}

enum JobOutcome {
    Matched,
    StillPending,
    Failed,
    Skipped,
}

/// Facade over the identity store: batch runs, retry recovery, origin
/// reconciliation, and the administrative surface. One instance per
/// database path; every operation opens and migrates its own store.
#[derive(Debug, Clone)]
pub struct IdentityLedger {
    db_path: PathBuf,
    config: MatchingConfig,
}

impl IdentityLedger {
    #[must_use]
    pub fn new(db_path: PathBuf, config: MatchingConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Stage one raw operational record — the seam the external ingestion
    /// layer (CSV upload, sync jobs) writes through.
    ///
    /// # Errors
    /// Returns an error when the source table is not configured or the
    /// write fails.
    pub fn add_source_record(&self, request: &AddSourceRecordRequest) -> Result<()> {
        if self.config.source(&request.source_table).is_none() {
            return Err(anyhow!("source table is not configured: {}", request.source_table));
        }
        let mut store = self.open_store()?;
        store.stage_source_record(&StagedRecord {
            key: SourceKey::new(&request.source_table, &request.source_pk),
            record_date: request.record_date.clone(),
            attributes: identity_ledger_core::RawAttributes {
                phone: request.phone.clone(),
                license: request.license.clone(),
                plate: request.plate.clone(),
                name: request.name.clone(),
            },
            partition: request.partition.clone(),
        })
    }

    /// Execute one matching run over the requested scope. Always returns a
    /// structured report: a mid-run failure marks the run FAILED, keeps all
    /// committed per-record work, and surfaces the error in the report.
    ///
    /// # Errors
    /// Returns an error only when the run cannot start at all (invalid
    /// config, unconfigured table, overlapping RUNNING scope).
    pub fn run(&self, request: &RunRequest) -> Result<RunReport> {
        self.config.validate().map_err(|err| anyhow!("invalid matching config: {err}"))?;

        let tables = if request.source_tables.is_empty() {
            self.config.sources.iter().map(|spec| spec.table.clone()).collect::<Vec<_>>()
        } else {
            request.source_tables.clone()
        };
        for table in &tables {
            if self.config.source(table).is_none() {
                return Err(anyhow!("source table is not configured: {table}"));
            }
        }
        if request.scope_from > request.scope_to {
            return Err(anyhow!("scope_from must not be after scope_to"));
        }

        let mut store = self.open_store()?;

        let scope_from = if request.incremental {
            match store.incremental_floor(&tables)? {
                Some(floor) => floor.next_day().unwrap_or(request.scope_from),
                None => request.scope_from,
            }
        } else {
            request.scope_from
        };
        let scope_to = request.scope_to;

        let run_id = store.begin_run(scope_from, scope_to, &tables, request.incremental)?;
        info!(%run_id, %scope_from, %scope_to, ?tables, "matching run started");

        let mut per_source: BTreeMap<String, SourceStats> =
            tables.iter().map(|table| (table.clone(), SourceStats::default())).collect();

        let outcome =
            self.execute_run(&mut store, run_id, scope_from, scope_to, &tables, &mut per_source);

        match outcome {
            Ok(()) => {
                let stats_json = serde_json::to_string(&per_source)
                    .context("failed to serialize run stats")?;
                store.finish_run(run_id, RunStatus::Completed, &stats_json, None)?;
                info!(%run_id, "matching run completed");
                Ok(RunReport {
                    run_id,
                    status: RunStatus::Completed,
                    scope_from,
                    scope_to,
                    per_source,
                    error: None,
                })
            }
            Err(err) => {
                // Committed per-record work is retained; the scope becomes
                // runnable again and a re-invocation is safe.
                let message = format!("{err:#}");
                warn!(%run_id, error = %message, "matching run failed");
                let stats_json = serde_json::to_string(&per_source).unwrap_or_default();
                if let Err(finish_err) =
                    store.finish_run(run_id, RunStatus::Failed, &stats_json, Some(&message))
                {
                    warn!(%run_id, error = %format!("{finish_err:#}"), "failed to mark run FAILED");
                }
                Ok(RunReport {
                    run_id,
                    status: RunStatus::Failed,
                    scope_from,
                    scope_to,
                    per_source,
                    error: Some(message),
                })
            }
        }
    }

    fn execute_run(
        &self,
        store: &mut SqliteStore,
        run_id: RunId,
        scope_from: Date,
        scope_to: Date,
        tables: &[String],
        per_source: &mut BTreeMap<String, SourceStats>,
    ) -> Result<()> {
        let refresh = store.refresh_source_index(&self.config, tables)?;
        debug!(refreshed = refresh.refreshed, malformed = refresh.malformed.len(), "index ready");

        for (key, detail) in &refresh.malformed {
            store.upsert_unmatched(key, ReasonCode::MalformedInput, detail, &[], Some(run_id))?;
            store.enqueue_job(key)?;
            let stats = per_source.entry(key.source_table.clone()).or_default();
            stats.processed += 1;
            stats.unmatched += 1;
        }

        let mut snapshot = store.load_candidate_snapshot()?;
        let records = store.scope_records(tables, scope_from, scope_to)?;
        let mut touched: BTreeSet<PersonId> = BTreeSet::new();

        for record in records {
            let table = record.input.key.source_table.clone();
            let stats = per_source.entry(table.clone()).or_default();
            if record.linked || record.ignored {
                stats.skipped += 1;
                continue;
            }
            stats.processed += 1;

            let Some(spec) = self.config.source(&table) else {
                stats.skipped += 1;
                continue;
            };

            match decide_match(&record.input, &snapshot, spec, &self.config) {
                MatchOutcome::Attach { person_id, rule, confidence, score, evidence } => {
                    let request = LinkRequest {
                        key: record.input.key.clone(),
                        person_id,
                        match_rule: rule,
                        match_score: score,
                        confidence_level: confidence,
                        evidence,
                        snapshot_date: record.input.record_date,
                        attributes: record.input.attributes.clone(),
                        partition: record.input.partition.clone(),
                        run_id: Some(run_id),
                    };
                    let inserted = store.attach_link(&request)?;
                    stats.matched += 1;
                    touched.insert(person_id);
                    if inserted {
                        snapshot.push(CandidateRecord {
                            person_id,
                            key: record.input.key,
                            record_date: record.input.record_date,
                            partition: record.input.partition,
                            attributes: record.input.attributes,
                        });
                    }
                }
                MatchOutcome::Mint { rule, confidence, score, evidence } => {
                    let request = LinkRequest {
                        key: record.input.key.clone(),
                        person_id: PersonId::new(),
                        match_rule: rule,
                        match_score: score,
                        confidence_level: confidence,
                        evidence,
                        snapshot_date: record.input.record_date,
                        attributes: record.input.attributes.clone(),
                        partition: record.input.partition.clone(),
                        run_id: Some(run_id),
                    };
                    let person_id = store.mint_person(&request)?;
                    stats.matched += 1;
                    stats.minted += 1;
                    touched.insert(person_id);
                    snapshot.push(CandidateRecord {
                        person_id,
                        key: record.input.key,
                        record_date: record.input.record_date,
                        partition: record.input.partition,
                        attributes: record.input.attributes,
                    });
                }
                MatchOutcome::Quarantine { reason, details, candidates } => {
                    store.upsert_unmatched(
                        &record.input.key,
                        reason,
                        &details,
                        &candidates,
                        Some(run_id),
                    )?;
                    store.enqueue_job(&record.input.key)?;
                    stats.unmatched += 1;
                }
            }
        }

        self.reconcile_origins(store, &touched)?;
        Ok(())
    }

    /// Re-drive quarantined records through the cascade. Each job's state
    /// transition commits independently; one job failing never rolls back
    /// its batch siblings.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or the job list
    /// cannot be read.
    pub fn recover(&self, limit: usize) -> Result<RecoverReport> {
        self.config.validate().map_err(|err| anyhow!("invalid matching config: {err}"))?;
        let mut store = self.open_store()?;

        let jobs = store.pending_jobs(limit)?;
        info!(batch = jobs.len(), "recovery batch started");
        let mut snapshot = store.load_candidate_snapshot()?;
        let mut touched: BTreeSet<PersonId> = BTreeSet::new();
        let mut report = RecoverReport::default();

        for job in jobs {
            report.processed += 1;
            match self.recover_one(&mut store, &job, &mut snapshot, &mut touched) {
                Ok(JobOutcome::Matched) => report.matched += 1,
                Ok(JobOutcome::Failed) => report.failed += 1,
                Ok(JobOutcome::StillPending | JobOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    // Storage trouble on one job: record the attempt and
                    // keep the batch moving.
                    let message = format!("recovery error: {err:#}");
                    warn!(key = %job.key, error = %message, "job attempt errored");
                    match store.record_job_attempt(
                        &job.key,
                        &message,
                        self.config.max_match_attempts,
                    ) {
                        Ok(JobStatus::Failed) => report.failed += 1,
                        Ok(_) => report.skipped += 1,
                        Err(attempt_err) => {
                            warn!(key = %job.key, error = %format!("{attempt_err:#}"), "could not record job attempt");
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        self.reconcile_origins(&mut store, &touched)?;
        Ok(report)
    }

    fn recover_one(
        &self,
        store: &mut SqliteStore,
        job: &JobRow,
        snapshot: &mut Vec<CandidateRecord>,
        touched: &mut BTreeSet<PersonId>,
    ) -> Result<JobOutcome> {
        if let Some(unmatched) = store.unmatched_for(&job.key)? {
            if unmatched.status == UnmatchedStatus::Ignored {
                debug!(key = %job.key, "job skipped: record dismissed as ignored");
                return Ok(JobOutcome::Skipped);
            }
        }

        let Some(input) = store.match_input(&job.key)? else {
            let status = store.record_job_attempt(
                &job.key,
                "source record is not present in the source index",
                self.config.max_match_attempts,
            )?;
            return Ok(job_outcome_for(status));
        };

        let Some(spec) = self.config.source(&input.key.source_table) else {
            let status = store.record_job_attempt(
                &job.key,
                "source table is not configured",
                self.config.max_match_attempts,
            )?;
            return Ok(job_outcome_for(status));
        };

        match decide_match(&input, snapshot, spec, &self.config) {
            MatchOutcome::Attach { person_id, rule, confidence, score, evidence } => {
                let request = LinkRequest {
                    key: input.key.clone(),
                    person_id,
                    match_rule: rule,
                    match_score: score,
                    confidence_level: confidence,
                    evidence,
                    snapshot_date: input.record_date,
                    attributes: input.attributes.clone(),
                    partition: input.partition.clone(),
                    run_id: None,
                };
                let inserted = store.attach_link(&request)?;
                touched.insert(person_id);
                if inserted {
                    snapshot.push(CandidateRecord {
                        person_id,
                        key: input.key,
                        record_date: input.record_date,
                        partition: input.partition,
                        attributes: input.attributes,
                    });
                }
                info!(key = %request.key, %person_id, "recovery linked record");
                Ok(JobOutcome::Matched)
            }
            MatchOutcome::Mint { rule, confidence, score, evidence } => {
                let request = LinkRequest {
                    key: input.key.clone(),
                    person_id: PersonId::new(),
                    match_rule: rule,
                    match_score: score,
                    confidence_level: confidence,
                    evidence,
                    snapshot_date: input.record_date,
                    attributes: input.attributes.clone(),
                    partition: input.partition.clone(),
                    run_id: None,
                };
                let person_id = store.mint_person(&request)?;
                touched.insert(person_id);
                snapshot.push(CandidateRecord {
                    person_id,
                    key: input.key,
                    record_date: input.record_date,
                    partition: input.partition,
                    attributes: input.attributes,
                });
                info!(key = %request.key, %person_id, "recovery minted person");
                Ok(JobOutcome::Matched)
            }
            MatchOutcome::Quarantine { reason, details, candidates } => {
                store.upsert_unmatched(&input.key, reason, &details, &candidates, None)?;
                let status = store.record_job_attempt(
                    &input.key,
                    &details,
                    self.config.max_match_attempts,
                )?;
                Ok(job_outcome_for(status))
            }
        }
    }

    /// Reconcile origins for the given persons: apply the deterministic
    /// decision unless a human has settled the row, and keep the conflict
    /// alert in step with what the resolver currently sees.
    fn reconcile_origins(
        &self,
        store: &mut SqliteStore,
        touched: &BTreeSet<PersonId>,
    ) -> Result<()> {
        for &person_id in touched {
            let links = store.origin_link_views(person_id)?;
            let Some(decision) = determine_origin(&links, &self.config) else {
                continue;
            };

            if let Some(existing) = store.get_origin(person_id)? {
                if existing.decided_by == DecidedBy::Manual
                    || existing.resolution_status.is_manually_settled()
                {
                    debug!(%person_id, "origin left alone: manually settled");
                    continue;
                }
            }

            let reason = if decision.conflict.is_some() {
                "conflicting origin signals within tolerance".to_string()
            } else {
                "earliest qualifying link selected".to_string()
            };
            let write = OriginWrite {
                person_id,
                origin_tag: decision.origin_tag.clone(),
                source: decision.source.clone(),
                confidence: decision.confidence,
                decided_by: DecidedBy::System,
                resolution_status: decision.resolution_status,
                evidence: decision.evidence.clone(),
                reason,
            };
            let change = store.write_origin(&write)?;
            debug!(%person_id, ?change, tag = %decision.origin_tag, "origin reconciled");

            if let Some(conflict) = &decision.conflict {
                store.upsert_alert(person_id, conflict)?;
                warn!(%person_id, contenders = conflict.contenders.len(), "origin conflict pending review");
            }
        }
        Ok(())
    }

    /// Fetch one person with links and origin.
    ///
    /// # Errors
    /// Returns an error when the person does not exist or reads fail.
    pub fn person(&self, person_id: PersonId) -> Result<PersonReport> {
        let store = self.open_store()?;
        let person = store
            .person(person_id)?
            .ok_or_else(|| anyhow!("person not found: {person_id}"))?;
        Ok(PersonReport {
            person,
            links: store.person_links(person_id)?,
            origin: store.get_origin(person_id)?,
        })
    }

    /// Fetch one source record's link, if any.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn link_for(&self, key: &SourceKey) -> Result<Option<LinkRow>> {
        let store = self.open_store()?;
        store.link_for(key)
    }

    /// Fetch one person's origin row and full history.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn origin(&self, person_id: PersonId) -> Result<OriginReport> {
        let store = self.open_store()?;
        Ok(OriginReport {
            origin: store.get_origin(person_id)?,
            history: store.origin_history(person_id)?,
        })
    }

    /// Manually re-point a person's origin. The override is logged and the
    /// engine will never silently revert it.
    ///
    /// # Errors
    /// Returns an error when the person has no links or the write fails.
    pub fn origin_override(&self, request: &OriginOverrideRequest) -> Result<OriginRow> {
        let mut store = self.open_store()?;
        let source = match (&request.source_table, &request.source_pk) {
            (Some(table), Some(pk)) => SourceKey::new(table, pk),
            _ => self.manual_origin_source(&store, request.person_id)?,
        };
        let existing = store.get_origin(request.person_id)?;
        let write = OriginWrite {
            person_id: request.person_id,
            origin_tag: request.origin_tag.clone(),
            source,
            confidence: existing.as_ref().map_or(ConfidenceLevel::High, |row| row.confidence),
            decided_by: DecidedBy::Manual,
            resolution_status: ResolutionStatus::ResolvedManual,
            evidence: vec![format!("manual override by {}", request.operator)],
            reason: format!("{}: {}", request.operator, request.reason),
        };
        store.write_origin(&write)?;
        store
            .get_origin(request.person_id)?
            .ok_or_else(|| anyhow!("origin row vanished after override"))
    }

    /// Mark a person's origin as predating tracking.
    ///
    /// # Errors
    /// Returns an error when the person has no links or the write fails.
    pub fn origin_mark_legacy(
        &self,
        person_id: PersonId,
        reason: &str,
        operator: &str,
    ) -> Result<OriginRow> {
        self.manual_status_change(person_id, ResolutionStatus::MarkedLegacy, "legacy", reason, operator)
    }

    /// Discard a person's origin as noise or test data.
    ///
    /// # Errors
    /// Returns an error when the person has no links or the write fails.
    pub fn origin_discard(
        &self,
        person_id: PersonId,
        reason: &str,
        operator: &str,
    ) -> Result<OriginRow> {
        self.manual_status_change(person_id, ResolutionStatus::Discarded, "unknown", reason, operator)
    }

    fn manual_status_change(
        &self,
        person_id: PersonId,
        status: ResolutionStatus,
        fallback_tag: &str,
        reason: &str,
        operator: &str,
    ) -> Result<OriginRow> {
        let mut store = self.open_store()?;
        let existing = store.get_origin(person_id)?;
        let (origin_tag, source, confidence) = match &existing {
            Some(row) => (row.origin_tag.clone(), row.source.clone(), row.confidence),
            None => (
                fallback_tag.to_string(),
                self.manual_origin_source(&store, person_id)?,
                ConfidenceLevel::Low,
            ),
        };
        let write = OriginWrite {
            person_id,
            origin_tag,
            source,
            confidence,
            decided_by: DecidedBy::Manual,
            resolution_status: status,
            evidence: vec![format!("{} set by {operator}", status.as_str())],
            reason: format!("{operator}: {reason}"),
        };
        store.write_origin(&write)?;
        store
            .get_origin(person_id)?
            .ok_or_else(|| anyhow!("origin row vanished after status change"))
    }

    /// The earliest link of a person, used as origin source when a manual
    /// action targets a person the resolver never decided.
    fn manual_origin_source(&self, store: &SqliteStore, person_id: PersonId) -> Result<SourceKey> {
        let links = store.person_links(person_id)?;
        links
            .into_iter()
            .min_by(|lhs, rhs| {
                lhs.snapshot_date.cmp(&rhs.snapshot_date).then_with(|| lhs.key.cmp(&rhs.key))
            })
            .map(|link| link.key)
            .ok_or_else(|| anyhow!("person has no links: {person_id}"))
    }

    /// List quarantine rows.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn unmatched_list(&self, status: Option<UnmatchedStatus>) -> Result<Vec<UnmatchedRow>> {
        let store = self.open_store()?;
        store.list_unmatched(status)
    }

    /// Dismiss one quarantined record as noise. Returns `false` when there
    /// is no open quarantine row for the key.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn unmatched_ignore(&self, key: &SourceKey) -> Result<bool> {
        let mut store = self.open_store()?;
        store.ignore_unmatched(key)
    }

    /// List origin conflict alerts.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn alerts_list(&self, include_resolved: bool) -> Result<Vec<AlertRow>> {
        let store = self.open_store()?;
        store.list_alerts(include_resolved)
    }

    /// Mute one alert until the given instant.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn alert_mute(&self, person_id: PersonId, until: OffsetDateTime) -> Result<bool> {
        let mut store = self.open_store()?;
        store.mute_alert(person_id, until)
    }

    /// Resolve one alert with a note.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn alert_resolve(&self, person_id: PersonId, note: &str) -> Result<bool> {
        let mut store = self.open_store()?;
        store.resolve_alert(person_id, note)
    }

    /// List retry jobs.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn jobs_list(&self, status: Option<JobStatus>) -> Result<Vec<JobRow>> {
        let store = self.open_store()?;
        store.list_jobs(status)
    }

    /// Fetch one run row.
    ///
    /// # Errors
    /// Returns an error when the run does not exist or reads fail.
    pub fn run_show(&self, run_id: RunId) -> Result<RunRow> {
        let store = self.open_store()?;
        store.get_run(run_id)?.ok_or_else(|| anyhow!("run not found: {run_id}"))
    }

    /// Mark a crashed run FAILED so its scope becomes runnable again.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn run_abandon(&self, run_id: RunId, error: &str) -> Result<bool> {
        let mut store = self.open_store()?;
        store.abandon_run(run_id, error)
    }

}

fn job_outcome_for(status: JobStatus) -> JobOutcome {
    match status {
        JobStatus::Failed => JobOutcome::Failed,
        JobStatus::Pending | JobStatus::Matched => JobOutcome::StillPending,
    }
}
