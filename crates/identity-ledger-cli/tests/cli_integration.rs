use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_idl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_idl"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute idl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_idl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "idl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn add_record(db: &Path, table: &str, pk: &str, record_date: &str, extra: &[(&str, &str)]) {
    let mut args = vec![
        "--db".to_string(),
        path_str(db).to_string(),
        "source".to_string(),
        "add".to_string(),
        "--table".to_string(),
        table.to_string(),
        "--pk".to_string(),
        pk.to_string(),
        "--record-date".to_string(),
        record_date.to_string(),
    ];
    for (flag, value) in extra {
        args.push(format!("--{flag}"));
        args.push((*value).to_string());
    }
    let payload = run_json(args);
    assert_eq!(payload.pointer("/staged"), Some(&Value::Bool(true)));
}

fn run_scope(db: &Path, table: &str, from: &str, to: &str) -> Value {
    run_json([
        "--db",
        path_str(db),
        "run",
        "--from",
        from,
        "--to",
        to,
        "--table",
        table,
    ])
}

#[test]
fn schema_version_and_migrate_report_contract_fields() {
    let dir = unique_temp_dir("idl-schema");
    let db = dir.join("ledger.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_str(&before, "/contract_version"), "cli.v1");
    assert_eq!(as_i64(&before, "/current_version"), 0);
    assert_eq!(as_i64(&before, "/target_version"), 1);

    let dry = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry.pointer("/dry_run"), Some(&Value::Bool(true)));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&applied, "/after_version"), 1);
    assert_eq!(applied.pointer("/up_to_date"), Some(&Value::Bool(true)));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.pointer("/quick_check_ok"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn cross_source_pipeline_links_by_phone_and_assigns_origin() {
    let dir = unique_temp_dir("idl-pipeline");
    let db = dir.join("ledger.sqlite3");

    add_record(
        &db,
        "driver_master",
        "7",
        "2024-11-02",
        &[("phone", "987654321"), ("name", "Juan Pérez")],
    );
    add_record(
        &db,
        "lead_capture",
        "41",
        "2025-01-10",
        &[("phone", "+51 987-654-321"), ("plate", "ABC-123"), ("name", "Juan Perez")],
    );

    let master = run_scope(&db, "driver_master", "2024-01-01", "2024-12-31");
    assert_eq!(as_str(&master, "/status"), "completed");
    assert_eq!(as_i64(&master, "/per_source/driver_master/processed"), 1);
    assert_eq!(as_i64(&master, "/per_source/driver_master/minted"), 1);

    let lead = run_scope(&db, "lead_capture", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&lead, "/per_source/lead_capture/matched"), 1);
    assert_eq!(as_i64(&lead, "/per_source/lead_capture/minted"), 0);

    let link = run_json([
        "--db",
        path_str(&db),
        "source",
        "link",
        "--table",
        "lead_capture",
        "--pk",
        "41",
    ]);
    assert_eq!(as_str(&link, "/link/match_rule"), "R1_PHONE_EXACT");
    assert_eq!(as_str(&link, "/link/confidence_level"), "high");

    let person_id = as_str(&link, "/link/person_id").to_string();
    let origin = run_json([
        "--db",
        path_str(&db),
        "origin",
        "show",
        "--person-id",
        &person_id,
    ]);
    assert_eq!(as_str(&origin, "/origin/origin_tag"), "lead_form");
    assert_eq!(as_str(&origin, "/origin/resolution_status"), "resolved_auto");

    let person = run_json([
        "--db",
        path_str(&db),
        "person",
        "show",
        "--person-id",
        &person_id,
    ]);
    assert_eq!(as_str(&person, "/person/confidence_level"), "high");
    let links = person
        .pointer("/links")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("person payload should list links: {person}"));
    assert_eq!(links.len(), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn rerunning_a_scope_is_idempotent() {
    let dir = unique_temp_dir("idl-idempotent");
    let db = dir.join("ledger.sqlite3");

    add_record(
        &db,
        "driver_master",
        "1",
        "2025-01-05",
        &[("phone", "911222333"), ("name", "Ana Lopez")],
    );

    let first = run_scope(&db, "driver_master", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&first, "/per_source/driver_master/processed"), 1);
    assert_eq!(as_i64(&first, "/per_source/driver_master/matched"), 1);

    let second = run_scope(&db, "driver_master", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&second, "/per_source/driver_master/processed"), 0);
    assert_eq!(as_i64(&second, "/per_source/driver_master/skipped"), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ambiguous_scout_sighting_quarantines_and_recovery_keeps_retrying() {
    let dir = unique_temp_dir("idl-ambiguous");
    let db = dir.join("ledger.sqlite3");

    add_record(
        &db,
        "driver_master",
        "1",
        "2025-01-05",
        &[("phone", "911222333"), ("plate", "ABC123"), ("name", "Juan Perez")],
    );
    add_record(
        &db,
        "driver_master",
        "2",
        "2025-01-06",
        &[("phone", "944555666"), ("plate", "ABC123"), ("name", "Juan Perez")],
    );
    add_record(
        &db,
        "scouting_log",
        "30",
        "2025-01-10",
        &[("plate", "ABC-123"), ("name", "Juan Perez")],
    );

    let master = run_scope(&db, "driver_master", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&master, "/per_source/driver_master/minted"), 2);

    let scout = run_scope(&db, "scouting_log", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&scout, "/per_source/scouting_log/unmatched"), 1);

    let unmatched = run_json([
        "--db",
        path_str(&db),
        "unmatched",
        "list",
        "--status",
        "open",
    ]);
    assert_eq!(as_str(&unmatched, "/unmatched/0/reason_code"), "ambiguous_candidates");
    let previews = unmatched
        .pointer("/unmatched/0/candidates")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("quarantine row should carry previews: {unmatched}"));
    assert_eq!(previews.len(), 2);

    let recover = run_json(["--db", path_str(&db), "recover", "--limit", "10"]);
    assert_eq!(as_i64(&recover, "/processed"), 1);
    assert_eq!(as_i64(&recover, "/matched"), 0);
    assert_eq!(as_i64(&recover, "/skipped"), 1);

    let jobs = run_json(["--db", path_str(&db), "jobs", "--status", "pending"]);
    assert_eq!(as_i64(&jobs, "/jobs/0/attempt_count"), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ignored_quarantine_rows_are_skipped_by_recovery() {
    let dir = unique_temp_dir("idl-ignore");
    let db = dir.join("ledger.sqlite3");

    // Attribution-only source with nobody to attach to.
    add_record(
        &db,
        "scouting_log",
        "55",
        "2025-01-10",
        &[("phone", "977888999"), ("name", "Prueba Test")],
    );
    let scout = run_scope(&db, "scouting_log", "2025-01-01", "2025-01-31");
    assert_eq!(as_i64(&scout, "/per_source/scouting_log/unmatched"), 1);

    let ignored = run_json([
        "--db",
        path_str(&db),
        "unmatched",
        "ignore",
        "--table",
        "scouting_log",
        "--pk",
        "55",
    ]);
    assert_eq!(ignored.pointer("/ignored"), Some(&Value::Bool(true)));

    let recover = run_json(["--db", path_str(&db), "recover", "--limit", "10"]);
    assert_eq!(as_i64(&recover, "/processed"), 1);
    assert_eq!(as_i64(&recover, "/matched"), 0);
    assert_eq!(as_i64(&recover, "/failed"), 0);
    assert_eq!(as_i64(&recover, "/skipped"), 1);

    // The dismissed job burned no attempt.
    let jobs = run_json(["--db", path_str(&db), "jobs", "--status", "pending"]);
    assert_eq!(as_i64(&jobs, "/jobs/0/attempt_count"), 0);

    let _ = fs::remove_dir_all(&dir);
}
