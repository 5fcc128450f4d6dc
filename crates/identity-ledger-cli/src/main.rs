use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use identity_ledger_core::{JobStatus, PersonId, RunId, SourceKey, UnmatchedStatus};
use identity_ledger_engine::{
    load_config, AddSourceRecordRequest, IdentityLedger, OriginOverrideRequest, RunRequest,
};
use identity_ledger_store_sqlite::{parse_date, SqliteStore};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "idl")]
#[command(about = "Identity Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./identity_ledger.sqlite3")]
    db: PathBuf,

    /// Matching-policy YAML file; documented defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },
    Run(RunArgs),
    Recover(RecoverArgs),
    Person {
        #[command(subcommand)]
        command: PersonCommand,
    },
    Origin {
        #[command(subcommand)]
        command: Box<OriginCommand>,
    },
    Unmatched {
        #[command(subcommand)]
        command: UnmatchedCommand,
    },
    Alerts {
        #[command(subcommand)]
        command: AlertsCommand,
    },
    Jobs(JobsArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SourceCommand {
    /// Stage one raw operational record (the ingestion seam).
    Add(SourceAddArgs),
    /// Show the identity link for one source record.
    Link(SourceKeyArgs),
}

#[derive(Debug, Args)]
struct SourceAddArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    pk: String,
    #[arg(long)]
    record_date: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    license: Option<String>,
    #[arg(long)]
    plate: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    partition: Option<String>,
}

#[derive(Debug, Args)]
struct SourceKeyArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    pk: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    /// Repeatable; all configured tables when omitted.
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long, default_value_t = false)]
    incremental: bool,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
enum PersonCommand {
    Show(PersonArgs),
}

#[derive(Debug, Args)]
struct PersonArgs {
    #[arg(long)]
    person_id: String,
}

#[derive(Debug, Subcommand)]
enum OriginCommand {
    Show(PersonArgs),
    Override(OriginOverrideArgs),
    MarkLegacy(OriginStatusArgs),
    Discard(OriginStatusArgs),
}

#[derive(Debug, Args)]
struct OriginOverrideArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    origin_tag: String,
    #[arg(long)]
    source_table: Option<String>,
    #[arg(long)]
    source_pk: Option<String>,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    operator: String,
}

#[derive(Debug, Args)]
struct OriginStatusArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    operator: String,
}

#[derive(Debug, Subcommand)]
enum UnmatchedCommand {
    List(UnmatchedListArgs),
    Ignore(SourceKeyArgs),
}

#[derive(Debug, Args)]
struct UnmatchedListArgs {
    #[arg(long, value_enum)]
    status: Option<UnmatchedStatusArg>,
}

#[derive(Debug, Subcommand)]
enum AlertsCommand {
    List(AlertsListArgs),
    Mute(AlertMuteArgs),
    Resolve(AlertResolveArgs),
}

#[derive(Debug, Args)]
struct AlertsListArgs {
    #[arg(long, default_value_t = false)]
    include_resolved: bool,
}

#[derive(Debug, Args)]
struct AlertMuteArgs {
    #[arg(long)]
    person_id: String,
    /// RFC 3339 instant the mute expires at.
    #[arg(long)]
    until: String,
}

#[derive(Debug, Args)]
struct AlertResolveArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    note: String,
}

#[derive(Debug, Args)]
struct JobsArgs {
    #[arg(long, value_enum)]
    status: Option<JobStatusArg>,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    Show(RunIdArgs),
    Abandon(RunAbandonArgs),
}

#[derive(Debug, Args)]
struct RunIdArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct RunAbandonArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UnmatchedStatusArg {
    Open,
    Resolved,
    Ignored,
}

impl From<UnmatchedStatusArg> for UnmatchedStatus {
    fn from(value: UnmatchedStatusArg) -> Self {
        match value {
            UnmatchedStatusArg::Open => Self::Open,
            UnmatchedStatusArg::Resolved => Self::Resolved,
            UnmatchedStatusArg::Ignored => Self::Ignored,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JobStatusArg {
    Pending,
    Matched,
    Failed,
}

impl From<JobStatusArg> for JobStatus {
    fn from(value: JobStatusArg) -> Self {
        match value {
            JobStatusArg::Pending => Self::Pending,
            JobStatusArg::Matched => Self::Matched,
            JobStatusArg::Failed => Self::Failed,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn parse_person_id(raw: &str) -> Result<PersonId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid person id: {raw}"))?;
    Ok(PersonId(parsed))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid run id: {raw}"))?;
    Ok(RunId(parsed))
}

fn parse_instant(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 instant: {raw}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        other => {
            let ledger = IdentityLedger::new(cli.db, load_config(cli.config.as_deref())?);
            run_ledger(other, &ledger)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize report")?)
        }
    }
}

fn run_ledger(command: Command, ledger: &IdentityLedger) -> Result<()> {
    match command {
        Command::Db { .. } => Err(anyhow!("db commands are handled before ledger dispatch")),
        Command::Source { command } => run_source(command, ledger),
        Command::Run(args) => {
            let report = ledger.run(&RunRequest {
                scope_from: parse_date(&args.from)?,
                scope_to: parse_date(&args.to)?,
                source_tables: args.tables,
                incremental: args.incremental,
            })?;
            emit_json(serde_json::to_value(&report).context("failed to serialize run report")?)
        }
        Command::Recover(args) => {
            let report = ledger.recover(args.limit)?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize recover report")?,
            )
        }
        Command::Person { command } => match command {
            PersonCommand::Show(args) => {
                let report = ledger.person(parse_person_id(&args.person_id)?)?;
                emit_json(
                    serde_json::to_value(&report).context("failed to serialize person report")?,
                )
            }
        },
        Command::Origin { command } => run_origin(*command, ledger),
        Command::Unmatched { command } => match command {
            UnmatchedCommand::List(args) => {
                let rows = ledger.unmatched_list(args.status.map(UnmatchedStatus::from))?;
                emit_json(serde_json::json!({ "unmatched": rows }))
            }
            UnmatchedCommand::Ignore(args) => {
                let ignored =
                    ledger.unmatched_ignore(&SourceKey::new(&args.table, &args.pk))?;
                emit_json(serde_json::json!({
                    "source_table": args.table,
                    "source_pk": args.pk,
                    "ignored": ignored
                }))
            }
        },
        Command::Alerts { command } => match command {
            AlertsCommand::List(args) => {
                let alerts = ledger.alerts_list(args.include_resolved)?;
                emit_json(serde_json::json!({ "alerts": alerts }))
            }
            AlertsCommand::Mute(args) => {
                let muted = ledger
                    .alert_mute(parse_person_id(&args.person_id)?, parse_instant(&args.until)?)?;
                emit_json(serde_json::json!({
                    "person_id": args.person_id,
                    "muted": muted,
                    "muted_until": args.until
                }))
            }
            AlertsCommand::Resolve(args) => {
                let resolved =
                    ledger.alert_resolve(parse_person_id(&args.person_id)?, &args.note)?;
                emit_json(serde_json::json!({
                    "person_id": args.person_id,
                    "resolved": resolved
                }))
            }
        },
        Command::Jobs(args) => {
            let jobs = ledger.jobs_list(args.status.map(JobStatus::from))?;
            emit_json(serde_json::json!({ "jobs": jobs }))
        }
        Command::Runs { command } => match command {
            RunsCommand::Show(args) => {
                let run = ledger.run_show(parse_run_id(&args.run_id)?)?;
                emit_json(serde_json::to_value(&run).context("failed to serialize run row")?)
            }
            RunsCommand::Abandon(args) => {
                let abandoned = ledger.run_abandon(parse_run_id(&args.run_id)?, &args.reason)?;
                emit_json(serde_json::json!({
                    "run_id": args.run_id,
                    "abandoned": abandoned
                }))
            }
        },
    }
}

fn run_source(command: SourceCommand, ledger: &IdentityLedger) -> Result<()> {
    match command {
        SourceCommand::Add(args) => {
            ledger.add_source_record(&AddSourceRecordRequest {
                source_table: args.table.clone(),
                source_pk: args.pk.clone(),
                record_date: args.record_date,
                phone: args.phone,
                license: args.license,
                plate: args.plate,
                name: args.name,
                partition: args.partition,
            })?;
            emit_json(serde_json::json!({
                "source_table": args.table,
                "source_pk": args.pk,
                "staged": true
            }))
        }
        SourceCommand::Link(args) => {
            let link = ledger.link_for(&SourceKey::new(&args.table, &args.pk))?;
            match link {
                Some(link) => emit_json(serde_json::json!({ "link": link })),
                None => emit_json(serde_json::json!({
                    "link": Value::Null,
                    "source_table": args.table,
                    "source_pk": args.pk
                })),
            }
        }
    }
}

fn run_origin(command: OriginCommand, ledger: &IdentityLedger) -> Result<()> {
    match command {
        OriginCommand::Show(args) => {
            let report = ledger.origin(parse_person_id(&args.person_id)?)?;
            emit_json(serde_json::to_value(&report).context("failed to serialize origin report")?)
        }
        OriginCommand::Override(args) => {
            let row = ledger.origin_override(&OriginOverrideRequest {
                person_id: parse_person_id(&args.person_id)?,
                origin_tag: args.origin_tag,
                source_table: args.source_table,
                source_pk: args.source_pk,
                reason: args.reason,
                operator: args.operator,
            })?;
            emit_json(serde_json::to_value(&row).context("failed to serialize origin row")?)
        }
        OriginCommand::MarkLegacy(args) => {
            let row = ledger.origin_mark_legacy(
                parse_person_id(&args.person_id)?,
                &args.reason,
                &args.operator,
            )?;
            emit_json(serde_json::to_value(&row).context("failed to serialize origin row")?)
        }
        OriginCommand::Discard(args) => {
            let row = ledger.origin_discard(
                parse_person_id(&args.person_id)?,
                &args.reason,
                &args.operator,
            )?;
            emit_json(serde_json::to_value(&row).context("failed to serialize origin row")?)
        }
    }
}
