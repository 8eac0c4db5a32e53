//! Command surface for the workforce ledger.
//!
//! Hosts embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an already opened [`Ledger`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use workforce_ledger_core::{
    format_rfc3339, parse_date, ActionKind, ActivityFilter, ActivityLogEntry, Agent,
    DailyHeadcount, EntityKind, Ledger, LedgerError, LoadDiagnostic, MonitoringMonth,
    MonitoringWeekDraft, MonitoringWeekPatch, Operator, Period, Portfolio, PortfolioDailyStat,
    PortfolioRollup, QualityAuditEntry, Record, RecordId, RollupDrift, Section, Termination,
    TrainingSession,
};
use workforce_ledger_store_sqlite::{SqliteCollectionStore, StoredCollection};

/// Filter value that selects every entry, as accepted by the audit filters.
pub const ALL_SENTINEL: &str = "all";

pub type SqliteLedger = Ledger<SqliteCollectionStore>;

#[derive(Debug, Parser)]
#[command(name = "wl")]
#[command(about = "Workforce Ledger CLI")]
pub struct Cli {
    #[arg(long, env = "WL_DB", default_value = "./workforce_ledger.sqlite3")]
    db: PathBuf,

    /// Name recorded as the author of every mutation.
    #[arg(long, env = "WL_ACTOR", default_value = "sistema")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Monitoring {
        #[command(subcommand)]
        command: Box<MonitoringCommand>,
    },
    Stats {
        #[command(subcommand)]
        command: Box<StatsCommand>,
    },
    Portfolio {
        #[command(subcommand)]
        command: Box<PortfolioCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Diagnostics,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Add(RecordAddArgs),
    Update(RecordUpdateArgs),
    Delete(RecordIdArgs),
    List(RecordListArgs),
    Import(RecordImportArgs),
}

#[derive(Debug, Args)]
pub struct RecordAddArgs {
    #[arg(long)]
    kind: KindArg,
    /// Draft fields as a JSON object.
    #[arg(long)]
    data: String,
}

#[derive(Debug, Args)]
pub struct RecordUpdateArgs {
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    id: String,
    /// Fields to change as a JSON object; omitted fields keep their value.
    #[arg(long)]
    data: String,
}

#[derive(Debug, Args)]
pub struct RecordIdArgs {
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct RecordListArgs {
    #[arg(long)]
    kind: KindArg,
}

#[derive(Debug, Args)]
pub struct RecordImportArgs {
    #[arg(long)]
    kind: KindArg,
    /// JSON file holding an array of drafts.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum MonitoringCommand {
    AddWeek(MonitoringAddWeekArgs),
    UpdateWeek(MonitoringUpdateWeekArgs),
    RemoveWeek(MonitoringWeekRefArgs),
}

#[derive(Debug, Args)]
pub struct MonitoringAddWeekArgs {
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u8,
    #[arg(long, default_value = "")]
    label: String,
    #[arg(long)]
    conforme: u32,
    #[arg(long)]
    inconforme: u32,
}

#[derive(Debug, Args)]
pub struct MonitoringUpdateWeekArgs {
    #[arg(long)]
    month_id: String,
    #[arg(long)]
    week_id: u32,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    conforme: Option<u32>,
    #[arg(long)]
    inconforme: Option<u32>,
}

#[derive(Debug, Args)]
pub struct MonitoringWeekRefArgs {
    #[arg(long)]
    month_id: String,
    #[arg(long)]
    week_id: u32,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Monitoring(PeriodArgs),
    Tia(PeriodArgs),
    Terminations(PeriodArgs),
    Headcount(HeadcountArgs),
    Attendance(AttendanceArgs),
}

/// Calendar month filter; omit both flags to aggregate over all time.
#[derive(Debug, Args)]
pub struct PeriodArgs {
    #[arg(long, requires = "month")]
    year: Option<i32>,
    /// 1 (January) through 12.
    #[arg(long, requires = "year")]
    month: Option<u8>,
}

#[derive(Debug, Args)]
pub struct HeadcountArgs {
    /// Only snapshots of this day (YYYY-MM-DD).
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    section: Option<SectionArg>,
}

#[derive(Debug, Args)]
pub struct AttendanceArgs {
    #[command(flatten)]
    period: PeriodArgs,
    #[arg(long)]
    portfolio: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PortfolioCommand {
    Check(JsonArgs),
    Rebuild,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List(AuditListArgs),
    Export(AuditExportArgs),
    Clear(AuditClearArgs),
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    /// First UTC day to include (YYYY-MM-DD).
    #[arg(long)]
    from: Option<String>,
    /// Last UTC day to include (YYYY-MM-DD).
    #[arg(long)]
    to: Option<String>,
    #[arg(long = "by")]
    actor: Option<String>,
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AuditExportArgs {
    /// Destination file; stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AuditClearArgs {
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Portfolio,
    TrainingSession,
    Termination,
    DailyHeadcount,
    PortfolioDailyStat,
    Operator,
    Agent,
    MonitoringMonth,
    QualityAudit,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SectionArg {
    Cashier,
    Collections,
}

/// Expands `$handler::<R>(args..)` for the record type behind an [`EntityKind`].
macro_rules! dispatch_kind {
    ($kind:expr, $handler:ident($($arg:expr),* $(,)?)) => {
        match $kind {
            EntityKind::Portfolio => $handler::<Portfolio>($($arg),*),
            EntityKind::TrainingSession => $handler::<TrainingSession>($($arg),*),
            EntityKind::Termination => $handler::<Termination>($($arg),*),
            EntityKind::DailyHeadcount => $handler::<DailyHeadcount>($($arg),*),
            EntityKind::PortfolioDailyStat => $handler::<PortfolioDailyStat>($($arg),*),
            EntityKind::Operator => $handler::<Operator>($($arg),*),
            EntityKind::Agent => $handler::<Agent>($($arg),*),
            EntityKind::MonitoringMonth => $handler::<MonitoringMonth>($($arg),*),
            EntityKind::QualityAudit => $handler::<QualityAuditEntry>($($arg),*),
        }
    };
}

/// Caller-side checks run before anything reaches the ledger: drafts on insert and
/// import, the patched record on update.
trait CheckedDraft: Record {
    fn check_draft(_draft: &Self::Draft) -> Result<(), LedgerError> {
        Ok(())
    }

    fn check_record(_record: &Self) -> Result<(), LedgerError> {
        Ok(())
    }
}

impl CheckedDraft for Portfolio {
    fn check_draft(draft: &Self::Draft) -> Result<(), LedgerError> {
        draft.validate()
    }

    fn check_record(record: &Self) -> Result<(), LedgerError> {
        record.validate()
    }
}

impl CheckedDraft for TrainingSession {
    fn check_draft(draft: &Self::Draft) -> Result<(), LedgerError> {
        draft.validate()
    }

    fn check_record(record: &Self) -> Result<(), LedgerError> {
        record.validate()
    }
}

impl CheckedDraft for DailyHeadcount {
    fn check_draft(draft: &Self::Draft) -> Result<(), LedgerError> {
        draft.validate()
    }

    fn check_record(record: &Self) -> Result<(), LedgerError> {
        record.validate()
    }
}

impl CheckedDraft for PortfolioDailyStat {
    fn check_draft(draft: &Self::Draft) -> Result<(), LedgerError> {
        draft.validate()
    }

    fn check_record(record: &Self) -> Result<(), LedgerError> {
        record.validate()
    }
}

impl CheckedDraft for Termination {}
impl CheckedDraft for Operator {}
impl CheckedDraft for Agent {}
impl CheckedDraft for MonitoringMonth {}
impl CheckedDraft for QualityAuditEntry {}

#[derive(Debug, Serialize)]
struct DiagnosticsReport<'a> {
    db: String,
    schema_version: Option<i64>,
    stored_collections: Vec<StoredCollection>,
    load_diagnostics: &'a [LoadDiagnostic],
    pending_writes: Vec<&'static str>,
    record_counts: BTreeMap<&'static str, usize>,
    activity_entries: usize,
    rollup_drift: usize,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, when the command fails,
/// or when the resulting changes cannot be persisted.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, &cli.actor, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails, the command fails, or pending writes
/// cannot be flushed.
pub fn run_with_db(db_path: &Path, actor: &str, command: Command) -> Result<()> {
    let store = SqliteCollectionStore::open(db_path)?;
    store.migrate()?;
    let mut ledger = Ledger::open(store);
    if !ledger.diagnostics().is_empty() {
        warn!(
            count = ledger.diagnostics().len(),
            "some collections could not be restored; run `wl diagnostics` for details"
        );
    }

    run_command(command, &mut ledger, actor, db_path)?;
    ledger
        .flush()
        .context("failed to persist ledger changes")
}

/// Executes a parsed command against an already opened ledger.
///
/// # Errors
/// Returns an error when argument parsing, validation or the ledger operation fails.
pub fn run_command(
    command: Command,
    ledger: &mut SqliteLedger,
    actor: &str,
    db_path: &Path,
) -> Result<()> {
    match command {
        Command::Record { command } => run_record(*command, ledger, actor),
        Command::Monitoring { command } => run_monitoring(*command, ledger, actor),
        Command::Stats { command } => run_stats(*command, ledger),
        Command::Portfolio { command } => run_portfolio(*command, ledger, actor),
        Command::Audit { command } => run_audit(*command, ledger),
        Command::Diagnostics => run_diagnostics(ledger, db_path),
    }
}

fn run_record(command: RecordCommand, ledger: &mut SqliteLedger, actor: &str) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            dispatch_kind!(map_kind(args.kind), add_record(ledger, actor, &args.data))
        }
        RecordCommand::Update(args) => {
            let id = parse_record_id(&args.id)?;
            dispatch_kind!(
                map_kind(args.kind),
                update_record(ledger, actor, id, &args.data)
            )
        }
        RecordCommand::Delete(args) => {
            let id = parse_record_id(&args.id)?;
            dispatch_kind!(map_kind(args.kind), delete_record(ledger, actor, id))
        }
        RecordCommand::List(args) => dispatch_kind!(map_kind(args.kind), list_records(ledger)),
        RecordCommand::Import(args) => {
            dispatch_kind!(map_kind(args.kind), import_records(ledger, actor, &args.file))
        }
    }
}

fn add_record<R: CheckedDraft>(ledger: &mut SqliteLedger, actor: &str, raw: &str) -> Result<()> {
    let draft: R::Draft = serde_json::from_str(raw)
        .with_context(|| format!("invalid {} draft JSON: {raw}", R::KIND))?;
    R::check_draft(&draft)?;
    let record = ledger.insert::<R>(actor, draft)?;
    print_json(&record)
}

fn update_record<R: CheckedDraft>(
    ledger: &mut SqliteLedger,
    actor: &str,
    id: RecordId,
    raw: &str,
) -> Result<()> {
    let patch: R::Patch = serde_json::from_str(raw)
        .with_context(|| format!("invalid {} patch JSON: {raw}", R::KIND))?;
    let mut candidate = ledger
        .get::<R>(id)
        .cloned()
        .ok_or(LedgerError::NotFound { kind: R::KIND, id })?;
    let _ = candidate.apply_patch(patch.clone());
    R::check_record(&candidate)?;

    let record = ledger.update::<R>(actor, id, patch)?;
    print_json(&record)
}

fn delete_record<R: Record>(ledger: &mut SqliteLedger, actor: &str, id: RecordId) -> Result<()> {
    let removed = ledger.delete::<R>(actor, id)?;
    print_json(&removed)
}

fn list_records<R: Record>(ledger: &SqliteLedger) -> Result<()> {
    print_json(&ledger.list::<R>())
}

fn import_records<R: CheckedDraft>(
    ledger: &mut SqliteLedger,
    actor: &str,
    path: &Path,
) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read import file {}", path.display()))?;
    let drafts: Vec<R::Draft> = serde_json::from_str(&raw).with_context(|| {
        format!(
            "import file {} must hold a JSON array of {} drafts",
            path.display(),
            R::KIND
        )
    })?;
    for (index, draft) in drafts.iter().enumerate() {
        R::check_draft(draft).with_context(|| format!("import row {index} rejected"))?;
    }

    let imported = ledger.import_batch::<R>(actor, drafts)?;
    info!(kind = %R::KIND, count = imported.len(), "import finished");
    print_json(&json!({
        "kind": R::KIND,
        "imported": imported.len(),
    }))
}

fn run_monitoring(
    command: MonitoringCommand,
    ledger: &mut SqliteLedger,
    actor: &str,
) -> Result<()> {
    let month = match command {
        MonitoringCommand::AddWeek(args) => ledger.record_monitoring_week(
            actor,
            Period::new(args.year, args.month)?,
            MonitoringWeekDraft {
                label: args.label,
                conforme: args.conforme,
                inconforme: args.inconforme,
            },
        )?,
        MonitoringCommand::UpdateWeek(args) => ledger.update_monitoring_week(
            actor,
            parse_record_id(&args.month_id)?,
            args.week_id,
            MonitoringWeekPatch {
                label: args.label,
                conforme: args.conforme,
                inconforme: args.inconforme,
            },
        )?,
        MonitoringCommand::RemoveWeek(args) => ledger.remove_monitoring_week(
            actor,
            parse_record_id(&args.month_id)?,
            args.week_id,
        )?,
    };
    print_json(&month)
}

fn run_stats(command: StatsCommand, ledger: &SqliteLedger) -> Result<()> {
    match command {
        StatsCommand::Monitoring(args) => print_json(&ledger.monitoring_stats(parse_period(&args)?)),
        StatsCommand::Tia(args) => print_json(&ledger.tia_stats(parse_period(&args)?)),
        StatsCommand::Terminations(args) => {
            print_json(&ledger.termination_stats(parse_period(&args)?))
        }
        StatsCommand::Headcount(args) => {
            let date = args.date.as_deref().map(parse_date).transpose()?;
            print_json(&ledger.headcount_summary(date, args.section.map(map_section)))
        }
        StatsCommand::Attendance(args) => print_json(
            &ledger.attendance_stats(parse_period(&args.period)?, args.portfolio.as_deref()),
        ),
    }
}

fn run_portfolio(command: PortfolioCommand, ledger: &mut SqliteLedger, actor: &str) -> Result<()> {
    match command {
        PortfolioCommand::Check(args) => {
            let drift = ledger.check_aggregates();
            if args.json {
                print_json(&drift)?;
            } else {
                print_drift_table(&drift);
            }
            if drift.is_empty() {
                Ok(())
            } else {
                Err(anyhow!(
                    "{} portfolio rollups are inconsistent; run `wl portfolio rebuild`",
                    drift.len()
                ))
            }
        }
        PortfolioCommand::Rebuild => {
            let repaired = ledger.rebuild_aggregates(actor)?;
            print_json(&json!({ "repaired": repaired }))
        }
    }
}

fn run_audit(command: AuditCommand, ledger: &mut SqliteLedger) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let filter = build_activity_filter(&args)?;
            let mut entries = ledger.query_activity(&filter);
            if let Some(limit) = args.limit {
                entries.truncate(limit);
            }
            if args.json {
                print_json(&entries)
            } else {
                print_activity_table(&entries)
            }
        }
        AuditCommand::Export(args) => {
            let exported = ledger.export_activity()?;
            match args.output {
                Some(path) => {
                    fs::write(&path, exported)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("exported {} entries to {}", ledger.activity().len(), path.display());
                }
                None => println!("{exported}"),
            }
            Ok(())
        }
        AuditCommand::Clear(args) => {
            if !args.yes {
                bail!("refusing to clear the activity log without --yes");
            }
            let removed = ledger.clear_activity()?;
            print_json(&json!({ "removed": removed }))
        }
    }
}

fn run_diagnostics(ledger: &SqliteLedger, db_path: &Path) -> Result<()> {
    let record_counts = EntityKind::ALL
        .into_iter()
        .map(|kind| (kind.collection_key(), dispatch_kind!(kind, record_count(ledger))))
        .collect();

    let report = DiagnosticsReport {
        db: db_path.display().to_string(),
        schema_version: ledger.store().schema_version()?,
        stored_collections: ledger.store().stored_collections()?,
        load_diagnostics: ledger.diagnostics(),
        pending_writes: ledger.pending_writes(),
        record_counts,
        activity_entries: ledger.activity().len(),
        rollup_drift: ledger.check_aggregates().len(),
    };
    print_json(&report)
}

fn record_count<R: Record>(ledger: &SqliteLedger) -> usize {
    ledger.list::<R>().len()
}

fn build_activity_filter(args: &AuditListArgs) -> Result<ActivityFilter> {
    let action = match filter_value(args.action.as_deref()) {
        Some(raw) => Some(
            ActionKind::parse(raw).ok_or_else(|| anyhow!("unknown action filter: {raw}"))?,
        ),
        None => None,
    };
    let entity_kind = match filter_value(args.kind.as_deref()) {
        Some(raw) => Some(
            EntityKind::parse(&raw.replace('-', "_"))
                .ok_or_else(|| anyhow!("unknown entity kind filter: {raw}"))?,
        ),
        None => None,
    };

    Ok(ActivityFilter {
        from: args.from.as_deref().map(parse_date).transpose()?,
        to: args.to.as_deref().map(parse_date).transpose()?,
        actor_name: filter_value(args.actor.as_deref()).map(str::to_string),
        action,
        entity_kind,
    })
}

/// Treats a missing value and the `all` sentinel alike.
fn filter_value(raw: Option<&str>) -> Option<&str> {
    raw.filter(|value| !value.is_empty() && *value != ALL_SENTINEL)
}

fn parse_period(args: &PeriodArgs) -> Result<Option<Period>> {
    Ok(Period::from_parts(args.year, args.month)?)
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    raw.parse::<RecordId>()
        .with_context(|| format!("invalid record id: {raw}"))
}

fn map_kind(value: KindArg) -> EntityKind {
    match value {
        KindArg::Portfolio => EntityKind::Portfolio,
        KindArg::TrainingSession => EntityKind::TrainingSession,
        KindArg::Termination => EntityKind::Termination,
        KindArg::DailyHeadcount => EntityKind::DailyHeadcount,
        KindArg::PortfolioDailyStat => EntityKind::PortfolioDailyStat,
        KindArg::Operator => EntityKind::Operator,
        KindArg::Agent => EntityKind::Agent,
        KindArg::MonitoringMonth => EntityKind::MonitoringMonth,
        KindArg::QualityAudit => EntityKind::QualityAudit,
    }
}

fn map_section(value: SectionArg) -> Section {
    match value {
        SectionArg::Cashier => Section::Cashier,
        SectionArg::Collections => Section::Collections,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_drift_table(drift: &[RollupDrift]) {
    if drift.is_empty() {
        println!("all portfolio rollups are consistent");
        return;
    }

    println!(
        "{:<26} {:<24} {:<20} expected",
        "portfolio_id", "name", "stored"
    );
    println!("{}", "-".repeat(96));
    for item in drift {
        println!(
            "{:<26} {:<24} {:<20} {}",
            item.portfolio_id,
            item.name,
            describe_rollup(&item.stored),
            describe_rollup(&item.expected)
        );
    }
}

fn describe_rollup(rollup: &PortfolioRollup) -> String {
    format!(
        "{}/{}/{} {:.1}%",
        rollup.total, rollup.applied, rollup.pending, rollup.completion_rate
    )
}

fn print_activity_table(entries: &[&ActivityLogEntry]) -> Result<()> {
    println!(
        "{:<20} {:<16} {:<7} {:<21} {:<26} detail",
        "timestamp", "actor", "action", "kind", "entity_id"
    );
    println!("{}", "-".repeat(120));
    for entry in entries {
        println!(
            "{:<20} {:<16} {:<7} {:<21} {:<26} {}",
            format_rfc3339(entry.timestamp)?,
            entry.actor_name,
            entry.action.as_str(),
            entry.entity_kind.as_str(),
            entry.entity_id,
            entry.detail
        );
    }
    Ok(())
}
