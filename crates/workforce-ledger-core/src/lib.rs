#![forbid(unsafe_code)]
//! Derived-state aggregation and audit engine for the workforce console.
//!
//! The crate owns the record collections (portfolios, training sessions, terminations,
//! headcount snapshots, monitoring months, quality audits and friends), keeps portfolio
//! rollups consistent with the training sessions that feed them, and appends one
//! [`ActivityLogEntry`] per mutation. Durability is delegated to a [`CollectionStore`].
//!
//! The entry point is [`Ledger`]:
//! - [`Ledger::open`] loads every collection from a store.
//! - [`Ledger::insert`], [`Ledger::update`], [`Ledger::delete`] and [`Ledger::import_batch`]
//!   mutate any [`Record`] kind.
//! - the statistics functions in [`stats`] are pure and also exposed on the ledger.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod activity;
mod aggregate;
mod engine;
mod model;
mod persist;
mod record;
pub mod stats;

pub use activity::{
    ActionKind, ActivityFilter, ActivityLog, ActivityLogEntry, FieldChange, NewActivity,
    BULK_ENTITY_ID,
};
pub use aggregate::{completion_rate, rollup_for, PortfolioRollup, RollupDrift};
pub use engine::{Ledger, ACTIVITY_LOG_KEY};
pub use model::{
    Agent, AgentDraft, AgentPatch, DailyHeadcount, DailyHeadcountDraft, DailyHeadcountPatch,
    EntityKind, MonitoringMonth, MonitoringMonthDraft, MonitoringMonthPatch, MonitoringWeek,
    MonitoringWeekDraft, MonitoringWeekPatch, Operator, OperatorDraft, OperatorPatch, Portfolio,
    PortfolioDailyStat, PortfolioDailyStatDraft, PortfolioDailyStatPatch, PortfolioDraft,
    PortfolioPatch, QualityAuditDraft, QualityAuditEntry, QualityAuditPatch, Section,
    SessionStatus, Termination, TerminationDraft, TerminationPatch, TrainingSession,
    TrainingSessionDraft, TrainingSessionPatch,
};
pub use persist::{CollectionStore, LoadDiagnostic, MemoryCollectionStore};
pub use record::{Collections, Record, RecordStore};
pub use stats::Period;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: RecordId },
    #[error("monitoring week {week_id} not found in month {month_id}")]
    WeekNotFound { month_id: RecordId, week_id: u32 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("identifier generator exhausted for the current millisecond")]
    IdExhausted,
    #[error("persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub Ulid);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid record id {value}: {err}")))
    }
}

/// Monotonic ULID source shared by every collection and the activity log.
///
/// Two ids generated within the same millisecond still compare in generation order.
pub struct IdGenerator {
    inner: ulid::Generator,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ulid::Generator::new(),
        }
    }

    /// Produces the next identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::IdExhausted`] when the random component overflows within a
    /// single millisecond.
    pub fn next_id(&mut self) -> Result<RecordId, LedgerError> {
        self.inner
            .generate()
            .map(RecordId)
            .map_err(|_| LedgerError::IdExhausted)
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses a calendar date written as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the value is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, LedgerError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(value, &format)
        .map_err(|err| LedgerError::Validation(format!("invalid date {value}: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
