use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::activity::FieldChange;
use crate::aggregate::{PortfolioRollup, PORTFOLIO_ROLLUP_TRIGGERS, SESSION_ROLLUP_TRIGGERS};
use crate::record::{patch_field, Collections, Record, RecordStore};
use crate::{LedgerError, RecordId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
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

impl EntityKind {
    pub const ALL: [Self; 9] = [
        Self::Portfolio,
        Self::TrainingSession,
        Self::Termination,
        Self::DailyHeadcount,
        Self::PortfolioDailyStat,
        Self::Operator,
        Self::Agent,
        Self::MonitoringMonth,
        Self::QualityAudit,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Portfolio => "portfolio",
            Self::TrainingSession => "training_session",
            Self::Termination => "termination",
            Self::DailyHeadcount => "daily_headcount",
            Self::PortfolioDailyStat => "portfolio_daily_stat",
            Self::Operator => "operator",
            Self::Agent => "agent",
            Self::MonitoringMonth => "monitoring_month",
            Self::QualityAudit => "quality_audit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Key under which the collection is persisted.
    #[must_use]
    pub fn collection_key(self) -> &'static str {
        match self {
            Self::Portfolio => "portfolios",
            Self::TrainingSession => "training_sessions",
            Self::Termination => "terminations",
            Self::DailyHeadcount => "daily_headcounts",
            Self::PortfolioDailyStat => "portfolio_daily_stats",
            Self::Operator => "operators",
            Self::Agent => "agents",
            Self::MonitoringMonth => "monitoring_months",
            Self::QualityAudit => "quality_audits",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Portfolio => "portfolio",
            Self::TrainingSession => "training session",
            Self::Termination => "termination",
            Self::DailyHeadcount => "daily headcount",
            Self::PortfolioDailyStat => "portfolio attendance",
            Self::Operator => "operator",
            Self::Agent => "agent",
            Self::MonitoringMonth => "monitoring month",
            Self::QualityAudit => "quality audit",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Applied,
    Pending,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Cashier,
    Collections,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cashier => "cashier",
            Self::Collections => "collections",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cashier" => Some(Self::Cashier),
            "collections" => Some(Self::Collections),
            _ => None,
        }
    }
}

/// A named work queue ("carteira"). Rollup fields are owned by the recalculator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Portfolio {
    pub id: RecordId,
    pub name: String,
    pub total: u64,
    pub applied: u64,
    pub pending: u64,
    pub completion_rate: f64,
}

impl Portfolio {
    #[must_use]
    pub fn rollup(&self) -> PortfolioRollup {
        PortfolioRollup {
            total: self.total,
            applied: self.applied,
            pending: self.pending,
            completion_rate: self.completion_rate,
        }
    }

    /// Caller-side checks on a stored or patched portfolio.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a blank name.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_portfolio_name(&self.name)
    }

    pub(crate) fn set_rollup(&mut self, rollup: PortfolioRollup) {
        self.total = rollup.total;
        self.applied = rollup.applied;
        self.pending = rollup.pending;
        self.completion_rate = rollup.completion_rate;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortfolioDraft {
    pub name: String,
}

impl PortfolioDraft {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a blank name.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_portfolio_name(&self.name)
    }
}

fn validate_portfolio_name(name: &str) -> Result<(), LedgerError> {
    if name.trim().is_empty() {
        return Err(LedgerError::Validation(
            "portfolio name MUST be provided".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PortfolioPatch {
    pub name: Option<String>,
}

impl Record for Portfolio {
    type Draft = PortfolioDraft;
    type Patch = PortfolioPatch;

    const KIND: EntityKind = EntityKind::Portfolio;
    const ROLLUP_FIELDS: &'static [&'static str] = PORTFOLIO_ROLLUP_TRIGGERS;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: PortfolioDraft) -> Self {
        Self {
            id,
            name: draft.name,
            total: 0,
            applied: 0,
            pending: 0,
            completion_rate: 0.0,
        }
    }

    fn apply_patch(&mut self, patch: PortfolioPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "name", &mut self.name, patch.name);
        changes
    }

    fn summary(&self) -> String {
        format!("portfolio {}", self.name)
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.name.is_empty() {
            return Err(LedgerError::Validation(
                "portfolio name MUST NOT be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn conflicts_with(&self, other: &Self) -> Option<String> {
        (self.name == other.name).then(|| format!("portfolio {} already exists", self.name))
    }

    fn portfolio_ref(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.portfolios
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.portfolios
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSession {
    pub id: RecordId,
    pub quantity: u32,
    pub shift: String,
    pub portfolio_name: String,
    pub date: Date,
    pub responsible: String,
    pub status: SessionStatus,
    pub subject: String,
    pub duration_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrainingSessionDraft {
    pub quantity: u32,
    pub shift: String,
    pub portfolio_name: String,
    pub date: Date,
    pub responsible: String,
    pub status: SessionStatus,
    pub subject: String,
    pub duration_hours: f64,
}

impl TrainingSessionDraft {
    /// Caller-side checks before an insert.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a zero quantity, a blank portfolio or a
    /// negative/non-finite duration.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_session(self.quantity, &self.portfolio_name, self.duration_hours)
    }
}

impl TrainingSession {
    /// Same rules as [`TrainingSessionDraft::validate`], applied to a stored or patched
    /// session.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a field is out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_session(self.quantity, &self.portfolio_name, self.duration_hours)
    }
}

fn validate_session(
    quantity: u32,
    portfolio_name: &str,
    duration_hours: f64,
) -> Result<(), LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::Validation(
            "quantity MUST be >= 1".to_string(),
        ));
    }
    if portfolio_name.trim().is_empty() {
        return Err(LedgerError::Validation(
            "portfolio_name MUST be provided".to_string(),
        ));
    }
    if !duration_hours.is_finite() || duration_hours < 0.0 {
        return Err(LedgerError::Validation(
            "duration_hours MUST be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingSessionPatch {
    pub quantity: Option<u32>,
    pub shift: Option<String>,
    pub portfolio_name: Option<String>,
    pub date: Option<Date>,
    pub responsible: Option<String>,
    pub status: Option<SessionStatus>,
    pub subject: Option<String>,
    pub duration_hours: Option<f64>,
}

impl Record for TrainingSession {
    type Draft = TrainingSessionDraft;
    type Patch = TrainingSessionPatch;

    const KIND: EntityKind = EntityKind::TrainingSession;
    const ROLLUP_FIELDS: &'static [&'static str] = SESSION_ROLLUP_TRIGGERS;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: TrainingSessionDraft) -> Self {
        Self {
            id,
            quantity: draft.quantity,
            shift: draft.shift,
            portfolio_name: draft.portfolio_name,
            date: draft.date,
            responsible: draft.responsible,
            status: draft.status,
            subject: draft.subject,
            duration_hours: draft.duration_hours,
        }
    }

    fn apply_patch(&mut self, patch: TrainingSessionPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "quantity", &mut self.quantity, patch.quantity);
        patch_field(&mut changes, "shift", &mut self.shift, patch.shift);
        patch_field(
            &mut changes,
            "portfolio_name",
            &mut self.portfolio_name,
            patch.portfolio_name,
        );
        patch_field(&mut changes, "date", &mut self.date, patch.date);
        patch_field(
            &mut changes,
            "responsible",
            &mut self.responsible,
            patch.responsible,
        );
        patch_field(&mut changes, "status", &mut self.status, patch.status);
        patch_field(&mut changes, "subject", &mut self.subject, patch.subject);
        patch_field(
            &mut changes,
            "duration_hours",
            &mut self.duration_hours,
            patch.duration_hours,
        );
        changes
    }

    fn summary(&self) -> String {
        format!(
            "training session {} for {} ({} operators, {})",
            self.subject,
            self.portfolio_name,
            self.quantity,
            self.status.as_str()
        )
    }

    fn portfolio_ref(&self) -> Option<&str> {
        Some(&self.portfolio_name)
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.training_sessions
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.training_sessions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Termination {
    pub id: RecordId,
    pub employee_name: String,
    pub portfolio: String,
    pub shift: String,
    pub date: Date,
    pub reason: String,
    pub has_notice_period: bool,
    pub responsible: String,
    pub came_from_agency: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TerminationDraft {
    pub employee_name: String,
    pub portfolio: String,
    pub shift: String,
    pub date: Date,
    pub reason: String,
    pub has_notice_period: bool,
    pub responsible: String,
    pub came_from_agency: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TerminationPatch {
    pub employee_name: Option<String>,
    pub portfolio: Option<String>,
    pub shift: Option<String>,
    pub date: Option<Date>,
    pub reason: Option<String>,
    pub has_notice_period: Option<bool>,
    pub responsible: Option<String>,
    pub came_from_agency: Option<bool>,
    pub notes: Option<String>,
}

impl Record for Termination {
    type Draft = TerminationDraft;
    type Patch = TerminationPatch;

    const KIND: EntityKind = EntityKind::Termination;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: TerminationDraft) -> Self {
        Self {
            id,
            employee_name: draft.employee_name,
            portfolio: draft.portfolio,
            shift: draft.shift,
            date: draft.date,
            reason: draft.reason,
            has_notice_period: draft.has_notice_period,
            responsible: draft.responsible,
            came_from_agency: draft.came_from_agency,
            notes: draft.notes,
        }
    }

    fn apply_patch(&mut self, patch: TerminationPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(
            &mut changes,
            "employee_name",
            &mut self.employee_name,
            patch.employee_name,
        );
        patch_field(&mut changes, "portfolio", &mut self.portfolio, patch.portfolio);
        patch_field(&mut changes, "shift", &mut self.shift, patch.shift);
        patch_field(&mut changes, "date", &mut self.date, patch.date);
        patch_field(&mut changes, "reason", &mut self.reason, patch.reason);
        patch_field(
            &mut changes,
            "has_notice_period",
            &mut self.has_notice_period,
            patch.has_notice_period,
        );
        patch_field(
            &mut changes,
            "responsible",
            &mut self.responsible,
            patch.responsible,
        );
        patch_field(
            &mut changes,
            "came_from_agency",
            &mut self.came_from_agency,
            patch.came_from_agency,
        );
        patch_field(&mut changes, "notes", &mut self.notes, patch.notes);
        changes
    }

    fn summary(&self) -> String {
        format!(
            "termination of {} ({}, {})",
            self.employee_name, self.portfolio, self.reason
        )
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.terminations
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.terminations
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyHeadcount {
    pub id: RecordId,
    pub date: Date,
    pub shift: String,
    pub total: u32,
    pub active: u32,
    pub on_vacation: u32,
    pub on_leave: u32,
    pub missing: u32,
    pub on_disability_insurance: u32,
    pub section: Section,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DailyHeadcountDraft {
    pub date: Date,
    pub shift: String,
    pub total: u32,
    pub active: u32,
    pub on_vacation: u32,
    pub on_leave: u32,
    pub missing: u32,
    pub on_disability_insurance: u32,
    pub section: Section,
}

impl DailyHeadcountDraft {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `total` differs from the sum of the buckets.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_headcount_total(
            self.total,
            [
                self.active,
                self.on_vacation,
                self.on_leave,
                self.missing,
                self.on_disability_insurance,
            ],
        )
    }
}

impl DailyHeadcount {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `total` differs from the sum of the buckets.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_headcount_total(
            self.total,
            [
                self.active,
                self.on_vacation,
                self.on_leave,
                self.missing,
                self.on_disability_insurance,
            ],
        )
    }
}

fn validate_headcount_total(total: u32, buckets: [u32; 5]) -> Result<(), LedgerError> {
    let sum: u64 = buckets.iter().copied().map(u64::from).sum();
    if u64::from(total) != sum {
        return Err(LedgerError::Validation(format!(
            "total ({total}) MUST equal active + on_vacation + on_leave + missing + on_disability_insurance ({sum})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DailyHeadcountPatch {
    pub date: Option<Date>,
    pub shift: Option<String>,
    pub total: Option<u32>,
    pub active: Option<u32>,
    pub on_vacation: Option<u32>,
    pub on_leave: Option<u32>,
    pub missing: Option<u32>,
    pub on_disability_insurance: Option<u32>,
    pub section: Option<Section>,
}

impl Record for DailyHeadcount {
    type Draft = DailyHeadcountDraft;
    type Patch = DailyHeadcountPatch;

    const KIND: EntityKind = EntityKind::DailyHeadcount;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: DailyHeadcountDraft) -> Self {
        Self {
            id,
            date: draft.date,
            shift: draft.shift,
            total: draft.total,
            active: draft.active,
            on_vacation: draft.on_vacation,
            on_leave: draft.on_leave,
            missing: draft.missing,
            on_disability_insurance: draft.on_disability_insurance,
            section: draft.section,
        }
    }

    fn apply_patch(&mut self, patch: DailyHeadcountPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "date", &mut self.date, patch.date);
        patch_field(&mut changes, "shift", &mut self.shift, patch.shift);
        patch_field(&mut changes, "total", &mut self.total, patch.total);
        patch_field(&mut changes, "active", &mut self.active, patch.active);
        patch_field(
            &mut changes,
            "on_vacation",
            &mut self.on_vacation,
            patch.on_vacation,
        );
        patch_field(&mut changes, "on_leave", &mut self.on_leave, patch.on_leave);
        patch_field(&mut changes, "missing", &mut self.missing, patch.missing);
        patch_field(
            &mut changes,
            "on_disability_insurance",
            &mut self.on_disability_insurance,
            patch.on_disability_insurance,
        );
        patch_field(&mut changes, "section", &mut self.section, patch.section);
        changes
    }

    fn summary(&self) -> String {
        format!(
            "headcount {} {} {} ({} total, {} active)",
            self.date,
            self.section.as_str(),
            self.shift,
            self.total,
            self.active
        )
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.daily_headcounts
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.daily_headcounts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortfolioDailyStat {
    pub id: RecordId,
    pub date: Date,
    pub portfolio: String,
    pub shift: String,
    pub total: u32,
    pub present: u32,
    pub absent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortfolioDailyStatDraft {
    pub date: Date,
    pub portfolio: String,
    pub shift: String,
    pub total: u32,
    pub present: u32,
    pub absent: u32,
}

impl PortfolioDailyStatDraft {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `total != present + absent`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_attendance_total(self.total, self.present, self.absent)
    }
}

impl PortfolioDailyStat {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `total != present + absent`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_attendance_total(self.total, self.present, self.absent)
    }
}

fn validate_attendance_total(total: u32, present: u32, absent: u32) -> Result<(), LedgerError> {
    if u64::from(total) != u64::from(present) + u64::from(absent) {
        return Err(LedgerError::Validation(format!(
            "total ({total}) MUST equal present ({present}) + absent ({absent})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PortfolioDailyStatPatch {
    pub date: Option<Date>,
    pub portfolio: Option<String>,
    pub shift: Option<String>,
    pub total: Option<u32>,
    pub present: Option<u32>,
    pub absent: Option<u32>,
}

impl Record for PortfolioDailyStat {
    type Draft = PortfolioDailyStatDraft;
    type Patch = PortfolioDailyStatPatch;

    const KIND: EntityKind = EntityKind::PortfolioDailyStat;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: PortfolioDailyStatDraft) -> Self {
        Self {
            id,
            date: draft.date,
            portfolio: draft.portfolio,
            shift: draft.shift,
            total: draft.total,
            present: draft.present,
            absent: draft.absent,
        }
    }

    fn apply_patch(&mut self, patch: PortfolioDailyStatPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "date", &mut self.date, patch.date);
        patch_field(&mut changes, "portfolio", &mut self.portfolio, patch.portfolio);
        patch_field(&mut changes, "shift", &mut self.shift, patch.shift);
        patch_field(&mut changes, "total", &mut self.total, patch.total);
        patch_field(&mut changes, "present", &mut self.present, patch.present);
        patch_field(&mut changes, "absent", &mut self.absent, patch.absent);
        changes
    }

    fn summary(&self) -> String {
        format!(
            "attendance {} {} {} ({}/{} present)",
            self.date, self.portfolio, self.shift, self.present, self.total
        )
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.portfolio_daily_stats
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.portfolio_daily_stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operator {
    pub id: RecordId,
    pub name: String,
    pub registration: String,
    pub portfolio: String,
    pub shift: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OperatorDraft {
    pub name: String,
    pub registration: String,
    pub portfolio: String,
    pub shift: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorPatch {
    pub name: Option<String>,
    pub registration: Option<String>,
    pub portfolio: Option<String>,
    pub shift: Option<String>,
    pub active: Option<bool>,
}

impl Record for Operator {
    type Draft = OperatorDraft;
    type Patch = OperatorPatch;

    const KIND: EntityKind = EntityKind::Operator;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: OperatorDraft) -> Self {
        Self {
            id,
            name: draft.name,
            registration: draft.registration,
            portfolio: draft.portfolio,
            shift: draft.shift,
            active: draft.active,
        }
    }

    fn apply_patch(&mut self, patch: OperatorPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "name", &mut self.name, patch.name);
        patch_field(
            &mut changes,
            "registration",
            &mut self.registration,
            patch.registration,
        );
        patch_field(&mut changes, "portfolio", &mut self.portfolio, patch.portfolio);
        patch_field(&mut changes, "shift", &mut self.shift, patch.shift);
        patch_field(&mut changes, "active", &mut self.active, patch.active);
        changes
    }

    fn summary(&self) -> String {
        format!("operator {} ({})", self.name, self.registration)
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.operators
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.operators
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: RecordId,
    pub name: String,
    pub username: String,
    pub section: Section,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentDraft {
    pub name: String,
    pub username: String,
    pub section: Section,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub username: Option<String>,
    pub section: Option<Section>,
    pub active: Option<bool>,
}

impl Record for Agent {
    type Draft = AgentDraft;
    type Patch = AgentPatch;

    const KIND: EntityKind = EntityKind::Agent;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: AgentDraft) -> Self {
        Self {
            id,
            name: draft.name,
            username: draft.username,
            section: draft.section,
            active: draft.active,
        }
    }

    fn apply_patch(&mut self, patch: AgentPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "name", &mut self.name, patch.name);
        patch_field(&mut changes, "username", &mut self.username, patch.username);
        patch_field(&mut changes, "section", &mut self.section, patch.section);
        patch_field(&mut changes, "active", &mut self.active, patch.active);
        changes
    }

    fn summary(&self) -> String {
        format!("agent {} ({})", self.name, self.username)
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.agents
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.agents
    }
}

fn default_active() -> bool {
    true
}

/// One labelled batch of monitoring outcomes. Ids are local to their month.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringWeek {
    pub id: u32,
    #[serde(default)]
    pub label: String,
    pub conforme: u32,
    pub inconforme: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitoringWeekDraft {
    #[serde(default)]
    pub label: String,
    pub conforme: u32,
    pub inconforme: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringWeekPatch {
    pub label: Option<String>,
    pub conforme: Option<u32>,
    pub inconforme: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringMonth {
    pub id: RecordId,
    pub year: i32,
    /// Calendar month, 1 (January) through 12.
    pub month: u8,
    pub weeks: Vec<MonitoringWeek>,
}

impl MonitoringMonth {
    #[must_use]
    pub fn next_week_id(&self) -> u32 {
        self.weeks.iter().map(|week| week.id).max().unwrap_or(0) + 1
    }

    #[must_use]
    pub fn conforme_total(&self) -> u64 {
        self.weeks.iter().map(|week| u64::from(week.conforme)).sum()
    }

    #[must_use]
    pub fn inconforme_total(&self) -> u64 {
        self.weeks.iter().map(|week| u64::from(week.inconforme)).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitoringMonthDraft {
    pub year: i32,
    pub month: u8,
    #[serde(default)]
    pub weeks: Vec<MonitoringWeekDraft>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringMonthPatch {
    pub year: Option<i32>,
    pub month: Option<u8>,
    pub weeks: Option<Vec<MonitoringWeek>>,
}

impl Record for MonitoringMonth {
    type Draft = MonitoringMonthDraft;
    type Patch = MonitoringMonthPatch;

    const KIND: EntityKind = EntityKind::MonitoringMonth;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: MonitoringMonthDraft) -> Self {
        let weeks = (1_u32..)
            .zip(draft.weeks)
            .map(|(week_id, week)| MonitoringWeek {
                id: week_id,
                label: week.label,
                conforme: week.conforme,
                inconforme: week.inconforme,
            })
            .collect();
        Self {
            id,
            year: draft.year,
            month: draft.month,
            weeks,
        }
    }

    fn apply_patch(&mut self, patch: MonitoringMonthPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "year", &mut self.year, patch.year);
        patch_field(&mut changes, "month", &mut self.month, patch.month);
        patch_field(&mut changes, "weeks", &mut self.weeks, patch.weeks);
        changes
    }

    fn summary(&self) -> String {
        format!(
            "monitoring {}-{:02} ({} weeks)",
            self.year,
            self.month,
            self.weeks.len()
        )
    }

    fn check(&self) -> Result<(), LedgerError> {
        if !(1..=12).contains(&self.month) {
            return Err(LedgerError::Validation(format!(
                "month MUST be in 1..=12, got {}",
                self.month
            )));
        }
        let mut seen = BTreeSet::new();
        for week in &self.weeks {
            if week.id == 0 || !seen.insert(week.id) {
                return Err(LedgerError::Validation(format!(
                    "monitoring {}-{:02} week id {} MUST be unique and >= 1",
                    self.year, self.month, week.id
                )));
            }
        }
        Ok(())
    }

    fn conflicts_with(&self, other: &Self) -> Option<String> {
        (self.year == other.year && self.month == other.month).then(|| {
            format!(
                "monitoring month {}-{:02} already exists",
                self.year, self.month
            )
        })
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.monitoring_months
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.monitoring_months
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityAuditEntry {
    pub id: RecordId,
    pub date: Date,
    pub analisados: u32,
    pub quantidade: u32,
    pub total_percent: f64,
}

impl QualityAuditEntry {
    #[must_use]
    pub fn percent_of(analisados: u32, quantidade: u32) -> f64 {
        if quantidade == 0 {
            return 0.0;
        }
        f64::from(analisados) / f64::from(quantidade) * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QualityAuditDraft {
    pub date: Date,
    pub analisados: u32,
    pub quantidade: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QualityAuditPatch {
    pub date: Option<Date>,
    pub analisados: Option<u32>,
    pub quantidade: Option<u32>,
}

impl Record for QualityAuditEntry {
    type Draft = QualityAuditDraft;
    type Patch = QualityAuditPatch;

    const KIND: EntityKind = EntityKind::QualityAudit;

    fn id(&self) -> RecordId {
        self.id
    }

    fn from_draft(id: RecordId, draft: QualityAuditDraft) -> Self {
        Self {
            id,
            date: draft.date,
            analisados: draft.analisados,
            quantidade: draft.quantidade,
            total_percent: Self::percent_of(draft.analisados, draft.quantidade),
        }
    }

    fn apply_patch(&mut self, patch: QualityAuditPatch) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        patch_field(&mut changes, "date", &mut self.date, patch.date);
        patch_field(
            &mut changes,
            "analisados",
            &mut self.analisados,
            patch.analisados,
        );
        patch_field(
            &mut changes,
            "quantidade",
            &mut self.quantidade,
            patch.quantidade,
        );
        let percent = Self::percent_of(self.analisados, self.quantidade);
        patch_field(
            &mut changes,
            "total_percent",
            &mut self.total_percent,
            Some(percent),
        );
        changes
    }

    fn summary(&self) -> String {
        format!(
            "quality audit {} ({}/{})",
            self.date, self.analisados, self.quantidade
        )
    }

    fn store(collections: &Collections) -> &RecordStore<Self> {
        &collections.quality_audits
    }

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self> {
        &mut collections.quality_audits
    }
}
