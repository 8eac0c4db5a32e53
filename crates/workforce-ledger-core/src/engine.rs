use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use time::Date;
use tracing::{debug, info, warn};

use crate::activity::{
    ActionKind, ActivityFilter, ActivityLog, ActivityLogEntry, FieldChange, NewActivity,
    BULK_ENTITY_ID,
};
use crate::aggregate::{self, RollupDrift};
use crate::model::{
    EntityKind, MonitoringMonth, MonitoringMonthDraft, MonitoringMonthPatch, MonitoringWeek,
    MonitoringWeekDraft, MonitoringWeekPatch, Portfolio, Section,
};
use crate::persist::{CollectionStore, LoadDiagnostic};
use crate::record::{Collections, Record, RecordStore};
use crate::stats::{
    self, AttendanceStats, HeadcountSummary, MonitoringStats, Period, TerminationStats, TiaStats,
};
use crate::{IdGenerator, LedgerError, RecordId};

/// Persistence key of the activity log.
pub const ACTIVITY_LOG_KEY: &str = "activity_log";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum Collection {
    Entity(EntityKind),
    Activity,
}

impl Collection {
    fn key(self) -> &'static str {
        match self {
            Self::Entity(kind) => kind.collection_key(),
            Self::Activity => ACTIVITY_LOG_KEY,
        }
    }
}

/// The single owner of every collection, the activity log and the persistence adapter.
///
/// Mutations take `&mut self`; each one updates the target collection, refreshes the
/// portfolio rollups it affects, appends exactly one activity entry and then saves every
/// collection it changed. Reads always reflect in-memory state, even while a failed save
/// is still pending.
#[derive(Debug)]
pub struct Ledger<S> {
    store: S,
    collections: Collections,
    activity: ActivityLog,
    ids: IdGenerator,
    pending: BTreeSet<Collection>,
    diagnostics: Vec<LoadDiagnostic>,
}

impl<S: CollectionStore> Ledger<S> {
    /// Loads every collection from `store`.
    ///
    /// Missing collections start empty. Unreadable or malformed ones also start empty and
    /// are reported through [`Ledger::diagnostics`]. When the sessions had to be reset,
    /// every portfolio rollup is recomputed and the portfolios are queued for saving.
    pub fn open(store: S) -> Self {
        let mut diagnostics = Vec::new();
        let collections = Collections {
            portfolios: load_records(&store, &mut diagnostics),
            training_sessions: load_records(&store, &mut diagnostics),
            terminations: load_records(&store, &mut diagnostics),
            daily_headcounts: load_records(&store, &mut diagnostics),
            portfolio_daily_stats: load_records(&store, &mut diagnostics),
            operators: load_records(&store, &mut diagnostics),
            agents: load_records(&store, &mut diagnostics),
            monitoring_months: load_records(&store, &mut diagnostics),
            quality_audits: load_records(&store, &mut diagnostics),
        };
        let activity = ActivityLog::from_entries(load_collection(
            &store,
            ACTIVITY_LOG_KEY,
            &mut diagnostics,
        ));

        let sessions_key = EntityKind::TrainingSession.collection_key();
        let sessions_reset = diagnostics
            .iter()
            .any(|diagnostic| diagnostic.collection == sessions_key);
        let mut ledger = Self {
            store,
            collections,
            activity,
            ids: IdGenerator::new(),
            pending: BTreeSet::new(),
            diagnostics,
        };
        if sessions_reset {
            ledger.resync_rollups();
        }
        ledger
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    #[must_use]
    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[LoadDiagnostic] {
        &self.diagnostics
    }

    /// Collection keys whose last save failed and will be retried.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<&'static str> {
        self.pending.iter().map(|collection| collection.key()).collect()
    }

    #[must_use]
    pub fn list<R: Record>(&self) -> &[R] {
        R::store(&self.collections).list()
    }

    #[must_use]
    pub fn get<R: Record>(&self, id: RecordId) -> Option<&R> {
        R::store(&self.collections).get(id)
    }

    #[must_use]
    pub fn portfolio_named(&self, name: &str) -> Option<&Portfolio> {
        self.collections
            .portfolios
            .list()
            .iter()
            .find(|portfolio| portfolio.name == name)
    }

    #[must_use]
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    #[must_use]
    pub fn query_activity(&self, filter: &ActivityFilter) -> Vec<&ActivityLogEntry> {
        self.activity.query(filter)
    }

    /// Creates a record with a fresh id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Conflict`] or [`LedgerError::Validation`] when the store
    /// rejects the record, and [`LedgerError::IdExhausted`] when no id is available.
    pub fn insert<R: Record>(&mut self, actor: &str, draft: R::Draft) -> Result<R, LedgerError> {
        let id = self.ids.next_id()?;
        let entry_id = self.ids.next_id()?;
        let stored = R::store_mut(&mut self.collections)
            .insert(R::from_draft(id, draft))?
            .clone();

        let mut touched = vec![Collection::Entity(R::KIND)];
        if let Some(name) = stored.portfolio_ref() {
            self.refresh_rollups([name], &mut touched);
        }
        let current = self.get::<R>(id).cloned().unwrap_or(stored);
        debug!(kind = %R::KIND, %id, actor, "record inserted");

        self.commit(
            entry_id,
            NewActivity {
                actor_name: actor.to_string(),
                action: ActionKind::Create,
                entity_kind: R::KIND,
                entity_id: id.to_string(),
                detail: format!("Created {}", current.summary()),
                changes: None,
            },
            touched,
        );
        Ok(current)
    }

    /// Merges `patch` into the record with `id`.
    ///
    /// When a rollup-relevant field changes, both the previous and the new portfolio are
    /// recomputed.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id and [`LedgerError::Conflict`] or
    /// [`LedgerError::Validation`] when the patched record is rejected.
    pub fn update<R: Record>(
        &mut self,
        actor: &str,
        id: RecordId,
        patch: R::Patch,
    ) -> Result<R, LedgerError> {
        let entry_id = self.ids.next_id()?;
        let (before, changes) = R::store_mut(&mut self.collections).update(id, patch)?;
        let current = self
            .get::<R>(id)
            .cloned()
            .ok_or(LedgerError::NotFound { kind: R::KIND, id })?;

        let mut touched = vec![Collection::Entity(R::KIND)];
        if changes
            .iter()
            .any(|change| R::ROLLUP_FIELDS.contains(&change.field.as_str()))
        {
            let names: Vec<&str> = before
                .portfolio_ref()
                .into_iter()
                .chain(current.portfolio_ref())
                .collect();
            self.refresh_rollups(names, &mut touched);
        }
        let current = self.get::<R>(id).cloned().unwrap_or(current);
        debug!(kind = %R::KIND, %id, actor, changed = changes.len(), "record updated");

        let detail = if changes.is_empty() {
            format!("Saved {} without changes", current.summary())
        } else {
            let fields: Vec<&str> = changes.iter().map(|change| change.field.as_str()).collect();
            format!("Updated {} [{}]", current.summary(), fields.join(", "))
        };
        self.commit(
            entry_id,
            NewActivity {
                actor_name: actor.to_string(),
                action: ActionKind::Edit,
                entity_kind: R::KIND,
                entity_id: id.to_string(),
                detail,
                changes: (!changes.is_empty()).then_some(changes),
            },
            touched,
        );
        Ok(current)
    }

    /// Removes the record with `id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id.
    pub fn delete<R: Record>(&mut self, actor: &str, id: RecordId) -> Result<R, LedgerError> {
        let entry_id = self.ids.next_id()?;
        let removed = R::store_mut(&mut self.collections).delete(id)?;

        let mut touched = vec![Collection::Entity(R::KIND)];
        if let Some(name) = removed.portfolio_ref() {
            self.refresh_rollups([name], &mut touched);
        }
        debug!(kind = %R::KIND, %id, actor, "record deleted");

        self.commit(
            entry_id,
            NewActivity {
                actor_name: actor.to_string(),
                action: ActionKind::Delete,
                entity_kind: R::KIND,
                entity_id: id.to_string(),
                detail: format!("Deleted {}", removed.summary()),
                changes: None,
            },
            touched,
        );
        Ok(removed)
    }

    /// Inserts many records as one mutation with a single `import` activity entry.
    ///
    /// Either every record is stored or none is. An empty batch changes nothing and is not
    /// logged.
    ///
    /// # Errors
    /// Returns the first [`LedgerError::Conflict`] or [`LedgerError::Validation`] raised by
    /// any record of the batch.
    pub fn import_batch<R: Record>(
        &mut self,
        actor: &str,
        drafts: Vec<R::Draft>,
    ) -> Result<Vec<R>, LedgerError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let entry_id = self.ids.next_id()?;
        let mut staged: RecordStore<R> = R::store(&self.collections).clone();
        let mut imported = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let record = R::from_draft(self.ids.next_id()?, draft);
            imported.push(staged.insert(record)?.clone());
        }
        *R::store_mut(&mut self.collections) = staged;

        let mut touched = vec![Collection::Entity(R::KIND)];
        let names: Vec<&str> = imported
            .iter()
            .filter_map(|record| record.portfolio_ref())
            .collect();
        self.refresh_rollups(names, &mut touched);
        let imported: Vec<R> = imported
            .iter()
            .map(|record| self.get::<R>(record.id()).cloned().unwrap_or_else(|| record.clone()))
            .collect();
        info!(kind = %R::KIND, count = imported.len(), actor, "batch imported");

        self.commit(
            entry_id,
            NewActivity {
                actor_name: actor.to_string(),
                action: ActionKind::Import,
                entity_kind: R::KIND,
                entity_id: BULK_ENTITY_ID.to_string(),
                detail: format!("Imported {} {} records", imported.len(), R::KIND.label()),
                changes: None,
            },
            touched,
        );
        Ok(imported)
    }

    /// Registers one monitoring batch, creating the month on its first week.
    ///
    /// # Errors
    /// Propagates the errors of [`Ledger::insert`] and [`Ledger::update`].
    pub fn record_monitoring_week(
        &mut self,
        actor: &str,
        period: Period,
        week: MonitoringWeekDraft,
    ) -> Result<MonitoringMonth, LedgerError> {
        let existing = self
            .collections
            .monitoring_months
            .list()
            .iter()
            .find(|month| month.year == period.year && month.month == period.month)
            .cloned();

        match existing {
            None => self.insert::<MonitoringMonth>(
                actor,
                MonitoringMonthDraft {
                    year: period.year,
                    month: period.month,
                    weeks: vec![week],
                },
            ),
            Some(month) => {
                let mut weeks = month.weeks.clone();
                weeks.push(MonitoringWeek {
                    id: month.next_week_id(),
                    label: week.label,
                    conforme: week.conforme,
                    inconforme: week.inconforme,
                });
                self.update::<MonitoringMonth>(
                    actor,
                    month.id,
                    MonitoringMonthPatch {
                        weeks: Some(weeks),
                        ..MonitoringMonthPatch::default()
                    },
                )
            }
        }
    }

    /// Edits one week of a monitoring month.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown month and
    /// [`LedgerError::WeekNotFound`] for an unknown week.
    pub fn update_monitoring_week(
        &mut self,
        actor: &str,
        month_id: RecordId,
        week_id: u32,
        patch: MonitoringWeekPatch,
    ) -> Result<MonitoringMonth, LedgerError> {
        let mut weeks = self.monitoring_weeks(month_id)?;
        let week = weeks
            .iter_mut()
            .find(|week| week.id == week_id)
            .ok_or(LedgerError::WeekNotFound { month_id, week_id })?;
        if let Some(label) = patch.label {
            week.label = label;
        }
        if let Some(conforme) = patch.conforme {
            week.conforme = conforme;
        }
        if let Some(inconforme) = patch.inconforme {
            week.inconforme = inconforme;
        }

        self.update::<MonitoringMonth>(
            actor,
            month_id,
            MonitoringMonthPatch {
                weeks: Some(weeks),
                ..MonitoringMonthPatch::default()
            },
        )
    }

    /// Removes one week of a monitoring month; the month itself stays.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown month and
    /// [`LedgerError::WeekNotFound`] for an unknown week.
    pub fn remove_monitoring_week(
        &mut self,
        actor: &str,
        month_id: RecordId,
        week_id: u32,
    ) -> Result<MonitoringMonth, LedgerError> {
        let mut weeks = self.monitoring_weeks(month_id)?;
        let before = weeks.len();
        weeks.retain(|week| week.id != week_id);
        if weeks.len() == before {
            return Err(LedgerError::WeekNotFound { month_id, week_id });
        }

        self.update::<MonitoringMonth>(
            actor,
            month_id,
            MonitoringMonthPatch {
                weeks: Some(weeks),
                ..MonitoringMonthPatch::default()
            },
        )
    }

    /// Portfolios whose stored rollups disagree with their sessions.
    #[must_use]
    pub fn check_aggregates(&self) -> Vec<RollupDrift> {
        aggregate::find_drift(
            self.collections.portfolios.list(),
            self.collections.training_sessions.list(),
        )
    }

    /// Recomputes every drifted portfolio and returns how many were repaired.
    ///
    /// A repair is one mutation logged as a bulk `edit` on portfolios; nothing is logged
    /// when every rollup is already consistent.
    ///
    /// # Errors
    /// Returns [`LedgerError::IdExhausted`] when no activity id is available.
    pub fn rebuild_aggregates(&mut self, actor: &str) -> Result<usize, LedgerError> {
        let drift = self.check_aggregates();
        if drift.is_empty() {
            return Ok(0);
        }

        let entry_id = self.ids.next_id()?;
        let mut touched = Vec::new();
        self.refresh_rollups(drift.iter().map(|item| item.name.as_str()), &mut touched);
        let changes: Vec<FieldChange> = drift
            .iter()
            .map(|item| FieldChange::new(&item.name, &item.stored, &item.expected))
            .collect();
        warn!(repaired = drift.len(), actor, "portfolio rollups rebuilt");

        self.commit(
            entry_id,
            NewActivity {
                actor_name: actor.to_string(),
                action: ActionKind::Edit,
                entity_kind: EntityKind::Portfolio,
                entity_id: BULK_ENTITY_ID.to_string(),
                detail: format!("Recalculated rollups of {} portfolios", drift.len()),
                changes: Some(changes),
            },
            touched,
        );
        Ok(drift.len())
    }

    /// Empties the activity log and deletes its persisted copy.
    ///
    /// This administrative action is deliberately not logged itself.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the persisted copy cannot be removed; the
    /// in-memory log is left intact in that case.
    pub fn clear_activity(&mut self) -> Result<usize, LedgerError> {
        self.store.remove(ACTIVITY_LOG_KEY).map_err(|err| {
            LedgerError::Persistence(format!("failed to remove {ACTIVITY_LOG_KEY}: {err:#}"))
        })?;
        self.pending.remove(&Collection::Activity);
        let removed = self.activity.clear();
        info!(removed, "activity log cleared");
        Ok(removed)
    }

    /// Serializes the whole activity log as pretty JSON, newest entry first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when serialization fails.
    pub fn export_activity(&self) -> Result<String, LedgerError> {
        self.activity
            .to_json()
            .and_then(|value| serde_json::to_string_pretty(&value))
            .map_err(|err| {
                LedgerError::Persistence(format!("failed to serialize activity log: {err}"))
            })
    }

    /// Retries every pending save.
    ///
    /// # Errors
    /// Returns the first [`LedgerError::Persistence`] failure; failed keys stay pending.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.persist_pending()
    }

    #[must_use]
    pub fn monitoring_stats(&self, period: Option<Period>) -> MonitoringStats {
        stats::monitoring_stats(self.collections.monitoring_months.list(), period)
    }

    #[must_use]
    pub fn tia_stats(&self, period: Option<Period>) -> TiaStats {
        stats::tia_stats(self.collections.quality_audits.list(), period)
    }

    #[must_use]
    pub fn termination_stats(&self, period: Option<Period>) -> TerminationStats {
        stats::termination_stats(self.collections.terminations.list(), period)
    }

    #[must_use]
    pub fn headcount_summary(
        &self,
        date: Option<Date>,
        section: Option<Section>,
    ) -> HeadcountSummary {
        stats::headcount_summary(self.collections.daily_headcounts.list(), date, section)
    }

    #[must_use]
    pub fn attendance_stats(
        &self,
        period: Option<Period>,
        portfolio: Option<&str>,
    ) -> AttendanceStats {
        stats::attendance_stats(self.collections.portfolio_daily_stats.list(), period, portfolio)
    }

    fn monitoring_weeks(&self, month_id: RecordId) -> Result<Vec<MonitoringWeek>, LedgerError> {
        self.get::<MonitoringMonth>(month_id)
            .map(|month| month.weeks.clone())
            .ok_or(LedgerError::NotFound {
                kind: EntityKind::MonitoringMonth,
                id: month_id,
            })
    }

    fn resync_rollups(&mut self) {
        let names: Vec<String> = self
            .collections
            .portfolios
            .list()
            .iter()
            .map(|portfolio| portfolio.name.clone())
            .collect();
        let mut touched = Vec::new();
        self.refresh_rollups(names.iter().map(String::as_str), &mut touched);
        if !touched.is_empty() {
            warn!(portfolios = names.len(), "portfolio rollups recomputed after session reset");
            self.pending.extend(touched);
        }
    }

    fn refresh_rollups<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
        touched: &mut Vec<Collection>,
    ) {
        let mut seen = BTreeSet::new();
        let mut changed = false;
        for name in names {
            if !seen.insert(name) {
                continue;
            }
            changed |= aggregate::recompute(
                &mut self.collections.portfolios,
                self.collections.training_sessions.list(),
                name,
            );
        }
        if changed {
            touched.push(Collection::Entity(EntityKind::Portfolio));
        }
    }

    fn commit(&mut self, entry_id: RecordId, activity: NewActivity, touched: Vec<Collection>) {
        let _ = self.activity.append(entry_id, activity);
        self.pending.extend(touched);
        self.pending.insert(Collection::Activity);
        // Failures are logged and kept pending; the mutation itself already succeeded.
        let _ = self.persist_pending();
    }

    fn persist_pending(&mut self) -> Result<(), LedgerError> {
        let mut first_error = None;
        let pending: Vec<Collection> = self.pending.iter().copied().collect();
        for collection in pending {
            let key = collection.key();
            let saved = self.serialize(collection).and_then(|value| {
                self.store.save(key, &value).map_err(|err| {
                    LedgerError::Persistence(format!("failed to save {key}: {err:#}"))
                })
            });
            match saved {
                Ok(()) => {
                    self.pending.remove(&collection);
                    debug!(collection = key, "collection saved");
                }
                Err(err) => {
                    warn!(collection = key, error = %err, "collection save failed; kept pending");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn serialize(&self, collection: Collection) -> Result<Value, LedgerError> {
        let value = match collection {
            Collection::Activity => self.activity.to_json(),
            Collection::Entity(kind) => match kind {
                EntityKind::Portfolio => to_json(self.collections.portfolios.list()),
                EntityKind::TrainingSession => to_json(self.collections.training_sessions.list()),
                EntityKind::Termination => to_json(self.collections.terminations.list()),
                EntityKind::DailyHeadcount => to_json(self.collections.daily_headcounts.list()),
                EntityKind::PortfolioDailyStat => {
                    to_json(self.collections.portfolio_daily_stats.list())
                }
                EntityKind::Operator => to_json(self.collections.operators.list()),
                EntityKind::Agent => to_json(self.collections.agents.list()),
                EntityKind::MonitoringMonth => to_json(self.collections.monitoring_months.list()),
                EntityKind::QualityAudit => to_json(self.collections.quality_audits.list()),
            },
        };
        value.map_err(|err| {
            LedgerError::Persistence(format!("failed to serialize {}: {err}", collection.key()))
        })
    }
}

fn to_json<T: Serialize>(records: &[T]) -> Result<Value, serde_json::Error> {
    serde_json::to_value(records)
}

fn load_records<R: Record, S: CollectionStore>(
    store: &S,
    diagnostics: &mut Vec<LoadDiagnostic>,
) -> RecordStore<R> {
    RecordStore::from_records(load_collection(
        store,
        R::KIND.collection_key(),
        diagnostics,
    ))
}

fn load_collection<T: DeserializeOwned, S: CollectionStore>(
    store: &S,
    key: &str,
    diagnostics: &mut Vec<LoadDiagnostic>,
) -> Vec<T> {
    let message = match store.load(key) {
        Ok(None) => return Vec::new(),
        Ok(Some(value)) => match serde_json::from_value::<Vec<T>>(value) {
            Ok(records) => {
                debug!(collection = key, count = records.len(), "collection loaded");
                return records;
            }
            Err(err) => format!("malformed collection, starting empty: {err}"),
        },
        Err(err) => format!("failed to load collection, starting empty: {err:#}"),
    };

    warn!(collection = key, %message, "collection reset on load");
    diagnostics.push(LoadDiagnostic {
        collection: key.to_string(),
        message,
    });
    Vec::new()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use std::cell::Cell;
    use std::rc::Rc;

    use anyhow::anyhow;
    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::date;

    use super::*;
    use crate::model::{
        OperatorDraft, PortfolioDraft, PortfolioPatch, QualityAuditDraft, QualityAuditEntry,
        SessionStatus, Termination, TerminationDraft, TrainingSession, TrainingSessionDraft,
        TrainingSessionPatch,
    };
    use crate::persist::MemoryCollectionStore;

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_ledger() -> Ledger<MemoryCollectionStore> {
        Ledger::open(MemoryCollectionStore::new())
    }

    fn session_draft(portfolio: &str, quantity: u32, status: SessionStatus) -> TrainingSessionDraft {
        TrainingSessionDraft {
            quantity,
            shift: "morning".to_string(),
            portfolio_name: portfolio.to_string(),
            date: date!(2025 - 01 - 15),
            responsible: "Joana".to_string(),
            status,
            subject: "Onboarding".to_string(),
            duration_hours: 2.0,
        }
    }

    fn create_portfolio<S: CollectionStore>(ledger: &mut Ledger<S>, name: &str) -> Portfolio {
        must(ledger.insert::<Portfolio>(
            "admin",
            PortfolioDraft {
                name: name.to_string(),
            },
        ))
    }

    fn portfolio<'a, S: CollectionStore>(ledger: &'a Ledger<S>, name: &str) -> &'a Portfolio {
        must_some(ledger.portfolio_named(name))
    }

    #[test]
    fn caixa_rollup_matches_reference_scenario() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Caixa", 10, SessionStatus::Applied),
        ));
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Caixa", 5, SessionStatus::Pending),
        ));

        let caixa = portfolio(&ledger, "Caixa");
        assert_eq!(caixa.total, 15);
        assert_eq!(caixa.applied, 10);
        assert_eq!(caixa.pending, 5);
        assert!((caixa.completion_rate - 66.7).abs() < f64::EPSILON);
    }

    #[test]
    fn deleting_last_session_zeroes_the_portfolio() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "X");
        let session = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("X", 7, SessionStatus::Applied),
        ));
        assert_eq!(portfolio(&ledger, "X").total, 7);

        let removed = must(ledger.delete::<TrainingSession>("ana", session.id));
        assert_eq!(removed.id, session.id);

        let x = portfolio(&ledger, "X");
        assert_eq!((x.total, x.applied, x.pending), (0, 0, 0));
        assert!(x.completion_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn moving_a_session_recomputes_both_portfolios() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "A");
        let _ = create_portfolio(&mut ledger, "B");
        let moved = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("A", 6, SessionStatus::Applied),
        ));
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("A", 4, SessionStatus::Pending),
        ));
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("B", 2, SessionStatus::Applied),
        ));
        let a_before = portfolio(&ledger, "A").total;
        let b_before = portfolio(&ledger, "B").total;

        let _ = must(ledger.update::<TrainingSession>(
            "ana",
            moved.id,
            TrainingSessionPatch {
                portfolio_name: Some("B".to_string()),
                ..TrainingSessionPatch::default()
            },
        ));

        assert_eq!(portfolio(&ledger, "A").total, a_before - 6);
        assert_eq!(portfolio(&ledger, "B").total, b_before + 6);
        assert_eq!(portfolio(&ledger, "A").applied, 0);
        assert!((portfolio(&ledger, "B").completion_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn status_change_moves_quantity_between_buckets() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let session = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Caixa", 5, SessionStatus::Pending),
        ));

        let updated = must(ledger.update::<TrainingSession>(
            "ana",
            session.id,
            TrainingSessionPatch {
                status: Some(SessionStatus::Applied),
                ..TrainingSessionPatch::default()
            },
        ));
        assert_eq!(updated.status, SessionStatus::Applied);

        let caixa = portfolio(&ledger, "Caixa");
        assert_eq!((caixa.applied, caixa.pending), (5, 0));

        let entry = must_some(ledger.activity().latest());
        assert_eq!(entry.action, ActionKind::Edit);
        let changes = must_some(entry.changes.clone());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "status");
        assert_eq!(changes[0].old_value, json!("pending"));
        assert_eq!(changes[0].new_value, json!("applied"));
    }

    #[test]
    fn session_for_unknown_portfolio_is_accepted() {
        let mut ledger = fixture_ledger();
        let session = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Ghost", 3, SessionStatus::Applied),
        ));
        assert!(ledger.portfolio_named("Ghost").is_none());
        assert_eq!(ledger.list::<TrainingSession>().len(), 1);

        // Creating the portfolio later picks the orphaned session up.
        let ghost = create_portfolio(&mut ledger, "Ghost");
        assert_eq!(ghost.total, 3);
        let _ = must(ledger.delete::<TrainingSession>("ana", session.id));
        assert_eq!(portfolio(&ledger, "Ghost").total, 0);
    }

    #[test]
    fn renaming_a_portfolio_leaves_sessions_pointing_at_the_old_name() {
        let mut ledger = fixture_ledger();
        let caixa = create_portfolio(&mut ledger, "Caixa");
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Caixa", 8, SessionStatus::Applied),
        ));

        let renamed = must(ledger.update::<Portfolio>(
            "admin",
            caixa.id,
            PortfolioPatch {
                name: Some("Caixa Norte".to_string()),
            },
        ));
        assert_eq!(renamed.total, 0);
        assert_eq!(
            ledger.list::<TrainingSession>()[0].portfolio_name,
            "Caixa"
        );
        assert!(ledger.check_aggregates().is_empty());
    }

    #[test]
    fn duplicate_portfolio_name_is_a_conflict() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let entries_before = ledger.activity().len();

        let duplicate = ledger.insert::<Portfolio>(
            "admin",
            PortfolioDraft {
                name: "Caixa".to_string(),
            },
        );
        assert!(matches!(duplicate, Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.list::<Portfolio>().len(), 1);
        assert_eq!(ledger.activity().len(), entries_before);

        let other_case = create_portfolio(&mut ledger, "caixa");
        assert_eq!(other_case.name, "caixa");
    }

    #[test]
    fn not_found_is_reported_and_not_logged() {
        let mut ledger = fixture_ledger();
        let missing: RecordId = must("01J0SQQP7M70P6Y3R4T8D8G8M2".parse());

        let update = ledger.update::<Termination>("ana", missing, Default::default());
        assert_eq!(
            update.err(),
            Some(LedgerError::NotFound {
                kind: EntityKind::Termination,
                id: missing
            })
        );
        assert!(matches!(
            ledger.delete::<TrainingSession>("ana", missing),
            Err(LedgerError::NotFound { .. })
        ));
        assert!(ledger.activity().is_empty());
    }

    #[test]
    fn every_mutation_appends_one_matching_entry() {
        let mut ledger = fixture_ledger();
        let termination = must(ledger.insert::<Termination>(
            "bruno",
            TerminationDraft {
                employee_name: "Fulano".to_string(),
                portfolio: "Caixa".to_string(),
                shift: "night".to_string(),
                date: date!(2025 - 04 - 02),
                reason: "resignation".to_string(),
                has_notice_period: true,
                responsible: "RH".to_string(),
                came_from_agency: false,
                notes: String::new(),
            },
        ));
        let entry = must_some(ledger.activity().latest()).clone();
        assert_eq!(entry.action, ActionKind::Create);
        assert_eq!(entry.entity_kind, EntityKind::Termination);
        assert_eq!(entry.entity_id, termination.id.to_string());
        assert_eq!(entry.actor_name, "bruno");

        let audit = must(ledger.insert::<QualityAuditEntry>(
            "carla",
            QualityAuditDraft {
                date: date!(2025 - 04 - 03),
                analisados: 2,
                quantidade: 10,
            },
        ));
        let _ = must(ledger.delete::<Termination>("bruno", termination.id));

        let entries: Vec<&ActivityLogEntry> = ledger.activity().entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, ActionKind::Delete);
        assert_eq!(entries[0].entity_id, termination.id.to_string());
        assert_eq!(entries[1].entity_kind, EntityKind::QualityAudit);
        assert_eq!(entries[1].entity_id, audit.id.to_string());
    }

    #[test]
    fn import_batch_logs_one_bulk_entry() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let imported = must(ledger.import_batch::<TrainingSession>(
            "importer",
            vec![
                session_draft("Caixa", 3, SessionStatus::Applied),
                session_draft("Caixa", 3, SessionStatus::Applied),
                session_draft("Caixa", 4, SessionStatus::Pending),
            ],
        ));
        assert_eq!(imported.len(), 3);
        let ids: BTreeSet<RecordId> = imported.iter().map(|session| session.id).collect();
        assert_eq!(ids.len(), 3);

        let entry = must_some(ledger.activity().latest());
        assert_eq!(entry.action, ActionKind::Import);
        assert_eq!(entry.entity_id, BULK_ENTITY_ID);
        assert!(entry.detail.contains('3'));
        assert_eq!(ledger.activity().len(), 2);
        assert_eq!(portfolio(&ledger, "Caixa").total, 10);
        assert!((portfolio(&ledger, "Caixa").completion_rate - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn import_batch_is_all_or_nothing() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let entries_before = ledger.activity().len();

        let result = ledger.import_batch::<Portfolio>(
            "importer",
            vec![
                PortfolioDraft {
                    name: "Cobranca".to_string(),
                },
                PortfolioDraft {
                    name: "Caixa".to_string(),
                },
            ],
        );
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.list::<Portfolio>().len(), 1);
        assert_eq!(ledger.activity().len(), entries_before);

        assert!(must(ledger.import_batch::<Portfolio>("importer", Vec::new())).is_empty());
        assert_eq!(ledger.activity().len(), entries_before);
    }

    #[test]
    fn monitoring_weeks_accumulate_into_one_month() {
        let mut ledger = fixture_ledger();
        let january = must(Period::new(2025, 1));
        let created = must(ledger.record_monitoring_week(
            "ana",
            january,
            MonitoringWeekDraft {
                label: "S1".to_string(),
                conforme: 8,
                inconforme: 2,
            },
        ));
        assert_eq!(
            ledger.monitoring_stats(Some(january)),
            MonitoringStats {
                conforme: 8,
                inconforme: 2,
                total: 10,
                media_conforme: "80.00".to_string(),
                media_inconforme: "20.00".to_string(),
            }
        );

        let updated = must(ledger.record_monitoring_week(
            "ana",
            january,
            MonitoringWeekDraft {
                label: "S2".to_string(),
                conforme: 0,
                inconforme: 10,
            },
        ));
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.weeks.len(), 2);
        assert_eq!(ledger.list::<MonitoringMonth>().len(), 1);
        assert_eq!(ledger.monitoring_stats(Some(january)).media_conforme, "40.00");

        let edited = must(ledger.update_monitoring_week(
            "ana",
            created.id,
            2,
            MonitoringWeekPatch {
                conforme: Some(10),
                inconforme: Some(0),
                ..MonitoringWeekPatch::default()
            },
        ));
        assert_eq!(edited.weeks[1].conforme, 10);

        let trimmed = must(ledger.remove_monitoring_week("ana", created.id, 1));
        assert_eq!(trimmed.weeks.len(), 1);
        assert_eq!(trimmed.weeks[0].label, "S2");
        assert_eq!(
            ledger.remove_monitoring_week("ana", created.id, 1).err(),
            Some(LedgerError::WeekNotFound {
                month_id: created.id,
                week_id: 1
            })
        );

        assert_eq!(ledger.activity().len(), 4);
        assert!(ledger
            .activity()
            .entries()
            .all(|entry| entry.entity_kind == EntityKind::MonitoringMonth));
    }

    #[test]
    fn clear_is_not_logged_and_removes_persisted_log() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        assert!(ledger.store().get(ACTIVITY_LOG_KEY).is_some());

        assert_eq!(must(ledger.clear_activity()), 1);
        assert!(ledger.activity().is_empty());
        assert!(ledger.store().get(ACTIVITY_LOG_KEY).is_none());

        let _ = create_portfolio(&mut ledger, "Cobranca");
        assert_eq!(ledger.activity().len(), 1);
    }

    #[test]
    fn reopening_restores_collections_and_log_order() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let _ = must(ledger.insert::<TrainingSession>(
            "ana",
            session_draft("Caixa", 4, SessionStatus::Applied),
        ));
        let _ = must(ledger.insert::<crate::model::Operator>(
            "ana",
            OperatorDraft {
                name: "Maria".to_string(),
                registration: "M-001".to_string(),
                portfolio: "Caixa".to_string(),
                shift: "morning".to_string(),
                active: true,
            },
        ));
        let latest_id = must_some(ledger.activity().latest()).id;

        let reopened = Ledger::open(ledger.into_store());
        assert!(reopened.diagnostics().is_empty());
        assert_eq!(portfolio(&reopened, "Caixa").total, 4);
        assert_eq!(reopened.list::<TrainingSession>().len(), 1);
        assert_eq!(reopened.list::<crate::model::Operator>().len(), 1);
        assert_eq!(reopened.activity().len(), 3);
        assert_eq!(must_some(reopened.activity().latest()).id, latest_id);
    }

    #[test]
    fn malformed_collection_degrades_to_empty_with_diagnostic() {
        let mut store = MemoryCollectionStore::new();
        store.insert_raw("training_sessions", json!({"not": "an array"}));
        store.insert_raw("portfolios", json!([{"id": "bogus"}]));
        store.insert_raw(
            ACTIVITY_LOG_KEY,
            json!([]),
        );

        let ledger = Ledger::open(store);
        assert!(ledger.list::<TrainingSession>().is_empty());
        assert!(ledger.list::<Portfolio>().is_empty());
        let collections: Vec<&str> = ledger
            .diagnostics()
            .iter()
            .map(|diagnostic| diagnostic.collection.as_str())
            .collect();
        assert_eq!(collections, vec!["portfolios", "training_sessions"]);
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryCollectionStore,
        failing: Rc<Cell<bool>>,
    }

    impl CollectionStore for FlakyStore {
        fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
            self.inner.load(key)
        }

        fn save(&mut self, key: &str, value: &Value) -> anyhow::Result<()> {
            if self.failing.get() {
                return Err(anyhow!("disk full"));
            }
            self.inner.save(key, value)
        }

        fn remove(&mut self, key: &str) -> anyhow::Result<()> {
            if self.failing.get() {
                return Err(anyhow!("disk full"));
            }
            self.inner.remove(key)
        }
    }

    #[test]
    fn failed_saves_stay_pending_without_stale_reads() {
        let failing = Rc::new(Cell::new(true));
        let store = FlakyStore {
            inner: MemoryCollectionStore::new(),
            failing: Rc::clone(&failing),
        };
        let mut ledger = Ledger::open(store);

        let caixa = create_portfolio(&mut ledger, "Caixa");
        assert_eq!(ledger.get::<Portfolio>(caixa.id).map(|p| p.name.as_str()), Some("Caixa"));
        assert_eq!(ledger.pending_writes(), vec!["portfolios", ACTIVITY_LOG_KEY]);
        assert!(matches!(ledger.flush(), Err(LedgerError::Persistence(_))));
        assert!(matches!(
            ledger.clear_activity(),
            Err(LedgerError::Persistence(_))
        ));
        assert_eq!(ledger.activity().len(), 1);

        failing.set(false);
        must(ledger.flush());
        assert!(ledger.pending_writes().is_empty());
        assert!(ledger.store().inner.get("portfolios").is_some());
    }

    #[test]
    fn session_reset_on_open_recomputes_every_rollup() {
        let mut store = MemoryCollectionStore::new();
        store.insert_raw(
            "portfolios",
            json!([{
                "id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "name": "Caixa",
                "total": 10,
                "applied": 10,
                "pending": 0,
                "completion_rate": 100.0
            }]),
        );
        store.insert_raw("training_sessions", json!([{"quantity": "ten"}]));

        let mut ledger = Ledger::open(store);
        assert_eq!(ledger.diagnostics().len(), 1);
        assert!(ledger.list::<TrainingSession>().is_empty());
        assert!(ledger.check_aggregates().is_empty());
        let caixa = must_some(ledger.portfolio_named("Caixa"));
        assert_eq!((caixa.total, caixa.applied), (0, 0));
        assert_eq!(ledger.pending_writes(), vec!["portfolios"]);
        assert!(ledger.activity().is_empty());

        must(ledger.flush());
        assert!(ledger.pending_writes().is_empty());
        let saved = must_some(ledger.store().get("portfolios"));
        assert_eq!(saved[0]["total"], json!(0));
    }

    #[test]
    fn rebuild_repairs_drifted_rollups_once() {
        let mut store = MemoryCollectionStore::new();
        store.insert_raw(
            "portfolios",
            json!([{
                "id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "name": "Caixa",
                "total": 99,
                "applied": 99,
                "pending": 0,
                "completion_rate": 100.0
            }]),
        );
        let mut ledger = Ledger::open(store);
        let drift = ledger.check_aggregates();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].stored.total, 99);
        assert_eq!(drift[0].expected.total, 0);

        assert_eq!(must(ledger.rebuild_aggregates("admin")), 1);
        assert!(ledger.check_aggregates().is_empty());
        let entry = must_some(ledger.activity().latest());
        assert_eq!(entry.entity_kind, EntityKind::Portfolio);
        assert_eq!(entry.entity_id, BULK_ENTITY_ID);

        assert_eq!(must(ledger.rebuild_aggregates("admin")), 0);
        assert_eq!(ledger.activity().len(), 1);
    }

    #[test]
    fn export_serializes_newest_first() {
        let mut ledger = fixture_ledger();
        let _ = create_portfolio(&mut ledger, "Caixa");
        let _ = create_portfolio(&mut ledger, "Cobranca");

        let exported: Value = match serde_json::from_str(&must(ledger.export_activity())) {
            Ok(value) => value,
            Err(err) => panic!("export is not JSON: {err}"),
        };
        assert_eq!(exported.as_array().map(Vec::len), Some(2));
        assert!(exported[0]["detail"]
            .as_str()
            .is_some_and(|detail| detail.contains("Cobranca")));
    }

    #[derive(Debug, Clone)]
    enum SessionOp {
        Insert {
            portfolio: usize,
            quantity: u32,
            applied: bool,
        },
        Update {
            target: usize,
            portfolio: Option<usize>,
            quantity: Option<u32>,
            applied: Option<bool>,
        },
        Delete {
            target: usize,
        },
    }

    // "D" never gets a portfolio record.
    const NAMES: [&str; 4] = ["A", "B", "C", "D"];

    fn status(applied: bool) -> SessionStatus {
        if applied {
            SessionStatus::Applied
        } else {
            SessionStatus::Pending
        }
    }

    fn session_op() -> impl Strategy<Value = SessionOp> {
        prop_oneof![
            (0_usize..4, 1_u32..50, any::<bool>()).prop_map(|(portfolio, quantity, applied)| {
                SessionOp::Insert {
                    portfolio,
                    quantity,
                    applied,
                }
            }),
            (
                any::<usize>(),
                prop::option::of(0_usize..4),
                prop::option::of(1_u32..50),
                prop::option::of(any::<bool>())
            )
                .prop_map(|(target, portfolio, quantity, applied)| SessionOp::Update {
                    target,
                    portfolio,
                    quantity,
                    applied,
                }),
            any::<usize>().prop_map(|target| SessionOp::Delete { target }),
        ]
    }

    fn apply_op(ledger: &mut Ledger<MemoryCollectionStore>, op: SessionOp) {
        let sessions: Vec<RecordId> = ledger
            .list::<TrainingSession>()
            .iter()
            .map(|session| session.id)
            .collect();
        match op {
            SessionOp::Update { target, .. } | SessionOp::Delete { target }
                if sessions.is_empty() =>
            {
                let _ = must(ledger.insert::<TrainingSession>(
                    "prop",
                    session_draft(NAMES[target % NAMES.len()], 1, SessionStatus::Pending),
                ));
            }
            SessionOp::Insert {
                portfolio,
                quantity,
                applied,
            } => {
                let _ = must(ledger.insert::<TrainingSession>(
                    "prop",
                    session_draft(NAMES[portfolio], quantity, status(applied)),
                ));
            }
            SessionOp::Update {
                target,
                portfolio,
                quantity,
                applied,
            } => {
                let _ = must(ledger.update::<TrainingSession>(
                    "prop",
                    sessions[target % sessions.len()],
                    TrainingSessionPatch {
                        portfolio_name: portfolio.map(|index| NAMES[index].to_string()),
                        quantity,
                        status: applied.map(status),
                        ..TrainingSessionPatch::default()
                    },
                ));
            }
            SessionOp::Delete { target } => {
                let _ = must(ledger.delete::<TrainingSession>(
                    "prop",
                    sessions[target % sessions.len()],
                ));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_rollups_track_sessions_after_every_mutation(
            ops in prop::collection::vec(session_op(), 1..60)
        ) {
            let mut ledger = fixture_ledger();
            for name in &NAMES[..3] {
                let _ = create_portfolio(&mut ledger, name);
            }

            for op in ops {
                let entries_before = ledger.activity().len();
                apply_op(&mut ledger, op);
                prop_assert_eq!(ledger.activity().len(), entries_before + 1);

                for portfolio in ledger.list::<Portfolio>() {
                    let expected: u64 = ledger
                        .list::<TrainingSession>()
                        .iter()
                        .filter(|session| session.portfolio_name == portfolio.name)
                        .map(|session| u64::from(session.quantity))
                        .sum();
                    prop_assert_eq!(portfolio.total, expected);
                    prop_assert_eq!(portfolio.applied + portfolio.pending, portfolio.total);
                    prop_assert!((0.0..=100.0).contains(&portfolio.completion_rate));
                    if portfolio.total == 0 {
                        prop_assert!(portfolio.completion_rate.abs() < f64::EPSILON);
                    }
                }
                prop_assert!(ledger.check_aggregates().is_empty());
            }
        }

        #[test]
        fn prop_audit_entries_reference_the_mutated_record(
            ops in prop::collection::vec(session_op(), 1..40)
        ) {
            let mut ledger = fixture_ledger();
            for op in ops {
                apply_op(&mut ledger, op);
                let entry = must_some(ledger.activity().latest());
                prop_assert_eq!(entry.entity_kind, EntityKind::TrainingSession);
                let id: RecordId = must(entry.entity_id.parse());
                match entry.action {
                    ActionKind::Delete => prop_assert!(ledger.get::<TrainingSession>(id).is_none()),
                    _ => prop_assert!(ledger.get::<TrainingSession>(id).is_some()),
                }
            }
        }
    }
}
