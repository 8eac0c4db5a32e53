use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::activity::FieldChange;
use crate::model::{
    Agent, DailyHeadcount, EntityKind, MonitoringMonth, Operator, Portfolio, PortfolioDailyStat,
    QualityAuditEntry, Termination, TrainingSession,
};
use crate::{LedgerError, RecordId};

/// A record kind held in one of the ledger's collections.
///
/// `Draft` carries the caller-supplied fields of an insert, `Patch` the optional fields of
/// an update. Implementations live next to the entity definitions.
pub trait Record: Clone + Debug + Serialize + DeserializeOwned {
    type Draft: DeserializeOwned;
    type Patch: Clone + DeserializeOwned + Default;

    const KIND: EntityKind;

    /// Fields whose change invalidates the rollups of the referenced portfolio.
    const ROLLUP_FIELDS: &'static [&'static str] = &[];

    fn id(&self) -> RecordId;

    fn from_draft(id: RecordId, draft: Self::Draft) -> Self;

    /// Merges `patch` into `self` and returns one [`FieldChange`] per field that actually
    /// changed value.
    fn apply_patch(&mut self, patch: Self::Patch) -> Vec<FieldChange>;

    /// Human-readable description used in activity log details.
    fn summary(&self) -> String;

    /// Structural checks the engine relies on (not business validation).
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the record cannot be stored.
    fn check(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Returns a conflict message when `self` and `other` cannot coexist.
    fn conflicts_with(&self, _other: &Self) -> Option<String> {
        None
    }

    /// Portfolio name whose rollups depend on this record.
    fn portfolio_ref(&self) -> Option<&str> {
        None
    }

    fn store(collections: &Collections) -> &RecordStore<Self>;

    fn store_mut(collections: &mut Collections) -> &mut RecordStore<Self>;
}

/// Insertion-ordered collection of one record kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStore<R> {
    records: Vec<R>,
}

impl<R> Default for RecordStore<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<R: Record> RecordStore<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_records(records: Vec<R>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn list(&self) -> &[R] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&R> {
        self.records.iter().find(|record| record.id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stores a new record after structural and uniqueness checks.
    ///
    /// # Errors
    /// Returns [`LedgerError::Conflict`] when the id or a unique key is already taken and
    /// [`LedgerError::Validation`] when [`Record::check`] fails.
    pub fn insert(&mut self, record: R) -> Result<&R, LedgerError> {
        record.check()?;
        if self.get(record.id()).is_some() {
            return Err(LedgerError::Conflict(format!(
                "{} id {} already exists",
                R::KIND,
                record.id()
            )));
        }
        self.ensure_no_conflict(&record)?;
        self.records.push(record);
        let index = self.records.len() - 1;
        Ok(&self.records[index])
    }

    /// Merges a patch into the record with `id`.
    ///
    /// The patch is applied to a copy first; the stored record only changes once every
    /// check passed. Returns the record as it was before the update and the field diff.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id, [`LedgerError::Conflict`] or
    /// [`LedgerError::Validation`] when the patched record is rejected.
    pub fn update(
        &mut self,
        id: RecordId,
        patch: R::Patch,
    ) -> Result<(R, Vec<FieldChange>), LedgerError> {
        let index = self.position(id)?;
        let before = self.records[index].clone();
        let mut candidate = before.clone();
        let changes = candidate.apply_patch(patch);
        candidate.check()?;
        self.ensure_no_conflict(&candidate)?;
        self.records[index] = candidate;
        Ok((before, changes))
    }

    /// Removes and returns the record with `id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown id.
    pub fn delete(&mut self, id: RecordId) -> Result<R, LedgerError> {
        let index = self.position(id)?;
        Ok(self.records.remove(index))
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, R> {
        self.records.iter_mut()
    }

    fn position(&self, id: RecordId) -> Result<usize, LedgerError> {
        self.records
            .iter()
            .position(|record| record.id() == id)
            .ok_or(LedgerError::NotFound { kind: R::KIND, id })
    }

    fn ensure_no_conflict(&self, candidate: &R) -> Result<(), LedgerError> {
        for existing in &self.records {
            if existing.id() == candidate.id() {
                continue;
            }
            if let Some(message) = candidate.conflicts_with(existing) {
                return Err(LedgerError::Conflict(message));
            }
        }
        Ok(())
    }
}

/// Every record collection owned by a [`crate::Ledger`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collections {
    pub(crate) portfolios: RecordStore<Portfolio>,
    pub(crate) training_sessions: RecordStore<TrainingSession>,
    pub(crate) terminations: RecordStore<Termination>,
    pub(crate) daily_headcounts: RecordStore<DailyHeadcount>,
    pub(crate) portfolio_daily_stats: RecordStore<PortfolioDailyStat>,
    pub(crate) operators: RecordStore<Operator>,
    pub(crate) agents: RecordStore<Agent>,
    pub(crate) monitoring_months: RecordStore<MonitoringMonth>,
    pub(crate) quality_audits: RecordStore<QualityAuditEntry>,
}

/// Records `field` in `changes` and overwrites `slot` when `next` holds a different value.
pub(crate) fn patch_field<T: PartialEq + Serialize>(
    changes: &mut Vec<FieldChange>,
    field: &str,
    slot: &mut T,
    next: Option<T>,
) {
    let Some(next) = next else {
        return;
    };
    if *slot == next {
        return;
    }
    changes.push(FieldChange::new(field, &*slot, &next));
    *slot = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortfolioDraft, PortfolioPatch};
    use crate::IdGenerator;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn portfolio(ids: &mut IdGenerator, name: &str) -> Portfolio {
        Portfolio::from_draft(
            must_ok(ids.next_id()),
            PortfolioDraft {
                name: name.to_string(),
            },
        )
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut ids = IdGenerator::new();
        let mut store = RecordStore::new();
        for name in ["Caixa", "Cobranca", "Retencao"] {
            let _ = must_ok(store.insert(portfolio(&mut ids, name)));
        }

        let names: Vec<&str> = store.list().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Caixa", "Cobranca", "Retencao"]);
    }

    #[test]
    fn update_and_delete_of_unknown_id_report_not_found() {
        let mut ids = IdGenerator::new();
        let mut store: RecordStore<Portfolio> = RecordStore::new();
        let missing = must_ok(ids.next_id());

        let update = store.update(
            missing,
            PortfolioPatch {
                name: Some("X".to_string()),
            },
        );
        assert_eq!(
            update.err(),
            Some(LedgerError::NotFound {
                kind: EntityKind::Portfolio,
                id: missing
            })
        );
        assert!(matches!(
            store.delete(missing),
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[test]
    fn conflicting_update_leaves_record_untouched() {
        let mut ids = IdGenerator::new();
        let mut store = RecordStore::new();
        let _ = must_ok(store.insert(portfolio(&mut ids, "Caixa")));
        let second = must_ok(store.insert(portfolio(&mut ids, "Cobranca"))).id;

        let result = store.update(
            second,
            PortfolioPatch {
                name: Some("Caixa".to_string()),
            },
        );
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
        assert_eq!(
            store.get(second).map(|p| p.name.as_str()),
            Some("Cobranca")
        );
    }

    #[test]
    fn patch_records_only_changed_fields() {
        let mut ids = IdGenerator::new();
        let mut store = RecordStore::new();
        let id = must_ok(store.insert(portfolio(&mut ids, "Caixa"))).id;

        let (_, unchanged) = must_ok(store.update(
            id,
            PortfolioPatch {
                name: Some("Caixa".to_string()),
            },
        ));
        assert!(unchanged.is_empty());

        let (before, changes) = must_ok(store.update(
            id,
            PortfolioPatch {
                name: Some("Caixa Norte".to_string()),
            },
        ));
        assert_eq!(before.name, "Caixa");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "name");
        assert_eq!(changes[0].old_value, serde_json::json!("Caixa"));
        assert_eq!(changes[0].new_value, serde_json::json!("Caixa Norte"));
    }
}
