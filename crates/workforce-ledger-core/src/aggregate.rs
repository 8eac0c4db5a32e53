use serde::{Deserialize, Serialize};

use crate::model::{Portfolio, SessionStatus, TrainingSession};
use crate::record::RecordStore;
use crate::RecordId;

/// Session fields that feed portfolio rollups.
pub(crate) const SESSION_ROLLUP_TRIGGERS: &[&str] = &["portfolio_name", "status", "quantity"];

/// Renaming a portfolio makes it pick up the sessions that reference the new name.
pub(crate) const PORTFOLIO_ROLLUP_TRIGGERS: &[&str] = &["name"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PortfolioRollup {
    pub total: u64,
    pub applied: u64,
    pub pending: u64,
    pub completion_rate: f64,
}

/// A portfolio whose stored rollup no longer matches its sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollupDrift {
    pub portfolio_id: RecordId,
    pub name: String,
    pub stored: PortfolioRollup,
    pub expected: PortfolioRollup,
}

/// `applied / total * 100` rounded to one decimal, `0` when `total` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn completion_rate(applied: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = applied as f64 / total as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

/// Recomputes the rollup of `name` from scratch over every session.
#[must_use]
pub fn rollup_for(name: &str, sessions: &[TrainingSession]) -> PortfolioRollup {
    let mut applied = 0_u64;
    let mut pending = 0_u64;
    for session in sessions.iter().filter(|s| s.portfolio_name == name) {
        match session.status {
            SessionStatus::Applied => applied += u64::from(session.quantity),
            SessionStatus::Pending => pending += u64::from(session.quantity),
        }
    }
    let total = applied + pending;
    PortfolioRollup {
        total,
        applied,
        pending,
        completion_rate: completion_rate(applied, total),
    }
}

/// Writes the fresh rollup into every portfolio named `name`.
///
/// Returns whether any stored value changed. An unknown name is a no-op.
pub(crate) fn recompute(
    portfolios: &mut RecordStore<Portfolio>,
    sessions: &[TrainingSession],
    name: &str,
) -> bool {
    let mut changed = false;
    let mut rollup = None;
    for portfolio in portfolios.iter_mut().filter(|p| p.name == name) {
        let fresh = *rollup.get_or_insert_with(|| rollup_for(name, sessions));
        if portfolio.rollup() != fresh {
            portfolio.set_rollup(fresh);
            changed = true;
        }
    }
    changed
}

#[must_use]
pub(crate) fn find_drift(portfolios: &[Portfolio], sessions: &[TrainingSession]) -> Vec<RollupDrift> {
    portfolios
        .iter()
        .filter_map(|portfolio| {
            let expected = rollup_for(&portfolio.name, sessions);
            let stored = portfolio.rollup();
            (stored != expected).then(|| RollupDrift {
                portfolio_id: portfolio.id,
                name: portfolio.name.clone(),
                stored,
                expected,
            })
        })
        .collect()
}
