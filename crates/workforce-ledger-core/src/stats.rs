//! Pure, time-windowed rollups over the ledger's collections.
//!
//! Every function here borrows its input immutably and returns a fresh value, so calling
//! one twice without an intervening mutation yields identical results. Percentages are
//! rendered with two decimals and short-circuit to `"0.00"` on a zero denominator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::model::{
    DailyHeadcount, MonitoringMonth, PortfolioDailyStat, QualityAuditEntry, Section, Termination,
};
use crate::LedgerError;

/// A calendar month; `month` runs from 1 (January) to 12.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Period {
    pub year: i32,
    pub month: u8,
}

impl Period {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `month` is outside `1..=12`.
    pub fn new(year: i32, month: u8) -> Result<Self, LedgerError> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::Validation(format!(
                "month MUST be in 1..=12, got {month}"
            )));
        }
        Ok(Self { year, month })
    }

    /// Builds a period only when both parts are present; otherwise selects all time.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `month` is outside `1..=12`.
    pub fn from_parts(year: Option<i32>, month: Option<u8>) -> Result<Option<Self>, LedgerError> {
        match (year, month) {
            (Some(year), Some(month)) => Self::new(year, month).map(Some),
            _ => Ok(None),
        }
    }

    #[must_use]
    pub fn contains(self, date: Date) -> bool {
        date.year() == self.year && u8::from(date.month()) == self.month
    }
}

fn in_period(period: Option<Period>, date: Date) -> bool {
    period.map_or(true, |period| period.contains(date))
}

/// `numerator / denominator * 100` with two decimals, `"0.00"` when the denominator is 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_percent(numerator: u64, denominator: u64) -> String {
    if denominator == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", numerator as f64 / denominator as f64 * 100.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringStats {
    pub conforme: u64,
    pub inconforme: u64,
    pub total: u64,
    pub media_conforme: String,
    pub media_inconforme: String,
}

/// Sums conforme/inconforme over one month (zero when absent) or over every month.
#[must_use]
pub fn monitoring_stats(months: &[MonitoringMonth], period: Option<Period>) -> MonitoringStats {
    let selected = months.iter().filter(|month| match period {
        Some(period) => month.year == period.year && month.month == period.month,
        None => true,
    });

    let mut conforme = 0_u64;
    let mut inconforme = 0_u64;
    for month in selected {
        conforme += month.conforme_total();
        inconforme += month.inconforme_total();
    }
    let total = conforme + inconforme;

    MonitoringStats {
        conforme,
        inconforme,
        total,
        media_conforme: format_percent(conforme, total),
        media_inconforme: format_percent(inconforme, total),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TiaStats {
    pub entries: usize,
    pub analisados: u64,
    pub quantidade: u64,
    pub media_percent: String,
}

/// Pools every quality audit entry dated inside `period` (or all of them).
#[must_use]
pub fn tia_stats(entries: &[QualityAuditEntry], period: Option<Period>) -> TiaStats {
    let mut count = 0_usize;
    let mut analisados = 0_u64;
    let mut quantidade = 0_u64;
    for entry in entries.iter().filter(|entry| in_period(period, entry.date)) {
        count += 1;
        analisados += u64::from(entry.analisados);
        quantidade += u64::from(entry.quantidade);
    }

    TiaStats {
        entries: count,
        analisados,
        quantidade,
        media_percent: format_percent(analisados, quantidade),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminationStats {
    pub total: u64,
    pub with_notice_period: u64,
    pub from_agency: u64,
    pub by_reason: Vec<ReasonCount>,
}

#[must_use]
pub fn termination_stats(terminations: &[Termination], period: Option<Period>) -> TerminationStats {
    let mut total = 0_u64;
    let mut with_notice_period = 0_u64;
    let mut from_agency = 0_u64;
    let mut reasons: BTreeMap<&str, u64> = BTreeMap::new();
    for termination in terminations
        .iter()
        .filter(|termination| in_period(period, termination.date))
    {
        total += 1;
        if termination.has_notice_period {
            with_notice_period += 1;
        }
        if termination.came_from_agency {
            from_agency += 1;
        }
        *reasons.entry(termination.reason.as_str()).or_default() += 1;
    }

    TerminationStats {
        total,
        with_notice_period,
        from_agency,
        by_reason: reasons
            .into_iter()
            .map(|(reason, count)| ReasonCount {
                reason: reason.to_string(),
                count,
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadcountSummary {
    pub snapshots: usize,
    pub total: u64,
    pub active: u64,
    pub on_vacation: u64,
    pub on_leave: u64,
    pub missing: u64,
    pub on_disability_insurance: u64,
    pub active_rate: String,
}

/// Sums headcount snapshots, optionally for one day and/or one section.
#[must_use]
pub fn headcount_summary(
    headcounts: &[DailyHeadcount],
    date: Option<Date>,
    section: Option<Section>,
) -> HeadcountSummary {
    let mut summary = HeadcountSummary {
        snapshots: 0,
        total: 0,
        active: 0,
        on_vacation: 0,
        on_leave: 0,
        missing: 0,
        on_disability_insurance: 0,
        active_rate: String::new(),
    };
    for snapshot in headcounts.iter().filter(|snapshot| {
        date.map_or(true, |date| snapshot.date == date)
            && section.map_or(true, |section| snapshot.section == section)
    }) {
        summary.snapshots += 1;
        summary.total += u64::from(snapshot.total);
        summary.active += u64::from(snapshot.active);
        summary.on_vacation += u64::from(snapshot.on_vacation);
        summary.on_leave += u64::from(snapshot.on_leave);
        summary.missing += u64::from(snapshot.missing);
        summary.on_disability_insurance += u64::from(snapshot.on_disability_insurance);
    }
    summary.active_rate = format_percent(summary.active, summary.total);
    summary
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttendanceStats {
    pub records: usize,
    pub total: u64,
    pub present: u64,
    pub absent: u64,
    pub presence_rate: String,
}

#[must_use]
pub fn attendance_stats(
    stats: &[PortfolioDailyStat],
    period: Option<Period>,
    portfolio: Option<&str>,
) -> AttendanceStats {
    let mut records = 0_usize;
    let mut total = 0_u64;
    let mut present = 0_u64;
    let mut absent = 0_u64;
    for stat in stats.iter().filter(|stat| {
        in_period(period, stat.date) && portfolio.map_or(true, |name| stat.portfolio == name)
    }) {
        records += 1;
        total += u64::from(stat.total);
        present += u64::from(stat.present);
        absent += u64::from(stat.absent);
    }

    AttendanceStats {
        records,
        total,
        present,
        absent,
        presence_rate: format_percent(present, total),
    }
}
