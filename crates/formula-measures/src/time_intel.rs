//! Period windows over the marked date table.
//!
//! Every period function first finds the context's as-of date (the latest visible date), derives a
//! target date set from it, and checks that the date table actually covers that set. Callers then
//! replace the date table's restrictions with the target set, so nested period functions compose:
//! the inner one sees the dates selected by the outer one.

use crate::catalog::DateTable;
use crate::context::FilterContext;
use crate::engine::Evaluator;
use crate::error::{MeasureError, MeasureResult};
use crate::expr::{PeriodFunction, PeriodUnit};
use crate::predicate::Predicate;
use crate::store::AggregateOp;
use crate::value::Value;
use chrono::{Datelike, Days, Months, NaiveDate};
use std::collections::BTreeSet;

/// The dates selected by `function` under `filter`.
///
/// Returns `None` when the context has no visible date, in which case the wrapped expression is
/// BLANK.
pub(crate) fn period_dates(
    evaluator: &Evaluator<'_>,
    function: PeriodFunction,
    filter: &FilterContext,
) -> MeasureResult<Option<BTreeSet<NaiveDate>>> {
    let model = evaluator.model();
    let date_table = model.catalog().date_table()?;
    let visible = evaluator.eligibility(&date_table.table, filter)?;
    let store = model.store();

    let targets = match function {
        PeriodFunction::Shift { count, unit } => {
            let selected =
                store.distinct_values(&date_table.table, &date_table.column, &visible)?;
            let mut shifted = BTreeSet::new();
            for value in selected {
                match value {
                    Value::Blank => {}
                    Value::Date(date) => {
                        shifted.insert(shift_date(date, count, unit)?);
                    }
                    other => return Err(not_a_date(date_table, &other)),
                }
            }
            if shifted.is_empty() {
                return Ok(None);
            }
            shifted
        }
        _ => {
            let as_of = match store.aggregate(
                &date_table.table,
                AggregateOp::Max,
                Some(&date_table.column),
                &visible,
            )? {
                Value::Blank => return Ok(None),
                Value::Date(date) => date,
                other => return Err(not_a_date(date_table, &other)),
            };
            let fiscal_start = model.settings().fiscal_year_start_month;
            match window(function, as_of, fiscal_start)? {
                Some((start, end)) => {
                    log::trace!("{function:?} as of {as_of}: {start}..={end}");
                    start.iter_days().take_while(|d| *d <= end).collect()
                }
                None => BTreeSet::new(),
            }
        }
    };

    ensure_covered(evaluator, date_table, &targets)?;
    Ok(Some(targets))
}

/// Inclusive date range selected by a window function as of `as_of`, or `None` for an empty
/// window.
///
/// `Shift` has no fixed window (it moves the visible dates) and is rejected here.
pub fn window(
    function: PeriodFunction,
    as_of: NaiveDate,
    fiscal_year_start_month: u32,
) -> MeasureResult<Option<(NaiveDate, NaiveDate)>> {
    let range = match function {
        PeriodFunction::ToDate(unit) => {
            Some((unit_start(as_of, unit, fiscal_year_start_month)?, as_of))
        }
        PeriodFunction::Previous(PeriodUnit::Day) => {
            let day = sub_days(as_of, 1)?;
            Some((day, day))
        }
        PeriodFunction::Previous(unit) => {
            let current = unit_start(as_of, unit, fiscal_year_start_month)?;
            let start = add_months(current, -unit_months(unit))?;
            Some((start, sub_days(current, 1)?))
        }
        PeriodFunction::Trailing { count: 0, .. } => None,
        PeriodFunction::Trailing {
            count,
            unit: PeriodUnit::Day,
        } => Some((sub_days(as_of, u64::from(count) - 1)?, as_of)),
        PeriodFunction::Trailing { count, unit } => {
            let months = i32::try_from(count)
                .ok()
                .and_then(|c| c.checked_mul(unit_months(unit)))
                .ok_or_else(|| out_of_range(as_of))?;
            let start = add_months(as_of, -months)?
                .checked_add_days(Days::new(1))
                .ok_or_else(|| out_of_range(as_of))?;
            Some((start, as_of))
        }
        PeriodFunction::Shift { .. } => {
            return Err(MeasureError::Type(
                "shifted periods have no fixed window".into(),
            ))
        }
    };
    Ok(range)
}

/// Move `date` by `count` units. Month-based shifts clamp to the end of shorter months.
pub fn shift_date(date: NaiveDate, count: i32, unit: PeriodUnit) -> MeasureResult<NaiveDate> {
    match unit {
        PeriodUnit::Day => {
            let days = Days::new(u64::from(count.unsigned_abs()));
            if count >= 0 {
                date.checked_add_days(days)
            } else {
                date.checked_sub_days(days)
            }
            .ok_or_else(|| out_of_range(date))
        }
        _ => {
            let months = count
                .checked_mul(unit_months(unit))
                .ok_or_else(|| out_of_range(date))?;
            add_months(date, months)
        }
    }
}

fn unit_start(date: NaiveDate, unit: PeriodUnit, fiscal_year_start_month: u32) -> MeasureResult<NaiveDate> {
    let start = match unit {
        PeriodUnit::Day => Some(date),
        PeriodUnit::Month => date.with_day(1),
        PeriodUnit::Quarter => {
            NaiveDate::from_ymd_opt(date.year(), (date.month() - 1) / 3 * 3 + 1, 1)
        }
        PeriodUnit::Year => {
            let year = if date.month() >= fiscal_year_start_month {
                date.year()
            } else {
                date.year() - 1
            };
            NaiveDate::from_ymd_opt(year, fiscal_year_start_month, 1)
        }
    };
    start.ok_or_else(|| out_of_range(date))
}

fn unit_months(unit: PeriodUnit) -> i32 {
    match unit {
        PeriodUnit::Day => 0,
        PeriodUnit::Month => 1,
        PeriodUnit::Quarter => 3,
        PeriodUnit::Year => 12,
    }
}

fn add_months(date: NaiveDate, months: i32) -> MeasureResult<NaiveDate> {
    let delta = Months::new(months.unsigned_abs());
    if months >= 0 {
        date.checked_add_months(delta)
    } else {
        date.checked_sub_months(delta)
    }
    .ok_or_else(|| out_of_range(date))
}

fn sub_days(date: NaiveDate, days: u64) -> MeasureResult<NaiveDate> {
    date.checked_sub_days(Days::new(days))
        .ok_or_else(|| out_of_range(date))
}

/// Fail with `MissingDateRange` unless every target date exists in the date table.
fn ensure_covered(
    evaluator: &Evaluator<'_>,
    date_table: &DateTable,
    targets: &BTreeSet<NaiveDate>,
) -> MeasureResult<()> {
    let (Some(first), Some(last)) = (targets.first(), targets.last()) else {
        return Ok(());
    };
    let present = evaluator.model().store().distinct_values(
        &date_table.table,
        &date_table.column,
        &Predicate::between(date_table.column.as_str(), *first, *last),
    )?;
    let mut missing = targets
        .iter()
        .filter(|d| !present.contains(&Value::Date(**d)));
    if let Some(start) = missing.next() {
        let end = missing.last().unwrap_or(start);
        return Err(MeasureError::MissingDateRange {
            start: *start,
            end: *end,
        });
    }
    Ok(())
}

fn not_a_date(date_table: &DateTable, value: &Value) -> MeasureError {
    MeasureError::Type(format!(
        "{}[{}] holds {value}, expected a date",
        date_table.table, date_table.column
    ))
}

fn out_of_range(date: NaiveDate) -> MeasureError {
    MeasureError::Type(format!("date arithmetic on {date} is out of range"))
}
