//! Date windows resolved into inclusive reset ranges

use chrono::{Datelike, Months, NaiveDate};
use serde::Deserialize;
use sinkline_core::transform::{coerce_column, SqlType};
use sinkline_core::{Dataset, TransformFailure, Value};

/// Which dates a date-range reset clears.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateWindow {
    /// First day of the previous month through today
    PreviousMonthToToday,
    /// Earliest through latest date present in the fetched dataset
    DatasetSpan,
    Fixed { start: NaiveDate, end: NaiveDate },
}

impl DateWindow {
    /// Inclusive `(start, end)` for this window
    pub fn resolve(
        &self,
        dataset: &Dataset,
        column: &str,
        today: NaiveDate,
    ) -> Result<(NaiveDate, NaiveDate), TransformFailure> {
        match self {
            Self::PreviousMonthToToday => Ok((previous_month_start(today), today)),
            Self::Fixed { start, end } => Ok((*start, *end)),
            Self::DatasetSpan => {
                let (dates, _) = coerce_column(&dataset.column(column)?, SqlType::Date);
                let mut dates = dates.into_iter().filter_map(|v| match v {
                    Value::Date(d) => Some(d),
                    _ => None,
                });
                let first = dates.next().ok_or_else(|| TransformFailure::NoDates {
                    column: column.to_string(),
                })?;
                Ok(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
            }
        }
    }
}

fn previous_month_start(today: NaiveDate) -> NaiveDate {
    let first = today.with_day(1).unwrap_or(today);
    first.checked_sub_months(Months::new(1)).unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn previous_month_crosses_year() {
        let ds = Dataset::empty(&["Datum"]);
        let (start, end) = DateWindow::PreviousMonthToToday
            .resolve(&ds, "Datum", date(2024, 1, 17))
            .unwrap();
        assert_eq!(start, date(2023, 12, 1));
        assert_eq!(end, date(2024, 1, 17));
    }

    #[test]
    fn dataset_span_uses_min_and_max() {
        let ds = Dataset::from_rows(
            vec!["Datum".into()],
            vec![
                vec![Value::from("15-03-2024")],
                vec![Value::Null],
                vec![Value::from("2024-02-01")],
                vec![Value::from("2024-03-31")],
            ],
        )
        .unwrap();
        let span = DateWindow::DatasetSpan.resolve(&ds, "Datum", date(2030, 1, 1)).unwrap();
        assert_eq!(span, (date(2024, 2, 1), date(2024, 3, 31)));
    }

    #[test]
    fn dataset_span_without_dates_fails() {
        let ds = Dataset::from_rows(vec!["Datum".into()], vec![vec![Value::Null]]).unwrap();
        let err = DateWindow::DatasetSpan
            .resolve(&ds, "Datum", date(2024, 1, 1))
            .unwrap_err();
        assert_eq!(err, TransformFailure::NoDates { column: "Datum".into() });
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            window: DateWindow,
        }
        let w: Wrapper = toml::from_str(r#"window = "previous_month_to_today""#).unwrap();
        assert_eq!(w.window, DateWindow::PreviousMonthToToday);
        let w: Wrapper =
            toml::from_str(r#"window = { fixed = { start = "2024-01-01", end = "2024-06-30" } }"#)
                .unwrap();
        assert_eq!(
            w.window,
            DateWindow::Fixed {
                start: date(2024, 1, 1),
                end: date(2024, 6, 30)
            }
        );
    }
}
