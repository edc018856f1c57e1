//! Column renames and destination type coercion

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rustc_hash::FxHashSet;

use crate::dataset::Dataset;
use crate::error::TransformFailure;
use crate::value::Value;

/// Source → destination column renames
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    renames: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn new<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            renames: pairs.into_iter().map(|(a, b)| (a.into(), b.into())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    pub fn apply(&self, dataset: &Dataset) -> Dataset {
        dataset.rename(self.renames.iter().map(|(a, b)| (a.as_str(), b.as_str())))
    }
}

/// Destination column types understood by the coercion step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Int,
    BigInt,
    NVarChar,
    Decimal,
    Bit,
    Date,
    DateTime,
    Time,
}

impl FromStr for SqlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" => Ok(Self::Int),
            "bigint" => Ok(Self::BigInt),
            "nvarchar" => Ok(Self::NVarChar),
            "decimal" => Ok(Self::Decimal),
            "bit" => Ok(Self::Bit),
            "date" => Ok(Self::Date),
            "datetime" => Ok(Self::DateTime),
            "time" => Ok(Self::Time),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::NVarChar => "nvarchar",
            Self::Decimal => "decimal",
            Self::Bit => "bit",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Time => "time",
        };
        f.write_str(name)
    }
}

/// Distinct values that failed a numeric parse, per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoercionReport {
    pub invalid: BTreeMap<String, Vec<String>>,
}

impl CoercionReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }

    /// One warning line per affected column
    pub fn warnings(&self) -> Vec<String> {
        self.invalid
            .iter()
            .map(|(column, values)| {
                format!(
                    "{} invalid value(s) in column '{column}': {values:?}, replaced with 0",
                    values.len()
                )
            })
            .collect()
    }
}

/// Column → destination type, applied in declaration order
#[derive(Debug, Clone, Default)]
pub struct TypeMapping {
    columns: Vec<(String, SqlType)>,
}

impl TypeMapping {
    pub fn new(columns: Vec<(String, SqlType)>) -> Self {
        Self { columns }
    }

    /// Parse `column → type name` pairs; unknown names fail.
    pub fn parse<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, TransformFailure> {
        let mut columns = Vec::new();
        for (column, type_name) in pairs {
            let ty = type_name.parse().map_err(|_| TransformFailure::UnknownType {
                column: column.to_string(),
                type_name: type_name.to_string(),
            })?;
            columns.push((column.to_string(), ty));
        }
        Ok(Self { columns })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Coerce every mapped column. Invalid numerics become 0 and are reported.
    pub fn apply(&self, dataset: &Dataset) -> Result<(Dataset, CoercionReport), TransformFailure> {
        let mut out = dataset.clone();
        let mut report = CoercionReport::default();
        for (column, ty) in &self.columns {
            let values = out.column(column)?;
            let (converted, invalid) = coerce_column(&values, *ty);
            if !invalid.is_empty() {
                report.invalid.insert(column.clone(), invalid);
            }
            out = out.replace_column(column, converted)?;
        }
        Ok((out, report))
    }
}

/// Convert one column; returns the values and the distinct invalid inputs in first-seen order.
pub fn coerce_column(values: &[Value], ty: SqlType) -> (Vec<Value>, Vec<String>) {
    let mut invalid = Vec::new();
    let mut seen = FxHashSet::default();
    let mut note_invalid = |v: &Value| {
        let shown = v.to_string();
        if seen.insert(v.dedup_key()) {
            invalid.push(shown);
        }
    };

    let converted = values
        .iter()
        .map(|v| match ty {
            SqlType::Int | SqlType::BigInt => match parse_number(v) {
                Some(x) => Value::Int(x.trunc() as i64),
                None => {
                    note_invalid(v);
                    Value::Int(0)
                }
            },
            SqlType::Decimal => match parse_number(v) {
                Some(x) => Value::Float(round2(x)),
                None => {
                    note_invalid(v);
                    Value::Float(0.0)
                }
            },
            SqlType::NVarChar => match v {
                Value::Null => Value::Null,
                Value::Text(_) => v.clone(),
                other => Value::Text(other.to_string()),
            },
            SqlType::Bit => parse_bit(v).map_or(Value::Null, Value::Bool),
            SqlType::Date => parse_datetime(v).map_or(Value::Null, |dt| Value::Date(dt.date())),
            SqlType::DateTime => parse_datetime(v).map_or(Value::Null, Value::DateTime),
            SqlType::Time => parse_time(v).map_or(Value::Null, Value::Time),
        })
        .collect();
    (converted, invalid)
}

/// Round half away from zero to 2 fractional digits
fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn parse_number(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(x) if x.is_finite() => Some(*x),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Text(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

fn parse_bit(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Int(1 | -1) => Some(true),
        Value::Int(0) => Some(false),
        Value::Float(x) if *x == 1.0 || *x == -1.0 => Some(true),
        Value::Float(x) if *x == 0.0 => Some(false),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "ja" | "true" | "1" | "-1" => Some(true),
            "nee" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Day-first parsing, dates without time land on midnight
fn parse_datetime(v: &Value) -> Option<NaiveDateTime> {
    match v {
        Value::DateTime(dt) => Some(*dt),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::Int(i) => parse_datetime_str(&i.to_string()),
        Value::Text(s) => parse_datetime_str(s.trim()),
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_time(v: &Value) -> Option<NaiveTime> {
    match v {
        Value::Time(t) => Some(*t),
        Value::DateTime(dt) => Some(dt.time()),
        Value::Text(s) => {
            let s = s.trim();
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .ok()
                .or_else(|| parse_datetime_str(s).map(|dt| dt.time()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(column: &str, values: Vec<Value>) -> Dataset {
        Dataset::from_rows(
            vec![column.to_string()],
            values.into_iter().map(|v| vec![v]).collect(),
        )
        .unwrap()
    }

    #[test]
    fn decimal_rounds_and_zeroes_invalid() {
        let ds = single("Kosten", vec!["12.345".into(), "abc".into(), "7".into()]);
        let mapping = TypeMapping::parse([("Kosten", "decimal")]).unwrap();
        let (out, report) = mapping.apply(&ds).unwrap();
        assert_eq!(
            out.column("Kosten").unwrap(),
            vec![Value::Float(12.35), Value::Float(0.0), Value::Float(7.0)]
        );
        assert_eq!(report.invalid["Kosten"], vec!["abc".to_string()]);
        assert_eq!(report.warnings().len(), 1);
        assert!(report.warnings()[0].contains("\"abc\""));
    }

    #[test]
    fn invalid_values_listed_once() {
        let values: Vec<Value> = vec!["x".into(), "x".into(), "5".into(), "x".into(), "y".into()];
        let (out, invalid) = coerce_column(&values, SqlType::Int);
        assert_eq!(invalid, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(out[2], Value::Int(5));
        assert_eq!(out[0], Value::Int(0));
    }

    #[test]
    fn null_numeric_counts_as_invalid() {
        let (out, invalid) = coerce_column(&[Value::Null, Value::Null], SqlType::BigInt);
        assert_eq!(out, vec![Value::Int(0), Value::Int(0)]);
        assert_eq!(invalid.len(), 1);
    }

    #[test]
    fn int_truncates_fractions() {
        let (out, invalid) = coerce_column(&["12.9".into(), Value::Float(-3.7)], SqlType::Int);
        assert_eq!(out, vec![Value::Int(12), Value::Int(-3)]);
        assert!(invalid.is_empty());
    }

    #[test]
    fn bit_accepts_dutch_and_numeric_flags() {
        let values: Vec<Value> = vec![
            "Ja".into(),
            "nee".into(),
            Value::Int(-1),
            Value::Int(0),
            "misschien".into(),
        ];
        let (out, _) = coerce_column(&values, SqlType::Bit);
        assert_eq!(
            out,
            vec![
                Value::Bool(true),
                Value::Bool(false),
                Value::Bool(true),
                Value::Bool(false),
                Value::Null
            ]
        );
    }

    #[test]
    fn dates_parse_day_first_and_compact() {
        let values: Vec<Value> = vec!["20240131".into(), "31-01-2024".into(), "2024-01-31".into(), "garbage".into()];
        let (out, invalid) = coerce_column(&values, SqlType::Date);
        let d = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(out, vec![Value::Date(d), Value::Date(d), Value::Date(d), Value::Null]);
        assert!(invalid.is_empty());
    }

    #[test]
    fn compact_integer_date() {
        let (out, _) = coerce_column(&[Value::Int(20240131)], SqlType::Date);
        assert_eq!(out[0], Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()));
    }

    #[test]
    fn time_from_text_and_datetime() {
        let values: Vec<Value> = vec!["08:30".into(), "2024-01-31 17:05:00".into()];
        let (out, _) = coerce_column(&values, SqlType::Time);
        assert_eq!(out[0], Value::Time(NaiveTime::from_hms_opt(8, 30, 0).unwrap()));
        assert_eq!(out[1], Value::Time(NaiveTime::from_hms_opt(17, 5, 0).unwrap()));
    }

    #[test]
    fn nvarchar_keeps_nulls() {
        let (out, _) = coerce_column(&[Value::Int(5), Value::Null], SqlType::NVarChar);
        assert_eq!(out, vec![Value::Text("5".into()), Value::Null]);
    }

    #[test]
    fn unknown_type_rejected() {
        let err = TypeMapping::parse([("Bedrag", "money")]).unwrap_err();
        assert_eq!(
            err,
            TransformFailure::UnknownType {
                column: "Bedrag".into(),
                type_name: "money".into()
            }
        );
    }

    #[test]
    fn missing_column_rejected() {
        let ds = single("A", vec![Value::Int(1)]);
        let mapping = TypeMapping::parse([("B", "int")]).unwrap();
        assert!(matches!(
            mapping.apply(&ds),
            Err(TransformFailure::MissingColumn { .. })
        ));
    }

    #[test]
    fn column_mapping_renames() {
        let ds = single("PreTaxCost", vec![Value::Float(1.0)]);
        let out = ColumnMapping::new([("PreTaxCost", "Kosten")]).apply(&ds);
        assert_eq!(out.column_names(), vec!["Kosten"]);
    }
}
