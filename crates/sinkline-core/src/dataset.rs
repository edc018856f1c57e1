//! Tabular dataset backed by an Arrow `RecordBatch`

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float64Array, Int64Array,
    RecordBatch, RecordBatchOptions, StringArray, Time64MicrosecondArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{
    DataType, Date32Type, Field, Float64Type, Int64Type, Schema, Time64MicrosecondType,
    TimeUnit, TimestampMicrosecondType,
};
use chrono::{NaiveDate, Timelike};

use crate::error::TransformFailure;
use crate::value::Value;

/// Ordered named columns with a shared row count.
///
/// All rows carry the full column set; Arrow enforces equal column lengths.
#[derive(Debug, Clone)]
pub struct Dataset {
    batch: RecordBatch,
}

impl Dataset {
    pub fn from_batch(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Dataset with columns but no rows
    pub fn empty(columns: &[&str]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        Self::from_rows(columns, Vec::new()).unwrap_or_else(|_| unreachable!("no rows to be ragged"))
    }

    /// Build from row-major values, inferring one Arrow type per column.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, TransformFailure> {
        let width = columns.len();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(TransformFailure::RaggedRow {
                    row: i,
                    expected: width,
                    found: row.len(),
                });
            }
        }

        let mut per_column: Vec<Vec<Value>> = (0..width).map(|_| Vec::with_capacity(rows.len())).collect();
        for row in rows.iter() {
            for (col, value) in row.iter().enumerate() {
                per_column[col].push(value.clone());
            }
        }

        let mut fields = Vec::with_capacity(width);
        let mut arrays = Vec::with_capacity(width);
        for (name, values) in columns.iter().zip(per_column) {
            let data_type = infer_type(&values);
            arrays.push(build_array(&values, &data_type));
            fields.push(Field::new(name, data_type, true));
        }
        Ok(Self::assemble(fields, arrays, rows.len()))
    }

    fn assemble(fields: Vec<Field>, arrays: Vec<ArrayRef>, num_rows: usize) -> Self {
        let schema = Arc::new(Schema::new(fields));
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch = RecordBatch::try_new_with_options(schema, arrays, &options)
            .unwrap_or_else(|e| unreachable!("columns are built with matching lengths: {e}"));
        Self { batch }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.batch.schema().index_of(name).is_ok()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// All values of a named column
    pub fn column(&self, name: &str) -> Result<Vec<Value>, TransformFailure> {
        let idx = self.index_of(name)?;
        let array = self.batch.column(idx);
        Ok((0..self.num_rows()).map(|r| value_at(array, r)).collect())
    }

    /// All values of one row, in column order
    pub fn row(&self, row: usize) -> Vec<Value> {
        self.batch
            .columns()
            .iter()
            .map(|array| value_at(array, row))
            .collect()
    }

    /// Row-major copy of every row
    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.num_rows()).map(|r| self.row(r)).collect()
    }

    /// Zero-copy contiguous slice
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, len),
        }
    }

    /// Rename columns; names not present are ignored.
    pub fn rename<'a>(&self, renames: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let renames: Vec<(&str, &str)> = renames.into_iter().collect();
        let schema = self.batch.schema();
        let fields: Vec<Field> = schema
            .fields()
            .iter()
            .map(|f| {
                match renames.iter().find(|(from, _)| *from == f.name().as_str()) {
                    Some((_, to)) => f.as_ref().clone().with_name(*to),
                    None => f.as_ref().clone(),
                }
            })
            .collect();
        Self::assemble(fields, self.batch.columns().to_vec(), self.num_rows())
    }

    /// Replace one column's values, re-inferring its type
    pub fn replace_column(&self, name: &str, values: Vec<Value>) -> Result<Self, TransformFailure> {
        let idx = self.index_of(name)?;
        if values.len() != self.num_rows() {
            return Err(TransformFailure::RaggedRow {
                row: idx,
                expected: self.num_rows(),
                found: values.len(),
            });
        }
        let data_type = infer_type(&values);
        let mut fields: Vec<Field> = self
            .batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        let mut arrays = self.batch.columns().to_vec();
        fields[idx] = Field::new(name, data_type.clone(), true);
        arrays[idx] = build_array(&values, &data_type);
        Ok(Self::assemble(fields, arrays, self.num_rows()))
    }

    /// Append a column holding the same value in every row
    pub fn with_constant_column(&self, name: &str, value: Value) -> Self {
        let values = vec![value; self.num_rows()];
        let data_type = infer_type(&values);
        let mut fields: Vec<Field> = self
            .batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        let mut arrays = self.batch.columns().to_vec();
        fields.push(Field::new(name, data_type.clone(), true));
        arrays.push(build_array(&values, &data_type));
        Self::assemble(fields, arrays, self.num_rows())
    }

    fn index_of(&self, name: &str) -> Result<usize, TransformFailure> {
        self.batch
            .schema()
            .index_of(name)
            .map_err(|_| TransformFailure::MissingColumn {
                column: name.to_string(),
            })
    }
}

/// Pick the Arrow type for a column from its values.
///
/// First non-null value decides; int+float widens to float, any other mix is text.
fn infer_type(values: &[Value]) -> DataType {
    let mut inferred: Option<DataType> = None;
    for value in values {
        let current = match value {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            Value::Text(_) => DataType::Utf8,
            Value::Date(_) => DataType::Date32,
            Value::DateTime(_) => DataType::Timestamp(TimeUnit::Microsecond, None),
            Value::Time(_) => DataType::Time64(TimeUnit::Microsecond),
        };
        inferred = Some(match inferred {
            None => current,
            Some(prev) if prev == current => prev,
            Some(DataType::Int64 | DataType::Float64)
                if matches!(current, DataType::Int64 | DataType::Float64) =>
            {
                DataType::Float64
            }
            Some(_) => return DataType::Utf8,
        });
    }
    inferred.unwrap_or(DataType::Utf8)
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn build_array(values: &[Value], data_type: &DataType) -> ArrayRef {
    match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Float(x) => Some(*x),
                    Value::Int(i) => Some(*i as f64),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Date32 => Arc::new(Date32Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Date(d) => Some(d.signed_duration_since(epoch()).num_days() as i32),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Timestamp(TimeUnit::Microsecond, None) => Arc::new(TimestampMicrosecondArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::DateTime(dt) => Some(dt.and_utc().timestamp_micros()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Time64(TimeUnit::Microsecond) => Arc::new(Time64MicrosecondArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Time(t) => Some(
                        i64::from(t.num_seconds_from_midnight()) * 1_000_000
                            + i64::from(t.nanosecond() / 1_000),
                    ),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>(),
        )),
    }
}

fn value_at(array: &ArrayRef, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::Date32 => array
            .as_primitive::<Date32Type>()
            .value_as_date(row)
            .map_or(Value::Null, Value::Date),
        DataType::Timestamp(TimeUnit::Microsecond, _) => array
            .as_primitive::<TimestampMicrosecondType>()
            .value_as_datetime(row)
            .map_or(Value::Null, Value::DateTime),
        DataType::Time64(TimeUnit::Microsecond) => array
            .as_primitive::<Time64MicrosecondType>()
            .value_as_time(row)
            .map_or(Value::Null, Value::Time),
        _ => arrow::util::display::array_value_to_string(array, row)
            .map_or(Value::Null, Value::Text),
    }
}
