use crate::error::Error;
use crate::source::{role_by_name, sanitize_column_name, FieldRole, SourceProfile};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use datafusion::arrow::array::{
    Array, ArrayRef, AsArray, Date32Array, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Float64Type, Schema, TimeUnit};
use log::debug;
use std::sync::Arc;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d", "%d-%b-%Y", "%b %d, %Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Coerces every column by its role, then sanitizes the column names.
///
/// Coercion is keyed off the raw names, so it runs over the whole batch before
/// any renaming. Values that fail a coercion become null (dates) or stay as
/// they were (identifiers); nothing here aborts the batch.
pub fn normalize(
    batch: &RecordBatch,
    profile: Option<&SourceProfile>,
) -> Result<RecordBatch, Error> {
    let schema = batch.schema();
    let mut arrays = Vec::with_capacity(batch.num_columns());

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let role = match profile {
            Some(p) => p.role_of(field.name()),
            None => role_by_name(field.name()),
        };

        let coerced = match role {
            FieldRole::Identifier => identifier_column(array),
            FieldRole::Date => date_column(array),
            FieldRole::Time => timestamp_column(array),
            FieldRole::Metric | FieldRole::Passthrough => downcast_integral_floats(array),
        };
        arrays.push(coerced);
    }

    let mut names: Vec<String> = Vec::with_capacity(arrays.len());
    for field in schema.fields() {
        let base = sanitize_column_name(field.name());
        let mut name = base.clone();
        let mut n = 1;
        while names.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        if name != *field.name() {
            debug!("renamed column '{}' to '{}'", field.name(), name);
        }
        names.push(name);
    }

    let fields: Vec<Field> = names
        .into_iter()
        .zip(&arrays)
        .map(|(name, array)| Field::new(name, array.data_type().clone(), true))
        .collect();

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// Identifiers are text; a numeric round trip may have left a ".0" behind.
fn identifier_column(array: &ArrayRef) -> ArrayRef {
    let text = match array.data_type() {
        DataType::Utf8 => array.clone(),
        _ => match cast(array, &DataType::Utf8) {
            Ok(text) => text,
            Err(_) => return array.clone(),
        },
    };

    let truncated: StringArray = text
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(|s| s.split('.').next().unwrap_or(s)))
        .collect();
    Arc::new(truncated)
}

fn date_column(array: &ArrayRef) -> ArrayRef {
    if array.data_type() == &DataType::Date32 {
        return array.clone();
    }
    let days: Date32Array = parse_each(array)
        .into_iter()
        .map(|v| v.map(|dt| date_to_days(dt.date())))
        .collect();
    Arc::new(days)
}

fn timestamp_column(array: &ArrayRef) -> ArrayRef {
    if matches!(
        array.data_type(),
        DataType::Timestamp(TimeUnit::Millisecond, None)
    ) {
        return array.clone();
    }
    let millis: TimestampMillisecondArray = parse_each(array)
        .into_iter()
        .map(|v| v.map(|dt| dt.and_utc().timestamp_millis()))
        .collect();
    Arc::new(millis)
}

fn parse_each(array: &ArrayRef) -> Vec<Option<NaiveDateTime>> {
    match cast(array, &DataType::Utf8) {
        Ok(text) => text
            .as_string::<i32>()
            .iter()
            .map(|v| v.and_then(parse_datetime))
            .collect(),
        Err(_) => vec![None; array.len()],
    }
}

/// Lenient date/time parsing; anything unrecognised is `None`.
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date.and_time(NaiveTime::MIN));
        }
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc())
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    (date - NaiveDateTime::UNIX_EPOCH.date()).num_days() as i32
}

/// Float columns holding only whole numbers become nullable integers.
fn downcast_integral_floats(array: &ArrayRef) -> ArrayRef {
    if array.data_type() != &DataType::Float64 {
        return array.clone();
    }

    let floats = array.as_primitive::<Float64Type>();
    let integral = floats
        .iter()
        .flatten()
        .all(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64);

    if !integral {
        return array.clone();
    }

    let ints: Int64Array = floats.iter().map(|v| v.map(|f| f as i64)).collect();
    Arc::new(ints)
}
