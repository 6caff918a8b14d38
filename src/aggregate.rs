use crate::error::Error;
use crate::table::{column, with_column};
use datafusion::arrow::array::{Array, ArrayRef, AsArray, Float64Array, RecordBatch};
use datafusion::arrow::compute::{cast, concat_batches};
use datafusion::arrow::datatypes::{DataType, Float64Type};
use datafusion::functions_aggregate::sum::sum;
use datafusion::logical_expr::{ident, Expr};
use datafusion::prelude::SessionContext;
use log::{debug, warn};
use std::sync::Arc;

/// Grouping keys of the campaign rollup.
pub const ROLLUP_KEYS: [&str; 3] = ["date", "campaign_id", "account_api_id"];

/// Volume metrics summed when the batch carries them.
pub const ROLLUP_METRICS: [&str; 8] = [
    "impressions",
    "clicks",
    "video_views",
    "completed_views",
    "audio_listens",
    "completed_listens",
    "ec_impressions",
    "ec_clicks",
];

///
/// Rolls mapped rows up to one row per day, campaign and account.
///
/// # Arguments
/// * `ctx` - The [`SessionContext`] the grouping runs in
/// * `mapped` - A batch in the unified column layout
///
/// # Returns
/// A Result containing the rollup batch, with `ctr` and `vcr` appended, or an [`Error`]
pub async fn aggregate_campaigns(
    ctx: &SessionContext,
    mapped: &RecordBatch,
) -> Result<RecordBatch, Error> {
    let schema = mapped.schema();

    for key in ROLLUP_KEYS {
        if schema.index_of(key).is_err() {
            return Err(Error::MissingColumn {
                column: key.to_string(),
            });
        }
    }

    let mut metrics = Vec::new();
    for metric in ROLLUP_METRICS {
        match schema.field_with_name(metric) {
            Ok(field) if field.data_type().is_numeric() => metrics.push(metric),
            Ok(field) => warn!(
                "not summing '{}' of non-numeric type {}",
                metric,
                field.data_type()
            ),
            Err(_) => {}
        }
    }

    let keys_present = ROLLUP_KEYS
        .iter()
        .map(|k| ident(*k).is_not_null())
        .reduce(Expr::and)
        .ok_or_else(|| Error::MissingColumn {
            column: "date".to_string(),
        })?;

    let df = ctx
        .read_batch(mapped.clone())?
        .filter(keys_present)?
        .aggregate(
            ROLLUP_KEYS.iter().map(|k| ident(*k)).collect(),
            metrics.iter().map(|m| sum(ident(*m)).alias(*m)).collect(),
        )?
        .sort(
            ROLLUP_KEYS
                .iter()
                .map(|k| ident(*k).sort(true, false))
                .collect(),
        )?;

    let rollup_schema = Arc::new(df.schema().as_arrow().clone());
    let batches = df.collect().await?;
    let rollup = concat_batches(&rollup_schema, &batches)?;
    debug!(
        "rolled {} rows up into {} campaign rows",
        mapped.num_rows(),
        rollup.num_rows()
    );

    let ctr = percentage(&rollup, "clicks", "impressions")?;
    let vcr = percentage(&rollup, "completed_views", "impressions")?;

    let rollup = with_column(&rollup, "ctr", ctr)?;
    with_column(&rollup, "vcr", vcr)
}

/// `100 * numerator / denominator` rounded to two places, null where the
/// denominator is zero or either side is missing.
fn percentage(batch: &RecordBatch, numerator: &str, denominator: &str) -> Result<ArrayRef, Error> {
    let (num, den) = match (column(batch, numerator), column(batch, denominator)) {
        (Some(num), Some(den)) => (cast(num, &DataType::Float64)?, cast(den, &DataType::Float64)?),
        _ => {
            return Ok(Arc::new(Float64Array::from(vec![None::<f64>; batch.num_rows()])));
        }
    };

    let num = num.as_primitive::<Float64Type>();
    let den = den.as_primitive::<Float64Type>();

    let values: Float64Array = (0..batch.num_rows())
        .map(|i| {
            if num.is_null(i) || den.is_null(i) || den.value(i) == 0.0 {
                None
            } else {
                Some(round2(100.0 * num.value(i) / den.value(i)))
            }
        })
        .collect();

    Ok(Arc::new(values))
}

/// Halves round to the even neighbour, matching the rollups already loaded.
fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}
