use crate::error::Error;
use crate::table::{column, constant_utf8, with_column};
use crate::warehouse::{DeletePredicate, TableRef, Warehouse};
use datafusion::arrow::array::{Array, RecordBatch};
use datafusion::arrow::compute::{filter_record_batch, is_not_null};
use datafusion::common::ScalarValue;
use datafusion::functions_aggregate::min_max::{max, min};
use datafusion::logical_expr::ident;
use datafusion::prelude::SessionContext;
use log::{info, warn};

pub const ACCOUNT_COLUMN: &str = "account_api_id";
pub const SOURCE_TAG_COLUMN: &str = "data_source";

/// Where a batch is merged and which slice of the table it owns.
#[derive(Debug, Clone)]
pub struct MergeTarget {
    pub table: TableRef,
    pub partition_field: String,
    pub account_api_id: String,
    /// Set for tables shared between sources.
    pub source_tag: Option<String>,
}

/// Outcome of one merge-load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLoad {
    pub table: TableRef,
    pub deleted: usize,
    pub appended: usize,
}

///
/// Replaces the target's rows for the batch's partition range with the batch.
///
/// Deletes every row of the same account (and source tag, if any) whose
/// partition value lies within the batch's inclusive min/max, then appends the
/// batch. Running it again with the same batch converges to the same table.
/// The two steps are not atomic: a failure in between leaves the range empty
/// until the next successful run.
///
/// # Arguments
/// * `ctx` - The [`SessionContext`] used to derive the range
/// * `warehouse` - The [`Warehouse`] holding the target table
/// * `target` - The [`MergeTarget`] describing table, partition field and owner
/// * `batch` - The rows to load
///
/// # Returns
/// A Result containing a [`TableLoad`] or an [`Error`]
pub async fn merge_load(
    ctx: &SessionContext,
    warehouse: &dyn Warehouse,
    target: &MergeTarget,
    batch: &RecordBatch,
) -> Result<TableLoad, Error> {
    if batch.num_rows() == 0 {
        info!("no rows for {}, leaving it untouched", target.table);
        return Ok(TableLoad {
            table: target.table.clone(),
            deleted: 0,
            appended: 0,
        });
    }

    match column(batch, ACCOUNT_COLUMN) {
        Some(accounts) if accounts.null_count() == 0 => {}
        _ => {
            return Err(Error::MissingAccountId {
                table: target.table.to_string(),
            })
        }
    }

    let (min_value, max_value) = partition_range(ctx, batch, target).await?;
    let batch = drop_unpartitioned(batch, target)?;

    let predicate = DeletePredicate {
        partition_field: target.partition_field.clone(),
        min: min_value,
        max: max_value,
        account_api_id: target.account_api_id.clone(),
        data_source: target.source_tag.clone(),
    };
    let deleted = warehouse.delete(&target.table, &predicate).await?;

    let batch = match &target.source_tag {
        Some(tag) => with_column(
            &batch,
            SOURCE_TAG_COLUMN,
            constant_utf8(tag, batch.num_rows()),
        )?,
        None => batch,
    };
    let appended = warehouse.append(&target.table, batch).await?;

    info!(
        "merged {}: {} rows replaced by {}",
        target.table, deleted, appended
    );

    Ok(TableLoad {
        table: target.table.clone(),
        deleted,
        appended,
    })
}

/// Rows without a partition value fall outside every delete range, so no
/// later load could replace them.
fn drop_unpartitioned(batch: &RecordBatch, target: &MergeTarget) -> Result<RecordBatch, Error> {
    let Some(partition) = column(batch, &target.partition_field) else {
        return Ok(batch.clone());
    };
    if partition.null_count() == 0 {
        return Ok(batch.clone());
    }

    warn!(
        "dropping {} rows without a {} value from the load into {}",
        partition.null_count(),
        target.partition_field,
        target.table
    );
    Ok(filter_record_batch(batch, &is_not_null(partition.as_ref())?)?)
}

async fn partition_range(
    ctx: &SessionContext,
    batch: &RecordBatch,
    target: &MergeTarget,
) -> Result<(ScalarValue, ScalarValue), Error> {
    if column(batch, &target.partition_field).is_none() {
        return Err(Error::MissingColumn {
            column: target.partition_field.clone(),
        });
    }

    let field = || ident(target.partition_field.as_str());
    let range = ctx
        .read_batch(batch.clone())?
        .aggregate(
            vec![],
            vec![min(field()).alias("min_value"), max(field()).alias("max_value")],
        )?
        .collect()
        .await?;

    let empty = || Error::EmptyPartitionRange {
        table: target.table.to_string(),
        field: target.partition_field.clone(),
    };

    let row = range.iter().find(|b| b.num_rows() > 0).ok_or_else(empty)?;
    let min_value = ScalarValue::try_from_array(row.column(0), 0)?;
    let max_value = ScalarValue::try_from_array(row.column(1), 0)?;

    if min_value.is_null() || max_value.is_null() {
        return Err(empty());
    }

    Ok((min_value, max_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::date_to_days;
    use crate::warehouse::{MemoryWarehouse, MockWarehouse};
    use chrono::NaiveDate;
    use datafusion::arrow::array::{ArrayRef, AsArray, Date32Array, Int64Array, StringArray};
    use datafusion::arrow::compute::concat_batches;
    use datafusion::arrow::datatypes::Int64Type;
    use datafusion::error::DataFusionError;
    use std::sync::Arc;

    fn day(d: u32) -> i32 {
        date_to_days(NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
    }

    fn batch(rows: &[(u32, &str, i64)]) -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            (
                "date",
                Arc::new(Date32Array::from(
                    rows.iter().map(|r| day(r.0)).collect::<Vec<_>>(),
                )) as ArrayRef,
            ),
            (
                "account_api_id",
                Arc::new(StringArray::from(
                    rows.iter().map(|r| r.1).collect::<Vec<_>>(),
                )) as ArrayRef,
            ),
            (
                "clicks",
                Arc::new(Int64Array::from(
                    rows.iter().map(|r| r.2).collect::<Vec<_>>(),
                )) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    fn target(account: &str, tag: Option<&str>) -> MergeTarget {
        MergeTarget {
            table: TableRef::new("proj", "datawarehouse", "report"),
            partition_field: "date".to_string(),
            account_api_id: account.to_string(),
            source_tag: tag.map(str::to_string),
        }
    }

    async fn total_clicks(warehouse: &MemoryWarehouse, table: &TableRef) -> i64 {
        warehouse
            .batches(table)
            .await
            .iter()
            .map(|b| {
                column(b, "clicks")
                    .unwrap()
                    .as_primitive::<Int64Type>()
                    .iter()
                    .flatten()
                    .sum::<i64>()
            })
            .sum()
    }

    #[tokio::test]
    async fn test_merge_load_is_idempotent() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let target = target("acc", None);
        let rows = batch(&[(1, "acc", 3), (2, "acc", 4)]);

        merge_load(&ctx, &warehouse, &target, &rows).await?;
        let once = warehouse.batches(&target.table).await;
        let load = merge_load(&ctx, &warehouse, &target, &rows).await?;
        let twice = warehouse.batches(&target.table).await;

        assert_eq!(load.deleted, 2);
        assert_eq!(load.appended, 2);
        let schema = once[0].schema();
        assert_eq!(
            concat_batches(&schema, &once)?,
            concat_batches(&schema, &twice)?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_without_partition_value_do_not_accumulate() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let target = target("acc", None);
        let rows = RecordBatch::try_from_iter(vec![
            (
                "date",
                Arc::new(Date32Array::from(vec![Some(day(1)), None])) as ArrayRef,
            ),
            (
                "account_api_id",
                Arc::new(StringArray::from(vec!["acc", "acc"])) as ArrayRef,
            ),
        ])
        .unwrap();

        let first = merge_load(&ctx, &warehouse, &target, &rows).await?;
        for _ in 0..2 {
            merge_load(&ctx, &warehouse, &target, &rows).await?;
        }

        assert_eq!(first.appended, 1);
        assert_eq!(warehouse.num_rows(&target.table).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_load_isolates_range_and_account() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let table = target("acc", None).table;

        merge_load(&ctx, &warehouse, &target("other", None), &batch(&[(2, "other", 100)])).await?;
        merge_load(
            &ctx,
            &warehouse,
            &target("acc", None),
            &batch(&[(1, "acc", 10), (5, "acc", 20)]),
        )
        .await?;

        // overlaps day 2 only for "acc"; day 1 and day 5 stay
        let load = merge_load(
            &ctx,
            &warehouse,
            &target("acc", None),
            &batch(&[(2, "acc", 1), (3, "acc", 1)]),
        )
        .await?;

        assert_eq!(load.deleted, 0);
        assert_eq!(warehouse.num_rows(&table).await, 5);
        assert_eq!(total_clicks(&warehouse, &table).await, 132);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_load_replaces_overlapping_range() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let target = target("acc", None);

        merge_load(&ctx, &warehouse, &target, &batch(&[(1, "acc", 10), (2, "acc", 20), (3, "acc", 30)]))
            .await?;
        let load = merge_load(&ctx, &warehouse, &target, &batch(&[(2, "acc", 5)])).await?;

        assert_eq!(load.deleted, 1);
        assert_eq!(total_clicks(&warehouse, &target.table).await, 45);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_load_isolates_sources() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let rows = batch(&[(1, "acc", 3)]);

        merge_load(&ctx, &warehouse, &target("acc", Some("cm_1")), &rows).await?;
        merge_load(&ctx, &warehouse, &target("acc", Some("dv_1")), &rows).await?;
        let load = merge_load(&ctx, &warehouse, &target("acc", Some("dv_1")), &rows).await?;

        assert_eq!(load.deleted, 1);
        let table = target("acc", None).table;
        assert_eq!(warehouse.num_rows(&table).await, 2);

        let tags: Vec<String> = warehouse
            .batches(&table)
            .await
            .iter()
            .map(|b| column(b, SOURCE_TAG_COLUMN).unwrap().as_string::<i32>().value(0).to_string())
            .collect();
        assert_eq!(tags, vec!["cm_1", "dv_1"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_load_empty_batch_is_noop() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let target = target("acc", None);

        let load = merge_load(&ctx, &warehouse, &target, &batch(&[])).await?;
        assert_eq!(load.appended, 0);
        assert!(warehouse.batches(&target.table).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_load_requires_account() {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let rows = RecordBatch::try_from_iter(vec![(
            "date",
            Arc::new(Date32Array::from(vec![day(1)])) as ArrayRef,
        )])
        .unwrap();

        let result = merge_load(&ctx, &warehouse, &target("acc", None), &rows).await;
        assert!(matches!(result.unwrap_err(), Error::MissingAccountId { .. }));
    }

    #[tokio::test]
    async fn test_merge_load_all_null_partition() {
        let ctx = SessionContext::new();
        let warehouse = MemoryWarehouse::new();
        let rows = RecordBatch::try_from_iter(vec![
            (
                "date",
                Arc::new(Date32Array::from(vec![None::<i32>])) as ArrayRef,
            ),
            ("account_api_id", Arc::new(StringArray::from(vec!["acc"])) as ArrayRef),
        ])
        .unwrap();

        let result = merge_load(&ctx, &warehouse, &target("acc", None), &rows).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::EmptyPartitionRange { field, .. } if field == "date"
        ));
    }

    #[tokio::test]
    async fn test_merge_load_surfaces_delete_failure() {
        let ctx = SessionContext::new();
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_delete()
            .returning(|_, _| Err(Error::DataFusion(DataFusionError::Execution("boom".into()))));
        warehouse.expect_append().never();

        let result = merge_load(&ctx, &warehouse, &target("acc", None), &batch(&[(1, "acc", 1)])).await;
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Merge);
    }

    #[tokio::test]
    async fn test_merge_load_passes_range_to_delete() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_delete()
            .withf(|table, predicate| {
                table.table == "report"
                    && predicate.min == ScalarValue::Date32(Some(day(2)))
                    && predicate.max == ScalarValue::Date32(Some(day(9)))
                    && predicate.account_api_id == "acc"
                    && predicate.data_source.as_deref() == Some("dv_1")
            })
            .times(1)
            .returning(|_, _| Ok(0));
        warehouse
            .expect_append()
            .withf(|_, batch| column(batch, SOURCE_TAG_COLUMN).is_some())
            .times(1)
            .returning(|_, batch| Ok(batch.num_rows()));

        let load = merge_load(
            &ctx,
            &warehouse,
            &target("acc", Some("dv_1")),
            &batch(&[(9, "acc", 1), (2, "acc", 1), (5, "acc", 1)]),
        )
        .await?;
        assert_eq!(load.appended, 3);
        Ok(())
    }
}
