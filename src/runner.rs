use crate::aggregate::aggregate_campaigns;
use crate::config::Config;
use crate::error::Error;
use crate::event::{FileKind, ObjectPath, StorageEvent};
use crate::extract::extract;
use crate::mapping::map_columns;
use crate::merge::{merge_load, MergeTarget, TableLoad, ACCOUNT_COLUMN};
use crate::normalize::{date_to_days, normalize};
use crate::object_source::{HttpObjectSource, LocalObjectSource, ObjectSource};
use crate::parquet_warehouse::ParquetWarehouse;
use crate::source::Source;
use crate::table::{constant_utf8, with_column};
use crate::warehouse::{TableRef, Warehouse};
use chrono::{NaiveDate, Utc};
use datafusion::arrow::array::Date32Array;
use datafusion::prelude::SessionContext;
use log::{debug, info};
use std::sync::Arc;

/// Dataset holding the tables shared by every source.
pub const WAREHOUSE_DATASET: &str = "datawarehouse";
pub const ROLLUP_TABLE: &str = "campaign_performance";

const UNIFIED_PARTITION_FIELD: &str = "date";
/// JSON feeds carry no per-row date; they are partitioned by ingestion day.
const INGESTION_PARTITION_FIELD: &str = "Date";
/// Only report tables are mapped into the shared tables.
const MAPPED_TABLE_SUFFIX: &str = "report";

/// What one invocation did to the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub object: String,
    pub loads: Vec<TableLoad>,
    pub skipped: Option<String>,
}

impl LoadReport {
    fn skipped(object: &str, reason: String) -> Self {
        info!("skipping {}: {}", object, reason);
        LoadReport {
            object: object.to_string(),
            loads: vec![],
            skipped: Some(reason),
        }
    }

    pub fn rows_loaded(&self) -> usize {
        self.loads.iter().map(|l| l.appended).sum()
    }
}

/// Loads the object named by a storage event using the configured object
/// source and the on-disk warehouse.
pub async fn handle_event(config: &Config, event: &StorageEvent) -> Result<LoadReport, Error> {
    let objects: Box<dyn ObjectSource> = match &config.object_base_url {
        Some(base_url) => Box::new(HttpObjectSource::new(base_url, config)),
        None => Box::new(LocalObjectSource::new(config)),
    };
    let warehouse = ParquetWarehouse::new(config);

    ingest_object(
        objects.as_ref(),
        &warehouse,
        &config.project_id,
        event,
        Utc::now().date_naive(),
    )
    .await
}

///
/// Extracts, normalizes and merges one object into the warehouse.
///
/// # Arguments
/// * `objects` - Where the object is downloaded from
/// * `warehouse` - Where the tables live
/// * `project_id` - The warehouse project all tables belong to
/// * `event` - The storage event naming the object
/// * `ingestion_date` - The partition date given to JSON feeds
///
/// # Returns
/// A Result containing a [`LoadReport`] or an [`Error`]
pub async fn ingest_object(
    objects: &dyn ObjectSource,
    warehouse: &dyn Warehouse,
    project_id: &str,
    event: &StorageEvent,
    ingestion_date: NaiveDate,
) -> Result<LoadReport, Error> {
    info!("received gs://{}/{}", event.bucket, event.name);

    let path = ObjectPath::parse(&event.name)?;
    let profile = Source::detect(&path.dataset_id);
    if let Some(p) = profile {
        debug!("{} is a {:?} dataset", path.dataset_id, p.source);
    }

    let Some(kind) = path.kind else {
        return Ok(LoadReport::skipped(
            &event.name,
            "unsupported file extension".to_string(),
        ));
    };

    let partition_field = match (kind, profile) {
        (FileKind::Json, Some(p)) if p.json_records_key.is_some() => INGESTION_PARTITION_FIELD,
        (FileKind::Csv, Some(p)) => p.partition_field,
        _ => {
            return Ok(LoadReport::skipped(
                &event.name,
                format!("no loader for {:?} files of dataset {}", kind, path.dataset_id),
            ))
        }
    };

    let content = objects.fetch(&event.bucket, &event.name).await?;
    let Some(raw) = extract(kind, profile, &content)? else {
        return Ok(LoadReport::skipped(
            &event.name,
            "nothing to extract".to_string(),
        ));
    };
    info!("extracted {} rows from {}", raw.num_rows(), event.name);

    let rows = raw.num_rows();
    let mut canonical = normalize(&raw, profile)?;
    canonical = with_column(
        &canonical,
        ACCOUNT_COLUMN,
        constant_utf8(&path.account_api_id, rows),
    )?;
    if kind == FileKind::Json {
        let today = Date32Array::from(vec![date_to_days(ingestion_date); rows]);
        canonical = with_column(&canonical, INGESTION_PARTITION_FIELD, Arc::new(today))?;
    }

    let ctx = SessionContext::new();
    let mut loads = Vec::with_capacity(3);

    let raw_target = MergeTarget {
        table: TableRef::new(
            project_id,
            &path.dataset_id,
            &format!("{}_{}", path.account_api_id, path.table_name),
        ),
        partition_field: partition_field.to_string(),
        account_api_id: path.account_api_id.clone(),
        source_tag: None,
    };
    loads.push(merge_load(&ctx, warehouse, &raw_target, &canonical).await?);

    let mapping = profile.and_then(|p| p.mapping);
    match mapping {
        Some(mapping) if raw_target.table.table.ends_with(MAPPED_TABLE_SUFFIX) => {
            let mapped = map_columns(&canonical, mapping)?;
            let rollup = aggregate_campaigns(&ctx, &mapped).await?;

            let shared = |table: &str| MergeTarget {
                table: TableRef::new(project_id, WAREHOUSE_DATASET, table),
                partition_field: UNIFIED_PARTITION_FIELD.to_string(),
                account_api_id: path.account_api_id.clone(),
                source_tag: Some(path.dataset_id.clone()),
            };

            loads.push(merge_load(&ctx, warehouse, &shared(&path.table_name), &mapped).await?);
            loads.push(merge_load(&ctx, warehouse, &shared(ROLLUP_TABLE), &rollup).await?);
        }
        Some(_) => info!("{} is not a report table, not mapping it", raw_target.table),
        None => {}
    }

    Ok(LoadReport {
        object: event.name.clone(),
        loads,
        skipped: None,
    })
}
