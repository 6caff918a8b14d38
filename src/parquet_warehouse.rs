use crate::config::Config;
use crate::error::Error;
use crate::warehouse::{retain_unmatched, DeletePredicate, TableRef, Warehouse};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::prelude::SessionContext;
use log::{debug, info};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A warehouse on local disk: one directory per table, one parquet file per
/// append.
#[derive(Clone)]
pub struct ParquetWarehouse {
    root: PathBuf,
}

impl ParquetWarehouse {
    pub fn new(config: &Config) -> Self {
        ParquetWarehouse {
            root: PathBuf::from(&config.warehouse_dir),
        }
    }

    fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(&table.project)
            .join(&table.dataset)
            .join(&table.table)
    }

    /// Reads back every row of a table.
    #[cfg(test)]
    pub fn read_table(&self, table: &TableRef) -> Result<Vec<RecordBatch>, Error> {
        let mut batches = Vec::new();
        for path in part_files(&self.table_dir(table))? {
            let (_, file_batches) = read_part(&path)?;
            batches.extend(file_batches);
        }
        Ok(batches)
    }
}

fn part_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if part_number(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn part_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("part-")?
        .strip_suffix(".parquet")?
        .parse()
        .ok()
}

fn read_part(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>), Error> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let schema = builder.schema().clone();
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// Writes the batches to a uniquely named file inside `dir`, so concurrent
/// writers never share a staging file.
fn stage_part(dir: &Path, schema: SchemaRef, batches: &[RecordBatch]) -> Result<NamedTempFile, Error> {
    let mut staging = tempfile::Builder::new()
        .prefix(".part-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let mut writer = ArrowWriter::try_new(staging.as_file_mut(), schema, None)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(staging)
}

fn next_part_number(dir: &Path) -> Result<u64, Error> {
    Ok(part_files(dir)?
        .iter()
        .filter_map(|p| part_number(p))
        .max()
        .map_or(0, |n| n + 1))
}

#[async_trait::async_trait]
impl Warehouse for ParquetWarehouse {
    async fn delete(&self, table: &TableRef, predicate: &DeletePredicate) -> Result<usize, Error> {
        info!("{}", predicate.delete_statement(table));

        let ctx = SessionContext::new();
        let dir = self.table_dir(table);
        let mut deleted = 0;

        for path in part_files(&dir)? {
            let (schema, batches) = read_part(&path)?;

            let mut kept = Vec::with_capacity(batches.len());
            let mut removed = 0;
            for batch in &batches {
                let (rest, n) = retain_unmatched(&ctx, batch, predicate).await?;
                removed += n;
                if rest.num_rows() > 0 {
                    kept.push(rest);
                }
            }

            if removed == 0 {
                continue;
            }
            if kept.is_empty() {
                debug!("removing {}", path.display());
                fs::remove_file(&path)?;
            } else {
                debug!("rewriting {} without {} rows", path.display(), removed);
                stage_part(&dir, schema, &kept)?
                    .persist(&path)
                    .map_err(|e| e.error)?;
            }
            deleted += removed;
        }

        Ok(deleted)
    }

    async fn append(&self, table: &TableRef, batch: RecordBatch) -> Result<usize, Error> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir)?;

        let mut staging = stage_part(&dir, batch.schema(), std::slice::from_ref(&batch))?;

        // another writer may claim the same part number first
        let path = loop {
            let path = dir.join(format!("part-{:05}.parquet", next_part_number(&dir)?));
            match staging.persist_noclobber(&path) {
                Ok(_) => break path,
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => staging = e.file,
                Err(e) => return Err(e.error.into()),
            }
        };
        debug!("wrote {}", path.display());
        info!("appended {} rows to {}", batch.num_rows(), table);

        Ok(batch.num_rows())
    }
}
