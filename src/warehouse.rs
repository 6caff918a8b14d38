use crate::error::Error;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::Schema;
use datafusion::common::ScalarValue;
use datafusion::logical_expr::{ident, lit, Expr};
use datafusion::prelude::SessionContext;
use std::fmt;

/// Fully qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Self {
        TableRef {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Rows of one account (and optionally one source) inside an inclusive
/// partition range.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletePredicate {
    pub partition_field: String,
    pub min: ScalarValue,
    pub max: ScalarValue,
    pub account_api_id: String,
    pub data_source: Option<String>,
}

impl DeletePredicate {
    pub fn to_expr(&self) -> Expr {
        let field = || ident(self.partition_field.as_str());

        let expr = field()
            .gt_eq(lit(self.min.clone()))
            .and(field().lt_eq(lit(self.max.clone())))
            .and(ident("account_api_id").eq(lit(self.account_api_id.as_str())));

        match &self.data_source {
            Some(source) => expr.and(ident("data_source").eq(lit(source.as_str()))),
            None => expr,
        }
    }

    /// A batch lacking any referenced column can't hold matching rows.
    pub fn applies_to(&self, schema: &Schema) -> bool {
        let mut columns = vec![self.partition_field.as_str(), "account_api_id"];
        if self.data_source.is_some() {
            columns.push("data_source");
        }
        columns.iter().all(|c| schema.index_of(c).is_ok())
    }

    pub fn delete_statement(&self, table: &TableRef) -> String {
        format!("DELETE FROM `{}` WHERE {}", table, self)
    }
}

fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl fmt::Display for DeletePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{field} >= {min} AND {field} <= {max} AND account_api_id = {account}",
            field = self.partition_field,
            min = quoted(&self.min.to_string()),
            max = quoted(&self.max.to_string()),
            account = quoted(&self.account_api_id),
        )?;
        if let Some(source) = &self.data_source {
            write!(f, " AND data_source = {}", quoted(source))?;
        }
        Ok(())
    }
}

/// The two primitives the merge protocol needs from a warehouse. Tables come
/// into existence on their first append.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Deletes every row matching the predicate.
    ///
    /// # Returns
    /// The number of rows removed.
    async fn delete(&self, table: &TableRef, predicate: &DeletePredicate) -> Result<usize, Error>;

    /// Appends a batch as-is.
    ///
    /// # Returns
    /// The number of rows appended.
    async fn append(&self, table: &TableRef, batch: RecordBatch) -> Result<usize, Error>;
}

/// Drops the rows of `batch` the predicate holds for. A NULL predicate keeps
/// the row, as a SQL DELETE would.
pub(crate) async fn retain_unmatched(
    ctx: &SessionContext,
    batch: &RecordBatch,
    predicate: &DeletePredicate,
) -> Result<(RecordBatch, usize), Error> {
    if !predicate.applies_to(&batch.schema()) {
        return Ok((batch.clone(), 0));
    }

    let schema = batch.schema();
    let kept = ctx
        .read_batch(batch.clone())?
        .filter(predicate.to_expr().is_not_true())?
        .collect()
        .await?;
    let kept = concat_batches(&schema, &kept)?;
    let deleted = batch.num_rows() - kept.num_rows();

    Ok((kept, deleted))
}

#[cfg(test)]
pub use memory::MemoryWarehouse;
