use crate::error::Error;
use crate::source::MappingTable;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{Field, Schema};
use log::debug;
use std::sync::Arc;

/// Renames the mapped columns and drops every other one.
///
/// Output columns follow the mapping table's order. Mapped columns the batch
/// does not carry are simply absent from the result.
pub fn map_columns(batch: &RecordBatch, mapping: &MappingTable) -> Result<RecordBatch, Error> {
    let schema = batch.schema();
    let mut fields = Vec::new();
    let mut arrays = Vec::new();

    for entry in mapping.fields {
        if let Ok(idx) = schema.index_of(entry.source) {
            let array = batch.column(idx).clone();
            fields.push(Field::new(entry.target, array.data_type().clone(), true));
            arrays.push(array);
        }
    }

    debug!(
        "mapping v{} kept {} of {} columns",
        mapping.version,
        arrays.len(),
        batch.num_columns()
    );

    if arrays.is_empty() {
        return Err(Error::MissingColumn {
            column: "any mapped column".to_string(),
        });
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}
