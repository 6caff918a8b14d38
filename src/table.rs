use crate::error::Error;
use crate::source::FieldRole;
use datafusion::arrow::array::{
    ArrayRef, BinaryArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use datafusion::arrow::datatypes::{Field, Schema};
use std::sync::Arc;

/// Markers the exports use for "no value".
const NA_VALUES: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-NaN", "-nan", "<NA>", "N/A", "NA", "NULL", "NaN", "None",
    "n/a", "nan", "null",
];

/// A single extracted value before the column type is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    /// Serialized JSON for values a warehouse column can't hold directly.
    Bytes(Vec<u8>),
}

impl Cell {
    fn as_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::Text(s) => Some(s.clone()),
            Cell::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Cell::Bytes(b) => Some(b.clone()),
            other => other.as_text().map(String::into_bytes),
        }
    }
}

/// Accumulates named columns in first-seen order.
#[derive(Debug, Default)]
pub struct TableBuilder {
    names: Vec<String>,
    columns: Vec<Vec<Cell>>,
    rows: usize,
    infer_text: bool,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder whose text cells are numerically typed per column on finish.
    pub fn for_csv() -> Self {
        TableBuilder {
            infer_text: true,
            ..Self::default()
        }
    }

    /// Registers columns up front so they survive even when no row follows.
    pub fn declare_columns(&mut self, names: &[String]) {
        for name in names {
            if !self.names.contains(name) {
                self.names.push(name.clone());
                self.columns.push(vec![Cell::Null; self.rows]);
            }
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Appends one row given as (column, value) pairs. Columns first seen in a
    /// later row are back-filled with nulls.
    pub fn push_row<I>(&mut self, row: I)
    where
        I: IntoIterator<Item = (String, Cell)>,
    {
        for (name, cell) in row {
            let idx = match self.names.iter().position(|n| *n == name) {
                Some(idx) => idx,
                None => {
                    self.names.push(name);
                    self.columns.push(vec![Cell::Null; self.rows]);
                    self.columns.len() - 1
                }
            };
            if self.columns[idx].len() == self.rows {
                self.columns[idx].push(cell);
            } else {
                // a repeated key overwrites the earlier value of the same row
                self.columns[idx][self.rows] = cell;
            }
        }
        self.rows += 1;
        for column in &mut self.columns {
            column.resize(self.rows, Cell::Null);
        }
    }

    /// Settles each column's type and builds the batch. `role_of` receives the
    /// raw column name.
    pub fn finish<F>(self, role_of: F) -> Result<RecordBatch, Error>
    where
        F: Fn(&str) -> FieldRole,
    {
        let mut fields = Vec::with_capacity(self.names.len());
        let mut arrays = Vec::with_capacity(self.names.len());

        for (name, cells) in self.names.into_iter().zip(self.columns) {
            let role = role_of(&name);
            let cells = if self.infer_text && role != FieldRole::Identifier {
                infer_text_column(cells)
            } else {
                cells
            };
            let array = build_array(cells, role);
            fields.push(Field::new(name, array.data_type().clone(), true));
            arrays.push(array);
        }

        if arrays.is_empty() {
            return Err(Error::EmptyFile);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

/// Turns a raw CSV field into a cell; numeric typing happens per column.
pub fn csv_cell(raw: &str) -> Cell {
    if NA_VALUES.contains(&raw) {
        Cell::Null
    } else {
        Cell::Text(raw.to_string())
    }
}

/// Types a column of CSV text the way a dataframe reader would: integers if
/// every value is one, floats if every value is one, text otherwise.
pub fn infer_text_column(cells: Vec<Cell>) -> Vec<Cell> {
    let texts = || {
        cells.iter().filter_map(|c| match c {
            Cell::Text(s) => Some(s.trim()),
            _ => None,
        })
    };

    if texts().all(|s| s.parse::<i64>().is_ok()) {
        cells
            .into_iter()
            .map(|c| match c {
                Cell::Text(s) => s.trim().parse().map(Cell::Int).unwrap_or(Cell::Null),
                other => other,
            })
            .collect()
    } else if texts().all(|s| s.parse::<f64>().is_ok()) {
        cells
            .into_iter()
            .map(|c| match c {
                Cell::Text(s) => s.trim().parse().map(Cell::Float).unwrap_or(Cell::Null),
                other => other,
            })
            .collect()
    } else {
        cells
    }
}

fn build_array(cells: Vec<Cell>, role: FieldRole) -> ArrayRef {
    let has = |pred: fn(&Cell) -> bool| cells.iter().any(pred);

    if has(|c| matches!(c, Cell::Bytes(_))) {
        let values: Vec<Option<Vec<u8>>> = cells.iter().map(Cell::as_bytes).collect();
        return Arc::new(BinaryArray::from_iter(values));
    }

    if role == FieldRole::Identifier || has(|c| matches!(c, Cell::Text(_))) {
        let values: Vec<Option<String>> = cells.iter().map(Cell::as_text).collect();
        return Arc::new(StringArray::from(values));
    }

    if has(|c| matches!(c, Cell::Float(_))) {
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                Cell::Int(i) => Some(*i as f64),
                Cell::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        return Arc::new(Float64Array::from(values));
    }

    if has(|c| matches!(c, Cell::Int(_))) {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                Cell::Int(i) => Some(*i),
                _ => None,
            })
            .collect();
        return Arc::new(Int64Array::from(values));
    }

    // all-null column
    Arc::new(StringArray::from(vec![None::<String>; cells.len()]))
}

/// Returns the column with the given name, if present.
pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a ArrayRef> {
    batch
        .schema()
        .index_of(name)
        .ok()
        .map(|idx| batch.column(idx))
}

/// Appends (or replaces) a column on a batch.
pub fn with_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch, Error> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len() + 1);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len() + 1);

    for (field, existing) in schema.fields().iter().zip(batch.columns()) {
        if field.name() != name {
            fields.push(field.as_ref().clone());
            arrays.push(existing.clone());
        }
    }
    fields.push(Field::new(name, array.data_type().clone(), true));
    arrays.push(array);

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// A column repeating one string value for every row.
pub fn constant_utf8(value: &str, rows: usize) -> ArrayRef {
    Arc::new(StringArray::from(vec![value; rows]))
}
