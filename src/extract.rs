use crate::error::Error;
use crate::event::FileKind;
use crate::source::{role_by_name, sanitize_column_name, SourceProfile};
use crate::table::{csv_cell, Cell, TableBuilder};
use datafusion::arrow::array::RecordBatch;
use log::debug;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Serializer, Value};
use std::io;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Parses an export into a batch. Returns `None` when the combination of
/// source and file kind carries nothing to load.
pub fn extract(
    kind: FileKind,
    profile: Option<&SourceProfile>,
    content: &[u8],
) -> Result<Option<RecordBatch>, Error> {
    let role_of = |name: &str| match profile {
        Some(p) => p.role_of(name),
        None => role_by_name(name),
    };

    let builder = match kind {
        FileKind::Csv => read_csv(profile, content)?,
        FileKind::Json => match profile.and_then(|p| p.json_records_key) {
            Some(key_index) => read_json(key_index, content)?,
            None => return Ok(None),
        },
    };

    debug!("extracted {} rows", builder.num_rows());
    builder.finish(role_of).map(Some)
}

fn read_csv(profile: Option<&SourceProfile>, content: &[u8]) -> Result<TableBuilder, Error> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let content = match profile {
        Some(p) => skip_lines(content, p.csv.preamble_lines),
        None => content,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content);

    let mut records = reader.records();
    let header = match records.next() {
        Some(record) => dedupe_headers(record?.iter()),
        None => return Err(Error::EmptyFile),
    };

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        if record.len() > header.len() {
            return Err(Error::MalformedCsv {
                message: format!(
                    "expected {} fields, saw {} on line {}",
                    header.len(),
                    record.len(),
                    record.position().map(|p| p.line()).unwrap_or_default()
                ),
            });
        }
        rows.push(record);
    }

    if let Some(p) = profile {
        if p.csv.drop_footer {
            rows.pop();
        }
        if let Some(required) = p.csv.required_field {
            let idx = header
                .iter()
                .position(|h| sanitize_column_name(h) == required)
                .ok_or_else(|| Error::MissingColumn {
                    column: required.to_string(),
                })?;
            rows.retain(|r| csv_cell(r.get(idx).unwrap_or_default()) != Cell::Null);
        }
    }

    let mut builder = TableBuilder::for_csv();
    builder.declare_columns(&header);
    for record in &rows {
        builder.push_row(
            header
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), csv_cell(record.get(i).unwrap_or_default()))),
        );
    }

    Ok(builder)
}

fn skip_lines(content: &[u8], lines: usize) -> &[u8] {
    if lines == 0 {
        return content;
    }
    match content
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .nth(lines - 1)
    {
        Some((pos, _)) => &content[pos + 1..],
        None => &[],
    }
}

/// Repeated headers get a `.N` suffix so every column stays addressable.
fn dedupe_headers<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for name in names {
        let mut candidate = name.to_string();
        let mut n = 1;
        while seen.contains(&candidate) {
            candidate = format!("{}.{}", name, n);
            n += 1;
        }
        seen.push(candidate);
    }
    seen
}

fn read_json(key_index: usize, content: &[u8]) -> Result<TableBuilder, Error> {
    let root: Value = serde_json::from_slice(content)?;
    let object = root.as_object().ok_or_else(|| Error::MalformedJson {
        message: "top level is not an object".to_string(),
    })?;

    let (key, records) = object.iter().nth(key_index).ok_or_else(|| Error::MalformedJson {
        message: format!("expected at least {} top-level keys", key_index + 1),
    })?;

    let records = records.as_array().ok_or_else(|| Error::MalformedJson {
        message: format!("'{}' does not hold a record array", key),
    })?;

    let mut builder = TableBuilder::new();
    for record in records {
        let record = record.as_object().ok_or_else(|| Error::MalformedJson {
            message: format!("'{}' contains a non-object record", key),
        })?;
        let mut row = Vec::new();
        flatten_record("", record, &mut row);
        builder.push_row(row);
    }

    Ok(builder)
}

/// Nested objects become dotted column paths; everything else is a leaf.
fn flatten_record(prefix: &str, record: &Map<String, Value>, out: &mut Vec<(String, Cell)>) {
    for (key, value) in record {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Object(nested) if !nested.is_empty() => flatten_record(&name, nested, out),
            leaf => out.push((name, json_cell(leaf))),
        }
    }
}

fn json_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::String(s) => Cell::Text(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Cell::Int(i),
            None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
        },
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => {
            spaced_json(value).map(Cell::Bytes).unwrap_or(Cell::Null)
        }
    }
}

/// Writes `", "` and `": "` between items, matching the composite values
/// already stored in the warehouse.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn spaced_json(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    value.serialize(&mut Serializer::with_formatter(&mut out, SpacedFormatter))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use crate::table::column;
    use datafusion::arrow::array::{Array, AsArray};
    use datafusion::arrow::datatypes::{DataType, Int64Type};

    const DV_CSV: &str = "\
Line Item ID,Insertion Order ID,Campaign ID,Clicks,Billable Impressions,Date
55,10,7,3,100,2024/01/01
,,,3,100,
";

    fn cm_csv() -> String {
        let mut content = String::new();
        for i in 0..10 {
            content.push_str(&format!("Report preamble line {}\n", i));
        }
        content.push_str("Campaign ID,Date,Impressions,Clicks\n");
        content.push_str("7,2024-01-01,100,3\n");
        content.push_str("8,2024-01-02,50,1\n");
        content.push_str("Grand Total:,,150,4\n");
        content
    }

    #[test]
    fn test_dv_csv_drops_rows_without_line_item() {
        let profile = Source::DisplayVideo.profile();
        let batch = extract(FileKind::Csv, Some(profile), DV_CSV.as_bytes())
            .unwrap()
            .unwrap();

        assert_eq!(batch.num_rows(), 1);
        let line_items = column(&batch, "Line Item ID").unwrap();
        assert_eq!(line_items.data_type(), &DataType::Utf8);
        assert_eq!(line_items.as_string::<i32>().value(0), "55");

        let clicks = column(&batch, "Clicks").unwrap();
        assert_eq!(clicks.as_primitive::<Int64Type>().value(0), 3);
    }

    #[test]
    fn test_dv_csv_requires_line_item_column() {
        let profile = Source::DisplayVideo.profile();
        let result = extract(FileKind::Csv, Some(profile), b"Campaign ID,Clicks\n7,3\n");
        assert!(matches!(
            result.unwrap_err(),
            Error::MissingColumn { column } if column == "LineItemID"
        ));
    }

    #[test]
    fn test_cm_csv_skips_preamble_and_footer() {
        let profile = Source::CampaignManager.profile();
        let batch = extract(FileKind::Csv, Some(profile), cm_csv().as_bytes())
            .unwrap()
            .unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(0).name(), "Campaign ID");
        let campaigns = column(&batch, "Campaign ID").unwrap().as_string::<i32>();
        assert_eq!(campaigns.value(0), "7");
        assert_eq!(campaigns.value(1), "8");
    }

    #[test]
    fn test_unknown_source_csv_is_plain() {
        let batch = extract(FileKind::Csv, None, b"a,b\n1,x\n2,y\n")
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(0).data_type(), &DataType::Int64);
        assert_eq!(batch.column(1).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_csv_short_rows_are_padded() {
        let batch = extract(FileKind::Csv, None, b"a,b\n1\n").unwrap().unwrap();
        assert!(batch.column(1).is_null(0));
    }

    #[test]
    fn test_csv_long_rows_are_rejected() {
        let result = extract(FileKind::Csv, None, b"a,b\n1,2,3\n");
        assert!(matches!(result.unwrap_err(), Error::MalformedCsv { .. }));
    }

    #[test]
    fn test_csv_without_header_is_empty_file() {
        let profile = Source::CampaignManager.profile();
        let result = extract(FileKind::Csv, Some(profile), b"only\ntwo lines\n");
        assert!(matches!(result.unwrap_err(), Error::EmptyFile));
    }

    #[test]
    fn test_csv_duplicate_headers() {
        let batch = extract(FileKind::Csv, None, b"x,x\n1,2\n").unwrap().unwrap();
        assert_eq!(batch.schema().field(0).name(), "x");
        assert_eq!(batch.schema().field(1).name(), "x.1");
    }

    #[test]
    fn test_header_only_csv_keeps_columns() {
        let batch = extract(FileKind::Csv, None, b"a,b\n").unwrap().unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
    }

    #[test]
    fn test_dv_json_uses_first_key() {
        let content = br#"{
            "rows": [
                {"CampaignID": 7, "stats": {"clicks": 3, "ctr": 0.5}, "active": true, "tags": ["a"]},
                {"CampaignID": 8, "stats": {"clicks": 4}}
            ],
            "meta": {"count": 2}
        }"#;
        let profile = Source::DisplayVideo.profile();
        let batch = extract(FileKind::Json, Some(profile), content)
            .unwrap()
            .unwrap();

        assert_eq!(batch.num_rows(), 2);
        let campaigns = column(&batch, "CampaignID").unwrap().as_string::<i32>();
        assert_eq!(campaigns.value(1), "8");
        let clicks = column(&batch, "stats.clicks").unwrap();
        assert_eq!(clicks.as_primitive::<Int64Type>().value(1), 4);
        let active = column(&batch, "active").unwrap().as_binary::<i32>();
        assert_eq!(active.value(0), b"true");
        assert!(active.is_null(1));
        let tags = column(&batch, "tags").unwrap().as_binary::<i32>();
        assert_eq!(tags.value(0), br#"["a"]"#);
    }

    #[test]
    fn test_json_composites_keep_spaced_separators() {
        let content = br#"{"rows": [{"tags": ["a", "b"], "pairs": [{"k": 1, "v": null}], "empty": {}}]}"#;
        let profile = Source::DisplayVideo.profile();
        let batch = extract(FileKind::Json, Some(profile), content)
            .unwrap()
            .unwrap();

        let tags = column(&batch, "tags").unwrap().as_binary::<i32>();
        assert_eq!(tags.value(0), br#"["a", "b"]"#);
        let pairs = column(&batch, "pairs").unwrap().as_binary::<i32>();
        assert_eq!(pairs.value(0), br#"[{"k": 1, "v": null}]"#);
        let empty = column(&batch, "empty").unwrap().as_binary::<i32>();
        assert_eq!(empty.value(0), b"{}");
    }

    #[test]
    fn test_cm_json_uses_third_key() {
        let content = br#"{"kind": "report", "etag": "x", "items": [{"Clicks": 1}]}"#;
        let profile = Source::CampaignManager.profile();
        let batch = extract(FileKind::Json, Some(profile), content)
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema().field(0).name(), "Clicks");
    }

    #[test]
    fn test_json_without_record_key_is_skipped() {
        let profile = Source::IronSource.profile();
        assert!(extract(FileKind::Json, Some(profile), b"{}").unwrap().is_none());
        assert!(extract(FileKind::Json, None, b"{}").unwrap().is_none());
    }

    #[test]
    fn test_json_missing_key_is_malformed() {
        let profile = Source::CampaignManager.profile();
        let result = extract(FileKind::Json, Some(profile), br#"{"a": []}"#);
        assert!(matches!(result.unwrap_err(), Error::MalformedJson { .. }));
    }

    #[test]
    fn test_json_invalid_syntax() {
        let profile = Source::DisplayVideo.profile();
        let result = extract(FileKind::Json, Some(profile), b"{not json");
        assert!(matches!(result.unwrap_err(), Error::Json(_)));
    }

    #[test]
    fn test_skip_lines() {
        assert_eq!(skip_lines(b"a\nb\nc", 2), b"c");
        assert_eq!(skip_lines(b"a\nb", 5), b"");
        assert_eq!(skip_lines(b"a", 0), b"a");
    }
}
