use crate::error::Error;
use serde::Deserialize;

/// Storage notification payload: an object was finalized in a bucket.
#[derive(Deserialize, Debug, Clone)]
pub struct StorageEvent {
    pub bucket: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Json,
}

/// `{dataset_id}/{account_api_id}/.../{table_name}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub dataset_id: String,
    pub account_api_id: String,
    pub table_name: String,
    pub kind: Option<FileKind>,
}

impl ObjectPath {
    pub fn parse(name: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidObjectName {
            name: name.to_string(),
        };

        let parts: Vec<&str> = name.split('/').collect();
        let (dataset_id, account_api_id, file_name) = match parts.as_slice() {
            [dataset, account, .., file] => (*dataset, *account, *file),
            _ => return Err(invalid()),
        };

        let table_name = file_name.split('.').next().unwrap_or_default();
        if dataset_id.is_empty() || account_api_id.is_empty() || table_name.is_empty() {
            return Err(invalid());
        }

        let kind = if name.ends_with(".json") {
            Some(FileKind::Json)
        } else if name.ends_with(".csv") {
            Some(FileKind::Csv)
        } else {
            None
        };

        Ok(ObjectPath {
            dataset_id: dataset_id.to_string(),
            account_api_id: account_api_id.to_string(),
            table_name: table_name.to_string(),
            kind,
        })
    }
}
