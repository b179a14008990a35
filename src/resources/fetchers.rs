//! Structured data fetchers, keyed by resource kind name.
//!
//! The registry ships with `json`, `csv`, `tsv`, `dsv` and `text`. Hosts can
//! register additional kinds; any declaration whose kind is not one of the
//! fixed strategies is looked up here by name.

use super::host::{FetchInit, Network};
use super::{LoadError, RowFn};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Everything a fetcher needs to know about one structured fetch.
pub struct DataRequest<'a> {
    pub locator: &'a str,
    pub init: &'a FetchInit,
    pub delimiter: Option<char>,
    pub row: Option<&'a RowFn>,
}

#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, network: &dyn Network, request: &DataRequest<'_>) -> Result<Value, LoadError>;
}

/// Parses the whole body as JSON.
pub struct JsonFetcher;

#[async_trait]
impl DataFetcher for JsonFetcher {
    async fn fetch(&self, network: &dyn Network, request: &DataRequest<'_>) -> Result<Value, LoadError> {
        network
            .fetch(request.locator, request.init)
            .await?
            .error_for_status()?
            .json()
    }
}

/// Returns the body as a string.
pub struct TextFetcher;

#[async_trait]
impl DataFetcher for TextFetcher {
    async fn fetch(&self, network: &dyn Network, request: &DataRequest<'_>) -> Result<Value, LoadError> {
        let response = network.fetch(request.locator, request.init).await?.error_for_status()?;
        Ok(Value::String(response.body))
    }
}

/// Delimiter separated values with a header row.
///
/// With a fixed delimiter this is `csv`/`tsv`; without one the declaration
/// must carry its own (`dsv`).
pub struct DsvFetcher {
    delimiter: Option<char>,
}

impl DsvFetcher {
    pub fn new(delimiter: Option<char>) -> Self {
        Self { delimiter }
    }
}

#[async_trait]
impl DataFetcher for DsvFetcher {
    async fn fetch(&self, network: &dyn Network, request: &DataRequest<'_>) -> Result<Value, LoadError> {
        let delimiter = self.delimiter.or(request.delimiter).ok_or_else(|| LoadError::Parse {
            locator: request.locator.to_string(),
            message: "a delimiter is required for dsv resources".to_string(),
        })?;

        let response = network.fetch(request.locator, request.init).await?.error_for_status()?;
        let rows = parse_dsv(&response.body, delimiter).map_err(|message| LoadError::Parse {
            locator: request.locator.to_string(),
            message,
        })?;

        let objects = rows
            .into_iter()
            .filter_map(|object| match request.row {
                Some(row) => row(object),
                None => Some(Value::Object(object)),
            })
            .collect();
        Ok(Value::Array(objects))
    }
}

/// Parse delimiter separated text into one object per data row, keyed by the header row.
pub fn parse_dsv(text: &str, delimiter: char) -> Result<Vec<Map<String, Value>>, String> {
    let mut records = split_records(text, delimiter)?.into_iter();
    let header = match records.next() {
        Some(header) => header,
        None => return Ok(Vec::new()),
    };

    Ok(records
        .map(|record| {
            header
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let value = record.get(i).cloned().unwrap_or_default();
                    (column.clone(), Value::String(value))
                })
                .collect()
        })
        .collect())
}

fn split_records(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == '"' && field.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            record.push(std::mem::take(&mut field));
        } else if c == '\n' || c == '\r' {
            if c == '\r' && chars.peek() == Some(&'\n') {
                chars.next();
            }
            record.push(std::mem::take(&mut field));
            if !(record.len() == 1 && record[0].is_empty()) {
                records.push(std::mem::take(&mut record));
            } else {
                record.clear();
            }
        } else {
            field.push(c);
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

/// Fetch capabilities available to the loader, keyed by kind name.
#[derive(Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn DataFetcher>>,
}

impl FetcherRegistry {
    /// A registry with no fetchers at all
    pub fn empty() -> Self {
        Self {
            fetchers: HashMap::new(),
        }
    }

    /// The built-in `json`, `csv`, `tsv`, `dsv` and `text` fetchers
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("json", Arc::new(JsonFetcher));
        registry.register("text", Arc::new(TextFetcher));
        registry.register("csv", Arc::new(DsvFetcher::new(Some(','))));
        registry.register("tsv", Arc::new(DsvFetcher::new(Some('\t'))));
        registry.register("dsv", Arc::new(DsvFetcher::new(None)));
        registry
    }

    /// Register (or replace) the fetcher for `kind`
    pub fn register(&mut self, kind: impl Into<String>, fetcher: Arc<dyn DataFetcher>) {
        self.fetchers.insert(kind.into(), fetcher);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DataFetcher>> {
        self.fetchers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.fetchers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherRegistry").field("kinds", &self.kinds()).finish()
    }
}
