//! Record sources.
//!
//! The merge driver pulls raw scraper items per service in batches through
//! [`RecordSource`]. Each batch carries an opaque [`Cursor`]; handing the last
//! cursor back on a later run resumes after everything already seen.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{DataPaths, MediaKind, Service};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Resume position within one service's feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scraper item before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub service: Service,
    pub fields: Value,
}

/// One batch of payloads and the cursor that follows it
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub payloads: Vec<RawPayload>,
    pub cursor: Cursor,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} does not hold a JSON array")]
    NotAnArray { path: PathBuf },

    #[error("cursor {cursor:?} is not valid for {service}")]
    BadCursor { service: Service, cursor: String },
}

/// Supplier of raw payloads, one service at a time
pub trait RecordSource {
    /// Next batch after `since`, or `None` once the service is exhausted
    fn next_batch(
        &mut self,
        service: Service,
        since: Option<&Cursor>,
    ) -> Result<Option<SourceBatch>, SourceError>;
}

/// Reads the JSON arrays the scrapers leave under the scraped data directory.
///
/// Cursors are item offsets into the file. A service with no file yields
/// nothing.
pub struct ScrapedFileSource {
    paths: DataPaths,
    kind: MediaKind,
    batch_size: usize,
    loaded: HashMap<Service, Vec<Value>>,
}

impl ScrapedFileSource {
    pub fn new(paths: DataPaths, kind: MediaKind, batch_size: usize) -> Self {
        Self {
            paths,
            kind,
            batch_size: batch_size.max(1),
            loaded: HashMap::new(),
        }
    }

    /// Items of a service, read from disk on first use
    fn items(&mut self, service: Service) -> Result<Option<&[Value]>, SourceError> {
        if !self.loaded.contains_key(&service) {
            let path = self.paths.scraped_file(self.kind, service);
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(%service, path = %path.display(), "No scraped file");
                    return Ok(None);
                }
                Err(source) => return Err(SourceError::Read { path, source }),
            };

            let items = match serde_json::from_str::<Value>(&content) {
                Ok(Value::Array(items)) => items,
                Ok(_) => return Err(SourceError::NotAnArray { path }),
                Err(source) => return Err(SourceError::Parse { path, source }),
            };
            info!(%service, items = items.len(), path = %path.display(), "Loaded scraped file");
            self.loaded.insert(service, items);
        }

        Ok(self.loaded.get(&service).map(Vec::as_slice))
    }
}

impl RecordSource for ScrapedFileSource {
    fn next_batch(
        &mut self,
        service: Service,
        since: Option<&Cursor>,
    ) -> Result<Option<SourceBatch>, SourceError> {
        let offset = match since {
            Some(cursor) => cursor.0.parse::<usize>().map_err(|_| SourceError::BadCursor {
                service,
                cursor: cursor.0.clone(),
            })?,
            None => 0,
        };
        let batch_size = self.batch_size;

        let Some(items) = self.items(service)? else {
            return Ok(None);
        };
        if offset >= items.len() {
            return Ok(None);
        }

        let end = (offset + batch_size).min(items.len());
        let payloads = items[offset..end]
            .iter()
            .map(|fields| RawPayload {
                service,
                fields: fields.clone(),
            })
            .collect();

        Ok(Some(SourceBatch {
            payloads,
            cursor: Cursor(end.to_string()),
        }))
    }
}
