//! ==============================================================================
//! store.rs - persistence of sensor readings
//! ==============================================================================
//!
//! purpose:
//!     the reading table lives in a hosted database. this module is the
//!     only place that knows how to talk to it.
//!
//! backends:
//!     - RestStore: the hosted database's REST interface (production)
//!     - MemoryStore: append-only vec, for local runs and tests
//!
//! contract:
//!     - insert_batch is all-or-nothing and returns the stored rows
//!     - list_newest_first returns every row, newest created_at first
//!     - change_mark is the cheap "did anything change" check: newest id and
//!       row count, without transferring the history
//!     - readings are never updated or deleted
//!
//! relationships:
//!     - used by: api.rs (submit / fetch), notify.rs (polling feed)
//!     - publishes to: notify.rs (BroadcastFeed, memory backend only)
//!
//! ==============================================================================

use chrono::{Duration, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{NewReading, Reading};
use crate::notify::{BroadcastFeed, ChangeEvent};

/// failure reported by the store, message kept verbatim for the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// newest row id and total row count; differs whenever rows are appended
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeMark {
    pub newest_id: Option<String>,
    pub count: usize,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

pub trait ReadingStore: Send + Sync {
    /// insert every row in one operation; all rows or none
    fn insert_batch(&self, rows: Vec<NewReading>) -> StoreFuture<'_, Vec<Reading>>;

    /// the full history, newest first
    fn list_newest_first(&self) -> StoreFuture<'_, Vec<Reading>>;

    /// newest id and row count, without reading the history
    fn change_mark(&self) -> StoreFuture<'_, ChangeMark>;
}

// ==============================================================================
// hosted database over REST
// ==============================================================================

pub struct RestStore {
    client: reqwest::Client,
    table_url: String,
    key: String,
}

impl RestStore {
    pub fn new(base_url: &str, key: &str, table: &str, timeout: std::time::Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::new(e.to_string()))?;

        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            key: key.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }
}

/// pull the human readable part out of a rejected store response
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body.trim().to_string()
    }
}

/// total from a `Content-Range` value such as `0-0/42` or `*/0`
fn content_range_total(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::new(error_message(status, &body)));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| StoreError::new(format!("unexpected store response: {}", e)))
}

async fn read_rows(response: reqwest::Response) -> Result<Vec<Reading>, StoreError> {
    read_json(response).await
}

#[derive(serde::Deserialize)]
struct IdRow {
    id: String,
}

impl ReadingStore for RestStore {
    fn insert_batch(&self, rows: Vec<NewReading>) -> StoreFuture<'_, Vec<Reading>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::POST, &self.table_url)
                .header("Prefer", "return=representation")
                .json(&rows)
                .send()
                .await
                .map_err(|e| StoreError::new(e.to_string()))?;
            read_rows(response).await
        })
    }

    fn list_newest_first(&self) -> StoreFuture<'_, Vec<Reading>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, &self.table_url)
                .query(&[("select", "*"), ("order", "created_at.desc")])
                .send()
                .await
                .map_err(|e| StoreError::new(e.to_string()))?;
            read_rows(response).await
        })
    }

    fn change_mark(&self) -> StoreFuture<'_, ChangeMark> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, &self.table_url)
                .query(&[("select", "id"), ("order", "created_at.desc"), ("limit", "1")])
                .header("Prefer", "count=exact")
                .send()
                .await
                .map_err(|e| StoreError::new(e.to_string()))?;

            let total = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total);
            let rows: Vec<IdRow> = read_json(response).await?;
            let count = total.ok_or_else(|| StoreError::new("store did not report a row count"))?;

            Ok(ChangeMark {
                newest_id: rows.into_iter().next().map(|r| r.id),
                count,
            })
        })
    }
}

// ==============================================================================
// in-memory store
// ==============================================================================

#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Reading>>,
    feed: BroadcastFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// change feed fed by successful inserts
    pub fn feed(&self) -> &BroadcastFeed {
        &self.feed
    }
}

impl ReadingStore for MemoryStore {
    fn insert_batch(&self, rows: Vec<NewReading>) -> StoreFuture<'_, Vec<Reading>> {
        Box::pin(async move {
            let inserted = {
                let mut table = self.rows.write().await;
                let mut last = table.last().map(|r| r.created_at);
                let mut inserted = Vec::with_capacity(rows.len());

                for row in rows {
                    // created_at must be strictly increasing for a stable order
                    let mut now = Utc::now();
                    if let Some(prev) = last {
                        if now <= prev {
                            now = prev + Duration::microseconds(1);
                        }
                    }
                    last = Some(now);

                    inserted.push(Reading {
                        id: uuid::Uuid::new_v4().to_string(),
                        bin_id: row.bin_id,
                        level: row.level,
                        location: row.location,
                        created_at: now,
                        updated_at: now,
                    });
                }

                table.extend(inserted.iter().cloned());
                inserted
            };

            self.feed.publish(ChangeEvent::Inserted { count: inserted.len() });
            Ok(inserted)
        })
    }

    fn list_newest_first(&self) -> StoreFuture<'_, Vec<Reading>> {
        Box::pin(async move {
            let table = self.rows.read().await;
            Ok(table.iter().rev().cloned().collect())
        })
    }

    fn change_mark(&self) -> StoreFuture<'_, ChangeMark> {
        Box::pin(async move {
            let table = self.rows.read().await;
            Ok(ChangeMark {
                newest_id: table.last().map(|r| r.id.clone()),
                count: table.len(),
            })
        })
    }
}
