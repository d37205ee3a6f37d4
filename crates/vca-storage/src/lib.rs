//! Document store abstraction (in-memory + Postgres JSONB) and HTTP fetch utilities for VCA.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vca-storage";

/// Field holding the store-assigned document identifier.
pub const ID_FIELD: &str = "_id";

/// A schemaless document: top-level field name to JSON value.
pub type Document = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("document `{id}` already exists in `{collection}`")]
    DuplicateId { collection: String, id: String },
    #[error("expected a JSON object document, found {0}")]
    NotAnObject(String),
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(StoreError::NotAnObject(other.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(JsonValue::Object(doc))?)
}

pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(JsonValue::as_str)
}

/// Conjunction of top-level equality clauses. An empty filter matches everything.
///
/// A clause never matches a document that lacks the field, including `null` clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Document,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(ID_FIELD, id.into())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.clauses.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &Document {
        &self.clauses
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Field-level update: `set` applies on every match, `set_on_insert` only when an upsert creates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub set_on_insert: Document,
}

impl Update {
    pub fn set(set: Document) -> Self {
        Self {
            set,
            set_on_insert: Document::new(),
        }
    }

    pub fn with_set_on_insert(mut self, set_on_insert: Document) -> Self {
        self.set_on_insert = set_on_insert;
        self
    }

    /// The document an upsert creates when nothing matches `filter`.
    fn materialize(&self, filter: &Filter) -> Document {
        let mut doc = filter.clauses.clone();
        for (k, v) in &self.set_on_insert {
            doc.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.set {
            doc.insert(k.clone(), v.clone());
        }
        ensure_id(&mut doc);
        doc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: bool,
    pub upserted: bool,
    /// Identifier of the matched or created document, if any.
    pub document_id: Option<String>,
}

impl UpdateOutcome {
    fn unmatched() -> Self {
        Self {
            matched: false,
            upserted: false,
            document_id: None,
        }
    }
}

fn ensure_id(doc: &mut Document) -> String {
    if let Some(id) = document_id(doc) {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    doc.insert(ID_FIELD.to_string(), JsonValue::String(id.clone()));
    id
}

/// Minimal document-store contract the reconciliation layer is written against.
///
/// Writes are last-write-wins; there is no cross-collection transaction.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    /// Insert and return the document id (assigned when absent).
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize, StoreError>;

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

/// Process-local store used by tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn DocumentStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<String, StoreError> {
        let id = ensure_id(&mut doc);
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.iter().any(|d| document_id(d) == Some(id.as_str())) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id,
            });
        }
        docs.push(doc);
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize, StoreError> {
        let count = docs.len();
        for doc in docs {
            self.insert_one(collection, doc).await?;
        }
        Ok(count)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();

        if let Some(doc) = docs.iter_mut().find(|d| filter.matches(d)) {
            for (k, v) in update.set {
                doc.insert(k, v);
            }
            return Ok(UpdateOutcome {
                matched: true,
                upserted: false,
                document_id: document_id(doc).map(ToString::to_string),
            });
        }

        if !upsert {
            return Ok(UpdateOutcome::unmatched());
        }

        let doc = update.materialize(filter);
        let id = document_id(&doc).map(ToString::to_string);
        docs.push(doc);
        Ok(UpdateOutcome {
            matched: false,
            upserted: true,
            document_id: id,
        })
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        Ok((before - docs.len()) as u64)
    }
}

/// Postgres-backed store keeping every collection in one JSONB table.
///
/// Equality filters are evaluated with `@>` containment; insertion order is kept via `seq`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres document store")?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vca_documents (
                seq        BIGSERIAL PRIMARY KEY,
                collection TEXT  NOT NULL,
                doc_id     TEXT  NOT NULL,
                body       JSONB NOT NULL,
                UNIQUE (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS vca_documents_body_idx
                ON vca_documents USING GIN (body jsonb_path_ops)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn filter_json(filter: &Filter) -> JsonValue {
        JsonValue::Object(filter.clauses.clone())
    }

    async fn insert_in<'e, E>(executor: E, collection: &str, mut doc: Document) -> Result<String, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let id = ensure_id(&mut doc);
        let result = sqlx::query(
            r#"
            INSERT INTO vca_documents (collection, doc_id, body)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(JsonValue::Object(doc))
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

fn body_to_document(body: JsonValue) -> Result<Document, StoreError> {
    match body {
        JsonValue::Object(map) => Ok(map),
        other => Err(StoreError::NotAnObject(other.to_string())),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body
              FROM vca_documents
             WHERE collection = $1
               AND body @> $2
             ORDER BY seq
            "#,
        )
        .bind(collection)
        .bind(Self::filter_json(filter))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| body_to_document(row.try_get("body")?))
            .collect()
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        Self::insert_in(&self.pool, collection, doc).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize, StoreError> {
        let count = docs.len();
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            Self::insert_in(&mut *tx, collection, doc).await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vca_documents
               SET body = body || $3
             WHERE seq = (
                   SELECT seq
                     FROM vca_documents
                    WHERE collection = $1
                      AND body @> $2
                    ORDER BY seq
                    LIMIT 1
                      FOR UPDATE
             )
            RETURNING doc_id
            "#,
        )
        .bind(collection)
        .bind(Self::filter_json(filter))
        .bind(JsonValue::Object(update.set.clone()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(UpdateOutcome {
                matched: true,
                upserted: false,
                document_id: Some(row.try_get("doc_id")?),
            });
        }

        if !upsert {
            return Ok(UpdateOutcome::unmatched());
        }

        let id = Self::insert_in(&self.pool, collection, update.materialize(filter)).await?;
        Ok(UpdateOutcome {
            matched: false,
            upserted: true,
            document_id: Some(id),
        })
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM vca_documents
             WHERE collection = $1
               AND body @> $2
            "#,
        )
        .bind(collection)
        .bind(Self::filter_json(filter))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// How a failed sheet-export request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// 5xx, throttling, timeouts and dropped connections.
    Transient,
    /// Everything else, e.g. 403 on a spreadsheet that is not shared.
    Permanent,
}

impl FetchFailure {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            FetchFailure::Transient
        } else {
            FetchFailure::Permanent
        }
    }

    pub fn from_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            FetchFailure::Transient
        } else {
            FetchFailure::Permanent
        }
    }
}

/// Doubling delays between sheet-export attempts, capped at `max_delay`.
/// A server `Retry-After` hint replaces the computed delay but obeys the same cap.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub retries: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetrySchedule {
    /// `None` once retries are spent or the failure is permanent.
    pub fn next_delay(&self, failure: FetchFailure, retry: usize, hint: Option<Duration>) -> Option<Duration> {
        if failure == FetchFailure::Permanent || retry >= self.retries {
            return None;
        }
        let doubled = || {
            let factor = u32::try_from(retry)
                .ok()
                .and_then(|shift| 1u32.checked_shl(shift))
                .unwrap_or(u32::MAX);
            self.first_delay.saturating_mul(factor)
        };
        Some(hint.unwrap_or_else(doubled).min(self.max_delay))
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 4,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying GET client used to pull spreadsheet exports.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("sheet_fetch", label, url);
        self.fetch_with_retry(url).instrument(span).await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // Only fails once the semaphore is closed, which this type never does.
        let _permit = self.limit.acquire().await.ok();
        let mut retry = 0usize;

        loop {
            let (failure, hint, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await?.to_vec();
                    debug!(bytes = body.len(), retry, "sheet export fetched");
                    return Ok(body);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let hint = retry_after(&resp);
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (FetchFailure::from_status(status), hint, err)
                }
                Err(err) => (FetchFailure::from_error(&err), None, FetchError::Request(err)),
            };

            let Some(delay) = self.retry.next_delay(failure, retry, hint) else {
                return Err(err);
            };
            warn!(retry, delay_ms = delay.as_millis() as u64, error = %err, "sheet export fetch failed; retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn filter_requires_every_clause_and_present_fields() {
        let d = doc(json!({"name": "X", "valueChainId": "vc-1"}));
        assert!(Filter::new().matches(&d));
        assert!(Filter::new().eq("name", "X").eq("valueChainId", "vc-1").matches(&d));
        assert!(!Filter::new().eq("name", "X").eq("valueChainId", "vc-2").matches(&d));
        assert!(!Filter::new().eq("businessMaturity", JsonValue::Null).matches(&d));
    }

    #[tokio::test]
    async fn update_sets_only_supplied_fields() {
        let store = MemoryStore::new();
        let id = store
            .insert_one("Capabilities", doc(json!({"name": "X", "businessMaturity": "Managed"})))
            .await
            .unwrap();

        let outcome = store
            .update_one(
                "Capabilities",
                &Filter::by_id(&id),
                Update::set(doc(json!({"technologyMaturity": "Homegrown"}))),
                false,
            )
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.document_id.as_deref(), Some(id.as_str()));

        let stored = store
            .find_one("Capabilities", &Filter::by_id(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["businessMaturity"], "Managed");
        assert_eq!(stored["technologyMaturity"], "Homegrown");
    }

    #[tokio::test]
    async fn upsert_materializes_filter_and_set_on_insert() {
        let store = MemoryStore::new();
        let filter = Filter::new().eq("valueChainEntryId", "e-1").eq("nameKey", "sourcing");
        let update = Update::set(doc(json!({"name": "Sourcing"})))
            .with_set_on_insert(doc(json!({"Capability": []})));

        let first = store
            .update_one("ValueChains", &filter, update.clone(), true)
            .await
            .unwrap();
        assert!(first.upserted);

        store
            .update_one(
                "ValueChains",
                &filter,
                Update::set(doc(json!({"Capability": ["kept"]}))),
                false,
            )
            .await
            .unwrap();
        let second = store.update_one("ValueChains", &filter, update, true).await.unwrap();
        assert!(second.matched);
        assert_eq!(first.document_id, second.document_id);

        let all = store.find("ValueChains", &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["valueChainEntryId"], "e-1");
        assert_eq!(all[0]["Capability"], json!(["kept"]));
    }

    #[tokio::test]
    async fn unmatched_update_without_upsert_is_a_no_op() {
        let store = MemoryStore::new();
        let outcome = store
            .update_one("Capabilities", &Filter::by_id("missing"), Update::default(), false)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::unmatched());
        assert!(store.find("Capabilities", &Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_and_delete_respects_filter() {
        let store = MemoryStore::new();
        store
            .insert_many(
                "Initiatives",
                vec![
                    doc(json!({"_id": "a", "entry": "Acme"})),
                    doc(json!({"_id": "b", "entry": "Other"})),
                ],
            )
            .await
            .unwrap();
        let err = store
            .insert_one("Initiatives", doc(json!({"_id": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));

        let deleted = store
            .delete_many("Initiatives", &Filter::new().eq("entry", "Acme"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.find("Initiatives", &Filter::new()).await.unwrap().len(), 1);
        assert_eq!(store.delete_many("Nope", &Filter::new()).await.unwrap(), 0);
    }

    #[test]
    fn retry_schedule_doubles_and_caps() {
        let schedule = RetrySchedule {
            retries: 5,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let transient = FetchFailure::Transient;
        assert_eq!(schedule.next_delay(transient, 0, None), Some(Duration::from_millis(100)));
        assert_eq!(schedule.next_delay(transient, 1, None), Some(Duration::from_millis(200)));
        assert_eq!(schedule.next_delay(transient, 2, None), Some(Duration::from_millis(350)));
        assert_eq!(schedule.next_delay(transient, 5, None), None);
        assert_eq!(
            schedule.next_delay(transient, 0, Some(Duration::from_secs(30))),
            Some(Duration::from_millis(350))
        );
        assert_eq!(schedule.next_delay(FetchFailure::Permanent, 0, None), None);
    }

    #[test]
    fn unshared_sheets_are_not_retried() {
        assert_eq!(FetchFailure::from_status(StatusCode::BAD_GATEWAY), FetchFailure::Transient);
        assert_eq!(FetchFailure::from_status(StatusCode::TOO_MANY_REQUESTS), FetchFailure::Transient);
        assert_eq!(FetchFailure::from_status(StatusCode::FORBIDDEN), FetchFailure::Permanent);
        assert_eq!(FetchFailure::from_status(StatusCode::NOT_FOUND), FetchFailure::Permanent);
    }
}
