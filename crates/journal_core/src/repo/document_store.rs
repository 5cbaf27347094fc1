//! Transactional document store contract and SQLite implementation.
//!
//! # Responsibility
//! - Store JSON object documents addressed by `(collection, id)`.
//! - Provide atomic multi-document batches.
//! - Provide an optimistic read/compute/conditional-write transaction.
//!
//! # Invariants
//! - Every write bumps the document `revision`.
//! - `transact` writes only if the revision it read is still current; a
//!   concurrent writer turns the write into `StoreError::Conflict`.
//! - Document bodies are always JSON objects.

use crate::db::DbError;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};

static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid field name regex"));

pub type StoreResult<T> = Result<T, StoreError>;

/// Document store error.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Serialization(serde_json::Error),
    NotFound { collection: String, id: String },
    /// The document changed between the transaction read and its write.
    Conflict { collection: String, id: String },
    InvalidField(String),
    InvalidData(String),
    /// A transaction body refused to produce a new value.
    Aborted(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "document serialization failed: {err}"),
            Self::NotFound { collection, id } => write!(f, "document not found: {collection}/{id}"),
            Self::Conflict { collection, id } => {
                write!(f, "concurrent write detected on {collection}/{id}")
            }
            Self::InvalidField(field) => write!(f, "invalid query field `{field}`"),
            Self::InvalidData(message) => write!(f, "invalid document data: {message}"),
            Self::Aborted(reason) => write!(f, "transaction aborted: {reason}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Stored document snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Value,
    pub revision: i64,
}

impl Document {
    /// Deserializes the document body into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        data: Value,
    },
    /// Top-level field merge into an existing document.
    Merge {
        collection: String,
        id: String,
        patch: Map<String, Value>,
    },
    Delete {
        collection: String,
        id: String,
    },
    /// Precondition: the document is still at `revision` (`None` = absent).
    /// A mismatch fails the whole batch with `StoreError::Conflict`.
    Check {
        collection: String,
        id: String,
        revision: Option<i64>,
    },
}

/// Remote transactional document store contract.
pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;
    /// Creates or fully replaces a document.
    fn set(&self, collection: &str, id: &str, data: &Value) -> StoreResult<()>;
    /// Merges top-level fields; fails with `NotFound` when absent.
    fn update(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> StoreResult<()>;
    /// Returns whether a document was removed.
    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool>;
    /// Lists documents whose top-level `field` equals `value`.
    fn query_eq(&self, collection: &str, field: &str, value: &Value)
        -> StoreResult<Vec<Document>>;
    /// Applies all writes or none. `WriteOp::Check` entries are evaluated
    /// inside the same transaction.
    fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()>;
    /// Reads the current body, lets `compute` derive the next one and writes it
    /// only if nobody else wrote in between.
    ///
    /// `compute` receives `None` for a missing document. Returns the written
    /// body, or `StoreError::Conflict` when the optimistic check fails.
    fn transact(
        &self,
        collection: &str,
        id: &str,
        compute: &mut dyn FnMut(Option<&Value>) -> StoreResult<Value>,
    ) -> StoreResult<Value>;
}

/// SQLite-backed document store over the `documents` table.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Wraps a migrated connection (see `db::open_db`).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.lock();
        load_document(&conn, collection, id)
    }

    fn set(&self, collection: &str, id: &str, data: &Value) -> StoreResult<()> {
        let body = encode_body(data)?;
        let conn = self.lock();
        upsert_document(&conn, collection, id, &body)
    }

    fn update(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        merge_document(&tx, collection, id, patch)?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2;",
            params![collection, id],
        )?;
        Ok(changed > 0)
    }

    fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Document>> {
        if !FIELD_NAME_RE.is_match(field) {
            return Err(StoreError::InvalidField(field.to_string()));
        }
        let bound = json_to_sql(value)
            .ok_or_else(|| StoreError::InvalidField(format!("{field} (unsupported value)")))?;

        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT doc_id, body, revision
             FROM documents
             WHERE collection = ?1
               AND json_extract(body, ?2) = ?3
             ORDER BY updated_at ASC, doc_id ASC;",
        )?;
        let mut rows = stmt.query(params![collection, format!("$.{field}"), bound])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get("body")?;
            documents.push(Document {
                collection: collection.to_string(),
                id: row.get("doc_id")?,
                data: decode_body(&body)?,
                revision: row.get("revision")?,
            });
        }
        Ok(documents)
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for op in ops {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => upsert_document(&tx, collection, id, &encode_body(data)?)?,
                WriteOp::Merge {
                    collection,
                    id,
                    patch,
                } => merge_document(&tx, collection, id, patch)?,
                WriteOp::Delete { collection, id } => {
                    tx.execute(
                        "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2;",
                        params![collection, id],
                    )?;
                }
                WriteOp::Check {
                    collection,
                    id,
                    revision,
                } => check_revision(&tx, collection, id, *revision)?,
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn transact(
        &self,
        collection: &str,
        id: &str,
        compute: &mut dyn FnMut(Option<&Value>) -> StoreResult<Value>,
    ) -> StoreResult<Value> {
        // The lock is released while `compute` runs; the revision check below
        // is what makes the write safe against other writers.
        let snapshot = self.get(collection, id)?;
        let next = compute(snapshot.as_ref().map(|doc| &doc.data))?;
        let body = encode_body(&next)?;

        let conn = self.lock();
        let changed = match &snapshot {
            Some(doc) => conn.execute(
                "UPDATE documents
                 SET
                    body = ?3,
                    revision = revision + 1,
                    updated_at = (strftime('%s', 'now') * 1000)
                 WHERE collection = ?1
                   AND doc_id = ?2
                   AND revision = ?4;",
                params![collection, id, body, doc.revision],
            )?,
            None => conn.execute(
                "INSERT INTO documents (collection, doc_id, body)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, doc_id) DO NOTHING;",
                params![collection, id, body],
            )?,
        };

        if changed == 0 {
            warn!(
                "event=doc_transaction module=repo status=conflict collection={} read_revision={}",
                collection,
                snapshot.as_ref().map_or(0, |doc| doc.revision)
            );
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(next)
    }
}

fn load_document(conn: &Connection, collection: &str, id: &str) -> StoreResult<Option<Document>> {
    let row = conn
        .query_row(
            "SELECT body, revision FROM documents WHERE collection = ?1 AND doc_id = ?2;",
            params![collection, id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    row.map(|(body, revision)| {
        Ok(Document {
            collection: collection.to_string(),
            id: id.to_string(),
            data: decode_body(&body)?,
            revision,
        })
    })
    .transpose()
}

fn check_revision(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    expected: Option<i64>,
) -> StoreResult<()> {
    let actual = tx
        .query_row(
            "SELECT revision FROM documents WHERE collection = ?1 AND doc_id = ?2;",
            params![collection, id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    if actual == expected {
        return Ok(());
    }
    warn!(
        "event=doc_batch module=repo status=conflict collection={} expected_revision={:?} actual_revision={:?}",
        collection, expected, actual
    );
    Err(StoreError::Conflict {
        collection: collection.to_string(),
        id: id.to_string(),
    })
}

fn upsert_document(conn: &Connection, collection: &str, id: &str, body: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, doc_id) DO UPDATE SET
            body = excluded.body,
            revision = documents.revision + 1,
            updated_at = (strftime('%s', 'now') * 1000);",
        params![collection, id, body],
    )?;
    Ok(())
}

fn merge_document(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    patch: &Map<String, Value>,
) -> StoreResult<()> {
    let Some(existing) = load_document(tx, collection, id)? else {
        return Err(StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    };

    let mut merged = match existing.data {
        Value::Object(fields) => fields,
        _ => return Err(StoreError::InvalidData(format!("{collection}/{id} is not an object"))),
    };
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    upsert_document(tx, collection, id, &encode_body(&Value::Object(merged))?)
}

fn encode_body(data: &Value) -> StoreResult<String> {
    if !data.is_object() {
        return Err(StoreError::InvalidData(
            "document body must be a JSON object".to_string(),
        ));
    }
    Ok(serde_json::to_string(data)?)
}

fn decode_body(body: &str) -> StoreResult<Value> {
    let value: Value = serde_json::from_str(body)?;
    if !value.is_object() {
        return Err(StoreError::InvalidData(
            "stored document body is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
