//! [`DocumentStore`] implementation over Redis.

use async_trait::async_trait;
use lifeline_core::model::fields;
use lifeline_core::{
    Document, DocumentMutation, DocumentStore, DocumentTransaction, HealthReport, StoreError,
    StoreResult,
};
use redis::AsyncCommands;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

use crate::client::{init_pool, RedisConfig, RedisPool, RedisResult, RedisStoreError};
use crate::codec;

fn store_error(err: redis::RedisError) -> StoreError {
    RedisStoreError::from(err).into()
}

/// Document store backed by a shared [`RedisPool`].
#[derive(Clone)]
pub struct RedisDocumentStore {
    pool: RedisPool,
    prefix: String,
}

impl RedisDocumentStore {
    pub fn new(pool: RedisPool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: key_prefix.into(),
        }
    }

    /// Connect using `config`. Fails if Redis cannot be reached.
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let pool = init_pool(&config.url).await?;
        debug!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis");
        Ok(Self::new(pool, config.key_prefix.as_str()))
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Ids in a collection, oldest first.
    pub async fn list_ids(&self, collection: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.clone();
        let key = codec::collection_index_key(&self.prefix, collection);
        conn.zrange(&key, 0, -1).await.map_err(store_error)
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn open_transaction(&self) -> StoreResult<Box<dyn DocumentTransaction>> {
        let mut conn = self.pool.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(Box::new(RedisTransaction {
            conn,
            prefix: self.prefix.clone(),
            staged: Vec::new(),
        }))
    }

    async fn fetch(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let mut conn = self.pool.clone();
        let key = codec::document_key(&self.prefix, collection, id);
        let raw: Option<String> = conn
            .hget(&key, codec::DATA_FIELD)
            .await
            .map_err(store_error)?;
        Ok(codec::decode(&key, raw)?)
    }

    async fn health_check(&self) -> StoreResult<HealthReport> {
        let mut conn = self.pool.clone();
        let started = Instant::now();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => Ok(HealthReport::healthy(started.elapsed().as_millis() as u64)),
            Err(e) => {
                debug!(error = %e, "Redis health check failed");
                Ok(HealthReport::unhealthy(e.to_string()))
            }
        }
    }
}

/// Checks that every document still holds the `data` it was read with (or is
/// still absent), then writes all of them. Runs atomically on the server.
///
/// KEYS come in pairs: document key, collection index key. ARGV per document:
/// present flag, expected `data`, field count, field/value pairs, index member
/// (empty for none), index score.
const COMMIT_SCRIPT: &str = r#"
local cursor = 1
local writes = {}
for i = 1, #KEYS, 2 do
  local key = KEYS[i]
  local present = ARGV[cursor] == '1'
  local expected = ARGV[cursor + 1]
  local count = tonumber(ARGV[cursor + 2])
  cursor = cursor + 3
  if present then
    if redis.call('HGET', key, 'data') ~= expected then
      return redis.error_reply('CONFLICT ' .. key)
    end
  elseif redis.call('EXISTS', key) == 1 then
    return redis.error_reply('CONFLICT ' .. key)
  end
  local fields = {}
  for f = 1, count * 2 do
    fields[f] = ARGV[cursor + f - 1]
  end
  cursor = cursor + count * 2
  writes[#writes + 1] = {key, KEYS[i + 1], fields, ARGV[cursor], ARGV[cursor + 1]}
  cursor = cursor + 2
end
for _, w in ipairs(writes) do
  redis.call('HSET', w[1], unpack(w[3]))
  if w[4] ~= '' then
    redis.call('ZADD', w[2], w[5], w[4])
  end
end
return #writes
"#;

/// Error code raised by [`COMMIT_SCRIPT`] when a document moved underneath us.
const CONFLICT_CODE: &str = "CONFLICT";

/// One document written by a transaction.
struct StagedWrite {
    key: String,
    index_key: String,
    /// Raw `data` field as first read; `None` when the document did not exist.
    expected: Option<String>,
    document: Document,
    fields: Vec<(&'static str, String)>,
    /// Set when this transaction inserted the document.
    index_member: Option<(String, i64)>,
}

/// Writes are staged locally and sent together on commit.
///
/// Reads go to the server directly, overlaid with this transaction's own
/// staged documents. Commit fails with a conflict when another writer changed
/// any of the documents after this transaction read them.
struct RedisTransaction {
    conn: RedisPool,
    prefix: String,
    staged: Vec<StagedWrite>,
}

impl RedisTransaction {
    fn staged_position(&self, key: &str) -> Option<usize> {
        self.staged.iter().position(|write| write.key == key)
    }
}

#[async_trait]
impl DocumentTransaction for RedisTransaction {
    async fn run(&mut self, mutation: &DocumentMutation) -> StoreResult<Value> {
        let key = codec::document_key(&self.prefix, mutation.collection(), mutation.id());
        let position = self.staged_position(&key);

        let (expected, existing) = match position {
            Some(i) => (None, Some(self.staged[i].document.clone())),
            None => {
                let raw: Option<String> = self
                    .conn
                    .hget(&key, codec::DATA_FIELD)
                    .await
                    .map_err(store_error)?;
                let existing = codec::decode(&key, raw.clone())?;
                (raw, existing)
            }
        };

        let next = mutation.apply_to(existing.as_ref())?;
        let fields = codec::encode(&next)?;
        let version = next.get(fields::VERSION).cloned().unwrap_or(Value::Null);

        match position {
            Some(i) => {
                let write = &mut self.staged[i];
                write.document = next;
                write.fields = fields;
            }
            None => {
                let index_member = match mutation {
                    DocumentMutation::Insert { id, .. } => {
                        Some((id.clone(), chrono::Utc::now().timestamp_millis()))
                    }
                    _ => None,
                };
                self.staged.push(StagedWrite {
                    index_key: codec::collection_index_key(&self.prefix, mutation.collection()),
                    key,
                    expected,
                    document: next,
                    fields,
                    index_member,
                });
            }
        }

        Ok(json!({
            "acknowledged": true,
            "operation": mutation.name(),
            "collection": mutation.collection(),
            "id": mutation.id(),
            "version": version,
        }))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let RedisTransaction {
            mut conn, staged, ..
        } = *self;
        if staged.is_empty() {
            return Ok(());
        }

        let script = redis::Script::new(COMMIT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for write in &staged {
            invocation.key(&write.key).key(&write.index_key);
            invocation
                .arg(if write.expected.is_some() { "1" } else { "0" })
                .arg(write.expected.as_deref().unwrap_or(""))
                .arg(write.fields.len());
            for (field, value) in &write.fields {
                invocation.arg(*field).arg(value);
            }
            match &write.index_member {
                Some((member, score)) => invocation.arg(member).arg(*score),
                None => invocation.arg("").arg(0),
            };
        }

        let written: usize = invocation.invoke_async(&mut conn).await.map_err(|e| {
            if e.code() == Some(CONFLICT_CODE) {
                let key = e.detail().unwrap_or_default().trim().to_string();
                warn!(key = %key, "Redis commit rejected; document changed since read");
                StoreError::from(RedisStoreError::Conflict { key })
            } else {
                warn!(error = %e, documents = staged.len(), "Redis commit failed");
                store_error(e)
            }
        })?;
        debug!(documents = written, "Redis transaction committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        // Nothing has been sent; dropping the staged writes discards them.
        debug!(documents = self.staged.len(), "Redis transaction discarded");
        Ok(())
    }
}
