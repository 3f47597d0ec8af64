//! Cache entry CRUD operations.
//!
//! Entries are keyed by `(generation, normalized resource ref)` and replaced
//! wholesale on every write; the last completed write for a key wins.

use super::connection::CacheDb;
use super::generations::{GenerationId, now_timestamp};
use super::hash::compute_digest;
use crate::Error;
use crate::resource::{NormalizePolicy, ResourceRef};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: ResourceRef,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub status_code: u16,
    pub stored_at: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// SHA-256 hex digest of `payload`.
    pub digest: String,
}

impl CacheEntry {
    /// Build an entry stamped with the current time.
    pub fn new(key: ResourceRef, payload: Bytes, content_type: Option<String>) -> Self {
        let digest = compute_digest(&payload);
        Self {
            key,
            payload,
            content_type,
            status_code: 200,
            stored_at: now_timestamp(),
            etag: None,
            last_modified: None,
            digest,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Attach freshness validators from the response headers.
    pub fn with_validators(mut self, etag: Option<String>, last_modified: Option<String>) -> Self {
        self.etag = etag;
        self.last_modified = last_modified;
        self
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// One line of the cached-resource listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResourceSummary {
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub size: u64,
    pub digest: String,
    pub stored_at: String,
}

/// Store-wide usage against the configured quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StorageUsage {
    pub used: u64,
    pub quota: Option<u64>,
    pub percent: Option<f64>,
}

/// Keys are stored normalized; re-parsing them must not strip anything.
fn stored_key(key: &str) -> Result<ResourceRef, Error> {
    ResourceRef::parse(key, NormalizePolicy { strip_query: false }).map_err(Error::from)
}

struct EntryRow {
    key: String,
    payload: Vec<u8>,
    content_type: Option<String>,
    status_code: i64,
    stored_at: String,
    etag: Option<String>,
    last_modified: Option<String>,
    digest: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<CacheEntry, Error> {
        Ok(CacheEntry {
            key: stored_key(&self.key)?,
            payload: Bytes::from(self.payload),
            content_type: self.content_type,
            status_code: u16::try_from(self.status_code).unwrap_or(200),
            stored_at: self.stored_at,
            etag: self.etag,
            last_modified: self.last_modified,
            digest: self.digest,
        })
    }
}

impl CacheDb {
    /// Insert or replace the entry for `entry.key` in `generation`.
    ///
    /// Any failure is reported as [`Error::StoreWrite`]: a missing generation,
    /// an exceeded quota, or a database error.
    pub async fn put(&self, generation: &GenerationId, entry: &CacheEntry) -> Result<(), Error> {
        let generation = generation.clone();
        let key = entry.key.as_str().to_string();
        let payload = entry.payload.to_vec();
        let content_type = entry.content_type.clone();
        let status_code = i64::from(entry.status_code);
        let stored_at = entry.stored_at.clone();
        let etag = entry.etag.clone();
        let last_modified = entry.last_modified.clone();
        let digest = entry.digest.clone();
        let size = payload.len() as i64;
        let quota = self.quota_bytes;

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;

                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM generations WHERE name = ?1 AND version = ?2)",
                    params![generation.name, generation.version],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(Error::StoreWrite(format!("generation {generation} is not open")));
                }

                if let Some(quota) = quota {
                    let others: i64 = tx.query_row(
                        "SELECT COALESCE(SUM(size), 0) FROM entries
                        WHERE NOT (name = ?1 AND version = ?2 AND key = ?3)",
                        params![generation.name, generation.version, key],
                        |row| row.get(0),
                    )?;
                    let needed = others as u64 + size as u64;
                    if needed > quota {
                        return Err(Error::StoreWrite(format!(
                            "quota exceeded: {needed} bytes needed, quota is {quota}"
                        )));
                    }
                }

                tx.execute(
                    "INSERT INTO entries (
                        name, version, key, payload, content_type, status_code,
                        stored_at, etag, last_modified, digest, size
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    ON CONFLICT(name, version, key) DO UPDATE SET
                        payload = excluded.payload,
                        content_type = excluded.content_type,
                        status_code = excluded.status_code,
                        stored_at = excluded.stored_at,
                        etag = excluded.etag,
                        last_modified = excluded.last_modified,
                        digest = excluded.digest,
                        size = excluded.size",
                    params![
                        generation.name,
                        generation.version,
                        key,
                        payload,
                        content_type,
                        status_code,
                        stored_at,
                        etag,
                        last_modified,
                        digest,
                        size,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
            .map_err(|e| match e {
                Error::StoreWrite(_) => e,
                other => Error::StoreWrite(other.to_string()),
            })
    }

    /// Look up an entry by exact normalized key.
    ///
    /// Returns None if the key is not stored in this generation.
    pub async fn get(&self, generation: &GenerationId, key: &ResourceRef) -> Result<Option<CacheEntry>, Error> {
        let generation = generation.clone();
        let key = key.as_str().to_string();
        let row = self
            .conn
            .call(move |conn| -> Result<Option<EntryRow>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key, payload, content_type, status_code, stored_at, etag, last_modified, digest
                    FROM entries WHERE name = ?1 AND version = ?2 AND key = ?3",
                )?;

                let result = stmt.query_row(params![generation.name, generation.version, key], |row| {
                    Ok(EntryRow {
                        key: row.get(0)?,
                        payload: row.get(1)?,
                        content_type: row.get(2)?,
                        status_code: row.get(3)?,
                        stored_at: row.get(4)?,
                        etag: row.get(5)?,
                        last_modified: row.get(6)?,
                        digest: row.get(7)?,
                    })
                });

                match result {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)?;

        row.map(EntryRow::into_entry).transpose()
    }

    /// Mark a stored entry as verified now: restamp `stored_at` and record
    /// the validators the server sent. A validator the response omitted
    /// keeps its stored value. Returns whether the entry exists.
    pub async fn touch(
        &self, generation: &GenerationId, key: &ResourceRef, etag: Option<String>, last_modified: Option<String>,
    ) -> Result<bool, Error> {
        let generation = generation.clone();
        let key = key.as_str().to_string();
        let stored_at = now_timestamp();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute(
                    "UPDATE entries SET
                        stored_at = ?4,
                        etag = COALESCE(?5, etag),
                        last_modified = COALESCE(?6, last_modified)
                    WHERE name = ?1 AND version = ?2 AND key = ?3",
                    params![generation.name, generation.version, key, stored_at, etag, last_modified],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete one entry. Returns whether it existed.
    pub async fn delete(&self, generation: &GenerationId, key: &ResourceRef) -> Result<bool, Error> {
        let generation = generation.clone();
        let key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE name = ?1 AND version = ?2 AND key = ?3",
                    params![generation.name, generation.version, key],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Enumerate the entries of a generation, ordered by key.
    pub async fn list_entries(&self, generation: &GenerationId) -> Result<Vec<ResourceSummary>, Error> {
        let generation = generation.clone();
        self.conn
            .call(move |conn| -> Result<Vec<ResourceSummary>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key, content_type, size, digest, stored_at
                    FROM entries WHERE name = ?1 AND version = ?2 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![generation.name, generation.version], |row| {
                    Ok(ResourceSummary {
                        url: row.get(0)?,
                        content_type: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        digest: row.get(3)?,
                        stored_at: row.get(4)?,
                    })
                })?;
                rows.collect::<Result<Vec<_>, rusqlite::Error>>().map_err(Error::from)
            })
            .await
            .map_err(Error::from)
    }

    /// Number of entries in a generation.
    pub async fn entry_count(&self, generation: &GenerationId) -> Result<u64, Error> {
        let generation = generation.clone();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE name = ?1 AND version = ?2",
                    params![generation.name, generation.version],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every entry of a generation, keeping the generation itself.
    ///
    /// Returns the number of deleted entries.
    pub async fn clear_generation(&self, generation: &GenerationId) -> Result<u64, Error> {
        let generation = generation.clone();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE name = ?1 AND version = ?2",
                    params![generation.name, generation.version],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete the oldest-stored entries until at most `max_entries` remain.
    ///
    /// Returns the number of deleted entries.
    pub async fn evict_oldest(&self, generation: &GenerationId, max_entries: usize) -> Result<u64, Error> {
        let generation = generation.clone();
        let max = max_entries as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE name = ?1 AND version = ?2",
                    params![generation.name, generation.version],
                    |row| row.get(0),
                )?;
                if count <= max {
                    return Ok(0);
                }

                let to_delete = count - max;
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE name = ?1 AND version = ?2 AND key IN (
                        SELECT key FROM entries WHERE name = ?1 AND version = ?2
                        ORDER BY stored_at ASC, key ASC LIMIT ?3
                    )",
                    params![generation.name, generation.version, to_delete],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete entries stored before `cutoff` (an RFC 3339 timestamp in UTC).
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_stored_before(&self, generation: &GenerationId, cutoff: &str) -> Result<u64, Error> {
        let generation = generation.clone();
        let cutoff = cutoff.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE name = ?1 AND version = ?2 AND stored_at < ?3",
                    params![generation.name, generation.version, cutoff],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Payload bytes held across every generation, against the quota.
    pub async fn storage_usage(&self) -> Result<StorageUsage, Error> {
        let quota = self.quota_bytes;
        let used = self
            .conn
            .call(|conn| -> Result<u64, Error> {
                let used: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| row.get(0))?;
                Ok(used as u64)
            })
            .await
            .map_err(Error::from)?;

        let percent = quota
            .filter(|q| *q > 0)
            .map(|q| ((used as f64 / q as f64) * 10_000.0).round() / 100.0);

        Ok(StorageUsage { used, quota, percent })
    }
}
