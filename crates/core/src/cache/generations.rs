//! Versioned cache generations.
//!
//! A generation is a named, versioned collection of entries. At most one
//! generation per name carries the `active` flag; the flag is moved inside a
//! single transaction so no reader sees two (or zero, mid-switch) active
//! versions.

use super::connection::CacheDb;
use crate::Error;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

/// Identity of a generation: `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GenerationId {
    pub name: String,
    pub version: String,
}

impl GenerationId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into() }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A generation as listed by the store.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GenerationInfo {
    pub id: GenerationId,
    pub created_at: String,
    pub active: bool,
    pub entries: u64,
    pub bytes: u64,
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl CacheDb {
    /// Create the generation if it does not exist yet.
    ///
    /// Idempotent: opening an existing generation leaves it and its entries untouched.
    pub async fn open_generation(&self, id: &GenerationId) -> Result<(), Error> {
        let id = id.clone();
        let created_at = now_timestamp();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO generations (name, version, created_at, active)
                    VALUES (?1, ?2, ?3, 0)
                    ON CONFLICT(name, version) DO NOTHING",
                    params![id.name, id.version, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Whether the generation exists.
    pub async fn has_generation(&self, id: &GenerationId) -> Result<bool, Error> {
        let id = id.clone();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let exists = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM generations WHERE name = ?1 AND version = ?2)",
                    params![id.name, id.version],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(Error::from)
    }

    /// All generations, with entry counts and payload sizes.
    pub async fn list_generations(&self) -> Result<Vec<GenerationInfo>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<GenerationInfo>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT g.name, g.version, g.created_at, g.active,
                        COUNT(e.key), COALESCE(SUM(e.size), 0)
                    FROM generations g
                    LEFT JOIN entries e ON e.name = g.name AND e.version = g.version
                    GROUP BY g.name, g.version
                    ORDER BY g.name, g.created_at, g.version",
                )?;

                let rows = stmt.query_map([], |row| {
                    Ok(GenerationInfo {
                        id: GenerationId { name: row.get(0)?, version: row.get(1)? },
                        created_at: row.get(2)?,
                        active: row.get::<_, i32>(3)? == 1,
                        entries: row.get::<_, i64>(4)? as u64,
                        bytes: row.get::<_, i64>(5)? as u64,
                    })
                })?;

                rows.collect::<Result<Vec<_>, rusqlite::Error>>().map_err(Error::from)
            })
            .await
            .map_err(Error::from)
    }

    /// The active generation for `name`, if any.
    pub async fn active_generation(&self, name: &str) -> Result<Option<GenerationId>, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<Option<GenerationId>, Error> {
                let version: Option<String> = conn
                    .query_row(
                        "SELECT version FROM generations WHERE name = ?1 AND active = 1",
                        params![name],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(version.map(|version| GenerationId { name, version }))
            })
            .await
            .map_err(Error::from)
    }

    /// Make `id` the active generation for its name.
    ///
    /// Clears the flag on every other version of the same name in the same
    /// transaction. Fails with `NotFound` if the generation was never opened.
    pub async fn activate_generation(&self, id: &GenerationId) -> Result<(), Error> {
        let id = id.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM generations WHERE name = ?1 AND version = ?2)",
                    params![id.name, id.version],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(Error::NotFound(format!("generation {id}")));
                }

                tx.execute(
                    "UPDATE generations SET active = 0 WHERE name = ?1 AND version != ?2",
                    params![id.name, id.version],
                )?;
                tx.execute(
                    "UPDATE generations SET active = 1 WHERE name = ?1 AND version = ?2",
                    params![id.name, id.version],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a generation and all of its entries.
    ///
    /// A no-op returning `false` when the generation is the active one for its
    /// name, or does not exist.
    pub async fn delete_generation(&self, id: &GenerationId) -> Result<bool, Error> {
        let id = id.clone();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM entries WHERE name = ?1 AND version = ?2
                    AND EXISTS(SELECT 1 FROM generations WHERE name = ?1 AND version = ?2 AND active = 0)",
                    params![id.name, id.version],
                )?;
                let deleted = tx.execute(
                    "DELETE FROM generations WHERE name = ?1 AND version = ?2 AND active = 0",
                    params![id.name, id.version],
                )?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_generation_idempotent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let id = GenerationId::new("offgrid", "v1");

        db.open_generation(&id).await.unwrap();
        db.open_generation(&id).await.unwrap();

        let generations = db.list_generations().await.unwrap();
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].id, id);
        assert!(!generations[0].active);
        assert!(db.has_generation(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_activate_moves_flag() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let v1 = GenerationId::new("offgrid", "v1");
        let v2 = GenerationId::new("offgrid", "v2");
        db.open_generation(&v1).await.unwrap();
        db.open_generation(&v2).await.unwrap();

        db.activate_generation(&v1).await.unwrap();
        assert_eq!(db.active_generation("offgrid").await.unwrap(), Some(v1.clone()));

        db.activate_generation(&v2).await.unwrap();
        assert_eq!(db.active_generation("offgrid").await.unwrap(), Some(v2.clone()));

        let active: Vec<_> = db
            .list_generations()
            .await
            .unwrap()
            .into_iter()
            .filter(|g| g.active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_activate_missing_generation() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let result = db.activate_generation(&GenerationId::new("offgrid", "nope")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_names_are_independent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let a = GenerationId::new("pages", "v1");
        let b = GenerationId::new("fonts", "v1");
        db.open_generation(&a).await.unwrap();
        db.open_generation(&b).await.unwrap();
        db.activate_generation(&a).await.unwrap();
        db.activate_generation(&b).await.unwrap();

        assert_eq!(db.active_generation("pages").await.unwrap(), Some(a));
        assert_eq!(db.active_generation("fonts").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_delete_active_generation_is_noop() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let v1 = GenerationId::new("offgrid", "v1");
        db.open_generation(&v1).await.unwrap();
        db.activate_generation(&v1).await.unwrap();

        assert!(!db.delete_generation(&v1).await.unwrap());
        assert!(db.has_generation(&v1).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_inactive_generation() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let v1 = GenerationId::new("offgrid", "v1");
        let v2 = GenerationId::new("offgrid", "v2");
        db.open_generation(&v1).await.unwrap();
        db.open_generation(&v2).await.unwrap();
        db.activate_generation(&v2).await.unwrap();

        assert!(db.delete_generation(&v1).await.unwrap());
        assert!(!db.has_generation(&v1).await.unwrap());
        assert!(!db.delete_generation(&v1).await.unwrap());
    }
}
