//! Read access to the relational source of truth.

use crate::errors::{CacheError, Result};
use crate::models::EntityId;
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Keyset-paginated listing of owner identifiers.
#[async_trait]
pub trait OwnerSource: Send + Sync {
    /// Up to `limit` owner ids strictly greater than `after`, ascending.
    async fn owner_page(&self, after: Option<EntityId>, limit: usize) -> Result<Vec<EntityId>>;
}

/// Bulk lookup of each owner's related ids.
#[async_trait]
pub trait RelationSource: Send + Sync {
    /// Resolves all given owners in one round trip. Owners without relations may be absent.
    async fn relations_of(
        &self,
        owner_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, BTreeSet<EntityId>>>;
}

pub struct SqliteFriendSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFriendSource {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Config("source connection lock poisoned".into()))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS member (
                id INTEGER PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS friend (
                owner_id INTEGER NOT NULL,
                friend_id INTEGER NOT NULL,
                PRIMARY KEY (owner_id, friend_id)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn insert_member(&self, id: EntityId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("INSERT OR IGNORE INTO member (id) VALUES (?1)", params![id])?;
        Ok(())
    }

    /// Records a one-directional relation `owner_id -> friend_id`.
    pub fn insert_friend(&self, owner_id: EntityId, friend_id: EntityId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO friend (owner_id, friend_id) VALUES (?1, ?2)",
            params![owner_id, friend_id],
        )?;
        Ok(())
    }

    pub fn delete_friend(&self, owner_id: EntityId, friend_id: EntityId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM friend WHERE owner_id = ?1 AND friend_id = ?2",
            params![owner_id, friend_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl OwnerSource for SqliteFriendSource {
    async fn owner_page(&self, after: Option<EntityId>, limit: usize) -> Result<Vec<EntityId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT id FROM member WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let rows = stmt.query_map(params![after.unwrap_or(i64::MIN), limit as i64], |row| {
            row.get::<_, i64>(0)
        })?;
        let mut ids = Vec::with_capacity(limit);
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl RelationSource for SqliteFriendSource {
    async fn relations_of(
        &self,
        owner_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, BTreeSet<EntityId>>> {
        let mut relations: HashMap<EntityId, BTreeSet<EntityId>> = HashMap::new();
        if owner_ids.is_empty() {
            return Ok(relations);
        }
        let placeholders = vec!["?"; owner_ids.len()].join(",");
        let sql = format!(
            "SELECT owner_id, friend_id FROM friend WHERE owner_id IN ({})",
            placeholders
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(owner_ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (owner_id, friend_id) = row?;
            relations.entry(owner_id).or_default().insert(friend_id);
        }
        Ok(relations)
    }
}
