//! Replicated cache.
//!
//! Replicas are grouped by purpose. Writes go to every replica of a group at
//! once; reads pick one replica of the group at random to spread load.

use anyhow::Context;
use rand::seq::SliceRandom;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

use crate::job::error::ReportError;

pub const REPORTS_GROUP: &str = "attendance-reports";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache replicas configured for group {0}")]
    EmptyGroup(String),
    #[error("cache replica {replica}: {message}")]
    Replica { replica: String, message: String },
    #[error("{failed} of {total} replicas in group {group} failed: {first}")]
    FanOut {
        group: String,
        failed: usize,
        total: usize,
        first: String,
    },
}

impl From<CacheError> for ReportError {
    fn from(e: CacheError) -> Self {
        ReportError::TransientStore(e.to_string())
    }
}

pub trait CacheReplica: Send + Sync {
    fn name(&self) -> &str;
    fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), CacheError>;
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

#[derive(Default)]
pub struct CachePool {
    groups: HashMap<String, Vec<Box<dyn CacheReplica>>>,
}

impl CachePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replica(&mut self, group: &str, replica: Box<dyn CacheReplica>) {
        self.groups.entry(group.to_string()).or_default().push(replica);
    }

    fn replicas(&self, group: &str) -> Result<&[Box<dyn CacheReplica>], CacheError> {
        match self.groups.get(group) {
            Some(r) if !r.is_empty() => Ok(r.as_slice()),
            _ => Err(CacheError::EmptyGroup(group.to_string())),
        }
    }

    /// One replica of `group`, chosen uniformly at random.
    pub fn select(&self, group: &str) -> Result<&dyn CacheReplica, CacheError> {
        let replicas = self.replicas(group)?;
        replicas
            .choose(&mut rand::thread_rng())
            .map(|r| r.as_ref())
            .ok_or_else(|| CacheError::EmptyGroup(group.to_string()))
    }

    /// Writes to every replica of `group` concurrently and waits for all of them.
    pub fn set(
        &self,
        group: &str,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CacheError> {
        let replicas = self.replicas(group)?;
        let results: Vec<Result<(), CacheError>> = std::thread::scope(|s| {
            let handles: Vec<_> = replicas
                .iter()
                .map(|r| s.spawn(move || r.set(key, value, ttl_seconds)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(CacheError::Replica {
                            replica: group.to_string(),
                            message: "writer thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        });

        let total = results.len();
        let errors: Vec<CacheError> = results.into_iter().filter_map(Result::err).collect();
        let failed = errors.len();
        debug!(group, key, total, failed, "cache set fan-out");
        match errors.into_iter().next() {
            None => Ok(()),
            Some(first) if total == 1 => Err(first),
            Some(first) => Err(CacheError::FanOut {
                group: group.to_string(),
                failed,
                total,
                first: first.to_string(),
            }),
        }
    }

    pub fn get(&self, group: &str, key: &str) -> Result<Option<String>, CacheError> {
        self.select(group)?.get(key)
    }

    /// Blanks the key on every replica with a one second expiry, then deletes
    /// it on one replica.
    pub fn delete(&self, group: &str, key: &str) -> Result<bool, CacheError> {
        self.set(group, key, "null", Some(1))?;
        self.select(group)?.delete(key)
    }
}

fn replica_err(replica: &str, e: impl std::fmt::Display) -> CacheError {
    CacheError::Replica {
        replica: replica.to_string(),
        message: e.to_string(),
    }
}

/// Process-local replica.
pub struct MemoryCacheReplica {
    name: String,
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCacheReplica {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl CacheReplica for MemoryCacheReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), CacheError> {
        let now = Instant::now();
        // A ttl too large for the clock never expires.
        let expires = ttl_seconds.and_then(|s| now.checked_add(Duration::from_secs(s)));
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| replica_err(&self.name, "lock poisoned"))?;
        entries.retain(|_, (_, at)| at.map_or(true, |at| at > now));
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| replica_err(&self.name, "lock poisoned"))?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((_, Some(at))) => *at <= Instant::now(),
            Some((_, None)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| replica_err(&self.name, "lock poisoned"))?;
        Ok(entries.remove(key).is_some())
    }
}

/// Replica persisted in a SQLite file. Each call opens its own connection.
pub struct SqliteCacheReplica {
    name: String,
    path: PathBuf,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl SqliteCacheReplica {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache {}", path.to_string_lossy()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries(
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            [],
        )?;
        Ok(Self {
            name: path.to_string_lossy().to_string(),
            path: path.to_path_buf(),
        })
    }

    fn conn(&self) -> Result<Connection, CacheError> {
        Connection::open(&self.path).map_err(|e| replica_err(&self.name, e))
    }
}

impl CacheReplica for SqliteCacheReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), CacheError> {
        let now = now_millis();
        let expires_at = ttl_seconds.map(|s| {
            i64::try_from(s)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000)
                .saturating_add(now)
        });
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?", [now])
            .map_err(|e| replica_err(&self.name, e))?;
        conn.execute(
            "INSERT INTO cache_entries(key, value, expires_at) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               expires_at = excluded.expires_at",
            (key, value, expires_at),
        )
        .map_err(|e| replica_err(&self.name, e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.conn()?
            .query_row(
                "SELECT value FROM cache_entries
                 WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
                (key, now_millis()),
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| replica_err(&self.name, e))
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM cache_entries WHERE key = ?", [key])
            .map_err(|e| replica_err(&self.name, e))?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReplica;

    impl CacheReplica for FailingReplica {
        fn name(&self) -> &str {
            "failing"
        }
        fn set(&self, _: &str, _: &str, _: Option<u64>) -> Result<(), CacheError> {
            Err(replica_err("failing", "connection refused"))
        }
        fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(replica_err("failing", "connection refused"))
        }
        fn delete(&self, _: &str) -> Result<bool, CacheError> {
            Err(replica_err("failing", "connection refused"))
        }
    }

    #[test]
    fn set_reaches_every_replica() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = CachePool::new();
        pool.add_replica(
            REPORTS_GROUP,
            Box::new(SqliteCacheReplica::open(&dir.path().join("a.sqlite3")).expect("a")),
        );
        pool.add_replica(
            REPORTS_GROUP,
            Box::new(SqliteCacheReplica::open(&dir.path().join("b.sqlite3")).expect("b")),
        );
        pool.add_replica(REPORTS_GROUP, Box::new(MemoryCacheReplica::new("mem")));

        pool.set(REPORTS_GROUP, "M36P4A", r#"{"status":"P"}"#, Some(60))
            .expect("set");
        for replica in pool.replicas(REPORTS_GROUP).expect("group") {
            assert_eq!(
                replica.get("M36P4A").expect("get").as_deref(),
                Some(r#"{"status":"P"}"#),
                "replica {}",
                replica.name()
            );
        }
        assert_eq!(
            pool.get(REPORTS_GROUP, "M36P4A").expect("get").as_deref(),
            Some(r#"{"status":"P"}"#)
        );
    }

    #[test]
    fn unknown_group_is_an_error() {
        let pool = CachePool::new();
        assert!(matches!(
            pool.set("nope", "k", "v", None),
            Err(CacheError::EmptyGroup(_))
        ));
        assert!(pool.select("nope").is_err());
    }

    #[test]
    fn failed_replica_is_reported_after_others_are_written() {
        let mut pool = CachePool::new();
        pool.add_replica("g", Box::new(MemoryCacheReplica::new("ok")));
        pool.add_replica("g", Box::new(FailingReplica));
        let err = pool.set("g", "k", "v", None).expect_err("fan-out error");
        assert!(matches!(err, CacheError::FanOut { failed: 1, total: 2, .. }));
        let ok = &pool.replicas("g").expect("group")[0];
        assert_eq!(ok.get("k").expect("get").as_deref(), Some("v"));
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let replica = SqliteCacheReplica::open(&dir.path().join("c.sqlite3")).expect("open");
        replica.set("k", "v", Some(0)).expect("set");
        assert_eq!(replica.get("k").expect("get"), None);

        let mem = MemoryCacheReplica::new("m");
        mem.set("k", "v", Some(0)).expect("set");
        assert_eq!(mem.get("k").expect("get"), None);
        mem.set("k", "v", None).expect("set");
        assert_eq!(mem.get("k").expect("get").as_deref(), Some("v"));
    }

    #[test]
    fn set_purges_expired_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("purge.sqlite3");
        let replica = SqliteCacheReplica::open(&path).expect("open");
        replica.set("old", "v", Some(0)).expect("set");
        replica.set("kept", "v", None).expect("set");
        replica.set("new", "v", Some(60)).expect("set");

        let conn = Connection::open(&path).expect("conn");
        let mut keys: Vec<String> = conn
            .prepare("SELECT key FROM cache_entries")
            .expect("prepare")
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        keys.sort();
        assert_eq!(keys, vec!["kept", "new"]);

        let mem = MemoryCacheReplica::new("m");
        mem.set("old", "v", Some(0)).expect("set");
        mem.set("new", "v", Some(60)).expect("set");
        let entries = mem.entries.lock().expect("lock");
        assert!(!entries.contains_key("old"));
        assert!(entries.contains_key("new"));
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let replica = SqliteCacheReplica::open(&dir.path().join("ttl.sqlite3")).expect("open");
        replica.set("k", "v", Some(u64::MAX)).expect("set");
        assert_eq!(replica.get("k").expect("get").as_deref(), Some("v"));

        let mem = MemoryCacheReplica::new("m");
        mem.set("k", "v", Some(u64::MAX)).expect("set");
        assert_eq!(mem.get("k").expect("get").as_deref(), Some("v"));
    }

    #[test]
    fn delete_blanks_then_removes() {
        let mut pool = CachePool::new();
        pool.add_replica("g", Box::new(MemoryCacheReplica::new("only")));
        pool.set("g", "k", "v", None).expect("set");
        assert!(pool.delete("g", "k").expect("delete"));
        assert_eq!(pool.get("g", "k").expect("get"), None);
    }
}
