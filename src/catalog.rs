//! The catalog index: a durable, append-only sequence of package entries
//! (public and private) plus the set of reserved private namespaces.
//!
//! Entries are ordered by a strictly monotonic rowid assigned at insertion;
//! `since(n)` hands back everything after `n` in id order, which is exactly
//! the contract the `/all-packages/since/{n}` endpoint exposes.

use crate::errors::CatalogError;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;

type Result<T> = std::result::Result<T, CatalogError>;

lazy_static! {
    /// `group/pkg`: ascii group starting with a letter, kebab-friendly pkg.
    static ref PACKAGE_NAME_RE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9]+/[A-Za-z0-9-]+$").unwrap();
}

pub fn valid_name(name: &str) -> bool {
    PACKAGE_NAME_RE.is_match(name)
}

/// Parses an upstream `name@version` spec into its halves.
///
/// The upstream incremental feed is the only producer of these strings; a
/// malformed one is a decode error, reported as such rather than smuggled
/// out through a panic.
pub fn parse_spec(spec: &str) -> Result<(String, String)> {
    let mut parts = spec.splitn(2, '@');
    let name = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if name.is_empty() || version.is_empty() {
        return Err(CatalogError::InvalidSpec(spec.to_string()));
    }
    semver::Version::parse(version)
        .map_err(|_| CatalogError::InvalidSpec(spec.to_string()))?;
    Ok((name.to_string(), version.to_string()))
}

#[derive(Clone, Debug, PartialEq)]
pub struct PackageEntry {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub private: bool,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
}

/// New rows produced by a sync tick, ready to apply under one writer lock.
pub enum SyncPlan {
    /// Fresh mirror: the flattened `/all-packages` object, in upstream
    /// iteration order.
    Full(Vec<(String, String)>),
    /// Incremental: `/all-packages/since/{n}` entries, in upstream order.
    Incremental(Vec<(String, String)>),
}

/// Process-local bookkeeping guarded together with the index itself.
#[derive(Default)]
struct SyncCursor {
    last_sync: Option<Instant>,
}

/// Handle on the sqlite-backed index.
///
/// A connection is opened per operation (they are short-lived and sqlite
/// makes this cheap); the readers-writer lock provides the concurrency
/// discipline: router reads share it, sync/ingest writes take it
/// exclusively. Writers never perform network IO while holding it.
pub struct Catalog {
    db_path: PathBuf,
    cursor: RwLock<SyncCursor>,
}

/// Prepare the database schema.
fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE IF NOT EXISTS packages
        (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT    NOT NULL,
            version TEXT    NOT NULL,
            private INTEGER NOT NULL,
            created TEXT    NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_packages_name_version
            ON packages (name, version);
        CREATE TABLE IF NOT EXISTS private_namespaces
        (
            name TEXT PRIMARY KEY
        );
        COMMIT;
    "#,
    )?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<PackageEntry> {
    Ok(PackageEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        private: row.get(3)?,
        created: row.get(4)?,
    })
}

const ENTRY_COLUMNS: &str = "id, name, version, private, created";

impl Catalog {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        init(&conn)?;
        Ok(Self {
            db_path,
            cursor: RwLock::new(SyncCursor::default()),
        })
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn get(&self, name: &str, version: &str) -> Result<Option<PackageEntry>> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM packages WHERE name = ?1 AND version = ?2",
                    ENTRY_COLUMNS
                ),
                params![name, version],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every known entry, in insertion order so per-name version lists come
    /// out in the order they were published.
    pub fn list_all(&self) -> Result<Vec<PackageEntry>> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages ORDER BY id ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn since(&self, id: i64) -> Result<Vec<PackageEntry>> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE id > ?1 ORDER BY id ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn insert(&self, name: &str, version: &str, private: bool) -> Result<PackageEntry> {
        let _lock = self.cursor.write().unwrap();
        let conn = self.connect()?;
        insert_with(&conn, name, version, private)
    }

    pub fn public_count(&self) -> Result<u64> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE private = 0",
            params![],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn ns_list(&self) -> Result<Vec<Namespace>> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM private_namespaces ORDER BY name ASC")?;
        let rows = stmt.query_map(params![], |row| {
            Ok(Namespace { name: row.get(0)? })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn ns_get(&self, name: &str) -> Result<Option<Namespace>> {
        let _lock = self.cursor.read().unwrap();
        let conn = self.connect()?;
        let ns = conn
            .query_row(
                "SELECT name FROM private_namespaces WHERE name = ?1",
                params![name],
                |row| Ok(Namespace { name: row.get(0)? }),
            )
            .optional()?;
        Ok(ns)
    }

    pub fn ns_create(&self, name: &str) -> Result<Namespace> {
        let _lock = self.cursor.write().unwrap();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO private_namespaces (name) VALUES (?1)",
            params![name],
        )
        .map_err(|e| match CatalogError::from(e) {
            CatalogError::Duplicate(_) => CatalogError::Duplicate(name.to_string()),
            other => other,
        })?;
        Ok(Namespace {
            name: name.to_string(),
        })
    }

    /// Applies one sync tick's worth of upstream rows under a single writer
    /// lock and stamps the cursor. Incremental entries are inserted
    /// individually so each gets a fresh id in upstream order; a duplicate
    /// is logged and skipped rather than aborting the batch.
    pub fn apply_sync(&self, plan: SyncPlan) -> Result<usize> {
        let mut cursor = self.cursor.write().unwrap();
        let mut conn = self.connect()?;
        let applied = match plan {
            SyncPlan::Full(entries) => batch_insert_with(&mut conn, &entries)?,
            SyncPlan::Incremental(entries) => {
                let mut applied = 0;
                for (name, version) in &entries {
                    match insert_with(&conn, name, version, false) {
                        Ok(_) => applied += 1,
                        Err(CatalogError::Duplicate(_)) => {
                            log::warn!("upstream re-announced {}@{}, skipping", name, version)
                        }
                        Err(e) => return Err(e),
                    }
                }
                applied
            }
        };
        cursor.last_sync = Some(Instant::now());
        Ok(applied)
    }

    /// Completion time of the last successful sync, if any.
    pub fn last_sync(&self) -> Option<Instant> {
        self.cursor.read().unwrap().last_sync
    }
}

fn insert_with(conn: &Connection, name: &str, version: &str, private: bool) -> Result<PackageEntry> {
    let created = Utc::now();
    conn.execute(
        "INSERT INTO packages (name, version, private, created) VALUES (?1, ?2, ?3, ?4)",
        params![name, version, private, created],
    )
    .map_err(|e| match CatalogError::from(e) {
        CatalogError::Duplicate(_) => {
            CatalogError::Duplicate(format!("{}@{}", name, version))
        }
        other => other,
    })?;
    Ok(PackageEntry {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        version: version.to_string(),
        private,
        created,
    })
}

fn batch_insert_with(conn: &mut Connection, entries: &[(String, String)]) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO packages (name, version, private, created) VALUES (?1, ?2, 0, ?3)",
        )?;
        for (name, version) in entries {
            stmt.execute(params![name, version, Utc::now()])?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}
