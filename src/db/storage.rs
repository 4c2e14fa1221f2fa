//! SQLite storage engine.
//!
//! Connections are opened per logical operation and dropped afterwards, so
//! repository handles can be shared across worker threads without any
//! connection locking. In-memory engines pin a single shared-cache database
//! for their whole lifetime; a plain `:memory:` open per call would hand
//! every operation a fresh empty database.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::schema::SCHEMA;
use crate::error::{Error, Result};

/// Names private in-memory databases so independent engines never alias.
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct StorageEngine {
    location: Location,
}

enum Location {
    File(PathBuf),
    Memory {
        uri: String,
        /// SQLite drops a shared-cache in-memory database once its last
        /// connection closes, so one connection stays open for the engine's
        /// lifetime. It is never used for queries.
        _anchor: Mutex<Connection>,
    },
}

impl StorageEngine {
    /// Open the database at `path`, creating parent directories and applying
    /// the schema. Both are idempotent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }

        let engine = Self {
            location: Location::File(path),
        };
        let conn = engine.connect()?;
        conn.execute_batch(SCHEMA)?;
        Ok(engine)
    }

    /// Private in-memory database for tests. State persists across
    /// `connect()` calls for as long as the engine lives.
    pub fn in_memory() -> Result<Self> {
        let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:modelvault-mem-{seq}?mode=memory&cache=shared");

        let anchor = Connection::open(&uri)?;
        anchor.pragma_update(None, "foreign_keys", true)?;
        anchor.execute_batch(SCHEMA)?;

        Ok(Self {
            location: Location::Memory {
                uri,
                _anchor: Mutex::new(anchor),
            },
        })
    }

    /// Filesystem location of the database, when persisted.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory { .. } => None,
        }
    }

    /// Open a fresh connection with the required pragmas applied. Callers
    /// hold it for one logical operation and drop it.
    pub fn connect(&self) -> Result<Connection> {
        let conn = match &self.location {
            Location::File(path) => Connection::open(path)?,
            Location::Memory { uri, .. } => Connection::open(uri)?,
        };
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(conn)
    }
}
