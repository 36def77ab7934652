//! Handles on the panel database.
//!
//! Decisions read through a fixed set of long-lived read-only connections,
//! so concurrent requests query the database in parallel. Side effects go
//! through short-lived read-write connections from [`WriterPool`], so a slow
//! writer never holds up the read path.

use crate::config::StoreConfig;
use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Tables this service reads or appends to. It never creates them.
pub const REQUIRED_TABLES: [&str; 6] = [
    "users",
    "domains",
    "packages",
    "user_packages",
    "email_send_log",
    "mail_queue",
];

pub struct PolicyStore {
    path: PathBuf,
    readers: Vec<Mutex<Connection>>,
    read_cursor: AtomicUsize,
    writers: WriterPool,
}

impl PolicyStore {
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            bail!("Database not found: {}", path.display());
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let mut readers = Vec::with_capacity(config.reader_pool_size.max(1));
        for _ in 0..config.reader_pool_size.max(1) {
            let conn = open_connection(&path, OpenFlags::SQLITE_OPEN_READ_ONLY, busy_timeout)
                .with_context(|| format!("Failed to open database read-only: {}", path.display()))?;
            readers.push(Mutex::new(conn));
        }

        log::debug!("Opened {} read handles on {}", readers.len(), path.display());

        Ok(Self {
            writers: WriterPool::new(
                path.clone(),
                busy_timeout,
                config.writer_pool_size,
                Duration::from_secs(config.writer_max_age_seconds),
            ),
            path,
            readers,
            read_cursor: AtomicUsize::new(0),
        })
    }

    /// Open the database, check its schema, and close it again. Used at
    /// startup before the process forks, since a SQLite handle must not be
    /// carried across `fork()`.
    pub fn check(path: impl AsRef<Path>, config: &StoreConfig) -> Result<()> {
        let store = Self::open(path, config)?;
        store.verify_schema()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails when any consumed table is missing.
    pub fn verify_schema(&self) -> Result<()> {
        let missing = self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
            let mut missing = Vec::new();
            for table in REQUIRED_TABLES {
                let found: i64 = stmt.query_row([table], |row| row.get(0))?;
                if found == 0 {
                    missing.push(table);
                }
            }
            Ok(missing)
        })?;

        if !missing.is_empty() {
            bail!(
                "Database {} is missing tables: {}",
                self.path.display(),
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Run a query on one of the read-only handles.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.reader()?;
        Ok(f(&*conn)?)
    }

    /// First idle read handle, or wait on the next one in turn.
    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        for slot in &self.readers {
            match slot.try_lock() {
                Ok(conn) => return Ok(conn),
                Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => continue,
            }
        }
        let index = self.read_cursor.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[index]
            .lock()
            .map_err(|_| anyhow::anyhow!("read handle lock poisoned"))
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Run a statement on a read-write handle borrowed from the pool.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let handle = self.writers.acquire()?;
        let result = f(&handle.conn);
        match result {
            Ok(value) => {
                self.writers.release(handle);
                Ok(value)
            }
            // A failed handle is dropped (closed) rather than recycled.
            Err(e) => Err(e.into()),
        }
    }
}

fn open_connection(path: &Path, flags: OpenFlags, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

struct WriteHandle {
    conn: Connection,
    opened_at: Instant,
}

/// Bounded set of idle read-write connections. With `max_idle == 0` every
/// write opens a fresh connection and closes it afterwards.
pub struct WriterPool {
    path: PathBuf,
    busy_timeout: Duration,
    max_idle: usize,
    max_age: Duration,
    idle: Mutex<Vec<WriteHandle>>,
}

impl WriterPool {
    fn new(path: PathBuf, busy_timeout: Duration, max_idle: usize, max_age: Duration) -> Self {
        Self {
            path,
            busy_timeout,
            max_idle,
            max_age,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
        }
    }

    fn acquire(&self) -> Result<WriteHandle> {
        if let Ok(mut idle) = self.idle.lock() {
            while let Some(handle) = idle.pop() {
                if handle.opened_at.elapsed() < self.max_age {
                    return Ok(handle);
                }
            }
        }

        let conn = open_connection(&self.path, OpenFlags::SQLITE_OPEN_READ_WRITE, self.busy_timeout)
            .with_context(|| format!("Failed to open database read-write: {}", self.path.display()))?;
        Ok(WriteHandle {
            conn,
            opened_at: Instant::now(),
        })
    }

    fn release(&self, handle: WriteHandle) {
        if handle.opened_at.elapsed() >= self.max_age {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(handle);
            }
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}
