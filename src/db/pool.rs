//! Bounded SQLite connection pool.
//!
//! The pool is the scarce resource of the pipeline: its size caps how many
//! handlers can be inside the store at once. Checkout waits up to
//! `acquire_timeout`, then reports `PersistenceError::Unavailable` so the
//! coordinator can back off instead of piling up.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use super::sqlite::{open_connection, open_database, open_memory_database};
use super::{DatabaseError, PersistenceError};

pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    returned: Condvar,
    size: usize,
    acquire_timeout: Duration,
    location: Option<PathBuf>,
}

impl ConnectionPool {
    /// Open `size` connections to a database file. Migrations run once, on the first.
    pub fn open(path: &Path, size: usize, acquire_timeout: Duration) -> Result<Self, DatabaseError> {
        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        connections.push(open_database(path)?);
        for _ in 1..size {
            connections.push(open_connection(path)?);
        }

        tracing::info!(path = %path.display(), size, "SQLite connection pool opened");

        Ok(Self {
            idle: Mutex::new(connections),
            returned: Condvar::new(),
            size,
            acquire_timeout,
            location: Some(path.to_path_buf()),
        })
    }

    /// Single-connection pool over an in-memory database.
    /// Each in-memory connection is its own database, so this never grows.
    pub fn memory(acquire_timeout: Duration) -> Result<Self, DatabaseError> {
        Ok(Self {
            idle: Mutex::new(vec![open_memory_database()?]),
            returned: Condvar::new(),
            size: 1,
            acquire_timeout,
            location: None,
        })
    }

    /// Check out a connection, waiting at most `acquire_timeout`.
    pub fn get(&self) -> Result<PooledConnection<'_>, PersistenceError> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut idle = self
            .idle
            .lock()
            .map_err(|_| PersistenceError::Unavailable("connection pool lock poisoned".into()))?;

        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PersistenceError::Unavailable(format!(
                    "no database connection available within {}ms",
                    self.acquire_timeout.as_millis()
                )));
            }

            let (guard, _) = self
                .returned
                .wait_timeout(idle, deadline - now)
                .map_err(|_| PersistenceError::Unavailable("connection pool lock poisoned".into()))?;
            idle = guard;
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Database file backing this pool, `None` for in-memory.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn give_back(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
            self.returned.notify_one();
        }
    }
}

/// Connection on loan from a `ConnectionPool`; returned on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
