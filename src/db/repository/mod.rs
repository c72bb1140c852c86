//! Repository layer: the narrow persistence contract of the pipeline.
//!
//! `CaseRepository` is the only thing the coordinator and dispatcher see.
//! Two engines satisfy it with identical behavior:
//! - `SqliteCaseRepository`: pooled SQLite (file or in-memory)
//! - `MemoryCaseRepository`: process-local maps, no durability
//!
//! All calls are blocking; async callers run them on the blocking pool.

mod audit;
mod case;
mod memory;

pub use audit::*;
pub use case::*;
pub use memory::MemoryCaseRepository;

use std::sync::Arc;

use super::pool::ConnectionPool;
use super::{DatabaseError, PersistenceError};
use crate::config::{DatabaseBackend, ModerationConfig};
use crate::models::*;

/// Storage contract for moderation cases and their dispatch audit trail.
pub trait CaseRepository: Send + Sync {
    /// Atomically create the case for an event, or return the case the event
    /// (or identical content) already resolved to.
    fn create_case_if_absent(&self, new_case: &NewCase) -> Result<CaseRecord, PersistenceError>;

    /// Record successful delivery. Idempotent.
    fn mark_dispatched(&self, case_id: i64) -> Result<(), PersistenceError>;

    /// Record that delivery retries were exhausted.
    fn mark_dispatch_failed(&self, case_id: i64) -> Result<(), PersistenceError>;

    fn find_case_by_event(&self, event_id: &str) -> Result<Option<ModerationCase>, PersistenceError>;

    fn find_verdict_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<Verdict>, PersistenceError>;

    fn get_case(&self, case_id: i64) -> Result<Option<ModerationCase>, PersistenceError>;

    fn record_dispatch_attempt(&self, attempt: &DispatchAttempt) -> Result<(), PersistenceError>;

    fn list_dispatch_attempts(&self, case_id: i64) -> Result<Vec<DispatchAttempt>, PersistenceError>;

    fn pending_dispatches(&self) -> Result<Vec<ModerationCase>, PersistenceError>;

    fn count_cases(&self) -> Result<u64, PersistenceError>;
}

/// SQLite engine behind a bounded connection pool.
pub struct SqliteCaseRepository {
    pool: ConnectionPool,
}

impl SqliteCaseRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl CaseRepository for SqliteCaseRepository {
    fn create_case_if_absent(&self, new_case: &NewCase) -> Result<CaseRecord, PersistenceError> {
        let mut conn = self.pool.get()?;
        case::create_case_if_absent(&mut conn, new_case)
    }

    fn mark_dispatched(&self, case_id: i64) -> Result<(), PersistenceError> {
        case::mark_dispatched(&*self.pool.get()?, case_id)
    }

    fn mark_dispatch_failed(&self, case_id: i64) -> Result<(), PersistenceError> {
        case::mark_dispatch_failed(&*self.pool.get()?, case_id)
    }

    fn find_case_by_event(&self, event_id: &str) -> Result<Option<ModerationCase>, PersistenceError> {
        case::find_case_by_event(&*self.pool.get()?, event_id)
    }

    fn find_verdict_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<Verdict>, PersistenceError> {
        case::find_verdict_by_fingerprint(&*self.pool.get()?, fingerprint)
    }

    fn get_case(&self, case_id: i64) -> Result<Option<ModerationCase>, PersistenceError> {
        case::get_case(&*self.pool.get()?, case_id)
    }

    fn record_dispatch_attempt(&self, attempt: &DispatchAttempt) -> Result<(), PersistenceError> {
        audit::insert_dispatch_attempt(&*self.pool.get()?, attempt)
    }

    fn list_dispatch_attempts(&self, case_id: i64) -> Result<Vec<DispatchAttempt>, PersistenceError> {
        audit::list_dispatch_attempts(&*self.pool.get()?, case_id)
    }

    fn pending_dispatches(&self) -> Result<Vec<ModerationCase>, PersistenceError> {
        case::pending_dispatches(&*self.pool.get()?)
    }

    fn count_cases(&self) -> Result<u64, PersistenceError> {
        case::count_cases(&*self.pool.get()?)
    }
}

/// Build the configured storage engine.
pub fn open_repository(config: &ModerationConfig) -> Result<Arc<dyn CaseRepository>, DatabaseError> {
    match config.db_backend {
        DatabaseBackend::Sqlite => {
            let path = config.database_file();
            if config.db_pool_size >= config.ingest_concurrency {
                tracing::warn!(
                    pool = config.db_pool_size,
                    ingest = config.ingest_concurrency,
                    "Connection pool is not smaller than ingest concurrency; \
                     overload will surface as busy errors instead of queueing"
                );
            }
            let pool = ConnectionPool::open(&path, config.db_pool_size, config.db_acquire_timeout)?;
            Ok(Arc::new(SqliteCaseRepository::new(pool)))
        }
        DatabaseBackend::SqliteMemory => {
            let pool = ConnectionPool::memory(config.db_acquire_timeout)?;
            Ok(Arc::new(SqliteCaseRepository::new(pool)))
        }
        DatabaseBackend::Memory => Ok(Arc::new(MemoryCaseRepository::new())),
    }
}
