pub mod coordinator;
pub mod dispatch;
pub mod fingerprint;
pub mod ocr;
pub mod policy;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::*;
pub use fingerprint::compute_fingerprint;
pub use policy::{PolicyEngine, PolicyRule};

use std::sync::Arc;

use crate::db::{CaseRepository, PersistenceError};

/// Run a blocking repository call on the blocking thread pool.
pub(crate) async fn with_repository<T, F>(
    repo: &Arc<dyn CaseRepository>,
    op: F,
) -> Result<T, PersistenceError>
where
    F: FnOnce(&dyn CaseRepository) -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    let repo = repo.clone();
    tokio::task::spawn_blocking(move || op(repo.as_ref()))
        .await
        .map_err(|e| PersistenceError::Unavailable(format!("repository task failed: {e}")))?
}
