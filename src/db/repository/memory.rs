use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::CaseRepository;
use crate::db::{DatabaseError, PersistenceError};
use crate::models::*;

/// Process-local engine. Same contract as SQLite, nothing survives a restart.
pub struct MemoryCaseRepository {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    cases: BTreeMap<i64, ModerationCase>,
    /// Content-derived cases only; degraded cases are never keyed by fingerprint.
    by_fingerprint: HashMap<ContentFingerprint, i64>,
    /// event_id -> case_id for every accepted event.
    occurrences: HashMap<String, i64>,
    attempts: Vec<DispatchAttempt>,
}

impl MemoryCaseRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory store lock poisoned".into()))
    }
}

impl Default for MemoryCaseRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(case_id: i64) -> PersistenceError {
    PersistenceError::Database(DatabaseError::NotFound {
        entity_type: "ModerationCase".into(),
        id: case_id.to_string(),
    })
}

impl CaseRepository for MemoryCaseRepository {
    fn create_case_if_absent(&self, new_case: &NewCase) -> Result<CaseRecord, PersistenceError> {
        let mut state = self.lock()?;

        if let Some(case) = state
            .occurrences
            .get(&new_case.event_id)
            .and_then(|id| state.cases.get(id))
        {
            return Ok(CaseRecord {
                case: case.clone(),
                created: false,
            });
        }

        if !new_case.verdict.degraded {
            if let Some(&case_id) = state.by_fingerprint.get(&new_case.fingerprint) {
                state.occurrences.insert(new_case.event_id.clone(), case_id);
                let case = state.cases.get(&case_id).cloned().ok_or_else(|| not_found(case_id))?;
                return Ok(CaseRecord {
                    case,
                    created: false,
                });
            }
        }

        state.next_id += 1;
        let case_id = state.next_id;
        let case = ModerationCase {
            case_id,
            fingerprint: new_case.fingerprint.clone(),
            event_id: new_case.event_id.clone(),
            verdict: new_case.verdict.clone(),
            created_at: Utc::now(),
            dispatched_at: None,
            dispatch_status: if new_case.verdict.requires_dispatch() {
                DispatchStatus::Pending
            } else {
                DispatchStatus::NotRequired
            },
        };

        state.cases.insert(case_id, case.clone());
        state.occurrences.insert(new_case.event_id.clone(), case_id);
        if !new_case.verdict.degraded {
            state.by_fingerprint.insert(new_case.fingerprint.clone(), case_id);
        }

        Ok(CaseRecord {
            case,
            created: true,
        })
    }

    fn mark_dispatched(&self, case_id: i64) -> Result<(), PersistenceError> {
        let mut state = self.lock()?;
        let case = state.cases.get_mut(&case_id).ok_or_else(|| not_found(case_id))?;
        if case.dispatched_at.is_none() {
            case.dispatched_at = Some(Utc::now());
            case.dispatch_status = DispatchStatus::Delivered;
        }
        Ok(())
    }

    fn mark_dispatch_failed(&self, case_id: i64) -> Result<(), PersistenceError> {
        let mut state = self.lock()?;
        let case = state.cases.get_mut(&case_id).ok_or_else(|| not_found(case_id))?;
        if case.dispatched_at.is_none() {
            case.dispatch_status = DispatchStatus::Failed;
        }
        Ok(())
    }

    fn find_case_by_event(&self, event_id: &str) -> Result<Option<ModerationCase>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .occurrences
            .get(event_id)
            .and_then(|id| state.cases.get(id))
            .cloned())
    }

    fn find_verdict_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<Verdict>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| state.cases.get(id))
            .map(|case| case.verdict.clone()))
    }

    fn get_case(&self, case_id: i64) -> Result<Option<ModerationCase>, PersistenceError> {
        Ok(self.lock()?.cases.get(&case_id).cloned())
    }

    fn record_dispatch_attempt(&self, attempt: &DispatchAttempt) -> Result<(), PersistenceError> {
        let mut state = self.lock()?;
        if !state.cases.contains_key(&attempt.case_id) {
            return Err(PersistenceError::Conflict(format!(
                "dispatch attempt references unknown case {}",
                attempt.case_id
            )));
        }
        state.attempts.push(attempt.clone());
        Ok(())
    }

    fn list_dispatch_attempts(&self, case_id: i64) -> Result<Vec<DispatchAttempt>, PersistenceError> {
        let state = self.lock()?;
        let mut attempts: Vec<DispatchAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt);
        Ok(attempts)
    }

    fn pending_dispatches(&self) -> Result<Vec<ModerationCase>, PersistenceError> {
        Ok(self
            .lock()?
            .cases
            .values()
            .filter(|c| c.dispatch_status == DispatchStatus::Pending && c.dispatched_at.is_none())
            .cloned()
            .collect())
    }

    fn count_cases(&self) -> Result<u64, PersistenceError> {
        Ok(self.lock()?.cases.len() as u64)
    }
}
