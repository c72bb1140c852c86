use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::db::{DatabaseError, PersistenceError};
use crate::models::*;

const CASE_COLUMNS: &str = "case_id, event_id, fingerprint, verdict, rationale, degraded,
                            created_at, dispatched_at, dispatch_status";

/// Idempotent, transactional case creation.
///
/// Uniqueness is enforced by the schema, not by a read-then-write check:
/// `event_id` is unique and content-derived verdicts are unique per
/// fingerprint. A writer that loses either race inserts nothing and reads
/// back the winning row instead.
pub fn create_case_if_absent(
    conn: &mut Connection,
    new_case: &NewCase,
) -> Result<CaseRecord, PersistenceError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(case) = find_case_by_event(&tx, &new_case.event_id)? {
        tx.commit()?;
        return Ok(CaseRecord {
            case,
            created: false,
        });
    }

    let status = if new_case.verdict.requires_dispatch() {
        DispatchStatus::Pending
    } else {
        DispatchStatus::NotRequired
    };

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO moderation_case
         (event_id, fingerprint, verdict, rationale, degraded, created_at, dispatch_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new_case.event_id,
            new_case.fingerprint.as_str(),
            new_case.verdict.kind.as_str(),
            new_case.verdict.rationale,
            new_case.verdict.degraded as i32,
            Utc::now(),
            status.as_str(),
        ],
    )?;

    let case_id = if inserted == 1 {
        tx.last_insert_rowid()
    } else {
        tx.query_row(
            "SELECT case_id FROM moderation_case
             WHERE event_id = ?1 OR (fingerprint = ?2 AND degraded = 0)
             ORDER BY case_id LIMIT 1",
            params![new_case.event_id, new_case.fingerprint.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .ok_or_else(|| {
            PersistenceError::Conflict(format!(
                "insert ignored but no case found for event {}",
                new_case.event_id
            ))
        })?
    };

    tx.execute(
        "INSERT OR IGNORE INTO case_occurrence (event_id, case_id, channel_id, author_id, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            new_case.event_id,
            case_id,
            new_case.channel_id,
            new_case.author_id,
            new_case.received_at,
        ],
    )?;

    let case = get_case(&tx, case_id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "ModerationCase".into(),
        id: case_id.to_string(),
    })?;
    tx.commit()?;

    Ok(CaseRecord {
        case,
        created: inserted == 1,
    })
}

/// Case an event resolved to, if the event was already accepted.
pub fn find_case_by_event(
    conn: &Connection,
    event_id: &str,
) -> Result<Option<ModerationCase>, PersistenceError> {
    let case_id = conn
        .query_row(
            "SELECT case_id FROM case_occurrence WHERE event_id = ?1",
            params![event_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    match case_id {
        Some(id) => get_case(conn, id),
        None => Ok(None),
    }
}

/// Content-derived verdict for a fingerprint. Degraded verdicts never answer this.
pub fn find_verdict_by_fingerprint(
    conn: &Connection,
    fingerprint: &ContentFingerprint,
) -> Result<Option<Verdict>, PersistenceError> {
    let row = conn
        .query_row(
            "SELECT verdict, rationale FROM moderation_case
             WHERE fingerprint = ?1 AND degraded = 0",
            params![fingerprint.as_str()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match row {
        Some((kind, rationale)) => Ok(Some(Verdict::new(VerdictKind::from_str(&kind)?, rationale))),
        None => Ok(None),
    }
}

pub fn get_case(conn: &Connection, case_id: i64) -> Result<Option<ModerationCase>, PersistenceError> {
    let row = conn
        .query_row(
            &format!("SELECT {CASE_COLUMNS} FROM moderation_case WHERE case_id = ?1"),
            params![case_id],
            read_case_row,
        )
        .optional()?;

    row.map(CaseRow::into_case).transpose()
}

/// Set `dispatched_at` once. Repeated calls keep the first timestamp.
pub fn mark_dispatched(conn: &Connection, case_id: i64) -> Result<(), PersistenceError> {
    let updated = conn.execute(
        "UPDATE moderation_case SET dispatched_at = ?1, dispatch_status = 'delivered'
         WHERE case_id = ?2 AND dispatched_at IS NULL",
        params![Utc::now(), case_id],
    )?;
    if updated == 0 {
        ensure_case_exists(conn, case_id)?;
    }
    Ok(())
}

/// Terminal state after dispatch retries are exhausted. The verdict stands.
pub fn mark_dispatch_failed(conn: &Connection, case_id: i64) -> Result<(), PersistenceError> {
    let updated = conn.execute(
        "UPDATE moderation_case SET dispatch_status = 'failed'
         WHERE case_id = ?1 AND dispatched_at IS NULL",
        params![case_id],
    )?;
    if updated == 0 {
        ensure_case_exists(conn, case_id)?;
    }
    Ok(())
}

/// Cases whose alert has not been delivered yet (re-enqueued at startup).
pub fn pending_dispatches(conn: &Connection) -> Result<Vec<ModerationCase>, PersistenceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CASE_COLUMNS} FROM moderation_case
         WHERE dispatch_status = 'pending' AND dispatched_at IS NULL
         ORDER BY case_id"
    ))?;
    let rows = stmt.query_map([], read_case_row)?;

    let mut cases = Vec::new();
    for row in rows {
        cases.push(row?.into_case()?);
    }
    Ok(cases)
}

pub fn count_cases(conn: &Connection) -> Result<u64, PersistenceError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM moderation_case", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn ensure_case_exists(conn: &Connection, case_id: i64) -> Result<(), PersistenceError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM moderation_case WHERE case_id = ?1",
            params![case_id],
            |_| Ok(()),
        )
        .optional()?;
    exists.ok_or_else(|| {
        PersistenceError::Database(DatabaseError::NotFound {
            entity_type: "ModerationCase".into(),
            id: case_id.to_string(),
        })
    })
}

struct CaseRow {
    case_id: i64,
    event_id: String,
    fingerprint: String,
    verdict: String,
    rationale: String,
    degraded: bool,
    created_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
    dispatch_status: String,
}

fn read_case_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseRow> {
    Ok(CaseRow {
        case_id: row.get(0)?,
        event_id: row.get(1)?,
        fingerprint: row.get(2)?,
        verdict: row.get(3)?,
        rationale: row.get(4)?,
        degraded: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
        dispatched_at: row.get(7)?,
        dispatch_status: row.get(8)?,
    })
}

impl CaseRow {
    fn into_case(self) -> Result<ModerationCase, PersistenceError> {
        Ok(ModerationCase {
            case_id: self.case_id,
            fingerprint: ContentFingerprint::from_hex(self.fingerprint),
            event_id: self.event_id,
            verdict: Verdict {
                kind: VerdictKind::from_str(&self.verdict)?,
                rationale: self.rationale,
                degraded: self.degraded,
            },
            created_at: self.created_at,
            dispatched_at: self.dispatched_at,
            dispatch_status: DispatchStatus::from_str(&self.dispatch_status)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn new_case(event_id: &str, fingerprint: &str, verdict: Verdict) -> NewCase {
        NewCase {
            event_id: event_id.into(),
            channel_id: "chan-1".into(),
            author_id: "user-1".into(),
            received_at: Utc::now(),
            fingerprint: ContentFingerprint::from_hex(fingerprint),
            verdict,
        }
    }

    #[test]
    fn creates_case_with_pending_dispatch_for_flagged() {
        let mut conn = open_memory_database().unwrap();
        let record = create_case_if_absent(
            &mut conn,
            &new_case("evt-1", "fp-a", Verdict::new(VerdictKind::Flagged, "Invite spam")),
        )
        .unwrap();

        assert!(record.created);
        assert_eq!(record.case.event_id, "evt-1");
        assert_eq!(record.case.verdict.kind, VerdictKind::Flagged);
        assert_eq!(record.case.dispatch_status, DispatchStatus::Pending);
        assert!(record.case.dispatched_at.is_none());
    }

    #[test]
    fn clean_case_needs_no_dispatch() {
        let mut conn = open_memory_database().unwrap();
        let record =
            create_case_if_absent(&mut conn, &new_case("evt-1", "fp-a", Verdict::clean())).unwrap();
        assert_eq!(record.case.dispatch_status, DispatchStatus::NotRequired);
    }

    #[test]
    fn replayed_event_returns_existing_case() {
        let mut conn = open_memory_database().unwrap();
        let first = create_case_if_absent(&mut conn, &new_case("evt-1", "fp-a", Verdict::clean())).unwrap();
        let again = create_case_if_absent(&mut conn, &new_case("evt-1", "fp-a", Verdict::clean())).unwrap();

        assert!(!again.created);
        assert_eq!(again.case.case_id, first.case.case_id);
        assert_eq!(count_cases(&conn).unwrap(), 1);
    }

    #[test]
    fn same_content_from_another_event_reads_back_winner() {
        let mut conn = open_memory_database().unwrap();
        let winner = create_case_if_absent(
            &mut conn,
            &new_case("evt-1", "fp-a", Verdict::new(VerdictKind::Escalate, "Threat")),
        )
        .unwrap();
        let loser = create_case_if_absent(
            &mut conn,
            &new_case("evt-2", "fp-a", Verdict::new(VerdictKind::Escalate, "Threat")),
        )
        .unwrap();

        assert!(!loser.created);
        assert_eq!(loser.case.case_id, winner.case.case_id);
        assert_eq!(loser.case.verdict, winner.case.verdict);
        assert_eq!(count_cases(&conn).unwrap(), 1);

        // Both events are recorded against the case
        let by_second = find_case_by_event(&conn, "evt-2").unwrap().unwrap();
        assert_eq!(by_second.case_id, winner.case.case_id);
    }

    #[test]
    fn degraded_cases_are_per_event() {
        let mut conn = open_memory_database().unwrap();
        let degraded = Verdict::degraded(VerdictKind::Clean, "OCR timed out");
        let a = create_case_if_absent(&mut conn, &new_case("evt-1", "fp-a", degraded.clone())).unwrap();
        let b = create_case_if_absent(&mut conn, &new_case("evt-2", "fp-a", degraded)).unwrap();

        assert!(a.created && b.created);
        assert_ne!(a.case.case_id, b.case.case_id);
        assert!(find_verdict_by_fingerprint(&conn, &ContentFingerprint::from_hex("fp-a"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn fingerprint_lookup_returns_content_verdict() {
        let mut conn = open_memory_database().unwrap();
        create_case_if_absent(
            &mut conn,
            &new_case("evt-1", "fp-a", Verdict::new(VerdictKind::Flagged, "Scam link")),
        )
        .unwrap();

        let verdict = find_verdict_by_fingerprint(&conn, &ContentFingerprint::from_hex("fp-a"))
            .unwrap()
            .unwrap();
        assert_eq!(verdict.kind, VerdictKind::Flagged);
        assert_eq!(verdict.rationale, "Scam link");
        assert!(!verdict.degraded);
    }

    #[test]
    fn mark_dispatched_sets_timestamp_once() {
        let mut conn = open_memory_database().unwrap();
        let record = create_case_if_absent(
            &mut conn,
            &new_case("evt-1", "fp-a", Verdict::new(VerdictKind::Flagged, "r")),
        )
        .unwrap();
        let id = record.case.case_id;

        mark_dispatched(&conn, id).unwrap();
        let first = get_case(&conn, id).unwrap().unwrap();
        assert!(first.dispatched_at.is_some());
        assert_eq!(first.dispatch_status, DispatchStatus::Delivered);

        mark_dispatched(&conn, id).unwrap();
        let second = get_case(&conn, id).unwrap().unwrap();
        assert_eq!(first.dispatched_at, second.dispatched_at);
    }

    #[test]
    fn mark_dispatched_unknown_case_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = mark_dispatched(&conn, 999).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn failed_dispatch_leaves_dispatched_at_null() {
        let mut conn = open_memory_database().unwrap();
        let record = create_case_if_absent(
            &mut conn,
            &new_case("evt-1", "fp-a", Verdict::new(VerdictKind::Escalate, "r")),
        )
        .unwrap();

        mark_dispatch_failed(&conn, record.case.case_id).unwrap();
        let case = get_case(&conn, record.case.case_id).unwrap().unwrap();
        assert_eq!(case.dispatch_status, DispatchStatus::Failed);
        assert!(case.dispatched_at.is_none());
        assert!(pending_dispatches(&conn).unwrap().is_empty());
    }

    #[test]
    fn pending_dispatches_lists_undelivered_alerts() {
        let mut conn = open_memory_database().unwrap();
        create_case_if_absent(&mut conn, &new_case("evt-1", "fp-a", Verdict::clean())).unwrap();
        let flagged = create_case_if_absent(
            &mut conn,
            &new_case("evt-2", "fp-b", Verdict::new(VerdictKind::Flagged, "r")),
        )
        .unwrap();
        let delivered = create_case_if_absent(
            &mut conn,
            &new_case("evt-3", "fp-c", Verdict::new(VerdictKind::Escalate, "r")),
        )
        .unwrap();
        mark_dispatched(&conn, delivered.case.case_id).unwrap();

        let pending = pending_dispatches(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].case_id, flagged.case.case_id);
    }
}
