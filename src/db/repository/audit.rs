use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::db::PersistenceError;
use crate::models::{AttemptOutcome, DispatchAttempt};

/// Append one webhook delivery attempt to the audit trail.
pub fn insert_dispatch_attempt(
    conn: &Connection,
    attempt: &DispatchAttempt,
) -> Result<(), PersistenceError> {
    conn.execute(
        "INSERT INTO dispatch_attempt (case_id, attempt, target, outcome, status_code, error, attempted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            attempt.case_id,
            attempt.attempt,
            attempt.target,
            attempt.outcome.as_str(),
            attempt.status_code,
            attempt.error,
            attempt.attempted_at,
        ],
    )?;
    Ok(())
}

/// All attempts for a case, oldest first.
pub fn list_dispatch_attempts(
    conn: &Connection,
    case_id: i64,
) -> Result<Vec<DispatchAttempt>, PersistenceError> {
    let mut stmt = conn.prepare(
        "SELECT case_id, attempt, target, outcome, status_code, error, attempted_at
         FROM dispatch_attempt WHERE case_id = ?1
         ORDER BY attempt, id",
    )?;

    let rows = stmt.query_map(params![case_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<u16>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, chrono::DateTime<chrono::Utc>>(6)?,
        ))
    })?;

    let mut attempts = Vec::new();
    for row in rows {
        let (case_id, attempt, target, outcome, status_code, error, attempted_at) = row?;
        attempts.push(DispatchAttempt {
            case_id,
            attempt,
            target,
            outcome: AttemptOutcome::from_str(&outcome)?,
            status_code,
            error,
            attempted_at,
        });
    }
    Ok(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::case::create_case_if_absent;
    use crate::db::sqlite::open_memory_database;
    use crate::models::*;
    use chrono::Utc;

    fn flagged_case(conn: &mut Connection) -> i64 {
        create_case_if_absent(
            conn,
            &NewCase {
                event_id: "evt-1".into(),
                channel_id: "c".into(),
                author_id: "a".into(),
                received_at: Utc::now(),
                fingerprint: ContentFingerprint::from_hex("fp"),
                verdict: Verdict::new(VerdictKind::Flagged, "r"),
            },
        )
        .unwrap()
        .case
        .case_id
    }

    #[test]
    fn attempts_listed_in_order() {
        let mut conn = open_memory_database().unwrap();
        let case_id = flagged_case(&mut conn);

        for (n, outcome, status) in [
            (1, AttemptOutcome::Failed, Some(500)),
            (2, AttemptOutcome::Failed, None),
            (3, AttemptOutcome::Delivered, Some(204)),
        ] {
            insert_dispatch_attempt(
                &conn,
                &DispatchAttempt {
                    case_id,
                    attempt: n,
                    target: "http://hooks.test/alert".into(),
                    outcome,
                    status_code: status,
                    error: (outcome == AttemptOutcome::Failed).then(|| "boom".to_string()),
                    attempted_at: Utc::now(),
                },
            )
            .unwrap();
        }

        let attempts = list_dispatch_attempts(&conn, case_id).unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].attempt, 1);
        assert_eq!(attempts[0].status_code, Some(500));
        assert_eq!(attempts[1].status_code, None);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Delivered);
        assert!(attempts[2].error.is_none());
    }

    #[test]
    fn attempt_requires_existing_case() {
        let conn = open_memory_database().unwrap();
        let result = insert_dispatch_attempt(
            &conn,
            &DispatchAttempt {
                case_id: 42,
                attempt: 1,
                target: "t".into(),
                outcome: AttemptOutcome::Failed,
                status_code: None,
                error: None,
                attempted_at: Utc::now(),
            },
        );
        assert!(result.is_err(), "foreign key should reject unknown case");
    }
}
