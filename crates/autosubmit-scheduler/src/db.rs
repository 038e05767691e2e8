use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) with the two range-scan indexes the
/// workers poll through, plus triggers guarding the columns that must never
/// move backwards.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            owner          TEXT    NOT NULL,
            target         TEXT    NOT NULL,
            not_before     TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            status         TEXT    NOT NULL DEFAULT 'pending'
                           CHECK (status IN ('pending', 'claimed', 'completed', 'failed')),
            claim_token    TEXT,
            claim_deadline TEXT,
            attempt_count  INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
            last_error     TEXT,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL,
            CHECK (CASE WHEN status = 'claimed'
                        THEN claim_token IS NOT NULL AND claim_deadline IS NOT NULL
                        ELSE claim_token IS NULL AND claim_deadline IS NULL
                   END)
        ) STRICT;

        -- Claim polling: WHERE status = 'pending' AND not_before <= ? ORDER BY not_before
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, not_before);
        -- Reconciler: WHERE status = 'claimed' AND claim_deadline < ?
        CREATE INDEX IF NOT EXISTS idx_jobs_claims ON jobs (status, claim_deadline);
        CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs (owner, created_at);

        CREATE TRIGGER IF NOT EXISTS jobs_identity_immutable
        BEFORE UPDATE OF owner, target ON jobs
        BEGIN
            SELECT RAISE(ABORT, 'job owner and target are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS jobs_attempts_monotonic
        BEFORE UPDATE OF attempt_count ON jobs
        WHEN NEW.attempt_count < OLD.attempt_count
        BEGIN
            SELECT RAISE(ABORT, 'attempt_count cannot decrease');
        END;

        CREATE TRIGGER IF NOT EXISTS jobs_terminal_frozen
        BEFORE UPDATE ON jobs
        WHEN OLD.status IN ('completed', 'failed')
        BEGIN
            SELECT RAISE(ABORT, 'job is in a terminal state');
        END;
        ",
    )?;
    Ok(())
}

/// Encode a timestamp for storage.
///
/// Millisecond precision and a literal `Z` keep every value the same width,
/// so SQLite's text ordering matches chronological ordering.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a timestamp written by [`fmt_ts`].
pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Whether `ts` fits the fixed-width encoding: a four-digit year with no sign.
///
/// Anything outside 0000-9999 would be written as `+10000-...` or `-0001-...`
/// and sort before every real timestamp.
pub fn is_storable(ts: DateTime<Utc>) -> bool {
    (0..=9999).contains(&ts.year())
}

/// `ts + delta`, or `None` if the sum overflows or cannot be stored.
pub fn checked_offset(ts: DateTime<Utc>, delta: chrono::Duration) -> Option<DateTime<Utc>> {
    ts.checked_add_signed(delta).filter(|t| is_storable(*t))
}

/// Whole seconds as a chrono delta, or `None` past chrono's range.
pub fn secs_delta(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

/// Round-trip `ts` through the storage encoding, dropping sub-millisecond precision.
pub fn truncate_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    parse_ts(&fmt_ts(ts)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(fmt_ts(early).len(), fmt_ts(late).len());
        assert_eq!(fmt_ts(late), "2026-01-10T00:00:00.000Z");
    }

    #[test]
    fn truncate_drops_sub_millisecond_precision() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_ts(ts);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(parse_ts(&fmt_ts(truncated)).unwrap(), truncated);
    }

    #[test]
    fn only_four_digit_years_are_storable() {
        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let beyond = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(-1, 1, 1, 0, 0, 0).unwrap();
        assert!(is_storable(last));
        assert!(!is_storable(beyond));
        assert!(!is_storable(before));
        assert_eq!(fmt_ts(last).len(), fmt_ts(Utc::now()).len());

        assert!(checked_offset(last, chrono::Duration::seconds(1)).is_none());
        assert!(checked_offset(Utc::now(), chrono::Duration::seconds(60)).is_some());
        assert!(secs_delta(u64::MAX).is_none());
        assert!(secs_delta(10_000_000_000_000_000).is_none());
        assert_eq!(secs_delta(90), Some(chrono::Duration::seconds(90)));
    }

    #[test]
    fn due_query_uses_index() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let plan: String = conn
            .query_row(
                "EXPLAIN QUERY PLAN
                 SELECT id FROM jobs WHERE status = 'pending' AND not_before <= ?1
                 ORDER BY not_before",
                ["2026-01-01T00:00:00.000Z"],
                |row| row.get(3),
            )
            .unwrap();
        assert!(plan.contains("idx_jobs_due"), "unexpected plan: {plan}");
    }

    #[test]
    fn claimed_row_without_token_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO jobs (id, owner, target, not_before, status, created_at, updated_at)
             VALUES ('j1', 'o1', 't', '2026-01-01T00:00:00.000Z', 'claimed',
                     '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
            [],
        );
        assert!(err.is_err());
    }
}
