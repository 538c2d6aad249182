//! Chunking of a backfill window.
//!
//! A plan's `[from, to)` window is sliced into contiguous, non-overlapping
//! chunks; each chunk is the unit of execution, retry, and checkpointing.

use crate::state::ChunkStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One contiguous sub-window of a backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillChunk {
    /// Position of the chunk in plan order.
    pub id: u32,
    /// Window start, inclusive.
    pub from: DateTime<Utc>,
    /// Window end, exclusive.
    pub to: DateTime<Utc>,
    /// Current status.
    pub status: ChunkStatus,
    /// Execution attempts so far (counting the successful one).
    pub attempts: u32,
    /// Deterministic token bound to this chunk. Never regenerated; derived
    /// from the plan id and the chunk boundaries.
    pub idempotency_token: String,
    /// Caller-supplied statement template, parameterized by the chunk window
    /// and its token.
    pub sql_template: String,
    /// Last execution error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BackfillChunk {
    /// Render the SQL statement for this chunk.
    ///
    /// Recognized placeholders: `{from}`, `{to}` (RFC 3339), `{token}`,
    /// `{time_column}`, `{target}`.
    pub fn render_statement(&self, target: &str, time_column: &str) -> String {
        self.sql_template
            .replace("{from}", &self.from.to_rfc3339())
            .replace("{to}", &self.to.to_rfc3339())
            .replace("{token}", &self.idempotency_token)
            .replace("{time_column}", time_column)
            .replace("{target}", target)
    }
}

/// Compute the idempotency token for a chunk.
///
/// A pure function of `(plan_id, from, to)`: re-planning the same window
/// reproduces the same tokens, and two chunks of one plan can never collide
/// because their boundaries differ.
pub fn idempotency_token(plan_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_id.as_bytes());
    hasher.update(b"|");
    hasher.update(from.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(to.to_rfc3339().as_bytes());
    hex::encode(&hasher.finalize()[..12])
}

/// Slice `[from, to)` into consecutive chunks of `chunk_hours`, the final
/// chunk truncated to `to`.
pub fn slice_window(
    plan_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    chunk_hours: u32,
    sql_template: &str,
) -> Vec<BackfillChunk> {
    let step = Duration::hours(i64::from(chunk_hours));
    let mut chunks = Vec::new();
    let mut cursor = from;
    let mut id = 0u32;

    while cursor < to {
        let end = (cursor + step).min(to);
        chunks.push(BackfillChunk {
            id,
            from: cursor,
            to: end,
            status: ChunkStatus::Pending,
            attempts: 0,
            idempotency_token: idempotency_token(plan_id, cursor, end),
            sql_template: sql_template.to_string(),
            last_error: None,
        });
        cursor = end;
        id += 1;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_chunks_are_contiguous_and_cover_the_window() {
        let from = ts("2024-01-01T00:00:00Z");
        let to = ts("2024-01-04T07:30:00Z");
        let chunks = slice_window("p1", from, to, 24, "INSERT ...");

        assert_eq!(chunks[0].from, from);
        assert_eq!(chunks.last().unwrap().to, to);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
            assert!(pair[0].from < pair[0].to);
        }
        // Final chunk truncated to the window end.
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].from, ts("2024-01-04T00:00:00Z"));
        assert_eq!(chunks[3].to, to);
    }

    #[test]
    fn test_worked_example_two_chunks() {
        let from = ts("2024-01-01T00:00:00Z");
        let to = ts("2024-01-03T00:00:00Z");
        let chunks = slice_window("p1", from, to, 24, "INSERT ...");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].from, ts("2024-01-01T00:00:00Z"));
        assert_eq!(chunks[0].to, ts("2024-01-02T00:00:00Z"));
        assert_eq!(chunks[1].from, ts("2024-01-02T00:00:00Z"));
        assert_eq!(chunks[1].to, ts("2024-01-03T00:00:00Z"));
    }

    #[test]
    fn test_tokens_are_deterministic() {
        let from = ts("2024-01-01T00:00:00Z");
        let to = ts("2024-01-03T00:00:00Z");
        let a = slice_window("p1", from, to, 24, "x");
        let b = slice_window("p1", from, to, 24, "x");

        for (ca, cb) in a.iter().zip(&b) {
            assert_eq!(ca.idempotency_token, cb.idempotency_token);
        }
    }

    #[test]
    fn test_tokens_are_unique_per_chunk_and_plan() {
        let from = ts("2024-01-01T00:00:00Z");
        let to = ts("2024-01-03T00:00:00Z");
        let chunks = slice_window("p1", from, to, 24, "x");
        assert_ne!(chunks[0].idempotency_token, chunks[1].idempotency_token);

        let other_plan = slice_window("p2", from, to, 24, "x");
        assert_ne!(
            chunks[0].idempotency_token,
            other_plan[0].idempotency_token
        );
    }

    #[test]
    fn test_render_statement() {
        let from = ts("2024-01-01T00:00:00Z");
        let to = ts("2024-01-02T00:00:00Z");
        let chunks = slice_window(
            "p1",
            from,
            to,
            24,
            "INSERT INTO {target} SELECT * FROM src \
             WHERE {time_column} >= '{from}' AND {time_column} < '{to}' \
             SETTINGS insert_deduplication_token = '{token}'",
        );

        let stmt = chunks[0].render_statement("events_v2", "event_time");
        assert!(stmt.contains("INSERT INTO events_v2"));
        assert!(stmt.contains("event_time >= '2024-01-01T00:00:00+00:00'"));
        assert!(stmt.contains(&chunks[0].idempotency_token));
        assert!(!stmt.contains('{'));
    }
}
