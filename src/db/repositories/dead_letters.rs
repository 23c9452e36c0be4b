use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::db::{
    helpers::{format_datetime, parse_datetime, parse_key, parse_kind, to_u32},
    models::DeadLetter,
    Database,
};
use crate::models::Record;

struct DeadLetterRow {
    id: i64,
    idempotency_key: String,
    kind: String,
    device_id: String,
    captured_at: String,
    payload: String,
    reason: String,
    attempts: i64,
    failed_at: String,
}

impl DeadLetterRow {
    fn into_dead_letter(self) -> Result<DeadLetter> {
        let record: Record = serde_json::from_str(&self.payload)
            .with_context(|| format!("corrupt dead-letter payload for row {}", self.id))?;
        Ok(DeadLetter {
            id: Some(self.id),
            idempotency_key: parse_key(&self.idempotency_key)?,
            kind: parse_kind(&self.kind)?,
            device_id: self.device_id,
            captured_at: parse_datetime(&self.captured_at, "captured_at")?,
            record,
            reason: self.reason,
            attempts: to_u32(self.attempts, "attempts")?,
            failed_at: parse_datetime(&self.failed_at, "failed_at")?,
        })
    }
}

pub(crate) fn insert_dead_letter_row(conn: &Connection, letter: &DeadLetter) -> Result<i64> {
    let payload =
        serde_json::to_string(&letter.record).context("failed to serialize dead-letter payload")?;
    conn.execute(
        "INSERT INTO dead_letters (
            idempotency_key,
            kind,
            device_id,
            captured_at,
            payload,
            reason,
            attempts,
            failed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            letter.idempotency_key.to_string(),
            letter.kind.as_str(),
            letter.device_id,
            format_datetime(letter.captured_at),
            payload,
            letter.reason,
            i64::from(letter.attempts),
            format_datetime(letter.failed_at),
        ],
    )
    .context("failed to insert dead letter")?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<i64> {
        let letter = letter.clone();
        self.execute(move |conn| insert_dead_letter_row(conn, &letter))
            .await
    }

    /// Most recent entries first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT
                        id,
                        idempotency_key,
                        kind,
                        device_id,
                        captured_at,
                        payload,
                        reason,
                        attempts,
                        failed_at
                    FROM dead_letters
                    ORDER BY id DESC
                    LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| {
                        Ok(DeadLetterRow {
                            id: row.get(0)?,
                            idempotency_key: row.get(1)?,
                            kind: row.get(2)?,
                            device_id: row.get(3)?,
                            captured_at: row.get(4)?,
                            payload: row.get(5)?,
                            reason: row.get(6)?,
                            attempts: row.get(7)?,
                            failed_at: row.get(8)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(DeadLetterRow::into_dead_letter).collect()
    }

    pub async fn count_dead_letters(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}
