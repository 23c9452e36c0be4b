use anyhow::{Context, Result};
use chrono::Utc;
use log::warn;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{
    helpers::{format_datetime, to_u32},
    models::{DeadLetter, SpilledRecord},
    Database,
};
use crate::models::Record;

use super::dead_letters::insert_dead_letter_row;

impl Database {
    /// Mirror a queued record to disk. A key that is already spilled is left alone.
    pub async fn spill_record(&self, record: &Record, attempts: u32) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            let payload =
                serde_json::to_string(&record).context("failed to serialize queued record")?;
            conn.execute(
                "INSERT OR IGNORE INTO retry_queue (idempotency_key, kind, payload, attempts, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.idempotency_key().to_string(),
                    record.kind().as_str(),
                    payload,
                    i64::from(attempts),
                    format_datetime(Utc::now()),
                ],
            )
            .context("failed to spill queued record")?;
            Ok(())
        })
        .await
    }

    pub async fn update_spilled_attempts(&self, key: Uuid, attempts: u32) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE retry_queue SET attempts = ?1 WHERE idempotency_key = ?2",
                params![i64::from(attempts), key.to_string()],
            )
            .context("failed to update spilled attempts")?;
            Ok(())
        })
        .await
    }

    pub async fn remove_spilled(&self, key: Uuid) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM retry_queue WHERE idempotency_key = ?1",
                params![key.to_string()],
            )
            .context("failed to remove spilled record")?;
            Ok(())
        })
        .await
    }

    /// Move a spilled record into the dead-letter log in one transaction.
    pub async fn dead_letter_spilled(&self, letter: &DeadLetter) -> Result<i64> {
        let letter = letter.clone();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open dead-letter transaction")?;
            tx.execute(
                "DELETE FROM retry_queue WHERE idempotency_key = ?1",
                params![letter.idempotency_key.to_string()],
            )
            .context("failed to remove spilled record")?;
            let id = insert_dead_letter_row(&tx, &letter)?;
            tx.commit().context("failed to commit dead-letter transaction")?;
            Ok(id)
        })
        .await
    }

    /// Everything still queued, oldest first. Rows whose payload no longer
    /// decodes into a valid record are moved to `spill_rejects` and skipped.
    pub async fn load_spilled(&self) -> Result<Vec<SpilledRecord>> {
        let rows = self
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT idempotency_key, kind, payload, attempts
                     FROM retry_queue ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SpillRow {
                            idempotency_key: row.get(0)?,
                            kind: row.get(1)?,
                            payload: row.get(2)?,
                            attempts: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut restored = Vec::with_capacity(rows.len());
        let mut rejected = Vec::new();
        for row in rows {
            let decoded = serde_json::from_str::<Record>(&row.payload)
                .map_err(anyhow::Error::from)
                .and_then(|record| Ok((record, to_u32(row.attempts, "attempts")?)));
            match decoded {
                Ok((record, attempts)) => restored.push(SpilledRecord { record, attempts }),
                Err(err) => {
                    warn!(
                        "Spilled record {} is invalid, moving it to spill_rejects: {err:#}",
                        row.idempotency_key
                    );
                    rejected.push((row, format!("{err:#}")));
                }
            }
        }

        if !rejected.is_empty() {
            self.execute(move |conn| {
                let tx = conn
                    .transaction()
                    .context("failed to open spill reject transaction")?;
                let now = format_datetime(Utc::now());
                for (row, reason) in &rejected {
                    tx.execute(
                        "INSERT INTO spill_rejects
                            (idempotency_key, kind, payload, attempts, reason, rejected_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![row.idempotency_key, row.kind, row.payload, row.attempts, reason, now],
                    )
                    .context("failed to record spill reject")?;
                    tx.execute(
                        "DELETE FROM retry_queue WHERE idempotency_key = ?1",
                        params![row.idempotency_key],
                    )
                    .context("failed to remove rejected spill row")?;
                }
                tx.commit().context("failed to commit spill rejects")?;
                Ok(())
            })
            .await?;
        }

        Ok(restored)
    }

    pub async fn count_spill_rejects(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM spill_rejects", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}

struct SpillRow {
    idempotency_key: String,
    kind: String,
    payload: String,
    attempts: i64,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::db::{models::DeadLetter, Database};
    use crate::models::{Classification, Reading, Record, RecordKind};

    fn record(offset_secs: i64) -> Record {
        let at = Utc::now() + Duration::seconds(offset_secs);
        let reading = Reading::new("raspi-01", at, 25.0, 7.0, 350.0).unwrap();
        Classification::new(reading, "normal", 1.0, "knn-reference-1", at)
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn spilled_records_restore_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();

        let first = record(0);
        let second = record(1);
        db.spill_record(&first, 0).await.unwrap();
        db.spill_record(&second, 0).await.unwrap();
        db.spill_record(&first, 0).await.unwrap();
        db.update_spilled_attempts(second.idempotency_key(), 3)
            .await
            .unwrap();

        let restored = db.load_spilled().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].record, first);
        assert_eq!(restored[1].record, second);
        assert_eq!(restored[1].attempts, 3);

        db.remove_spilled(first.idempotency_key()).await.unwrap();
        assert_eq!(db.load_spilled().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_spilled_rows_are_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();

        let good = record(0);
        let bad = record(1);
        db.spill_record(&bad, 2).await.unwrap();
        db.spill_record(&good, 0).await.unwrap();

        let mut payload = serde_json::to_value(&bad).unwrap();
        payload["record"]["confidence"] = serde_json::json!(1.5);
        let key = bad.idempotency_key().to_string();
        db.execute(move |conn| {
            conn.execute(
                "UPDATE retry_queue SET payload = ?1 WHERE idempotency_key = ?2",
                rusqlite::params![payload.to_string(), key],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let restored = db.load_spilled().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].record, good);
        assert_eq!(db.count_spill_rejects().await.unwrap(), 1);
        assert_eq!(db.load_spilled().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_lettering_a_spilled_record_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();

        let rec = record(0);
        db.spill_record(&rec, 4).await.unwrap();
        db.dead_letter_spilled(&DeadLetter::new(rec.clone(), "retries exhausted", 4))
            .await
            .unwrap();

        assert!(db.load_spilled().await.unwrap().is_empty());
        let letters = db.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, RecordKind::SensorReading);
        assert_eq!(letters[0].record, rec);
        assert_eq!(letters[0].attempts, 4);
        assert_eq!(letters[0].idempotency_key, rec.idempotency_key());
    }

    #[tokio::test]
    async fn dead_letter_with_invalid_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();

        let rec = record(0);
        db.insert_dead_letter(&DeadLetter::new(rec.clone(), "retries exhausted", 5))
            .await
            .unwrap();
        let mut payload = serde_json::to_value(&rec).unwrap();
        payload["record"]["reading"]["device_id"] = serde_json::json!("");
        db.execute(move |conn| {
            conn.execute(
                "UPDATE dead_letters SET payload = ?1",
                rusqlite::params![payload.to_string()],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let err = db.list_dead_letters(10).await.unwrap_err();
        assert!(format!("{err:#}").contains("corrupt dead-letter payload"));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let rec = record(0);
        {
            let db = Database::open(path.clone()).unwrap();
            db.insert_dead_letter(&DeadLetter::new(rec.clone(), "schema violation", 1))
                .await
                .unwrap();
        }

        let db = Database::open(path).unwrap();
        assert_eq!(db.count_dead_letters().await.unwrap(), 1);
    }
}
