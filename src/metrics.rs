use crate::db::{make_id, now_ms};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Accuracy-like metric keys in preference order. Validation variants come
/// first so they win over training variants when both were logged.
pub(crate) const ACCURACY_KEY_CANDIDATES: [&str; 11] = [
    "val/acc",
    "val.acc",
    "val_acc",
    "valAccuracy",
    "accuracy",
    "acc",
    "val_accuracy",
    "train.acc",
    "train_acc",
    "trainAccuracy",
    "train/acc",
];

/// Loss-like metric keys. Unlike the accuracy scan, every matching key
/// contributes points when assembling refresh series.
pub(crate) const LOSS_KEY_CANDIDATES: [&str; 8] = [
    "train/loss",
    "train.loss",
    "train_loss",
    "loss",
    "loss_value",
    "val/loss",
    "val.loss",
    "val_loss",
];

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("database error: {0}")]
    Db(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// One ingestion entry: every key/value pair becomes a metric point at `step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBatchEntry {
    pub step: i64,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub id: String,
    pub run_id: String,
    pub key: String,
    pub step: i64,
    pub value: f64,
    pub recorded_at_ms: i64,
}

/// Appends a batch of metric points for a run. All points of one call share
/// one server-assigned timestamp and insert in a single transaction. Entries
/// with an empty metrics map are skipped. Returns the inserted row count.
pub fn append(
    connection: &mut Connection,
    run_id: &str,
    batch: &[MetricBatchEntry],
) -> Result<usize, MetricError> {
    if !run_exists(connection, run_id)? {
        return Err(MetricError::RunNotFound(run_id.to_string()));
    }

    let now = now_ms();
    let tx = connection
        .transaction()
        .map_err(|e| MetricError::Db(e.to_string()))?;

    let mut inserted = 0usize;
    for entry in batch {
        if entry.metrics.is_empty() {
            continue;
        }
        for (key, value) in &entry.metrics {
            tx.execute(
                "INSERT INTO metrics (id, run_id, key, step, value, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![make_id("metric"), run_id, key, entry.step, value, now],
            )
            .map_err(|e| MetricError::Db(e.to_string()))?;
            inserted += 1;
        }
    }

    tx.commit().map_err(|e| MetricError::Db(e.to_string()))?;
    Ok(inserted)
}

/// Every point of a run ordered by step ascending.
pub fn list_for_run(
    connection: &Connection,
    run_id: &str,
) -> Result<Vec<MetricRecord>, MetricError> {
    let mut stmt = connection
        .prepare(
            "SELECT id, run_id, key, step, value, recorded_at_ms
             FROM metrics WHERE run_id = ?1
             ORDER BY step ASC, recorded_at_ms ASC, rowid ASC",
        )
        .map_err(|e| MetricError::Db(e.to_string()))?;
    let rows = stmt
        .query_map(params![run_id], metric_from_row)
        .map_err(|e| MetricError::Db(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MetricError::Db(e.to_string()))?;
    Ok(rows)
}

/// Up to `limit` most recent points for an exact key, newest step first.
pub fn recent_for_key(
    connection: &Connection,
    run_id: &str,
    key: &str,
    limit: usize,
) -> Result<Vec<MetricRecord>, MetricError> {
    let mut stmt = connection
        .prepare(
            "SELECT id, run_id, key, step, value, recorded_at_ms
             FROM metrics WHERE run_id = ?1 AND key = ?2
             ORDER BY step DESC, recorded_at_ms DESC, rowid DESC
             LIMIT ?3",
        )
        .map_err(|e| MetricError::Db(e.to_string()))?;
    let rows = stmt
        .query_map(params![run_id, key, limit as i64], metric_from_row)
        .map_err(|e| MetricError::Db(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MetricError::Db(e.to_string()))?;
    Ok(rows)
}

/// Latest point for an exact key, by step then recording time.
pub fn last_for_key(
    connection: &Connection,
    run_id: &str,
    key: &str,
) -> Result<Option<MetricRecord>, MetricError> {
    Ok(recent_for_key(connection, run_id, key, 1)?.into_iter().next())
}

fn run_exists(connection: &Connection, run_id: &str) -> Result<bool, MetricError> {
    let found: Option<String> = connection
        .query_row("SELECT id FROM runs WHERE id = ?1", params![run_id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| MetricError::Db(e.to_string()))?;
    Ok(found.is_some())
}

fn metric_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRecord> {
    Ok(MetricRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        key: row.get(2)?,
        step: row.get(3)?,
        value: row.get(4)?,
        recorded_at_ms: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{append, last_for_key, list_for_run, recent_for_key, MetricBatchEntry, MetricError};
    use crate::db::bootstrap_schema;
    use crate::runs::{create_experiment, create_run};
    use rusqlite::Connection;
    use std::collections::HashMap;

    fn setup_run(conn: &mut Connection) -> String {
        bootstrap_schema(conn).expect("bootstrap schema");
        let exp = create_experiment(conn, "exp", None, &[]).expect("experiment");
        create_run(conn, &exp.id, None).expect("run").id
    }

    fn entry(step: i64, pairs: &[(&str, f64)]) -> MetricBatchEntry {
        MetricBatchEntry {
            step,
            metrics: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn append_rejects_unknown_run() {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        let result = append(&mut conn, "run_missing", &[entry(0, &[("loss", 1.0)])]);
        assert!(matches!(result, Err(MetricError::RunNotFound(_))));
    }

    #[test]
    fn append_inserts_one_row_per_key_and_skips_empty_entries() {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        let run_id = setup_run(&mut conn);

        let empty = MetricBatchEntry {
            step: 0,
            metrics: HashMap::new(),
        };
        let inserted = append(
            &mut conn,
            &run_id,
            &[
                entry(1, &[("val/acc", 0.7), ("train/loss", 0.9)]),
                empty,
                entry(2, &[("val/acc", 0.8)]),
            ],
        )
        .expect("append");
        assert_eq!(inserted, 3);

        let all = list_for_run(&conn, &run_id).expect("list");
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].step <= w[1].step));
    }

    #[test]
    fn recent_for_key_is_exact_match_newest_first() {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        let run_id = setup_run(&mut conn);
        append(
            &mut conn,
            &run_id,
            &[
                entry(1, &[("val/acc", 0.5)]),
                entry(2, &[("val/acc", 0.6)]),
                entry(3, &[("val/acc", 0.7), ("VAL/ACC", 0.9)]),
            ],
        )
        .expect("append");

        let recent = recent_for_key(&conn, &run_id, "val/acc", 2).expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].step, 3);
        assert_eq!(recent[0].value, 0.7);
        assert_eq!(recent[1].step, 2);

        let last = last_for_key(&conn, &run_id, "val/acc").expect("last");
        assert_eq!(last.expect("point").step, 3);
    }
}
