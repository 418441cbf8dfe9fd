use crate::db::now_ms;
use crate::metrics::{self, MetricError, MetricRecord, ACCURACY_KEY_CANDIDATES};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("database error: {0}")]
    Db(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl From<MetricError> for SummaryError {
    fn from(err: MetricError) -> Self {
        match err {
            MetricError::Db(msg) => Self::Db(msg),
            MetricError::RunNotFound(id) => Self::RunNotFound(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryRecord {
    pub run_id: String,
    pub best_score: Option<f64>,
    pub best_epoch: Option<i64>,
    pub last_epoch: Option<i64>,
    pub last_step: i64,
    pub predicted_final_score: Option<f64>,
    pub early_stop_epoch: Option<i64>,
    pub notes: Option<String>,
    pub updated_at_ms: i64,
}

/// Derives per-run summary fields from the run's metric stream.
///
/// The summary row is shared between three writers with disjoint fields:
/// `recompute` owns the observed fields, `apply_ai_prediction` owns the
/// predicted fields, `patch_notes` owns the notes. Each writer upserts only
/// its own columns, so concurrent recompute and prediction writes never
/// clobber each other.
pub struct SummaryEngine;

impl SummaryEngine {
    /// Recomputes the observed summary fields for a run from its complete
    /// metric stream and upserts them. Safe to re-invoke at any time: the
    /// result depends only on the stream, and a later invocation supersedes
    /// an earlier one.
    pub fn recompute(
        connection: &Connection,
        run_id: &str,
    ) -> Result<RunSummaryRecord, SummaryError> {
        if !run_exists(connection, run_id)? {
            return Err(SummaryError::RunNotFound(run_id.to_string()));
        }

        let all = metrics::list_for_run(connection, run_id)?;
        if all.is_empty() {
            // A run that has started but logged nothing still gets a row.
            connection
                .execute(
                    "INSERT OR IGNORE INTO run_summary (run_id, updated_at_ms) VALUES (?1, ?2)",
                    params![run_id, now_ms()],
                )
                .map_err(|e| SummaryError::Db(e.to_string()))?;
            return Self::fetch(connection, run_id);
        }

        let last_step = all.iter().map(|m| m.step).max().unwrap_or(0);

        // `all` is already ordered by step, so the filtered series keep order.
        let epoch_series: Vec<&MetricRecord> = all
            .iter()
            .filter(|m| {
                let key = m.key.to_lowercase();
                key == "epoch" || key.ends_with("/epoch")
            })
            .collect();

        let selected_key = ACCURACY_KEY_CANDIDATES
            .iter()
            .find(|candidate| all.iter().any(|m| m.key.eq_ignore_ascii_case(candidate)));
        let accuracy_series: Vec<&MetricRecord> = match selected_key {
            Some(key) => all
                .iter()
                .filter(|m| m.key.eq_ignore_ascii_case(key))
                .collect(),
            None => Vec::new(),
        };

        // With an explicit epoch series the last epoch comes from its final
        // value; accuracy points map positionally onto epochs 1..n either way.
        let last_epoch = if let Some(last) = epoch_series.last() {
            Some(round_half_up(last.value))
        } else if accuracy_series.is_empty() {
            None
        } else {
            Some(accuracy_series.len() as i64)
        };

        let mut best_score: Option<f64> = None;
        let mut best_epoch: Option<i64> = None;
        for (index, point) in accuracy_series.iter().enumerate() {
            if !point.value.is_finite() {
                continue;
            }
            if best_score.map_or(true, |best| point.value > best) {
                best_score = Some(point.value);
                best_epoch = Some(index as i64 + 1);
            }
        }

        connection
            .execute(
                "INSERT INTO run_summary (run_id, best_score, best_epoch, last_epoch, last_step, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET
                   best_score = excluded.best_score,
                   best_epoch = excluded.best_epoch,
                   last_epoch = excluded.last_epoch,
                   last_step = excluded.last_step,
                   updated_at_ms = excluded.updated_at_ms",
                params![run_id, best_score, best_epoch, last_epoch, last_step, now_ms()],
            )
            .map_err(|e| SummaryError::Db(e.to_string()))?;

        Self::fetch(connection, run_id)
    }

    /// Reading a summary always recomputes first; there is no stale-read path.
    pub fn get(connection: &Connection, run_id: &str) -> Result<RunSummaryRecord, SummaryError> {
        Self::recompute(connection, run_id)
    }

    /// Merges externally produced predictions into the summary row. Sparse:
    /// absent fields keep their persisted value.
    pub fn apply_ai_prediction(
        connection: &Connection,
        run_id: &str,
        predicted_final_score: Option<f64>,
        early_stop_epoch: Option<i64>,
    ) -> Result<RunSummaryRecord, SummaryError> {
        if !run_exists(connection, run_id)? {
            return Err(SummaryError::RunNotFound(run_id.to_string()));
        }

        connection
            .execute(
                "INSERT INTO run_summary (run_id, predicted_final_score, early_stop_epoch, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET
                   predicted_final_score =
                     COALESCE(excluded.predicted_final_score, run_summary.predicted_final_score),
                   early_stop_epoch =
                     COALESCE(excluded.early_stop_epoch, run_summary.early_stop_epoch),
                   updated_at_ms = excluded.updated_at_ms",
                params![run_id, predicted_final_score, early_stop_epoch, now_ms()],
            )
            .map_err(|e| SummaryError::Db(e.to_string()))?;

        info!(
            run_id,
            ?predicted_final_score,
            ?early_stop_epoch,
            "applied AI prediction to run summary"
        );

        Self::fetch(connection, run_id)
    }

    /// Sets only the notes field, creating the row lazily.
    pub fn patch_notes(
        connection: &Connection,
        run_id: &str,
        notes: Option<&str>,
    ) -> Result<RunSummaryRecord, SummaryError> {
        if !run_exists(connection, run_id)? {
            return Err(SummaryError::RunNotFound(run_id.to_string()));
        }

        connection
            .execute(
                "INSERT INTO run_summary (run_id, notes, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id) DO UPDATE SET
                   notes = excluded.notes,
                   updated_at_ms = excluded.updated_at_ms",
                params![run_id, notes, now_ms()],
            )
            .map_err(|e| SummaryError::Db(e.to_string()))?;

        Self::fetch(connection, run_id)
    }

    /// The stored row as-is, without recomputing. Absent means "not yet
    /// computed".
    pub fn find(
        connection: &Connection,
        run_id: &str,
    ) -> Result<Option<RunSummaryRecord>, SummaryError> {
        connection
            .query_row(
                "SELECT run_id, best_score, best_epoch, last_epoch, last_step,
                        predicted_final_score, early_stop_epoch, notes, updated_at_ms
                 FROM run_summary WHERE run_id = ?1",
                params![run_id],
                summary_from_row,
            )
            .optional()
            .map_err(|e| SummaryError::Db(e.to_string()))
    }

    fn fetch(connection: &Connection, run_id: &str) -> Result<RunSummaryRecord, SummaryError> {
        Self::find(connection, run_id)?
            .ok_or_else(|| SummaryError::Db(format!("run summary missing after upsert: {run_id}")))
    }
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSummaryRecord> {
    Ok(RunSummaryRecord {
        run_id: row.get(0)?,
        best_score: row.get(1)?,
        best_epoch: row.get(2)?,
        last_epoch: row.get(3)?,
        last_step: row.get(4)?,
        predicted_final_score: row.get(5)?,
        early_stop_epoch: row.get(6)?,
        notes: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

fn run_exists(connection: &Connection, run_id: &str) -> Result<bool, SummaryError> {
    let found: Option<String> = connection
        .query_row("SELECT id FROM runs WHERE id = ?1", params![run_id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| SummaryError::Db(e.to_string()))?;
    Ok(found.is_some())
}

/// Half-up rounding, away from zero on .5 like the classic decimal rule.
fn round_half_up(value: f64) -> i64 {
    value.round() as i64
}
