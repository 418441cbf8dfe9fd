use crate::db::{make_id, now_ms};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("database error: {0}")]
    Db(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("invalid run status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl FromStr for RunStatus {
    type Err = RunStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(RunStoreError::InvalidStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
    pub purpose: Option<String>,
    pub tags: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub seed: Option<i64>,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub elapsed_ms: Option<i64>,
    pub notes: Option<String>,
    pub created_at_ms: i64,
}

pub fn create_experiment(
    connection: &Connection,
    name: &str,
    purpose: Option<&str>,
    tags: &[String],
) -> Result<ExperimentRecord, RunStoreError> {
    let id = make_id("exp");
    let now = now_ms();
    let tags_json =
        serde_json::to_string(tags).map_err(|e| RunStoreError::Serde(e.to_string()))?;

    connection
        .execute(
            "INSERT INTO experiments (id, name, purpose, tags_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, purpose, tags_json, now],
        )
        .map_err(|e| RunStoreError::Db(e.to_string()))?;

    Ok(ExperimentRecord {
        id,
        name: name.to_string(),
        purpose: purpose.map(|p| p.to_string()),
        tags: tags.to_vec(),
        created_at_ms: now,
    })
}

pub fn get_experiment(
    connection: &Connection,
    experiment_id: &str,
) -> Result<ExperimentRecord, RunStoreError> {
    let row = connection
        .query_row(
            "SELECT id, name, purpose, tags_json, created_at_ms
             FROM experiments WHERE id = ?1",
            params![experiment_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| RunStoreError::Db(e.to_string()))?
        .ok_or_else(|| RunStoreError::ExperimentNotFound(experiment_id.to_string()))?;

    let tags: Vec<String> =
        serde_json::from_str(&row.3).map_err(|e| RunStoreError::Serde(e.to_string()))?;
    Ok(ExperimentRecord {
        id: row.0,
        name: row.1,
        purpose: row.2,
        tags,
        created_at_ms: row.4,
    })
}

pub fn experiment_exists(
    connection: &Connection,
    experiment_id: &str,
) -> Result<bool, RunStoreError> {
    let found: Option<String> = connection
        .query_row(
            "SELECT id FROM experiments WHERE id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    Ok(found.is_some())
}

pub fn create_run(
    connection: &Connection,
    experiment_id: &str,
    seed: Option<i64>,
) -> Result<RunRecord, RunStoreError> {
    if !experiment_exists(connection, experiment_id)? {
        return Err(RunStoreError::ExperimentNotFound(experiment_id.to_string()));
    }

    let id = make_id("run");
    let now = now_ms();
    connection
        .execute(
            "INSERT INTO runs (id, experiment_id, status, seed, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, experiment_id, RunStatus::Pending.as_str(), seed, now],
        )
        .map_err(|e| RunStoreError::Db(e.to_string()))?;

    Ok(RunRecord {
        id,
        experiment_id: experiment_id.to_string(),
        status: RunStatus::Pending,
        seed,
        started_at_ms: None,
        finished_at_ms: None,
        elapsed_ms: None,
        notes: None,
        created_at_ms: now,
    })
}

pub fn get_run(connection: &Connection, run_id: &str) -> Result<RunRecord, RunStoreError> {
    map_run_row(connection, run_id)?
        .ok_or_else(|| RunStoreError::RunNotFound(run_id.to_string()))
}

pub fn run_exists(connection: &Connection, run_id: &str) -> Result<bool, RunStoreError> {
    let found: Option<String> = connection
        .query_row("SELECT id FROM runs WHERE id = ?1", params![run_id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    Ok(found.is_some())
}

pub fn list_for_experiment(
    connection: &Connection,
    experiment_id: &str,
) -> Result<Vec<RunRecord>, RunStoreError> {
    let mut stmt = connection
        .prepare(
            "SELECT id, experiment_id, status, seed, started_at_ms, finished_at_ms,
                    elapsed_ms, notes, created_at_ms
             FROM runs WHERE experiment_id = ?1
             ORDER BY created_at_ms ASC, rowid ASC",
        )
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    let rows = stmt
        .query_map(params![experiment_id], run_from_row)
        .map_err(|e| RunStoreError::Db(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RunStoreError::Db(e.to_string()))?;

    rows.into_iter().map(finish_run_row).collect()
}

/// Marks a pending run as running and stamps its start time.
pub fn start_run(connection: &Connection, run_id: &str) -> Result<RunRecord, RunStoreError> {
    let now = now_ms();
    let changed = connection
        .execute(
            "UPDATE runs SET status = ?1, started_at_ms = ?2 WHERE id = ?3",
            params![RunStatus::Running.as_str(), now, run_id],
        )
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    if changed == 0 {
        return Err(RunStoreError::RunNotFound(run_id.to_string()));
    }
    get_run(connection, run_id)
}

/// Moves a run into a terminal state, stamping finish time and elapsed
/// duration when a start time was recorded.
pub fn finish_run(
    connection: &Connection,
    run_id: &str,
    status: RunStatus,
) -> Result<RunRecord, RunStoreError> {
    if !status.is_terminal() {
        return Err(RunStoreError::InvalidStatus(status.as_str().to_string()));
    }
    let existing = get_run(connection, run_id)?;
    let now = now_ms();
    let elapsed = existing.started_at_ms.map(|started| (now - started).max(0));
    connection
        .execute(
            "UPDATE runs SET status = ?1, finished_at_ms = ?2, elapsed_ms = ?3 WHERE id = ?4",
            params![status.as_str(), now, elapsed, run_id],
        )
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    get_run(connection, run_id)
}

type RawRunRow = (
    String,
    String,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    i64,
);

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_run_row(raw: RawRunRow) -> Result<RunRecord, RunStoreError> {
    Ok(RunRecord {
        id: raw.0,
        experiment_id: raw.1,
        status: raw.2.parse()?,
        seed: raw.3,
        started_at_ms: raw.4,
        finished_at_ms: raw.5,
        elapsed_ms: raw.6,
        notes: raw.7,
        created_at_ms: raw.8,
    })
}

fn map_run_row(
    connection: &Connection,
    run_id: &str,
) -> Result<Option<RunRecord>, RunStoreError> {
    let raw = connection
        .query_row(
            "SELECT id, experiment_id, status, seed, started_at_ms, finished_at_ms,
                    elapsed_ms, notes, created_at_ms
             FROM runs WHERE id = ?1",
            params![run_id],
            run_from_row,
        )
        .optional()
        .map_err(|e| RunStoreError::Db(e.to_string()))?;
    raw.map(finish_run_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::{
        create_experiment, create_run, finish_run, get_run, list_for_experiment, run_exists,
        start_run, RunStatus, RunStoreError,
    };
    use crate::db::bootstrap_schema;
    use rusqlite::Connection;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    #[test]
    fn create_run_requires_existing_experiment() {
        let conn = setup_conn();
        let result = create_run(&conn, "exp_missing", None);
        assert!(matches!(
            result,
            Err(RunStoreError::ExperimentNotFound(_))
        ));
    }

    #[test]
    fn run_lifecycle_stamps_start_finish_and_elapsed() {
        let conn = setup_conn();
        let exp = create_experiment(&conn, "cifar10 sweep", None, &[]).expect("experiment");
        let run = create_run(&conn, &exp.id, Some(42)).expect("run");
        assert_eq!(run.status, RunStatus::Pending);

        let started = start_run(&conn, &run.id).expect("start");
        assert_eq!(started.status, RunStatus::Running);
        assert!(started.started_at_ms.is_some());

        let finished = finish_run(&conn, &run.id, RunStatus::Succeeded).expect("finish");
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert!(finished.finished_at_ms.is_some());
        assert!(finished.elapsed_ms.expect("elapsed") >= 0);
    }

    #[test]
    fn finish_rejects_non_terminal_status() {
        let conn = setup_conn();
        let exp = create_experiment(&conn, "exp", None, &[]).expect("experiment");
        let run = create_run(&conn, &exp.id, None).expect("run");
        let result = finish_run(&conn, &run.id, RunStatus::Running);
        assert!(matches!(result, Err(RunStoreError::InvalidStatus(_))));
    }

    #[test]
    fn listing_returns_runs_in_creation_order() {
        let conn = setup_conn();
        let exp = create_experiment(&conn, "exp", Some("ordering"), &["tag".to_string()])
            .expect("experiment");
        let first = create_run(&conn, &exp.id, None).expect("first");
        let second = create_run(&conn, &exp.id, None).expect("second");

        let runs = list_for_experiment(&conn, &exp.id).expect("list");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, first.id);
        assert_eq!(runs[1].id, second.id);

        assert!(run_exists(&conn, &first.id).expect("exists"));
        assert_eq!(get_run(&conn, &second.id).expect("get").id, second.id);
    }
}
