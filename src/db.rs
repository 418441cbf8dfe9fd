use rand::{
    distributions::{Alphanumeric, DistString},
    rngs::OsRng,
};
use rusqlite::Connection;
use std::path::Path;

pub fn open(path: &Path) -> Result<Connection, String> {
    let mut connection =
        Connection::open(path).map_err(|e| format!("Failed to open sqlite db: {e}"))?;
    bootstrap_schema(&mut connection)?;
    Ok(connection)
}

pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), String> {
    connection
        .execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS experiments (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              purpose TEXT,
              tags_json TEXT NOT NULL DEFAULT '[]',
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
              id TEXT PRIMARY KEY,
              experiment_id TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              seed INTEGER,
              started_at_ms INTEGER,
              finished_at_ms INTEGER,
              elapsed_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (experiment_id) REFERENCES experiments(id)
            );

            CREATE TABLE IF NOT EXISTS metrics (
              id TEXT PRIMARY KEY,
              run_id TEXT NOT NULL,
              key TEXT NOT NULL,
              step INTEGER NOT NULL,
              value REAL NOT NULL,
              recorded_at_ms INTEGER NOT NULL,
              FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            CREATE TABLE IF NOT EXISTS run_summary (
              run_id TEXT PRIMARY KEY,
              best_score REAL,
              best_epoch INTEGER,
              last_epoch INTEGER,
              last_step INTEGER NOT NULL DEFAULT 0,
              predicted_final_score REAL,
              early_stop_epoch INTEGER,
              notes TEXT,
              updated_at_ms INTEGER NOT NULL,
              FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            CREATE TABLE IF NOT EXISTS recommendations (
              id TEXT PRIMARY KEY,
              experiment_id TEXT NOT NULL,
              type TEXT NOT NULL,
              params_json TEXT NOT NULL DEFAULT '{}',
              predicted_score REAL,
              explanations_json TEXT,
              context_json TEXT,
              position INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (experiment_id) REFERENCES experiments(id)
            );
            ",
        )
        .map_err(|e| format!("Failed to bootstrap schema: {e}"))?;

    ensure_column(connection, "runs", "notes", "TEXT")?;
    ensure_column(
        connection,
        "recommendations",
        "position",
        "INTEGER NOT NULL DEFAULT 0",
    )?;

    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment_id)",
            [],
        )
        .map_err(|e| format!("Failed to create runs index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_metrics_run_key_step ON metrics(run_id, key, step)",
            [],
        )
        .map_err(|e| format!("Failed to create metrics index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_run_summary_updated_at ON run_summary(updated_at_ms)",
            [],
        )
        .map_err(|e| format!("Failed to create run summary index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_reco_experiment_created ON recommendations(experiment_id, created_at_ms DESC, position)",
            [],
        )
        .map_err(|e| format!("Failed to create recommendations index: {e}"))?;

    Ok(())
}

fn ensure_column(
    connection: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<(), String> {
    let mut stmt = connection
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("Failed to inspect table {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("Failed to query table info for {table}: {e}"))?;

    while let Some(row) = rows
        .next()
        .map_err(|e| format!("Failed reading table info for {table}: {e}"))?
    {
        let name: String = row
            .get(1)
            .map_err(|e| format!("Failed parsing table info for {table}: {e}"))?;
        if name == column {
            return Ok(());
        }
    }

    connection
        .execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"),
            [],
        )
        .map_err(|e| format!("Failed adding column {column} to {table}: {e}"))?;
    Ok(())
}

pub fn make_id(prefix: &str) -> String {
    let suffix = Alphanumeric.sample_string(&mut OsRng, 8).to_lowercase();
    format!("{}_{}_{}", prefix, now_ms(), suffix)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
