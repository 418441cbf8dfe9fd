use crate::summary::SummaryEngine;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("recompute worker is not running")]
    WorkerStopped,
}

/// Runs summary recomputes outside the metric write path.
///
/// Callers notify after their append transaction commits; the worker thread
/// owns its own connection and recomputes each run in its own unit of work,
/// so a recompute failure can never roll back a metric write and a burst of
/// appends never serializes behind a recompute. Delivery is at-least-once
/// and recompute is idempotent, so duplicate or reordered notifications are
/// harmless; bursts are drained and coalesced per run.
pub struct RecomputeWorker {
    sender: Option<Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl RecomputeWorker {
    pub fn spawn(db_path: PathBuf) -> Self {
        let (sender, receiver) = mpsc::channel::<String>();
        let handle = thread::spawn(move || worker_loop(&db_path, receiver));
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Enqueues a recompute for a run.
    pub fn notify(&self, run_id: &str) -> Result<(), TriggerError> {
        match &self.sender {
            Some(sender) => sender
                .send(run_id.to_string())
                .map_err(|_| TriggerError::WorkerStopped),
            None => Err(TriggerError::WorkerStopped),
        }
    }

    /// Drains everything already enqueued, then joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RecomputeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(db_path: &Path, receiver: Receiver<String>) {
    while let Ok(first) = receiver.recv() {
        let mut pending = vec![first];
        while let Ok(more) = receiver.try_recv() {
            pending.push(more);
        }
        coalesce(&mut pending);
        for run_id in pending {
            recompute_one(db_path, &run_id);
        }
    }
}

fn coalesce(pending: &mut Vec<String>) {
    let mut seen = HashSet::new();
    pending.retain(|run_id| seen.insert(run_id.clone()));
}

fn recompute_one(db_path: &Path, run_id: &str) {
    let connection = match Connection::open(db_path) {
        Ok(connection) => connection,
        Err(err) => {
            warn!(run_id, error = %err, "recompute worker could not open database");
            return;
        }
    };
    if let Err(err) = SummaryEngine::recompute(&connection, run_id) {
        warn!(run_id, error = %err, "summary recompute failed");
    }
}

#[cfg(test)]
mod tests {
    use super::RecomputeWorker;
    use crate::db;
    use crate::metrics::{append, MetricBatchEntry};
    use crate::runs::{create_experiment, create_run};
    use crate::summary::SummaryEngine;

    fn log(conn: &mut rusqlite::Connection, run_id: &str, step: i64, pairs: &[(&str, f64)]) {
        let entry = MetricBatchEntry {
            step,
            metrics: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        append(conn, run_id, &[entry]).expect("append metrics");
    }

    #[test]
    fn notify_after_append_produces_a_summary_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("labbook.sqlite");
        let mut conn = db::open(&db_path).expect("open db");
        let exp = create_experiment(&conn, "exp", None, &[]).expect("experiment");
        let run = create_run(&conn, &exp.id, None).expect("run");
        log(&mut conn, &run.id, 1, &[("val_acc", 0.4)]);
        log(&mut conn, &run.id, 2, &[("val_acc", 0.9)]);

        let worker = RecomputeWorker::spawn(db_path.clone());
        worker.notify(&run.id).expect("notify");
        worker.shutdown();

        let summary = SummaryEngine::find(&conn, &run.id)
            .expect("find")
            .expect("summary row");
        assert_eq!(summary.best_score, Some(0.9));
        assert_eq!(summary.last_step, 2);
    }

    #[test]
    fn duplicate_and_unknown_notifications_are_harmless() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("labbook.sqlite");
        let mut conn = db::open(&db_path).expect("open db");
        let exp = create_experiment(&conn, "exp", None, &[]).expect("experiment");
        let run = create_run(&conn, &exp.id, None).expect("run");
        log(&mut conn, &run.id, 1, &[("accuracy", 0.3)]);

        let worker = RecomputeWorker::spawn(db_path.clone());
        worker.notify("run_missing").expect("notify unknown");
        worker.notify(&run.id).expect("notify");
        worker.notify(&run.id).expect("duplicate notify");
        worker.shutdown();

        let summary = SummaryEngine::find(&conn, &run.id)
            .expect("find")
            .expect("summary row");
        assert_eq!(summary.best_score, Some(0.3));
    }

    #[test]
    fn notify_fails_after_shutdown_is_initiated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("labbook.sqlite");
        let _conn = db::open(&db_path).expect("open db");

        let mut worker = RecomputeWorker::spawn(db_path);
        worker.stop();
        assert!(worker.notify("run_any").is_err());
    }
}
