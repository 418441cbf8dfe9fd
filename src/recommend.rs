use crate::client::{RecoClient, RecoPoint, RecoRequest, RecoRunSeries, RecoSuggestion, UpstreamError};
use crate::config::Config;
use crate::db::{make_id, now_ms};
use crate::metrics::{self, MetricError, MetricRecord, ACCURACY_KEY_CANDIDATES, LOSS_KEY_CANDIDATES};
use crate::summary::{SummaryEngine, SummaryError};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

/// Suggestion tag that feeds back into run summaries. Other tags are stored
/// verbatim and left for consumers to interpret.
const EARLY_STOP_HINT_TYPE: &str = "EARLY_STOP_HINT";

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error("database error: {0}")]
    Db(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl From<MetricError> for RecommendError {
    fn from(err: MetricError) -> Self {
        match err {
            MetricError::Db(msg) => Self::Db(msg),
            MetricError::RunNotFound(id) => Self::RunNotFound(id),
        }
    }
}

impl From<SummaryError> for RecommendError {
    fn from(err: SummaryError) -> Self {
        match err {
            SummaryError::Db(msg) => Self::Db(msg),
            SummaryError::RunNotFound(id) => Self::RunNotFound(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRecord {
    pub id: String,
    pub experiment_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Map<String, Value>,
    pub predicted_score: Option<f64>,
    pub explanations: Option<Map<String, Value>>,
    pub context: Option<Map<String, Value>>,
    pub created_at_ms: i64,
}

/// Rebuilds an experiment's recommendation set from the external service.
pub struct RecommendEngine;

impl RecommendEngine {
    /// Assembles per-run metric series, submits one batched analyze call,
    /// and only after a successful response replaces the experiment's
    /// recommendations and applies early-stop hints onto run summaries, all
    /// in one transaction. An upstream failure leaves stored state untouched
    /// and is surfaced for the caller to decide about re-submission.
    pub fn refresh(
        connection: &mut Connection,
        client: &dyn RecoClient,
        config: &Config,
        experiment_id: &str,
    ) -> Result<Vec<RecommendationRecord>, RecommendError> {
        if !experiment_exists(connection, experiment_id)? {
            return Err(RecommendError::ExperimentNotFound(experiment_id.to_string()));
        }

        let run_ids = run_ids_for_experiment(connection, experiment_id)?;
        let limit = config.series_fetch_limit;
        let mut runs = Vec::with_capacity(run_ids.len());
        for run_id in &run_ids {
            let val_acc = gather_series(connection, run_id, &ACCURACY_KEY_CANDIDATES, limit)?;
            let train_loss = gather_series(connection, run_id, &LOSS_KEY_CANDIDATES, limit)?;
            runs.push(RecoRunSeries {
                run_id: run_id.clone(),
                val_acc,
                train_loss,
            });
        }

        info!(
            experiment_id,
            runs = runs.len(),
            first_val_acc = runs.first().map(|r| r.val_acc.len()).unwrap_or(0),
            first_train_loss = runs.first().map(|r| r.train_loss.len()).unwrap_or(0),
            "requesting recommendation analysis"
        );

        let request = RecoRequest {
            experiment_id: experiment_id.to_string(),
            runs,
        };

        // The round-trip runs with no transaction open; stored state only
        // changes once a response is in hand.
        let response = client.analyze(&request)?;

        let tx = connection
            .transaction()
            .map_err(|e| RecommendError::Db(e.to_string()))?;
        tx.execute(
            "DELETE FROM recommendations WHERE experiment_id = ?1",
            params![experiment_id],
        )
        .map_err(|e| RecommendError::Db(e.to_string()))?;

        let now = now_ms();
        let mut saved = Vec::with_capacity(response.suggestions.len());
        for (position, suggestion) in response.suggestions.iter().enumerate() {
            let record = insert_suggestion(&tx, experiment_id, suggestion, position as i64, now)?;
            if suggestion.kind.eq_ignore_ascii_case(EARLY_STOP_HINT_TYPE) {
                apply_early_stop_hint(&tx, suggestion)?;
            }
            saved.push(record);
        }
        tx.commit().map_err(|e| RecommendError::Db(e.to_string()))?;

        Ok(saved)
    }

    /// Stored recommendations, newest batch first; within a batch the
    /// response ordering is preserved.
    pub fn list_for_experiment(
        connection: &Connection,
        experiment_id: &str,
    ) -> Result<Vec<RecommendationRecord>, RecommendError> {
        let mut stmt = connection
            .prepare(
                "SELECT id, experiment_id, type, params_json, predicted_score,
                        explanations_json, context_json, created_at_ms
                 FROM recommendations WHERE experiment_id = ?1
                 ORDER BY created_at_ms DESC, position ASC",
            )
            .map_err(|e| RecommendError::Db(e.to_string()))?;
        let raw = stmt
            .query_map(params![experiment_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(|e| RecommendError::Db(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RecommendError::Db(e.to_string()))?;

        raw.into_iter()
            .map(|row| {
                Ok(RecommendationRecord {
                    id: row.0,
                    experiment_id: row.1,
                    kind: row.2,
                    params: decode_map(&row.3)?,
                    predicted_score: row.4,
                    explanations: row.5.as_deref().map(decode_map).transpose()?,
                    context: row.6.as_deref().map(decode_map).transpose()?,
                    created_at_ms: row.7,
                })
            })
            .collect()
    }
}

/// Recent points for every candidate key of one family, merged and sorted
/// ascending by step. Keys match exactly; a run normally logs only one
/// spelling, but every matching key contributes.
fn gather_series(
    connection: &Connection,
    run_id: &str,
    candidate_keys: &[&str],
    limit: usize,
) -> Result<Vec<RecoPoint>, RecommendError> {
    let mut points: Vec<MetricRecord> = Vec::new();
    for key in candidate_keys {
        points.extend(metrics::recent_for_key(connection, run_id, key, limit)?);
    }
    points.sort_by_key(|m| m.step);
    Ok(points
        .into_iter()
        .map(|m| RecoPoint {
            step: m.step,
            value: m.value,
        })
        .collect())
}

fn insert_suggestion(
    tx: &Transaction<'_>,
    experiment_id: &str,
    suggestion: &RecoSuggestion,
    position: i64,
    now: i64,
) -> Result<RecommendationRecord, RecommendError> {
    let id = make_id("reco");
    let params_json = serde_json::to_string(&suggestion.params)
        .map_err(|e| RecommendError::Serde(e.to_string()))?;
    let explanations_json = suggestion
        .explanations
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RecommendError::Serde(e.to_string()))?;
    let context_json = suggestion
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RecommendError::Serde(e.to_string()))?;

    tx.execute(
        "INSERT INTO recommendations (
           id, experiment_id, type, params_json, predicted_score,
           explanations_json, context_json, position, created_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            experiment_id,
            suggestion.kind,
            params_json,
            suggestion.predicted_score,
            explanations_json,
            context_json,
            position,
            now
        ],
    )
    .map_err(|e| RecommendError::Db(e.to_string()))?;

    Ok(RecommendationRecord {
        id,
        experiment_id: experiment_id.to_string(),
        kind: suggestion.kind.clone(),
        params: suggestion.params.clone(),
        predicted_score: suggestion.predicted_score,
        explanations: suggestion.explanations.clone(),
        context: suggestion.context.clone(),
        created_at_ms: now,
    })
}

fn apply_early_stop_hint(
    connection: &Connection,
    suggestion: &RecoSuggestion,
) -> Result<(), RecommendError> {
    let Some(run_id) = suggestion.params.get("runId").and_then(Value::as_str) else {
        // Nothing to attach the hint to; the refresh itself still succeeds.
        return Ok(());
    };

    let predicted_final_score =
        extract_score(&suggestion.params, &["predFinalAcc", "predictedFinalAccuracy"]);
    let early_stop_epoch = suggestion
        .params
        .get("earlyStopEpoch")
        .and_then(|value| parse_epoch(value, "earlyStopEpoch"));

    info!(
        run_id,
        ?predicted_final_score,
        ?early_stop_epoch,
        "applying early-stop hint"
    );
    SummaryEngine::apply_ai_prediction(connection, run_id, predicted_final_score, early_stop_epoch)?;
    Ok(())
}

/// First present key wins; an unparsable value degrades to absent.
fn extract_score(params: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match params.get(*key) {
            None | Some(Value::Null) => continue,
            Some(value) => return parse_score(value, key),
        }
    }
    None
}

fn parse_score(value: &Value, key: &str) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, raw = %s, "ignoring unparsable numeric suggestion field");
                None
            }
        },
        other => {
            warn!(key, value = %other, "ignoring non-numeric suggestion field");
            None
        }
    }
}

fn parse_epoch(value: &Value, key: &str) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, raw = %s, "ignoring unparsable numeric suggestion field");
                None
            }
        },
        other => {
            warn!(key, value = %other, "ignoring non-numeric suggestion field");
            None
        }
    }
}

fn decode_map(raw: &str) -> Result<Map<String, Value>, RecommendError> {
    serde_json::from_str(raw).map_err(|e| RecommendError::Serde(e.to_string()))
}

fn experiment_exists(
    connection: &Connection,
    experiment_id: &str,
) -> Result<bool, RecommendError> {
    let found: Option<String> = connection
        .query_row(
            "SELECT id FROM experiments WHERE id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| RecommendError::Db(e.to_string()))?;
    Ok(found.is_some())
}

fn run_ids_for_experiment(
    connection: &Connection,
    experiment_id: &str,
) -> Result<Vec<String>, RecommendError> {
    let mut stmt = connection
        .prepare(
            "SELECT id FROM runs WHERE experiment_id = ?1 ORDER BY created_at_ms ASC, rowid ASC",
        )
        .map_err(|e| RecommendError::Db(e.to_string()))?;
    let ids = stmt
        .query_map(params![experiment_id], |row| row.get(0))
        .map_err(|e| RecommendError::Db(e.to_string()))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| RecommendError::Db(e.to_string()))?;
    Ok(ids)
}
