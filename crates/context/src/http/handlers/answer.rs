//! Question answering handler

use axum::{extract::State, Json};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

use crate::engine::{AnswerRequest, MAX_TOP_K};
use crate::http::AppState;
use crate::synthesizer::SynthesizedResponse;
use lodestar_common::errors::{AppError, Result};

/// Time past the request deadline before the pipeline is abandoned
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

/// Answer request body
#[derive(Debug, Deserialize, Validate)]
pub struct AnswerBody {
    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub conversation_id: Option<String>,

    /// Force chain-of-retrieval on or off
    #[serde(default)]
    pub chain: Option<bool>,

    #[serde(default)]
    #[validate(range(min = 1, max = 50))]
    pub top_k: Option<usize>,
}

impl From<AnswerBody> for AnswerRequest {
    fn from(body: AnswerBody) -> Self {
        Self {
            query: body.query,
            conversation_id: body.conversation_id,
            chain: body.chain,
            top_k: body.top_k.map(|k| k.min(MAX_TOP_K)),
            deadline: None,
        }
    }
}

/// Answer a question
///
/// The pipeline runs on its own task with the request timeout as its
/// deadline; past it the engine answers from what it has gathered and flags
/// the response `timed_out`. Dropping this handler (client went away), or a
/// pipeline that overruns the deadline by [`DEADLINE_GRACE`], cancels it.
pub async fn answer(State(state): State<AppState>, Json(body): Json<AnswerBody>) -> Result<Json<SynthesizedResponse>> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let engine = state.engine.clone();
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    let request = AnswerRequest::from(body).with_deadline(tokio::time::Instant::now() + timeout);
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move { engine.answer_with(request, &task_cancel).await });

    let joined = match tokio::time::timeout(timeout + DEADLINE_GRACE, task).await {
        Ok(joined) => joined,
        Err(_) => {
            cancel.cancel();
            warn!(timeout_ms = timeout.as_millis() as u64, "Answer pipeline overran its deadline");
            return Err(AppError::RetrievalTimeout {
                stage: "request".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };
    guard.disarm();

    let response = joined.map_err(|e| AppError::Internal {
        message: format!("answer task failed: {}", e),
    })??;
    Ok(Json(response))
}
