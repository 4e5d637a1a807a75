use serde::Serialize;
use triage_gateway::{
    Diagnostics, ErrorKind, Evaluation, EvaluationFailure, EvaluationResult, EvaluationTask,
};

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub ok: bool,
    pub task: EvaluationTask,
    pub result: EvaluationResult,
    pub model: String,
    pub diagnostics: Diagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl From<Evaluation> for EvaluateResponse {
    fn from(evaluation: Evaluation) -> Self {
        Self {
            ok: true,
            task: evaluation.task,
            result: evaluation.result,
            model: evaluation.model,
            diagnostics: evaluation.diagnostics,
            raw: evaluation.raw_text,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EvaluateErrorResponse {
    pub ok: bool,
    pub error: ErrorKind,
    /// Technical description for operators.
    pub detail: String,
    /// Short actionable text for the end user.
    pub message: &'static str,
    pub diagnostics: Diagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl From<EvaluationFailure> for EvaluateErrorResponse {
    fn from(failure: EvaluationFailure) -> Self {
        Self {
            ok: false,
            error: failure.error.kind(),
            detail: failure.error.to_string(),
            message: failure.error.user_message(),
            diagnostics: failure.diagnostics,
            raw: failure.raw_text,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub gateway_enabled: bool,
    pub admission_available: f64,
    pub timestamp: String,
}
