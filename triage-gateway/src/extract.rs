//! Locates the structured payload inside upstream text and checks it against
//! the task's field rules.
//!
//! The payload is taken to be the span from the first `{` to the last `}`.
//! Prose around it is ignored, but braces inside that prose would widen the
//! span and make the parse fail; such responses surface as
//! `MalformedResponse`. Everything here is a pure function of its input.

use std::collections::HashSet;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};

use crate::error::{GatewayError, Result};
use crate::models::{
    AuthResult, BundleMessages, BundleResult, CompletenessResult, EvaluationResult,
    EvaluationTask, RiskBand,
};
use crate::templates::{FieldKind, FieldRule, template_for};

/// Extract and validate in one step.
pub fn parse_evaluation(task: EvaluationTask, text: &str) -> Result<EvaluationResult> {
    let payload = extract_payload(text)?;
    validate(task, &payload)
}

pub fn extract_payload(text: &str) -> Result<Value> {
    let start = text
        .find('{')
        .ok_or_else(|| GatewayError::malformed("response contains no opening brace", text))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| GatewayError::malformed("response contains no closing brace", text))?;
    if end < start {
        return Err(GatewayError::malformed(
            "closing brace precedes opening brace",
            text,
        ));
    }

    serde_json::from_str(&text[start..=end])
        .map_err(|e| GatewayError::malformed(format!("embedded payload is not valid JSON: {e}"), text))
}

pub fn validate(task: EvaluationTask, payload: &Value) -> Result<EvaluationResult> {
    for rule in template_for(task).schema {
        check_rule(rule, payload)?;
    }

    match task {
        EvaluationTask::Completeness => {
            let raw: RawCompleteness = decode(task, payload)?;
            Ok(EvaluationResult::Completeness(raw.normalize()))
        }
        EvaluationTask::Auth => {
            let raw: RawAuth = decode(task, payload)?;
            Ok(EvaluationResult::Auth(raw.normalize()))
        }
        EvaluationTask::Bundle => {
            let raw: RawBundle = decode(task, payload)?;
            Ok(EvaluationResult::Bundle(BundleResult {
                summary: raw.summary,
                messages: BundleMessages {
                    referrer_ask: raw.messages.referrer_ask,
                    patient_sms: raw.messages.patient_sms,
                },
                completeness: raw.completeness.normalize(),
                auth: raw.auth.normalize(),
            }))
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, key| value.get(key))
}

fn check_rule(rule: &FieldRule, payload: &Value) -> Result<()> {
    let value = lookup(payload, rule.path)
        .ok_or_else(|| GatewayError::violation(rule.path, "required field is missing"))?;

    let matches = match rule.kind {
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::String => value.is_string(),
        FieldKind::StringArray => is_string_array(value),
        FieldKind::NonEmptyStringArray => {
            is_string_array(value) && value.as_array().is_some_and(|items| !items.is_empty())
        }
        FieldKind::Band => value
            .as_str()
            .is_some_and(|band| band.parse::<RiskBand>().is_ok()),
        FieldKind::Object => value.is_object(),
    };

    if matches {
        Ok(())
    } else {
        Err(GatewayError::violation(
            rule.path,
            format!("expected {}, found {}", rule.kind.describe(), type_name(value)),
        ))
    }
}

fn is_string_array(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a non-integer number",
        Value::Number(_) => "an out-of-range integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn decode<T: DeserializeOwned>(task: EvaluationTask, payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| GatewayError::violation(task.as_str(), e.to_string()))
}

/// Scores outside `[0, 100]` are pinned to the nearest bound.
pub fn clamp_score(score: &Number) -> u8 {
    match (score.as_i64(), score.as_u64()) {
        (Some(value), _) => value.clamp(0, 100) as u8,
        (None, Some(_)) => 100,
        (None, None) => 0,
    }
}

/// Drops repeated entries, keeping the first occurrence.
pub fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCompleteness {
    score: Number,
    missing: Vec<String>,
    low_confidence: Vec<String>,
    draft_referrer_ask: String,
    #[serde(rename = "draftPatientSMS")]
    draft_patient_sms: String,
}

impl RawCompleteness {
    fn normalize(self) -> CompletenessResult {
        CompletenessResult {
            score: clamp_score(&self.score),
            missing: dedupe(self.missing),
            low_confidence: dedupe(self.low_confidence),
            draft_referrer_ask: self.draft_referrer_ask,
            draft_patient_sms: self.draft_patient_sms,
        }
    }
}

#[derive(Deserialize)]
struct RawAuth {
    band: RiskBand,
    reason: String,
    checklist: Vec<String>,
}

impl RawAuth {
    fn normalize(self) -> AuthResult {
        AuthResult {
            band: self.band,
            reason: self.reason,
            checklist: dedupe(self.checklist),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessages {
    referrer_ask: String,
    #[serde(rename = "patientSMS")]
    patient_sms: String,
}

#[derive(Deserialize)]
struct RawBundle {
    summary: String,
    messages: RawMessages,
    completeness: RawCompleteness,
    auth: RawAuth,
}
