//! Prompt and result-shape table, one entry per evaluation task.
//!
//! The same rules that describe the expected payload to the upstream model
//! drive validation of what comes back, see [`crate::extract`].

use crate::models::{EvaluationTask, Referral};
use crate::transport::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    String,
    StringArray,
    NonEmptyStringArray,
    Band,
    Object,
}

impl FieldKind {
    pub fn describe(&self) -> &'static str {
        match self {
            FieldKind::Integer => "an integer",
            FieldKind::String => "a string",
            FieldKind::StringArray => "an array of strings",
            FieldKind::NonEmptyStringArray => "a non-empty array of strings",
            FieldKind::Band => "one of \"low\", \"medium\", \"high\"",
            FieldKind::Object => "an object",
        }
    }
}

/// A required field, addressed by dotted path from the payload root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub path: &'static str,
    pub kind: FieldKind,
}

const fn field(path: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule { path, kind }
}

#[derive(Debug)]
pub struct TaskTemplate {
    pub task: EvaluationTask,
    pub system: &'static str,
    pub instructions: &'static str,
    pub schema: &'static [FieldRule],
}

const SYSTEM_PROMPT: &str = "You are a clinical referral intake assistant. \
You review specialty referrals for completeness and payer requirements. \
You respond with a single JSON object and nothing else: no prose, no markdown fences.";

const COMPLETENESS_INSTRUCTIONS: &str = r#"Assess how complete this referral is for scheduling.

Return ONLY this JSON object:
{
  "score": <integer 0-100, 100 means nothing is missing>,
  "missing": [<dotted field paths that are absent or unusable, e.g. "insurance.memberId">],
  "lowConfidence": [<short reasons a value may be unreliable, e.g. "fax page 1 OCR 0.41">],
  "draftReferrerAsk": "<short paragraph to the referring office requesting ONLY the missing items>",
  "draftPatientSMS": "<text to the patient, at most 160 characters; if teleEligible is true offer a telehealth visit first>"
}

Do not repeat entries within an array."#;

const AUTH_INSTRUCTIONS: &str = r#"Estimate the prior-authorization risk for this referral given the payer, diagnosis codes and procedure codes.

Return ONLY this JSON object:
{
  "band": "low" | "medium" | "high",
  "reason": "<one short sentence>",
  "checklist": [<3 to 6 items the office must gather, or exactly ["None required"]>]
}"#;

const BUNDLE_INSTRUCTIONS: &str = r#"Produce a complete triage bundle for this referral.

Return ONLY this JSON object:
{
  "summary": "<clinical summary, at most 80 words>",
  "messages": {
    "referrerAsk": "<short paragraph to the referring office requesting ONLY missing items>",
    "patientSMS": "<at most 160 characters; prefer telehealth if teleEligible is true>"
  },
  "completeness": {
    "score": <integer 0-100>,
    "missing": [<dotted field paths>],
    "lowConfidence": [<short reasons>],
    "draftReferrerAsk": "<same as messages.referrerAsk>",
    "draftPatientSMS": "<same as messages.patientSMS>"
  },
  "auth": {
    "band": "low" | "medium" | "high",
    "reason": "<one short sentence>",
    "checklist": [<3 to 6 items, or exactly ["None required"]>]
  }
}"#;

const COMPLETENESS_RULES: &[FieldRule] = &[
    field("score", FieldKind::Integer),
    field("missing", FieldKind::StringArray),
    field("lowConfidence", FieldKind::StringArray),
    field("draftReferrerAsk", FieldKind::String),
    field("draftPatientSMS", FieldKind::String),
];

const AUTH_RULES: &[FieldRule] = &[
    field("band", FieldKind::Band),
    field("reason", FieldKind::String),
    field("checklist", FieldKind::NonEmptyStringArray),
];

const BUNDLE_RULES: &[FieldRule] = &[
    field("summary", FieldKind::String),
    field("messages", FieldKind::Object),
    field("messages.referrerAsk", FieldKind::String),
    field("messages.patientSMS", FieldKind::String),
    field("completeness", FieldKind::Object),
    field("completeness.score", FieldKind::Integer),
    field("completeness.missing", FieldKind::StringArray),
    field("completeness.lowConfidence", FieldKind::StringArray),
    field("completeness.draftReferrerAsk", FieldKind::String),
    field("completeness.draftPatientSMS", FieldKind::String),
    field("auth", FieldKind::Object),
    field("auth.band", FieldKind::Band),
    field("auth.reason", FieldKind::String),
    field("auth.checklist", FieldKind::NonEmptyStringArray),
];

pub static TEMPLATES: [TaskTemplate; 3] = [
    TaskTemplate {
        task: EvaluationTask::Completeness,
        system: SYSTEM_PROMPT,
        instructions: COMPLETENESS_INSTRUCTIONS,
        schema: COMPLETENESS_RULES,
    },
    TaskTemplate {
        task: EvaluationTask::Auth,
        system: SYSTEM_PROMPT,
        instructions: AUTH_INSTRUCTIONS,
        schema: AUTH_RULES,
    },
    TaskTemplate {
        task: EvaluationTask::Bundle,
        system: SYSTEM_PROMPT,
        instructions: BUNDLE_INSTRUCTIONS,
        schema: BUNDLE_RULES,
    },
];

pub fn template_for(task: EvaluationTask) -> &'static TaskTemplate {
    match task {
        EvaluationTask::Completeness => &TEMPLATES[0],
        EvaluationTask::Auth => &TEMPLATES[1],
        EvaluationTask::Bundle => &TEMPLATES[2],
    }
}

impl TaskTemplate {
    /// System and user messages for this task over an already sanitized referral.
    pub fn render(&self, referral: &Referral) -> Result<Vec<ChatMessage>, serde_json::Error> {
        let referral_json = serde_json::to_string_pretty(referral)?;
        let user = format!(
            "{instructions}\n\nReferral:\n{referral_json}\n\nRespond with the JSON object only.",
            instructions = self.instructions,
        );
        Ok(vec![ChatMessage::system(self.system), ChatMessage::user(user)])
    }
}
