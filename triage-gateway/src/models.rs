use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A patient intake record as received from the worklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub patient: Patient,
    pub specialty: String,
    #[serde(default)]
    pub diagnosis_codes: Vec<String>,
    #[serde(default)]
    pub procedure_codes: Vec<String>,
    #[serde(default)]
    pub intake_source: Option<String>,
    #[serde(default)]
    pub distance_miles: Option<f64>,
    #[serde(default)]
    pub tele_eligible: bool,
    #[serde(default)]
    pub insurance: Option<InsuranceCoverage>,
    #[serde(default)]
    pub documents: Vec<ReferralDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub preferred_language: Option<String>,
}

/// Snapshot of the patient's coverage at intake time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsuranceCoverage {
    pub payer: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub eligibility_verified: Option<bool>,
    #[serde(default)]
    pub prior_auth_required: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub text: String,
    /// OCR confidence in [0, 1].
    pub ocr_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationTask {
    Completeness,
    Auth,
    Bundle,
}

impl EvaluationTask {
    pub const ALL: [EvaluationTask; 3] = [
        EvaluationTask::Completeness,
        EvaluationTask::Auth,
        EvaluationTask::Bundle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationTask::Completeness => "completeness",
            EvaluationTask::Auth => "auth",
            EvaluationTask::Bundle => "bundle",
        }
    }
}

impl fmt::Display for EvaluationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completeness" => Ok(EvaluationTask::Completeness),
            "auth" => Ok(EvaluationTask::Auth),
            "bundle" => Ok(EvaluationTask::Bundle),
            other => Err(format!("unknown evaluation task: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl FromStr for RiskBand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskBand::Low),
            "medium" => Ok(RiskBand::Medium),
            "high" => Ok(RiskBand::High),
            other => Err(format!("unknown risk band: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessResult {
    /// Always within [0, 100].
    pub score: u8,
    pub missing: Vec<String>,
    pub low_confidence: Vec<String>,
    pub draft_referrer_ask: String,
    #[serde(rename = "draftPatientSMS")]
    pub draft_patient_sms: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub band: RiskBand,
    pub reason: String,
    pub checklist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMessages {
    pub referrer_ask: String,
    #[serde(rename = "patientSMS")]
    pub patient_sms: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleResult {
    pub summary: String,
    pub messages: BundleMessages,
    pub completeness: CompletenessResult,
    pub auth: AuthResult,
}

/// Typed evaluation output; the variant always matches the requested task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EvaluationResult {
    Completeness(CompletenessResult),
    Auth(AuthResult),
    Bundle(BundleResult),
}

impl EvaluationResult {
    pub fn task(&self) -> EvaluationTask {
        match self {
            EvaluationResult::Completeness(_) => EvaluationTask::Completeness,
            EvaluationResult::Auth(_) => EvaluationTask::Auth,
            EvaluationResult::Bundle(_) => EvaluationTask::Bundle,
        }
    }
}
