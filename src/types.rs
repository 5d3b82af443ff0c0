//! Shared domain types: configuration, the case aggregate, inbound messages
//! and the pipeline result contract.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration. Every field has a default so an absent or partial
/// `~/.caseflow/config.json` still yields a working engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Explicit database location. Defaults to `~/.caseflow/caseflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Below this classifier confidence a case is forced provisional.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Trailing window for same-sender grouping.
    #[serde(default = "default_dedup_window_hours")]
    pub dedup_window_hours: u32,
    /// First-response SLA per case type, in hours.
    #[serde(default = "default_first_response_sla")]
    pub first_response_sla_hours: HashMap<String, u32>,
    /// SLA used for case types missing from `first_response_sla_hours`.
    #[serde(default = "default_sla_hours")]
    pub default_first_response_sla_hours: u32,
    /// IANA timezone used to compute the ticket period (AAMM).
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Bounded blind retries on `STORE_CONFLICT`.
    #[serde(default = "default_store_conflict_retries")]
    pub store_conflict_retries: u32,
    /// After this many classifier failures a message moves to manual triage.
    #[serde(default = "default_max_classification_attempts")]
    pub max_classification_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_classifier_timeout_secs(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.72
}

fn default_dedup_window_hours() -> u32 {
    24
}

fn default_sla_hours() -> u32 {
    24
}

fn default_first_response_sla() -> HashMap<String, u32> {
    let mut map = HashMap::new();
    map.insert(RENEWAL_CASE_TYPE.to_string(), 24);
    map
}

fn default_timezone() -> String {
    "America/Panama".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    20
}

fn default_store_conflict_retries() -> u32 {
    3
}

fn default_max_classification_attempts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            confidence_threshold: default_confidence_threshold(),
            dedup_window_hours: default_dedup_window_hours(),
            first_response_sla_hours: default_first_response_sla(),
            default_first_response_sla_hours: default_sla_hours(),
            timezone: default_timezone(),
            classifier: ClassifierConfig::default(),
            store_conflict_retries: default_store_conflict_retries(),
            max_classification_attempts: default_max_classification_attempts(),
        }
    }
}

impl Config {
    /// First-response SLA in hours for a case type.
    pub fn sla_hours_for(&self, case_type: &str) -> u32 {
        self.first_response_sla_hours
            .get(case_type)
            .copied()
            .unwrap_or(self.default_first_response_sla_hours)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedup_window_hours as i64)
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz, String> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| format!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

// =============================================================================
// Case status (renewal sub-type)
// =============================================================================

/// Case type handled by the lifecycle state machine.
pub const RENEWAL_CASE_TYPE: &str = "renewal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pendiente,
    EnRevision,
    EnProceso,
    Aplazado,
    CerradoRenovado,
    CerradoCancelado,
}

impl CaseStatus {
    pub const ALL: [CaseStatus; 6] = [
        CaseStatus::Pendiente,
        CaseStatus::EnRevision,
        CaseStatus::EnProceso,
        CaseStatus::Aplazado,
        CaseStatus::CerradoRenovado,
        CaseStatus::CerradoCancelado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pendiente => "pendiente",
            CaseStatus::EnRevision => "en_revision",
            CaseStatus::EnProceso => "en_proceso",
            CaseStatus::Aplazado => "aplazado",
            CaseStatus::CerradoRenovado => "cerrado_renovado",
            CaseStatus::CerradoCancelado => "cerrado_cancelado",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaseStatus::CerradoRenovado | CaseStatus::CerradoCancelado
        )
    }

    /// Outgoing edges of the renewal state machine.
    pub fn allowed_targets(&self) -> &'static [CaseStatus] {
        match self {
            CaseStatus::Pendiente => &[CaseStatus::EnRevision],
            CaseStatus::EnRevision => &[
                CaseStatus::EnProceso,
                CaseStatus::Aplazado,
                CaseStatus::CerradoRenovado,
                CaseStatus::CerradoCancelado,
            ],
            CaseStatus::EnProceso => &[
                CaseStatus::CerradoRenovado,
                CaseStatus::CerradoCancelado,
                CaseStatus::Aplazado,
            ],
            CaseStatus::Aplazado => &[
                CaseStatus::EnRevision,
                CaseStatus::EnProceso,
                CaseStatus::CerradoCancelado,
            ],
            CaseStatus::CerradoRenovado | CaseStatus::CerradoCancelado => &[],
        }
    }

    /// Staying put is always allowed; otherwise the edge must exist.
    pub fn can_transition_to(&self, target: CaseStatus) -> bool {
        *self == target || self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaseStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown case status: {}", s))
    }
}

// =============================================================================
// Case aggregate
// =============================================================================

/// A row from the `cases` table.
///
/// `is_provisional` is read from a generated column (`ticket IS NULL`), so it
/// cannot drift from `ticket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub ticket: Option<String>,
    pub is_provisional: bool,
    pub case_type: String,
    pub bucket: String,
    pub ramo_code: Option<String>,
    pub insurer_code: Option<String>,
    pub procedure_code: Option<String>,
    pub confidence: f64,
    pub missing_fields: BTreeSet<String>,
    pub special_flags: BTreeSet<String>,
    pub broker_id: String,
    pub assigned_master_id: Option<String>,
    /// Sender address of the message that opened the case (grouping key).
    pub origin_address: Option<String>,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    pub aplazado_until: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub new_start_date: Option<NaiveDate>,
    pub new_end_date: Option<NaiveDate>,
}

impl Case {
    pub fn has_complete_codes(&self) -> bool {
        self.ramo_code.is_some() && self.insurer_code.is_some() && self.procedure_code.is_some()
    }
}

/// Input for creating a case. Status always starts at `pendiente`.
#[derive(Debug, Clone)]
pub struct CaseDraft {
    pub case_type: String,
    pub bucket: String,
    pub ramo_code: Option<String>,
    pub insurer_code: Option<String>,
    pub procedure_code: Option<String>,
    pub confidence: f64,
    pub missing_fields: BTreeSet<String>,
    pub special_flags: BTreeSet<String>,
    pub broker_id: String,
    pub assigned_master_id: Option<String>,
    pub origin_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A partial update to a case, applied by the store gateway.
///
/// Derived fields (ticket, SLA marker, first-response and closing stamps)
/// are crate-private: only the engine sets them.
#[derive(Debug, Clone, Default)]
pub struct CasePatch {
    pub(crate) expected_status: Option<CaseStatus>,
    pub(crate) status: Option<CaseStatus>,
    pub(crate) ramo_code: Option<String>,
    pub(crate) insurer_code: Option<String>,
    pub(crate) procedure_code: Option<String>,
    pub(crate) missing_fields: Option<BTreeSet<String>>,
    pub(crate) assigned_master_id: Option<String>,
    pub(crate) aplazado_until: Option<Option<DateTime<Utc>>>,
    pub(crate) cancellation_reason: Option<String>,
    pub(crate) new_start_date: Option<NaiveDate>,
    pub(crate) new_end_date: Option<NaiveDate>,
    pub(crate) ticket: Option<String>,
    pub(crate) first_response_at: Option<DateTime<Utc>>,
    pub(crate) closed_at: Option<DateTime<Utc>>,
    pub(crate) sla_breached: Option<bool>,
}

impl CasePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Condition the write on the status the caller just read.
    pub fn expecting(mut self, status: CaseStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn status(mut self, status: CaseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assigned_master(mut self, master_id: &str) -> Self {
        self.assigned_master_id = Some(master_id.to_string());
        self
    }

    pub fn cancellation_reason(mut self, reason: &str) -> Self {
        self.cancellation_reason = Some(reason.to_string());
        self
    }

    pub fn aplazado_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.aplazado_until = Some(until);
        self
    }

    pub fn renewal_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.new_start_date = Some(start);
        self.new_end_date = Some(end);
        self
    }

    pub(crate) fn codes(
        mut self,
        ramo: Option<String>,
        insurer: Option<String>,
        procedure: Option<String>,
    ) -> Self {
        self.ramo_code = ramo;
        self.insurer_code = insurer;
        self.procedure_code = procedure;
        self
    }

    pub(crate) fn missing_fields(mut self, fields: BTreeSet<String>) -> Self {
        self.missing_fields = Some(fields);
        self
    }

    pub(crate) fn ticket(mut self, ticket: &str) -> Self {
        self.ticket = Some(ticket.to_string());
        self
    }

    pub(crate) fn first_response_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_response_at = Some(at);
        self
    }

    pub(crate) fn closed_at(mut self, at: DateTime<Utc>) -> Self {
        self.closed_at = Some(at);
        self
    }

    pub(crate) fn sla_breached(mut self, breached: bool) -> Self {
        self.sla_breached = Some(breached);
        self
    }
}

// =============================================================================
// Inbound messages
// =============================================================================

/// A classified (or not yet classified) external message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InboundMessage {
    /// Message identity; the idempotent linking key.
    pub message_id: String,
    pub from_address: String,
    #[serde(default)]
    pub cc_addresses: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments_summary: Vec<String>,
    /// Present when the message arrives already classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

/// Processing state of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Received,
    Linked,
    Triage,
    Retry,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Received => "received",
            MessageState::Linked => "linked",
            MessageState::Triage => "triage",
            MessageState::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(MessageState::Received),
            "linked" => Some(MessageState::Linked),
            "triage" => Some(MessageState::Triage),
            "retry" => Some(MessageState::Retry),
            _ => None,
        }
    }
}

// =============================================================================
// Actors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    System,
    Master,
    Broker,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::System => "system",
            ActorRole::Master => "master",
            ActorRole::Broker => "broker",
        }
    }
}

/// Who performed an action. Stamped on history and audit rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<String>,
    pub role: ActorRole,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            role: ActorRole::System,
        }
    }

    pub fn master(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            role: ActorRole::Master,
        }
    }
}

// =============================================================================
// Pipeline result
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineAction {
    Created,
    Linked,
    Provisional,
    Error,
}

/// Result handed back to the ingestion trigger and UI layers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    pub action: PipelineAction,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::CaseFailure>,
}

impl PipelineResult {
    pub fn failed(err: &crate::error::CaseError) -> Self {
        Self {
            success: false,
            case_id: None,
            ticket: None,
            action: PipelineAction::Error,
            message: err.to_string(),
            error: Some(err.into()),
        }
    }
}
