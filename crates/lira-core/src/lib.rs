//! Core domain model, phone identity, and error taxonomy for LIRA.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lira-core";

/// Error taxonomy shared by every engine layer.
///
/// `Duplicate` is a normal skip outcome, logged not alarmed; it only surfaces
/// as an error object on the portal quarantine path where it becomes a
/// retryable import-error record.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("duplicate of lead {0}")]
    Duplicate(Uuid),
    #[error("{0} not found")]
    NotFound(String),
    #[error("no agents available for company {0}")]
    NoAgentsAvailable(Uuid),
    #[error("concurrent assignment conflict on lead {0}")]
    Conflict(Uuid),
    #[error("dependency unavailable: {0}")]
    Dependency(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Strip a raw contact number down to its dedup key: digits only, with a
/// single leading international-dialing `00` prefix dropped so that
/// `+971 50-123 4567` and `00971501234567` key identically.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix("00") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => digits,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneCheck {
    Ok,
    Missing,
    BadLength,
}

/// Sanity-check a normalized phone: 10-15 digits is the accepted range.
pub fn check_phone(normalized: &str) -> PhoneCheck {
    if normalized.is_empty() {
        PhoneCheck::Missing
    } else if normalized.len() < 10 || normalized.len() > 15 {
        PhoneCheck::BadLength
    } else {
        PhoneCheck::Ok
    }
}

/// Normalized handoff contract from source normalizers into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalLeadInput {
    pub company_id: Uuid,
    pub source: String,
    pub external_id: Option<String>,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub campaign_id: String,
    pub form_id: String,
    pub received_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl CanonicalLeadInput {
    pub fn empty(company_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            company_id,
            source: source.into(),
            external_id: None,
            name: String::new(),
            phone: String::new(),
            email: String::new(),
            campaign_id: String::new(),
            form_id: String::new(),
            received_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn normalized_phone(&self) -> String {
        normalize_phone(&self.phone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for AssignmentPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl AssignmentPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl fmt::Display for AssignmentPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Manual,
    RoundRobin,
    LoadBalanced,
    AutoReassign,
    Bulk,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::RoundRobin => "round_robin",
            Self::LoadBalanced => "load_balanced",
            Self::AutoReassign => "auto_reassign",
            Self::Bulk => "bulk",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "round_robin" => Some(Self::RoundRobin),
            "load_balanced" => Some(Self::LoadBalanced),
            "auto_reassign" => Some(Self::AutoReassign),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }
}

/// Canonical persisted lead.
///
/// Within a tenant at most one lead exists per (`source`, `external_id`) when
/// the external id is present; duplicate suppression is additionally attempted
/// on `normalized_phone` for sources without a stable external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub company_id: Uuid,
    pub external_id: Option<String>,
    pub normalized_phone: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub source: String,
    pub stage: String,
    pub assigned_agent_id: Option<Uuid>,
    pub assignment_priority: AssignmentPriority,
    pub is_new: bool,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    /// Reset on every ownership change; floor for the reassignment timer and
    /// anchor for SLA deadlines.
    pub assigned_at: Option<DateTime<Utc>>,
    /// SLA at-most-once counter: 0 none, 1 warned, 2 team lead, 3 manager.
    pub escalation_level: i16,
    /// History row that a future `undoAssignment` would replay, if any.
    pub undoable_history_id: Option<Uuid>,
    pub source_metadata: BTreeMap<String, String>,
}

/// Per-agent per-tenant load counters consumed by the automatic policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: Uuid,
    pub company_id: Uuid,
    pub agent_name: String,
    pub current_leads_count: i64,
    pub pending_followups_count: i64,
    pub assignments_today: i64,
    pub assignments_week: i64,
    pub conversion_rate: f64,
    pub max_leads_capacity: i64,
    pub is_available: bool,
    pub last_assignment_at: Option<DateTime<Utc>>,
}

impl AgentLoad {
    /// Current-load-to-capacity ratio used by the load-aware selector.
    pub fn utilization(&self) -> f64 {
        if self.max_leads_capacity <= 0 {
            return f64::INFINITY;
        }
        self.current_leads_count as f64 / self.max_leads_capacity as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.max_leads_capacity <= 0 || self.current_leads_count < self.max_leads_capacity
    }
}

/// Append-only ownership change record; the most recent row is ground truth
/// for undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentHistory {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub company_id: Uuid,
    pub old_agent_id: Option<Uuid>,
    pub new_agent_id: Option<Uuid>,
    pub change_reason: ChangeReason,
    pub changed_by: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReassignmentRule {
    pub id: Uuid,
    pub company_id: Uuid,
    pub days_without_contact: i64,
    pub use_round_robin: bool,
    pub is_active: bool,
    pub apply_to_stages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    LeadAssigned,
    LeadReassigned,
    AssignmentUndone,
    AssignmentPending,
    SlaWarning,
    SlaEscalation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentNotification {
    pub id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Uuid,
    /// Addressee; `None` targets the whole tenant.
    pub agent_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportErrorType {
    InvalidPhone,
    MissingPhone,
    Duplicate,
    ProcessingError,
}

impl ImportErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPhone => "invalid_phone",
            Self::MissingPhone => "missing_phone",
            Self::Duplicate => "duplicate",
            Self::ProcessingError => "processing_error",
        }
    }
}

/// Quarantine record for a listing-portal payload that failed processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalImportError {
    pub id: Uuid,
    pub company_id: Uuid,
    pub portal_name: String,
    pub lead_data: serde_json::Value,
    pub error_message: String,
    pub error_type: ImportErrorType,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One row per ingestion call, written independent of per-lead outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionLog {
    pub id: Uuid,
    pub company_id: Uuid,
    pub source: String,
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub errors: i64,
    pub payload_sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    RoundRobin,
    LoadAware,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateScope {
    /// Phone dedup only matches leads from the same source.
    PerSource,
    /// Phone dedup matches leads from any source within the tenant.
    CrossSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalIdMatch {
    Update,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    pub scope: DuplicateScope,
    pub window_days: i64,
    pub on_external_id_match: ExternalIdMatch,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            scope: DuplicateScope::PerSource,
            window_days: 30,
            on_external_id_match: ExternalIdMatch::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterHoursAction {
    /// Leave the lead pending until the next automatic or manual assignment.
    Queue,
    Assign,
}

/// ISO weekday numbers: 1 = Monday .. 7 = Sunday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub days: Vec<u32>,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 24,
            days: (1..=7).collect(),
        }
    }
}

impl WorkingHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.weekday().number_from_monday();
        let hour = at.hour();
        self.days.contains(&day) && hour >= self.start_hour && hour < self.end_hour
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaSettings {
    pub sla_enabled: bool,
    pub sla_notify_minutes: i64,
    pub escalation_enabled: bool,
    pub team_lead_after_minutes: i64,
    pub manager_after_minutes: i64,
}

impl Default for SlaSettings {
    fn default() -> Self {
        Self {
            sla_enabled: false,
            sla_notify_minutes: 30,
            escalation_enabled: false,
            team_lead_after_minutes: 60,
            manager_after_minutes: 120,
        }
    }
}

/// Stage directory entry consumed from the stage-owning subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Per-tenant configuration consumed read-only by the resolver, router, and
/// scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub company_id: Uuid,
    #[serde(default = "default_assignment_method")]
    pub default_assignment: AssignmentMethod,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub working_hours: WorkingHours,
    #[serde(default = "default_after_hours")]
    pub after_hours: AfterHoursAction,
    #[serde(default = "default_daily_cap")]
    pub max_assignments_per_day: i64,
    #[serde(default)]
    pub sla: SlaSettings,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageDef>,
}

fn default_assignment_method() -> AssignmentMethod {
    AssignmentMethod::RoundRobin
}

fn default_after_hours() -> AfterHoursAction {
    AfterHoursAction::Queue
}

fn default_daily_cap() -> i64 {
    100
}

fn default_stages() -> Vec<StageDef> {
    vec![
        StageDef {
            name: "New".to_string(),
            is_default: true,
        },
        StageDef {
            name: "Contacted".to_string(),
            is_default: false,
        },
        StageDef {
            name: "Qualified".to_string(),
            is_default: false,
        },
        StageDef {
            name: "Closed".to_string(),
            is_default: false,
        },
    ]
}

impl TenantSettings {
    pub fn for_company(company_id: Uuid) -> Self {
        Self {
            company_id,
            default_assignment: default_assignment_method(),
            duplicate_policy: DuplicatePolicy::default(),
            working_hours: WorkingHours::default(),
            after_hours: default_after_hours(),
            max_assignments_per_day: default_daily_cap(),
            sla: SlaSettings::default(),
            stages: default_stages(),
        }
    }

    pub fn default_stage(&self) -> &str {
        self.stages
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.stages.first())
            .map(|s| s.name.as_str())
            .unwrap_or("New")
    }

    pub fn within_working_hours(&self, at: DateTime<Utc>) -> bool {
        self.working_hours.contains(at)
    }
}
