//! Store contracts for the lead engine + the in-memory implementation.
//!
//! Every mutation that must be atomic under concurrent delivery is a single
//! store operation: the idempotent lead upsert, the assignment write (lead
//! owner + agent counters + history row together), the rotation-cursor
//! advance, and the sweep lease. `MemoryStore` honors the contract with one
//! lock; [`pg::PgStore`] honors it with transactions and row locks.

pub mod pg;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lira_core::{
    AgentLoad, AssignmentHistory, AssignmentNotification, AutoReassignmentRule,
    CanonicalLeadInput, ChangeReason, DuplicatePolicy, DuplicateScope, EngineError, EngineResult,
    IngestionLog, Lead, PortalImportError, TenantSettings,
};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lira-store";

/// Result of the idempotent upsert: exactly one stored row per identity, with
/// the loser of a concurrent race converted into `Updated`/`Skipped`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Lead),
    Updated(Uuid),
    Skipped(Uuid),
}

impl UpsertOutcome {
    pub fn lead_id(&self) -> Uuid {
        match self {
            Self::Created(lead) => lead.id,
            Self::Updated(id) | Self::Skipped(id) => *id,
        }
    }
}

/// One atomic ownership change.
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    pub lead_id: Uuid,
    pub new_agent_id: Option<Uuid>,
    pub reason: ChangeReason,
    pub changed_by: Option<Uuid>,
    /// Ownership guard: when set, the write aborts with `Conflict` unless the
    /// lead's current owner still matches.
    pub expected_agent: Option<Option<Uuid>>,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Atomic create-or-update-or-skip keyed on (`company_id`, `source`,
    /// `external_id`) with a best-effort normalized-phone window check for
    /// sources without a stable external id. Future provider timestamps are
    /// clamped to `now`.
    async fn upsert_lead(
        &self,
        input: &CanonicalLeadInput,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<UpsertOutcome>;

    async fn lead(&self, lead_id: Uuid) -> EngineResult<Lead>;

    async fn leads_for_company(&self, company_id: Uuid) -> EngineResult<Vec<Lead>>;

    /// The visible "pending assignment" queue.
    async fn unassigned_leads(&self, company_id: Uuid) -> EngineResult<Vec<Lead>>;

    async fn find_by_external_id(
        &self,
        company_id: Uuid,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<Lead>>;

    /// Best-effort duplicate-window lookup on the normalized phone; scope and
    /// window come from the tenant policy.
    async fn find_recent_by_phone(
        &self,
        company_id: Uuid,
        source: &str,
        normalized_phone: &str,
        policy: &DuplicatePolicy,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Lead>>;

    async fn set_priority(
        &self,
        lead_id: Uuid,
        priority: lira_core::AssignmentPriority,
    ) -> EngineResult<()>;

    async fn record_contact(&self, lead_id: Uuid, at: DateTime<Utc>) -> EngineResult<()>;

    async fn append_ingestion_log(&self, log: IngestionLog) -> EngineResult<()>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn register_agent(&self, load: AgentLoad) -> EngineResult<()>;

    async fn agent_load(&self, agent_id: Uuid) -> EngineResult<AgentLoad>;

    /// Available agents for a tenant, ordered by agent id (the round-robin
    /// rotation order).
    async fn available_agents(&self, company_id: Uuid) -> EngineResult<Vec<AgentLoad>>;

    async fn update_agent_availability(
        &self,
        agent_id: Uuid,
        is_available: bool,
    ) -> EngineResult<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// The single atomic unit behind every ownership change: guard check,
    /// tenant check, lead owner update, old/new counter updates, history
    /// append, undo-marker maintenance, SLA reset.
    async fn apply_assignment(&self, req: AssignmentRequest) -> EngineResult<AssignmentHistory>;

    /// All-or-nothing batch; failing lead ids are reported in the error and
    /// nothing is applied.
    async fn apply_bulk_assignment(
        &self,
        lead_ids: &[Uuid],
        agent_id: Uuid,
        changed_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> EngineResult<usize>;

    /// Persisted per-tenant rotation counter; each call returns the current
    /// position and advances exactly one step.
    async fn next_rotation_index(&self, company_id: Uuid) -> EngineResult<u64>;

    async fn history_for_lead(&self, lead_id: Uuid) -> EngineResult<Vec<AssignmentHistory>>;

    async fn history_row(&self, history_id: Uuid) -> EngineResult<AssignmentHistory>;

    /// Compare-and-set escalation counter; `false` when the stored level is
    /// already at or past `level`, which is what makes escalations fire at
    /// most once per assignment lifecycle.
    async fn set_escalation_level(&self, lead_id: Uuid, level: i16) -> EngineResult<bool>;

    /// Assigned, uncontacted leads that may still owe an SLA notification.
    async fn sla_candidates(&self, company_id: Uuid) -> EngineResult<Vec<Lead>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: AssignmentNotification) -> EngineResult<()>;

    async fn notifications_for_company(
        &self,
        company_id: Uuid,
    ) -> EngineResult<Vec<AssignmentNotification>>;

    async fn mark_read(&self, notification_id: Uuid) -> EngineResult<()>;

    async fn mark_all_read(&self, company_id: Uuid) -> EngineResult<u64>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn upsert_rule(&self, rule: AutoReassignmentRule) -> EngineResult<()>;

    async fn delete_rule(&self, rule_id: Uuid) -> EngineResult<()>;

    async fn rules_for_company(&self, company_id: Uuid) -> EngineResult<Vec<AutoReassignmentRule>>;
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
    async fn insert_import_error(&self, error: PortalImportError) -> EngineResult<()>;

    async fn import_error(&self, error_id: Uuid) -> EngineResult<PortalImportError>;

    async fn open_import_errors(&self, company_id: Uuid) -> EngineResult<Vec<PortalImportError>>;

    async fn resolve_import_error(
        &self,
        error_id: Uuid,
        resolved_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;
}

#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Per-tenant sweep lease; at most one holder until the lease expires.
    /// Re-acquisition by the current holder extends the lease.
    async fn try_acquire_sweep_lease(
        &self,
        company_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    async fn release_sweep_lease(&self, company_id: Uuid, holder: &str) -> EngineResult<()>;
}

pub trait Store:
    LeadStore
    + AgentStore
    + AssignmentStore
    + NotificationStore
    + RuleStore
    + QuarantineStore
    + SchedulerStore
{
}

impl<T> Store for T where
    T: LeadStore
        + AgentStore
        + AssignmentStore
        + NotificationStore
        + RuleStore
        + QuarantineStore
        + SchedulerStore
{
}

#[derive(Default)]
struct Inner {
    leads: HashMap<Uuid, Lead>,
    agents: HashMap<Uuid, AgentLoad>,
    history: Vec<AssignmentHistory>,
    cursors: HashMap<Uuid, u64>,
    notifications: Vec<AssignmentNotification>,
    rules: HashMap<Uuid, AutoReassignmentRule>,
    import_errors: HashMap<Uuid, PortalImportError>,
    ingestion_logs: Vec<IngestionLog>,
    leases: HashMap<Uuid, (String, DateTime<Utc>)>,
}

/// In-memory store. One mutex guards the whole state, so every trait
/// operation is a single critical section and the atomicity contract matches
/// the Postgres implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingestion_logs(&self) -> Vec<IngestionLog> {
        self.inner.lock().await.ingestion_logs.clone()
    }
}

fn clamp_received_at(
    provided: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match provided {
        Some(at) if at <= now => at,
        // Future or missing timestamps from untrusted or replayed payloads
        // are substituted with ingestion time.
        _ => now,
    }
}

fn new_lead(input: &CanonicalLeadInput, settings: &TenantSettings, now: DateTime<Utc>) -> Lead {
    Lead {
        id: Uuid::new_v4(),
        company_id: input.company_id,
        external_id: input.external_id.clone(),
        normalized_phone: input.normalized_phone(),
        name: input.name.clone(),
        phone: input.phone.clone(),
        email: input.email.clone(),
        source: input.source.clone(),
        stage: settings.default_stage().to_string(),
        assigned_agent_id: None,
        assignment_priority: lira_core::AssignmentPriority::default(),
        is_new: true,
        received_at: clamp_received_at(input.received_at, now),
        created_at: now,
        last_contacted_at: None,
        assigned_at: None,
        escalation_level: 0,
        undoable_history_id: None,
        source_metadata: input.metadata.clone(),
    }
}

fn refresh_lead(lead: &mut Lead, input: &CanonicalLeadInput) {
    if !input.name.is_empty() {
        lead.name = input.name.clone();
    }
    if !input.phone.is_empty() {
        lead.phone = input.phone.clone();
        lead.normalized_phone = input.normalized_phone();
    }
    if !input.email.is_empty() {
        lead.email = input.email.clone();
    }
    for (key, value) in &input.metadata {
        lead.source_metadata.insert(key.clone(), value.clone());
    }
}

fn phone_window_match(
    lead: &Lead,
    source: &str,
    normalized_phone: &str,
    policy: &DuplicatePolicy,
    now: DateTime<Utc>,
) -> bool {
    if lead.normalized_phone.is_empty() || lead.normalized_phone != normalized_phone {
        return false;
    }
    if policy.scope == DuplicateScope::PerSource && lead.source != source {
        return false;
    }
    now - lead.created_at <= Duration::days(policy.window_days)
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn upsert_lead(
        &self,
        input: &CanonicalLeadInput,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<UpsertOutcome> {
        let mut inner = self.inner.lock().await;
        let policy = settings.duplicate_policy;

        if let Some(external_id) = input.external_id.as_deref() {
            let existing = inner
                .leads
                .values()
                .find(|l| {
                    l.company_id == input.company_id
                        && l.source == input.source
                        && l.external_id.as_deref() == Some(external_id)
                })
                .map(|l| l.id);
            if let Some(id) = existing {
                return Ok(match policy.on_external_id_match {
                    lira_core::ExternalIdMatch::Update => {
                        let lead = inner.leads.get_mut(&id).expect("existing lead");
                        refresh_lead(lead, input);
                        UpsertOutcome::Updated(id)
                    }
                    lira_core::ExternalIdMatch::Skip => UpsertOutcome::Skipped(id),
                });
            }
        } else {
            let key = input.normalized_phone();
            if !key.is_empty() {
                if let Some(id) = inner
                    .leads
                    .values()
                    .find(|l| {
                        l.company_id == input.company_id
                            && phone_window_match(l, &input.source, &key, &policy, now)
                    })
                    .map(|l| l.id)
                {
                    return Ok(UpsertOutcome::Skipped(id));
                }
            }
        }

        let lead = new_lead(input, settings, now);
        inner.leads.insert(lead.id, lead.clone());
        Ok(UpsertOutcome::Created(lead))
    }

    async fn lead(&self, lead_id: Uuid) -> EngineResult<Lead> {
        self.inner
            .lock()
            .await
            .leads
            .get(&lead_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))
    }

    async fn leads_for_company(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let inner = self.inner.lock().await;
        let mut leads: Vec<Lead> = inner
            .leads
            .values()
            .filter(|l| l.company_id == company_id)
            .cloned()
            .collect();
        leads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(leads)
    }

    async fn unassigned_leads(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let inner = self.inner.lock().await;
        let mut leads: Vec<Lead> = inner
            .leads
            .values()
            .filter(|l| l.company_id == company_id && l.assigned_agent_id.is_none())
            .cloned()
            .collect();
        leads.sort_by_key(|l| l.received_at);
        Ok(leads)
    }

    async fn find_by_external_id(
        &self,
        company_id: Uuid,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<Lead>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leads
            .values()
            .find(|l| {
                l.company_id == company_id
                    && l.source == source
                    && l.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn find_recent_by_phone(
        &self,
        company_id: Uuid,
        source: &str,
        normalized_phone: &str,
        policy: &DuplicatePolicy,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Lead>> {
        if normalized_phone.is_empty() {
            return Ok(None);
        }
        let inner = self.inner.lock().await;
        let mut matches: Vec<&Lead> = inner
            .leads
            .values()
            .filter(|l| {
                l.company_id == company_id
                    && phone_window_match(l, source, normalized_phone, policy, now)
            })
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches.first().map(|l| (*l).clone()))
    }

    async fn set_priority(
        &self,
        lead_id: Uuid,
        priority: lira_core::AssignmentPriority,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let lead = inner
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))?;
        lead.assignment_priority = priority;
        Ok(())
    }

    async fn record_contact(&self, lead_id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let lead = inner
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))?;
        lead.last_contacted_at = Some(at);
        lead.is_new = false;
        Ok(())
    }

    async fn append_ingestion_log(&self, log: IngestionLog) -> EngineResult<()> {
        self.inner.lock().await.ingestion_logs.push(log);
        Ok(())
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn register_agent(&self, load: AgentLoad) -> EngineResult<()> {
        self.inner.lock().await.agents.insert(load.agent_id, load);
        Ok(())
    }

    async fn agent_load(&self, agent_id: Uuid) -> EngineResult<AgentLoad> {
        self.inner
            .lock()
            .await
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))
    }

    async fn available_agents(&self, company_id: Uuid) -> EngineResult<Vec<AgentLoad>> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<AgentLoad> = inner
            .agents
            .values()
            .filter(|a| a.company_id == company_id && a.is_available)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.agent_id);
        Ok(agents)
    }

    async fn update_agent_availability(
        &self,
        agent_id: Uuid,
        is_available: bool,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?;
        agent.is_available = is_available;
        Ok(())
    }
}

fn apply_assignment_locked(
    inner: &mut Inner,
    req: &AssignmentRequest,
) -> EngineResult<AssignmentHistory> {
    let lead = inner
        .leads
        .get(&req.lead_id)
        .ok_or_else(|| EngineError::NotFound(format!("lead {}", req.lead_id)))?;
    let company_id = lead.company_id;
    let old_agent = lead.assigned_agent_id;

    if let Some(expected) = req.expected_agent {
        if old_agent != expected {
            return Err(EngineError::Conflict(req.lead_id));
        }
    }

    if let Some(agent_id) = req.new_agent_id {
        let agent = inner
            .agents
            .get(&agent_id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?;
        if agent.company_id != company_id {
            return Err(EngineError::Validation(format!(
                "agent {agent_id} belongs to a different company"
            )));
        }
    }

    if let Some(old_id) = old_agent {
        if let Some(agent) = inner.agents.get_mut(&old_id) {
            agent.current_leads_count = (agent.current_leads_count - 1).max(0);
        }
    }
    if let Some(new_id) = req.new_agent_id {
        let agent = inner.agents.get_mut(&new_id).expect("agent checked above");
        agent.current_leads_count += 1;
        agent.assignments_today += 1;
        agent.assignments_week += 1;
        agent.last_assignment_at = Some(req.now);
    }

    let row = AssignmentHistory {
        id: Uuid::new_v4(),
        lead_id: req.lead_id,
        company_id,
        old_agent_id: old_agent,
        new_agent_id: req.new_agent_id,
        change_reason: req.reason,
        changed_by: req.changed_by,
        changed_at: req.now,
    };

    let lead = inner.leads.get_mut(&req.lead_id).expect("lead checked above");
    lead.assigned_agent_id = req.new_agent_id;
    lead.assigned_at = req.new_agent_id.map(|_| req.now);
    lead.escalation_level = 0;
    // A fresh assignment becomes undoable; a superseding one consumes the
    // pending marker instead, which is what bounds undo to one step back.
    lead.undoable_history_id = match lead.undoable_history_id {
        None => Some(row.id),
        Some(_) => None,
    };

    inner.history.push(row.clone());
    Ok(row)
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn apply_assignment(&self, req: AssignmentRequest) -> EngineResult<AssignmentHistory> {
        let mut inner = self.inner.lock().await;
        apply_assignment_locked(&mut inner, &req)
    }

    async fn apply_bulk_assignment(
        &self,
        lead_ids: &[Uuid],
        agent_id: Uuid,
        changed_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let mut inner = self.inner.lock().await;

        let agent = inner
            .agents
            .get(&agent_id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?
            .clone();
        let failing: Vec<Uuid> = lead_ids
            .iter()
            .copied()
            .filter(|id| {
                inner
                    .leads
                    .get(id)
                    .map(|l| l.company_id != agent.company_id)
                    .unwrap_or(true)
            })
            .collect();
        if !failing.is_empty() {
            let listed = failing
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::Validation(format!(
                "bulk assignment rejected; failing leads: {listed}"
            )));
        }

        for lead_id in lead_ids {
            apply_assignment_locked(
                &mut inner,
                &AssignmentRequest {
                    lead_id: *lead_id,
                    new_agent_id: Some(agent_id),
                    reason: ChangeReason::Bulk,
                    changed_by,
                    expected_agent: None,
                    now,
                },
            )?;
        }
        Ok(lead_ids.len())
    }

    async fn next_rotation_index(&self, company_id: Uuid) -> EngineResult<u64> {
        let mut inner = self.inner.lock().await;
        let cursor = inner.cursors.entry(company_id).or_insert(0);
        let position = *cursor;
        *cursor += 1;
        Ok(position)
    }

    async fn history_for_lead(&self, lead_id: Uuid) -> EngineResult<Vec<AssignmentHistory>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .history
            .iter()
            .filter(|h| h.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn history_row(&self, history_id: Uuid) -> EngineResult<AssignmentHistory> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .find(|h| h.id == history_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("assignment history {history_id}")))
    }

    async fn set_escalation_level(&self, lead_id: Uuid, level: i16) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        let lead = inner
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))?;
        if lead.escalation_level >= level {
            return Ok(false);
        }
        lead.escalation_level = level;
        Ok(true)
    }

    async fn sla_candidates(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leads
            .values()
            .filter(|l| {
                l.company_id == company_id
                    && l.assigned_agent_id.is_some()
                    && l.last_contacted_at.is_none()
                    && l.escalation_level < 3
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notification(&self, notification: AssignmentNotification) -> EngineResult<()> {
        self.inner.lock().await.notifications.push(notification);
        Ok(())
    }

    async fn notifications_for_company(
        &self,
        company_id: Uuid,
    ) -> EngineResult<Vec<AssignmentNotification>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .iter()
            .filter(|n| n.company_id == company_id)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, notification_id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let notification = inner
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| EngineError::NotFound(format!("notification {notification_id}")))?;
        notification.is_read = true;
        Ok(())
    }

    async fn mark_all_read(&self, company_id: Uuid) -> EngineResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for notification in inner
            .notifications
            .iter_mut()
            .filter(|n| n.company_id == company_id && !n.is_read)
        {
            notification.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn upsert_rule(&self, rule: AutoReassignmentRule) -> EngineResult<()> {
        self.inner.lock().await.rules.insert(rule.id, rule);
        Ok(())
    }

    async fn delete_rule(&self, rule_id: Uuid) -> EngineResult<()> {
        self.inner
            .lock()
            .await
            .rules
            .remove(&rule_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("rule {rule_id}")))
    }

    async fn rules_for_company(&self, company_id: Uuid) -> EngineResult<Vec<AutoReassignmentRule>> {
        let inner = self.inner.lock().await;
        let mut rules: Vec<AutoReassignmentRule> = inner
            .rules
            .values()
            .filter(|r| r.company_id == company_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }
}

#[async_trait]
impl QuarantineStore for MemoryStore {
    async fn insert_import_error(&self, error: PortalImportError) -> EngineResult<()> {
        self.inner.lock().await.import_errors.insert(error.id, error);
        Ok(())
    }

    async fn import_error(&self, error_id: Uuid) -> EngineResult<PortalImportError> {
        self.inner
            .lock()
            .await
            .import_errors
            .get(&error_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("import error {error_id}")))
    }

    async fn open_import_errors(&self, company_id: Uuid) -> EngineResult<Vec<PortalImportError>> {
        let inner = self.inner.lock().await;
        let mut errors: Vec<PortalImportError> = inner
            .import_errors
            .values()
            .filter(|e| e.company_id == company_id && !e.resolved)
            .cloned()
            .collect();
        errors.sort_by_key(|e| e.created_at);
        Ok(errors)
    }

    async fn resolve_import_error(
        &self,
        error_id: Uuid,
        resolved_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let error = inner
            .import_errors
            .get_mut(&error_id)
            .ok_or_else(|| EngineError::NotFound(format!("import error {error_id}")))?;
        error.resolved = true;
        error.resolved_at = Some(at);
        error.resolved_by = resolved_by;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn try_acquire_sweep_lease(
        &self,
        company_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get(&company_id) {
            Some((current, expires)) if *expires > now && current != holder => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(company_id, (holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_sweep_lease(&self, company_id: Uuid, holder: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some((current, _)) = inner.leases.get(&company_id) {
            if current == holder {
                inner.leases.remove(&company_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lira_core::{AssignmentPriority, ExternalIdMatch};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap()
    }

    fn settings(company_id: Uuid) -> TenantSettings {
        TenantSettings::for_company(company_id)
    }

    fn input_with_external(company_id: Uuid, external_id: &str) -> CanonicalLeadInput {
        let mut input = CanonicalLeadInput::empty(company_id, "ad-form");
        input.external_id = Some(external_id.to_string());
        input.name = "Fatima Hassan".to_string();
        input.phone = "+971 50-123 4567".to_string();
        input.email = "fatima@example.com".to_string();
        input
    }

    fn agent(company_id: Uuid, capacity: i64) -> AgentLoad {
        AgentLoad {
            agent_id: Uuid::new_v4(),
            company_id,
            agent_name: "Agent".to_string(),
            current_leads_count: 0,
            pending_followups_count: 0,
            assignments_today: 0,
            assignments_week: 0,
            conversion_rate: 0.0,
            max_leads_capacity: capacity,
            is_available: true,
            last_assignment_at: None,
        }
    }

    #[tokio::test]
    async fn identical_payload_twice_yields_one_lead() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let input = input_with_external(company, "ext-1");

        let first = store.upsert_lead(&input, &settings(company), now()).await.unwrap();
        let second = store.upsert_lead(&input, &settings(company), now()).await.unwrap();

        let lead_id = match first {
            UpsertOutcome::Created(ref lead) => lead.id,
            _ => panic!("first delivery must create"),
        };
        assert_eq!(second, UpsertOutcome::Updated(lead_id));
        assert_eq!(store.leads_for_company(company).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_id_skip_policy_reports_skipped() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let mut tenant = settings(company);
        tenant.duplicate_policy.on_external_id_match = ExternalIdMatch::Skip;
        let input = input_with_external(company, "ext-2");

        store.upsert_lead(&input, &tenant, now()).await.unwrap();
        let second = store.upsert_lead(&input, &tenant, now()).await.unwrap();
        assert!(matches!(second, UpsertOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn phone_window_skips_duplicates_without_external_id() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let tenant = settings(company);

        let mut first = CanonicalLeadInput::empty(company, "web-form");
        first.phone = "+971 50-123 4567".to_string();
        let mut second = CanonicalLeadInput::empty(company, "web-form");
        second.phone = "00971501234567".to_string();

        let created = store.upsert_lead(&first, &tenant, now()).await.unwrap();
        let skipped = store.upsert_lead(&second, &tenant, now()).await.unwrap();
        assert!(matches!(created, UpsertOutcome::Created(_)));
        assert_eq!(skipped, UpsertOutcome::Skipped(created.lead_id()));
    }

    #[tokio::test]
    async fn per_source_scope_allows_same_phone_from_other_source() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let tenant = settings(company);
        assert_eq!(
            tenant.duplicate_policy.scope,
            lira_core::DuplicateScope::PerSource
        );

        let mut web = CanonicalLeadInput::empty(company, "web-form");
        web.phone = "971501234567".to_string();
        let mut chat = CanonicalLeadInput::empty(company, "chat");
        chat.phone = "971501234567".to_string();

        store.upsert_lead(&web, &tenant, now()).await.unwrap();
        let outcome = store.upsert_lead(&chat, &tenant, now()).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Created(_)));

        let mut cross = settings(company);
        cross.duplicate_policy.scope = lira_core::DuplicateScope::CrossSource;
        let mut portal = CanonicalLeadInput::empty(company, "portal-brightbricks");
        portal.phone = "971501234567".to_string();
        let outcome = store.upsert_lead(&portal, &cross, now()).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn future_received_at_is_clamped_to_ingestion_time() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let mut input = input_with_external(company, "ext-future");
        input.received_at = Some(now() + Duration::days(365));

        let outcome = store.upsert_lead(&input, &settings(company), now()).await.unwrap();
        let UpsertOutcome::Created(lead) = outcome else {
            panic!("expected creation");
        };
        assert!(lead.received_at <= now());
    }

    #[tokio::test]
    async fn assignment_updates_counters_history_and_undo_marker() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let a = agent(company, 10);
        let b = agent(company, 10);
        store.register_agent(a.clone()).await.unwrap();
        store.register_agent(b.clone()).await.unwrap();

        let input = input_with_external(company, "ext-3");
        let lead = match store.upsert_lead(&input, &settings(company), now()).await.unwrap() {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };

        let row1 = store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(a.agent_id),
                reason: ChangeReason::Manual,
                changed_by: None,
                expected_agent: None,
                now: now(),
            })
            .await
            .unwrap();
        let stored = store.lead(lead.id).await.unwrap();
        assert_eq!(stored.assigned_agent_id, Some(a.agent_id));
        assert_eq!(stored.undoable_history_id, Some(row1.id));
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().current_leads_count, 1);
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().assignments_today, 1);

        // Second assignment moves the count and consumes the undo marker.
        store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(b.agent_id),
                reason: ChangeReason::Manual,
                changed_by: None,
                expected_agent: None,
                now: now(),
            })
            .await
            .unwrap();
        let stored = store.lead(lead.id).await.unwrap();
        assert_eq!(stored.assigned_agent_id, Some(b.agent_id));
        assert_eq!(stored.undoable_history_id, None);
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().current_leads_count, 0);
        assert_eq!(store.agent_load(b.agent_id).await.unwrap().current_leads_count, 1);
        assert_eq!(store.history_for_lead(lead.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ownership_guard_rejects_stale_writes() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let a = agent(company, 10);
        let b = agent(company, 10);
        store.register_agent(a.clone()).await.unwrap();
        store.register_agent(b.clone()).await.unwrap();

        let input = input_with_external(company, "ext-4");
        let lead = match store.upsert_lead(&input, &settings(company), now()).await.unwrap() {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };
        store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(a.agent_id),
                reason: ChangeReason::Manual,
                changed_by: None,
                expected_agent: Some(None),
                now: now(),
            })
            .await
            .unwrap();

        // The sweep read the lead while it was unassigned; ownership changed.
        let stale = store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(b.agent_id),
                reason: ChangeReason::AutoReassign,
                changed_by: None,
                expected_agent: Some(None),
                now: now(),
            })
            .await;
        assert!(matches!(stale, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn cross_company_agent_is_rejected() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let other = agent(Uuid::new_v4(), 10);
        store.register_agent(other.clone()).await.unwrap();

        let input = input_with_external(company, "ext-5");
        let lead = match store.upsert_lead(&input, &settings(company), now()).await.unwrap() {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };
        let result = store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(other.agent_id),
                reason: ChangeReason::Manual,
                changed_by: None,
                expected_agent: None,
                now: now(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn bulk_assignment_is_all_or_nothing() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let a = agent(company, 10);
        store.register_agent(a.clone()).await.unwrap();

        let lead = match store
            .upsert_lead(&input_with_external(company, "ext-6"), &settings(company), now())
            .await
            .unwrap()
        {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };
        let missing = Uuid::new_v4();

        let result = store
            .apply_bulk_assignment(&[lead.id, missing], a.agent_id, None, now())
            .await;
        let Err(EngineError::Validation(message)) = result else {
            panic!("bulk with a missing lead must fail");
        };
        assert!(message.contains(&missing.to_string()));
        // Nothing applied.
        assert_eq!(store.lead(lead.id).await.unwrap().assigned_agent_id, None);
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().current_leads_count, 0);

        let count = store
            .apply_bulk_assignment(&[lead.id], a.agent_id, None, now())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().current_leads_count, 1);
    }

    #[tokio::test]
    async fn rotation_cursor_advances_one_position_per_call() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        for expected in 0..5u64 {
            assert_eq!(store.next_rotation_index(company).await.unwrap(), expected);
        }
        // Independent per tenant.
        assert_eq!(store.next_rotation_index(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn escalation_level_sets_at_most_once_per_level() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let lead = match store
            .upsert_lead(&input_with_external(company, "ext-7"), &settings(company), now())
            .await
            .unwrap()
        {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };

        assert!(store.set_escalation_level(lead.id, 1).await.unwrap());
        assert!(!store.set_escalation_level(lead.id, 1).await.unwrap());
        assert!(store.set_escalation_level(lead.id, 2).await.unwrap());
        assert!(!store.set_escalation_level(lead.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let ttl = Duration::minutes(5);

        assert!(store
            .try_acquire_sweep_lease(company, "sweeper-a", ttl, now())
            .await
            .unwrap());
        assert!(!store
            .try_acquire_sweep_lease(company, "sweeper-b", ttl, now())
            .await
            .unwrap());
        // Same holder may extend.
        assert!(store
            .try_acquire_sweep_lease(company, "sweeper-a", ttl, now())
            .await
            .unwrap());
        // Expired lease is claimable.
        assert!(store
            .try_acquire_sweep_lease(company, "sweeper-b", ttl, now() + Duration::minutes(10))
            .await
            .unwrap());

        store.release_sweep_lease(company, "sweeper-b").await.unwrap();
        assert!(store
            .try_acquire_sweep_lease(company, "sweeper-c", ttl, now() + Duration::minutes(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn priority_update_leaves_counters_alone() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let a = agent(company, 10);
        store.register_agent(a.clone()).await.unwrap();
        let lead = match store
            .upsert_lead(&input_with_external(company, "ext-8"), &settings(company), now())
            .await
            .unwrap()
        {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };

        store
            .set_priority(lead.id, AssignmentPriority::Urgent)
            .await
            .unwrap();
        let stored = store.lead(lead.id).await.unwrap();
        assert_eq!(stored.assignment_priority, AssignmentPriority::Urgent);
        assert_eq!(store.agent_load(a.agent_id).await.unwrap().current_leads_count, 0);
    }
}
