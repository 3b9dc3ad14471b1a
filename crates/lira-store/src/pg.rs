//! Postgres-backed store.
//!
//! Concurrency safety lives here, in the persistence layer: the partial
//! unique index on (`company_id`, `source`, `external_id`) makes the upsert
//! idempotent under concurrent delivery, assignment mutations run inside a
//! transaction with `FOR UPDATE` row locks, and the rotation cursor advances
//! with a single `INSERT .. ON CONFLICT .. RETURNING` statement.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lira_core::{
    AgentLoad, AssignmentHistory, AssignmentNotification, AssignmentPriority,
    AutoReassignmentRule, CanonicalLeadInput, ChangeReason, DuplicatePolicy, DuplicateScope,
    EngineError, EngineResult, ImportErrorType, IngestionLog, Lead, NotificationType,
    PortalImportError, TenantSettings,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::{
    AgentStore, AssignmentRequest, AssignmentStore, LeadStore, NotificationStore, QuarantineStore,
    RuleStore, SchedulerStore, UpsertOutcome,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(map_db_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Dependency(e.to_string()))
    }

    async fn begin(&self) -> EngineResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(map_db_error)
    }
}

fn map_db_error(err: sqlx::Error) -> EngineError {
    EngineError::Dependency(err.to_string())
}

fn row_to_lead(row: &PgRow) -> Result<Lead, sqlx::Error> {
    let priority: String = row.try_get("assignment_priority")?;
    let metadata: serde_json::Value = row.try_get("source_metadata")?;
    Ok(Lead {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        external_id: row.try_get("external_id")?,
        normalized_phone: row.try_get("normalized_phone")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        source: row.try_get("source")?,
        stage: row.try_get("stage")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        assignment_priority: AssignmentPriority::parse(&priority).unwrap_or_default(),
        is_new: row.try_get("is_new")?,
        received_at: row.try_get("received_at")?,
        created_at: row.try_get("created_at")?,
        last_contacted_at: row.try_get("last_contacted_at")?,
        assigned_at: row.try_get("assigned_at")?,
        escalation_level: row.try_get("escalation_level")?,
        undoable_history_id: row.try_get("undoable_history_id")?,
        source_metadata: serde_json::from_value(metadata).unwrap_or_default(),
    })
}

fn row_to_agent_load(row: &PgRow) -> Result<AgentLoad, sqlx::Error> {
    Ok(AgentLoad {
        agent_id: row.try_get("agent_id")?,
        company_id: row.try_get("company_id")?,
        agent_name: row.try_get("agent_name")?,
        current_leads_count: row.try_get("current_leads_count")?,
        pending_followups_count: row.try_get("pending_followups_count")?,
        assignments_today: row.try_get("assignments_today")?,
        assignments_week: row.try_get("assignments_week")?,
        conversion_rate: row.try_get("conversion_rate")?,
        max_leads_capacity: row.try_get("max_leads_capacity")?,
        is_available: row.try_get("is_available")?,
        last_assignment_at: row.try_get("last_assignment_at")?,
    })
}

fn row_to_history(row: &PgRow) -> Result<AssignmentHistory, sqlx::Error> {
    let reason: String = row.try_get("change_reason")?;
    Ok(AssignmentHistory {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        company_id: row.try_get("company_id")?,
        old_agent_id: row.try_get("old_agent_id")?,
        new_agent_id: row.try_get("new_agent_id")?,
        change_reason: ChangeReason::parse(&reason).unwrap_or(ChangeReason::Manual),
        changed_by: row.try_get("changed_by")?,
        changed_at: row.try_get("changed_at")?,
    })
}

fn row_to_notification(row: &PgRow) -> Result<AssignmentNotification, sqlx::Error> {
    let kind: String = row.try_get("notification_type")?;
    Ok(AssignmentNotification {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        lead_id: row.try_get("lead_id")?,
        agent_id: row.try_get("agent_id")?,
        notification_type: parse_notification_type(&kind),
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_type_str(kind: NotificationType) -> &'static str {
    match kind {
        NotificationType::LeadAssigned => "lead_assigned",
        NotificationType::LeadReassigned => "lead_reassigned",
        NotificationType::AssignmentUndone => "assignment_undone",
        NotificationType::AssignmentPending => "assignment_pending",
        NotificationType::SlaWarning => "sla_warning",
        NotificationType::SlaEscalation => "sla_escalation",
    }
}

fn parse_notification_type(value: &str) -> NotificationType {
    match value {
        "lead_reassigned" => NotificationType::LeadReassigned,
        "assignment_undone" => NotificationType::AssignmentUndone,
        "assignment_pending" => NotificationType::AssignmentPending,
        "sla_warning" => NotificationType::SlaWarning,
        "sla_escalation" => NotificationType::SlaEscalation,
        _ => NotificationType::LeadAssigned,
    }
}

fn error_type_str(kind: ImportErrorType) -> &'static str {
    kind.as_str()
}

fn parse_error_type(value: &str) -> ImportErrorType {
    match value {
        "invalid_phone" => ImportErrorType::InvalidPhone,
        "missing_phone" => ImportErrorType::MissingPhone,
        "duplicate" => ImportErrorType::Duplicate,
        _ => ImportErrorType::ProcessingError,
    }
}

fn row_to_import_error(row: &PgRow) -> Result<PortalImportError, sqlx::Error> {
    let kind: String = row.try_get("error_type")?;
    Ok(PortalImportError {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        portal_name: row.try_get("portal_name")?,
        lead_data: row.try_get("lead_data")?,
        error_message: row.try_get("error_message")?,
        error_type: parse_error_type(&kind),
        resolved: row.try_get("resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        created_at: row.try_get("created_at")?,
    })
}

const LEAD_COLUMNS: &str = "id, company_id, external_id, normalized_phone, name, phone, email, \
     source, stage, assigned_agent_id, assignment_priority, is_new, received_at, created_at, \
     last_contacted_at, assigned_at, escalation_level, undoable_history_id, source_metadata";

async fn fetch_lead_for_update(
    tx: &mut Transaction<'static, Postgres>,
    lead_id: Uuid,
) -> EngineResult<Lead> {
    let row = sqlx::query(&format!(
        "SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1 FOR UPDATE"
    ))
    .bind(lead_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))?;
    row_to_lead(&row).map_err(map_db_error)
}

/// Lead owner + agent counters + history row + undo marker in one unit; the
/// caller owns the surrounding transaction.
async fn apply_assignment_tx(
    tx: &mut Transaction<'static, Postgres>,
    req: &AssignmentRequest,
) -> EngineResult<AssignmentHistory> {
    let lead = fetch_lead_for_update(tx, req.lead_id).await?;
    let old_agent = lead.assigned_agent_id;

    if let Some(expected) = req.expected_agent {
        if old_agent != expected {
            return Err(EngineError::Conflict(req.lead_id));
        }
    }

    if let Some(agent_id) = req.new_agent_id {
        let row = sqlx::query("SELECT company_id FROM agent_loads WHERE agent_id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?;
        let agent_company: Uuid = row.try_get("company_id").map_err(map_db_error)?;
        if agent_company != lead.company_id {
            return Err(EngineError::Validation(format!(
                "agent {agent_id} belongs to a different company"
            )));
        }
    }

    if let Some(old_id) = old_agent {
        sqlx::query(
            "UPDATE agent_loads \
                SET current_leads_count = GREATEST(current_leads_count - 1, 0) \
              WHERE agent_id = $1",
        )
        .bind(old_id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
    }
    if let Some(new_id) = req.new_agent_id {
        sqlx::query(
            "UPDATE agent_loads \
                SET current_leads_count = current_leads_count + 1, \
                    assignments_today = assignments_today + 1, \
                    assignments_week = assignments_week + 1, \
                    last_assignment_at = $2 \
              WHERE agent_id = $1",
        )
        .bind(new_id)
        .bind(req.now)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
    }

    let history = AssignmentHistory {
        id: Uuid::new_v4(),
        lead_id: req.lead_id,
        company_id: lead.company_id,
        old_agent_id: old_agent,
        new_agent_id: req.new_agent_id,
        change_reason: req.reason,
        changed_by: req.changed_by,
        changed_at: req.now,
    };
    sqlx::query(
        "INSERT INTO assignment_history \
            (id, lead_id, company_id, old_agent_id, new_agent_id, change_reason, changed_by, changed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(history.id)
    .bind(history.lead_id)
    .bind(history.company_id)
    .bind(history.old_agent_id)
    .bind(history.new_agent_id)
    .bind(history.change_reason.as_str())
    .bind(history.changed_by)
    .bind(history.changed_at)
    .execute(&mut **tx)
    .await
    .map_err(map_db_error)?;

    sqlx::query(
        "UPDATE leads \
            SET assigned_agent_id = $2, \
                assigned_at = CASE WHEN $2::uuid IS NULL THEN NULL ELSE $3 END, \
                escalation_level = 0, \
                undoable_history_id = CASE \
                    WHEN undoable_history_id IS NULL THEN $4::uuid \
                    ELSE NULL \
                END \
          WHERE id = $1",
    )
    .bind(req.lead_id)
    .bind(req.new_agent_id)
    .bind(req.now)
    .bind(history.id)
    .execute(&mut **tx)
    .await
    .map_err(map_db_error)?;

    Ok(history)
}

#[async_trait]
impl LeadStore for PgStore {
    async fn upsert_lead(
        &self,
        input: &CanonicalLeadInput,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<UpsertOutcome> {
        let mut tx = self.begin().await?;
        let policy = settings.duplicate_policy;
        let normalized_phone = input.normalized_phone();

        // Best-effort phone-window dedup for sources without a stable
        // external id. Not uniqueness-enforced; the partial unique index below
        // is the only hard guarantee.
        if input.external_id.is_none() && !normalized_phone.is_empty() {
            if let Some(existing) = phone_window_lookup(
                &mut tx,
                input.company_id,
                &input.source,
                &normalized_phone,
                &policy,
                now,
            )
            .await?
            {
                tx.commit().await.map_err(map_db_error)?;
                return Ok(UpsertOutcome::Skipped(existing));
            }
        }

        let lead_id = Uuid::new_v4();
        let received_at = match input.received_at {
            Some(at) if at <= now => at,
            _ => now,
        };
        let metadata =
            serde_json::to_value(&input.metadata).unwrap_or(serde_json::Value::Object(Default::default()));

        let inserted = sqlx::query(
            "INSERT INTO leads \
                (id, company_id, external_id, normalized_phone, name, phone, email, source, stage, \
                 assignment_priority, is_new, received_at, created_at, escalation_level, source_metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11, $12, 0, $13) \
             ON CONFLICT (company_id, source, external_id) WHERE external_id IS NOT NULL \
             DO NOTHING",
        )
        .bind(lead_id)
        .bind(input.company_id)
        .bind(&input.external_id)
        .bind(&normalized_phone)
        .bind(&input.name)
        .bind(&input.phone)
        .bind(&input.email)
        .bind(&input.source)
        .bind(settings.default_stage())
        .bind(AssignmentPriority::default().as_str())
        .bind(received_at)
        .bind(now)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        if inserted.rows_affected() > 0 {
            let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
                .bind(lead_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_db_error)?;
            let lead = row_to_lead(&row).map_err(map_db_error)?;
            tx.commit().await.map_err(map_db_error)?;
            return Ok(UpsertOutcome::Created(lead));
        }

        // Lost the race (or a replayed delivery): the unique index already
        // holds a row for this identity.
        let external_id = input
            .external_id
            .as_deref()
            .expect("conflict only possible with an external id");
        let row = sqlx::query(
            "SELECT id FROM leads WHERE company_id = $1 AND source = $2 AND external_id = $3",
        )
        .bind(input.company_id)
        .bind(&input.source)
        .bind(external_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let existing_id: Uuid = row.try_get("id").map_err(map_db_error)?;

        let outcome = match policy.on_external_id_match {
            lira_core::ExternalIdMatch::Update => {
                sqlx::query(
                    "UPDATE leads \
                        SET name = CASE WHEN $2 <> '' THEN $2 ELSE name END, \
                            phone = CASE WHEN $3 <> '' THEN $3 ELSE phone END, \
                            normalized_phone = CASE WHEN $3 <> '' THEN $4 ELSE normalized_phone END, \
                            email = CASE WHEN $5 <> '' THEN $5 ELSE email END, \
                            source_metadata = source_metadata || $6 \
                      WHERE id = $1",
                )
                .bind(existing_id)
                .bind(&input.name)
                .bind(&input.phone)
                .bind(&normalized_phone)
                .bind(&input.email)
                .bind(&metadata)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
                UpsertOutcome::Updated(existing_id)
            }
            lira_core::ExternalIdMatch::Skip => UpsertOutcome::Skipped(existing_id),
        };
        tx.commit().await.map_err(map_db_error)?;
        Ok(outcome)
    }

    async fn lead(&self, lead_id: Uuid) -> EngineResult<Lead> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("lead {lead_id}")))?;
        row_to_lead(&row).map_err(map_db_error)
    }

    async fn leads_for_company(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE company_id = $1 ORDER BY created_at DESC"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_lead(row).map_err(map_db_error))
            .collect()
    }

    async fn unassigned_leads(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads \
              WHERE company_id = $1 AND assigned_agent_id IS NULL \
              ORDER BY received_at"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_lead(row).map_err(map_db_error))
            .collect()
    }

    async fn find_by_external_id(
        &self,
        company_id: Uuid,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<Lead>> {
        let row = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads \
              WHERE company_id = $1 AND source = $2 AND external_id = $3"
        ))
        .bind(company_id)
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.map(|r| row_to_lead(&r).map_err(map_db_error)).transpose()
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
        let mut tx = self.begin().await?;
        let existing =
            phone_window_lookup(&mut tx, company_id, source, normalized_phone, policy, now)
                .await?;
        tx.commit().await.map_err(map_db_error)?;
        match existing {
            Some(id) => self.lead(id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn set_priority(
        &self,
        lead_id: Uuid,
        priority: AssignmentPriority,
    ) -> EngineResult<()> {
        let updated = sqlx::query("UPDATE leads SET assignment_priority = $2 WHERE id = $1")
            .bind(lead_id)
            .bind(priority.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("lead {lead_id}")));
        }
        Ok(())
    }

    async fn record_contact(&self, lead_id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        let updated = sqlx::query(
            "UPDATE leads SET last_contacted_at = $2, is_new = FALSE WHERE id = $1",
        )
        .bind(lead_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("lead {lead_id}")));
        }
        Ok(())
    }

    async fn append_ingestion_log(&self, log: IngestionLog) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO ingestion_logs \
                (id, company_id, source, processed, created, updated, skipped, errors, payload_sha256, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(log.id)
        .bind(log.company_id)
        .bind(&log.source)
        .bind(log.processed)
        .bind(log.created)
        .bind(log.updated)
        .bind(log.skipped)
        .bind(log.errors)
        .bind(&log.payload_sha256)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }
}

async fn phone_window_lookup(
    tx: &mut Transaction<'static, Postgres>,
    company_id: Uuid,
    source: &str,
    normalized_phone: &str,
    policy: &DuplicatePolicy,
    now: DateTime<Utc>,
) -> EngineResult<Option<Uuid>> {
    let window_start = now - Duration::days(policy.window_days);
    let row = match policy.scope {
        DuplicateScope::PerSource => {
            sqlx::query(
                "SELECT id FROM leads \
                  WHERE company_id = $1 AND normalized_phone = $2 AND source = $3 \
                    AND created_at >= $4 \
                  ORDER BY created_at DESC LIMIT 1",
            )
            .bind(company_id)
            .bind(normalized_phone)
            .bind(source)
            .bind(window_start)
            .fetch_optional(&mut **tx)
            .await
        }
        DuplicateScope::CrossSource => {
            sqlx::query(
                "SELECT id FROM leads \
                  WHERE company_id = $1 AND normalized_phone = $2 AND created_at >= $3 \
                  ORDER BY created_at DESC LIMIT 1",
            )
            .bind(company_id)
            .bind(normalized_phone)
            .bind(window_start)
            .fetch_optional(&mut **tx)
            .await
        }
    }
    .map_err(map_db_error)?;
    row.map(|r| r.try_get("id").map_err(map_db_error)).transpose()
}

#[async_trait]
impl AgentStore for PgStore {
    async fn register_agent(&self, load: AgentLoad) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO agent_loads \
                (agent_id, company_id, agent_name, current_leads_count, pending_followups_count, \
                 assignments_today, assignments_week, conversion_rate, max_leads_capacity, \
                 is_available, last_assignment_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (agent_id) DO UPDATE SET \
                agent_name = EXCLUDED.agent_name, \
                max_leads_capacity = EXCLUDED.max_leads_capacity, \
                is_available = EXCLUDED.is_available",
        )
        .bind(load.agent_id)
        .bind(load.company_id)
        .bind(&load.agent_name)
        .bind(load.current_leads_count)
        .bind(load.pending_followups_count)
        .bind(load.assignments_today)
        .bind(load.assignments_week)
        .bind(load.conversion_rate)
        .bind(load.max_leads_capacity)
        .bind(load.is_available)
        .bind(load.last_assignment_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn agent_load(&self, agent_id: Uuid) -> EngineResult<AgentLoad> {
        let row = sqlx::query("SELECT * FROM agent_loads WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?;
        row_to_agent_load(&row).map_err(map_db_error)
    }

    async fn available_agents(&self, company_id: Uuid) -> EngineResult<Vec<AgentLoad>> {
        let rows = sqlx::query(
            "SELECT * FROM agent_loads \
              WHERE company_id = $1 AND is_available \
              ORDER BY agent_id",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_agent_load(row).map_err(map_db_error))
            .collect()
    }

    async fn update_agent_availability(
        &self,
        agent_id: Uuid,
        is_available: bool,
    ) -> EngineResult<()> {
        let updated = sqlx::query("UPDATE agent_loads SET is_available = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(is_available)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for PgStore {
    async fn apply_assignment(&self, req: AssignmentRequest) -> EngineResult<AssignmentHistory> {
        let mut tx = self.begin().await?;
        match apply_assignment_tx(&mut tx, &req).await {
            Ok(history) => {
                tx.commit().await.map_err(map_db_error)?;
                Ok(history)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "assignment rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply_bulk_assignment(
        &self,
        lead_ids: &[Uuid],
        agent_id: Uuid,
        changed_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let mut tx = self.begin().await?;

        let agent_row =
            sqlx::query("SELECT company_id FROM agent_loads WHERE agent_id = $1 FOR UPDATE")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?
                .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))?;
        let agent_company: Uuid = agent_row.try_get("company_id").map_err(map_db_error)?;

        let rows = sqlx::query("SELECT id, company_id FROM leads WHERE id = ANY($1) FOR UPDATE")
            .bind(lead_ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let mut found = std::collections::HashMap::new();
        for row in &rows {
            let id: Uuid = row.try_get("id").map_err(map_db_error)?;
            let company: Uuid = row.try_get("company_id").map_err(map_db_error)?;
            found.insert(id, company);
        }
        let failing: Vec<String> = lead_ids
            .iter()
            .filter(|id| found.get(id).map(|c| *c != agent_company).unwrap_or(true))
            .map(Uuid::to_string)
            .collect();
        if !failing.is_empty() {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "bulk assignment rollback failed");
            }
            return Err(EngineError::Validation(format!(
                "bulk assignment rejected; failing leads: {}",
                failing.join(", ")
            )));
        }

        for lead_id in lead_ids {
            apply_assignment_tx(
                &mut tx,
                &AssignmentRequest {
                    lead_id: *lead_id,
                    new_agent_id: Some(agent_id),
                    reason: ChangeReason::Bulk,
                    changed_by,
                    expected_agent: None,
                    now,
                },
            )
            .await?;
        }

        tx.commit().await.map_err(map_db_error)?;
        Ok(lead_ids.len())
    }

    async fn next_rotation_index(&self, company_id: Uuid) -> EngineResult<u64> {
        // Single-statement atomic advance; correct across concurrent service
        // instances because the row update serializes on the tenant row.
        let row = sqlx::query(
            "INSERT INTO rotation_cursors (company_id, position) VALUES ($1, 1) \
             ON CONFLICT (company_id) \
             DO UPDATE SET position = rotation_cursors.position + 1 \
             RETURNING position - 1 AS position",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        let position: i64 = row.try_get("position").map_err(map_db_error)?;
        Ok(position.max(0) as u64)
    }

    async fn history_for_lead(&self, lead_id: Uuid) -> EngineResult<Vec<AssignmentHistory>> {
        let rows = sqlx::query(
            "SELECT * FROM assignment_history WHERE lead_id = $1 ORDER BY changed_at, id",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_history(row).map_err(map_db_error))
            .collect()
    }

    async fn history_row(&self, history_id: Uuid) -> EngineResult<AssignmentHistory> {
        let row = sqlx::query("SELECT * FROM assignment_history WHERE id = $1")
            .bind(history_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("assignment history {history_id}")))?;
        row_to_history(&row).map_err(map_db_error)
    }

    async fn set_escalation_level(&self, lead_id: Uuid, level: i16) -> EngineResult<bool> {
        let updated = sqlx::query(
            "UPDATE leads SET escalation_level = $2 WHERE id = $1 AND escalation_level < $2",
        )
        .bind(lead_id)
        .bind(level)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        if exists.is_none() {
            return Err(EngineError::NotFound(format!("lead {lead_id}")));
        }
        Ok(false)
    }

    async fn sla_candidates(&self, company_id: Uuid) -> EngineResult<Vec<Lead>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads \
              WHERE company_id = $1 AND assigned_agent_id IS NOT NULL \
                AND last_contacted_at IS NULL AND escalation_level < 3"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_lead(row).map_err(map_db_error))
            .collect()
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notification(&self, notification: AssignmentNotification) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO assignment_notifications \
                (id, company_id, lead_id, agent_id, notification_type, title, message, is_read, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(notification.id)
        .bind(notification.company_id)
        .bind(notification.lead_id)
        .bind(notification.agent_id)
        .bind(notification_type_str(notification.notification_type))
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn notifications_for_company(
        &self,
        company_id: Uuid,
    ) -> EngineResult<Vec<AssignmentNotification>> {
        let rows = sqlx::query(
            "SELECT * FROM assignment_notifications WHERE company_id = $1 ORDER BY created_at",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_notification(row).map_err(map_db_error))
            .collect()
    }

    async fn mark_read(&self, notification_id: Uuid) -> EngineResult<()> {
        let updated =
            sqlx::query("UPDATE assignment_notifications SET is_read = TRUE WHERE id = $1")
                .bind(notification_id)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!(
                "notification {notification_id}"
            )));
        }
        Ok(())
    }

    async fn mark_all_read(&self, company_id: Uuid) -> EngineResult<u64> {
        let updated = sqlx::query(
            "UPDATE assignment_notifications SET is_read = TRUE \
              WHERE company_id = $1 AND NOT is_read",
        )
        .bind(company_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(updated.rows_affected())
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn upsert_rule(&self, rule: AutoReassignmentRule) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO auto_reassignment_rules \
                (id, company_id, days_without_contact, use_round_robin, is_active, apply_to_stages) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
                days_without_contact = EXCLUDED.days_without_contact, \
                use_round_robin = EXCLUDED.use_round_robin, \
                is_active = EXCLUDED.is_active, \
                apply_to_stages = EXCLUDED.apply_to_stages",
        )
        .bind(rule.id)
        .bind(rule.company_id)
        .bind(rule.days_without_contact)
        .bind(rule.use_round_robin)
        .bind(rule.is_active)
        .bind(&rule.apply_to_stages)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn delete_rule(&self, rule_id: Uuid) -> EngineResult<()> {
        let deleted = sqlx::query("DELETE FROM auto_reassignment_rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        if deleted.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("rule {rule_id}")));
        }
        Ok(())
    }

    async fn rules_for_company(&self, company_id: Uuid) -> EngineResult<Vec<AutoReassignmentRule>> {
        let rows = sqlx::query(
            "SELECT * FROM auto_reassignment_rules WHERE company_id = $1 ORDER BY id",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| {
                Ok(AutoReassignmentRule {
                    id: row.try_get("id").map_err(map_db_error)?,
                    company_id: row.try_get("company_id").map_err(map_db_error)?,
                    days_without_contact: row
                        .try_get("days_without_contact")
                        .map_err(map_db_error)?,
                    use_round_robin: row.try_get("use_round_robin").map_err(map_db_error)?,
                    is_active: row.try_get("is_active").map_err(map_db_error)?,
                    apply_to_stages: row.try_get("apply_to_stages").map_err(map_db_error)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl QuarantineStore for PgStore {
    async fn insert_import_error(&self, error: PortalImportError) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO portal_import_errors \
                (id, company_id, portal_name, lead_data, error_message, error_type, resolved, \
                 resolved_at, resolved_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(error.id)
        .bind(error.company_id)
        .bind(&error.portal_name)
        .bind(&error.lead_data)
        .bind(&error.error_message)
        .bind(error_type_str(error.error_type))
        .bind(error.resolved)
        .bind(error.resolved_at)
        .bind(error.resolved_by)
        .bind(error.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn import_error(&self, error_id: Uuid) -> EngineResult<PortalImportError> {
        let row = sqlx::query("SELECT * FROM portal_import_errors WHERE id = $1")
            .bind(error_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("import error {error_id}")))?;
        row_to_import_error(&row).map_err(map_db_error)
    }

    async fn open_import_errors(&self, company_id: Uuid) -> EngineResult<Vec<PortalImportError>> {
        let rows = sqlx::query(
            "SELECT * FROM portal_import_errors \
              WHERE company_id = $1 AND NOT resolved \
              ORDER BY created_at",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row_to_import_error(row).map_err(map_db_error))
            .collect()
    }

    async fn resolve_import_error(
        &self,
        error_id: Uuid,
        resolved_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let updated = sqlx::query(
            "UPDATE portal_import_errors \
                SET resolved = TRUE, resolved_at = $2, resolved_by = $3 \
              WHERE id = $1",
        )
        .bind(error_id)
        .bind(at)
        .bind(resolved_by)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("import error {error_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for PgStore {
    async fn try_acquire_sweep_lease(
        &self,
        company_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let expires_at = now + ttl;
        let claimed = sqlx::query(
            "INSERT INTO sweep_leases (company_id, holder, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (company_id) DO UPDATE SET \
                holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
             WHERE sweep_leases.expires_at < $4 OR sweep_leases.holder = EXCLUDED.holder",
        )
        .bind(company_id)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(claimed.rows_affected() > 0)
    }

    async fn release_sweep_lease(&self, company_id: Uuid, holder: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM sweep_leases WHERE company_id = $1 AND holder = $2")
            .bind(company_id)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }
}
