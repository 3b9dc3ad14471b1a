//! Assignment routing policies + notification/escalation fanout.

pub mod fanout;

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use lira_core::{
    AssignmentHistory, AssignmentMethod, AssignmentPriority, ChangeReason, EngineError,
    EngineResult, TenantSettings,
};
use lira_store::{AgentStore, AssignmentRequest, AssignmentStore, LeadStore, Store};
use tracing::{info, warn};
use uuid::Uuid;

pub use fanout::{LeadEvent, NotificationFanout};

pub const CRATE_NAME: &str = "lira-routing";

/// Routing front door. Policy selection lives here; every mutation goes
/// through the store's atomic assignment operation.
pub struct AssignmentRouter {
    store: Arc<dyn Store>,
    fanout: NotificationFanout,
}

impl AssignmentRouter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let fanout = NotificationFanout::new(store.clone());
        Self { store, fanout }
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.fanout
    }

    /// Assign a lead to a specific agent. A lost concurrent race is retried
    /// once internally before surfacing as `Conflict`.
    pub async fn assign_lead(
        &self,
        lead_id: Uuid,
        agent_id: Uuid,
        reason: ChangeReason,
        changed_by: Option<Uuid>,
    ) -> EngineResult<AssignmentHistory> {
        let mut retried = false;
        loop {
            let result = self
                .store
                .apply_assignment(AssignmentRequest {
                    lead_id,
                    new_agent_id: Some(agent_id),
                    reason,
                    changed_by,
                    expected_agent: None,
                    now: Utc::now(),
                })
                .await;
            match result {
                Ok(history) => {
                    self.fanout.record_assignment(&history).await?;
                    return Ok(history);
                }
                Err(EngineError::Conflict(_)) if !retried => {
                    warn!(%lead_id, "assignment race lost, retrying once");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Guarded variant used by the reassignment sweep: aborts with `Conflict`
    /// if ownership changed between candidate selection and this write.
    pub async fn assign_lead_guarded(
        &self,
        lead_id: Uuid,
        agent_id: Uuid,
        expected_agent: Option<Uuid>,
        reason: ChangeReason,
    ) -> EngineResult<AssignmentHistory> {
        let history = self
            .store
            .apply_assignment(AssignmentRequest {
                lead_id,
                new_agent_id: Some(agent_id),
                reason,
                changed_by: None,
                expected_agent: Some(expected_agent),
                now: Utc::now(),
            })
            .await?;
        self.fanout.record_assignment(&history).await?;
        Ok(history)
    }

    /// All-or-nothing batch assignment; the per-lead effects match
    /// `assign_lead` and failing lead ids are reported in the error.
    pub async fn bulk_assign(
        &self,
        lead_ids: &[Uuid],
        agent_id: Uuid,
        changed_by: Option<Uuid>,
    ) -> EngineResult<usize> {
        if lead_ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let count = self
            .store
            .apply_bulk_assignment(lead_ids, agent_id, changed_by, now)
            .await?;
        for lead_id in lead_ids {
            if let Ok(history) = self
                .store
                .history_for_lead(*lead_id)
                .await
                .map(|rows| rows.into_iter().last())
            {
                if let Some(history) = history {
                    self.fanout.record_assignment(&history).await?;
                }
            }
        }
        info!(count, %agent_id, "bulk assignment applied");
        Ok(count)
    }

    /// Pick an agent under an automatic policy. Unavailable agents, agents at
    /// capacity, and agents past the tenant daily cap are never selected; an
    /// empty pool is `NoAgentsAvailable` and the lead stays pending.
    pub async fn auto_select(
        &self,
        company_id: Uuid,
        method: AssignmentMethod,
        settings: &TenantSettings,
        exclude: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        let mut agents = self.store.available_agents(company_id).await?;
        agents.retain(|a| {
            Some(a.agent_id) != exclude
                && a.has_capacity()
                && a.assignments_today < settings.max_assignments_per_day
        });
        if agents.is_empty() {
            return Err(EngineError::NoAgentsAvailable(company_id));
        }

        match method {
            AssignmentMethod::RoundRobin => {
                // The cursor advances exactly one position per call; the
                // modulo is over the currently-available set ordered by agent
                // id, which skips agents that dropped out since the cursor
                // was last persisted.
                let cursor = self.store.next_rotation_index(company_id).await?;
                let idx = (cursor % agents.len() as u64) as usize;
                Ok(agents[idx].agent_id)
            }
            AssignmentMethod::LoadAware => {
                let best = agents
                    .iter()
                    .min_by(|a, b| {
                        a.utilization()
                            .partial_cmp(&b.utilization())
                            .unwrap_or(Ordering::Equal)
                            // Longest-idle wins ties; `None` sorts first.
                            .then_with(|| a.last_assignment_at.cmp(&b.last_assignment_at))
                    })
                    .expect("non-empty agent pool");
                Ok(best.agent_id)
            }
            AssignmentMethod::Manual => Err(EngineError::Validation(
                "manual assignment method has no automatic selection".to_string(),
            )),
        }
    }

    /// Revert the lead's pending undoable assignment, if any. Returns `false`
    /// (not an error) when no undoable history exists: the marker was
    /// consumed by a superseding assignment, contact was already made, or the
    /// lead was never assigned.
    pub async fn undo_assignment(
        &self,
        lead_id: Uuid,
        changed_by: Option<Uuid>,
    ) -> EngineResult<bool> {
        let lead = self.store.lead(lead_id).await?;
        let Some(marker) = lead.undoable_history_id else {
            return Ok(false);
        };
        let row = self.store.history_row(marker).await?;
        if let Some(contacted) = lead.last_contacted_at {
            if contacted >= row.changed_at {
                return Ok(false);
            }
        }

        let reversal = self
            .store
            .apply_assignment(AssignmentRequest {
                lead_id,
                new_agent_id: row.old_agent_id,
                reason: ChangeReason::Manual,
                changed_by,
                expected_agent: Some(lead.assigned_agent_id),
                now: Utc::now(),
            })
            .await;
        match reversal {
            Ok(history) => {
                self.fanout.record_undo(&history).await?;
                Ok(true)
            }
            // Someone assigned concurrently; their change wins and the undo
            // opportunity is gone.
            Err(EngineError::Conflict(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Metadata-only update, independent of load counters.
    pub async fn set_priority(
        &self,
        lead_id: Uuid,
        priority: AssignmentPriority,
    ) -> EngineResult<()> {
        self.store.set_priority(lead_id, priority).await
    }
}
