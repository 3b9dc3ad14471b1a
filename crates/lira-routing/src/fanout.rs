//! Durable assignment notifications + live event broadcast + SLA escalation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lira_core::{
    AssignmentHistory, AssignmentNotification, EngineResult, Lead, NotificationType,
    TenantSettings,
};
use lira_store::{AssignmentStore, NotificationStore, Store};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Change event published to live subscribers alongside the durable record.
#[derive(Debug, Clone)]
pub enum LeadEvent {
    Assigned {
        lead_id: Uuid,
        agent_id: Option<Uuid>,
        reassigned: bool,
    },
    Undone {
        lead_id: Uuid,
        agent_id: Option<Uuid>,
    },
    Pending {
        lead_id: Uuid,
    },
    SlaRaised {
        lead_id: Uuid,
        level: i16,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaCheckReport {
    pub checked: usize,
    pub warnings: usize,
    pub escalations: usize,
}

pub struct NotificationFanout {
    store: Arc<dyn Store>,
    events: broadcast::Sender<LeadEvent>,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: LeadEvent) {
        // No live subscribers is fine; the durable record already exists.
        let _ = self.events.send(event);
    }

    async fn record(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
        agent_id: Option<Uuid>,
        notification_type: NotificationType,
        title: String,
        message: String,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.store
            .insert_notification(AssignmentNotification {
                id: Uuid::new_v4(),
                company_id,
                lead_id,
                agent_id,
                notification_type,
                title,
                message,
                is_read: false,
                created_at: at,
            })
            .await
    }

    /// One durable notification per ownership-affecting event, addressed to
    /// the new owner.
    pub async fn record_assignment(&self, history: &AssignmentHistory) -> EngineResult<()> {
        let reassigned = history.old_agent_id.is_some();
        let kind = if reassigned {
            NotificationType::LeadReassigned
        } else {
            NotificationType::LeadAssigned
        };
        let title = if reassigned {
            "Lead reassigned to you".to_string()
        } else {
            "New lead assigned to you".to_string()
        };
        self.record(
            history.company_id,
            history.lead_id,
            history.new_agent_id,
            kind,
            title,
            format!("Lead {} via {}", history.lead_id, history.change_reason.as_str()),
            history.changed_at,
        )
        .await?;
        self.publish(LeadEvent::Assigned {
            lead_id: history.lead_id,
            agent_id: history.new_agent_id,
            reassigned,
        });
        Ok(())
    }

    pub async fn record_undo(&self, reversal: &AssignmentHistory) -> EngineResult<()> {
        self.record(
            reversal.company_id,
            reversal.lead_id,
            reversal.new_agent_id,
            NotificationType::AssignmentUndone,
            "Assignment undone".to_string(),
            format!(
                "Lead {} returned to its previous owner",
                reversal.lead_id
            ),
            reversal.changed_at,
        )
        .await?;
        self.publish(LeadEvent::Undone {
            lead_id: reversal.lead_id,
            agent_id: reversal.new_agent_id,
        });
        Ok(())
    }

    /// An unassignable lead stays visibly pending; the tenant gets an
    /// actionable notification instead of a silent drop.
    pub async fn record_pending(&self, company_id: Uuid, lead_id: Uuid) -> EngineResult<()> {
        self.record(
            company_id,
            lead_id,
            None,
            NotificationType::AssignmentPending,
            "Lead pending assignment".to_string(),
            format!("No agents were available for lead {lead_id}; it remains unassigned"),
            Utc::now(),
        )
        .await?;
        self.publish(LeadEvent::Pending { lead_id });
        Ok(())
    }

    /// SLA pass for one tenant. Thresholds are measured from `assigned_at`:
    /// warning at `sla_notify_minutes`, team lead at `team_lead_after_minutes`,
    /// manager at `manager_after_minutes`. The per-lead escalation counter is
    /// the only source of truth for "already fired", so replays and
    /// overlapping passes emit each level at most once per assignment
    /// lifecycle.
    pub async fn run_sla_checks(
        &self,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<SlaCheckReport> {
        let mut report = SlaCheckReport::default();
        if !settings.sla.sla_enabled {
            return Ok(report);
        }

        let candidates = self.store.sla_candidates(settings.company_id).await?;
        for lead in candidates {
            report.checked += 1;
            let target = target_level(&lead, settings, now);
            for level in (lead.escalation_level + 1)..=target {
                if !self.store.set_escalation_level(lead.id, level).await? {
                    continue;
                }
                let (kind, title, message) = describe_level(&lead, level);
                self.record(
                    lead.company_id,
                    lead.id,
                    if level == 1 { lead.assigned_agent_id } else { None },
                    kind,
                    title,
                    message,
                    now,
                )
                .await?;
                self.publish(LeadEvent::SlaRaised {
                    lead_id: lead.id,
                    level,
                });
                if level == 1 {
                    report.warnings += 1;
                } else {
                    report.escalations += 1;
                }
                info!(lead_id = %lead.id, level, "sla level raised");
            }
        }
        Ok(report)
    }

    pub async fn mark_read(&self, notification_id: Uuid) -> EngineResult<()> {
        self.store.mark_read(notification_id).await
    }

    pub async fn mark_all_read(&self, company_id: Uuid) -> EngineResult<u64> {
        self.store.mark_all_read(company_id).await
    }
}

fn target_level(lead: &Lead, settings: &TenantSettings, now: DateTime<Utc>) -> i16 {
    let Some(assigned_at) = lead.assigned_at else {
        return 0;
    };
    let elapsed = (now - assigned_at).num_minutes();
    let sla = &settings.sla;
    if sla.escalation_enabled && elapsed >= sla.manager_after_minutes {
        3
    } else if sla.escalation_enabled && elapsed >= sla.team_lead_after_minutes {
        2
    } else if elapsed >= sla.sla_notify_minutes {
        1
    } else {
        0
    }
}

fn describe_level(lead: &Lead, level: i16) -> (NotificationType, String, String) {
    match level {
        1 => (
            NotificationType::SlaWarning,
            "Lead response overdue".to_string(),
            format!("Lead {} has not been contacted within the SLA window", lead.id),
        ),
        2 => (
            NotificationType::SlaEscalation,
            "Lead escalated to team lead".to_string(),
            format!("Lead {} is still uncontacted; the team lead was notified", lead.id),
        ),
        _ => (
            NotificationType::SlaEscalation,
            "Lead escalated to manager".to_string(),
            format!("Lead {} is still uncontacted; the manager was notified", lead.id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lira_core::{AgentLoad, CanonicalLeadInput, ChangeReason};
    use lira_store::{
        AgentStore, AssignmentRequest, LeadStore, MemoryStore, UpsertOutcome,
    };

    async fn assigned_lead(
        store: &Arc<MemoryStore>,
        company: Uuid,
        assigned_at: DateTime<Utc>,
    ) -> Uuid {
        let agent = AgentLoad {
            agent_id: Uuid::new_v4(),
            company_id: company,
            agent_name: "A".to_string(),
            current_leads_count: 0,
            pending_followups_count: 0,
            assignments_today: 0,
            assignments_week: 0,
            conversion_rate: 0.0,
            max_leads_capacity: 10,
            is_available: true,
            last_assignment_at: None,
        };
        store.register_agent(agent.clone()).await.unwrap();

        let mut input = CanonicalLeadInput::empty(company, "ad-form");
        input.external_id = Some(Uuid::new_v4().to_string());
        input.phone = "971501234567".to_string();
        let lead = match store
            .upsert_lead(&input, &TenantSettings::for_company(company), assigned_at)
            .await
            .unwrap()
        {
            UpsertOutcome::Created(lead) => lead,
            _ => panic!(),
        };
        store
            .apply_assignment(AssignmentRequest {
                lead_id: lead.id,
                new_agent_id: Some(agent.agent_id),
                reason: ChangeReason::RoundRobin,
                changed_by: None,
                expected_agent: None,
                now: assigned_at,
            })
            .await
            .unwrap();
        lead.id
    }

    fn sla_settings(company: Uuid) -> TenantSettings {
        let mut settings = TenantSettings::for_company(company);
        settings.sla.sla_enabled = true;
        settings.sla.sla_notify_minutes = 30;
        settings.sla.escalation_enabled = true;
        settings.sla.team_lead_after_minutes = 60;
        settings.sla.manager_after_minutes = 120;
        settings
    }

    #[tokio::test]
    async fn warning_fires_exactly_once_per_assignment() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let settings = sla_settings(company);
        let fanout = NotificationFanout::new(store.clone());

        let assigned_at = Utc::now() - Duration::minutes(45);
        let lead_id = assigned_lead(&store, company, assigned_at).await;

        let first = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(first.warnings, 1);
        assert_eq!(first.escalations, 0);

        // Replaying the pass must not duplicate the warning.
        let second = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(second.warnings, 0);
        assert_eq!(second.escalations, 0);

        let notifications = store.notifications_for_company(company).await.unwrap();
        let warnings = notifications
            .iter()
            .filter(|n| n.notification_type == NotificationType::SlaWarning)
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(store.lead(lead_id).await.unwrap().escalation_level, 1);
    }

    #[tokio::test]
    async fn escalation_climbs_to_team_lead_then_manager_once_each() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let settings = sla_settings(company);
        let fanout = NotificationFanout::new(store.clone());

        let assigned_at = Utc::now() - Duration::minutes(200);
        let lead_id = assigned_lead(&store, company, assigned_at).await;

        let report = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(report.warnings, 1);
        assert_eq!(report.escalations, 2);
        assert_eq!(store.lead(lead_id).await.unwrap().escalation_level, 3);

        let replay = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(replay.warnings + replay.escalations, 0);
    }

    #[tokio::test]
    async fn disabled_sla_emits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let settings = TenantSettings::for_company(company);
        let fanout = NotificationFanout::new(store.clone());

        assigned_lead(&store, company, Utc::now() - Duration::minutes(500)).await;
        let report = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(report, SlaCheckReport::default());
        assert!(store.notifications_for_company(company).await.unwrap().len() <= 1);
    }

    #[tokio::test]
    async fn contacted_leads_leave_the_sla_pool() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let settings = sla_settings(company);
        let fanout = NotificationFanout::new(store.clone());

        let lead_id = assigned_lead(&store, company, Utc::now() - Duration::minutes(90)).await;
        store.record_contact(lead_id, Utc::now()).await.unwrap();

        let report = fanout.run_sla_checks(&settings, Utc::now()).await.unwrap();
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn live_subscribers_observe_assignment_events() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let fanout = NotificationFanout::new(store.clone());
        let mut rx = fanout.subscribe();

        let lead_id = assigned_lead(&store, company, Utc::now()).await;
        let history = store.history_for_lead(lead_id).await.unwrap();
        fanout.record_assignment(&history[0]).await.unwrap();

        match rx.recv().await.unwrap() {
            LeadEvent::Assigned {
                lead_id: seen,
                reassigned,
                ..
            } => {
                assert_eq!(seen, lead_id);
                assert!(!reassigned);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
