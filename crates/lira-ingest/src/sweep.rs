//! Periodic auto-reassignment of neglected leads.
//!
//! Each pass runs under a per-tenant lease so a sweep never overlaps itself;
//! ordinary assignment calls may run concurrently, so every reassignment is
//! guarded by the ownership observed at candidate selection and aborted for
//! that lead if the owner changed in between.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use lira_core::{
    AssignmentMethod, AutoReassignmentRule, ChangeReason, EngineError, EngineResult, Lead,
};
use lira_routing::AssignmentRouter;
use lira_store::{LeadStore, RuleStore, SchedulerStore, Store};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{EngineConfig, TenantRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub lease_held: bool,
    pub scanned: usize,
    pub reassigned: usize,
    pub conflicts: usize,
    pub unassignable: usize,
}

pub struct ReassignmentSweep {
    store: Arc<dyn Store>,
    router: Arc<AssignmentRouter>,
    tenants: TenantRegistry,
    holder: String,
    lease_ttl: Duration,
}

impl ReassignmentSweep {
    pub fn new(
        store: Arc<dyn Store>,
        router: Arc<AssignmentRouter>,
        tenants: TenantRegistry,
        lease_minutes: i64,
    ) -> Self {
        Self {
            store,
            router,
            tenants,
            holder: format!("sweep-{}", Uuid::new_v4()),
            lease_ttl: Duration::minutes(lease_minutes.max(1)),
        }
    }

    /// One pass for one tenant. Returns with `lease_held = false` when
    /// another sweep currently owns the tenant.
    pub async fn run_company_sweep(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<SweepReport> {
        if !self
            .store
            .try_acquire_sweep_lease(company_id, &self.holder, self.lease_ttl, now)
            .await?
        {
            info!(%company_id, "sweep skipped, lease busy");
            return Ok(SweepReport::default());
        }

        let result = self.sweep_leased(company_id, now).await;
        self.store
            .release_sweep_lease(company_id, &self.holder)
            .await?;
        result
    }

    pub async fn run_all(&self, now: DateTime<Utc>) -> EngineResult<Vec<(Uuid, SweepReport)>> {
        let mut reports = Vec::new();
        for company_id in self.tenants.company_ids() {
            let report = self.run_company_sweep(company_id, now).await?;
            reports.push((company_id, report));
        }
        Ok(reports)
    }

    async fn sweep_leased(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<SweepReport> {
        let mut report = SweepReport {
            lease_held: true,
            ..SweepReport::default()
        };
        let settings = self.tenants.settings_for(company_id);
        let rules: Vec<AutoReassignmentRule> = self
            .store
            .rules_for_company(company_id)
            .await?
            .into_iter()
            .filter(|r| r.is_active)
            .collect();
        if rules.is_empty() {
            return Ok(report);
        }

        let leads = self.store.leads_for_company(company_id).await?;
        // Idempotence within the pass: a lead reassigned under one rule must
        // not be reassigned again by a later rule in the same pass.
        let mut touched: HashSet<Uuid> = HashSet::new();

        for rule in &rules {
            for lead in &leads {
                if touched.contains(&lead.id) {
                    continue;
                }
                let Some(current_agent) = lead.assigned_agent_id else {
                    continue;
                };
                if !is_candidate(lead, rule, now) {
                    continue;
                }
                report.scanned += 1;

                let method = if rule.use_round_robin {
                    AssignmentMethod::RoundRobin
                } else {
                    AssignmentMethod::LoadAware
                };
                // The current owner is excluded to force actual
                // redistribution.
                let picked = self
                    .router
                    .auto_select(company_id, method, &settings, Some(current_agent))
                    .await;
                let agent_id = match picked {
                    Ok(agent_id) => agent_id,
                    Err(EngineError::NoAgentsAvailable(_)) => {
                        report.unassignable += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                match self
                    .router
                    .assign_lead_guarded(
                        lead.id,
                        agent_id,
                        Some(current_agent),
                        ChangeReason::AutoReassign,
                    )
                    .await
                {
                    Ok(_) => {
                        touched.insert(lead.id);
                        report.reassigned += 1;
                    }
                    Err(EngineError::Conflict(_)) => {
                        // Ownership changed between candidate selection and
                        // the write; that lead's reassignment is abandoned.
                        report.conflicts += 1;
                    }
                    Err(err) => {
                        warn!(lead_id = %lead.id, error = %err, "sweep reassignment failed");
                    }
                }
            }
        }

        info!(
            %company_id,
            scanned = report.scanned,
            reassigned = report.reassigned,
            conflicts = report.conflicts,
            "reassignment sweep complete"
        );
        Ok(report)
    }
}

/// A lead qualifies when its stage is covered by the rule and its neglect
/// timer passed the threshold. The timer baseline is the latest of
/// last-contact (falling back to receipt) and the current assignment, so a
/// just-reassigned lead cannot requalify until its baseline resets.
fn is_candidate(lead: &Lead, rule: &AutoReassignmentRule, now: DateTime<Utc>) -> bool {
    if !rule.apply_to_stages.iter().any(|s| s == &lead.stage) {
        return false;
    }
    let mut baseline = lead.last_contacted_at.unwrap_or(lead.received_at);
    if let Some(assigned_at) = lead.assigned_at {
        baseline = baseline.max(assigned_at);
    }
    now - baseline >= Duration::days(rule.days_without_contact)
}

/// Optional cron wiring, mirroring the env-gated scheduler construction used
/// at process startup.
pub async fn maybe_build_scheduler(
    config: &EngineConfig,
    sweep: Arc<ReassignmentSweep>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sweep_cron_1, &config.sweep_cron_2] {
        let sweep = sweep.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let sweep = sweep.clone();
            Box::pin(async move {
                if let Err(err) = sweep.run_all(Utc::now()).await {
                    warn!(error = %err, "scheduled reassignment sweep failed");
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {cron}"))?;
        sched.add(job).await.context("adding sweep job")?;
    }
    Ok(Some(sched))
}
