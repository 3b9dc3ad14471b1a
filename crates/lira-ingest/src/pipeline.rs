//! Ingestion pipeline + portal quarantine path.

use std::sync::Arc;

use chrono::Utc;
use lira_adapters::{normalizer_for_source, payload_items};
use lira_core::{
    EngineError, EngineResult, ImportErrorType, IngestionLog, Lead, PhoneCheck,
    PortalImportError, TenantSettings,
};
use lira_routing::AssignmentRouter;
use lira_store::{LeadStore, QuarantineStore, Store, UpsertOutcome};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::resolve::{resolve, DedupDecision};
use crate::TenantRegistry;

/// Aggregated counts returned to the provider. Per-lead failures are counted
/// here, never surfaced as a failed response, so providers are not encouraged
/// to retry an already-processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub success: bool,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Error)]
pub(crate) enum LeadFailure {
    #[error("missing phone number")]
    MissingPhone,
    #[error("phone number failed the 10-15 digit check")]
    InvalidPhone,
    #[error("duplicate of lead {0}")]
    Duplicate(Uuid),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl LeadFailure {
    fn import_error_type(&self) -> ImportErrorType {
        match self {
            Self::MissingPhone => ImportErrorType::MissingPhone,
            Self::InvalidPhone => ImportErrorType::InvalidPhone,
            Self::Duplicate(_) => ImportErrorType::Duplicate,
            Self::Engine(_) => ImportErrorType::ProcessingError,
        }
    }
}

enum LeadOutcome {
    Created(Lead),
    Updated(Uuid),
    Skipped(Uuid),
}

/// Normalize → resolve → upsert → route, one payload at a time.
pub struct IngestPipeline {
    store: Arc<dyn Store>,
    router: Arc<AssignmentRouter>,
    tenants: TenantRegistry,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        router: Arc<AssignmentRouter>,
        tenants: TenantRegistry,
    ) -> Self {
        Self {
            store,
            router,
            tenants,
        }
    }

    pub fn router(&self) -> &Arc<AssignmentRouter> {
        &self.router
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    /// Ingest one provider delivery (object or array shaped). Sibling leads
    /// never abort each other; an ingestion-log row is always written.
    pub async fn ingest(
        &self,
        company_id: Uuid,
        source: &str,
        payload: &JsonValue,
    ) -> EngineResult<IngestReport> {
        let normalizer = normalizer_for_source(source)
            .ok_or_else(|| EngineError::Validation(format!("unknown source {source}")))?;
        let settings = self.tenants.settings_for(company_id);
        let inputs = normalizer.normalize(company_id, payload);

        let mut report = IngestReport::default();
        for input in &inputs {
            report.processed += 1;
            match self.process_lead(input, &settings).await {
                Ok(LeadOutcome::Created(_)) => report.created += 1,
                Ok(LeadOutcome::Updated(_)) => report.updated += 1,
                Ok(LeadOutcome::Skipped(_)) => report.skipped += 1,
                Err(LeadFailure::Duplicate(_)) => report.skipped += 1,
                Err(failure) => {
                    report.errors += 1;
                    warn!(source, error = %failure, "lead rejected during ingestion");
                }
            }
        }
        report.success = true;

        self.write_ingestion_log(company_id, source, payload, &report)
            .await?;
        info!(
            source,
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            "ingestion batch complete"
        );
        Ok(report)
    }

    /// Portal variant: identical normalize/resolve/upsert sequence, but any
    /// per-lead failure is persisted as a retryable quarantine record instead
    /// of being dropped.
    pub async fn ingest_portal(
        &self,
        company_id: Uuid,
        portal: &str,
        payload: &JsonValue,
    ) -> EngineResult<IngestReport> {
        let source = format!("portal-{portal}");
        let settings = self.tenants.settings_for(company_id);

        let mut report = IngestReport::default();
        for item in payload_items(payload) {
            report.processed += 1;
            match self.process_portal_item(company_id, portal, &source, item, &settings).await {
                Ok(LeadOutcome::Created(_)) => report.created += 1,
                Ok(LeadOutcome::Updated(_)) => report.updated += 1,
                Ok(LeadOutcome::Skipped(_)) => report.skipped += 1,
                Err(failure) => {
                    report.errors += 1;
                    self.quarantine(company_id, portal, item.clone(), &failure)
                        .await?;
                }
            }
        }
        report.success = true;

        self.write_ingestion_log(company_id, &source, payload, &report)
            .await?;
        Ok(report)
    }

    /// Re-run the identical pipeline against a quarantined payload (or a
    /// corrected replacement). Success marks the record resolved and proceeds
    /// exactly as a fresh ingestion, same dedup guarantees included.
    pub async fn retry_import(
        &self,
        error_id: Uuid,
        corrected_payload: Option<JsonValue>,
        resolved_by: Option<Uuid>,
    ) -> EngineResult<IngestReport> {
        let record = self.store.import_error(error_id).await?;
        let payload = corrected_payload.unwrap_or_else(|| record.lead_data.clone());
        let source = format!("portal-{}", record.portal_name);
        let settings = self.tenants.settings_for(record.company_id);

        let mut report = IngestReport::default();
        for item in payload_items(&payload) {
            report.processed += 1;
            match self
                .process_portal_item(
                    record.company_id,
                    &record.portal_name,
                    &source,
                    item,
                    &settings,
                )
                .await
            {
                Ok(LeadOutcome::Created(_)) => report.created += 1,
                Ok(LeadOutcome::Updated(_)) => report.updated += 1,
                Ok(LeadOutcome::Skipped(_)) => report.skipped += 1,
                Err(failure) => {
                    report.errors += 1;
                    warn!(error_id = %error_id, error = %failure, "import retry failed");
                }
            }
        }
        report.success = report.errors == 0;

        if report.success && report.processed > 0 {
            self.store
                .resolve_import_error(error_id, resolved_by, Utc::now())
                .await?;
        }
        Ok(report)
    }

    async fn process_portal_item(
        &self,
        company_id: Uuid,
        portal: &str,
        source: &str,
        item: &JsonValue,
        settings: &TenantSettings,
    ) -> Result<LeadOutcome, LeadFailure> {
        let normalizer = normalizer_for_source(source).ok_or_else(|| {
            LeadFailure::Engine(EngineError::Validation(format!("unknown portal {portal}")))
        })?;
        let inputs = normalizer.normalize(company_id, item);
        let input = inputs.into_iter().next().ok_or_else(|| {
            LeadFailure::Engine(EngineError::Validation(
                "payload carried no parseable lead".to_string(),
            ))
        })?;
        self.process_lead(&input, settings).await
    }

    async fn process_lead(
        &self,
        input: &lira_core::CanonicalLeadInput,
        settings: &TenantSettings,
    ) -> Result<LeadOutcome, LeadFailure> {
        let now = Utc::now();
        let decision = resolve(self.store.as_ref(), input, settings, now).await?;
        match decision {
            DedupDecision::RejectInvalid(PhoneCheck::Missing) => Err(LeadFailure::MissingPhone),
            DedupDecision::RejectInvalid(_) => Err(LeadFailure::InvalidPhone),
            DedupDecision::SkipDuplicate(id) => Err(LeadFailure::Duplicate(id)),
            DedupDecision::Create | DedupDecision::Update(_) => {
                // The resolver is advisory; the upsert re-decides atomically.
                let outcome = self.store.upsert_lead(input, settings, now).await?;
                match outcome {
                    UpsertOutcome::Created(lead) => {
                        self.route_new_lead(&lead, settings).await?;
                        Ok(LeadOutcome::Created(lead))
                    }
                    UpsertOutcome::Updated(id) => Ok(LeadOutcome::Updated(id)),
                    UpsertOutcome::Skipped(id) => Ok(LeadOutcome::Skipped(id)),
                }
            }
        }
    }

    async fn route_new_lead(
        &self,
        lead: &Lead,
        settings: &TenantSettings,
    ) -> Result<(), LeadFailure> {
        let method = match settings.default_assignment {
            lira_core::AssignmentMethod::Manual => return Ok(()),
            method => method,
        };

        if settings.after_hours == lira_core::AfterHoursAction::Queue
            && !settings.within_working_hours(Utc::now())
        {
            self.router
                .fanout()
                .record_pending(lead.company_id, lead.id)
                .await
                .map_err(LeadFailure::Engine)?;
            return Ok(());
        }

        match self
            .router
            .auto_select(lead.company_id, method, settings, None)
            .await
        {
            Ok(agent_id) => {
                let reason = match method {
                    lira_core::AssignmentMethod::LoadAware => {
                        lira_core::ChangeReason::LoadBalanced
                    }
                    _ => lira_core::ChangeReason::RoundRobin,
                };
                self.router
                    .assign_lead(lead.id, agent_id, reason, None)
                    .await
                    .map_err(LeadFailure::Engine)?;
                Ok(())
            }
            Err(EngineError::NoAgentsAvailable(_)) => {
                // The lead stays visibly pending rather than disappearing.
                self.router
                    .fanout()
                    .record_pending(lead.company_id, lead.id)
                    .await
                    .map_err(LeadFailure::Engine)?;
                Ok(())
            }
            Err(err) => Err(LeadFailure::Engine(err)),
        }
    }

    async fn quarantine(
        &self,
        company_id: Uuid,
        portal: &str,
        lead_data: JsonValue,
        failure: &LeadFailure,
    ) -> EngineResult<()> {
        warn!(portal, error = %failure, "portal lead quarantined");
        self.store
            .insert_import_error(PortalImportError {
                id: Uuid::new_v4(),
                company_id,
                portal_name: portal.to_string(),
                lead_data,
                error_message: failure.to_string(),
                error_type: failure.import_error_type(),
                resolved: false,
                resolved_at: None,
                resolved_by: None,
                created_at: Utc::now(),
            })
            .await
    }

    async fn write_ingestion_log(
        &self,
        company_id: Uuid,
        source: &str,
        payload: &JsonValue,
        report: &IngestReport,
    ) -> EngineResult<()> {
        self.store
            .append_ingestion_log(IngestionLog {
                id: Uuid::new_v4(),
                company_id,
                source: source.to_string(),
                processed: report.processed as i64,
                created: report.created as i64,
                updated: report.updated as i64,
                skipped: report.skipped as i64,
                errors: report.errors as i64,
                payload_sha256: payload_fingerprint(payload),
                created_at: Utc::now(),
            })
            .await
    }
}

fn payload_fingerprint(payload: &JsonValue) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
